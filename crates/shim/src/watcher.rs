/*
   Copyright The containerd Authors.

   Licensed under the Apache License, Version 2.0 (the "License");
   you may not use this file except in compliance with the License.
   You may obtain a copy of the License at

       http://www.apache.org/licenses/LICENSE-2.0

   Unless required by applicable law or agreed to in writing, software
   distributed under the License is distributed on an "AS IS" BASIS,
   WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
   See the License for the specific language governing permissions and
   limitations under the License.
*/

//! Background observers of the sandbox: the liveness watcher and the OOM
//! relay.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use containerd_shim::protos::events::task::TaskOOM;
use log::{error, warn};

use containerd_vm_sandbox as sandbox;
use sandbox::Sandbox;

use crate::container::is_crio_managed;
use crate::events::EventQueue;
use crate::service::ShimState;
use crate::utils;

const MONITOR_TICK: Duration = Duration::from_millis(500);
const OOM_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Watches the sandbox liveness channel.
///
/// A `None` delivery is the graceful stop sent during sandbox-driven
/// teardown. Anything else is an unexpected sandbox failure: with the
/// registry locked, the sandbox is stopped and deleted best-effort and
/// every rootfs the shim owns is unmounted. Per-process waiters then
/// observe their own exits and finish normally.
pub fn spawn_sandbox_watcher(
    state: Arc<Mutex<ShimState>>,
    sb: Arc<dyn Sandbox>,
    monitor: Receiver<Option<String>>,
    cancel: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || loop {
        if cancel.load(Ordering::Relaxed) {
            return;
        }
        match monitor.recv_timeout(MONITOR_TICK) {
            Ok(None) => return,
            Ok(Some(reason)) => {
                error!("sandbox {} failed: {}", sb.id(), reason);
                let mut state = state.lock().unwrap();
                if let Err(e) = sb.stop() {
                    warn!("stop failed sandbox {}: {}", sb.id(), e);
                }
                if let Err(e) = sb.shutdown() {
                    warn!("shutdown failed sandbox {}: {}", sb.id(), e);
                }
                for c in state.containers.values_mut() {
                    if c.rootfs_mounted {
                        c.rootfs_mounted = false;
                        utils::unmount(&Path::new(&c.bundle).join("rootfs"));
                    }
                }
                return;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        }
    })
}

/// Polls the sandbox for OOM-killed containers and republishes them as
/// `TaskOOM` events.
pub fn spawn_oom_monitor(
    state: Arc<Mutex<ShimState>>,
    sb: Arc<dyn Sandbox>,
    events: EventQueue,
    cancel: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || loop {
        if cancel.load(Ordering::Relaxed) {
            return;
        }
        match sb.wait_oom_event() {
            Ok(container_id) => {
                {
                    let state = state.lock().unwrap();
                    if let Some(c) = state.containers.get(&container_id) {
                        // CRI-O discovers guest OOMs through an on-disk
                        // marker in the bundle
                        if is_crio_managed(&c.spec) {
                            let marker = Path::new(&c.bundle).join("oom");
                            if let Err(e) = std::fs::File::create(&marker) {
                                warn!("write oom marker {}: {}", marker.display(), e);
                            }
                        }
                    }
                }
                let mut ev = TaskOOM::new();
                ev.set_container_id(container_id);
                events.send(Box::new(ev));
            }
            Err(sandbox::Error::AgentClosed) => return,
            Err(e) => {
                warn!("poll oom events: {}", e);
                thread::sleep(OOM_RETRY_BACKOFF);
            }
        }
    })
}
