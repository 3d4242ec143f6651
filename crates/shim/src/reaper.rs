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

//! Exit collection.
//!
//! Every started process gets a waiter thread: it lets the I/O relay
//! drain, asks the sandbox for the exit code, updates the registry and
//! feeds the per-process exit latch, then hands an exit record to the
//! bounded exits channel. A single consumer turns the records into
//! `TaskExit` events under the send-order lock.

use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::{DateTime, Utc};
use containerd_shim::protos::events::task::TaskExit;
use containerd_shim::protos::protobuf::SingularPtrField;
use log::warn;

use containerd_vm_sandbox::Sandbox;

use crate::events::EventQueue;
use crate::service::ShimState;
use crate::utils;

pub const EXITS_DEPTH: usize = 32;

/// Exit code recorded when waiting on the sandbox itself fails.
pub const WAIT_ERROR_EXIT_CODE: i32 = 255;

pub struct ProcessExit {
    pub container_id: String,
    /// Empty for a container's init process.
    pub exec_id: String,
    pub pid: u32,
    pub exit_code: i32,
    pub exited_at: DateTime<Utc>,
}

/// Consumes exit records and emits `TaskExit`, serialized against
/// start-type emissions so no consumer sees an exit before its start.
pub fn spawn_exit_forwarder(
    rx: Receiver<ProcessExit>,
    events: EventQueue,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for exit in rx {
            let _order = events.order_lock();
            let mut ev = TaskExit::new();
            ev.set_container_id(exit.container_id.clone());
            ev.set_id(if exit.exec_id.is_empty() {
                exit.container_id
            } else {
                exit.exec_id
            });
            ev.set_pid(exit.pid);
            ev.set_exit_status(exit.exit_code as u32);
            ev.exited_at = SingularPtrField::some(utils::timestamp(exit.exited_at));
            events.send(Box::new(ev));
        }
    })
}

/// Waiter for one started process.
pub fn spawn_waiter(
    state: Arc<Mutex<ShimState>>,
    sandbox: Arc<dyn Sandbox>,
    exits: SyncSender<ProcessExit>,
    container_id: String,
    exec_id: String,
    io_exit: crate::io::SignalChannel,
    is_sandbox_container: bool,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        // all output has been copied out before the exit is surfaced
        io_exit.wait();

        let exit_code = match sandbox.wait_process(&container_id, &exec_id) {
            Ok(code) => code,
            Err(e) => {
                warn!("wait for {}/{}: {}", container_id, exec_id, e);
                WAIT_ERROR_EXIT_CODE
            }
        };
        let exited_at = Utc::now();

        {
            let mut state = state.lock().unwrap();
            if exec_id.is_empty() {
                if is_sandbox_container {
                    // the sandbox dies with its own container; stop the
                    // watcher first so the teardown is not mistaken for a
                    // failure
                    state.cancel_watcher();
                    if let Err(e) = sandbox.stop() {
                        warn!("stop sandbox {}: {}", sandbox.id(), e);
                    }
                    if let Err(e) = sandbox.shutdown() {
                        warn!("shutdown sandbox {}: {}", sandbox.id(), e);
                    }
                } else if let Err(e) = sandbox.stop_container(&container_id) {
                    warn!("stop container {}: {}", container_id, e);
                }
                if let Some(c) = state.containers.get_mut(&container_id) {
                    c.set_stopped(exit_code, exited_at);
                }
            } else if let Some(c) = state.containers.get_mut(&container_id) {
                if let Ok(exec) = c.exec_mut(&exec_id) {
                    exec.set_stopped(exit_code, exited_at);
                }
            }
        }

        let record = ProcessExit {
            container_id,
            exec_id,
            pid: sandbox.hypervisor_pid(),
            exit_code,
            exited_at,
        };
        if exits.send(record).is_err() {
            warn!("exit pipeline is gone, dropping exit record");
        }
    })
}
