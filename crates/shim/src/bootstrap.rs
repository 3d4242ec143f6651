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

//! Child-side bring-up of a spawned shim: namespace discipline, the ttrpc
//! server, and the teardown ordering at the end of the sandbox life.

use std::env;
use std::fs;
use std::sync::Arc;

use containerd_shim::protos::shim::shim_ttrpc::create_task;
use containerd_shim::protos::ttrpc::Server;
use containerd_shim::{ExitSignal, Task};
use log::{debug, info, warn};
use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::signal::{kill, signal, SigHandler, Signal};
use nix::unistd::Pid;

use containerd_vm_sandbox::SandboxFactory;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::EventQueue;
use crate::flags::Flags;
use crate::logger::ShimLogger;
use crate::service::Service;
use crate::utils;

pub const SCHED_CORE_ENV: &str = "SCHED_CORE";

const PR_SCHED_CORE: libc::c_int = 62;
const PR_SCHED_CORE_CREATE: libc::c_ulong = 1;
const PR_SCHED_CORE_SCOPE_PROCESS_GROUP: libc::c_ulong = 2;

/// Runs the task service until the last container is gone and `Shutdown`
/// releases the process.
pub fn serve(runtime_id: &str, flags: Flags, factory: Arc<dyn SandboxFactory>) -> Result<()> {
    let mut config = Config::load()?;
    if flags.debug {
        config.debug = true;
    }
    if ShimLogger::init(config.debug).is_err() {
        eprintln!("shim logger already initialized");
    }

    ignore_sigpipe();
    setup_mount_namespace()?;
    if env::var_os(SCHED_CORE_ENV).is_some() {
        enable_core_scheduling();
    }

    let address = utils::socket_address(&flags.address, &flags.namespace, &flags.id);
    fs::create_dir_all(utils::SOCKET_ROOT)?;
    let socket = utils::socket_path(&address).to_string();
    let _ = fs::remove_file(&socket);

    let exit = Arc::new(ExitSignal::default());
    let events = EventQueue::new(&flags.namespace);
    let service = Service::new(
        runtime_id,
        &flags.namespace,
        config,
        factory,
        events.clone(),
        exit.clone(),
    );
    let state = service.shared_state();

    let task = create_task(Arc::new(Box::new(service) as Box<dyn Task + Send + Sync>));
    let mut server = Server::new()
        .bind(&address)
        .map_err(|e| Error::Other(format!("bind {}: {}", address, e)))?
        .register_service(task);
    server
        .start()
        .map_err(|e| Error::Other(format!("serve task api: {}", e)))?;
    info!("task service listening on {}", address);

    exit.wait();
    info!("last container gone, shutting down");

    // the hypervisor must never outlive its shim
    let hypervisor_pid = {
        let state = state.lock().unwrap();
        state.sandbox.as_ref().map(|sb| sb.hypervisor_pid)
    };
    if let Some(pid) = hypervisor_pid.filter(|pid| *pid > 0) {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!("kill hypervisor {}: {}", pid, e);
        }
    }

    events.close();
    let _ = fs::remove_file(&socket);
    Ok(())
}

/// The shim gets a mount namespace of its own: rootfs mounts stay out of
/// the host view while still propagating into the VM's sharing mechanism.
fn setup_mount_namespace() -> Result<()> {
    unshare(CloneFlags::CLONE_NEWNS)
        .map_err(|e| Error::Other(format!("unshare mount namespace: {}", e)))?;
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_SLAVE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| Error::Other(format!("remount / as rslave: {}", e)))?;
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_SHARED | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| Error::Other(format!("remount / as rshared: {}", e)))?;
    Ok(())
}

/// Writes to a FIFO whose reader went away must surface as errors, not
/// kill the process.
fn ignore_sigpipe() {
    unsafe {
        let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }
}

fn enable_core_scheduling() {
    let rc = unsafe {
        libc::prctl(
            PR_SCHED_CORE,
            PR_SCHED_CORE_CREATE,
            0 as libc::c_ulong,
            PR_SCHED_CORE_SCOPE_PROCESS_GROUP,
            0 as libc::c_ulong,
        )
    };
    if rc != 0 {
        warn!(
            "core scheduling unavailable: {}",
            std::io::Error::last_os_error()
        );
    }
}
