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

//! Capability interface between the pod shim runtime and a VM sandbox
//! backend.
//!
//! The shim never talks to a hypervisor or a guest agent directly. It
//! drives one pod VM through the [`Sandbox`] trait and obtains the handle
//! from a [`SandboxFactory`] injected at boot. Backends are expected to be
//! internally synchronized and to answer quickly; long waits are confined
//! to the explicitly blocking calls ([`Sandbox::wait_process`] and
//! [`Sandbox::wait_oom_event`]).

use std::sync::mpsc::Receiver;
use std::sync::Arc;

use oci_spec::runtime::{LinuxResources, Process, Spec};

mod error;
mod types;

pub use error::{Error, Result};
pub use types::{BuildRequest, ContainerStats, GuestStatus, ProcessStreams, Rootfs};

/// Boots one pod VM and hands back the live capability handle.
///
/// Invoked exactly once per shim, from the create path of the task
/// service, when the request designates a pod sandbox or a standalone
/// container. The sandbox comes up with that first container already
/// registered in the guest; [`Sandbox::create_container`] only adds the
/// further containers of the pod.
pub trait SandboxFactory: Send + Sync {
    fn build(&self, req: &BuildRequest) -> Result<Arc<dyn Sandbox>>;
}

/// One running pod VM.
///
/// Container and exec identifiers follow the task API convention: an
/// empty `exec_id` addresses the container's init process.
pub trait Sandbox: Send + Sync {
    fn id(&self) -> &str;

    /// Host pid of the VM monitor process. Stands in for in-guest pids
    /// everywhere the task API wants a process id.
    fn hypervisor_pid(&self) -> u32;

    fn create_container(&self, id: &str, spec: &Spec, rootfs: &[Rootfs]) -> Result<()>;
    fn start_container(&self, id: &str) -> Result<()>;
    fn stop_container(&self, id: &str) -> Result<()>;
    fn delete_container(&self, id: &str) -> Result<()>;
    fn pause_container(&self, id: &str) -> Result<()>;
    fn resume_container(&self, id: &str) -> Result<()>;

    /// Status as the guest agent sees it. Used to re-sync after a failed
    /// pause/resume and to accept deletes of containers the sandbox no
    /// longer considers alive.
    fn container_status(&self, id: &str) -> Result<GuestStatus>;
    fn update_container(&self, id: &str, resources: &LinuxResources) -> Result<()>;
    fn stats_container(&self, id: &str) -> Result<ContainerStats>;

    /// Launches an additional process and returns its in-guest pid.
    fn start_exec(&self, id: &str, exec_id: &str, spec: &Process) -> Result<u32>;
    fn signal_process(&self, id: &str, exec_id: &str, signal: u32, all: bool) -> Result<()>;

    /// Blocks until the process exits and returns its exit code.
    fn wait_process(&self, id: &str, exec_id: &str) -> Result<i32>;

    /// Byte streams of the in-guest process, for the host side I/O relay.
    fn process_streams(&self, id: &str, exec_id: &str) -> Result<ProcessStreams>;
    fn close_stdin(&self, id: &str, exec_id: &str) -> Result<()>;
    fn resize_pty(&self, id: &str, exec_id: &str, width: u32, height: u32) -> Result<()>;

    /// Liveness channel. A `None` delivery is a graceful stop, anything
    /// else an unexpected sandbox failure. The channel can be taken once;
    /// backends without liveness reporting return `None` and the shim
    /// runs no watcher.
    fn monitor(&self) -> Option<Receiver<Option<String>>>;

    /// Blocks until a container in the guest is OOM-killed and returns
    /// its id. [`Error::AgentClosed`] ends the polling loop.
    fn wait_oom_event(&self) -> Result<String>;

    /// Stops the VM.
    fn stop(&self) -> Result<()>;

    /// Releases every resource still held by the sandbox.
    fn shutdown(&self) -> Result<()>;
}
