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

//! The task service: every task RPC, the container registry, and the
//! coordination between sandbox, I/O relay, reaper and event pipeline.
//!
//! One mutex serializes the registry and all status transitions; RPC
//! bodies run their registry work inside it. Sandbox capability calls are
//! internally synchronous and fast, so they stay inside the critical
//! section — except on the create path, where a hypervisor boot can block
//! indefinitely and therefore runs with the lock released.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::Instant;

use chrono::Utc;
use containerd_shim as shim;
use log::{debug, info, warn};
use oci_spec::runtime::{LinuxResources, Process};

use shim::api::*;
use shim::protos::api::ProcessInfo;
use shim::protos::cgroups::metrics::{CPUStat, CPUUsage, MemoryEntry, MemoryStat, Metrics, PidsStat};
use shim::protos::events::task::{
    TaskCreate, TaskDelete, TaskExecAdded, TaskExecStarted, TaskIO, TaskPaused, TaskResumed,
    TaskStart,
};
use shim::protos::protobuf::{CodedInputStream, Message, RepeatedField, SingularPtrField};
use shim::protos::types::mount::Mount;
use shim::{ExitSignal, Task, TtrpcContext, TtrpcResult};

use containerd_vm_sandbox as sandbox;
use sandbox::{BuildRequest, GuestStatus, Rootfs, Sandbox, SandboxFactory};

use crate::config::Config;
use crate::container::{Container, ContainerKind, Exec};
use crate::error::{Error, Result};
use crate::events::EventQueue;
use crate::io::{self, Stdio};
use crate::metrics::RpcMetrics;
use crate::reaper::{self, ProcessExit};
use crate::utils::{self, MountGuard};
use crate::watcher;

/// Rootfs mount types assembled inside the guest; the host side must not
/// mount them.
const SKIP_HOST_MOUNT_TYPES: [&str; 3] = ["layer", "nydus-overlayfs", "fuse.nydus-overlayfs"];

const SIGKILL: u32 = libc::SIGKILL as u32;
const SIGTERM: u32 = libc::SIGTERM as u32;

pub(crate) struct SandboxEntry {
    pub handle: Arc<dyn Sandbox>,
    pub hypervisor_pid: u32,
    /// Shared stop flag of the watcher and the OOM poller.
    pub watcher_cancel: Arc<AtomicBool>,
}

/// Everything behind the registry mutex.
pub(crate) struct ShimState {
    pub sandbox: Option<SandboxEntry>,
    pub containers: HashMap<String, Container>,
}

impl ShimState {
    fn new() -> Self {
        Self {
            sandbox: None,
            containers: HashMap::new(),
        }
    }

    pub fn cancel_watcher(&self) {
        if let Some(sb) = &self.sandbox {
            sb.watcher_cancel.store(true, Ordering::Relaxed);
        }
    }

    fn hypervisor_pid(&self) -> u32 {
        self.sandbox.as_ref().map(|s| s.hypervisor_pid).unwrap_or(0)
    }

    fn sandbox_handle(&self) -> Result<Arc<dyn Sandbox>> {
        self.sandbox
            .as_ref()
            .map(|s| s.handle.clone())
            .ok_or_else(|| Error::FailedPrecondition("sandbox does not exist".to_string()))
    }

    fn container(&self, id: &str) -> Result<&Container> {
        self.containers
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("container {}", id)))
    }

    fn container_mut(&mut self, id: &str) -> Result<&mut Container> {
        self.containers
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("container {}", id)))
    }
}

pub struct Service {
    runtime_id: String,
    namespace: String,
    config: Arc<Config>,
    factory: Arc<dyn SandboxFactory>,
    state: Arc<Mutex<ShimState>>,
    events: EventQueue,
    exits: Arc<Mutex<SyncSender<ProcessExit>>>,
    exit: Arc<ExitSignal>,
    shutdown: Once,
    metrics: RpcMetrics,
}

impl Service {
    pub fn new(
        runtime_id: &str,
        namespace: &str,
        config: Config,
        factory: Arc<dyn SandboxFactory>,
        events: EventQueue,
        exit: Arc<ExitSignal>,
    ) -> Service {
        let (exits_tx, exits_rx) = sync_channel(reaper::EXITS_DEPTH);
        reaper::spawn_exit_forwarder(exits_rx, events.clone());
        Service {
            runtime_id: runtime_id.to_string(),
            namespace: namespace.to_string(),
            config: Arc::new(config),
            factory,
            state: Arc::new(Mutex::new(ShimState::new())),
            events,
            exits: Arc::new(Mutex::new(exits_tx)),
            exit,
            shutdown: Once::new(),
            metrics: RpcMetrics::default(),
        }
    }

    pub(crate) fn shared_state(&self) -> Arc<Mutex<ShimState>> {
        self.state.clone()
    }

    fn timed<T>(&self, op: &'static str, f: impl FnOnce() -> Result<T>) -> TtrpcResult<T> {
        let start = Instant::now();
        let res = f();
        self.metrics.observe(op, start.elapsed());
        res.map_err(|e| {
            warn!("{} failed: {}", op, e);
            e.into()
        })
    }

    fn do_create(&self, req: CreateTaskRequest) -> Result<CreateTaskResponse> {
        utils::validate_id(req.get_id())?;

        // the creation work races the configured deadline; a stuck
        // hypervisor boot must not wedge the whole service
        let (tx, rx) = sync_channel(1);
        let state = self.state.clone();
        let factory = self.factory.clone();
        let events = self.events.clone();
        let namespace = self.namespace.clone();
        let config = self.config.clone();
        thread::spawn(move || {
            let _ = tx.send(create_inner(state, factory, events, namespace, config, req));
        });
        match rx.recv_timeout(self.config.create_timeout()) {
            Ok(res) => res,
            Err(_) => Err(Error::CreateTimeout),
        }
    }

    fn do_start(&self, req: StartRequest) -> Result<StartResponse> {
        let mut state = self.state.lock().unwrap();
        let hypervisor_pid = state.hypervisor_pid();
        let sb = state.sandbox_handle()?;
        let c = state.container_mut(req.get_id())?;
        let container_id = c.id.clone();

        if req.get_exec_id().is_empty() {
            if c.status != Status::CREATED {
                return Err(Error::FailedPrecondition(format!(
                    "cannot start container in state {:?}",
                    c.status
                )));
            }
            // hold the send-order lock so our start event cannot be
            // overtaken by this process's exit
            let order = self.events.order_lock();
            sb.start_container(&container_id)?;
            let streams = sb.process_streams(&container_id, "")?;
            let tty = io::start_io(&self.namespace, &container_id, &c.stdio, streams)?;
            let io_exit = tty.exit.clone();
            c.status = Status::RUNNING;
            c.tty = Some(tty);
            let is_sandbox = c.kind.is_sandbox();
            reaper::spawn_waiter(
                self.state.clone(),
                sb,
                self.exits.lock().unwrap().clone(),
                container_id.clone(),
                String::new(),
                io_exit,
                is_sandbox,
            );
            let mut ev = TaskStart::new();
            ev.set_container_id(container_id);
            ev.set_pid(hypervisor_pid);
            self.events.send(Box::new(ev));
            drop(order);
        } else {
            let exec_id = req.get_exec_id().to_string();
            let exec = c.exec_mut(&exec_id)?;
            if exec.status != Status::CREATED {
                return Err(Error::FailedPrecondition(format!(
                    "cannot start exec in state {:?}",
                    exec.status
                )));
            }
            let order = self.events.order_lock();
            let guest_pid = sb.start_exec(&container_id, &exec_id, &exec.spec)?;
            let streams = sb.process_streams(&container_id, &exec_id)?;
            let tty = io::start_io(&self.namespace, &container_id, &exec.stdio, streams)?;
            let io_exit = tty.exit.clone();
            exec.status = Status::RUNNING;
            exec.pid = Some(guest_pid);
            exec.tty = Some(tty);
            reaper::spawn_waiter(
                self.state.clone(),
                sb,
                self.exits.lock().unwrap().clone(),
                container_id.clone(),
                exec_id.clone(),
                io_exit,
                false,
            );
            let mut ev = TaskExecStarted::new();
            ev.set_container_id(container_id);
            ev.set_exec_id(exec_id);
            ev.set_pid(hypervisor_pid);
            self.events.send(Box::new(ev));
            drop(order);
        }

        let mut resp = StartResponse::new();
        resp.set_pid(hypervisor_pid);
        Ok(resp)
    }

    fn do_delete(&self, req: DeleteRequest) -> Result<DeleteResponse> {
        let mut state = self.state.lock().unwrap();
        let hypervisor_pid = state.hypervisor_pid();

        if !req.get_exec_id().is_empty() {
            let c = state.container_mut(req.get_id())?;
            let exec = c.exec(req.get_exec_id())?;
            if exec.status != Status::STOPPED {
                return Err(Error::FailedPrecondition(format!(
                    "cannot delete exec in state {:?}",
                    exec.status
                )));
            }
            let exit_code = exec.exit_code;
            let exited_at = exec.exited_at;
            c.execs.remove(req.get_exec_id());

            let mut resp = DeleteResponse::new();
            resp.set_pid(hypervisor_pid);
            resp.set_exit_status(exit_code as u32);
            resp.exited_at = utils::option_timestamp(exited_at);
            return Ok(resp);
        }

        let sb = state.sandbox_handle()?;
        let c = state.container(req.get_id())?;
        if c.status != Status::STOPPED {
            // accept the delete when the sandbox itself no longer
            // considers the container alive
            let gone = match sb.container_status(&c.id) {
                Ok(GuestStatus::Stopped) => true,
                Err(sandbox::Error::NotFound(_)) => true,
                _ => false,
            };
            if !gone {
                return Err(Error::FailedPrecondition(format!(
                    "cannot delete container in state {:?}",
                    c.status
                )));
            }
        }

        let c = state.containers.remove(req.get_id()).unwrap();
        if c.rootfs_mounted {
            utils::unmount(&Path::new(&c.bundle).join("rootfs"));
        }
        if c.kind.is_sandbox() {
            // reaped containers already tore the sandbox down; this covers
            // a sandbox deleted without ever being started
            state.cancel_watcher();
            if let Err(e) = sb.stop() {
                debug!("stop sandbox on delete: {}", e);
            }
            if let Err(e) = sb.shutdown() {
                debug!("shutdown sandbox on delete: {}", e);
            }
        } else if let Err(e) = sb.delete_container(&c.id) {
            warn!("delete container {} in guest: {}", c.id, e);
        }

        let mut ev = TaskDelete::new();
        ev.set_container_id(c.id.clone());
        ev.set_pid(hypervisor_pid);
        ev.set_exit_status(c.exit_code as u32);
        ev.exited_at = utils::option_timestamp(c.exited_at);
        self.events.send(Box::new(ev));

        let mut resp = DeleteResponse::new();
        resp.set_pid(hypervisor_pid);
        resp.set_exit_status(c.exit_code as u32);
        resp.exited_at = utils::option_timestamp(c.exited_at);
        Ok(resp)
    }

    fn do_exec(&self, req: ExecProcessRequest) -> Result<Empty> {
        utils::validate_id(req.get_exec_id())?;
        let mut state = self.state.lock().unwrap();
        let c = state.container_mut(req.get_id())?;
        if c.execs.contains_key(req.get_exec_id()) {
            return Err(Error::AlreadyExists(format!("exec {}", req.get_exec_id())));
        }
        let spec_any = req
            .spec
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("no process spec".to_string()))?;
        let process: Process = serde_json::from_slice(spec_any.get_value())
            .map_err(|e| Error::InvalidArgument(format!("process spec: {}", e)))?;
        let stdio = Stdio::new(
            req.get_stdin(),
            req.get_stdout(),
            req.get_stderr(),
            req.get_terminal(),
        );
        let exec_id = req.get_exec_id().to_string();
        c.execs
            .insert(exec_id.clone(), Exec::new(&exec_id, process, stdio));

        let mut ev = TaskExecAdded::new();
        ev.set_container_id(c.id.clone());
        ev.set_exec_id(exec_id);
        self.events.send(Box::new(ev));
        Ok(Empty::new())
    }

    fn do_kill(&self, req: KillRequest) -> Result<Empty> {
        let state = self.state.lock().unwrap();
        let sb = state.sandbox_handle()?;
        let c = state.container(req.get_id())?;
        let signal = req.get_signal();

        if req.get_exec_id().is_empty() {
            if c.status == Status::STOPPED && (signal == SIGKILL || signal == SIGTERM) {
                // CRI-induced double stop
                debug!("kill: container {} already stopped", c.id);
                return Ok(Empty::new());
            }
            sb.signal_process(&c.id, "", signal, true)?;
        } else {
            let exec = c.exec(req.get_exec_id())?;
            if exec.status == Status::STOPPED && (signal == SIGKILL || signal == SIGTERM) {
                debug!("kill: exec {}/{} already stopped", c.id, exec.id);
                return Ok(Empty::new());
            }
            if exec.pid.is_none() {
                return Err(Error::FailedPrecondition(format!(
                    "exec {} has no process",
                    exec.id
                )));
            }
            sb.signal_process(&c.id, &exec.id, signal, req.get_all())?;
        }
        Ok(Empty::new())
    }

    fn do_pause(&self, req: PauseRequest) -> Result<Empty> {
        let mut state = self.state.lock().unwrap();
        let sb = state.sandbox_handle()?;
        let c = state.container_mut(req.get_id())?;
        if c.status != Status::RUNNING && c.status != Status::PAUSED {
            return Err(Error::FailedPrecondition(format!(
                "cannot pause container in state {:?}",
                c.status
            )));
        }
        c.status = Status::PAUSING;
        match sb.pause_container(&c.id) {
            Ok(()) => {
                c.status = Status::PAUSED;
                let mut ev = TaskPaused::new();
                ev.set_container_id(c.id.clone());
                self.events.send(Box::new(ev));
                Ok(Empty::new())
            }
            Err(e) => {
                c.status = resync_status(sb.as_ref(), &c.id);
                Err(e.into())
            }
        }
    }

    fn do_resume(&self, req: ResumeRequest) -> Result<Empty> {
        let mut state = self.state.lock().unwrap();
        let sb = state.sandbox_handle()?;
        let c = state.container_mut(req.get_id())?;
        if c.status != Status::PAUSED {
            return Err(Error::FailedPrecondition(format!(
                "cannot resume container in state {:?}",
                c.status
            )));
        }
        match sb.resume_container(&c.id) {
            Ok(()) => {
                c.status = Status::RUNNING;
                let mut ev = TaskResumed::new();
                ev.set_container_id(c.id.clone());
                self.events.send(Box::new(ev));
                Ok(Empty::new())
            }
            Err(e) => {
                c.status = resync_status(sb.as_ref(), &c.id);
                Err(e.into())
            }
        }
    }

    fn do_state(&self, req: StateRequest) -> Result<StateResponse> {
        let state = self.state.lock().unwrap();
        let hypervisor_pid = state.hypervisor_pid();
        let c = state.container(req.get_id())?;

        let mut resp = StateResponse::new();
        resp.set_id(req.get_id().to_string());
        resp.set_bundle(c.bundle.clone());
        resp.set_pid(hypervisor_pid);
        if req.get_exec_id().is_empty() {
            resp.set_status(c.status);
            resp.set_stdin(c.stdio.stdin.clone());
            resp.set_stdout(c.stdio.stdout.clone());
            resp.set_stderr(c.stdio.stderr.clone());
            resp.set_terminal(c.stdio.terminal);
            resp.set_exit_status(c.exit_code as u32);
            resp.exited_at = utils::option_timestamp(c.exited_at);
        } else {
            let exec = c.exec(req.get_exec_id())?;
            resp.set_status(exec.status);
            resp.set_stdin(exec.stdio.stdin.clone());
            resp.set_stdout(exec.stdio.stdout.clone());
            resp.set_stderr(exec.stdio.stderr.clone());
            resp.set_terminal(exec.stdio.terminal);
            resp.set_exit_status(exec.exit_code as u32);
            resp.exited_at = utils::option_timestamp(exec.exited_at);
            resp.set_exec_id(exec.id.clone());
        }
        Ok(resp)
    }

    fn do_pids(&self, req: PidsRequest) -> Result<PidsResponse> {
        let state = self.state.lock().unwrap();
        let hypervisor_pid = state.hypervisor_pid();
        state.container(req.get_id())?;

        // in-guest pids are invisible from the host; the hypervisor pid is
        // the only one there is
        let mut info = ProcessInfo::new();
        info.set_pid(hypervisor_pid);
        let mut resp = PidsResponse::new();
        resp.processes = RepeatedField::from_vec(vec![info]);
        Ok(resp)
    }

    fn do_stats(&self, req: StatsRequest) -> Result<StatsResponse> {
        let state = self.state.lock().unwrap();
        let sb = state.sandbox_handle()?;
        let c = state.container(req.get_id())?;
        let stats = sb.stats_container(&c.id)?;

        let metrics = metrics_message(&stats);
        let mut resp = StatsResponse::new();
        resp.stats = SingularPtrField::some(utils::to_any(&metrics)?);
        Ok(resp)
    }

    fn do_update(&self, req: UpdateTaskRequest) -> Result<Empty> {
        let state = self.state.lock().unwrap();
        let sb = state.sandbox_handle()?;
        let c = state.container(req.get_id())?;
        let resources: LinuxResources = serde_json::from_slice(req.get_resources().get_value())
            .map_err(|e| Error::InvalidArgument(format!("resources: {}", e)))?;
        sb.update_container(&c.id, &resources)?;
        Ok(Empty::new())
    }

    fn do_wait(&self, req: WaitRequest) -> Result<WaitResponse> {
        let latch = {
            let state = self.state.lock().unwrap();
            let c = state.container(req.get_id())?;
            if req.get_exec_id().is_empty() {
                if c.status == Status::STOPPED {
                    let mut resp = WaitResponse::new();
                    resp.set_exit_status(c.exit_code as u32);
                    resp.exited_at = utils::option_timestamp(c.exited_at);
                    return Ok(resp);
                }
                c.exit.clone()
            } else {
                let exec = c.exec(req.get_exec_id())?;
                if exec.status == Status::STOPPED {
                    let mut resp = WaitResponse::new();
                    resp.set_exit_status(exec.exit_code as u32);
                    resp.exited_at = utils::option_timestamp(exec.exited_at);
                    return Ok(resp);
                }
                exec.exit.clone()
            }
            // the registry lock is released before blocking on the latch
        };
        let exit_code = latch.wait();

        let exited_at = {
            let state = self.state.lock().unwrap();
            match state.containers.get(req.get_id()) {
                Some(c) if req.get_exec_id().is_empty() => c.exited_at,
                Some(c) => c
                    .execs
                    .get(req.get_exec_id())
                    .and_then(|e| e.exited_at),
                None => None,
            }
        };
        let mut resp = WaitResponse::new();
        resp.set_exit_status(exit_code as u32);
        resp.exited_at = utils::option_timestamp(exited_at.or_else(|| Some(Utc::now())));
        Ok(resp)
    }

    fn do_connect(&self, req: ConnectRequest) -> Result<ConnectResponse> {
        let state = self.state.lock().unwrap();
        debug!("connect for {}", req.get_id());
        let mut resp = ConnectResponse::new();
        resp.set_shim_pid(std::process::id());
        resp.set_task_pid(state.hypervisor_pid());
        resp.set_version(self.runtime_id.clone());
        Ok(resp)
    }

    fn do_resize_pty(&self, req: ResizePtyRequest) -> Result<Empty> {
        let state = self.state.lock().unwrap();
        let sb = state.sandbox_handle()?;
        let c = state.container(req.get_id())?;
        if !req.get_exec_id().is_empty() {
            c.exec(req.get_exec_id())?;
        }
        sb.resize_pty(&c.id, req.get_exec_id(), req.get_width(), req.get_height())?;
        Ok(Empty::new())
    }

    fn do_close_io(&self, req: CloseIORequest) -> Result<Empty> {
        let (closer, sb, container_id, exec_id) = {
            let state = self.state.lock().unwrap();
            let sb = state.sandbox_handle()?;
            let c = state.container(req.get_id())?;
            let closer = if req.get_exec_id().is_empty() {
                c.tty.as_ref().map(|t| t.stdin_closer.clone())
            } else {
                c.exec(req.get_exec_id())?
                    .tty
                    .as_ref()
                    .map(|t| t.stdin_closer.clone())
            };
            (closer, sb, c.id.clone(), req.get_exec_id().to_string())
        };
        // every host stdin byte is delivered before the guest pipe closes
        if let Some(closer) = closer {
            closer.wait();
        }
        sb.close_stdin(&container_id, &exec_id)?;
        Ok(Empty::new())
    }

    fn do_shutdown(&self) -> Result<Empty> {
        {
            let state = self.state.lock().unwrap();
            if !state.containers.is_empty() {
                // containers still registered; the shim lives on
                return Ok(Empty::new());
            }
            state.cancel_watcher();
        }
        let exit = self.exit.clone();
        self.shutdown.call_once(move || {
            exit.signal();
        });
        Ok(Empty::new())
    }
}

fn resync_status(sb: &dyn Sandbox, id: &str) -> Status {
    match sb.container_status(id) {
        Ok(gs) => guest_to_status(gs),
        Err(e) => {
            warn!("status of {} unavailable: {}", id, e);
            Status::UNKNOWN
        }
    }
}

fn guest_to_status(gs: GuestStatus) -> Status {
    match gs {
        GuestStatus::Created => Status::CREATED,
        GuestStatus::Running => Status::RUNNING,
        GuestStatus::Paused => Status::PAUSED,
        GuestStatus::Stopped => Status::STOPPED,
    }
}

fn metrics_message(stats: &sandbox::ContainerStats) -> Metrics {
    let mut cpu_usage = CPUUsage::new();
    cpu_usage.set_total(stats.cpu_usage_ns);
    let mut cpu = CPUStat::new();
    cpu.usage = SingularPtrField::some(cpu_usage);

    let mut mem_entry = MemoryEntry::new();
    mem_entry.set_usage(stats.memory_usage_bytes);
    mem_entry.set_limit(stats.memory_limit_bytes);
    let mut memory = MemoryStat::new();
    memory.usage = SingularPtrField::some(mem_entry);

    let mut pids = PidsStat::new();
    pids.set_current(stats.pids_current);

    let mut metrics = Metrics::new();
    metrics.cpu = SingularPtrField::some(cpu);
    metrics.memory = SingularPtrField::some(memory);
    metrics.pids = SingularPtrField::some(pids);
    metrics
}

fn create_inner(
    state: Arc<Mutex<ShimState>>,
    factory: Arc<dyn SandboxFactory>,
    events: EventQueue,
    namespace: String,
    config: Arc<Config>,
    req: CreateTaskRequest,
) -> Result<CreateTaskResponse> {
    let id = req.get_id().to_string();
    let bundle = req.get_bundle().to_string();

    {
        let state = state.lock().unwrap();
        if state.containers.contains_key(&id) {
            return Err(Error::AlreadyExists(format!("container {}", id)));
        }
    }

    let spec = utils::read_spec(Path::new(&bundle))?;
    let kind = ContainerKind::from_spec(&spec);

    // a typed options blob must at least be a parseable message
    if let Some(any) = req.options.as_ref() {
        if !any.get_type_url().is_empty() {
            let mut opts = Options::new();
            let mut input = CodedInputStream::from_bytes(any.get_value());
            opts.merge_from(&mut input)
                .map_err(|e| Error::InvalidArgument(format!("unparseable options: {}", e)))?;
        }
    }

    let (rootfs, mut mount_guard) = prepare_rootfs(&config, &bundle, &req.rootfs)?;
    let rootfs_mounted = mount_guard.armed();
    let stdio = Stdio::new(
        req.get_stdin(),
        req.get_stdout(),
        req.get_stderr(),
        req.get_terminal(),
    );
    let container = Container::new(&id, &bundle, kind, stdio.clone(), spec.clone(), rootfs_mounted);

    // the sandbox calls below can block on a hypervisor boot; they run
    // with the registry lock released so every other task RPC stays
    // serviceable, and the registration re-checks for lost races
    let hypervisor_pid = match kind {
        ContainerKind::PodSandbox | ContainerKind::SingleContainer => {
            {
                let state = state.lock().unwrap();
                if state.sandbox.is_some() {
                    return Err(Error::AlreadyExists("sandbox".to_string()));
                }
            }
            let build = BuildRequest {
                id: id.clone(),
                namespace: namespace.clone(),
                bundle: bundle.clone(),
                rootfs: rootfs.clone(),
                spec: spec.clone(),
            };
            let handle = factory.build(&build)?;
            let pid = handle.hypervisor_pid();

            let mut locked = state.lock().unwrap();
            if locked.sandbox.is_some() || locked.containers.contains_key(&id) {
                drop(locked);
                // a concurrent create won the race; roll the boot back
                if let Err(e) = handle.stop() {
                    warn!("stop raced sandbox {}: {}", handle.id(), e);
                }
                if let Err(e) = handle.shutdown() {
                    warn!("shutdown raced sandbox {}: {}", handle.id(), e);
                }
                return Err(Error::AlreadyExists("sandbox".to_string()));
            }
            let cancel = Arc::new(AtomicBool::new(false));
            if let Some(monitor) = handle.monitor() {
                watcher::spawn_sandbox_watcher(
                    state.clone(),
                    handle.clone(),
                    monitor,
                    cancel.clone(),
                );
            }
            watcher::spawn_oom_monitor(state.clone(), handle.clone(), events.clone(), cancel.clone());
            locked.sandbox = Some(SandboxEntry {
                handle,
                hypervisor_pid: pid,
                watcher_cancel: cancel,
            });
            locked.containers.insert(id.clone(), container);
            pid
        }
        ContainerKind::PodContainer => {
            let sb = {
                let state = state.lock().unwrap();
                state
                    .sandbox
                    .as_ref()
                    .map(|s| s.handle.clone())
                    .ok_or_else(|| {
                        Error::FailedPrecondition(
                            "pod container requested before any sandbox exists".to_string(),
                        )
                    })?
            };
            sb.create_container(&id, &spec, &rootfs)?;

            let mut locked = state.lock().unwrap();
            if locked.containers.contains_key(&id) {
                drop(locked);
                if let Err(e) = sb.delete_container(&id) {
                    warn!("delete raced container {} in guest: {}", id, e);
                }
                return Err(Error::AlreadyExists(format!("container {}", id)));
            }
            let pid = locked.hypervisor_pid();
            locked.containers.insert(id.clone(), container);
            pid
        }
    };
    mount_guard.disarm();

    let mut io = TaskIO::new();
    io.set_stdin(stdio.stdin);
    io.set_stdout(stdio.stdout);
    io.set_stderr(stdio.stderr);
    io.set_terminal(stdio.terminal);
    let mut ev = TaskCreate::new();
    ev.set_container_id(id);
    ev.set_bundle(bundle);
    ev.rootfs = req.rootfs.clone();
    ev.io = SingularPtrField::some(io);
    ev.set_pid(hypervisor_pid);
    events.send(Box::new(ev));

    let mut resp = CreateTaskResponse::new();
    resp.set_pid(hypervisor_pid);
    Ok(resp)
}

/// Applies the rootfs mount policy of the create path.
///
/// A single block-device mount passes through to the guest when block
/// device use is enabled; guest-assembled layer types are never mounted on
/// the host; everything else lands under `<bundle>/rootfs`, owned by the
/// returned guard until creation fully succeeds.
fn prepare_rootfs(
    config: &Config,
    bundle: &str,
    mounts: &RepeatedField<Mount>,
) -> Result<(Vec<Rootfs>, MountGuard)> {
    if mounts.is_empty() {
        return Ok((Vec::new(), MountGuard::unarmed()));
    }

    if mounts.len() == 1 {
        let m = &mounts[0];
        let passthrough = SKIP_HOST_MOUNT_TYPES.contains(&m.get_field_type())
            || (!config.disable_block_device_use && utils::is_block_device(m.get_source()));
        if passthrough {
            let rootfs = Rootfs {
                source: m.get_source().to_string(),
                fs_type: m.get_field_type().to_string(),
                options: m.options.to_vec(),
                host_mounted: false,
            };
            return Ok((vec![rootfs], MountGuard::unarmed()));
        }
    }

    let target = Path::new(bundle).join("rootfs");
    std::fs::create_dir_all(&target)?;
    let mut guard = MountGuard::unarmed();
    for m in mounts.iter() {
        utils::mount_at(m.get_source(), m.get_field_type(), &m.options.to_vec(), &target)?;
        if !guard.armed() {
            guard = MountGuard::new(target.clone());
        }
    }
    let rootfs = Rootfs {
        source: target.to_string_lossy().to_string(),
        fs_type: String::new(),
        options: Vec::new(),
        host_mounted: true,
    };
    Ok((vec![rootfs], guard))
}

impl Task for Service {
    fn create(&self, _ctx: &TtrpcContext, req: CreateTaskRequest) -> TtrpcResult<CreateTaskResponse> {
        info!("create request for {}", req.get_id());
        self.timed("create", || self.do_create(req))
    }

    fn start(&self, _ctx: &TtrpcContext, req: StartRequest) -> TtrpcResult<StartResponse> {
        info!("start request for {} exec {}", req.get_id(), req.get_exec_id());
        self.timed("start", || self.do_start(req))
    }

    fn delete(&self, _ctx: &TtrpcContext, req: DeleteRequest) -> TtrpcResult<DeleteResponse> {
        info!("delete request for {} exec {}", req.get_id(), req.get_exec_id());
        self.timed("delete", || self.do_delete(req))
    }

    fn exec(&self, _ctx: &TtrpcContext, req: ExecProcessRequest) -> TtrpcResult<Empty> {
        info!("exec request for {} exec {}", req.get_id(), req.get_exec_id());
        self.timed("exec", || self.do_exec(req))
    }

    fn kill(&self, _ctx: &TtrpcContext, req: KillRequest) -> TtrpcResult<Empty> {
        info!(
            "kill request for {} exec {} signal {}",
            req.get_id(),
            req.get_exec_id(),
            req.get_signal()
        );
        self.timed("kill", || self.do_kill(req))
    }

    fn pause(&self, _ctx: &TtrpcContext, req: PauseRequest) -> TtrpcResult<Empty> {
        info!("pause request for {}", req.get_id());
        self.timed("pause", || self.do_pause(req))
    }

    fn resume(&self, _ctx: &TtrpcContext, req: ResumeRequest) -> TtrpcResult<Empty> {
        info!("resume request for {}", req.get_id());
        self.timed("resume", || self.do_resume(req))
    }

    fn state(&self, _ctx: &TtrpcContext, req: StateRequest) -> TtrpcResult<StateResponse> {
        debug!("state request for {} exec {}", req.get_id(), req.get_exec_id());
        self.timed("state", || self.do_state(req))
    }

    fn pids(&self, _ctx: &TtrpcContext, req: PidsRequest) -> TtrpcResult<PidsResponse> {
        debug!("pids request for {}", req.get_id());
        self.timed("pids", || self.do_pids(req))
    }

    fn stats(&self, _ctx: &TtrpcContext, req: StatsRequest) -> TtrpcResult<StatsResponse> {
        debug!("stats request for {}", req.get_id());
        self.timed("stats", || self.do_stats(req))
    }

    fn update(&self, _ctx: &TtrpcContext, req: UpdateTaskRequest) -> TtrpcResult<Empty> {
        info!("update request for {}", req.get_id());
        self.timed("update", || self.do_update(req))
    }

    fn wait(&self, _ctx: &TtrpcContext, req: WaitRequest) -> TtrpcResult<WaitResponse> {
        info!("wait request for {} exec {}", req.get_id(), req.get_exec_id());
        self.timed("wait", || self.do_wait(req))
    }

    fn resize_pty(&self, _ctx: &TtrpcContext, req: ResizePtyRequest) -> TtrpcResult<Empty> {
        debug!(
            "resize_pty request for {} exec {}",
            req.get_id(),
            req.get_exec_id()
        );
        self.timed("resize_pty", || self.do_resize_pty(req))
    }

    fn close_io(&self, _ctx: &TtrpcContext, req: CloseIORequest) -> TtrpcResult<Empty> {
        debug!(
            "close_io request for {} exec {}",
            req.get_id(),
            req.get_exec_id()
        );
        self.timed("close_io", || self.do_close_io(req))
    }

    fn checkpoint(&self, _ctx: &TtrpcContext, req: CheckpointTaskRequest) -> TtrpcResult<Empty> {
        info!("checkpoint request for {}", req.get_id());
        self.timed("checkpoint", || -> Result<Empty> {
            Err(Error::Unimplemented("checkpoint".to_string()))
        })
    }

    fn connect(&self, _ctx: &TtrpcContext, req: ConnectRequest) -> TtrpcResult<ConnectResponse> {
        debug!("connect request for {}", req.get_id());
        self.timed("connect", || self.do_connect(req))
    }

    fn shutdown(&self, _ctx: &TtrpcContext, _req: ShutdownRequest) -> TtrpcResult<Empty> {
        info!("shutdown request");
        self.timed("shutdown", || self.do_shutdown())
    }
}

#[cfg(test)]
mod tests;
