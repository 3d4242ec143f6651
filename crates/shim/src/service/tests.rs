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

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use containerd_shim::api::{
    CreateTaskRequest, DeleteRequest, DeleteResponse, Empty, ExecProcessRequest, KillRequest,
    PauseRequest, PidsRequest, ResumeRequest, StartRequest, StartResponse, StateRequest,
    StateResponse, StatsRequest, Status, UpdateTaskRequest, WaitRequest, WaitResponse,
};
use containerd_shim::protos::protobuf::well_known_types::Any;
use containerd_shim::protos::protobuf::SingularPtrField;
use containerd_shim::ExitSignal;
use oci_spec::runtime::{LinuxResources, Process, Spec};
use tempfile::TempDir;

use containerd_vm_sandbox as sandbox;
use sandbox::{
    BuildRequest, ContainerStats, GuestStatus, ProcessStreams, Rootfs, Sandbox, SandboxFactory,
};

use crate::config::Config;
use crate::container::{
    CRIO_CONTAINER_TYPE, CRIO_SANDBOX_ID, CRI_CONTAINER_TYPE, CRI_SANDBOX_ID,
};
use crate::error::Error;
use crate::events::{
    EventMessage, EventQueue, TASK_CREATE_TOPIC, TASK_DELETE_TOPIC, TASK_EXEC_ADDED_TOPIC,
    TASK_EXEC_STARTED_TOPIC, TASK_EXIT_TOPIC, TASK_OOM_TOPIC, TASK_PAUSED_TOPIC,
    TASK_RESUMED_TOPIC, TASK_START_TOPIC,
};
use crate::service::Service;

const RUNTIME_ID: &str = "io.containerd.vm.v2";
const HYPERVISOR_PID: u32 = 4242;
const GUEST_EXEC_PID: u32 = 4321;
const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

fn key(id: &str, exec_id: &str) -> String {
    format!("{}/{}", id, exec_id)
}

#[derive(Default)]
struct FakeSandbox {
    senders: Mutex<HashMap<String, SyncSender<i32>>>,
    receivers: Mutex<HashMap<String, Arc<Mutex<Receiver<i32>>>>>,
    statuses: Mutex<HashMap<String, GuestStatus>>,
    stopped_containers: Mutex<Vec<String>>,
    deleted_containers: Mutex<Vec<String>>,
    sandbox_stopped: AtomicBool,
    sandbox_shutdown: AtomicBool,
    fail_pause: AtomicBool,
    fail_status: AtomicBool,
    monitor_tx: Mutex<Option<SyncSender<Option<String>>>>,
    monitor_rx: Mutex<Option<Receiver<Option<String>>>>,
    oom_tx: Mutex<Option<SyncSender<String>>>,
    oom_rx: Mutex<Option<Receiver<String>>>,
}

impl FakeSandbox {
    fn new(with_monitor: bool) -> Arc<Self> {
        let fake = FakeSandbox::default();
        if with_monitor {
            let (tx, rx) = sync_channel(1);
            *fake.monitor_tx.lock().unwrap() = Some(tx);
            *fake.monitor_rx.lock().unwrap() = Some(rx);
        }
        let (otx, orx) = sync_channel(8);
        *fake.oom_tx.lock().unwrap() = Some(otx);
        *fake.oom_rx.lock().unwrap() = Some(orx);
        Arc::new(fake)
    }

    fn register(&self, id: &str, exec_id: &str) {
        let (tx, rx) = sync_channel(1);
        self.senders.lock().unwrap().insert(key(id, exec_id), tx);
        self.receivers
            .lock()
            .unwrap()
            .insert(key(id, exec_id), Arc::new(Mutex::new(rx)));
    }

    /// Scripts the exit of an in-guest process.
    fn finish(&self, id: &str, exec_id: &str, code: i32) {
        let tx = self
            .senders
            .lock()
            .unwrap()
            .get(&key(id, exec_id))
            .cloned()
            .expect("process not registered");
        tx.send(code).unwrap();
    }

    fn fail_sandbox(&self, reason: &str) {
        let tx = self.monitor_tx.lock().unwrap();
        tx.as_ref().unwrap().send(Some(reason.to_string())).unwrap();
    }

    fn trigger_oom(&self, id: &str) {
        let tx = self.oom_tx.lock().unwrap();
        tx.as_ref().unwrap().send(id.to_string()).unwrap();
    }

    fn stopped(&self, id: &str) -> bool {
        self.stopped_containers
            .lock()
            .unwrap()
            .iter()
            .any(|c| c == id)
    }
}

impl Sandbox for FakeSandbox {
    fn id(&self) -> &str {
        "sb"
    }

    fn hypervisor_pid(&self) -> u32 {
        HYPERVISOR_PID
    }

    fn create_container(
        &self,
        id: &str,
        _spec: &Spec,
        _rootfs: &[Rootfs],
    ) -> sandbox::Result<()> {
        self.register(id, "");
        self.statuses
            .lock()
            .unwrap()
            .insert(id.to_string(), GuestStatus::Created);
        Ok(())
    }

    fn start_container(&self, id: &str) -> sandbox::Result<()> {
        self.statuses
            .lock()
            .unwrap()
            .insert(id.to_string(), GuestStatus::Running);
        Ok(())
    }

    fn stop_container(&self, id: &str) -> sandbox::Result<()> {
        self.stopped_containers.lock().unwrap().push(id.to_string());
        self.statuses
            .lock()
            .unwrap()
            .insert(id.to_string(), GuestStatus::Stopped);
        Ok(())
    }

    fn delete_container(&self, id: &str) -> sandbox::Result<()> {
        self.deleted_containers.lock().unwrap().push(id.to_string());
        self.statuses.lock().unwrap().remove(id);
        Ok(())
    }

    fn pause_container(&self, id: &str) -> sandbox::Result<()> {
        if self.fail_pause.load(Ordering::Relaxed) {
            return Err(sandbox::Error::Other("pause failed in guest".to_string()));
        }
        self.statuses
            .lock()
            .unwrap()
            .insert(id.to_string(), GuestStatus::Paused);
        Ok(())
    }

    fn resume_container(&self, id: &str) -> sandbox::Result<()> {
        self.statuses
            .lock()
            .unwrap()
            .insert(id.to_string(), GuestStatus::Running);
        Ok(())
    }

    fn container_status(&self, id: &str) -> sandbox::Result<GuestStatus> {
        if self.fail_status.load(Ordering::Relaxed) {
            return Err(sandbox::Error::Other("agent unreachable".to_string()));
        }
        self.statuses
            .lock()
            .unwrap()
            .get(id)
            .copied()
            .ok_or_else(|| sandbox::Error::NotFound(format!("container {}", id)))
    }

    fn update_container(&self, _id: &str, _resources: &LinuxResources) -> sandbox::Result<()> {
        Ok(())
    }

    fn stats_container(&self, _id: &str) -> sandbox::Result<ContainerStats> {
        Ok(ContainerStats {
            cpu_usage_ns: 111,
            memory_usage_bytes: 222,
            memory_limit_bytes: 333,
            pids_current: 4,
        })
    }

    fn start_exec(&self, id: &str, exec_id: &str, _spec: &Process) -> sandbox::Result<u32> {
        self.register(id, exec_id);
        Ok(GUEST_EXEC_PID)
    }

    fn signal_process(
        &self,
        id: &str,
        exec_id: &str,
        signal: u32,
        _all: bool,
    ) -> sandbox::Result<()> {
        let tx = self
            .senders
            .lock()
            .unwrap()
            .get(&key(id, exec_id))
            .cloned()
            .ok_or_else(|| sandbox::Error::NotFound(format!("process {}/{}", id, exec_id)))?;
        tx.send(128 + signal as i32)
            .map_err(|_| sandbox::Error::Other("process already reaped".to_string()))
    }

    fn wait_process(&self, id: &str, exec_id: &str) -> sandbox::Result<i32> {
        let rx = self
            .receivers
            .lock()
            .unwrap()
            .get(&key(id, exec_id))
            .cloned()
            .ok_or_else(|| sandbox::Error::NotFound(format!("process {}/{}", id, exec_id)))?;
        let rx = rx.lock().unwrap();
        rx.recv()
            .map_err(|_| sandbox::Error::Other("wait interrupted".to_string()))
    }

    fn process_streams(&self, _id: &str, _exec_id: &str) -> sandbox::Result<ProcessStreams> {
        Ok(ProcessStreams::default())
    }

    fn close_stdin(&self, _id: &str, _exec_id: &str) -> sandbox::Result<()> {
        Ok(())
    }

    fn resize_pty(&self, _id: &str, _exec_id: &str, _w: u32, _h: u32) -> sandbox::Result<()> {
        Ok(())
    }

    fn monitor(&self) -> Option<Receiver<Option<String>>> {
        self.monitor_rx.lock().unwrap().take()
    }

    fn wait_oom_event(&self) -> sandbox::Result<String> {
        let rx = self.oom_rx.lock().unwrap();
        match rx.as_ref() {
            Some(rx) => rx.recv().map_err(|_| sandbox::Error::AgentClosed),
            None => Err(sandbox::Error::AgentClosed),
        }
    }

    fn stop(&self) -> sandbox::Result<()> {
        self.sandbox_stopped.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn shutdown(&self) -> sandbox::Result<()> {
        self.sandbox_shutdown.store(true, Ordering::Relaxed);
        Ok(())
    }
}

struct FakeFactory {
    sandbox: Arc<FakeSandbox>,
    build_delay: Option<Duration>,
}

impl SandboxFactory for FakeFactory {
    fn build(&self, req: &BuildRequest) -> sandbox::Result<Arc<dyn Sandbox>> {
        if let Some(delay) = self.build_delay {
            thread::sleep(delay);
        }
        self.sandbox.register(&req.id, "");
        self.sandbox
            .statuses
            .lock()
            .unwrap()
            .insert(req.id.clone(), GuestStatus::Created);
        Ok(self.sandbox.clone())
    }
}

struct Harness {
    service: Service,
    events: Receiver<(String, EventMessage)>,
    exit: Arc<ExitSignal>,
    fake: Arc<FakeSandbox>,
    dirs: Vec<TempDir>,
}

fn harness_custom(
    fake: Arc<FakeSandbox>,
    config: Config,
    build_delay: Option<Duration>,
) -> Harness {
    let (queue, events) = EventQueue::for_tests();
    let exit = Arc::new(ExitSignal::default());
    let factory = Arc::new(FakeFactory {
        sandbox: fake.clone(),
        build_delay,
    });
    let service = Service::new(RUNTIME_ID, "test.ns", config, factory, queue, exit.clone());
    Harness {
        service,
        events,
        exit,
        fake,
        dirs: Vec::new(),
    }
}

fn harness() -> Harness {
    harness_custom(FakeSandbox::new(false), Config::default(), None)
}

impl Harness {
    fn bundle(&mut self, annotations: &[(&str, &str)]) -> String {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            crate::utils::spec_json(annotations),
        )
        .unwrap();
        let path = dir.path().to_string_lossy().to_string();
        self.dirs.push(dir);
        path
    }

    fn sandbox_bundle(&mut self) -> String {
        self.bundle(&[(CRI_CONTAINER_TYPE, "sandbox")])
    }

    fn container_bundle(&mut self, sandbox_id: &str) -> String {
        self.bundle(&[
            (CRI_CONTAINER_TYPE, "container"),
            (CRI_SANDBOX_ID, sandbox_id),
        ])
    }

    fn create(&self, id: &str, bundle: &str) -> crate::error::Result<u32> {
        let mut req = CreateTaskRequest::new();
        req.set_id(id.to_string());
        req.set_bundle(bundle.to_string());
        self.service.do_create(req).map(|r| r.get_pid())
    }

    fn start(&self, id: &str, exec_id: &str) -> crate::error::Result<StartResponse> {
        let mut req = StartRequest::new();
        req.set_id(id.to_string());
        req.set_exec_id(exec_id.to_string());
        self.service.do_start(req)
    }

    fn exec(&self, id: &str, exec_id: &str) -> crate::error::Result<Empty> {
        let mut any = Any::new();
        any.set_type_url("types.containerd.io/opencontainers/runtime-spec/1.0/Process".to_string());
        any.set_value(serde_json::to_vec(&Process::default()).unwrap());
        let mut req = ExecProcessRequest::new();
        req.set_id(id.to_string());
        req.set_exec_id(exec_id.to_string());
        req.spec = SingularPtrField::some(any);
        self.service.do_exec(req)
    }

    fn kill(&self, id: &str, exec_id: &str, signal: u32) -> crate::error::Result<Empty> {
        let mut req = KillRequest::new();
        req.set_id(id.to_string());
        req.set_exec_id(exec_id.to_string());
        req.set_signal(signal);
        self.service.do_kill(req)
    }

    fn wait(&self, id: &str, exec_id: &str) -> WaitResponse {
        let mut req = WaitRequest::new();
        req.set_id(id.to_string());
        req.set_exec_id(exec_id.to_string());
        self.service.do_wait(req).unwrap()
    }

    fn state(&self, id: &str, exec_id: &str) -> StateResponse {
        let mut req = StateRequest::new();
        req.set_id(id.to_string());
        req.set_exec_id(exec_id.to_string());
        self.service.do_state(req).unwrap()
    }

    fn delete(&self, id: &str, exec_id: &str) -> crate::error::Result<DeleteResponse> {
        let mut req = DeleteRequest::new();
        req.set_id(id.to_string());
        req.set_exec_id(exec_id.to_string());
        self.service.do_delete(req)
    }

    fn pause(&self, id: &str) -> crate::error::Result<Empty> {
        let mut req = PauseRequest::new();
        req.set_id(id.to_string());
        self.service.do_pause(req)
    }

    fn resume(&self, id: &str) -> crate::error::Result<Empty> {
        let mut req = ResumeRequest::new();
        req.set_id(id.to_string());
        self.service.do_resume(req)
    }

    fn next_topic(&self) -> String {
        self.events
            .recv_timeout(EVENT_TIMEOUT)
            .expect("timed out waiting for event")
            .0
    }

    fn assert_no_event_within(&self, ms: u64) {
        assert!(
            self.events.recv_timeout(Duration::from_millis(ms)).is_err(),
            "unexpected event"
        );
    }
}

fn exit_signaled(exit: &Arc<ExitSignal>, wait_ms: u64) -> bool {
    let (tx, rx) = sync_channel(1);
    let exit = exit.clone();
    thread::spawn(move || {
        exit.wait();
        let _ = tx.send(());
    });
    rx.recv_timeout(Duration::from_millis(wait_ms)).is_ok()
}

#[test]
fn sandbox_and_pod_container_lifecycle() {
    let mut h = harness();
    let sb = h.sandbox_bundle();
    assert_eq!(h.create("s1", &sb).unwrap(), HYPERVISOR_PID);
    assert_eq!(h.next_topic(), TASK_CREATE_TOPIC);

    let cb = h.container_bundle("s1");
    assert_eq!(h.create("c1", &cb).unwrap(), HYPERVISOR_PID);
    assert_eq!(h.next_topic(), TASK_CREATE_TOPIC);

    assert_eq!(h.start("c1", "").unwrap().get_pid(), HYPERVISOR_PID);
    assert_eq!(h.next_topic(), TASK_START_TOPIC);
    assert_eq!(h.state("c1", "").get_status(), Status::RUNNING);

    h.kill("c1", "", 9).unwrap();
    assert_eq!(h.wait("c1", "").get_exit_status(), 137);
    // start was emitted strictly before the exit of the same process
    assert_eq!(h.next_topic(), TASK_EXIT_TOPIC);
    assert_eq!(h.state("c1", "").get_status(), Status::STOPPED);
    assert!(h.fake.stopped("c1"));

    let del = h.delete("c1", "").unwrap();
    assert_eq!(del.get_exit_status(), 137);
    assert_eq!(del.get_pid(), HYPERVISOR_PID);
    assert_eq!(h.next_topic(), TASK_DELETE_TOPIC);
    assert!(matches!(h.delete("c1", ""), Err(Error::NotFound(_))));
}

#[test]
fn exec_lifecycle() {
    let mut h = harness();
    let sb = h.sandbox_bundle();
    h.create("s1", &sb).unwrap();
    let cb = h.container_bundle("s1");
    h.create("c1", &cb).unwrap();
    h.start("c1", "").unwrap();
    for _ in 0..3 {
        h.next_topic();
    }

    h.exec("c1", "e1").unwrap();
    assert_eq!(h.next_topic(), TASK_EXEC_ADDED_TOPIC);
    assert!(matches!(h.exec("c1", "e1"), Err(Error::AlreadyExists(_))));

    h.start("c1", "e1").unwrap();
    assert_eq!(h.next_topic(), TASK_EXEC_STARTED_TOPIC);
    assert_eq!(h.state("c1", "e1").get_status(), Status::RUNNING);

    h.fake.finish("c1", "e1", 3);
    assert_eq!(h.wait("c1", "e1").get_exit_status(), 3);
    // repeated waits observe the same code
    assert_eq!(h.wait("c1", "e1").get_exit_status(), 3);
    assert_eq!(h.next_topic(), TASK_EXIT_TOPIC);

    h.delete("c1", "e1").unwrap();
    assert!(matches!(h.state_err("c1", "e1"), Err(Error::NotFound(_))));

    // an exec that never started has no process to signal
    h.exec("c1", "e2").unwrap();
    h.next_topic();
    assert!(matches!(
        h.kill("c1", "e2", 9),
        Err(Error::FailedPrecondition(_))
    ));
}

#[test]
fn create_boundaries() {
    let mut h = harness();
    assert!(matches!(
        h.create("", "/nonexistent"),
        Err(Error::InvalidArgument(_))
    ));

    let cb = h.container_bundle("s1");
    assert!(matches!(
        h.create("c1", &cb),
        Err(Error::FailedPrecondition(_))
    ));

    let sb = h.sandbox_bundle();
    h.create("s1", &sb).unwrap();
    h.next_topic();

    assert!(matches!(h.create("s1", &sb), Err(Error::AlreadyExists(_))));
    let sb2 = h.sandbox_bundle();
    assert!(matches!(h.create("s2", &sb2), Err(Error::AlreadyExists(_))));

    let empty = TempDir::new().unwrap();
    assert!(matches!(
        h.create("c2", &empty.path().to_string_lossy()),
        Err(Error::InvalidArgument(_))
    ));

    // update with a payload that is not a resource document
    let cb = h.container_bundle("s1");
    h.create("c1", &cb).unwrap();
    h.next_topic();
    let mut bad = Any::new();
    bad.set_value(b"not json".to_vec());
    let mut req = UpdateTaskRequest::new();
    req.set_id("c1".to_string());
    req.resources = SingularPtrField::some(bad);
    assert!(matches!(
        h.service.do_update(req),
        Err(Error::InvalidArgument(_))
    ));
    let mut ok = Any::new();
    ok.set_value(serde_json::to_vec(&LinuxResources::default()).unwrap());
    let mut req = UpdateTaskRequest::new();
    req.set_id("c1".to_string());
    req.resources = SingularPtrField::some(ok);
    h.service.do_update(req).unwrap();
}

#[test]
fn pause_resume_and_unknown_status() {
    let mut h = harness();
    let sb = h.sandbox_bundle();
    h.create("s1", &sb).unwrap();
    let cb = h.container_bundle("s1");
    h.create("c1", &cb).unwrap();
    h.start("c1", "").unwrap();
    for _ in 0..3 {
        h.next_topic();
    }

    h.pause("c1").unwrap();
    assert_eq!(h.next_topic(), TASK_PAUSED_TOPIC);
    assert_eq!(h.state("c1", "").get_status(), Status::PAUSED);

    h.resume("c1").unwrap();
    assert_eq!(h.next_topic(), TASK_RESUMED_TOPIC);
    assert_eq!(h.state("c1", "").get_status(), Status::RUNNING);

    h.pause("c1").unwrap();
    h.next_topic();

    // pausing an already paused container fails in the guest; when the
    // status cannot be re-read either, it degrades to unknown
    h.fake.fail_pause.store(true, Ordering::Relaxed);
    h.fake.fail_status.store(true, Ordering::Relaxed);
    assert!(h.pause("c1").is_err());
    assert_eq!(h.state("c1", "").get_status(), Status::UNKNOWN);
    h.assert_no_event_within(100);
}

#[test]
fn watcher_tears_down_on_sandbox_failure() {
    let mut h = harness_custom(FakeSandbox::new(true), Config::default(), None);
    let sb = h.sandbox_bundle();
    h.create("s1", &sb).unwrap();
    h.next_topic();

    h.fake.fail_sandbox("hypervisor exited unexpectedly");
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !(h.fake.sandbox_stopped.load(Ordering::Relaxed)
        && h.fake.sandbox_shutdown.load(Ordering::Relaxed))
    {
        assert!(std::time::Instant::now() < deadline, "watcher never ran");
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn shutdown_ref_counts_containers() {
    let mut h = harness();
    let sb = h.sandbox_bundle();
    h.create("s1", &sb).unwrap();
    let cb = h.container_bundle("s1");
    h.create("c1", &cb).unwrap();
    h.start("c1", "").unwrap();
    h.start("s1", "").unwrap();

    // containers remain: shutdown succeeds without terminating
    h.service.do_shutdown().unwrap();
    assert!(!exit_signaled(&h.exit, 200));

    h.kill("c1", "", 9).unwrap();
    h.wait("c1", "");
    h.delete("c1", "").unwrap();

    h.service.do_shutdown().unwrap();
    assert!(!exit_signaled(&h.exit, 200));

    h.kill("s1", "", 9).unwrap();
    h.wait("s1", "");
    h.delete("s1", "").unwrap();
    assert!(h.fake.sandbox_stopped.load(Ordering::Relaxed));

    h.service.do_shutdown().unwrap();
    assert!(exit_signaled(&h.exit, 2000));
}

#[test]
fn double_sigkill_on_stopped_container_is_idempotent() {
    let mut h = harness();
    let sb = h.sandbox_bundle();
    h.create("s1", &sb).unwrap();
    let cb = h.container_bundle("s1");
    h.create("c1", &cb).unwrap();
    h.start("c1", "").unwrap();
    h.kill("c1", "", 9).unwrap();
    h.wait("c1", "");
    for _ in 0..4 {
        h.next_topic();
    }

    h.kill("c1", "", 9).unwrap();
    h.kill("c1", "", 15).unwrap();
    h.assert_no_event_within(300);
}

#[test]
fn oom_event_emits_and_writes_crio_marker() {
    let mut h = harness();
    let sb = h.sandbox_bundle();
    h.create("s1", &sb).unwrap();
    let cb = h.bundle(&[(CRIO_CONTAINER_TYPE, "container"), (CRIO_SANDBOX_ID, "s1")]);
    h.create("c1", &cb).unwrap();
    h.next_topic();
    h.next_topic();

    h.fake.trigger_oom("c1");
    assert_eq!(h.next_topic(), TASK_OOM_TOPIC);
    assert!(std::path::Path::new(&cb).join("oom").exists());
}

#[test]
fn stats_pids_and_connect_report_hypervisor_view() {
    let mut h = harness();
    let sb = h.sandbox_bundle();
    h.create("s1", &sb).unwrap();
    h.next_topic();

    let mut req = StatsRequest::new();
    req.set_id("s1".to_string());
    let stats = h.service.do_stats(req).unwrap();
    assert!(stats.stats.is_some());

    let mut req = PidsRequest::new();
    req.set_id("s1".to_string());
    let pids = h.service.do_pids(req).unwrap();
    assert_eq!(pids.processes.len(), 1);
    assert_eq!(pids.processes[0].get_pid(), HYPERVISOR_PID);

    let resp = h
        .service
        .do_connect(containerd_shim::api::ConnectRequest::new())
        .unwrap();
    assert_eq!(resp.get_shim_pid(), std::process::id());
    assert_eq!(resp.get_task_pid(), HYPERVISOR_PID);
    assert_eq!(resp.get_version(), RUNTIME_ID);
}

#[test]
fn create_races_the_configured_deadline() {
    let mut config = Config::default();
    config.create_timeout_secs = 1;
    let mut h = harness_custom(
        FakeSandbox::new(false),
        config,
        Some(Duration::from_secs(3)),
    );
    let sb = h.sandbox_bundle();
    assert!(matches!(h.create("s1", &sb), Err(Error::CreateTimeout)));
}

impl Harness {
    fn state_err(&self, id: &str, exec_id: &str) -> crate::error::Result<StateResponse> {
        let mut req = StateRequest::new();
        req.set_id(id.to_string());
        req.set_exec_id(exec_id.to_string());
        self.service.do_state(req)
    }
}
