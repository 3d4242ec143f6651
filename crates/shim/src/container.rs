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

//! Container and exec entities held by the task service registry.
//!
//! All status transitions happen while the registry mutex is held; the
//! fields here are plain data, intentionally without interior locking.

use std::collections::HashMap;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use containerd_shim::api::Status;
use oci_spec::runtime::{Process, Spec};

use crate::error::{Error, Result};
use crate::io::{Stdio, TtyIo};

/// CRI annotation carrying the container type ("sandbox" / "container").
pub const CRI_CONTAINER_TYPE: &str = "io.kubernetes.cri.container-type";
pub const CRI_SANDBOX_ID: &str = "io.kubernetes.cri.sandbox-id";
/// CRI-O spells the same pair differently.
pub const CRIO_CONTAINER_TYPE: &str = "io.kubernetes.cri-o.ContainerType";
pub const CRIO_SANDBOX_ID: &str = "io.kubernetes.cri-o.SandboxID";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    /// The pod sandbox itself; owns the VM lifetime.
    PodSandbox,
    /// A workload container inside an existing pod sandbox.
    PodContainer,
    /// A container launched outside any pod; gets a VM of its own.
    SingleContainer,
}

impl ContainerKind {
    pub fn from_spec(spec: &Spec) -> ContainerKind {
        match annotation(spec, CRI_CONTAINER_TYPE)
            .or_else(|| annotation(spec, CRIO_CONTAINER_TYPE))
            .as_deref()
        {
            Some("sandbox") | Some("podsandbox") => ContainerKind::PodSandbox,
            Some("container") => ContainerKind::PodContainer,
            _ => ContainerKind::SingleContainer,
        }
    }

    /// Whether this container's lifetime is the sandbox lifetime.
    pub fn is_sandbox(self) -> bool {
        matches!(
            self,
            ContainerKind::PodSandbox | ContainerKind::SingleContainer
        )
    }
}

pub fn annotation(spec: &Spec, key: &str) -> Option<String> {
    spec.annotations()
        .as_ref()
        .and_then(|a| a.get(key))
        .cloned()
}

pub fn sandbox_id(spec: &Spec) -> Option<String> {
    annotation(spec, CRI_SANDBOX_ID).or_else(|| annotation(spec, CRIO_SANDBOX_ID))
}

pub fn is_crio_managed(spec: &Spec) -> bool {
    annotation(spec, CRIO_CONTAINER_TYPE).is_some()
}

/// Single-slot exit code latch.
///
/// The reaper feeds the value exactly once; every reader takes it and
/// immediately re-feeds it, so any number of waiters, in any order,
/// observe the same code.
#[derive(Clone)]
pub struct ExitLatch {
    tx: SyncSender<i32>,
    rx: Arc<Mutex<Receiver<i32>>>,
}

impl ExitLatch {
    pub fn new() -> Self {
        let (tx, rx) = sync_channel(1);
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Feeds the latch. A second feed is dropped on the floor rather than
    /// blocking, keeping the exactly-once contract cheap to enforce.
    pub fn set(&self, code: i32) {
        let _ = self.tx.try_send(code);
    }

    /// Blocks until the latch holds a value, re-feeds it, and returns it.
    pub fn wait(&self) -> i32 {
        let rx = self.rx.lock().unwrap();
        let code = rx.recv().unwrap_or(255);
        let _ = self.tx.try_send(code);
        code
    }
}

pub struct Exec {
    pub id: String,
    pub spec: Process,
    pub stdio: Stdio,
    pub status: Status,
    /// In-guest pid, resolved only once the exec has been started.
    pub pid: Option<u32>,
    pub exit_code: i32,
    pub exited_at: Option<DateTime<Utc>>,
    pub tty: Option<TtyIo>,
    pub exit: ExitLatch,
}

impl Exec {
    pub fn new(id: &str, spec: Process, stdio: Stdio) -> Self {
        Self {
            id: id.to_string(),
            spec,
            stdio,
            status: Status::CREATED,
            pid: None,
            exit_code: 0,
            exited_at: None,
            tty: None,
            exit: ExitLatch::new(),
        }
    }

    pub fn set_stopped(&mut self, code: i32, at: DateTime<Utc>) {
        self.exit_code = code;
        self.exited_at = Some(at);
        self.status = Status::STOPPED;
        self.exit.set(code);
    }
}

pub struct Container {
    pub id: String,
    pub bundle: String,
    pub kind: ContainerKind,
    pub stdio: Stdio,
    pub spec: Spec,
    /// The shim host-mounted `<bundle>/rootfs` and owns its unmount.
    pub rootfs_mounted: bool,
    pub status: Status,
    pub exit_code: i32,
    pub exited_at: Option<DateTime<Utc>>,
    pub tty: Option<TtyIo>,
    pub exit: ExitLatch,
    pub execs: HashMap<String, Exec>,
}

impl Container {
    pub fn new(
        id: &str,
        bundle: &str,
        kind: ContainerKind,
        stdio: Stdio,
        spec: Spec,
        rootfs_mounted: bool,
    ) -> Self {
        Self {
            id: id.to_string(),
            bundle: bundle.to_string(),
            kind,
            stdio,
            spec,
            rootfs_mounted,
            status: Status::CREATED,
            exit_code: 0,
            exited_at: None,
            tty: None,
            exit: ExitLatch::new(),
            execs: HashMap::new(),
        }
    }

    pub fn exec(&self, exec_id: &str) -> Result<&Exec> {
        self.execs
            .get(exec_id)
            .ok_or_else(|| Error::NotFound(format!("exec {}", exec_id)))
    }

    pub fn exec_mut(&mut self, exec_id: &str) -> Result<&mut Exec> {
        self.execs
            .get_mut(exec_id)
            .ok_or_else(|| Error::NotFound(format!("exec {}", exec_id)))
    }

    pub fn set_stopped(&mut self, code: i32, at: DateTime<Utc>) {
        self.exit_code = code;
        self.exited_at = Some(at);
        self.status = Status::STOPPED;
        self.exit.set(code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn spec_with(annotations: &[(&str, &str)]) -> Spec {
        serde_json::from_str(&crate::utils::spec_json(annotations)).unwrap()
    }

    #[test]
    fn kind_resolution() {
        let sb = spec_with(&[(CRI_CONTAINER_TYPE, "sandbox")]);
        assert_eq!(ContainerKind::from_spec(&sb), ContainerKind::PodSandbox);

        let pc = spec_with(&[(CRI_CONTAINER_TYPE, "container"), (CRI_SANDBOX_ID, "s1")]);
        assert_eq!(ContainerKind::from_spec(&pc), ContainerKind::PodContainer);
        assert_eq!(sandbox_id(&pc).as_deref(), Some("s1"));

        let crio = spec_with(&[(CRIO_CONTAINER_TYPE, "container"), (CRIO_SANDBOX_ID, "s2")]);
        assert_eq!(ContainerKind::from_spec(&crio), ContainerKind::PodContainer);
        assert_eq!(sandbox_id(&crio).as_deref(), Some("s2"));
        assert!(is_crio_managed(&crio));

        let bare = spec_with(&[]);
        assert_eq!(ContainerKind::from_spec(&bare), ContainerKind::SingleContainer);
        assert!(ContainerKind::from_spec(&bare).is_sandbox());
        assert!(!is_crio_managed(&bare));
    }

    #[test]
    fn exit_latch_refeeds_for_every_waiter() {
        let latch = ExitLatch::new();
        latch.set(137);
        assert_eq!(latch.wait(), 137);
        assert_eq!(latch.wait(), 137);

        let latch2 = latch.clone();
        let handle = thread::spawn(move || latch2.wait());
        assert_eq!(handle.join().unwrap(), 137);
        assert_eq!(latch.wait(), 137);
    }

    #[test]
    fn exit_latch_second_set_is_ignored() {
        let latch = ExitLatch::new();
        latch.set(3);
        latch.set(4);
        assert_eq!(latch.wait(), 3);
    }

    #[test]
    fn container_stop_records_exit() {
        let mut c = Container::new(
            "c1",
            "/b/c1",
            ContainerKind::PodContainer,
            Stdio::default(),
            Spec::default(),
            false,
        );
        assert_eq!(c.status, Status::CREATED);
        let now = Utc::now();
        c.set_stopped(137, now);
        assert_eq!(c.status, Status::STOPPED);
        assert_eq!(c.exit_code, 137);
        assert_eq!(c.exited_at, Some(now));
        assert_eq!(c.exit.wait(), 137);
    }
}
