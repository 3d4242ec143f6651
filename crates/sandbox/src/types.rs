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

use std::fmt;
use std::io::{Read, Write};

use oci_spec::runtime::Spec;

/// Everything a backend needs to boot the VM for one pod.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub id: String,
    pub namespace: String,
    pub bundle: String,
    pub rootfs: Vec<Rootfs>,
    pub spec: Spec,
}

/// One rootfs source for a container, as handed to the guest.
///
/// `host_mounted` tells the backend the shim already assembled the rootfs
/// under the bundle; the alternative is a block device or a layered
/// source the guest mounts itself.
#[derive(Debug, Clone, Default)]
pub struct Rootfs {
    pub source: String,
    pub fs_type: String,
    pub options: Vec<String>,
    pub host_mounted: bool,
}

/// Container status as reported by the guest agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestStatus {
    Created,
    Running,
    Paused,
    Stopped,
}

impl fmt::Display for GuestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GuestStatus::Created => "created",
            GuestStatus::Running => "running",
            GuestStatus::Paused => "paused",
            GuestStatus::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Byte streams of one in-guest process.
///
/// Streams that the process was created without (no stdin, or a terminal
/// where stderr is interleaved on stdout) are `None`.
#[derive(Default)]
pub struct ProcessStreams {
    pub stdin: Option<Box<dyn Write + Send>>,
    pub stdout: Option<Box<dyn Read + Send>>,
    pub stderr: Option<Box<dyn Read + Send>>,
}

impl fmt::Debug for ProcessStreams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessStreams")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

/// Resource usage of one container, read through the guest agent.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerStats {
    pub cpu_usage_ns: u64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    pub pids_current: u64,
}
