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

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use containerd_shim::protos::protobuf::well_known_types::{Any, Timestamp};
use containerd_shim::protos::protobuf::{Message, SingularPtrField};
use log::warn;
use nix::mount::{mount, MsFlags};
use nix::sys::stat::{stat, SFlag};
use oci_spec::runtime::Spec;
use sys_mount::UnmountFlags;
use uuid::Uuid;

use crate::error::{Error, Result};

pub const SOCKET_ROOT: &str = "/run/containerd/vm";

pub fn timestamp(t: DateTime<Utc>) -> Timestamp {
    let mut ts = Timestamp::new();
    ts.set_seconds(t.timestamp());
    ts.set_nanos(t.timestamp_subsec_nanos() as i32);
    ts
}

pub fn option_timestamp(t: Option<DateTime<Utc>>) -> SingularPtrField<Timestamp> {
    SingularPtrField::from_option(t.map(timestamp))
}

/// Packs a protobuf message into an `Any`, typed by its full proto name
/// the way containerd's typeurl does for proto types.
pub fn to_any(m: &dyn Message) -> Result<Any> {
    let mut any = Any::new();
    any.set_type_url(m.descriptor().full_name().to_string());
    any.set_value(
        m.write_to_bytes()
            .map_err(|e| Error::Other(format!("marshal {}: {}", m.descriptor().name(), e)))?,
    );
    Ok(any)
}

pub fn read_spec(bundle: &Path) -> Result<Spec> {
    Spec::load(bundle.join("config.json"))
        .map_err(|e| Error::InvalidArgument(format!("load bundle spec: {}", e)))
}

/// Task API identifier rule: leading alphanumeric, then alphanumerics,
/// `_`, `.` or `-`.
pub fn validate_id(id: &str) -> Result<()> {
    let mut chars = id.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!("invalid id {:?}", id)))
    }
}

/// Deterministic task socket address for one sandbox, computable by both
/// the spawning side and a later `start` that only knows the sandbox id.
pub fn socket_address(containerd_address: &str, namespace: &str, id: &str) -> String {
    let name = format!("{}/{}/{}", containerd_address, namespace, id);
    let sock = Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes());
    format!("unix://{}/{}.sock", SOCKET_ROOT, sock)
}

pub fn socket_path(address: &str) -> &str {
    address.trim_start_matches("unix://")
}

pub fn is_block_device(path: &str) -> bool {
    match stat(path) {
        Ok(st) => SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT == SFlag::S_IFBLK,
        Err(_) => false,
    }
}

/// Mounts one rootfs layer onto `target`, translating fstab-style options
/// into mount flags and passing the remainder as mount data.
pub fn mount_at(source: &str, fs_type: &str, options: &[String], target: &Path) -> Result<()> {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();
    for opt in options {
        match opt.as_str() {
            "bind" => flags |= MsFlags::MS_BIND,
            "rbind" => flags |= MsFlags::MS_BIND | MsFlags::MS_REC,
            "ro" => flags |= MsFlags::MS_RDONLY,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "remount" => flags |= MsFlags::MS_REMOUNT,
            "relatime" => flags |= MsFlags::MS_RELATIME,
            other => data.push(other.to_string()),
        }
    }
    let data = data.join(",");
    let fs_type = if fs_type.is_empty() { None } else { Some(fs_type) };
    let data = if data.is_empty() {
        None
    } else {
        Some(data.as_str())
    };
    mount(Some(source), target, fs_type, flags, data)
        .map_err(|e| Error::Other(format!("mount {} on {}: {}", source, target.display(), e)))
}

pub fn unmount(path: &Path) {
    if let Err(e) = sys_mount::unmount(path, UnmountFlags::empty()) {
        warn!("failed to unmount {}: {}", path.display(), e);
    }
}

/// Scoped ownership of a freshly mounted rootfs: unless disarmed, the
/// mount is rolled back on drop so no error path leaks it.
pub struct MountGuard {
    path: Option<PathBuf>,
}

impl MountGuard {
    pub fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    pub fn unarmed() -> Self {
        Self { path: None }
    }

    pub fn armed(&self) -> bool {
        self.path.is_some()
    }

    pub fn disarm(&mut self) {
        self.path = None;
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            unmount(&path);
        }
    }
}

/// Minimal bundle spec document for tests.
#[cfg(test)]
pub fn spec_json(annotations: &[(&str, &str)]) -> String {
    let map: serde_json::Map<String, serde_json::Value> = annotations
        .iter()
        .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
        .collect();
    serde_json::json!({ "ociVersion": "1.0.2", "annotations": map }).to_string()
}
