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

//! Lifecycle front door: the `start` and `delete` invocations a container
//! runtime performs against the shim binary, distinct from the task RPCs.

use std::env;
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

use chrono::Utc;
use containerd_shim::api::DeleteResponse;
use containerd_shim::protos::protobuf::SingularPtrField;
use nix::unistd::setsid;

use crate::container::{sandbox_id, ContainerKind};
use crate::error::{Error, Result};
use crate::flags::Flags;
use crate::utils;

pub const SHIM_PID_FILE: &str = "shim.pid";
pub const ADDRESS_FILE: &str = "address";

/// Brings up or attaches to a shim for the bundle in the working
/// directory and returns the task socket address.
///
/// A pod container joins the shim of its sandbox: the address is derived
/// from the sandbox id and no process is spawned. Everything else gets a
/// freshly spawned shim serving the task API.
pub fn start(flags: &Flags) -> Result<String> {
    let bundle = bundle_dir(flags)?;
    let spec = utils::read_spec(Path::new(&bundle))?;

    let address = match ContainerKind::from_spec(&spec) {
        ContainerKind::PodContainer => {
            let sandbox = sandbox_id(&spec).ok_or_else(|| {
                Error::InvalidArgument("pod container carries no sandbox id".to_string())
            })?;
            utils::socket_address(&flags.address, &flags.namespace, &sandbox)
        }
        _ => {
            let address = utils::socket_address(&flags.address, &flags.namespace, &flags.id);
            let pid = spawn_shim(flags, &bundle)?;
            fs::write(Path::new(&bundle).join(SHIM_PID_FILE), format!("{}\n", pid))?;
            address
        }
    };

    fs::write(Path::new(&bundle).join(ADDRESS_FILE), &address)?;
    Ok(address)
}

/// Cleans up the bundle of a shim that is gone or being discarded.
///
/// Unmount errors are swallowed; the response mirrors a process killed by
/// SIGKILL, which is what the runtime expects from a forced cleanup.
pub fn stop(flags: &Flags) -> Result<DeleteResponse> {
    let bundle = bundle_dir(flags)?;
    if let Err(e) = utils::read_spec(Path::new(&bundle)) {
        log::warn!("cleanup of {} without readable spec: {}", bundle, e);
    }
    utils::unmount(&Path::new(&bundle).join("rootfs"));

    let mut resp = DeleteResponse::new();
    resp.set_exit_status(128 + libc::SIGKILL as u32);
    resp.exited_at = SingularPtrField::some(utils::timestamp(Utc::now()));
    Ok(resp)
}

fn bundle_dir(flags: &Flags) -> Result<String> {
    if !flags.bundle.is_empty() {
        return Ok(flags.bundle.clone());
    }
    Ok(env::current_dir()?.to_string_lossy().to_string())
}

fn spawn_shim(flags: &Flags, bundle: &str) -> Result<u32> {
    let exe = env::current_exe()?;
    let mut cmd = Command::new(exe);
    cmd.current_dir(bundle)
        .arg("-namespace")
        .arg(&flags.namespace)
        .arg("-address")
        .arg(&flags.address)
        .arg("-publish-binary")
        .arg(&flags.publish_binary)
        .arg("-id")
        .arg(&flags.id)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if flags.debug {
        cmd.arg("-debug");
    }
    unsafe {
        use std::os::unix::process::CommandExt;
        // detach into its own session so runtime signals do not reach the
        // shim and the VM it supervises
        cmd.pre_exec(|| setsid().map(|_| ()).map_err(std::io::Error::from));
    }
    let child = cmd.spawn()?;
    Ok(child.id())
}
