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

//! Shim runtime serving the containerd task API for VM-isolated pods.
//!
//! One shim process serves one sandbox: a lightweight VM hosting the
//! containers of a pod. The crate implements the host-side runtime core;
//! the hypervisor and guest agent are reached only through the capability
//! traits of `containerd-vm-sandbox`. A backend crate wires its factory
//! into [`run`] from a small `main`:
//!
//! ```ignore
//! fn main() {
//!     containerd_shim_vm::run("io.containerd.vm.v2", Arc::new(MyVmFactory::default()));
//! }
//! ```

use std::io::Write;
use std::sync::Arc;

use containerd_shim::protos::protobuf::Message;

use containerd_vm_sandbox::SandboxFactory;

mod bootstrap;
mod config;
mod container;
mod error;
mod events;
mod flags;
mod io;
mod logger;
mod manager;
mod metrics;
mod reaper;
mod service;
mod utils;
mod watcher;

pub use config::{Config, CONF_FILE_ENV};
pub use error::{Error, Result};
pub use service::Service;

pub use containerd_vm_sandbox as sandbox;

/// Entry point for a shim binary.
///
/// `runtime_id` is the runtime identifier the shim answers `Connect`
/// requests with. Dispatches the shim-v2 invocation protocol: `start`
/// prints the task socket address, `delete` emits a protobuf delete
/// response on stdout, and an action-less invocation serves the task API
/// until shutdown.
pub fn run(runtime_id: &str, factory: Arc<dyn SandboxFactory>) {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(e) = dispatch(runtime_id, &args, factory) {
        eprintln!("containerd-shim-vm: {}", e);
        std::process::exit(1);
    }
}

fn dispatch(runtime_id: &str, args: &[String], factory: Arc<dyn SandboxFactory>) -> Result<()> {
    let flags = flags::parse(args)?;
    match flags.action.as_str() {
        "start" => {
            let address = manager::start(&flags)?;
            let mut stdout = std::io::stdout();
            write!(stdout, "{}", address)?;
            stdout.flush()?;
            Ok(())
        }
        "delete" => {
            let resp = manager::stop(&flags)?;
            let bytes = resp
                .write_to_bytes()
                .map_err(|e| Error::Other(format!("marshal delete response: {}", e)))?;
            std::io::stdout().write_all(&bytes)?;
            Ok(())
        }
        "" => bootstrap::serve(runtime_id, flags, factory),
        other => Err(Error::InvalidArgument(format!("unknown action {}", other))),
    }
}
