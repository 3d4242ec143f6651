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

use std::fs;
use std::time::Duration;

use log::warn;
use serde::Deserialize;

use crate::error::Result;

/// Environment variable naming a TOML file with the settings below.
pub const CONF_FILE_ENV: &str = "VM_SHIM_CONF_FILE";

const DEFAULT_CREATE_TIMEOUT_SECS: u64 = 45;

/// Runtime configuration of one shim process.
///
/// The full hypervisor configuration belongs to the sandbox backend; only
/// the knobs the task service itself consults live here.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub debug: bool,
    /// Refuse block-device rootfs passthrough and host-mount instead.
    pub disable_block_device_use: bool,
    pub create_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            disable_block_device_use: false,
            create_timeout_secs: DEFAULT_CREATE_TIMEOUT_SECS,
        }
    }
}

impl Config {
    /// Loads the configuration from the file named by `VM_SHIM_CONF_FILE`,
    /// falling back to defaults when unset. A present but unreadable file
    /// is an error; unknown keys are ignored.
    pub fn load() -> Result<Self> {
        match std::env::var(CONF_FILE_ENV) {
            Ok(path) if !path.is_empty() => {
                let raw = fs::read_to_string(&path)?;
                let cfg = toml::from_str(&raw)
                    .map_err(|e| crate::error::Error::InvalidArgument(format!(
                        "config file {}: {}",
                        path, e
                    )))?;
                Ok(cfg)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn create_timeout(&self) -> Duration {
        if self.create_timeout_secs == 0 {
            warn!("create_timeout_secs is 0, using default");
            return Duration::from_secs(DEFAULT_CREATE_TIMEOUT_SECS);
        }
        Duration::from_secs(self.create_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert!(!cfg.debug);
        assert!(!cfg.disable_block_device_use);
        assert_eq!(cfg.create_timeout(), Duration::from_secs(45));
    }

    #[test]
    fn parses_partial_toml() {
        let cfg: Config = toml::from_str("debug = true\n").unwrap();
        assert!(cfg.debug);
        assert_eq!(cfg.create_timeout_secs, 45);
    }

    #[test]
    fn ignores_unknown_keys() {
        let cfg: Config = toml::from_str("debug = true\nhypervisor_path = \"/usr/bin/qemu\"\n")
            .unwrap();
        assert!(cfg.debug);
    }
}
