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

//! Go-style flag parsing for the shim-v2 invocation contract:
//! `shim -namespace <ns> -address <addr> -publish-binary <bin> -id <id>
//! [-bundle <dir>] [-debug] [start|delete]`.

use crate::error::{Error, Result};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Flags {
    pub debug: bool,
    pub id: String,
    pub namespace: String,
    /// Address of the containerd socket the shim was launched by.
    pub address: String,
    /// Binary containerd points at for event publication.
    pub publish_binary: String,
    pub bundle: String,
    /// `start`, `delete`, or empty for the long-running task service.
    pub action: String,
}

pub fn parse(args: &[String]) -> Result<Flags> {
    let mut flags = Flags::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let name = arg.trim_start_matches('-');
        if name == arg.as_str() {
            // positional: the invocation action
            flags.action = arg.clone();
            continue;
        }
        match name {
            "debug" => flags.debug = true,
            "id" | "namespace" | "address" | "publish-binary" | "bundle" => {
                let value = iter
                    .next()
                    .ok_or_else(|| Error::InvalidArgument(format!("flag -{} needs a value", name)))?
                    .clone();
                match name {
                    "id" => flags.id = value,
                    "namespace" => flags.namespace = value,
                    "address" => flags.address = value,
                    "publish-binary" => flags.publish_binary = value,
                    "bundle" => flags.bundle = value,
                    _ => unreachable!(),
                }
            }
            // flags owned by outer tooling (e.g. -v) are tolerated
            _ => {}
        }
    }
    Ok(flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &[&str]) -> Vec<String> {
        s.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn parses_start_invocation() {
        let f = parse(&args(&[
            "-namespace",
            "k8s.io",
            "-address",
            "/run/containerd/containerd.sock",
            "-publish-binary",
            "containerd",
            "-id",
            "s1",
            "-debug",
            "start",
        ]))
        .unwrap();
        assert_eq!(f.namespace, "k8s.io");
        assert_eq!(f.address, "/run/containerd/containerd.sock");
        assert_eq!(f.publish_binary, "containerd");
        assert_eq!(f.id, "s1");
        assert!(f.debug);
        assert_eq!(f.action, "start");
    }

    #[test]
    fn serve_invocation_has_no_action() {
        let f = parse(&args(&["-namespace", "default", "-id", "s1"])).unwrap();
        assert_eq!(f.action, "");
        assert!(!f.debug);
    }

    #[test]
    fn missing_value_is_invalid() {
        assert!(parse(&args(&["-id"])).is_err());
    }
}
