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

//! Internal error kinds and their mapping onto ttrpc status codes.
//!
//! Task RPCs map errors at the service boundary only; everything below the
//! boundary propagates `Error` values unchanged.

use std::io;

use containerd_shim::protos::ttrpc;
use thiserror::Error;
use ttrpc::{Code, Status};

use containerd_vm_sandbox as sandbox;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("{0} is not implemented")]
    Unimplemented(String),

    #[error("create container timeout")]
    CreateTimeout,

    #[error(transparent)]
    Sandbox(#[from] sandbox::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    fn code(&self) -> Code {
        match self {
            Error::InvalidArgument(_) => Code::INVALID_ARGUMENT,
            Error::NotFound(_) => Code::NOT_FOUND,
            Error::AlreadyExists(_) => Code::ALREADY_EXISTS,
            Error::FailedPrecondition(_) => Code::FAILED_PRECONDITION,
            Error::Unimplemented(_) => Code::UNIMPLEMENTED,
            Error::CreateTimeout => Code::DEADLINE_EXCEEDED,
            Error::Sandbox(e) => sandbox_code(e),
            Error::Io(e) => io_code(e),
            Error::Other(_) => Code::UNKNOWN,
        }
    }
}

fn io_code(e: &io::Error) -> Code {
    match e.raw_os_error() {
        Some(errno) if errno == libc::EINVAL => Code::INVALID_ARGUMENT,
        Some(errno) if errno == libc::ENOENT => Code::NOT_FOUND,
        _ => Code::UNKNOWN,
    }
}

/// Backend errors are mostly opaque strings; the common "does not exist"
/// shapes still deserve a precise transport code.
fn sandbox_code(e: &sandbox::Error) -> Code {
    match e {
        sandbox::Error::NotFound(_) => Code::NOT_FOUND,
        sandbox::Error::InvalidArgument(_) => Code::INVALID_ARGUMENT,
        sandbox::Error::AgentClosed => Code::UNAVAILABLE,
        sandbox::Error::Io(io_err) => io_code(io_err),
        other => {
            let msg = other.to_string();
            if msg.contains("not found") || msg.contains("not exist") {
                Code::NOT_FOUND
            } else if msg.contains("invalid argument") {
                Code::INVALID_ARGUMENT
            } else {
                Code::UNKNOWN
            }
        }
    }
}

impl From<Error> for ttrpc::Error {
    fn from(e: Error) -> Self {
        let mut status = Status::new();
        status.set_code(e.code());
        status.set_message(e.to_string());
        ttrpc::Error::RpcStatus(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code_of(e: Error) -> Code {
        match ttrpc::Error::from(e) {
            ttrpc::Error::RpcStatus(s) => s.get_code(),
            _ => panic!("expected rpc status"),
        }
    }

    #[test]
    fn kinds_map_to_transport_codes() {
        assert_eq!(
            code_of(Error::InvalidArgument("id".into())),
            Code::INVALID_ARGUMENT
        );
        assert_eq!(code_of(Error::NotFound("c1".into())), Code::NOT_FOUND);
        assert_eq!(code_of(Error::AlreadyExists("e1".into())), Code::ALREADY_EXISTS);
        assert_eq!(
            code_of(Error::FailedPrecondition("no sandbox".into())),
            Code::FAILED_PRECONDITION
        );
        assert_eq!(
            code_of(Error::Unimplemented("checkpoint".into())),
            Code::UNIMPLEMENTED
        );
        assert_eq!(code_of(Error::CreateTimeout), Code::DEADLINE_EXCEEDED);
    }

    #[test]
    fn sandbox_errors_map_by_substring() {
        assert_eq!(
            code_of(Error::Sandbox(sandbox::Error::Other(
                "container does not exist in guest".into()
            ))),
            Code::NOT_FOUND
        );
        assert_eq!(
            code_of(Error::Sandbox(sandbox::Error::Other("vsock hiccup".into()))),
            Code::UNKNOWN
        );
        assert_eq!(
            code_of(Error::Sandbox(sandbox::Error::AgentClosed)),
            Code::UNAVAILABLE
        );
    }

    #[test]
    fn einval_maps_to_invalid_argument() {
        let e = io::Error::from_raw_os_error(libc::EINVAL);
        assert_eq!(code_of(Error::Io(e)), Code::INVALID_ARGUMENT);
    }
}
