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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The guest agent connection is gone. Pollers treat this as the end
    /// of the sandbox, not as a retryable error.
    #[error("agent connection closed")]
    AgentClosed,

    #[error("hypervisor: {0}")]
    Hypervisor(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
