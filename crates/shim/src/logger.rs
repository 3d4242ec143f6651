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

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::sync::Mutex;

use chrono::Utc;
use log::{Log, Metadata, Record};

/// Logger for a shim process.
///
/// containerd creates a `log` FIFO in the working directory of every
/// shim-v2 it launches and tails the read side; when present the shim
/// writes there, otherwise to stderr.
pub struct ShimLogger {
    sink: Mutex<Box<dyn Write + Send>>,
}

impl ShimLogger {
    pub fn init(debug: bool) -> Result<(), log::SetLoggerError> {
        let sink: Box<dyn Write + Send> = match OpenOptions::new().write(true).open("log") {
            Ok(fifo) => Box::new(fifo),
            Err(_) => Box::new(io::stderr()),
        };
        log::set_boxed_logger(Box::new(ShimLogger {
            sink: Mutex::new(sink),
        }))?;
        log::set_max_level(if debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        });
        Ok(())
    }
}

impl Log for ShimLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut sink = self.sink.lock().unwrap();
        let _ = writeln!(
            sink,
            "time=\"{}\" level={} msg=\"{}\"",
            Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            record.level().to_string().to_lowercase(),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = self.sink.lock().unwrap().flush();
    }
}
