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

//! Relay between host stdio endpoints and in-guest process streams.
//!
//! The host side of each stream is selected by the URI scheme of the
//! stdout endpoint: named pipes (`fifo`, the default), an external logger
//! process (`binary`), or a single append-only log file (`file`). One
//! copier thread runs per wired direction, all sharing a small pool of
//! fixed-size buffers.

use std::fs::{DirBuilder, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::Path;
use std::process::{Child, Command, Stdio as ProcessStdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, warn};
use nix::fcntl::{self, OFlag};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::stat::Mode;
use once_cell::sync::Lazy;
use url::{ParseError, Url};

use containerd_vm_sandbox::ProcessStreams;

use crate::error::{Error, Result};

const BUF_SIZE: usize = 32 * 1024;
const POOL_LIMIT: usize = 16;
const STDIN_POLL_MS: libc::c_int = 200;

/// Environment handed to a `binary` scheme logger process.
const ENV_CONTAINER_ID: &str = "CONTAINER_ID";
const ENV_CONTAINER_NAMESPACE: &str = "CONTAINER_NAMESPACE";

static BUF_POOL: Lazy<Mutex<Vec<Vec<u8>>>> = Lazy::new(|| Mutex::new(Vec::new()));

fn take_buf() -> Vec<u8> {
    BUF_POOL
        .lock()
        .unwrap()
        .pop()
        .unwrap_or_else(|| vec![0u8; BUF_SIZE])
}

fn put_buf(buf: Vec<u8>) {
    let mut pool = BUF_POOL.lock().unwrap();
    if pool.len() < POOL_LIMIT {
        pool.push(buf);
    }
}

/// Stdio endpoints of one create/exec request.
#[derive(Debug, Clone, Default)]
pub struct Stdio {
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    pub terminal: bool,
}

impl Stdio {
    pub fn new(stdin: &str, stdout: &str, stderr: &str, terminal: bool) -> Self {
        Self {
            stdin: stdin.to_string(),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            terminal,
        }
    }

    pub fn is_null(&self) -> bool {
        self.stdin.is_empty() && self.stdout.is_empty() && self.stderr.is_empty()
    }
}

/// A one-shot completion signal; fires when the owning side drops its
/// sender. Cloneable so several observers can wait for the same edge.
#[derive(Clone)]
pub struct SignalChannel(Arc<Mutex<Receiver<()>>>);

impl SignalChannel {
    fn pair() -> (SyncSender<()>, SignalChannel) {
        let (tx, rx) = sync_channel(1);
        (tx, SignalChannel(Arc::new(Mutex::new(rx))))
    }

    /// An already-fired signal.
    pub fn fired() -> SignalChannel {
        let (_tx, ch) = Self::pair();
        ch
    }

    /// Blocks until the signal fires. Returns immediately for signals
    /// that already fired.
    pub fn wait(&self) {
        let rx = self.0.lock().unwrap();
        let _ = rx.recv();
    }
}

/// Handles to the relay of one process.
#[derive(Clone)]
pub struct TtyIo {
    /// Fires once the stdout and stderr copiers have drained.
    pub exit: SignalChannel,
    /// Fires once the stdin copier has delivered every host byte.
    pub stdin_closer: SignalChannel,
}

impl TtyIo {
    /// Relay for a process with no wired I/O.
    pub fn closed() -> TtyIo {
        TtyIo {
            exit: SignalChannel::fired(),
            stdin_closer: SignalChannel::fired(),
        }
    }
}

/// Writer shared by two copiers (binary logger stdin, single log file).
#[derive(Clone)]
struct SharedWriter(Arc<Mutex<Box<dyn Write + Send>>>);

impl SharedWriter {
    fn new(w: Box<dyn Write + Send>) -> Self {
        SharedWriter(Arc::new(Mutex::new(w)))
    }
}

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().unwrap().flush()
    }
}

fn copy_pooled<R: Read + ?Sized, W: Write + ?Sized>(r: &mut R, w: &mut W) -> io::Result<u64> {
    let mut buf = take_buf();
    let mut total = 0u64;
    let res = loop {
        match r.read(&mut buf) {
            Ok(0) => break Ok(total),
            Ok(n) => {
                if let Err(e) = w.write_all(&buf[..n]) {
                    break Err(e);
                }
                total += n as u64;
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => break Err(e),
        }
    };
    let _ = w.flush();
    put_buf(buf);
    res
}

fn open_fifo_rw(path: &str) -> Result<File> {
    // read-write so this side stays a permanent reader: writes never see
    // EPIPE while the peer closes and reopens its end
    let fd = fcntl::open(Path::new(path), OFlag::O_RDWR, Mode::empty())
        .map_err(|e| Error::Other(format!("open fifo {}: {}", path, e)))?;
    Ok(unsafe { File::from_raw_fd(fd) })
}

fn open_fifo_read_nonblock(path: &str) -> Result<File> {
    let fd = fcntl::open(
        Path::new(path),
        OFlag::O_RDONLY | OFlag::O_NONBLOCK,
        Mode::empty(),
    )
    .map_err(|e| Error::Other(format!("open fifo {}: {}", path, e)))?;
    Ok(unsafe { File::from_raw_fd(fd) })
}

fn open_log_file(path: &str) -> Result<File> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(parent)
                .map_err(|e| Error::Other(format!("create log dir for {}: {}", path, e)))?;
        }
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o640)
        .open(path)
        .map_err(|e| Error::Other(format!("open log file {}: {}", path, e)))
}

fn spawn_binary_logger(url: &Url, namespace: &str, container_id: &str) -> Result<Child> {
    let program = url.path();
    if program.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "binary logger uri {} has no path",
            url
        )));
    }
    Command::new(program)
        .env(ENV_CONTAINER_ID, container_id)
        .env(ENV_CONTAINER_NAMESPACE, namespace)
        .stdin(ProcessStdio::piped())
        .stdout(ProcessStdio::null())
        .stderr(ProcessStdio::null())
        .spawn()
        .map_err(|e| Error::Other(format!("spawn logger {}: {}", program, e)))
}

fn parse_endpoint(stdout: &str) -> Result<Url> {
    match Url::parse(stdout) {
        Ok(u) => Ok(u),
        Err(ParseError::RelativeUrlWithoutBase) => {
            Url::parse(&format!("fifo:{}", stdout))
                .map_err(|e| Error::InvalidArgument(format!("stdout uri {}: {}", stdout, e)))
        }
        Err(e) => Err(Error::InvalidArgument(format!("stdout uri {}: {}", stdout, e))),
    }
}

/// Wires the three byte pipes for one process and starts their copiers.
///
/// Returns handles for the io-exit signal (stdout/stderr drained) and the
/// stdin-closer signal (all host stdin bytes delivered).
pub fn start_io(
    namespace: &str,
    container_id: &str,
    stdio: &Stdio,
    streams: ProcessStreams,
) -> Result<TtyIo> {
    if stdio.is_null() {
        return Ok(TtyIo::closed());
    }

    let url = parse_endpoint(&stdio.stdout)?;
    let done = Arc::new(AtomicBool::new(false));
    let mut copiers: Vec<thread::JoinHandle<()>> = Vec::new();
    let mut logger_child: Option<Child> = None;

    // host sinks for the two output directions
    let (stdout_w, stderr_w): (Option<Box<dyn Write + Send>>, Option<Box<dyn Write + Send>>) =
        match url.scheme() {
            "fifo" => {
                let out = if stdio.stdout.is_empty() {
                    None
                } else {
                    Some(Box::new(open_fifo_rw(&stdio.stdout)?) as Box<dyn Write + Send>)
                };
                let err = if stdio.terminal || stdio.stderr.is_empty() {
                    None
                } else {
                    Some(Box::new(open_fifo_rw(&stdio.stderr)?) as Box<dyn Write + Send>)
                };
                (out, err)
            }
            "binary" => {
                let mut child = spawn_binary_logger(&url, namespace, container_id)?;
                let stdin = child.stdin.take().ok_or_else(|| {
                    Error::Other("logger process has no stdin".to_string())
                })?;
                let shared = SharedWriter::new(Box::new(stdin));
                logger_child = Some(child);
                let err = if stdio.terminal {
                    None
                } else {
                    Some(Box::new(shared.clone()) as Box<dyn Write + Send>)
                };
                (Some(Box::new(shared) as Box<dyn Write + Send>), err)
            }
            "file" => {
                let file = open_log_file(url.path())?;
                let shared = SharedWriter::new(Box::new(file));
                let err = if stdio.terminal {
                    None
                } else {
                    Some(Box::new(shared.clone()) as Box<dyn Write + Send>)
                };
                (Some(Box::new(shared) as Box<dyn Write + Send>), err)
            }
            other => {
                return Err(Error::InvalidArgument(format!(
                    "unsupported stdout scheme {}",
                    other
                )))
            }
        };

    // stdin: host fifo -> guest writer, non-blocking reads driven by poll
    // so the copier can observe shutdown even while the host side is idle
    let (stdin_tx, stdin_closer) = SignalChannel::pair();
    if !stdio.stdin.is_empty() && streams.stdin.is_some() {
        let host = open_fifo_read_nonblock(&stdio.stdin)?;
        let mut guest = streams.stdin.unwrap();
        let done = done.clone();
        let id = container_id.to_string();
        copiers.push(thread::spawn(move || {
            let mut host = host;
            let mut buf = take_buf();
            let fd = host.as_raw_fd();
            loop {
                if done.load(Ordering::Relaxed) {
                    break;
                }
                let mut pfds = [PollFd::new(fd, PollFlags::POLLIN)];
                match poll(&mut pfds, STDIN_POLL_MS) {
                    Ok(0) => continue,
                    Ok(_) => {}
                    Err(nix::Error::EINTR) => continue,
                    Err(e) => {
                        warn!("stdin poll for {}: {}", id, e);
                        break;
                    }
                }
                match host.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if guest.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("stdin copy for {} ended: {}", id, e);
                        break;
                    }
                }
            }
            let _ = guest.flush();
            put_buf(buf);
            drop(guest);
            drop(stdin_tx);
        }));
    } else {
        drop(stdin_tx);
    }

    let mut output_copiers: Vec<thread::JoinHandle<()>> = Vec::new();

    if let (Some(mut w), Some(mut r)) = (stdout_w, streams.stdout) {
        let done = done.clone();
        let id = container_id.to_string();
        output_copiers.push(thread::spawn(move || {
            if let Err(e) = copy_pooled(r.as_mut(), w.as_mut()) {
                debug!("stdout copy for {} ended: {}", id, e);
            }
            // release the stdin copier even if the guest process exited
            // without ever closing its stdin
            done.store(true, Ordering::Relaxed);
        }));
    }

    if !stdio.terminal {
        if let (Some(mut w), Some(mut r)) = (stderr_w, streams.stderr) {
            let id = container_id.to_string();
            output_copiers.push(thread::spawn(move || {
                if let Err(e) = copy_pooled(r.as_mut(), w.as_mut()) {
                    debug!("stderr copy for {} ended: {}", id, e);
                }
            }));
        }
    }

    let (exit_tx, exit) = SignalChannel::pair();
    let done_for_join = done;
    thread::spawn(move || {
        for h in output_copiers {
            let _ = h.join();
        }
        done_for_join.store(true, Ordering::Relaxed);
        if let Some(mut child) = logger_child {
            // copier writers are gone, the logger sees EOF and exits
            if let Err(e) = child.wait() {
                warn!("wait for logger process: {}", e);
            }
        }
        drop(exit_tx);
        // stdin copier cleans itself up on the next poll tick
        for h in copiers {
            let _ = h.join();
        }
    });

    Ok(TtyIo { exit, stdin_closer })
}
