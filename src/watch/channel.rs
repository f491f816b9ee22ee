//! Watch-mode message channel between workers and the coordinator.
//!
//! A Unix domain socket carrying the same newline-delimited JSON framing as
//! the worker pipes. Workers connect whenever they start watching; every
//! connection gets a reader thread that forwards messages into one channel.

use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, trace, warn};

use crate::error::{BuildError, Result};
use crate::pool::ipc::{LineReader, LineWriter, PipeFd};

const SOCKET_NAME: &str = "watch.sock";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatchMessage {
    /// Target `index` finished a cycle; drives the completion barrier.
    Done { index: usize },
    /// Progress notice for a finished cycle of target `index`.
    WatchCycle { index: usize },
}

/// Listening side of the watch channel.
pub struct WatchServer {
    path: PathBuf,
    messages: Receiver<WatchMessage>,
    stopping: Arc<AtomicBool>,
    accept: Option<JoinHandle<()>>,
    _dir: Option<TempDir>,
}

impl WatchServer {
    /// Listen on a socket inside a fresh private directory.
    pub fn bind_temp() -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("parabuild-").tempdir()?;
        let mut server = Self::bind(dir.path().join(SOCKET_NAME))?;
        server._dir = Some(dir);
        Ok(server)
    }

    pub fn bind(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let listener = UnixListener::bind(&path).map_err(|e| {
            BuildError::Worker(format!(
                "Failed to bind watch socket {}: {}",
                path.display(),
                e
            ))
        })?;
        let (tx, messages) = crossbeam_channel::unbounded();
        let stopping = Arc::new(AtomicBool::new(false));

        let flag = stopping.clone();
        let accept = std::thread::Builder::new()
            .name("parabuild-watch-accept".into())
            .spawn(move || accept_loop(listener, tx, flag))?;
        debug!(path = %path.display(), "Watch channel listening");

        Ok(Self {
            path,
            messages,
            stopping,
            accept: Some(accept),
            _dir: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn messages(&self) -> &Receiver<WatchMessage> {
        &self.messages
    }

    /// Stop accepting connections. Connections already open keep delivering
    /// until their writers go away.
    pub fn stop(&mut self) {
        let Some(accept) = self.accept.take() else {
            return;
        };
        self.stopping.store(true, Ordering::SeqCst);
        // Wake the blocking accept.
        let _ = UnixStream::connect(&self.path);
        let _ = accept.join();
    }
}

impl Drop for WatchServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: UnixListener, tx: Sender<WatchMessage>, stopping: Arc<AtomicBool>) {
    for stream in listener.incoming() {
        if stopping.load(Ordering::SeqCst) {
            break;
        }
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Watch channel accept failed");
                continue;
            }
        };
        let tx = tx.clone();
        let spawned = std::thread::Builder::new()
            .name("parabuild-watch-conn".into())
            .spawn(move || read_connection(stream, tx));
        if let Err(e) = spawned {
            warn!(error = %e, "Could not start watch connection reader");
        }
    }
}

fn read_connection(stream: UnixStream, tx: Sender<WatchMessage>) {
    let mut reader = LineReader::new(PipeFd::new(stream));
    loop {
        match reader.read_message::<WatchMessage>() {
            Ok(Some(message)) => {
                trace!(?message, "Watch message");
                if tx.send(message).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Dropping malformed watch message");
            }
        }
    }
}

/// Sending side of the watch channel, used inside workers.
pub struct WatchClient {
    path: PathBuf,
    writer: LineWriter,
}

impl WatchClient {
    /// Connect, retrying up to `retries` times `delay` apart.
    pub fn connect(path: impl Into<PathBuf>, retries: usize, delay: Duration) -> Result<Self> {
        let path = path.into();
        let writer = Self::open(&path, retries, delay)?;
        Ok(Self { path, writer })
    }

    fn open(path: &Path, retries: usize, delay: Duration) -> Result<LineWriter> {
        let mut attempt = 0;
        loop {
            match UnixStream::connect(path) {
                Ok(stream) => return Ok(LineWriter::new(PipeFd::new(stream))),
                Err(e) if attempt < retries => {
                    trace!(attempt, error = %e, "Watch channel not ready, retrying");
                    attempt += 1;
                    std::thread::sleep(delay);
                }
                Err(e) => {
                    return Err(BuildError::Worker(format!(
                        "Failed to connect to watch channel {}: {}",
                        path.display(),
                        e
                    )));
                }
            }
        }
    }

    /// Send a message, reconnecting once if the connection broke.
    pub fn send(&mut self, message: &WatchMessage) -> Result<()> {
        if self.writer.write_message(message).is_ok() {
            return Ok(());
        }
        self.writer = Self::open(&self.path, 0, Duration::ZERO)?;
        self.writer.write_message(message)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_from_several_clients() {
        let server = WatchServer::bind_temp().unwrap();
        let mut a = WatchClient::connect(server.path(), 0, Duration::ZERO).unwrap();
        let mut b = WatchClient::connect(server.path(), 0, Duration::ZERO).unwrap();

        a.send(&WatchMessage::Done { index: 0 }).unwrap();
        b.send(&WatchMessage::Done { index: 1 }).unwrap();
        a.send(&WatchMessage::WatchCycle { index: 0 }).unwrap();

        let mut received: Vec<_> = (0..3)
            .map(|_| {
                server
                    .messages()
                    .recv_timeout(Duration::from_secs(5))
                    .unwrap()
            })
            .collect();
        received.sort_by_key(|m| format!("{m:?}"));
        assert_eq!(
            received,
            vec![
                WatchMessage::Done { index: 0 },
                WatchMessage::Done { index: 1 },
                WatchMessage::WatchCycle { index: 0 },
            ]
        );
    }

    #[test]
    fn test_wire_format() {
        let line = serde_json::to_string(&WatchMessage::WatchCycle { index: 2 }).unwrap();
        assert_eq!(line, r#"{"type":"watch_cycle","index":2}"#);
    }

    #[test]
    fn test_connect_fails_without_server() {
        let dir = tempfile::tempdir().unwrap();
        let result = WatchClient::connect(dir.path().join("missing.sock"), 2, Duration::from_millis(5));
        assert!(result.is_err());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut server = WatchServer::bind_temp().unwrap();
        server.stop();
        server.stop();
    }
}
