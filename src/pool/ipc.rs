//! Newline-delimited JSON over pipes and sockets.
//!
//! Both the worker pipes (stdin/stdout of a worker process) and the watch
//! channel sockets use the same framing: one JSON document per line.

use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use serde::Serialize;
use serde::de::DeserializeOwned;

const BUFFER_SIZE: usize = 64 * 1024;

/// An owned descriptor with EINTR-safe `Read`/`Write`.
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    pub fn new(fd: impl Into<OwnedFd>) -> Self {
        Self { fd: fd.into() }
    }

    /// Take ownership of a raw descriptor.
    ///
    /// # Safety
    /// `fd` must be open and not owned by anything else.
    pub unsafe fn from_raw(fd: RawFd) -> Self {
        Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        }
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reads one JSON message per line.
pub struct LineReader {
    reader: BufReader<PipeFd>,
    line: String,
}

impl LineReader {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            reader: BufReader::with_capacity(BUFFER_SIZE, fd),
            line: String::with_capacity(4096),
        }
    }

    /// Next line without its terminator, `None` on EOF.
    pub fn read_line(&mut self) -> io::Result<Option<&str>> {
        self.line.clear();
        if self.reader.read_line(&mut self.line)? == 0 {
            return Ok(None);
        }
        let trimmed = self.line.trim_end_matches(['\n', '\r']).len();
        self.line.truncate(trimmed);
        Ok(Some(&self.line))
    }

    /// Next message, `None` on EOF. Blank lines are skipped.
    pub fn read_message<T: DeserializeOwned>(&mut self) -> io::Result<Option<T>> {
        loop {
            let Some(line) = self.read_line()? else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            return serde_json::from_str(line)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e));
        }
    }
}

/// Writes one JSON message per line, flushing after each.
pub struct LineWriter {
    writer: BufWriter<PipeFd>,
}

impl LineWriter {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            writer: BufWriter::with_capacity(BUFFER_SIZE, fd),
        }
    }

    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()
    }

    pub fn write_message<T: Serialize>(&mut self, message: &T) -> io::Result<()> {
        let line = serde_json::to_string(message)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.write_line(&line)
    }
}
