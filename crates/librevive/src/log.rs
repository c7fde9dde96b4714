//! Diagnostics sink
//!
//! Lines are rendered into one reusable page-sized buffer laid out as
//!
//! ```text
//! | (SS.UUUUUU) | pid tag (optional) | message ... \n |
//! |<--- 12 ---->|<------ 9 -------->|
//! ```
//!
//! The timestamp region is rewritten for every line, the pid tag is rendered
//! once per process by [`Diagnostics::reinit_for_process`] and the message
//! fills whatever is left, truncated rather than overflowed. Output goes to
//! the descriptor bound to [`ServiceFd::LogOutput`], or standard error when
//! nothing is bound. Write failures are reported through standard error and
//! never reach the caller.

use std::fmt::{self, Display};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::servicefd::{ServiceFd, ServiceFdError, ServiceFdTable, DEFAULT_LOG_FD};

const PAGE_SIZE: usize = 4096;
/// Width of "(SS.UUUUUU) ".
const TS_PREFIX_LEN: usize = 12;
/// Width of "PPPPPPP: ", large enough for the kernel's pid_max.
const PID_TAG_LEN: usize = 9;
/// Output name meaning "duplicate standard output".
pub const STDOUT_OUTPUT: &str = "-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum LogLevel {
    /// Pass/fail protocol output, emitted regardless of the threshold.
    Msg = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
}

pub const DEFAULT_LOGLEVEL: LogLevel = LogLevel::Warn;

impl LogLevel {
    /// Maps a numeric threshold; 0 selects [`DEFAULT_LOGLEVEL`] and anything
    /// above the most verbose level saturates.
    pub fn from_threshold(level: u32) -> Self {
        match level {
            0 => DEFAULT_LOGLEVEL,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            _ => LogLevel::Debug,
        }
    }
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let print = match self {
            LogLevel::Msg => "msg",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        };
        write!(f, "{print}")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogOptions {
    /// Numeric threshold, see [`LogLevel::from_threshold`].
    pub level: u32,
    /// Log file relative to the log directory. `None` duplicates standard
    /// error, [`STDOUT_OUTPUT`] duplicates standard output.
    pub output: Option<PathBuf>,
    /// Open `<output>.<pid>` in every restored process instead of tagging
    /// lines with the pid.
    pub per_pid_files: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("failed to open the log directory")]
    OpenDirectory(#[source] io::Error),
    #[error("failed to create log file {path:?}")]
    OpenOutput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to duplicate the default log descriptor")]
    Duplicate(#[source] io::Error),
    #[error("log engine failure, can't install descriptor")]
    Install(#[from] ServiceFdError),
}

type Result<T> = std::result::Result<T, LogError>;

/// Where rendered lines end up. Split out so that tests can count writes.
pub trait LogOutput {
    fn write(&mut self, fd: RawFd, buf: &[u8]) -> nix::Result<usize>;
}

#[derive(Debug, Default)]
pub struct FdOutput;

impl LogOutput for FdOutput {
    fn write(&mut self, fd: RawFd, buf: &[u8]) -> nix::Result<usize> {
        // SAFETY: callers only pass descriptors owned by the reserved table
        // or the standard streams, all open for the duration of the call.
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        nix::unistd::write(fd, buf)
    }
}

pub struct Diagnostics<O: LogOutput = FdOutput> {
    level: LogLevel,
    opts: LogOptions,
    start: Instant,
    buf: Box<[u8; PAGE_SIZE]>,
    buf_off: usize,
    failure_reported: bool,
    full_reported: bool,
    dropped: u64,
    output: O,
}

impl Diagnostics<FdOutput> {
    pub fn new(opts: LogOptions) -> Self {
        Self::with_output(opts, FdOutput)
    }
}

impl<O: LogOutput> Diagnostics<O> {
    pub fn with_output(opts: LogOptions, output: O) -> Self {
        Self {
            level: LogLevel::from_threshold(opts.level),
            opts,
            start: Instant::now(),
            buf: Box::new([0; PAGE_SIZE]),
            buf_off: TS_PREFIX_LEN,
            failure_reported: false,
            full_reported: false,
            dropped: 0,
            output,
        }
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn options(&self) -> &LogOptions {
        &self.opts
    }

    pub fn configure(&mut self, level: u32) {
        self.level = LogLevel::from_threshold(level);
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    /// Lines lost because a non-blocking output was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Binds the log directory (the current one unless already bound) and
    /// the configured output. A failure here is fatal to process startup.
    pub fn init(&mut self, fds: &mut ServiceFdTable) -> Result<()> {
        self.start = Instant::now();
        self.buf_off = TS_PREFIX_LEN;

        if !fds.is_bound(ServiceFd::LogDirectory) {
            let dir = OpenOptions::new()
                .read(true)
                .custom_flags(libc::O_DIRECTORY)
                .open(".")
                .map_err(LogError::OpenDirectory)?;
            fds.bind(ServiceFd::LogDirectory, dir)?;
        }

        let output = self.opts.output.clone();
        self.open_output(fds, output.as_deref())
    }

    fn open_output(&mut self, fds: &mut ServiceFdTable, output: Option<&Path>) -> Result<()> {
        let new_logfd: OwnedFd = match output {
            Some(path) if path == Path::new(STDOUT_OUTPUT) => io::stdout()
                .as_fd()
                .try_clone_to_owned()
                .map_err(LogError::Duplicate)?,
            Some(path) => fds
                .open_at(
                    ServiceFd::LogDirectory,
                    path,
                    OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC | OFlag::O_APPEND,
                    Mode::from_bits_truncate(0o600),
                )
                .map_err(|errno| LogError::OpenOutput {
                    path: path.to_path_buf(),
                    source: io::Error::from(errno),
                })?,
            None => io::stderr()
                .as_fd()
                .try_clone_to_owned()
                .map_err(LogError::Duplicate)?,
        };

        fds.bind(ServiceFd::LogOutput, new_logfd)?;
        Ok(())
    }

    /// Must run once in every freshly forked process before it logs.
    pub fn reinit_for_process(&mut self, fds: &mut ServiceFdTable, pid: Pid) {
        self.buf_off = TS_PREFIX_LEN;
        self.failure_reported = false;
        self.full_reported = false;
        self.dropped = 0;

        if !self.opts.per_pid_files {
            let region = &mut self.buf[TS_PREFIX_LEN..TS_PREFIX_LEN + PID_TAG_LEN];
            region.fill(b' ');
            let mut cursor = &mut region[..];
            let _ = write!(cursor, "{:>7}: ", pid.as_raw());
            self.buf_off += PID_TAG_LEN;
            return;
        }

        let Some(base) = self.opts.output.clone() else {
            return;
        };
        if base == Path::new(STDOUT_OUTPUT) {
            return;
        }

        let path = PathBuf::from(format!("{}.{}", base.display(), pid));
        if let Err(err) = self.open_output(fds, Some(&path)) {
            // Keep writing to the inherited output.
            self.report_failure(&format!("can't create per-process log {path:?}: {err}"));
        }
    }

    pub fn fini(&mut self, fds: &mut ServiceFdTable) {
        for slot in [ServiceFd::LogOutput, ServiceFd::LogDirectory] {
            if let Err(err) = fds.release(slot) {
                tracing::warn!(%slot, ?err, "failed to release log descriptor");
            }
        }
    }

    pub fn emit(&mut self, fds: &ServiceFdTable, level: LogLevel, message: &str) {
        self.emit_fields(fds, level, message, &[]);
    }

    /// Like [`Diagnostics::emit`], with `key=value` pairs appended after the message.
    pub fn emit_fields(
        &mut self,
        fds: &ServiceFdTable,
        level: LogLevel,
        message: &str,
        fields: &[(&str, &dyn Display)],
    ) {
        let (fd, start) = if level == LogLevel::Msg {
            (libc::STDOUT_FILENO, self.buf_off)
        } else {
            if level > self.level {
                return;
            }
            self.print_ts();
            (fds.log_fd(), 0)
        };

        let end = self.render(message, fields);
        self.flush(fd, start, end);
    }

    fn print_ts(&mut self) {
        let elapsed = self.start.elapsed();
        let region = &mut self.buf[..TS_PREFIX_LEN];
        let mut cursor = &mut region[..];
        let _ = write!(
            cursor,
            "({:02}.{:06})",
            elapsed.as_secs(),
            elapsed.subsec_micros()
        );
        region[TS_PREFIX_LEN - 1] = b' ';
    }

    /// Renders into the message region and returns the end offset; the
    /// last byte of the page is kept for the newline.
    fn render(&mut self, message: &str, fields: &[(&str, &dyn Display)]) -> usize {
        let region = &mut self.buf[self.buf_off..PAGE_SIZE - 1];
        let capacity = region.len();
        let mut cursor = &mut region[..];
        let _ = cursor.write_all(message.trim_end_matches('\n').as_bytes());
        for (key, value) in fields {
            if write!(cursor, " {key}={value}").is_err() {
                break;
            }
        }
        let written = capacity - cursor.len();

        let end = self.buf_off + written;
        self.buf[end] = b'\n';
        end + 1
    }

    fn flush(&mut self, fd: RawFd, mut off: usize, end: usize) {
        while off < end {
            match self.output.write(fd, &self.buf[off..end]) {
                Ok(0) => {
                    self.report_failure(&format!("log descriptor {fd} accepted no data"));
                    break;
                }
                Ok(n) => off += n,
                Err(Errno::EINTR) => continue,
                // A full non-blocking output is not broken, later lines may
                // still get through.
                Err(Errno::EAGAIN) => {
                    self.dropped += 1;
                    if !self.full_reported {
                        self.full_reported = true;
                        let what = format!("log descriptor {fd} would block, dropping lines");
                        tracing::warn!("{what}");
                        let line = format!("revive: {what}\n");
                        let _ = self.output.write(DEFAULT_LOG_FD, line.as_bytes());
                    }
                    break;
                }
                Err(err) => {
                    if fd != DEFAULT_LOG_FD {
                        self.report_failure(&format!("can't write to log descriptor {fd}: {err}"));
                    }
                    break;
                }
            }
        }
    }

    /// Reports one failure per process image on standard error.
    fn report_failure(&mut self, what: &str) {
        if self.failure_reported {
            return;
        }
        self.failure_reported = true;
        tracing::warn!("{what}");

        let line = format!("revive: {what}\n");
        let _ = self.output.write(DEFAULT_LOG_FD, line.as_bytes());
    }

    pub fn error(&mut self, fds: &ServiceFdTable, message: &str) {
        self.emit(fds, LogLevel::Error, message);
    }

    pub fn warn(&mut self, fds: &ServiceFdTable, message: &str) {
        self.emit(fds, LogLevel::Warn, message);
    }

    pub fn info(&mut self, fds: &ServiceFdTable, message: &str) {
        self.emit(fds, LogLevel::Info, message);
    }

    pub fn debug(&mut self, fds: &ServiceFdTable, message: &str) {
        self.emit(fds, LogLevel::Debug, message);
    }

    pub fn msg(&mut self, fds: &ServiceFdTable, message: &str) {
        self.emit(fds, LogLevel::Msg, message);
    }
}

pub fn write_pidfile<P: AsRef<Path>>(path: P, pid: Pid) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    write!(file, "{pid}")
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;

    /// Records every write instead of performing it.
    #[derive(Debug, Default)]
    pub struct CountingOutput {
        pub writes: Vec<(RawFd, Vec<u8>)>,
        /// Accept at most this many bytes per call.
        pub chunk: Option<usize>,
        /// Fail every write aimed at this descriptor.
        pub failing_fd: Option<RawFd>,
        /// Report EAGAIN for this many writes aimed at `failing_fd` before
        /// failing hard.
        pub would_block: usize,
    }

    impl CountingOutput {
        pub fn bytes_for(&self, fd: RawFd) -> Vec<u8> {
            self.writes
                .iter()
                .filter(|(target, _)| *target == fd)
                .flat_map(|(_, bytes)| bytes.iter().copied())
                .collect()
        }
    }

    impl LogOutput for CountingOutput {
        fn write(&mut self, fd: RawFd, buf: &[u8]) -> nix::Result<usize> {
            if self.failing_fd == Some(fd) {
                if self.would_block > 0 {
                    self.would_block -= 1;
                    return Err(Errno::EAGAIN);
                }
                return Err(Errno::EIO);
            }
            let n = self.chunk.map_or(buf.len(), |chunk| chunk.min(buf.len()));
            self.writes.push((fd, buf[..n].to_vec()));
            Ok(n)
        }
    }
}
