//! Capture and replay of connected TCP streams through kernel repair mode.

mod extract;
mod inject;
mod record;
mod repair;

use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::time::Duration;

use nix::sys::socket::{getsockopt, setsockopt, sockopt};
use serde::{Deserialize, Serialize};

pub use extract::{extract, resume};
pub(crate) use inject::discard;
pub use inject::inject;
pub use record::{TcpRepairState, TcpStreamRecord, WindowState};

#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),
    #[error("socket state kept changing during capture ({attempts} attempts)")]
    CaptureRace { attempts: u32 },
    #[error("replay rejected: {0}")]
    ReplayInconsistency(String),
    #[error("repair did not finish within {0:?}")]
    Timeout(Duration),
    #[error("tcp repair requires CAP_NET_ADMIN")]
    Permission,
    #[error(transparent)]
    Nix(#[from] nix::Error),
    #[error("failed to encode socket image")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SocketError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairOptions {
    /// Upper bound for repair calls that may have to wait.
    #[serde(with = "millis")]
    pub timeout: Duration,
    /// How often a capture is retried when the queues change under it.
    pub capture_retries: u32,
}

impl Default for RepairOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            capture_retries: 3,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Socket options that outlive a restore.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketOptions {
    pub reuse_addr: bool,
    pub reuse_port: bool,
    pub keepalive: bool,
    pub keepidle: u32,
    pub keepintvl: u32,
    pub keepcnt: u32,
    pub nodelay: bool,
}

impl SocketOptions {
    pub fn read<Fd: AsFd>(fd: &Fd) -> Result<Self> {
        Ok(Self {
            reuse_addr: getsockopt(fd, sockopt::ReuseAddr)?,
            reuse_port: getsockopt(fd, sockopt::ReusePort)?,
            keepalive: getsockopt(fd, sockopt::KeepAlive)?,
            keepidle: getsockopt(fd, sockopt::TcpKeepIdle)?,
            keepintvl: getsockopt(fd, sockopt::TcpKeepInterval)?,
            keepcnt: getsockopt(fd, sockopt::TcpKeepCount)?,
            nodelay: getsockopt(fd, sockopt::TcpNoDelay)?,
        })
    }

    /// SO_REUSEADDR is left alone here, it only sticks once repair mode is
    /// off.
    pub(crate) fn apply(&self, fd: BorrowedFd<'_>) -> Result<()> {
        setsockopt(&fd, sockopt::ReusePort, &self.reuse_port)?;
        setsockopt(&fd, sockopt::KeepAlive, &self.keepalive)?;
        setsockopt(&fd, sockopt::TcpKeepIdle, &self.keepidle)?;
        setsockopt(&fd, sockopt::TcpKeepInterval, &self.keepintvl)?;
        setsockopt(&fd, sockopt::TcpKeepCount, &self.keepcnt)?;
        setsockopt(&fd, sockopt::TcpNoDelay, &self.nodelay)?;
        tracing::trace!(fd = fd.as_raw_fd(), opts = ?self, "applied socket options");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::net::{SocketAddr, TcpListener, TcpStream};

    use anyhow::Result;

    use super::*;

    /// A plausible record for a connection to `remote`.
    pub(crate) fn record_to(remote: SocketAddr) -> TcpStreamRecord {
        let sample = record::tests::sample();
        TcpStreamRecord::new(
            sample.local(),
            remote,
            *sample.options(),
            sample.repair().clone(),
            sample.recv_queue().to_vec(),
            sample.send_queue().to_vec(),
        )
    }

    #[test]
    fn test_repair_options_default() {
        let opts = RepairOptions::default();
        assert_eq!(opts.timeout, Duration::from_secs(5));
        assert_eq!(opts.capture_retries, 3);

        let opts: RepairOptions = serde_json::from_str(r#"{"timeout": 250}"#).unwrap();
        assert_eq!(opts.timeout, Duration::from_millis(250));
        assert_eq!(opts.capture_retries, 3);
    }

    #[test]
    fn test_read_socket_options() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let stream = TcpStream::connect(listener.local_addr()?)?;
        stream.set_nodelay(true)?;
        setsockopt(&stream, sockopt::KeepAlive, &true)?;
        setsockopt(&stream, sockopt::TcpKeepIdle, &42)?;

        let opts = SocketOptions::read(&stream)?;
        assert!(opts.nodelay);
        assert!(opts.keepalive);
        assert_eq!(opts.keepidle, 42);
        assert!(!opts.reuse_port);
        Ok(())
    }

    #[test]
    fn test_apply_socket_options() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let stream = TcpStream::connect(listener.local_addr()?)?;
        let wanted = SocketOptions {
            reuse_addr: false,
            reuse_port: true,
            keepalive: true,
            keepidle: 30,
            keepintvl: 7,
            keepcnt: 4,
            nodelay: true,
        };
        wanted.apply(stream.as_fd())?;
        assert_eq!(SocketOptions::read(&stream)?, wanted);
        Ok(())
    }
}
