use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use super::{Result, SocketOptions};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowState {
    pub snd_wl1: u32,
    pub snd_wnd: u32,
    pub max_window: u32,
    pub rcv_wnd: u32,
    pub rcv_wup: u32,
}

/// Protocol state read while the socket was frozen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpRepairState {
    pub inq_seq: u32,
    pub outq_seq: u32,
    /// Bytes at the end of the send queue the peer has never seen.
    pub unsent_len: u32,
    pub mss_clamp: u32,
    pub snd_wscale: u8,
    pub rcv_wscale: u8,
    pub wscale_ok: bool,
    pub sack_ok: bool,
    pub timestamp_ok: bool,
    pub timestamp: u32,
    pub window: Option<WindowState>,
}

/// Snapshot of a connected TCP stream. Only [`super::extract`] creates one and
/// [`super::inject`] consumes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpStreamRecord {
    local: SocketAddr,
    remote: SocketAddr,
    options: SocketOptions,
    repair: TcpRepairState,
    recv_queue: Vec<u8>,
    send_queue: Vec<u8>,
}

impl TcpStreamRecord {
    pub(crate) fn new(
        local: SocketAddr,
        remote: SocketAddr,
        options: SocketOptions,
        repair: TcpRepairState,
        recv_queue: Vec<u8>,
        send_queue: Vec<u8>,
    ) -> Self {
        Self {
            local,
            remote,
            options,
            repair,
            recv_queue,
            send_queue,
        }
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn options(&self) -> &SocketOptions {
        &self.options
    }

    pub fn repair(&self) -> &TcpRepairState {
        &self.repair
    }

    /// Received bytes the application had not read yet.
    pub fn recv_queue(&self) -> &[u8] {
        &self.recv_queue
    }

    /// Written bytes the peer had not acknowledged yet.
    pub fn send_queue(&self) -> &[u8] {
        &self.send_queue
    }

    /// Splits the send queue into the part already on the wire and the unsent
    /// tail.
    pub(crate) fn split_send_queue(&self) -> (&[u8], &[u8]) {
        let unsent = (self.repair.unsent_len as usize).min(self.send_queue.len());
        self.send_queue.split_at(self.send_queue.len() - unsent)
    }

    /// Image form of the record. Storing it is up to the caller.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(image: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(image)?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use anyhow::Result;

    use super::*;

    pub(crate) fn sample() -> TcpStreamRecord {
        TcpStreamRecord::new(
            "127.0.0.1:4000".parse().unwrap(),
            "127.0.0.1:5000".parse().unwrap(),
            SocketOptions {
                reuse_addr: true,
                nodelay: true,
                ..Default::default()
            },
            TcpRepairState {
                inq_seq: 1000,
                outq_seq: 2000,
                unsent_len: 2,
                mss_clamp: 65483,
                snd_wscale: 7,
                rcv_wscale: 7,
                wscale_ok: true,
                sack_ok: true,
                timestamp_ok: true,
                timestamp: 123456,
                window: Some(WindowState {
                    snd_wl1: 1000,
                    snd_wnd: 65536,
                    max_window: 65536,
                    rcv_wnd: 65536,
                    rcv_wup: 1000,
                }),
            },
            b"abc".to_vec(),
            b"hello".to_vec(),
        )
    }

    #[test]
    fn test_split_send_queue() {
        let record = sample();
        let (sent, unsent) = record.split_send_queue();
        assert_eq!(sent, b"hel");
        assert_eq!(unsent, b"lo");
    }

    #[test]
    fn test_split_send_queue_clamps_unsent() {
        let mut record = sample();
        record.repair.unsent_len = 64;
        let (sent, unsent) = record.split_send_queue();
        assert!(sent.is_empty());
        assert_eq!(unsent, b"hello");
    }

    #[test]
    fn test_image_keeps_queues_and_window() -> Result<()> {
        let record = sample();
        let image = record.to_json()?;
        let back = TcpStreamRecord::from_json(&image)?;
        assert_eq!(back, record);
        assert_eq!(back.recv_queue(), b"abc");
        assert_eq!(back.repair().window.map(|w| w.snd_wnd), Some(65536));
        Ok(())
    }

    #[test]
    fn test_truncated_image_rejected() -> Result<()> {
        let image = sample().to_json()?;
        let err = TcpStreamRecord::from_json(&image[..image.len() / 2]).unwrap_err();
        assert!(matches!(err, super::super::SocketError::Serde(_)));
        Ok(())
    }
}
