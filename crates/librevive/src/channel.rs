//! Unidirectional, message oriented channel between related processes.
//!
//! Messages are `serde_json` documents carried as single `SOCK_SEQPACKET`
//! records, descriptors travel alongside as `SCM_RIGHTS`.

use std::io::{IoSlice, IoSliceMut};
use std::marker::PhantomData;
use std::os::fd::{IntoRawFd, RawFd};

use nix::sys::socket::{
    self, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixAddr,
};
use nix::unistd;
use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to create socket pair")]
    Create(#[source] nix::Error),
    #[error("failed to send message")]
    Send(#[source] nix::Error),
    #[error("failed to receive message")]
    Receive(#[source] nix::Error),
    #[error("failed to close channel")]
    Close(#[source] nix::Error),
    #[error("malformed message")]
    Serde(#[from] serde_json::Error),
    #[error("peer closed the channel")]
    Closed,
    #[error("received {received} descriptors, room for {capacity}")]
    TooManyFds { received: usize, capacity: usize },
}

type Result<T> = std::result::Result<T, ChannelError>;

pub struct Sender<T> {
    socket: RawFd,
    phantom: PhantomData<T>,
}

pub struct Receiver<T> {
    socket: RawFd,
    phantom: PhantomData<T>,
}

pub fn channel<T>() -> Result<(Sender<T>, Receiver<T>)>
where
    T: Serialize + DeserializeOwned,
{
    let (os_sender, os_receiver) = socket::socketpair(
        socket::AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(ChannelError::Create)?;
    // The ends are closed explicitly, a fork must not run their destructors
    // twice.
    let sender = Sender {
        socket: os_sender.into_raw_fd(),
        phantom: PhantomData,
    };
    let receiver = Receiver {
        socket: os_receiver.into_raw_fd(),
        phantom: PhantomData,
    };
    Ok((sender, receiver))
}

impl<T> Sender<T>
where
    T: Serialize,
{
    fn send_iovec(&mut self, iov: &[IoSlice], fds: Option<&[RawFd]>) -> Result<usize> {
        let cmsgs = match fds {
            Some(fds) if !fds.is_empty() => vec![ControlMessage::ScmRights(fds)],
            _ => vec![],
        };
        socket::sendmsg::<UnixAddr>(self.socket, iov, &cmsgs, MsgFlags::empty(), None)
            .map_err(ChannelError::Send)
    }

    fn send_slice_with_len(&mut self, data: &[u8], fds: Option<&[RawFd]>) -> Result<usize> {
        let len_bytes = (data.len() as u64).to_be_bytes();
        let iov = [IoSlice::new(&len_bytes), IoSlice::new(data)];
        self.send_iovec(&iov, fds)
    }

    pub fn send(&mut self, object: T) -> Result<()> {
        let payload = serde_json::to_vec(&object)?;
        self.send_slice_with_len(&payload, None)?;
        Ok(())
    }

    pub fn send_fds(&mut self, object: T, fds: &[RawFd]) -> Result<()> {
        let payload = serde_json::to_vec(&object)?;
        self.send_slice_with_len(&payload, Some(fds))?;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        unistd::close(self.socket).map_err(ChannelError::Close)
    }
}

impl<T> Receiver<T>
where
    T: DeserializeOwned,
{
    fn peek_size_iovec(&mut self) -> Result<u64> {
        let mut len: u64 = 0;
        let mut len_bytes = len.to_be_bytes();
        let mut iov = [IoSliceMut::new(&mut len_bytes)];
        let msg = socket::recvmsg::<UnixAddr>(self.socket, &mut iov, None, MsgFlags::MSG_PEEK)
            .map_err(ChannelError::Receive)?;
        match msg.bytes {
            0 => return Err(ChannelError::Closed),
            _ => len = u64::from_be_bytes(len_bytes),
        }
        Ok(len)
    }

    fn recv_into_buf_with_len<F>(&mut self) -> Result<(Vec<u8>, Option<F>)>
    where
        F: Default + AsMut<[RawFd]>,
    {
        let msg_len = self.peek_size_iovec()?;
        let mut len: u64 = 0;
        let mut len_bytes = len.to_be_bytes();
        let mut buf = vec![0u8; msg_len as usize];
        let (bytes, fds) = {
            let mut iov = [IoSliceMut::new(&mut len_bytes), IoSliceMut::new(&mut buf)];
            let mut cmsgspace = nix::cmsg_space!(F);
            let msg = socket::recvmsg::<UnixAddr>(
                self.socket,
                &mut iov,
                Some(&mut cmsgspace),
                MsgFlags::MSG_CMSG_CLOEXEC,
            )
            .map_err(ChannelError::Receive)?;

            let mut fds: Option<F> = None;
            for cmsg in msg.cmsgs().map_err(ChannelError::Receive)? {
                if let ControlMessageOwned::ScmRights(received) = cmsg {
                    let mut slot = F::default();
                    let capacity = slot.as_mut().len();
                    if received.len() > capacity || msg.flags.contains(MsgFlags::MSG_CTRUNC) {
                        for fd in &received {
                            let _ = unistd::close(*fd);
                        }
                        return Err(ChannelError::TooManyFds {
                            received: received.len(),
                            capacity,
                        });
                    }
                    slot.as_mut().fill(-1);
                    slot.as_mut()[..received.len()].copy_from_slice(&received);
                    fds = Some(slot);
                }
            }
            (msg.bytes, fds)
        };

        match bytes {
            0 => Err(ChannelError::Closed),
            _ => {
                len = u64::from_be_bytes(len_bytes);
                buf.truncate(len as usize);
                Ok((buf, fds))
            }
        }
    }

    /// Receives a message and the descriptors sent with it. Unused entries of
    /// `F` are `-1`.
    pub fn recv_with_fds<F>(&mut self) -> Result<(T, Option<F>)>
    where
        F: Default + AsMut<[RawFd]>,
    {
        let (buf, fds) = self.recv_into_buf_with_len::<F>()?;
        let msg: T = serde_json::from_slice(&buf)?;
        Ok((msg, fds))
    }

    pub fn recv(&mut self) -> Result<T> {
        let (msg, _) = self.recv_with_fds::<[RawFd; 0]>()?;
        Ok(msg)
    }

    pub fn close(&self) -> Result<()> {
        unistd::close(self.socket).map_err(ChannelError::Close)
    }
}
