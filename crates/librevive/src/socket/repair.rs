//! Raw TCP repair-mode access.
//!
//! Nothing outside this module issues repair-mode socket options. A
//! [`RepairSocket`] is only obtainable by switching a socket into repair mode,
//! and decides on drop whether the socket is switched back.

use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::time::{Duration, Instant};

use libc::{c_int, c_void, socklen_t};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{recv, send, MsgFlags};

use super::SocketError;

// linux/tcp.h
const TCP_REPAIR: c_int = 19;
const TCP_REPAIR_QUEUE: c_int = 20;
const TCP_QUEUE_SEQ: c_int = 21;
const TCP_REPAIR_OPTIONS: c_int = 22;
const TCP_TIMESTAMP: c_int = 24;
const TCP_REPAIR_WINDOW: c_int = 29;

const TCP_REPAIR_ON: c_int = 1;
const TCP_REPAIR_OFF: c_int = 0;

const TCPOPT_MSS: u32 = 2;
const TCPOPT_WINDOW: u32 = 3;
const TCPOPT_SACK_PERM: u32 = 4;
const TCPOPT_TIMESTAMP: u32 = 8;

const TCPI_OPT_TIMESTAMPS: u8 = 1;
const TCPI_OPT_SACK: u8 = 2;
const TCPI_OPT_WSCALE: u8 = 4;

pub(crate) const TCP_ESTABLISHED: u8 = 1;

// linux/sockios.h
const SIOCINQ: u64 = 0x541B;
const SIOCOUTQ: u64 = 0x5411;
const SIOCOUTQNSD: u64 = 0x894B;

/// Largest chunk pushed into a queue with one send call.
const MAX_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Queue {
    Recv = 1,
    Send = 2,
}

#[allow(dead_code)]
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct TcpRepairOpt {
    opt_code: u32,
    opt_val: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TcpRepairWindow {
    pub snd_wl1: u32,
    pub snd_wnd: u32,
    pub max_window: u32,
    pub rcv_wnd: u32,
    pub rcv_wup: u32,
}

/// Leading part of `struct tcp_info`, the kernel copies no more than asked for.
#[allow(dead_code)]
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct TcpInfoHead {
    state: u8,
    ca_state: u8,
    retransmits: u8,
    probes: u8,
    backoff: u8,
    options: u8,
    wscale: u8,
    flags: u8,
    rto: u32,
    ato: u32,
    snd_mss: u32,
    rcv_mss: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StreamInfo {
    pub state: u8,
    pub sack: bool,
    pub timestamps: bool,
    pub wscale: bool,
    pub snd_wscale: u8,
    pub rcv_wscale: u8,
}

/// Options negotiated by the handshake that has to be replayed by hand.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NegotiatedOptions {
    pub mss_clamp: u32,
    pub sack: bool,
    pub timestamps: bool,
    pub wscale: Option<(u8, u8)>,
}

/// Bound on the repair calls of one extract or inject.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    at: Instant,
    timeout: Duration,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
            timeout,
        }
    }

    fn remaining(&self) -> Result<Duration, SocketError> {
        let now = Instant::now();
        if now >= self.at {
            return Err(SocketError::Timeout(self.timeout));
        }
        Ok(self.at - now)
    }
}

fn setsockopt_raw<T>(fd: RawFd, level: c_int, name: c_int, val: &T) -> nix::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            val as *const T as *const c_void,
            mem::size_of::<T>() as socklen_t,
        )
    };
    Errno::result(ret).map(drop)
}

fn setsockopt_slice<T>(fd: RawFd, level: c_int, name: c_int, vals: &[T]) -> nix::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            vals.as_ptr() as *const c_void,
            mem::size_of_val(vals) as socklen_t,
        )
    };
    Errno::result(ret).map(drop)
}

pub(crate) fn getsockopt_raw<T: Default>(fd: RawFd, level: c_int, name: c_int) -> nix::Result<T> {
    let mut val = T::default();
    let mut len = mem::size_of::<T>() as socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            level,
            name,
            &mut val as *mut T as *mut c_void,
            &mut len,
        )
    };
    Errno::result(ret).map(|_| val)
}

fn ioctl_len(fd: RawFd, request: u64) -> nix::Result<u32> {
    let mut val: c_int = 0;
    let ret = unsafe { libc::ioctl(fd, request as _, &mut val as *mut c_int) };
    Errno::result(ret).map(|_| val as u32)
}

/// What happens to the repair flag when the guard is dropped without an
/// explicit [`RepairSocket::leave`] or [`RepairSocket::keep`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OnDrop {
    /// Hand the live socket back to normal processing.
    Resume,
    /// Leave it frozen, closing a frozen socket tells the peer nothing.
    Stay,
}

#[derive(Debug)]
pub(crate) struct RepairSocket<'fd> {
    fd: BorrowedFd<'fd>,
    active: bool,
    on_drop: OnDrop,
}

impl<'fd> RepairSocket<'fd> {
    pub fn enter(fd: BorrowedFd<'fd>, on_drop: OnDrop) -> Result<Self, SocketError> {
        setsockopt_raw(fd.as_raw_fd(), libc::SOL_TCP, TCP_REPAIR, &TCP_REPAIR_ON).map_err(
            |err| match err {
                Errno::EPERM => SocketError::Permission,
                err => SocketError::Nix(err),
            },
        )?;
        tracing::trace!(fd = fd.as_raw_fd(), "entered tcp repair mode");
        Ok(Self {
            fd,
            active: true,
            on_drop,
        })
    }

    fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Switches the socket back to normal operation.
    pub fn leave(mut self) -> Result<(), SocketError> {
        self.active = false;
        repair_off(self.raw())
    }

    /// Keeps the socket in repair mode after the guard is gone.
    pub fn keep(mut self) {
        self.active = false;
    }

    pub fn info(&self) -> Result<StreamInfo, SocketError> {
        let info: TcpInfoHead = getsockopt_raw(self.raw(), libc::SOL_TCP, libc::TCP_INFO)?;
        Ok(StreamInfo {
            state: info.state,
            sack: info.options & TCPI_OPT_SACK != 0,
            timestamps: info.options & TCPI_OPT_TIMESTAMPS != 0,
            wscale: info.options & TCPI_OPT_WSCALE != 0,
            snd_wscale: info.wscale & 0x0f,
            rcv_wscale: info.wscale >> 4,
        })
    }

    pub fn inq_len(&self) -> Result<u32, SocketError> {
        Ok(ioctl_len(self.raw(), SIOCINQ)?)
    }

    pub fn outq_len(&self) -> Result<u32, SocketError> {
        Ok(ioctl_len(self.raw(), SIOCOUTQ)?)
    }

    /// Bytes of the send queue that have not been transmitted yet.
    pub fn unsent_len(&self) -> Result<u32, SocketError> {
        Ok(ioctl_len(self.raw(), SIOCOUTQNSD)?)
    }

    pub fn mss_clamp(&self) -> Result<u32, SocketError> {
        let mss: c_int = getsockopt_raw(self.raw(), libc::SOL_TCP, libc::TCP_MAXSEG)?;
        Ok(mss as u32)
    }

    pub fn timestamp(&self) -> Result<u32, SocketError> {
        Ok(getsockopt_raw(self.raw(), libc::SOL_TCP, TCP_TIMESTAMP)?)
    }

    pub fn set_timestamp(&self, ts: u32) -> Result<(), SocketError> {
        setsockopt_raw(self.raw(), libc::SOL_TCP, TCP_TIMESTAMP, &ts)
            .map_err(|err| rejected("timestamp", err))
    }

    /// `None` on kernels without TCP_REPAIR_WINDOW.
    pub fn window(&self) -> Result<Option<TcpRepairWindow>, SocketError> {
        match getsockopt_raw(self.raw(), libc::SOL_TCP, TCP_REPAIR_WINDOW) {
            Ok(window) => Ok(Some(window)),
            Err(Errno::ENOPROTOOPT) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn set_window(&self, window: &TcpRepairWindow) -> Result<(), SocketError> {
        setsockopt_raw(self.raw(), libc::SOL_TCP, TCP_REPAIR_WINDOW, window)
            .map_err(|err| rejected("window", err))
    }

    pub fn select_queue(&self, queue: Queue) -> Result<(), SocketError> {
        let id = queue as c_int;
        Ok(setsockopt_raw(self.raw(), libc::SOL_TCP, TCP_REPAIR_QUEUE, &id)?)
    }

    pub fn queue_seq(&self, queue: Queue) -> Result<u32, SocketError> {
        self.select_queue(queue)?;
        Ok(getsockopt_raw(self.raw(), libc::SOL_TCP, TCP_QUEUE_SEQ)?)
    }

    /// Only valid before the socket is connected.
    pub fn set_queue_seq(&self, queue: Queue, seq: u32) -> Result<(), SocketError> {
        self.select_queue(queue)?;
        setsockopt_raw(self.raw(), libc::SOL_TCP, TCP_QUEUE_SEQ, &seq)
            .map_err(|err| rejected("queue sequence", err))
    }

    /// Copies `len` bytes of `queue` without consuming them. Returns the
    /// queue's sequence number alongside the data.
    pub fn peek_queue(&self, queue: Queue, len: u32) -> Result<(u32, Vec<u8>), SocketError> {
        let seq = self.queue_seq(queue)?;
        if len == 0 {
            return Ok((seq, Vec::new()));
        }

        // One spare byte tells us whether the queue grew behind our back.
        let mut buf = vec![0u8; len as usize + 1];
        let got = recv(
            self.raw(),
            &mut buf,
            MsgFlags::MSG_PEEK | MsgFlags::MSG_DONTWAIT,
        )?;
        if got != len as usize {
            tracing::debug!(?queue, expected = len, got, "queue changed while peeking");
            return Err(SocketError::CaptureRace { attempts: 1 });
        }
        buf.truncate(got);
        Ok((seq, buf))
    }

    pub fn set_options(&self, opts: &NegotiatedOptions) -> Result<(), SocketError> {
        let mut list = Vec::with_capacity(4);
        if let Some((snd, rcv)) = opts.wscale {
            list.push(TcpRepairOpt {
                opt_code: TCPOPT_WINDOW,
                opt_val: u32::from(snd) | (u32::from(rcv) << 16),
            });
        }
        if opts.timestamps {
            list.push(TcpRepairOpt {
                opt_code: TCPOPT_TIMESTAMP,
                opt_val: 0,
            });
        }
        if opts.sack {
            list.push(TcpRepairOpt {
                opt_code: TCPOPT_SACK_PERM,
                opt_val: 0,
            });
        }
        list.push(TcpRepairOpt {
            opt_code: TCPOPT_MSS,
            opt_val: opts.mss_clamp,
        });

        setsockopt_slice(self.raw(), libc::SOL_TCP, TCP_REPAIR_OPTIONS, &list)
            .map_err(|err| rejected("negotiated options", err))
    }

    /// Writes `data` straight into `queue`; nothing is transmitted.
    pub fn fill_queue(
        &self,
        queue: Queue,
        data: &[u8],
        deadline: &Deadline,
    ) -> Result<(), SocketError> {
        if data.is_empty() {
            return Ok(());
        }
        self.select_queue(queue)?;
        send_all(self.fd, data, deadline)
    }

    /// Sends `data` through the regular path so the kernel transmits it,
    /// then re-enters repair mode.
    pub fn send_unsent(&self, data: &[u8], deadline: &Deadline) -> Result<(), SocketError> {
        if data.is_empty() {
            return Ok(());
        }
        repair_off(self.raw())?;
        let sent = send_all(self.fd, data, deadline);
        setsockopt_raw(self.raw(), libc::SOL_TCP, TCP_REPAIR, &TCP_REPAIR_ON)?;
        sent
    }
}

impl Drop for RepairSocket<'_> {
    fn drop(&mut self) {
        if self.active && self.on_drop == OnDrop::Resume {
            if let Err(err) = repair_off(self.raw()) {
                tracing::warn!(fd = self.raw(), ?err, "failed to leave tcp repair mode");
            }
        }
    }
}

fn repair_off(fd: RawFd) -> Result<(), SocketError> {
    setsockopt_raw(fd, libc::SOL_TCP, TCP_REPAIR, &TCP_REPAIR_OFF)?;
    tracing::trace!(fd, "left tcp repair mode");
    Ok(())
}

fn rejected(what: &str, err: Errno) -> SocketError {
    match err {
        Errno::EINVAL | Errno::EPERM => {
            SocketError::ReplayInconsistency(format!("kernel rejected {what}: {err}"))
        }
        err => SocketError::Nix(err),
    }
}

fn send_all(fd: BorrowedFd<'_>, data: &[u8], deadline: &Deadline) -> Result<(), SocketError> {
    let mut off = 0;
    let mut chunk = MAX_CHUNK;
    while off < data.len() {
        let end = data.len().min(off + chunk);
        match send(fd.as_raw_fd(), &data[off..end], MsgFlags::MSG_DONTWAIT) {
            Ok(n) => off += n,
            Err(Errno::EINTR) => continue,
            // The receive queue is charged against memory limits, retry with
            // smaller pieces before giving up.
            Err(Errno::ENOMEM) if chunk > 1024 => chunk /= 2,
            Err(Errno::EAGAIN) => wait_writable(fd, deadline)?,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn wait_writable(fd: BorrowedFd<'_>, deadline: &Deadline) -> Result<(), SocketError> {
    let remaining = deadline.remaining()?.as_millis().min(u128::from(u16::MAX)) as u16;
    let mut fds = [PollFd::new(fd, PollFlags::POLLOUT)];
    match poll(&mut fds, PollTimeout::from(remaining)) {
        Ok(_) | Err(Errno::EINTR) => Ok(()),
        Err(err) => Err(err.into()),
    }
}
