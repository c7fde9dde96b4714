use std::net::SocketAddr;
use std::os::fd::{AsRawFd, BorrowedFd};

use nix::errno::Errno;
use nix::sys::socket::{
    getpeername, getsockname, getsockopt, setsockopt, sockopt, SockType, SockaddrLike,
    SockaddrStorage,
};

use super::record::{TcpRepairState, TcpStreamRecord, WindowState};
use super::repair::{OnDrop, Queue, RepairSocket, TCP_ESTABLISHED};
use super::{RepairOptions, Result, SocketError, SocketOptions};

pub(crate) fn to_socket_addr(addr: &SockaddrStorage) -> Option<SocketAddr> {
    if let Some(v4) = addr.as_sockaddr_in() {
        return Some(SocketAddr::from((v4.ip(), v4.port())));
    }
    addr.as_sockaddr_in6()
        .map(|v6| SocketAddr::from((v6.ip(), v6.port())))
}

/// Checks that `fd` is a connected TCP stream and returns its endpoints.
fn identify(fd: BorrowedFd<'_>) -> Result<(SocketAddr, SocketAddr)> {
    let ty = getsockopt(&fd, sockopt::SockType)?;
    if ty != SockType::Stream {
        return Err(SocketError::UnsupportedTransport(format!(
            "socket type {ty:?}"
        )));
    }

    let local: SockaddrStorage = getsockname(fd.as_raw_fd())?;
    let local = to_socket_addr(&local).ok_or_else(|| {
        SocketError::UnsupportedTransport(format!("address family {:?}", local.family()))
    })?;

    let protocol: libc::c_int =
        super::repair::getsockopt_raw(fd.as_raw_fd(), libc::SOL_SOCKET, libc::SO_PROTOCOL)?;
    if protocol != libc::IPPROTO_TCP {
        return Err(SocketError::UnsupportedTransport(format!(
            "protocol {protocol}"
        )));
    }

    let remote: SockaddrStorage = match getpeername(fd.as_raw_fd()) {
        Ok(addr) => addr,
        Err(Errno::ENOTCONN) => {
            return Err(SocketError::UnsupportedTransport(
                "socket is not connected".to_string(),
            ))
        }
        Err(err) => return Err(err.into()),
    };
    let remote = to_socket_addr(&remote).ok_or_else(|| {
        SocketError::UnsupportedTransport("peer address is not inet".to_string())
    })?;

    Ok((local, remote))
}

/// Captures the state of a connected TCP stream.
///
/// On success the socket is left in repair mode, frozen, so that nothing more
/// is sent or acknowledged on behalf of the dumped process. Use [`resume`] to
/// let it run again. On failure repair mode is switched off.
pub fn extract(fd: BorrowedFd<'_>, opts: &RepairOptions) -> Result<TcpStreamRecord> {
    let (local, remote) = identify(fd)?;
    let options = SocketOptions::read(&fd)?;

    let repair = RepairSocket::enter(fd, OnDrop::Resume)?;
    let info = repair.info()?;
    if info.state != TCP_ESTABLISHED {
        return Err(SocketError::UnsupportedTransport(format!(
            "tcp state {} is not established",
            info.state
        )));
    }

    let (recv_queue, send_queue, inq_seq, outq_seq, unsent_len) =
        with_capture_retries(opts.capture_retries, || capture_queues(&repair))?;

    let window = repair.window()?.map(|w| WindowState {
        snd_wl1: w.snd_wl1,
        snd_wnd: w.snd_wnd,
        max_window: w.max_window,
        rcv_wnd: w.rcv_wnd,
        rcv_wup: w.rcv_wup,
    });

    let state = TcpRepairState {
        inq_seq,
        outq_seq,
        unsent_len,
        mss_clamp: repair.mss_clamp()?,
        snd_wscale: info.snd_wscale,
        rcv_wscale: info.rcv_wscale,
        wscale_ok: info.wscale,
        sack_ok: info.sack,
        timestamp_ok: info.timestamps,
        timestamp: repair.timestamp()?,
        window,
    };

    tracing::debug!(
        fd = fd.as_raw_fd(),
        %local,
        %remote,
        inq = recv_queue.len(),
        outq = send_queue.len(),
        unsent = unsent_len,
        "captured tcp stream"
    );
    repair.keep();

    Ok(TcpStreamRecord::new(
        local, remote, options, state, recv_queue, send_queue,
    ))
}

/// Runs `capture` until it stops racing with the kernel, at most `retries`
/// times. Other errors end the capture right away.
fn with_capture_retries<T>(retries: u32, mut capture: impl FnMut() -> Result<T>) -> Result<T> {
    let attempts = retries.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match capture() {
            Err(SocketError::CaptureRace { .. }) if attempt < attempts => {
                tracing::debug!(attempt, "retrying queue capture");
            }
            Err(SocketError::CaptureRace { .. }) => {
                return Err(SocketError::CaptureRace { attempts: attempt })
            }
            result => return result,
        }
    }
}

type Queues = (Vec<u8>, Vec<u8>, u32, u32, u32);

fn capture_queues(repair: &RepairSocket<'_>) -> Result<Queues> {
    let inq_len = repair.inq_len()?;
    let outq_len = repair.outq_len()?;
    let unsent_len = repair.unsent_len()?;

    let (inq_seq, recv_queue) = repair.peek_queue(Queue::Recv, inq_len)?;
    let (outq_seq, send_queue) = repair.peek_queue(Queue::Send, outq_len)?;

    if repair.inq_len()? != inq_len || repair.outq_len()? != outq_len {
        return Err(SocketError::CaptureRace { attempts: 1 });
    }
    Ok((recv_queue, send_queue, inq_seq, outq_seq, unsent_len))
}

/// Lets a socket left frozen by [`extract`] run again. `record` is what
/// `extract` returned for it.
pub fn resume(fd: BorrowedFd<'_>, record: &TcpStreamRecord) -> Result<()> {
    // A frozen socket always reports SO_REUSEADDR set, and leaving repair
    // mode clears it. The application's value comes from the record.
    RepairSocket::enter(fd, OnDrop::Resume)?.leave()?;
    setsockopt(&fd, sockopt::ReuseAddr, &record.options().reuse_addr)?;
    tracing::debug!(fd = fd.as_raw_fd(), "resumed tcp stream");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::{TcpListener, TcpStream, UdpSocket};
    use std::os::fd::AsFd;

    use anyhow::Result;

    use super::*;

    #[test]
    fn test_listener_is_unsupported() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let err = extract(listener.as_fd(), &RepairOptions::default()).unwrap_err();
        assert!(matches!(err, SocketError::UnsupportedTransport(_)), "{err}");
        Ok(())
    }

    #[test]
    fn test_udp_is_unsupported() -> Result<()> {
        let socket = UdpSocket::bind("127.0.0.1:0")?;
        socket.connect("127.0.0.1:9")?;
        let err = extract(socket.as_fd(), &RepairOptions::default()).unwrap_err();
        assert!(matches!(err, SocketError::UnsupportedTransport(_)), "{err}");
        Ok(())
    }

    #[test]
    fn test_unix_stream_is_unsupported() -> Result<()> {
        let (a, _b) = std::os::unix::net::UnixStream::pair()?;
        let err = extract(a.as_fd(), &RepairOptions::default()).unwrap_err();
        assert!(matches!(err, SocketError::UnsupportedTransport(_)), "{err}");
        Ok(())
    }

    #[test]
    fn test_identify_connected_stream() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let stream = TcpStream::connect(listener.local_addr()?)?;
        let (local, remote) = identify(stream.as_fd())?;
        assert_eq!(local, stream.local_addr()?);
        assert_eq!(remote, listener.local_addr()?);
        Ok(())
    }

    #[test]
    fn test_extract_then_resume() -> Result<()> {
        use std::io::{Read, Write};

        if !nix::unistd::geteuid().is_root() {
            return Ok(());
        }
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let mut client = TcpStream::connect(listener.local_addr()?)?;
        let (mut server, _) = listener.accept()?;
        server.write_all(b"ping")?;
        let mut peeked = [0u8; 4];
        while client.peek(&mut peeked)? < 4 {}

        let record = extract(client.as_fd(), &RepairOptions::default())?;
        assert_eq!(record.recv_queue(), b"ping");
        assert!(record.send_queue().is_empty());
        assert_eq!(record.local(), client.local_addr()?);

        resume(client.as_fd(), &record)?;
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf)?;
        assert_eq!(&buf, b"ping");
        client.write_all(b"pong")?;
        server.read_exact(&mut buf)?;
        assert_eq!(&buf, b"pong");
        Ok(())
    }

    #[test]
    fn test_resume_keeps_reuse_addr_off() -> Result<()> {
        if !nix::unistd::geteuid().is_root() {
            return Ok(());
        }
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let client = TcpStream::connect(listener.local_addr()?)?;
        let _server = listener.accept()?;
        setsockopt(&client, sockopt::ReuseAddr, &false)?;

        let record = extract(client.as_fd(), &RepairOptions::default())?;
        assert!(!record.options().reuse_addr);
        // repair mode forces reuse while frozen
        assert!(getsockopt(&client, sockopt::ReuseAddr)?);

        resume(client.as_fd(), &record)?;
        assert!(!getsockopt(&client, sockopt::ReuseAddr)?);
        Ok(())
    }

    #[test]
    fn test_capture_retried_until_stable() -> Result<()> {
        let mut calls = 0;
        let got = with_capture_retries(3, || {
            calls += 1;
            if calls < 3 {
                Err(SocketError::CaptureRace { attempts: 1 })
            } else {
                Ok(calls)
            }
        })?;
        assert_eq!(got, 3);
        Ok(())
    }

    #[test]
    fn test_capture_race_exhausts_retries() {
        let mut calls = 0;
        let err = with_capture_retries(3, || -> super::Result<()> {
            calls += 1;
            Err(SocketError::CaptureRace { attempts: 1 })
        })
        .unwrap_err();
        assert!(matches!(err, SocketError::CaptureRace { attempts: 3 }), "{err}");
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_capture_stops_on_other_errors() {
        let mut calls = 0;
        let err = with_capture_retries(5, || -> super::Result<()> {
            calls += 1;
            Err(SocketError::Nix(Errno::EBADF))
        })
        .unwrap_err();
        assert!(matches!(err, SocketError::Nix(Errno::EBADF)), "{err}");
        assert_eq!(calls, 1);

        // zero retries still makes one attempt
        let mut calls = 0;
        let _ = with_capture_retries(0, || -> super::Result<()> {
            calls += 1;
            Err(SocketError::CaptureRace { attempts: 1 })
        });
        assert_eq!(calls, 1);
    }
}
