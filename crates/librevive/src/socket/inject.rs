use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};

use nix::sys::socket::{
    bind, connect, setsockopt, socket, sockopt, AddressFamily, SockFlag, SockProtocol, SockType,
    SockaddrStorage,
};

use super::record::{TcpRepairState, TcpStreamRecord, WindowState};
use super::repair::{Deadline, NegotiatedOptions, OnDrop, Queue, RepairSocket, TcpRepairWindow};
use super::{RepairOptions, Result, SocketError};

fn family(addr: &SocketAddr) -> AddressFamily {
    match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    }
}

/// Rebuilds the connection described by `record` and returns the new socket,
/// already out of repair mode.
///
/// A socket that fails half way is closed while still frozen, so the peer
/// never sees a reset for it.
pub fn inject(record: TcpStreamRecord, opts: &RepairOptions) -> Result<OwnedFd> {
    let deadline = Deadline::after(opts.timeout);
    let local = record.local();
    let remote = record.remote();
    if family(&local) != family(&remote) {
        return Err(SocketError::UnsupportedTransport(format!(
            "mixed address families {local} -> {remote}"
        )));
    }

    let sock = socket(
        family(&local),
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        SockProtocol::Tcp,
    )?;
    let repair = RepairSocket::enter(sock.as_fd(), OnDrop::Stay)?;
    let state = record.repair();

    let inq_len = record.recv_queue().len() as u32;
    let outq_len = record.send_queue().len() as u32;
    repair.set_queue_seq(Queue::Recv, state.inq_seq.wrapping_sub(inq_len))?;
    repair.set_queue_seq(Queue::Send, state.outq_seq.wrapping_sub(outq_len))?;

    // Repair mode forces address reuse for the bind, and connect only hashes
    // the socket without sending anything.
    bind(sock.as_raw_fd(), &SockaddrStorage::from(local))?;
    connect(sock.as_raw_fd(), &SockaddrStorage::from(remote))?;

    repair.set_options(&NegotiatedOptions {
        mss_clamp: state.mss_clamp,
        sack: state.sack_ok,
        timestamps: state.timestamp_ok,
        wscale: state
            .wscale_ok
            .then_some((state.snd_wscale, state.rcv_wscale)),
    })?;
    if state.timestamp_ok {
        repair.set_timestamp(state.timestamp)?;
    }

    let (sent, unsent) = record.split_send_queue();
    repair.fill_queue(Queue::Recv, record.recv_queue(), &deadline)?;
    repair.fill_queue(Queue::Send, sent, &deadline)?;

    if let Some(w) = state.window {
        repair.set_window(&TcpRepairWindow {
            snd_wl1: w.snd_wl1,
            snd_wnd: w.snd_wnd,
            max_window: w.max_window,
            rcv_wnd: w.rcv_wnd,
            rcv_wup: w.rcv_wup,
        })?;
        // Transmitting the unsent tail advertises a fresh window, so the
        // window is compared before that.
        verify_window(&w, repair.window()?)?;
    }

    record.options().apply(sock.as_fd())?;
    repair.send_unsent(unsent, &deadline)?;

    let inq_seq = repair.queue_seq(Queue::Recv)?;
    let outq_seq = repair.queue_seq(Queue::Send)?;
    verify_seqs(state, inq_seq, outq_seq)?;

    repair.leave()?;
    setsockopt(&sock, sockopt::ReuseAddr, &record.options().reuse_addr)?;

    tracing::debug!(
        fd = sock.as_raw_fd(),
        %local,
        %remote,
        inq = inq_len,
        outq = outq_len,
        "restored tcp stream"
    );
    Ok(sock)
}

/// Closes a socket returned by [`inject`] that will never be handed out.
/// It is frozen first, so the peer is told nothing and the connection can be
/// restored again from the same record.
pub(crate) fn discard(fd: OwnedFd) {
    match RepairSocket::enter(fd.as_fd(), OnDrop::Stay) {
        Ok(repair) => repair.keep(),
        Err(err) => tracing::warn!(fd = fd.as_raw_fd(), ?err, "closing unfrozen socket"),
    }
    drop(fd);
}

fn verify_seqs(state: &TcpRepairState, inq_seq: u32, outq_seq: u32) -> Result<()> {
    if inq_seq != state.inq_seq || outq_seq != state.outq_seq {
        return Err(SocketError::ReplayInconsistency(format!(
            "sequence numbers read back as {inq_seq}/{outq_seq}, expected {}/{}",
            state.inq_seq, state.outq_seq
        )));
    }
    Ok(())
}

fn verify_window(wanted: &WindowState, got: Option<TcpRepairWindow>) -> Result<()> {
    let Some(got) = got else {
        return Err(SocketError::ReplayInconsistency(
            "repair window cannot be read back".to_string(),
        ));
    };
    let got = WindowState {
        snd_wl1: got.snd_wl1,
        snd_wnd: got.snd_wnd,
        max_window: got.max_window,
        rcv_wnd: got.rcv_wnd,
        rcv_wup: got.rcv_wup,
    };
    if got != *wanted {
        return Err(SocketError::ReplayInconsistency(format!(
            "window read back as {got:?}, expected {wanted:?}"
        )));
    }
    Ok(())
}
