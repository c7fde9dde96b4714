//! Captures one TCP connection of a running process.
use std::fs::{self, File};
use std::os::fd::{AsFd, RawFd};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use librevive::servicefd::ServiceFd;
use librevive::socket::{self, RepairOptions};
use librevive::ProcessContext;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use super::image::write_record;
use super::pidfd_getfd;

/// Dump a connected TCP socket of a running process
#[derive(Parser, Debug)]
pub struct Dump {
    /// Process owning the connection
    #[clap(long)]
    pub pid: i32,
    /// Descriptor number of the connection inside that process
    #[clap(long)]
    pub fd: RawFd,
    /// Directory for the socket image
    #[clap(long, default_value = "checkpoint")]
    pub image_path: PathBuf,
    /// Let the process and its connection run on after the dump
    #[clap(long)]
    pub leave_running: bool,
}

pub fn dump(args: Dump, ctx: &mut ProcessContext, repair: &RepairOptions) -> Result<i32> {
    let pid = Pid::from_raw(args.pid);
    tracing::debug!(%pid, fd = args.fd, "start dumping connection");

    fs::create_dir_all(&args.image_path)
        .with_context(|| format!("failed to create {}", args.image_path.display()))?;
    let dir = File::open(&args.image_path)
        .with_context(|| format!("failed to open {}", args.image_path.display()))?;
    ctx.fds_mut().bind(ServiceFd::ImageDirectory, dir)?;

    let sock = pidfd_getfd(pid, args.fd)?;
    let record = socket::extract(sock.as_fd(), repair)
        .with_context(|| format!("failed to capture descriptor {} of {pid}", args.fd))?;
    ctx.emit_fields(
        librevive::log::LogLevel::Info,
        "captured connection",
        &[
            ("local", &record.local()),
            ("remote", &record.remote()),
            ("inq", &record.recv_queue().len()),
            ("outq", &record.send_queue().len()),
        ],
    );

    write_record(ctx.fds(), args.fd, &record)?;
    ctx.fds_mut().release(ServiceFd::ImageDirectory)?;

    if args.leave_running {
        socket::resume(sock.as_fd(), &record)?;
        ctx.info("connection left running");
    } else {
        // The process dies with the socket frozen, the peer sees nothing.
        kill(pid, Signal::SIGKILL).with_context(|| format!("failed to kill {pid}"))?;
        ctx.info("dumped process killed");
    }

    Ok(0)
}
