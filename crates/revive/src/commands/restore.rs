//! Rebuilds a dumped TCP connection inside a freshly started program.
use std::convert::Infallible;
use std::ffi::CString;
use std::fs::File;
use std::os::fd::RawFd;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use librevive::log::write_pidfile;
use librevive::restore::{
    barrier_channel, install_resources, ChildBarrier, SocketPlan, TcpInjector, TreeRestore,
};
use librevive::servicefd::ServiceFd;
use librevive::socket::RepairOptions;
use librevive::ProcessContext;
use nix::sys::wait::waitpid;
use nix::unistd::{self, ForkResult};

use super::handle_foreground;
use super::image::read_record;

/// Restore a dumped TCP connection into a new process
#[derive(Parser, Debug)]
pub struct Restore {
    /// Directory holding the socket image
    #[clap(long, default_value = "checkpoint")]
    pub image_path: PathBuf,
    /// Descriptor number the connection was dumped from, the restored
    /// program finds it at the same number
    #[clap(long)]
    pub fd: RawFd,
    /// Specify the file to write the process id to
    #[clap(long)]
    pub pid_file: Option<PathBuf>,
    /// Do not wait for the restored program
    #[clap(short, long)]
    pub detach: bool,
    /// Program to run, followed by its arguments
    #[clap(required = true, last = true)]
    pub command: Vec<String>,
}

pub fn restore(args: Restore, ctx: &mut ProcessContext, repair: &RepairOptions) -> Result<i32> {
    if ctx.fds().reserved_range().contains(&args.fd) {
        bail!("descriptor {} is reserved for the engine", args.fd);
    }

    let dir = File::open(&args.image_path)
        .with_context(|| format!("failed to open {}", args.image_path.display()))?;
    ctx.fds_mut().bind(ServiceFd::ImageDirectory, dir)?;
    let record = read_record(ctx.fds(), args.fd)?;
    ctx.fds_mut().release(ServiceFd::ImageDirectory)?;

    let argv = args
        .command
        .iter()
        .map(|arg| CString::new(arg.as_bytes()))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| "command contains a NUL byte")?;

    let (mut parent, mut child) = barrier_channel()?;
    match unsafe { unistd::fork()? } {
        ForkResult::Child => {
            let _ = parent.close();
            let err = match run_child(ctx, child, &argv) {
                Ok(never) => match never {},
                Err(err) => err,
            };
            ctx.error(&format!("restored process failed: {err:#}"));
            std::process::exit(1);
        }
        ForkResult::Parent { child: pid } => {
            child.close()?;

            let mut tree = TreeRestore::new(TcpInjector::new(*repair));
            tree.add_child(
                parent,
                vec![SocketPlan {
                    target_fd: args.fd,
                    record,
                }],
            );
            if let Err(err) = tree.run() {
                let _ = waitpid(pid, None);
                return Err(err).with_context(|| "failed to restore the connection");
            }
            ctx.emit_fields(
                librevive::log::LogLevel::Info,
                "released restored process",
                &[("pid", &pid), ("fd", &args.fd)],
            );

            if let Some(pid_file) = &args.pid_file {
                write_pidfile(pid_file, pid)
                    .with_context(|| format!("failed to write {}", pid_file.display()))?;
            }
            if args.detach {
                return Ok(0);
            }
            handle_foreground(pid)
        }
    }
}

fn run_child(
    ctx: &mut ProcessContext,
    mut barrier: ChildBarrier,
    argv: &[CString],
) -> Result<Infallible> {
    ctx.after_fork(unistd::getpid());
    if let Err(errno) = prctl::set_name("revive:restore") {
        tracing::debug!(errno, "failed to set process name");
    }

    barrier.notify_ready()?;
    let resources = barrier.wait_for_release()?;
    barrier.close()?;
    install_resources(resources)?;
    ctx.debug("connection installed, executing program");

    // Reserved descriptors are close-on-exec.
    let program = &argv[0];
    Ok(unistd::execvp(program, argv)?)
}
