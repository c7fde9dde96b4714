//! # revive
//! Moves a live TCP connection out of one process and into a new one.

mod commands;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use librevive::log::LogOptions;
use librevive::socket::RepairOptions;
use librevive::ProcessContext;

#[derive(Parser, Debug)]
#[clap(version, about, author)]
struct Opts {
    #[clap(flatten)]
    global: GlobalOpts,
    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(clap::Args, Debug)]
struct GlobalOpts {
    /// Engine log file, "-" logs to standard output
    #[clap(long, global = true)]
    log_file: Option<PathBuf>,
    /// Log verbosity from 1 (errors) to 4 (debug), 0 keeps the default
    #[clap(long, global = true, default_value_t = 0)]
    log_level: u32,
    /// Give every restored process its own log file named <log-file>.<pid>
    #[clap(long, global = true)]
    log_pid: bool,
    /// Upper bound for waiting TCP repair calls, in milliseconds
    #[clap(long, global = true, default_value_t = 5000)]
    timeout_ms: u64,
}

impl GlobalOpts {
    fn log_options(&self) -> LogOptions {
        LogOptions {
            level: self.log_level,
            output: self.log_file.clone(),
            per_pid_files: self.log_pid,
        }
    }

    fn repair_options(&self) -> RepairOptions {
        RepairOptions {
            timeout: Duration::from_millis(self.timeout_ms),
            ..Default::default()
        }
    }
}

#[derive(Subcommand, Debug)]
enum SubCommand {
    Dump(commands::dump::Dump),
    Restore(commands::restore::Restore),
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let opts = Opts::parse();
    let repair = opts.global.repair_options();
    let mut ctx = ProcessContext::new(opts.global.log_options())
        .with_context(|| "failed to set up the engine log")?;

    let (what, result) = match opts.subcmd {
        SubCommand::Dump(args) => ("Dumping", commands::dump::dump(args, &mut ctx, &repair)),
        SubCommand::Restore(args) => (
            "Restoring",
            commands::restore::restore(args, &mut ctx, &repair),
        ),
    };

    match result {
        Ok(code) => {
            ctx.msg(&format!("{what} finished successfully"));
            ctx.teardown()?;
            std::process::exit(code);
        }
        Err(err) => {
            ctx.error(&format!("{err:#}"));
            ctx.msg(&format!("{what} FAILED."));
            if let Err(err) = ctx.teardown() {
                tracing::warn!(?err, "failed to release reserved descriptors");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dump() {
        let opts = Opts::try_parse_from([
            "revive",
            "--log-level",
            "4",
            "dump",
            "--pid",
            "42",
            "--fd",
            "3",
            "--image-path",
            "/tmp/img",
            "--leave-running",
        ])
        .unwrap();
        assert_eq!(opts.global.log_options().level, 4);
        match opts.subcmd {
            SubCommand::Dump(dump) => {
                assert_eq!(dump.pid, 42);
                assert_eq!(dump.fd, 3);
                assert_eq!(dump.image_path, PathBuf::from("/tmp/img"));
                assert!(dump.leave_running);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_restore_command() {
        let opts = Opts::try_parse_from([
            "revive",
            "restore",
            "--fd",
            "5",
            "--log-file",
            "restore.log",
            "--log-pid",
            "--timeout-ms",
            "250",
            "--",
            "cat",
            "-u",
        ])
        .unwrap();
        let log = opts.global.log_options();
        assert_eq!(log.output, Some(PathBuf::from("restore.log")));
        assert!(log.per_pid_files);
        assert_eq!(
            opts.global.repair_options().timeout,
            Duration::from_millis(250)
        );
        match opts.subcmd {
            SubCommand::Restore(restore) => {
                assert_eq!(restore.fd, 5);
                assert_eq!(restore.image_path, PathBuf::from("checkpoint"));
                assert_eq!(restore.command, vec!["cat", "-u"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_restore_requires_command() {
        assert!(Opts::try_parse_from(["revive", "restore", "--fd", "5"]).is_err());
    }
}
