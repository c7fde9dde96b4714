//! Socket images, kept in the directory bound to the image slot.
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::RawFd;

use anyhow::{Context, Result};
use librevive::servicefd::{ServiceFd, ServiceFdTable};
use librevive::socket::TcpStreamRecord;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;

pub(crate) fn image_name(fd: RawFd) -> String {
    format!("tcp-{fd}.json")
}

/// Stores `record` as the image of descriptor `fd`. The image only appears
/// under its final name once it is complete.
pub(crate) fn write_record(fds: &ServiceFdTable, fd: RawFd, record: &TcpStreamRecord) -> Result<()> {
    let name = image_name(fd);
    let tmp = format!("{name}.tmp");
    let image = record.to_json()?;

    let mut file = File::from(
        fds.open_at(
            ServiceFd::ImageDirectory,
            tmp.as_str(),
            OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
            Mode::from_bits_truncate(0o600),
        )
        .with_context(|| format!("failed to create {tmp}"))?,
    );
    file.write_all(&image)
        .and_then(|_| file.sync_all())
        .with_context(|| format!("failed to write {tmp}"))?;

    fds.rename_at(ServiceFd::ImageDirectory, tmp.as_str(), name.as_str())
        .with_context(|| format!("failed to rename {tmp} to {name}"))?;
    tracing::debug!(image = name, len = image.len(), "wrote socket image");
    Ok(())
}

pub(crate) fn read_record(fds: &ServiceFdTable, fd: RawFd) -> Result<TcpStreamRecord> {
    let name = image_name(fd);
    let mut file = File::from(
        fds.open_at(
            ServiceFd::ImageDirectory,
            name.as_str(),
            OFlag::O_RDONLY,
            Mode::empty(),
        )
        .with_context(|| format!("failed to open {name}"))?,
    );
    let mut image = Vec::new();
    file.read_to_end(&mut image)
        .with_context(|| format!("failed to read {name}"))?;
    TcpStreamRecord::from_json(&image).with_context(|| format!("failed to parse {name}"))
}
