//! Reserved descriptor table
//!
//! The engine keeps its own descriptors (log output, log directory, control
//! channels) at fixed numbers carved from the top of the descriptor space, so
//! that a restored program can claim any lower number without clashing with
//! them. Every slot number is derived from the soft `RLIMIT_NOFILE` limit:
//!
//! ```text
//!   limit - 1 - slot - SLOT_COUNT * id
//! ```
//!
//! where `id` separates tables of processes that share one descriptor table.

use std::fmt;
use std::ops::Range;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::resource::{getrlimit, Resource};
use nix::sys::stat::Mode;
use nix::unistd::{close, dup3};
use nix::NixPath;

/// Fallback used when no log output has been bound.
pub const DEFAULT_LOG_FD: RawFd = libc::STDERR_FILENO;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceFd {
    LogOutput,
    LogDirectory,
    ImageDirectory,
    DumpControl,
    RestoreControl,
}

const SLOT_COUNT: usize = 5;

impl ServiceFd {
    pub const ALL: [ServiceFd; SLOT_COUNT] = [
        ServiceFd::LogOutput,
        ServiceFd::LogDirectory,
        ServiceFd::ImageDirectory,
        ServiceFd::DumpControl,
        ServiceFd::RestoreControl,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ServiceFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceFd::LogOutput => "log-output",
            ServiceFd::LogDirectory => "log-directory",
            ServiceFd::ImageDirectory => "image-directory",
            ServiceFd::DumpControl => "dump-control",
            ServiceFd::RestoreControl => "restore-control",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceFdError {
    #[error("no reserved descriptor available for {slot} (wanted {target:?})")]
    ResourceExhausted {
        slot: ServiceFd,
        target: Option<RawFd>,
    },
    #[error("descriptor {fd} is not open")]
    InvalidHandle { fd: RawFd },
    #[error("failed to query the descriptor limit")]
    Rlimit(#[source] nix::Error),
    #[error("failed to install {slot}")]
    Install {
        slot: ServiceFd,
        #[source]
        source: nix::Error,
    },
    #[error("failed to close {slot}")]
    Close {
        slot: ServiceFd,
        #[source]
        source: nix::Error,
    },
}

type Result<T> = std::result::Result<T, ServiceFdError>;

#[derive(Debug)]
pub struct ServiceFdTable {
    base: RawFd,
    id: i32,
    bound: [bool; SLOT_COUNT],
}

impl ServiceFdTable {
    /// Creates a table whose slots sit right below the soft descriptor limit.
    pub fn new() -> Result<Self> {
        Self::with_id(0)
    }

    pub fn with_id(id: i32) -> Result<Self> {
        let (soft, _) = getrlimit(Resource::RLIMIT_NOFILE).map_err(ServiceFdError::Rlimit)?;
        let base = RawFd::try_from(soft).unwrap_or(RawFd::MAX);
        Ok(Self::with_base(base, id))
    }

    /// `base` is the first descriptor number that is *not* usable.
    pub fn with_base(base: RawFd, id: i32) -> Self {
        tracing::trace!(base, id, "reserved descriptor band");
        Self {
            base,
            id,
            bound: [false; SLOT_COUNT],
        }
    }

    /// First number above this table's band, `None` when `id` pushes the
    /// band out of the descriptor space.
    fn band_top(&self) -> Option<RawFd> {
        let below = (SLOT_COUNT as RawFd).checked_mul(self.id)?;
        self.base.checked_sub(below).filter(|top| *top > 0)
    }

    /// The reserved number of `slot`, `None` when it would be negative.
    pub fn slot_fd(&self, slot: ServiceFd) -> Option<RawFd> {
        self.band_top()?
            .checked_sub(1 + slot.index() as RawFd)
            .filter(|fd| *fd >= 0)
    }

    /// The band of descriptor numbers owned by this table, application
    /// descriptors must stay below `start`. Empty when the band does not fit.
    pub fn reserved_range(&self) -> Range<RawFd> {
        match self.band_top() {
            Some(top) => top.saturating_sub(SLOT_COUNT as RawFd).max(0)..top,
            None => 0..0,
        }
    }

    pub fn is_bound(&self, slot: ServiceFd) -> bool {
        self.bound[slot.index()]
    }

    /// Duplicates `fd` into the slot's reserved number and returns it.
    ///
    /// The passed handle is dropped on return, so handing over an `OwnedFd`
    /// closes the temporary. A slot that is already bound is replaced
    /// atomically with `dup3`; the old occupant stays in place if that fails.
    pub fn bind<Fd: AsFd>(&mut self, slot: ServiceFd, fd: Fd) -> Result<RawFd> {
        let source = fd.as_fd().as_raw_fd();
        let Some(target) = self.slot_fd(slot) else {
            return Err(ServiceFdError::ResourceExhausted { slot, target: None });
        };

        // F_GETFD is the cheapest way to tell a closed descriptor apart
        // from a full table.
        if let Err(Errno::EBADF) = fcntl(source, FcntlArg::F_GETFD) {
            return Err(ServiceFdError::InvalidHandle { fd: source });
        }

        let installed = if self.is_bound(slot) {
            dup3(source, target, OFlag::O_CLOEXEC)
        } else {
            fcntl(source, FcntlArg::F_DUPFD_CLOEXEC(target))
        }
        .map_err(|err| match err {
            Errno::EBADF => ServiceFdError::InvalidHandle { fd: source },
            Errno::EMFILE | Errno::EINVAL => ServiceFdError::ResourceExhausted {
                slot,
                target: Some(target),
            },
            source => ServiceFdError::Install { slot, source },
        })?;

        if installed != target {
            // Something else already lives at the reserved number.
            let _ = close(installed);
            tracing::error!(%slot, target, installed, "reserved descriptor is occupied");
            return Err(ServiceFdError::ResourceExhausted {
                slot,
                target: Some(target),
            });
        }

        self.bound[slot.index()] = true;
        tracing::trace!(%slot, fd = target, "bound reserved descriptor");
        Ok(target)
    }

    /// Never allocates and never fails, `None` means the slot is unbound.
    pub fn lookup(&self, slot: ServiceFd) -> Option<RawFd> {
        if !self.is_bound(slot) {
            return None;
        }
        self.slot_fd(slot)
    }

    pub fn borrow(&self, slot: ServiceFd) -> Option<BorrowedFd<'_>> {
        // SAFETY: a bound slot is an open descriptor owned by this table
        // until `release` closes it.
        self.lookup(slot)
            .map(|fd| unsafe { BorrowedFd::borrow_raw(fd) })
    }

    fn dir_fd(&self, slot: ServiceFd) -> RawFd {
        self.lookup(slot).unwrap_or(libc::AT_FDCWD)
    }

    /// Opens `path` relative to the directory bound to `slot`, or to the
    /// working directory while the slot is unbound. The result is
    /// close-on-exec.
    pub fn open_at<P: ?Sized + NixPath>(
        &self,
        slot: ServiceFd,
        path: &P,
        flags: OFlag,
        mode: Mode,
    ) -> nix::Result<OwnedFd> {
        let dirfd = self.dir_fd(slot);
        let fd = path.with_nix_path(|cstr| unsafe {
            libc::openat(
                dirfd,
                cstr.as_ptr(),
                (flags | OFlag::O_CLOEXEC).bits(),
                mode.bits() as libc::c_uint,
            )
        })?;
        let fd = Errno::result(fd)?;
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// Renames `from` to `to` inside the directory bound to `slot`.
    pub fn rename_at<P: ?Sized + NixPath, Q: ?Sized + NixPath>(
        &self,
        slot: ServiceFd,
        from: &P,
        to: &Q,
    ) -> nix::Result<()> {
        let dirfd = self.dir_fd(slot);
        let ret = from.with_nix_path(|from| {
            to.with_nix_path(|to| unsafe {
                libc::renameat(dirfd, from.as_ptr(), dirfd, to.as_ptr())
            })
        })??;
        Errno::result(ret).map(drop)
    }

    pub fn log_fd(&self) -> RawFd {
        self.lookup(ServiceFd::LogOutput).unwrap_or(DEFAULT_LOG_FD)
    }

    /// Tells whether `fd` is one of this table's bound descriptors.
    pub fn is_reserved(&self, fd: RawFd) -> bool {
        ServiceFd::ALL
            .iter()
            .any(|slot| self.lookup(*slot) == Some(fd))
    }

    pub fn release(&mut self, slot: ServiceFd) -> Result<()> {
        let Some(fd) = self.lookup(slot) else {
            return Ok(());
        };

        // Linux drops the descriptor even when close reports an error, so
        // the slot is unbound either way.
        self.bound[slot.index()] = false;
        match close(fd) {
            Ok(()) | Err(Errno::EBADF) => Ok(()),
            Err(source) => Err(ServiceFdError::Close { slot, source }),
        }
    }

    pub fn release_all(&mut self) -> Result<()> {
        let mut first_err = None;
        for slot in ServiceFd::ALL {
            if let Err(err) = self.release(slot) {
                tracing::warn!(%slot, ?err, "failed to release reserved descriptor");
                first_err.get_or_insert(err);
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};

    use anyhow::Result;
    use serial_test::serial;

    use super::*;

    fn open_fds() -> Result<Vec<RawFd>> {
        let fds = procfs::process::Process::myself()?
            .fd()?
            .filter_map(|info| info.ok())
            .map(|info| info.fd)
            .collect();
        Ok(fds)
    }

    #[test]
    #[serial]
    fn test_bind_lands_outside_application_descriptors() -> Result<()> {
        let _files: Vec<File> = (0..8)
            .map(|_| tempfile::tempfile())
            .collect::<std::io::Result<_>>()?;
        let mut table = ServiceFdTable::new()?;
        let app_fds = open_fds()?;

        for slot in [ServiceFd::LogOutput, ServiceFd::LogDirectory] {
            let fd = table.bind(slot, OwnedFd::from(tempfile::tempfile()?))?;
            assert_eq!(table.lookup(slot), Some(fd));
            assert!(!app_fds.contains(&fd));
            assert!(table.reserved_range().contains(&fd));
            assert!(app_fds.iter().all(|app| *app < table.reserved_range().start));
        }

        table.release_all()?;
        Ok(())
    }

    #[test]
    #[serial]
    fn test_bind_closes_temporary_handle() -> Result<()> {
        let mut table = ServiceFdTable::new()?;
        let temp = OwnedFd::from(tempfile::tempfile()?);
        let raw = temp.as_raw_fd();
        table.bind(ServiceFd::DumpControl, temp)?;

        assert_eq!(fcntl(raw, FcntlArg::F_GETFD), Err(Errno::EBADF));
        table.release_all()?;
        Ok(())
    }

    #[test]
    #[serial]
    fn test_release_is_idempotent() -> Result<()> {
        let mut table = ServiceFdTable::new()?;
        let fd = table.bind(ServiceFd::RestoreControl, OwnedFd::from(tempfile::tempfile()?))?;

        table.release(ServiceFd::RestoreControl)?;
        assert_eq!(table.lookup(ServiceFd::RestoreControl), None);
        assert_eq!(fcntl(fd, FcntlArg::F_GETFD), Err(Errno::EBADF));

        table.release(ServiceFd::RestoreControl)?;
        table.release(ServiceFd::RestoreControl)?;
        assert_eq!(table.lookup(ServiceFd::RestoreControl), None);
        Ok(())
    }

    #[test]
    #[serial]
    fn test_bind_rejects_closed_descriptor() -> Result<()> {
        let mut table = ServiceFdTable::new()?;
        let raw = tempfile::tempfile()?.into_raw_fd();
        close(raw)?;

        let closed = unsafe { BorrowedFd::borrow_raw(raw) };
        let err = table.bind(ServiceFd::LogOutput, closed).unwrap_err();
        assert!(matches!(err, ServiceFdError::InvalidHandle { fd } if fd == raw));
        assert!(!table.is_bound(ServiceFd::LogOutput));
        Ok(())
    }

    #[test]
    #[serial]
    fn test_rebind_replaces_previous_occupant() -> Result<()> {
        let mut table = ServiceFdTable::new()?;
        let first = table.bind(ServiceFd::LogOutput, OwnedFd::from(tempfile::tempfile()?))?;

        let mut second = tempfile::tempfile()?;
        let again = table.bind(ServiceFd::LogOutput, &second)?;
        assert_eq!(first, again);

        let mut slot = unsafe { File::from_raw_fd(libc::dup(again)) };
        slot.write_all(b"second")?;
        second.seek(SeekFrom::Start(0))?;
        let mut buf = String::new();
        second.read_to_string(&mut buf)?;
        assert_eq!(buf, "second");

        table.release_all()?;
        Ok(())
    }

    #[test]
    #[serial]
    fn test_occupied_target_is_exhausted() -> Result<()> {
        let app = tempfile::tempfile()?;
        let app_fd = app.as_raw_fd();
        // Place the band so that LogOutput collides with `app`.
        let mut table = ServiceFdTable::with_base(app_fd + 1, 0);
        assert_eq!(table.slot_fd(ServiceFd::LogOutput), Some(app_fd));

        let err = table
            .bind(ServiceFd::LogOutput, OwnedFd::from(tempfile::tempfile()?))
            .unwrap_err();
        assert!(matches!(err, ServiceFdError::ResourceExhausted { .. }));
        assert!(fcntl(app_fd, FcntlArg::F_GETFD).is_ok());
        assert_eq!(table.lookup(ServiceFd::LogOutput), None);
        Ok(())
    }

    #[test]
    fn test_tables_with_different_ids_do_not_overlap() {
        let first = ServiceFdTable::with_base(1024, 0);
        let second = ServiceFdTable::with_base(1024, 1);

        assert_eq!(first.reserved_range(), 1019..1024);
        assert_eq!(second.reserved_range(), 1014..1019);
        for slot in ServiceFd::ALL {
            assert!(first.slot_fd(slot).is_some_and(|fd| first.reserved_range().contains(&fd)));
            assert!(second.slot_fd(slot).is_some_and(|fd| second.reserved_range().contains(&fd)));
        }
    }

    #[test]
    fn test_large_id_is_exhausted_not_overflowed() {
        let mut table = ServiceFdTable::with_base(1024, i32::MAX);
        assert_eq!(table.slot_fd(ServiceFd::LogOutput), None);
        assert!(table.reserved_range().is_empty());

        let err = table
            .bind(ServiceFd::LogOutput, std::io::stderr().as_fd())
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceFdError::ResourceExhausted { target: None, .. }
        ));

        let mut negative = ServiceFdTable::with_base(1024, i32::MIN);
        assert_eq!(negative.slot_fd(ServiceFd::RestoreControl), None);
        assert!(negative
            .bind(ServiceFd::RestoreControl, std::io::stderr().as_fd())
            .is_err());

        // the band ends below zero for the last slots
        let tiny = ServiceFdTable::with_base(3, 0);
        assert_eq!(tiny.slot_fd(ServiceFd::LogOutput), Some(2));
        assert_eq!(tiny.slot_fd(ServiceFd::RestoreControl), None);
        assert_eq!(tiny.reserved_range(), 0..3);
    }

    #[test]
    #[serial]
    fn test_open_and_rename_inside_bound_directory() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut table = ServiceFdTable::new()?;
        table.bind(ServiceFd::ImageDirectory, File::open(dir.path())?)?;

        let fd = table.open_at(
            ServiceFd::ImageDirectory,
            "image.tmp",
            OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_EXCL,
            Mode::from_bits_truncate(0o600),
        )?;
        let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFD)?;
        assert!(nix::fcntl::FdFlag::from_bits_truncate(flags)
            .contains(nix::fcntl::FdFlag::FD_CLOEXEC));
        File::from(fd).write_all(b"saved")?;

        table.rename_at(ServiceFd::ImageDirectory, "image.tmp", "image")?;
        assert!(!dir.path().join("image.tmp").exists());
        assert_eq!(std::fs::read_to_string(dir.path().join("image"))?, "saved");

        let missing = table.open_at(
            ServiceFd::ImageDirectory,
            "absent",
            OFlag::O_RDONLY,
            Mode::empty(),
        );
        assert_eq!(missing.unwrap_err(), Errno::ENOENT);

        table.release_all()?;
        Ok(())
    }

    #[test]
    #[serial]
    fn test_is_reserved_only_for_bound_slots() -> Result<()> {
        let mut table = ServiceFdTable::new()?;
        let log_dir = table
            .slot_fd(ServiceFd::LogDirectory)
            .ok_or_else(|| anyhow::anyhow!("no log directory slot"))?;
        assert!(!table.is_reserved(log_dir));

        table.bind(ServiceFd::LogDirectory, File::open(".")?)?;
        assert!(table.is_reserved(log_dir));
        assert!(!table.is_reserved(libc::STDERR_FILENO));
        assert_eq!(table.log_fd(), DEFAULT_LOG_FD);

        table.release_all()?;
        assert!(!table.is_reserved(log_dir));
        Ok(())
    }
}
