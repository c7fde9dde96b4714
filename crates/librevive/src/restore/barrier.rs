use std::fmt;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg};
use nix::unistd::{self, Pid};

use super::message::Message;
use super::SyncError;
use crate::channel::{channel, Receiver, Sender};

/// Most descriptors a single release can hand over.
pub const MAX_RESOURCES: usize = 16;

type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierState {
    Forked,
    ResourcesPending,
    ResourcesReady,
    Released,
    Aborted,
}

impl BarrierState {
    fn can_move_to(self, to: BarrierState) -> bool {
        use BarrierState::*;
        matches!(
            (self, to),
            (Forked, ResourcesPending)
                | (ResourcesPending, ResourcesReady)
                | (ResourcesReady, Released)
                | (Forked | ResourcesPending | ResourcesReady, Aborted)
        )
    }
}

impl fmt::Display for BarrierState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BarrierState::Forked => "forked",
            BarrierState::ResourcesPending => "resources-pending",
            BarrierState::ResourcesReady => "resources-ready",
            BarrierState::Released => "released",
            BarrierState::Aborted => "aborted",
        };
        write!(f, "{name}")
    }
}

// Barrier Design
//
// A barrier is a pair of unidirectional channels. The child sends on
// `to_parent` and listens on `to_child`, the parent does the opposite. Both
// ends are created before the fork; afterwards each side closes the half it
// does not use.

pub fn barrier_channel() -> Result<(ParentBarrier, ChildBarrier)> {
    let (to_child_sender, to_child_receiver) = channel::<Message>()?;
    let (to_parent_sender, to_parent_receiver) = channel::<Message>()?;
    Ok((
        ParentBarrier {
            sender: to_child_sender,
            receiver: to_parent_receiver,
            state: BarrierState::Forked,
            pid: None,
            resources: Vec::new(),
            closed: false,
        },
        ChildBarrier {
            sender: to_parent_sender,
            receiver: to_child_receiver,
            closed: false,
        },
    ))
}

pub struct ParentBarrier {
    sender: Sender<Message>,
    receiver: Receiver<Message>,
    state: BarrierState,
    pid: Option<Pid>,
    resources: Vec<(RawFd, OwnedFd)>,
    closed: bool,
}

impl ParentBarrier {
    pub fn state(&self) -> BarrierState {
        self.state
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    fn advance(&mut self, to: BarrierState) -> Result<()> {
        if !self.state.can_move_to(to) {
            return Err(SyncError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        tracing::debug!(pid = ?self.pid, from = %self.state, %to, "barrier transition");
        self.state = to;
        Ok(())
    }

    /// Blocks until the child has announced itself and returns its pid.
    pub fn wait_for_child_ready(&mut self) -> Result<Pid> {
        match self.receiver.recv()? {
            Message::ChildReady(pid) => {
                let pid = Pid::from_raw(pid);
                self.pid = Some(pid);
                Ok(pid)
            }
            Message::Failed(reason) => {
                self.state = BarrierState::Aborted;
                Err(SyncError::Aborted(reason))
            }
            msg => Err(SyncError::UnexpectedMessage {
                expected: "ChildReady",
                received: msg,
            }),
        }
    }

    pub fn begin(&mut self) -> Result<()> {
        self.advance(BarrierState::ResourcesPending)
    }

    /// Queues `fd` to be installed as `target` in the child.
    pub fn add_resource(&mut self, target: RawFd, fd: OwnedFd) -> Result<()> {
        if self.state != BarrierState::ResourcesPending {
            return Err(SyncError::InvalidTransition {
                from: self.state,
                to: BarrierState::ResourcesPending,
            });
        }
        if self.resources.len() == MAX_RESOURCES {
            return Err(SyncError::TooManyResources);
        }
        self.resources.push((target, fd));
        Ok(())
    }

    /// Takes back every resource queued so far. Nothing is handed over for
    /// them any more.
    pub fn take_resources(&mut self) -> Vec<(RawFd, OwnedFd)> {
        std::mem::take(&mut self.resources)
    }

    pub fn mark_ready(&mut self) -> Result<()> {
        self.advance(BarrierState::ResourcesReady)
    }

    /// Lets the child run, handing over every queued resource.
    pub fn release(&mut self) -> Result<()> {
        self.advance(BarrierState::Released)?;
        let resources = std::mem::take(&mut self.resources);
        let targets: Vec<RawFd> = resources.iter().map(|(target, _)| *target).collect();
        let fds: Vec<RawFd> = resources.iter().map(|(_, fd)| fd.as_raw_fd()).collect();
        self.sender.send_fds(Message::Release { targets }, &fds)?;
        // our copies go away with `resources`
        Ok(())
    }

    /// Cancels the barrier. The child is told to give up; a child that is
    /// already gone is not an error.
    pub fn abort(&mut self, reason: &str) -> Result<()> {
        if self.state == BarrierState::Aborted {
            return Ok(());
        }
        self.advance(BarrierState::Aborted)?;
        self.resources.clear();
        if let Err(err) = self.sender.send(Message::Abort(reason.to_string())) {
            tracing::warn!(pid = ?self.pid, ?err, "failed to deliver abort");
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.sender.close()?;
        self.receiver.close()?;
        Ok(())
    }
}

pub struct ChildBarrier {
    sender: Sender<Message>,
    receiver: Receiver<Message>,
    closed: bool,
}

impl ChildBarrier {
    pub fn notify_ready(&mut self) -> Result<()> {
        let pid = unistd::getpid();
        tracing::debug!(?pid, "child ready, waiting for release");
        self.sender.send(Message::ChildReady(pid.as_raw()))?;
        Ok(())
    }

    pub fn report_failure(&mut self, reason: String) -> Result<()> {
        self.sender.send(Message::Failed(reason))?;
        Ok(())
    }

    /// Blocks until the parent releases or aborts this child.
    pub fn wait_for_release(&mut self) -> Result<Vec<(RawFd, OwnedFd)>> {
        let (msg, fds) = self.receiver.recv_with_fds::<[RawFd; MAX_RESOURCES]>()?;
        let received: Vec<OwnedFd> = fds
            .iter()
            .flatten()
            .filter(|fd| **fd >= 0)
            .map(|fd| unsafe { OwnedFd::from_raw_fd(*fd) })
            .collect();

        match msg {
            Message::Release { targets } => {
                if targets.len() != received.len() {
                    return Err(SyncError::MissingResources {
                        expected: targets.len(),
                        received: received.len(),
                    });
                }
                Ok(targets.into_iter().zip(received).collect())
            }
            Message::Abort(reason) => Err(SyncError::Aborted(reason)),
            msg => Err(SyncError::UnexpectedMessage {
                expected: "Release",
                received: msg,
            }),
        }
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.sender.close()?;
        self.receiver.close()?;
        Ok(())
    }
}

/// Installs released descriptors at their target numbers. The installed
/// descriptors survive exec.
pub fn install_resources(resources: Vec<(RawFd, OwnedFd)>) -> Result<()> {
    let Some(highest) = resources.iter().map(|(target, _)| *target).max() else {
        return Ok(());
    };

    // Move everything above the targets first so no install clobbers a
    // descriptor that is still waiting for its own.
    let mut parked = Vec::with_capacity(resources.len());
    for (target, fd) in resources {
        let raw = fcntl(fd.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(highest + 1))
            .map_err(|source| SyncError::Install { target, source })?;
        drop(fd);
        parked.push((target, unsafe { OwnedFd::from_raw_fd(raw) }));
    }

    for (target, fd) in parked {
        unistd::dup2(fd.as_raw_fd(), target)
            .map_err(|source| SyncError::Install { target, source })?;
        tracing::debug!(target, "installed descriptor");
    }
    Ok(())
}
