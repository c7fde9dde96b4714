use std::os::fd::{OwnedFd, RawFd};

use super::barrier::{BarrierState, ParentBarrier};
use super::SyncError;
use crate::socket::{self, RepairOptions, SocketError, TcpStreamRecord};

type Result<T> = std::result::Result<T, SyncError>;

/// Turns a captured socket into a live descriptor.
pub trait Injector {
    fn inject(&mut self, record: TcpStreamRecord) -> std::result::Result<OwnedFd, SocketError>;

    /// Gets rid of an injected descriptor that no child will receive.
    fn discard(&mut self, fd: OwnedFd) {
        drop(fd);
    }
}

/// Injector backed by kernel TCP repair.
#[derive(Debug, Default, Clone)]
pub struct TcpInjector {
    opts: RepairOptions,
}

impl TcpInjector {
    pub fn new(opts: RepairOptions) -> Self {
        Self { opts }
    }
}

impl Injector for TcpInjector {
    fn inject(&mut self, record: TcpStreamRecord) -> std::result::Result<OwnedFd, SocketError> {
        socket::inject(record, &self.opts)
    }

    fn discard(&mut self, fd: OwnedFd) {
        socket::discard(fd);
    }
}

/// A socket to rebuild for a child, and where it has to end up.
#[derive(Debug, Clone)]
pub struct SocketPlan {
    pub target_fd: RawFd,
    pub record: TcpStreamRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildId(usize);

struct Child {
    barrier: ParentBarrier,
    plans: Vec<SocketPlan>,
}

/// Parent side of a tree restore.
///
/// No child is released until every child has all of its resources; the
/// first failure aborts every child that has not been released.
pub struct TreeRestore<I: Injector> {
    injector: I,
    children: Vec<Child>,
}

impl<I: Injector> TreeRestore<I> {
    pub fn new(injector: I) -> Self {
        Self {
            injector,
            children: Vec::new(),
        }
    }

    pub fn add_child(&mut self, barrier: ParentBarrier, plans: Vec<SocketPlan>) -> ChildId {
        self.children.push(Child { barrier, plans });
        ChildId(self.children.len() - 1)
    }

    pub fn state(&self, id: ChildId) -> BarrierState {
        self.children[id.0].barrier.state()
    }

    /// Waits for the child and injects all of its sockets.
    pub fn prepare(&mut self, id: ChildId) -> Result<()> {
        let child = &mut self.children[id.0];
        if child.barrier.state() == BarrierState::Forked {
            child.barrier.wait_for_child_ready()?;
            child.barrier.begin()?;
        }

        for plan in std::mem::take(&mut child.plans) {
            let target = plan.target_fd;
            let fd = self
                .injector
                .inject(plan.record)
                .map_err(|source| SyncError::InjectionFailed {
                    pid: child.barrier.pid(),
                    target,
                    source,
                })?;
            child.barrier.add_resource(target, fd)?;
        }

        child.barrier.mark_ready()
    }

    pub fn release(&mut self, id: ChildId) -> Result<()> {
        let barrier = &mut self.children[id.0].barrier;
        barrier.release()?;
        barrier.close()
    }

    /// Cancels every child that has not been released yet.
    pub fn abort(&mut self, reason: &str) {
        for child in &mut self.children {
            let barrier = &mut child.barrier;
            if barrier.state() == BarrierState::Released {
                continue;
            }
            for (target, fd) in barrier.take_resources() {
                tracing::debug!(pid = ?barrier.pid(), target, "discarding injected socket");
                self.injector.discard(fd);
            }
            if let Err(err) = barrier.abort(reason) {
                tracing::warn!(pid = ?barrier.pid(), ?err, "failed to abort child");
            }
            if let Err(err) = barrier.close() {
                tracing::warn!(pid = ?barrier.pid(), ?err, "failed to close barrier");
            }
        }
    }

    /// Prepares every child, then releases them all.
    pub fn run(&mut self) -> Result<()> {
        let ids: Vec<ChildId> = (0..self.children.len()).map(ChildId).collect();

        for id in &ids {
            if let Err(err) = self.prepare(*id) {
                tracing::error!(?err, "child restore failed, aborting the tree");
                self.abort(&err.to_string());
                return Err(err);
            }
        }

        for id in &ids {
            if let Err(err) = self.release(*id) {
                tracing::error!(?err, "failed to release child, aborting the rest");
                self.abort(&err.to_string());
                return Err(err);
            }
        }
        tracing::debug!(children = ids.len(), "tree released");
        Ok(())
    }
}
