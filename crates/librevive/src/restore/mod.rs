//! Ordering between a restoring parent and the children it forks.
//!
//! Every child owns a one-shot barrier. The child announces itself, then
//! blocks until the parent has injected all of its resources and releases it,
//! or until the whole tree restore is aborted.

mod barrier;
mod message;
mod tree;

use std::os::fd::RawFd;

use nix::unistd::Pid;

pub use barrier::{
    barrier_channel, install_resources, BarrierState, ChildBarrier, ParentBarrier, MAX_RESOURCES,
};
pub use message::Message;
pub use tree::{ChildId, Injector, SocketPlan, TcpInjector, TreeRestore};

use crate::channel::ChannelError;
use crate::socket::SocketError;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("barrier cannot move from {from} to {to}")]
    InvalidTransition { from: BarrierState, to: BarrierState },
    #[error("restore aborted: {0}")]
    Aborted(String),
    #[error("received unexpected message {received}, expected {expected}")]
    UnexpectedMessage {
        expected: &'static str,
        received: Message,
    },
    #[error("failed to inject descriptor {target} for {pid:?}")]
    InjectionFailed {
        pid: Option<Pid>,
        target: RawFd,
        #[source]
        source: SocketError,
    },
    #[error("too many resources for one child")]
    TooManyResources,
    #[error("release carried {received} descriptors for {expected} targets")]
    MissingResources { expected: usize, received: usize },
    #[error("failed to install descriptor {target}")]
    Install {
        target: RawFd,
        #[source]
        source: nix::Error,
    },
    #[error(transparent)]
    Channel(#[from] ChannelError),
}
