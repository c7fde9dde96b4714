use core::fmt;
use std::os::fd::RawFd;

use serde::{Deserialize, Serialize};

/// Messages exchanged over a restore barrier.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum Message {
    /// Child to parent: forked and waiting, carries its pid.
    ChildReady(i32),
    /// Parent to child: resume. The descriptors attached to the message are
    /// to be installed at `targets`, in order.
    Release { targets: Vec<RawFd> },
    /// Parent to child: the tree restore was cancelled.
    Abort(String),
    /// Child to parent: the child could not get ready.
    Failed(String),
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::ChildReady(pid) => write!(f, "ChildReady({pid})"),
            Message::Release { targets } => write!(f, "Release({targets:?})"),
            Message::Abort(reason) => write!(f, "Abort({reason})"),
            Message::Failed(reason) => write!(f, "Failed({reason})"),
        }
    }
}
