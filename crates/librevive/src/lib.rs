pub mod channel;
pub mod context;
pub mod error;
pub mod log;
pub mod restore;
pub mod servicefd;
pub mod socket;

pub use context::ProcessContext;
pub use error::{ReviveError, Result};
