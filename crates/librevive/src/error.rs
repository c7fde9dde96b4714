use crate::channel::ChannelError;
use crate::log::LogError;
use crate::restore::SyncError;
use crate::servicefd::ServiceFdError;
use crate::socket::SocketError;

#[derive(Debug, thiserror::Error)]
pub enum ReviveError {
    #[error(transparent)]
    ServiceFd(#[from] ServiceFdError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

pub type Result<T> = std::result::Result<T, ReviveError>;
