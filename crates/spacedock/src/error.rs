use thiserror::Error;

use crate::daemon::OpError;
use crate::daemon::cache::CacheError;
use crate::daemon::run::RunError;
use crate::store::StoreError;
use spacedock_surface::ipc::IpcError;

/// Crate-level convenience error: a thin wrapper over the capability
/// errors, not a replacement for them.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Op(#[from] OpError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    Run(#[from] RunError),
}
