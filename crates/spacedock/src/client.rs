//! Page-side bundle frame management.
//!
//! The page keeps a bounded pool of live bundle frames. Inserting past
//! capacity evicts the least-recently-accessed frame, which receives an
//! explicit unload signal (an `unloadBundle` request on its behalf) before
//! it is dropped. This is the only admission-control policy on the client
//! side of the daemon.

use spacedock_daemon::FramePool;
use spacedock_daemon::frame_pool::DEFAULT_FRAME_CAPACITY;
use spacedock_surface::ipc::{BundleCtx, Ctx, IpcClient, IpcError, Request};

/// What the page knows about one live frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameInfo {
    pub app_slug: String,
}

pub struct FrameManager {
    client: IpcClient,
    pool: FramePool<String, FrameInfo>,
}

impl FrameManager {
    pub fn new(client: IpcClient) -> Self {
        Self::with_capacity(client, DEFAULT_FRAME_CAPACITY)
    }

    pub fn with_capacity(client: IpcClient, capacity: usize) -> Self {
        Self {
            client,
            pool: FramePool::new(capacity),
        }
    }

    /// Register a frame for a bundle. If the pool was full, the evicted
    /// bundle is unloaded on the daemon before this returns.
    pub fn insert(
        &mut self,
        launcher_bundle_id: &str,
        info: FrameInfo,
    ) -> Result<Option<String>, IpcError> {
        let evicted = self.pool.insert(launcher_bundle_id.to_string(), info);
        let Some((evicted_id, _)) = evicted else {
            return Ok(None);
        };
        let response = self.client.request(&Request::UnloadBundle {
            ctx: BundleCtx {
                ctx: Ctx { id: None },
                launcher_bundle_id: evicted_id.clone(),
            },
        })?;
        if !response.success {
            tracing::warn!(bundle = %evicted_id, "evicted frame unload rejected");
        }
        Ok(Some(evicted_id))
    }

    /// Touch a frame, keeping it hot in the pool.
    pub fn access(&mut self, launcher_bundle_id: &str) -> Option<&FrameInfo> {
        self.pool.access(&launcher_bundle_id.to_string())
    }

    /// Frame count currently held.
    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }
}
