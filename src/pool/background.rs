use std::sync::Weak;

use tokio_util::sync::CancellationToken;

use super::PoolInner;
use crate::runtime;

/// Starts the maintenance worker for a pool. A weak reference ensures the
/// worker never keeps the pool alive; it exits when the pool is dropped or
/// its token is cancelled by `close`.
pub(super) fn start_maintenance_worker(pool: Weak<PoolInner>, token: CancellationToken) {
    runtime::spawn(async move {
        loop {
            let interval = match pool.upgrade() {
                Some(pool) => {
                    pool.perform_maintenance().await;
                    pool.options.health_check_interval
                }
                None => return,
            };

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    });
}
