//! Background checks that keep abandoned script pods from piling up.

pub mod orphans;
pub mod pending;

use std::time::Duration;

use tokio_util::sync::CancellationToken;

pub use orphans::OrphanedPodCleaner;
pub use pending::PendingPodWatchdog;

/// Sleep for `period`. Returns false if `cancel` fired first.
pub(crate) async fn sleep_or_cancel(period: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(period) => true,
    }
}
