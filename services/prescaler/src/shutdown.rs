//! Process-wide shutdown signal.

use tokio::sync::watch;

/// Resolves once `true` has been sent. If the sender is gone without
/// signalling, never resolves.
pub async fn requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
