//! Process-wide cancellation over a `watch::Receiver<bool>`

use tokio::sync::watch;

/// Resolves once shutdown is signalled. A dropped sender counts as shutdown.
pub async fn signalled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Non-blocking check
pub fn is_signalled(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signalled_resolves_on_true() {
        let (tx, mut rx) = watch::channel(false);
        assert!(!is_signalled(&rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), signalled(&mut rx)).await.unwrap();
        assert!(is_signalled(&rx));
    }

    #[tokio::test]
    async fn test_dropped_sender_counts_as_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), signalled(&mut rx)).await.unwrap();
    }

    #[tokio::test]
    async fn test_pending_while_running() {
        let (_tx, mut rx) = watch::channel(false);
        let waited = tokio::time::timeout(Duration::from_millis(20), signalled(&mut rx)).await;
        assert!(waited.is_err());
    }
}
