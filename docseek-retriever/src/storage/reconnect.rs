//! Serialization of concurrent reconnect requests.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

/// Lets exactly one reconnect run at a time and folds overlapping requests
/// into it.
///
/// A caller that has to wait while another caller's reconnect completes
/// returns that reconnect's outcome instead of closing and reopening the
/// backend a second time.
#[derive(Debug, Default)]
pub struct ReconnectGate {
    lock: Mutex<()>,
    generation: AtomicU64,
}

/// What a call to [`ReconnectGate::run`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// This caller ran the reconnect
    Performed,
    /// Another caller's reconnect finished while this one waited
    Joined,
}

impl ReconnectGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed reconnects.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Run `reconnect` unless a reconnect that started after this call
    /// completes first.
    pub async fn run<F, Fut, E>(&self, reconnect: F) -> Result<ReconnectOutcome, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let observed = self.generation();
        let _guard = self.lock.lock().await;
        if self.generation() != observed {
            tracing::debug!("Joined an in-flight reconnect");
            return Ok(ReconnectOutcome::Joined);
        }

        reconnect().await?;
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(ReconnectOutcome::Performed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_overlapping_callers_share_one_reconnect() {
        let gate = Arc::new(ReconnectGate::new());
        let reopened = Arc::new(AtomicUsize::new(0));

        let attempt = |gate: Arc<ReconnectGate>, reopened: Arc<AtomicUsize>| async move {
            gate.run(|| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                reopened.fetch_add(1, Ordering::SeqCst);
                Ok::<(), std::io::Error>(())
            })
            .await
        };

        let (a, b) = tokio::join!(
            attempt(Arc::clone(&gate), Arc::clone(&reopened)),
            attempt(Arc::clone(&gate), Arc::clone(&reopened)),
        );

        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| *o == ReconnectOutcome::Joined);
        assert_eq!(
            outcomes,
            vec![ReconnectOutcome::Performed, ReconnectOutcome::Joined]
        );
        assert_eq!(reopened.load(Ordering::SeqCst), 1);
        assert_eq!(gate.generation(), 1);
    }

    #[tokio::test]
    async fn test_sequential_calls_each_reconnect() {
        let gate = ReconnectGate::new();
        for _ in 0..2 {
            let outcome = gate.run(|| async { Ok::<(), std::io::Error>(()) }).await;
            assert_eq!(outcome.unwrap(), ReconnectOutcome::Performed);
        }
        assert_eq!(gate.generation(), 2);
    }

    #[tokio::test]
    async fn test_failed_reconnect_does_not_advance() {
        let gate = ReconnectGate::new();
        let outcome = gate
            .run(|| async { Err::<(), _>(std::io::Error::other("disk gone")) })
            .await;
        assert!(outcome.is_err());
        assert_eq!(gate.generation(), 0);
    }
}
