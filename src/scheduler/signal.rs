use tokio::sync::watch;

/// One-shot broadcast abort signal for an operation.
///
/// Everything long-running holds a receiver: LLM asks, tool calls, the
/// intervention wait and every executor worker observe the same flip.
/// Triggering is idempotent.
pub struct AbortSignal {
    tx: watch::Sender<bool>,
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn trigger(&self) {
        // send_replace never fails even with no receivers alive.
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_wakes_subscribers() {
        let signal = AbortSignal::new();
        let mut rx = signal.subscribe();
        assert!(!*rx.borrow());

        signal.trigger();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(signal.is_aborted());

        // Idempotent.
        signal.trigger();
        assert!(signal.is_aborted());
    }
}
