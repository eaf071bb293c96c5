//! One-shot fingerprint gate shared by the port-scan plugins of a target

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::oneshot;

/// Outcome of a target's fingerprint probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    /// First line the service answered with, `None` when it stayed silent
    pub banner: Option<String>,
}

/// Producer side; resolving consumes it, so it fires at most once
#[derive(Debug)]
pub struct FingerprintSignal {
    sender: oneshot::Sender<Fingerprint>,
}

/// Waiter side, cloned into every port-scan worker of the target
#[derive(Clone)]
pub struct FingerprintGate {
    inner: Shared<BoxFuture<'static, Option<Fingerprint>>>,
}

pub fn fingerprint_gate() -> (FingerprintSignal, FingerprintGate) {
    let (sender, receiver) = oneshot::channel();
    let inner = receiver.map(Result::ok).boxed().shared();
    (FingerprintSignal { sender }, FingerprintGate { inner })
}

impl FingerprintSignal {
    pub fn resolve(self, banner: Option<String>) {
        // every waiter may already be gone
        let _ = self.sender.send(Fingerprint { banner });
    }
}

impl FingerprintGate {
    /// Wait for the probe. `None` if the producer was dropped unresolved.
    pub async fn wait(&self) -> Option<Fingerprint> {
        self.inner.clone().await
    }

    pub fn is_ready(&self) -> bool {
        self.inner.peek().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_all_waiters_released_once() {
        let (signal, gate) = fingerprint_gate();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let gate = gate.clone();
                tokio::spawn(async move { gate.wait().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!gate.is_ready());
        signal.resolve(Some("SSH-2.0".to_string()));

        for waiter in waiters {
            let fingerprint = waiter.await.unwrap().unwrap();
            assert_eq!(fingerprint.banner.as_deref(), Some("SSH-2.0"));
        }
        assert!(gate.is_ready());
        // late waiters see the same value immediately
        let late = tokio::time::timeout(Duration::from_millis(10), gate.wait()).await;
        assert_eq!(late.unwrap().unwrap().banner.as_deref(), Some("SSH-2.0"));
    }

    #[tokio::test]
    async fn test_dropped_signal_releases_waiters() {
        let (signal, gate) = fingerprint_gate();
        drop(signal);
        assert!(gate.wait().await.is_none());
    }
}
