// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Per-hostname mutual exclusion.
//!
//! Every task gets a [`HostnameToken`] when it is dispatched. The token waits for the
//! previous task of the same hostname to finish, and releases the next one when it is
//! dropped. Tokens for one hostname therefore form a chain in dispatch order: tasks for
//! a hostname never overlap and always run in the order the engine created them, no
//! matter how the runtime schedules them. Tasks for different hostnames never wait on
//! each other.
//!
//! The map is owned by the engine loop and never shared, so it needs no lock of its own.

use std::collections::HashMap;
use tokio::sync::oneshot;

/// Exclusive turn of one task on one hostname.
///
/// Call [`acquire`](Self::acquire) before touching the hostname; the turn ends when the
/// token is dropped.
#[derive(Debug)]
pub struct HostnameToken {
    previous: Option<oneshot::Receiver<()>>,
    _done: oneshot::Sender<()>,
}

impl HostnameToken {
    /// Wait until every earlier task for this hostname has finished.
    pub async fn acquire(&mut self) {
        if let Some(previous) = self.previous.take() {
            // Resolves with an error once the previous token is dropped.
            let _ = previous.await;
        }
    }
}

/// Tail of the token chain for every hostname with a task in flight.
#[derive(Debug, Default)]
pub struct HostnameLocks {
    tails: HashMap<String, oneshot::Receiver<()>>,
}

impl HostnameLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next token for `hostname`.
    pub fn token(&mut self, hostname: &str) -> HostnameToken {
        let (done, tail) = oneshot::channel();
        let previous = self.tails.insert(hostname.to_string(), tail);
        HostnameToken {
            previous,
            _done: done,
        }
    }

    /// Forget hostnames whose last token has been dropped.
    pub fn prune(&mut self) {
        self.tails.retain(|_, tail| {
            !matches!(tail.try_recv(), Err(oneshot::error::TryRecvError::Closed))
        });
    }

    /// Number of hostnames with a live token.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tails.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tails.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[test]
    fn test_prune_keeps_live_chains() {
        let mut locks = HostnameLocks::new();
        let held = locks.token("web.x");
        drop(locks.token("api.x"));
        locks.prune();
        assert_eq!(locks.len(), 1);
        drop(held);
        locks.prune();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_first_token_does_not_wait() {
        let mut locks = HostnameLocks::new();
        let mut token = locks.token("web.x");
        tokio::time::timeout(Duration::from_millis(100), token.acquire())
            .await
            .expect("first token acquires immediately");
    }

    #[tokio::test]
    async fn test_tasks_run_in_dispatch_order_regardless_of_spawn_order() {
        let mut locks = HostnameLocks::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let tokens: Vec<HostnameToken> = (0..5).map(|_| locks.token("web.x")).collect();
        let mut handles = Vec::new();
        for (i, mut token) in tokens.into_iter().enumerate().rev() {
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                token.acquire().await;
                order.lock().await.push(i);
                tokio::time::sleep(Duration::from_millis(2)).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_other_hostnames_do_not_wait() {
        let mut locks = HostnameLocks::new();
        let mut held = locks.token("web.x");
        held.acquire().await;

        let mut other = locks.token("api.x");
        tokio::time::timeout(Duration::from_millis(100), other.acquire())
            .await
            .expect("independent hostname is not blocked");

        let mut queued = locks.token("web.x");
        assert!(
            tokio::time::timeout(Duration::from_millis(20), queued.acquire())
                .await
                .is_err(),
            "same hostname waits for the held token"
        );
    }
}
