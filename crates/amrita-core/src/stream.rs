// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};

use crate::error::AmritaError;

/// How a turn's stream ended.
pub(crate) enum QueueClose {
    Eof,
    /// Taken exactly once by the consumer; a second read sees `QueueClosed`.
    Failed(Option<AmritaError>),
}

struct QueueState {
    primary: VecDeque<String>,
    overflow: VecDeque<String>,
    closed: Option<QueueClose>,
}

/// Bounded two-tier chunk queue with cooperative backpressure.
///
/// Writes land on the primary queue; when it is full they spill into the
/// overflow queue; when both are full the producer suspends until the
/// consumer frees space — chunks are never dropped.  Draining the primary
/// rebalances overflow entries forward so delivery order is preserved.
pub struct ResponseQueue {
    state: Mutex<QueueState>,
    readable: Notify,
    writable: Notify,
    capacity: usize,
    overflow_capacity: usize,
}

impl ResponseQueue {
    pub fn new(capacity: usize, overflow_capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                primary: VecDeque::with_capacity(capacity),
                overflow: VecDeque::with_capacity(overflow_capacity),
                closed: None,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
            capacity,
            overflow_capacity,
        }
    }

    /// Enqueue one chunk, suspending while both tiers are full.  Chunks
    /// pushed after close are discarded.
    pub async fn push(&self, chunk: String) {
        let mut chunk = Some(chunk);
        loop {
            let notified = self.writable.notified();
            {
                let mut s = self.state.lock().await;
                if s.closed.is_some() {
                    return;
                }
                if s.primary.len() < self.capacity {
                    s.primary.push_back(chunk.take().expect("chunk consumed twice"));
                    self.readable.notify_one();
                    return;
                }
                if s.overflow.len() < self.overflow_capacity {
                    s.overflow.push_back(chunk.take().expect("chunk consumed twice"));
                    self.readable.notify_one();
                    return;
                }
            }
            notified.await;
        }
    }

    /// Dequeue the next chunk.
    ///
    /// `None` signals clean end-of-stream; `Some(Err(..))` delivers the
    /// turn's failure (once).
    pub async fn pop(&self) -> Option<Result<String, AmritaError>> {
        loop {
            let notified = self.readable.notified();
            {
                let mut s = self.state.lock().await;
                if let Some(chunk) = s.primary.pop_front() {
                    // Rebalance: pull overflow forward while there is room.
                    while s.primary.len() < self.capacity {
                        match s.overflow.pop_front() {
                            Some(c) => s.primary.push_back(c),
                            None => break,
                        }
                    }
                    self.writable.notify_one();
                    return Some(Ok(chunk));
                }
                if let Some(chunk) = s.overflow.pop_front() {
                    self.writable.notify_one();
                    return Some(Ok(chunk));
                }
                match &mut s.closed {
                    Some(QueueClose::Eof) => return None,
                    Some(QueueClose::Failed(err)) => {
                        return Some(Err(err.take().unwrap_or(AmritaError::QueueClosed)))
                    }
                    None => {}
                }
            }
            notified.await;
        }
    }

    /// Post the end-of-stream sentinel.  Pending chunks stay readable.
    pub(crate) async fn close(&self, close: QueueClose) {
        let mut s = self.state.lock().await;
        if s.closed.is_none() {
            s.closed = Some(close);
        }
        self.readable.notify_one();
        self.writable.notify_one();
    }

    /// Chunks currently buffered across both tiers.
    pub async fn pending(&self) -> usize {
        let s = self.state.lock().await;
        s.primary.len() + s.overflow.len()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn push_then_pop_preserves_order() {
        let q = ResponseQueue::new(4, 4);
        q.push("a".into()).await;
        q.push("b".into()).await;
        assert_eq!(q.pop().await.unwrap().unwrap(), "a");
        assert_eq!(q.pop().await.unwrap().unwrap(), "b");
    }

    #[tokio::test]
    async fn overflow_spill_keeps_order() {
        let q = ResponseQueue::new(2, 3);
        for i in 0..5 {
            q.push(format!("c{i}")).await;
        }
        assert_eq!(q.pending().await, 5);
        for i in 0..5 {
            assert_eq!(q.pop().await.unwrap().unwrap(), format!("c{i}"));
        }
    }

    #[tokio::test]
    async fn producer_blocks_when_both_tiers_full() {
        let q = Arc::new(ResponseQueue::new(2, 3));
        for i in 0..5 {
            q.push(format!("c{i}")).await;
        }
        // Exactly capacity + overflow pending: the next push must suspend.
        let q2 = Arc::clone(&q);
        let blocked = tokio::spawn(async move { q2.push("c5".into()).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished(), "6th push must block");

        // A pop frees space and unblocks the producer.
        assert_eq!(q.pop().await.unwrap().unwrap(), "c0");
        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("producer should unblock")
            .unwrap();
        assert_eq!(q.pending().await, 5);
    }

    #[tokio::test]
    async fn rebalance_drains_overflow_into_primary() {
        let q = ResponseQueue::new(2, 3);
        for i in 0..5 {
            q.push(format!("c{i}")).await;
        }
        let _ = q.pop().await;
        // After one pop the primary refills from overflow; a push now lands
        // in overflow again without blocking.
        q.push("c5".into()).await;
        assert_eq!(q.pending().await, 5);
    }

    #[tokio::test]
    async fn eof_after_drain_returns_none() {
        let q = ResponseQueue::new(4, 4);
        q.push("last".into()).await;
        q.close(QueueClose::Eof).await;
        assert_eq!(q.pop().await.unwrap().unwrap(), "last");
        assert!(q.pop().await.is_none());
        assert!(q.pop().await.is_none(), "EOF is sticky");
    }

    #[tokio::test]
    async fn failure_is_delivered_once() {
        let q = ResponseQueue::new(4, 4);
        q.close(QueueClose::Failed(Some(AmritaError::Cancelled))).await;
        match q.pop().await {
            Some(Err(AmritaError::Cancelled)) => {}
            other => panic!("expected cancellation, got {other:?}"),
        }
        match q.pop().await {
            Some(Err(AmritaError::QueueClosed)) => {}
            other => panic!("expected QueueClosed on re-read, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn push_after_close_is_discarded() {
        let q = ResponseQueue::new(4, 4);
        q.close(QueueClose::Eof).await;
        q.push("late".into()).await;
        assert!(q.pop().await.is_none());
    }

    #[tokio::test]
    async fn consumer_waits_for_producer() {
        let q = Arc::new(ResponseQueue::new(4, 4));
        let q2 = Arc::clone(&q);
        let consumer = tokio::spawn(async move { q2.pop().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.push("eventually".into()).await;
        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.unwrap().unwrap(), "eventually");
    }
}
