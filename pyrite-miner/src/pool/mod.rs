//! Submission interface toward the pool collaborator.
//!
//! The driver never speaks a pool protocol itself; it hands every decoded
//! solution to a [`WorkSubmissionSink`] and moves on. Submissions are
//! dispatched on their own tasks so a slow or hung pool client can never
//! stall packet reception on the serial link.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::tracing::prelude::*;
use crate::work::{Submission, Work};

/// Receiver of found nonces.
///
/// Implemented by whatever owns the pool connection. Called once per
/// accepted event packet with the work the solution belongs to and the
/// nonce in pool wire order.
#[async_trait]
pub trait WorkSubmissionSink: Send + Sync + 'static {
    async fn submit(&self, work: Arc<Work>, nonce_hex: String);
}

/// Sink that forwards submissions over a channel.
///
/// The pool client owns the receiving end and drains it at its own pace.
/// A full or closed channel drops the submission with a warning; the share
/// is stale by the time the backlog clears, so blocking the driver to
/// preserve it would be a bad trade.
pub struct ChannelSink {
    tx: mpsc::Sender<Submission>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Submission>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl WorkSubmissionSink for ChannelSink {
    async fn submit(&self, work: Arc<Work>, nonce_hex: String) {
        let job_id = work.job_id.clone();
        if self
            .tx
            .try_send(Submission { work, nonce_hex })
            .is_err()
        {
            warn!(job_id = %job_id, "Submission channel unavailable, share dropped.");
        }
    }
}

/// Sink that only logs, for bring-up and tests.
pub struct LogSink;

#[async_trait]
impl WorkSubmissionSink for LogSink {
    async fn submit(&self, work: Arc<Work>, nonce_hex: String) {
        info!(job_id = %work.job_id, nonce = %nonce_hex, "Share found.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_sink_forwards_submission() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = ChannelSink::new(tx);
        let work = Arc::new(Work {
            job_id: "job1".to_string(),
            header: vec![0; 32],
            difficulty: 4096,
            starting_nonce: 0,
        });

        sink.submit(Arc::clone(&work), "78563412".to_string()).await;

        let submission = rx.recv().await.unwrap();
        assert_eq!(submission.work.job_id, "job1");
        assert_eq!(submission.nonce_hex, "78563412");
    }

    #[tokio::test]
    async fn channel_sink_drops_when_closed() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sink = ChannelSink::new(tx);
        let work = Arc::new(Work {
            job_id: "job1".to_string(),
            header: vec![],
            difficulty: 1,
            starting_nonce: 0,
        });
        // Must not panic or block.
        sink.submit(work, "00000000".to_string()).await;
    }
}
