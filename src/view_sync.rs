//! Ordered application of stream snapshots
//!
//! One [`UpdateSerializer`] exists per streamed turn. Snapshots pushed into
//! it are applied strictly in order by a single worker task: first to the
//! [`ChatManager`], then to the view, and the next snapshot only starts once
//! the view has finished rendering the previous one.

use crate::chat::ChatManager;
use crate::completion::{Snapshot, SnapshotSink};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Renders snapshots of the message being streamed
#[async_trait]
pub trait ViewSink: Send + Sync {
    /// Show `snapshot` as the latest state of the last message of `chat_id`
    async fn render(&self, chat_id: &str, snapshot: &Snapshot);
}

/// View that renders nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NullView;

#[async_trait]
impl ViewSink for NullView {
    async fn render(&self, _chat_id: &str, _snapshot: &Snapshot) {}
}

/// Single-consumer queue between the stream and the engine/view
pub struct UpdateSerializer {
    chat_id: String,
    tx: mpsc::UnboundedSender<Snapshot>,
    worker: JoinHandle<usize>,
}

impl UpdateSerializer {
    /// Start the worker for one turn in `chat_id`
    pub fn spawn(manager: ChatManager, chat_id: impl Into<String>, view: Arc<dyn ViewSink>) -> Self {
        let chat_id = chat_id.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Snapshot>();

        let worker_chat_id = chat_id.clone();
        let worker = tokio::spawn(async move {
            let mut applied = 0usize;
            while let Some(snapshot) = rx.recv().await {
                manager.update_last_message(&worker_chat_id, &snapshot.to_update(true));
                view.render(&worker_chat_id, &snapshot).await;
                applied += 1;
            }
            applied
        });

        Self {
            chat_id,
            tx,
            worker,
        }
    }

    /// Chat the snapshots are applied to
    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    /// Queue a snapshot behind every earlier one
    pub fn push(&self, snapshot: Snapshot) {
        if self.tx.send(snapshot).is_err() {
            tracing::warn!(chat_id = %self.chat_id, "Update worker is gone; dropping snapshot");
        }
    }

    /// Close the queue and wait until every queued snapshot was applied
    ///
    /// Returns the number of snapshots applied.
    pub async fn finish(self) -> Result<usize> {
        let Self { tx, worker, .. } = self;
        drop(tx);
        worker
            .await
            .map_err(|e| anyhow::anyhow!("Update worker failed: {}", e))
    }
}

impl SnapshotSink for UpdateSerializer {
    fn emit(&mut self, snapshot: &Snapshot) {
        self.push(snapshot.clone());
    }
}
