//! Save scheduling and incremental flush passes
//!
//! Mutations only mark state dirty. A flush pass walks four tiers in
//! priority order, writing at most one unit of work per tier:
//!
//! 1. pending shard removals (one batched `remove`)
//! 2. the index, then legacy cleanup once migration has finished
//! 3. one legacy chat migrated to its shard
//! 4. one dirty shard
//!
//! Between tiers the pass asks the scheduler whether it should yield. A pass
//! that leaves work behind reschedules itself; a pass that drains everything
//! resolves the shared save future.

use super::manager::ChatManager;
use super::types::Chat;
use crate::error::{ChatshardError, Result};
use crate::storage::keys::{self, INDEX_KEY, LEGACY_CHATS_KEY, STORAGE_VERSION, VERSION_KEY};
use crate::storage::KeyValueStore;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde_json::json;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

type SharedOutcome = Shared<BoxFuture<'static, std::result::Result<(), String>>>;

/// Save state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaveState {
    /// Nothing scheduled
    #[default]
    Idle,
    /// A flush pass is queued on the scheduler
    Scheduled,
    /// A flush pass is writing to the store
    Flushing,
}

/// Pending save shared by every caller of `save_chats` until it resolves
pub(super) struct PendingSave {
    tx: oneshot::Sender<std::result::Result<(), String>>,
    outcome: SharedOutcome,
}

impl PendingSave {
    fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        let outcome = rx
            .map(|received| {
                received.unwrap_or_else(|_| Err("pending save was abandoned".to_string()))
            })
            .boxed()
            .shared();
        Self { tx, outcome }
    }

    fn ticket(&self) -> SaveTicket {
        SaveTicket {
            outcome: self.outcome.clone(),
        }
    }

    fn resolve(self, result: std::result::Result<(), String>) {
        // Nobody holding a ticket is not an error.
        let _ = self.tx.send(result);
    }
}

/// Future resolving once the save it was issued for is durable
///
/// Every caller that requested a save while the same save was pending gets a
/// ticket to the same outcome, so a store failure is reported to all of
/// them. Dropping a ticket does not cancel the save.
#[must_use = "a save ticket does nothing unless awaited; dropping it is fine for fire-and-forget saves"]
pub struct SaveTicket {
    outcome: SharedOutcome,
}

impl SaveTicket {
    fn failed(message: &str) -> Self {
        let pending = PendingSave::new();
        let ticket = pending.ticket();
        pending.resolve(Err(message.to_string()));
        ticket
    }
}

impl Future for SaveTicket {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.outcome
            .poll_unpin(cx)
            .map(|outcome| outcome.map_err(|msg| ChatshardError::Storage(msg).into()))
    }
}

/// Result of one flush pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum PassOutcome {
    /// Everything reached the store
    Drained,
    /// The pass yielded with work left
    Pending,
    /// Another pass was already flushing
    Busy,
    /// A store call failed
    Failed(String),
}

impl ChatManager {
    /// Request that dirty state be written
    ///
    /// Returns a ticket that resolves once a flush pass has drained every
    /// dirty unit, or fails with `ChatshardError::Storage` if a store call
    /// is rejected first. Concurrent callers share one pending save.
    pub fn save_chats(&self) -> SaveTicket {
        let (ticket, schedule) = {
            let mut st = self.state();
            if st.disposed {
                return SaveTicket::failed("chat manager is disposed");
            }
            let ticket = st.pending_save.get_or_insert_with(PendingSave::new).ticket();
            let schedule = st.save == SaveState::Idle;
            if schedule {
                st.save = SaveState::Scheduled;
            }
            (ticket, schedule)
        };

        if schedule {
            self.request_flush();
        }
        ticket
    }

    /// Current state of the save state machine
    pub fn save_state(&self) -> SaveState {
        self.state().save
    }

    /// True when nothing is waiting to be written
    pub fn is_clean(&self) -> bool {
        !self.state().has_work()
    }

    /// Run flush passes until everything is written
    ///
    /// Yields to the runtime between passes. Gives up with a warning after
    /// `flush_now_max_rounds` passes and leaves the rest to the scheduler.
    ///
    /// # Errors
    ///
    /// Returns `ChatshardError::Storage` when a store call fails.
    pub async fn flush_now(&self) -> Result<()> {
        let rounds = self.inner.config.flush_now_max_rounds.max(1);
        for _ in 0..rounds {
            match self.flush_pass().await {
                PassOutcome::Drained => return Ok(()),
                PassOutcome::Failed(msg) => return Err(ChatshardError::Storage(msg).into()),
                PassOutcome::Pending => tokio::task::yield_now().await,
                PassOutcome::Busy => tokio::time::sleep(Duration::from_millis(1)).await,
            }
        }

        tracing::warn!(rounds, "Flush did not drain; leaving the rest to background passes");
        self.request_flush();
        Ok(())
    }

    /// Drain pending work, then refuse further saves
    ///
    /// The session pointer is written for the current chat. A save still
    /// pending afterwards is resolved with an error.
    pub async fn dispose(&self) -> Result<()> {
        let result = self.flush_now().await;

        // Background pointer writes may not outlive the process.
        let current = self.state().current_chat_id.clone();
        if let Some(chat_id) = current {
            let key = keys::session_key(&self.inner.config.session_id);
            if let Err(e) = self.inner.store.set_one(&key, json!(chat_id)).await {
                tracing::warn!(error = %e, "Failed to record session chat pointer");
            }
        }

        let mut st = self.state();
        st.disposed = true;
        if let Some(pending) = st.pending_save.take() {
            pending.resolve(Err("chat manager is disposed".to_string()));
        }
        tracing::debug!("Chat manager disposed");
        result
    }

    pub(super) fn request_flush(&self) {
        let manager = self.clone();
        let timeout = self.inner.config.flush_timeout();
        self.inner.scheduler.schedule(
            async move {
                if manager.state().disposed {
                    return;
                }
                if manager.flush_pass().await == PassOutcome::Pending {
                    manager.request_flush();
                }
            }
            .boxed(),
            timeout,
        );
    }

    /// Write every queued legacy chat, outside the normal pass budget
    ///
    /// A failed write is logged and the rest stays queued for background
    /// passes.
    pub(super) async fn migrate_all(&self) {
        let previous = {
            let mut st = self.state();
            if st.save == SaveState::Flushing {
                return;
            }
            std::mem::replace(&mut st.save, SaveState::Flushing)
        };

        let mut migrated = 0usize;
        loop {
            match self.migrate_one().await {
                Ok(true) => migrated += 1,
                Ok(false) => break,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        migrated,
                        "Legacy migration interrupted; remaining chats will migrate in the background"
                    );
                    break;
                }
            }
        }
        if migrated > 0 {
            tracing::info!(migrated, "Migrated legacy chats to shards");
        }

        self.state().save = previous;
    }

    pub(super) async fn flush_pass(&self) -> PassOutcome {
        {
            let mut st = self.state();
            if st.save == SaveState::Flushing {
                return PassOutcome::Busy;
            }
            st.save = SaveState::Flushing;
        }

        let started = Instant::now();
        let result = self.run_tiers(started).await;

        let mut st = self.state();
        match result {
            Ok(()) if st.has_work() => {
                st.save = SaveState::Scheduled;
                PassOutcome::Pending
            }
            Ok(()) => {
                st.save = SaveState::Idle;
                if let Some(pending) = st.pending_save.take() {
                    pending.resolve(Ok(()));
                }
                PassOutcome::Drained
            }
            Err(e) => {
                st.save = SaveState::Idle;
                let msg = storage_message(&e);
                tracing::error!(error = %msg, "Flush pass failed");
                if let Some(pending) = st.pending_save.take() {
                    pending.resolve(Err(msg.clone()));
                }
                PassOutcome::Failed(msg)
            }
        }
    }

    async fn run_tiers(&self, started: Instant) -> Result<()> {
        if self.flush_removals().await? && self.should_yield(started) {
            return Ok(());
        }
        if self.flush_index().await? && self.should_yield(started) {
            return Ok(());
        }
        if self.migrate_one().await? && self.should_yield(started) {
            return Ok(());
        }
        self.flush_one_dirty().await?;
        Ok(())
    }

    fn should_yield(&self, started: Instant) -> bool {
        self.inner.scheduler.should_yield(started)
    }

    async fn flush_removals(&self) -> Result<bool> {
        let removals: Vec<String> = {
            let mut st = self.state();
            std::mem::take(&mut st.pending_removals).into_iter().collect()
        };
        if removals.is_empty() {
            return Ok(false);
        }

        if let Err(e) = self.inner.store.remove(&removals).await {
            self.state().pending_removals.extend(removals);
            return Err(e);
        }
        tracing::debug!(count = removals.len(), "Removed shards");
        Ok(true)
    }

    async fn flush_index(&self) -> Result<bool> {
        let mut wrote = false;

        let ids = {
            let mut st = self.state();
            if st.index_dirty {
                st.index_dirty = false;
                Some(st.index_ids())
            } else {
                None
            }
        };
        if let Some(ids) = ids {
            if let Err(e) = self.inner.store.set_one(INDEX_KEY, json!(ids)).await {
                self.state().index_dirty = true;
                return Err(e);
            }
            tracing::debug!(chats = ids.len(), "Wrote chat index");
            wrote = true;
        }

        let cleanup = {
            let st = self.state();
            st.legacy_cleanup && st.migration_queue.is_empty() && !st.index_dirty
        };
        if cleanup {
            self.inner
                .store
                .set_one(VERSION_KEY, json!(STORAGE_VERSION))
                .await?;
            self.inner
                .store
                .remove(&[LEGACY_CHATS_KEY.to_string()])
                .await?;
            self.state().legacy_cleanup = false;
            tracing::info!(version = STORAGE_VERSION, "Legacy chat storage retired");
            wrote = true;
        }

        Ok(wrote)
    }

    pub(super) async fn migrate_one(&self) -> Result<bool> {
        let next = {
            let mut guard = self.state();
            let st = &mut *guard;
            loop {
                match st.migration_queue.pop_front() {
                    None => break None,
                    Some(id) => {
                        if let Some(chat) = st.chats.get(&id) {
                            st.dirty_chat_ids.remove(&id);
                            break Some(chat.clone());
                        }
                    }
                }
            }
        };
        let Some(chat) = next else {
            return Ok(false);
        };

        if let Err(e) = self.write_shard(&chat).await {
            let mut st = self.state();
            if st.chats.contains_key(&chat.id) {
                st.migration_queue.push_front(chat.id.clone());
            }
            return Err(e);
        }
        tracing::debug!(chat_id = %chat.id, "Migrated legacy chat");
        Ok(true)
    }

    async fn flush_one_dirty(&self) -> Result<bool> {
        let next = {
            let mut guard = self.state();
            let st = &mut *guard;
            loop {
                match st.dirty_chat_ids.pop_first() {
                    None => break None,
                    Some(id) => {
                        if let Some(chat) = st.chats.get(&id) {
                            break Some(chat.clone());
                        }
                    }
                }
            }
        };
        let Some(chat) = next else {
            return Ok(false);
        };

        if let Err(e) = self.write_shard(&chat).await {
            let mut st = self.state();
            if st.chats.contains_key(&chat.id) {
                st.dirty_chat_ids.insert(chat.id.clone());
            }
            return Err(e);
        }
        tracing::debug!(chat_id = %chat.id, "Wrote chat shard");
        Ok(true)
    }

    async fn write_shard(&self, chat: &Chat) -> Result<()> {
        let value = serde_json::to_value(chat)?;
        self.inner
            .store
            .set_one(&keys::shard_key(&chat.id), value)
            .await
    }
}

fn storage_message(error: &anyhow::Error) -> String {
    match error.downcast_ref::<ChatshardError>() {
        Some(ChatshardError::Storage(msg)) => msg.clone(),
        _ => error.to_string(),
    }
}
