use super::flush::{PendingSave, SaveState};
use super::scheduler::BackgroundScheduler;
use super::types::{Chat, Message, MessageUpdate, RefEntry, Role};
use crate::config::StorageConfig;
use crate::error::{ChatshardError, Result};
use crate::storage::keys::{
    self, INDEX_KEY, LAST_ACTIVE_KEY, LEGACY_CHATS_KEY, LEGACY_CURRENT_KEY,
};
use crate::storage::{ChatSummary, KeyValueStore};
use chrono::Utc;
use futures::FutureExt;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Titles derived from the first user message are cut to this many chars
const AUTO_TITLE_CHARS: usize = 30;

/// Mutable engine state, guarded by one mutex that is never held across an await
#[derive(Default)]
pub(super) struct ManagerState {
    pub(super) chats: HashMap<String, Chat>,
    pub(super) current_chat_id: Option<String>,
    pub(super) dirty_chat_ids: BTreeSet<String>,
    pub(super) index_dirty: bool,
    pub(super) pending_removals: BTreeSet<String>,
    pub(super) migration_queue: VecDeque<String>,
    pub(super) legacy_cleanup: bool,
    pub(super) save: SaveState,
    pub(super) pending_save: Option<PendingSave>,
    pub(super) initialized: bool,
    pub(super) disposed: bool,
    last_issued_id: i64,
}

impl ManagerState {
    /// Whether anything still needs to reach the store
    pub(super) fn has_work(&self) -> bool {
        !self.pending_removals.is_empty()
            || self.index_dirty
            || !self.migration_queue.is_empty()
            || !self.dirty_chat_ids.is_empty()
            || self.legacy_cleanup
    }

    /// Chat ids in index order
    pub(super) fn index_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.chats.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn most_recent_chat_id(&self) -> Option<String> {
        self.chats
            .values()
            .max_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)))
            .map(|chat| chat.id.clone())
    }

    /// Timestamp-derived id, strictly greater than any id issued or loaded
    fn next_chat_id(&mut self) -> String {
        let now = Utc::now().timestamp_millis();
        let id = now.max(self.last_issued_id + 1);
        self.last_issued_id = id;
        id.to_string()
    }

    fn mark_dirty(&mut self, chat_id: &str) {
        self.dirty_chat_ids.insert(chat_id.to_string());
    }
}

pub(super) struct Inner {
    pub(super) store: Arc<dyn KeyValueStore>,
    pub(super) scheduler: Arc<dyn BackgroundScheduler>,
    pub(super) config: StorageConfig,
    pub(super) state: Mutex<ManagerState>,
}

/// Persistence engine for chats
///
/// A cheaply cloneable handle; every clone shares the same state. Build one
/// at startup, call [`initialize`](Self::initialize), and pass clones to the
/// components that read or mutate chats. All shard writes go through it.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use chatshard::chat::{ChatManager, Message, TokioScheduler};
/// use chatshard::config::StorageConfig;
/// use chatshard::storage::MemoryStore;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let manager = ChatManager::new(
///     Arc::new(MemoryStore::new()),
///     Arc::new(TokioScheduler::default()),
///     StorageConfig::default(),
/// );
/// manager.initialize().await.unwrap();
/// manager.add_message_to_current_chat(Message::user("Hi")).unwrap();
/// manager.flush_now().await.unwrap();
/// # });
/// ```
#[derive(Clone)]
pub struct ChatManager {
    pub(super) inner: Arc<Inner>,
}

impl ChatManager {
    /// Create an engine over `store`; no I/O happens until `initialize`
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        scheduler: Arc<dyn BackgroundScheduler>,
        config: StorageConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                scheduler,
                config,
                state: Mutex::new(ManagerState::default()),
            }),
        }
    }

    pub(super) fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Load chats from the store and select the active chat
    ///
    /// Reads the index and every shard it lists. Ids whose shard is missing
    /// are recovered from the legacy array key; without an index the whole
    /// legacy array is loaded. Legacy chats are then migrated to shards
    /// before this returns; if the store rejects a migration write, the
    /// remaining chats stay queued for background flush passes.
    ///
    /// The active chat is the first existing one of: this session's pointer,
    /// the process-wide last active pointer, the most recently updated chat,
    /// the legacy global pointer. With none, a default chat is created.
    pub async fn initialize(&self) -> Result<()> {
        if self.state().initialized {
            return Ok(());
        }

        let store = &self.inner.store;
        let mut loaded: HashMap<String, Chat> = HashMap::new();
        let mut migration: Vec<String> = Vec::new();
        let mut index_dirty = false;

        match store.get_one(INDEX_KEY).await?.and_then(parse_index) {
            Some(ids) => {
                let shard_keys: Vec<String> = ids.iter().map(|id| keys::shard_key(id)).collect();
                let shards = store.get(&shard_keys).await?;

                let mut missing = Vec::new();
                for id in ids {
                    match shards.get(&keys::shard_key(&id)).and_then(decode_chat) {
                        Some(chat) => {
                            loaded.insert(id, chat);
                        }
                        None => missing.push(id),
                    }
                }

                if !missing.is_empty() {
                    tracing::warn!(
                        count = missing.len(),
                        "Index lists chats without shards; recovering from legacy storage"
                    );
                    let mut legacy = self.load_legacy().await?;
                    for id in missing {
                        match legacy.remove(&id) {
                            Some(chat) => {
                                loaded.insert(id.clone(), chat);
                                migration.push(id);
                            }
                            None => {
                                tracing::warn!(chat_id = %id, "Dropping unrecoverable chat from index");
                            }
                        }
                    }
                    index_dirty = true;
                }
            }
            None => {
                let legacy = self.load_legacy().await?;
                if !legacy.is_empty() {
                    tracing::info!(count = legacy.len(), "Migrating chats from legacy storage");
                    index_dirty = true;
                }
                for (id, chat) in legacy {
                    migration.push(id.clone());
                    loaded.insert(id, chat);
                }
            }
        }
        migration.sort();

        {
            let mut st = self.state();
            st.last_issued_id = loaded
                .keys()
                .filter_map(|id| id.parse::<i64>().ok())
                .max()
                .unwrap_or(0);
            st.chats = loaded;
            st.legacy_cleanup = !migration.is_empty();
            st.migration_queue = migration.into();
            st.index_dirty = index_dirty;
        }

        self.migrate_all().await;

        let session_key = keys::session_key(&self.inner.config.session_id);
        let pointers = store
            .get(&[
                session_key.clone(),
                LAST_ACTIVE_KEY.to_string(),
                LEGACY_CURRENT_KEY.to_string(),
            ])
            .await?;

        let resolved = {
            let st = self.state();
            let existing = |key: &str| {
                pointers
                    .get(key)
                    .and_then(value_as_id)
                    .filter(|id| st.chats.contains_key(id))
            };
            existing(&session_key)
                .or_else(|| existing(LAST_ACTIVE_KEY))
                .or_else(|| st.most_recent_chat_id())
                .or_else(|| existing(LEGACY_CURRENT_KEY))
        };

        match resolved {
            Some(id) => {
                tracing::info!(chat_id = %id, "Resolved active chat");
                self.state().current_chat_id = Some(id);
            }
            None => {
                let chat = self.create_new_chat(&self.inner.config.default_chat_title);
                tracing::info!(chat_id = %chat.id, "Created default chat");
            }
        }

        let has_work = {
            let mut st = self.state();
            st.initialized = true;
            st.has_work()
        };
        if has_work {
            // Nothing awaits this save; failures are logged by the flush pass.
            let _ = self.save_chats();
        }

        Ok(())
    }

    /// Read the legacy array key, keyed by chat id
    async fn load_legacy(&self) -> Result<HashMap<String, Chat>> {
        let Some(value) = self.inner.store.get_one(LEGACY_CHATS_KEY).await? else {
            return Ok(HashMap::new());
        };
        let Value::Array(items) = value else {
            tracing::warn!("Legacy chat key does not hold an array; ignoring it");
            return Ok(HashMap::new());
        };

        let mut chats = HashMap::with_capacity(items.len());
        for item in items {
            match serde_json::from_value::<Chat>(item) {
                Ok(chat) => {
                    chats.insert(chat.id.clone(), chat);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping undecodable legacy chat");
                }
            }
        }
        Ok(chats)
    }

    /// Create a chat, make it current and schedule its first write
    ///
    /// The returned chat exists in memory immediately but is not durable
    /// until a flush pass writes it.
    pub fn create_new_chat(&self, title: &str) -> Chat {
        let chat = {
            let mut st = self.state();
            let id = st.next_chat_id();
            let chat = Chat::new(id.clone(), title);
            st.chats.insert(id.clone(), chat.clone());
            st.mark_dirty(&id);
            st.index_dirty = true;
            st.current_chat_id = Some(id);
            chat
        };

        tracing::debug!(chat_id = %chat.id, "Created chat");
        let _ = self.save_chats();
        self.record_pointers_in_background(&chat.id, true);
        chat
    }

    /// Make `chat_id` the current chat
    ///
    /// Switching counts as activity: the chat's `updated_at` is bumped. Both
    /// the session pointer and the process-wide pointer are persisted before
    /// this returns.
    ///
    /// # Errors
    ///
    /// Returns `ChatshardError::NotFound` for an unknown id, or a storage
    /// error if the pointers cannot be written.
    pub async fn switch_chat(&self, chat_id: &str) -> Result<Chat> {
        let chat = {
            let mut guard = self.state();
            let st = &mut *guard;
            let chat = st
                .chats
                .get_mut(chat_id)
                .ok_or_else(|| ChatshardError::NotFound(chat_id.to_string()))?;
            chat.touch();
            let snapshot = chat.clone();
            st.mark_dirty(chat_id);
            st.current_chat_id = Some(chat_id.to_string());
            snapshot
        };

        let _ = self.save_chats();
        self.inner
            .store
            .set(self.pointer_items(chat_id, true))
            .await?;

        Ok(chat)
    }

    /// Delete a chat and garbage-collect the resources only it referenced
    ///
    /// If the deleted chat was current, the most recently updated remaining
    /// chat becomes current, or a default chat is created when none remain.
    /// The replacement is chosen in the same critical section as the removal,
    /// so no caller ever observes the engine without a current chat.
    ///
    /// # Errors
    ///
    /// Returns `ChatshardError::NotFound` for an unknown id. Once the chat is
    /// removed the call succeeds; a failed pointer write is only logged.
    pub async fn delete_chat(&self, chat_id: &str) -> Result<()> {
        let (orphans, fallback) = {
            let mut guard = self.state();
            let st = &mut *guard;
            let removed = st
                .chats
                .remove(chat_id)
                .ok_or_else(|| ChatshardError::NotFound(chat_id.to_string()))?;

            st.dirty_chat_ids.remove(chat_id);
            st.migration_queue.retain(|id| id != chat_id);
            st.pending_removals.insert(keys::shard_key(chat_id));
            st.index_dirty = true;

            let still_referenced: HashSet<&str> =
                st.chats.values().flat_map(|chat| chat.ref_keys()).collect();
            let orphans: BTreeSet<String> = removed
                .ref_keys()
                .filter(|key| !still_referenced.contains(key))
                .map(str::to_string)
                .collect();

            let fallback = if st.current_chat_id.as_deref() == Some(chat_id) {
                let next_id = match st.most_recent_chat_id() {
                    Some(id) => {
                        if let Some(chat) = st.chats.get_mut(&id) {
                            chat.touch();
                        }
                        id
                    }
                    None => {
                        let id = st.next_chat_id();
                        let title = self.inner.config.default_chat_title.clone();
                        st.chats.insert(id.clone(), Chat::new(id.clone(), title));
                        id
                    }
                };
                st.mark_dirty(&next_id);
                st.current_chat_id = Some(next_id.clone());
                Some(next_id)
            } else {
                None
            };
            (orphans, fallback)
        };

        tracing::info!(chat_id = %chat_id, orphaned_refs = orphans.len(), "Deleted chat");
        let _ = self.save_chats();

        if !orphans.is_empty() {
            let orphans: Vec<String> = orphans.into_iter().collect();
            if let Err(e) = self.inner.store.remove(&orphans).await {
                tracing::warn!(error = %e, "Failed to remove orphaned resources");
            }
        }

        if let Some(next_id) = fallback {
            tracing::debug!(chat_id = %next_id, "Selected chat after delete");
            if let Err(e) = self.inner.store.set(self.pointer_items(&next_id, true)).await {
                tracing::warn!(error = %e, "Failed to record active chat pointer");
            }
        }

        Ok(())
    }

    /// Append `message` to the current chat
    ///
    /// Any unfinished stream placeholder is settled first so it never stops
    /// being the last message while still marked `updating`.
    ///
    /// # Errors
    ///
    /// Returns `ChatshardError::NoActiveChat` when no chat is selected.
    pub fn add_message_to_current_chat(&self, message: Message) -> Result<()> {
        let chat_id = {
            let mut guard = self.state();
            let st = &mut *guard;
            let chat_id = st
                .current_chat_id
                .clone()
                .ok_or(ChatshardError::NoActiveChat)?;
            let chat = st
                .chats
                .get_mut(&chat_id)
                .ok_or(ChatshardError::NoActiveChat)?;

            if let Some(last) = chat.messages.last_mut() {
                last.updating = false;
            }

            let first_user_message =
                message.role == Role::User && !chat.messages.iter().any(|m| m.role == Role::User);
            if first_user_message && chat.title == self.inner.config.default_chat_title {
                let title: String = message
                    .content
                    .text()
                    .trim()
                    .chars()
                    .take(AUTO_TITLE_CHARS)
                    .collect();
                if !title.is_empty() {
                    chat.title = title;
                }
            }

            chat.messages.push(message);
            chat.touch();
            st.mark_dirty(&chat_id);
            chat_id
        };

        let _ = self.save_chats();
        self.record_pointers_in_background(&chat_id, false);
        Ok(())
    }

    /// Merge a stream snapshot into the last message of `chat_id`
    ///
    /// Silently does nothing when the chat is unknown or empty: streams race
    /// with navigation and deletion. When the last message is a user
    /// message and the update carries content, an assistant placeholder is
    /// appended first; it is the only place placeholders are created.
    pub fn update_last_message(&self, chat_id: &str, update: &MessageUpdate) {
        {
            let mut guard = self.state();
            let st = &mut *guard;
            let Some(chat) = st.chats.get_mut(chat_id) else {
                tracing::debug!(chat_id = %chat_id, "Ignoring update for unknown chat");
                return;
            };
            let Some(last) = chat.messages.last() else {
                return;
            };

            if last.role == Role::User {
                if update.content.is_none() && update.reasoning_content.is_none() {
                    return;
                }
                chat.messages.push(Message::placeholder());
            }
            if let Some(last) = chat.messages.last_mut() {
                update.apply_to(last);
            }
            chat.touch();
            st.mark_dirty(chat_id);
        }

        let _ = self.save_chats();
    }

    /// Remove and return the last message of the current chat
    ///
    /// # Errors
    ///
    /// Returns `ChatshardError::NoActiveChat` when no chat is selected.
    pub fn pop_message(&self) -> Result<Option<Message>> {
        let popped = {
            let mut guard = self.state();
            let st = &mut *guard;
            let chat_id = st
                .current_chat_id
                .clone()
                .ok_or(ChatshardError::NoActiveChat)?;
            let chat = st
                .chats
                .get_mut(&chat_id)
                .ok_or(ChatshardError::NoActiveChat)?;
            let popped = chat.messages.pop();
            if popped.is_some() {
                chat.touch();
                st.mark_dirty(&chat_id);
            }
            popped
        };

        if popped.is_some() {
            let _ = self.save_chats();
        }
        Ok(popped)
    }

    /// Change the title of a chat
    ///
    /// # Errors
    ///
    /// Returns `ChatshardError::NotFound` for an unknown id.
    pub fn rename_chat(&self, chat_id: &str, title: &str) -> Result<()> {
        {
            let mut guard = self.state();
            let st = &mut *guard;
            let chat = st
                .chats
                .get_mut(chat_id)
                .ok_or_else(|| ChatshardError::NotFound(chat_id.to_string()))?;
            chat.title = title.to_string();
            chat.touch();
            st.mark_dirty(chat_id);
        }
        let _ = self.save_chats();
        Ok(())
    }

    /// Attach an external resource reference to a chat, replacing one with the same key
    ///
    /// # Errors
    ///
    /// Returns `ChatshardError::NotFound` for an unknown id.
    pub fn record_transcript_ref(&self, chat_id: &str, entry: RefEntry) -> Result<()> {
        {
            let mut guard = self.state();
            let st = &mut *guard;
            let chat = st
                .chats
                .get_mut(chat_id)
                .ok_or_else(|| ChatshardError::NotFound(chat_id.to_string()))?;
            let refs = chat.transcript_refs.get_or_insert_with(Vec::new);
            match refs.iter_mut().find(|existing| existing.key == entry.key) {
                Some(existing) => *existing = entry,
                None => refs.push(entry),
            }
            chat.touch();
            st.mark_dirty(chat_id);
        }
        let _ = self.save_chats();
        Ok(())
    }

    /// Copy of a chat
    pub fn get_chat(&self, chat_id: &str) -> Option<Chat> {
        self.state().chats.get(chat_id).cloned()
    }

    /// Id of the current chat
    pub fn current_chat_id(&self) -> Option<String> {
        self.state().current_chat_id.clone()
    }

    /// Copy of the current chat
    pub fn current_chat(&self) -> Option<Chat> {
        let st = self.state();
        st.current_chat_id
            .as_ref()
            .and_then(|id| st.chats.get(id))
            .cloned()
    }

    /// Ids of every chat, in index order
    pub fn chat_ids(&self) -> Vec<String> {
        self.state().index_ids()
    }

    /// Summaries of every chat, most recently updated first
    pub fn list_chats(&self) -> Vec<ChatSummary> {
        let st = self.state();
        let mut summaries: Vec<ChatSummary> = st
            .chats
            .values()
            .map(|chat| ChatSummary {
                id: chat.id.clone(),
                title: chat.title.clone(),
                created_at: chat.created_at,
                updated_at: chat.updated_at,
                message_count: chat.messages.len(),
                is_current: st.current_chat_id.as_deref() == Some(chat.id.as_str()),
            })
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        summaries
    }

    /// Fire-and-forget write of the activity pointers
    ///
    /// These pointers are hints for the next startup, so a failed write is
    /// only logged.
    fn pointer_items(&self, chat_id: &str, include_session: bool) -> HashMap<String, Value> {
        let mut pointers = HashMap::with_capacity(2);
        pointers.insert(LAST_ACTIVE_KEY.to_string(), json!(chat_id));
        if include_session {
            pointers.insert(
                keys::session_key(&self.inner.config.session_id),
                json!(chat_id),
            );
        }
        pointers
    }

    fn record_pointers_in_background(&self, chat_id: &str, include_session: bool) {
        let pointers = self.pointer_items(chat_id, include_session);
        let store = Arc::clone(&self.inner.store);
        self.inner.scheduler.schedule(
            async move {
                if let Err(e) = store.set(pointers).await {
                    tracing::warn!(error = %e, "Failed to record active chat pointer");
                }
            }
            .boxed(),
            Duration::ZERO,
        );
    }
}

fn parse_index(value: Value) -> Option<Vec<String>> {
    match value {
        Value::Array(items) => Some(items.iter().filter_map(value_as_id).collect()),
        _ => {
            tracing::warn!("Chat index is not an array; treating it as absent");
            None
        }
    }
}

/// Chat ids are strings, but older layouts stored them as numbers
fn value_as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn decode_chat(value: &Value) -> Option<Chat> {
    match serde_json::from_value::<Chat>(value.clone()) {
        Ok(chat) => Some(chat),
        Err(e) => {
            tracing::warn!(error = %e, "Skipping undecodable chat shard");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::MessageContent;
    use crate::storage::MemoryStore;
    use crate::test_utils::{legacy_chat, manager_over, manual_manager as ready};

    #[tokio::test]
    async fn test_initialize_empty_store_creates_default_chat() {
        let (manager, store, _scheduler) = ready().await;

        let chat = manager.current_chat().unwrap();
        assert_eq!(chat.title, "New Chat");
        assert_eq!(manager.chat_ids(), vec![chat.id.clone()]);
        assert_eq!(
            store.get_one(INDEX_KEY).await.unwrap(),
            Some(json!([chat.id.clone()]))
        );
        assert_eq!(
            store.get_one(LAST_ACTIVE_KEY).await.unwrap(),
            Some(json!(chat.id))
        );
    }

    #[tokio::test]
    async fn test_initialize_twice_is_noop() {
        let (manager, _store, _scheduler) = ready().await;
        let first = manager.current_chat_id();
        manager.initialize().await.unwrap();
        assert_eq!(manager.current_chat_id(), first);
        assert_eq!(manager.chat_ids().len(), 1);
    }

    #[tokio::test]
    async fn test_initialize_migrates_legacy_layout() {
        let store = Arc::new(MemoryStore::new());
        store
            .set_one(
                LEGACY_CHATS_KEY,
                json!([legacy_chat("100", "old", "one"), legacy_chat("200", "older", "two")]),
            )
            .await
            .unwrap();
        store.set_one(LEGACY_CURRENT_KEY, json!(200)).await.unwrap();

        let (manager, scheduler) = manager_over(store.clone());
        manager.initialize().await.unwrap();

        // Shards are written during initialize, before any background pass.
        assert!(store.keys().contains(&keys::shard_key("100")));
        assert!(store.keys().contains(&keys::shard_key("200")));

        scheduler.run_until_idle().await;
        assert_eq!(store.get_one(INDEX_KEY).await.unwrap(), Some(json!(["100", "200"])));
        assert_eq!(store.get_one(keys::VERSION_KEY).await.unwrap(), Some(json!(2)));
        assert_eq!(store.get_one(LEGACY_CHATS_KEY).await.unwrap(), None);
        assert_eq!(manager.get_chat("100").unwrap().title, "old");
    }

    #[tokio::test]
    async fn test_failed_migration_continues_in_background() {
        let store = Arc::new(MemoryStore::new());
        store
            .set_one(LEGACY_CHATS_KEY, json!([legacy_chat("100", "old", "one")]))
            .await
            .unwrap();
        store.set_quota(Some(1));

        let (manager, scheduler) = manager_over(store.clone());
        manager.initialize().await.unwrap();
        assert!(!store.keys().contains(&keys::shard_key("100")));
        assert_eq!(manager.current_chat_id().as_deref(), Some("100"));

        store.set_quota(None);
        scheduler.run_until_idle().await;
        manager.flush_now().await.unwrap();
        assert!(store.keys().contains(&keys::shard_key("100")));
        assert_eq!(store.get_one(LEGACY_CHATS_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_initialize_recovers_missing_shard_from_legacy() {
        let store = Arc::new(MemoryStore::new());
        store.set_one(INDEX_KEY, json!(["100", "200", "300"])).await.unwrap();
        store
            .set_one(&keys::shard_key("100"), legacy_chat("100", "sharded", "a"))
            .await
            .unwrap();
        store
            .set_one(LEGACY_CHATS_KEY, json!([legacy_chat("200", "legacy", "b")]))
            .await
            .unwrap();

        let (manager, scheduler) = manager_over(store.clone());
        manager.initialize().await.unwrap();
        scheduler.run_until_idle().await;

        assert_eq!(manager.chat_ids(), vec!["100".to_string(), "200".to_string()]);
        assert_eq!(store.get_one(INDEX_KEY).await.unwrap(), Some(json!(["100", "200"])));
        assert!(store.keys().contains(&keys::shard_key("200")));
    }

    #[tokio::test]
    async fn test_current_chat_resolution_prefers_session_pointer() {
        let store = Arc::new(MemoryStore::new());
        store.set_one(INDEX_KEY, json!(["1", "2"])).await.unwrap();
        store.set_one(&keys::shard_key("1"), legacy_chat("1", "a", "x")).await.unwrap();
        store.set_one(&keys::shard_key("2"), legacy_chat("2", "b", "y")).await.unwrap();
        store.set_one(LAST_ACTIVE_KEY, json!("2")).await.unwrap();
        store.set_one(&keys::session_key("default"), json!("1")).await.unwrap();

        let (manager, _scheduler) = manager_over(store.clone());
        manager.initialize().await.unwrap();
        assert_eq!(manager.current_chat_id().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_current_chat_resolution_skips_dangling_pointers() {
        let store = Arc::new(MemoryStore::new());
        store.set_one(INDEX_KEY, json!(["1"])).await.unwrap();
        store.set_one(&keys::shard_key("1"), legacy_chat("1", "a", "x")).await.unwrap();
        store.set_one(&keys::session_key("default"), json!("999")).await.unwrap();
        store.set_one(LAST_ACTIVE_KEY, json!("998")).await.unwrap();

        let (manager, _scheduler) = manager_over(store.clone());
        manager.initialize().await.unwrap();
        assert_eq!(manager.current_chat_id().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_create_new_chat_ids_are_unique_and_current() {
        let (manager, _store, _scheduler) = ready().await;
        let a = manager.create_new_chat("a");
        let b = manager.create_new_chat("b");

        assert_ne!(a.id, b.id);
        assert!(b.id.parse::<i64>().unwrap() > a.id.parse::<i64>().unwrap());
        assert_eq!(manager.current_chat_id(), Some(b.id));
    }

    #[tokio::test]
    async fn test_switch_chat_persists_pointers() {
        let (manager, store, _scheduler) = ready().await;
        let first = manager.current_chat_id().unwrap();
        manager.create_new_chat("second");

        let switched = manager.switch_chat(&first).await.unwrap();
        assert_eq!(switched.id, first);
        assert_eq!(manager.current_chat_id().as_deref(), Some(first.as_str()));
        assert_eq!(
            store.get_one(&keys::session_key("default")).await.unwrap(),
            Some(json!(first.clone()))
        );
        assert_eq!(store.get_one(LAST_ACTIVE_KEY).await.unwrap(), Some(json!(first)));
    }

    #[tokio::test]
    async fn test_switch_unknown_chat_is_not_found() {
        let (manager, _store, _scheduler) = ready().await;
        let err = manager.switch_chat("nope").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ChatshardError>(),
            Some(ChatshardError::NotFound(id)) if id == "nope"
        ));
    }

    #[tokio::test]
    async fn test_delete_current_falls_back_to_most_recent() {
        let (manager, store, _scheduler) = ready().await;
        let first = manager.current_chat_id().unwrap();
        let second = manager.create_new_chat("second");
        let third = manager.create_new_chat("third");
        manager.switch_chat(&second.id).await.unwrap();

        manager.delete_chat(&second.id).await.unwrap();
        let current = manager.current_chat_id().unwrap();
        assert!(current == third.id || current == first);
        assert!(manager.get_chat(&second.id).is_none());
        assert_eq!(
            store.get_one(&keys::session_key("default")).await.unwrap(),
            Some(json!(current))
        );
    }

    #[tokio::test]
    async fn test_delete_succeeds_when_pointer_write_fails() {
        let (manager, store, scheduler) = ready().await;
        let first = manager.current_chat_id().unwrap();
        let second = manager.create_new_chat("second");
        manager.flush_now().await.unwrap();
        scheduler.run_until_idle().await;

        store.set_quota(Some(1));
        manager.delete_chat(&second.id).await.unwrap();

        assert_eq!(manager.current_chat_id(), Some(first.clone()));
        assert!(manager.get_chat(&second.id).is_none());
        assert_eq!(
            store.get_one(LAST_ACTIVE_KEY).await.unwrap(),
            Some(json!(second.id))
        );

        store.set_quota(None);
        manager.flush_now().await.unwrap();
        assert!(!store.keys().contains(&keys::shard_key(&second.id)));
    }

    #[tokio::test]
    async fn test_delete_last_chat_creates_default() {
        let (manager, _store, scheduler) = ready().await;
        let only = manager.current_chat_id().unwrap();
        manager.delete_chat(&only).await.unwrap();
        scheduler.run_until_idle().await;

        let current = manager.current_chat().unwrap();
        assert_ne!(current.id, only);
        assert_eq!(current.title, "New Chat");
        assert_eq!(manager.chat_ids(), vec![current.id]);
    }

    #[tokio::test]
    async fn test_delete_collects_only_orphaned_refs() {
        let (manager, store, _scheduler) = ready().await;
        store.set_one("transcript_shared", json!("s")).await.unwrap();
        store.set_one("transcript_own", json!("o")).await.unwrap();

        let keep = manager.current_chat_id().unwrap();
        let doomed = manager.create_new_chat("doomed");
        manager
            .record_transcript_ref(&keep, RefEntry::new("transcript_shared"))
            .unwrap();
        manager
            .record_transcript_ref(&doomed.id, RefEntry::new("transcript_shared"))
            .unwrap();
        manager
            .record_transcript_ref(&doomed.id, RefEntry::new("transcript_own"))
            .unwrap();

        manager.delete_chat(&doomed.id).await.unwrap();
        let keys = store.keys();
        assert!(keys.contains(&"transcript_shared".to_string()));
        assert!(!keys.contains(&"transcript_own".to_string()));
    }

    #[tokio::test]
    async fn test_add_message_without_current_chat() {
        let store = Arc::new(MemoryStore::new());
        let (manager, _scheduler) = manager_over(store);
        let err = manager
            .add_message_to_current_chat(Message::user("Hi"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ChatshardError>(),
            Some(ChatshardError::NoActiveChat)
        ));
    }

    #[tokio::test]
    async fn test_first_user_message_sets_title() {
        let (manager, _store, _scheduler) = ready().await;
        manager
            .add_message_to_current_chat(Message::system("be brief"))
            .unwrap();
        manager
            .add_message_to_current_chat(Message::user(
                "  What is the capital of France and why is it Paris?",
            ))
            .unwrap();
        manager
            .add_message_to_current_chat(Message::user("second question"))
            .unwrap();

        let chat = manager.current_chat().unwrap();
        assert_eq!(chat.title, "What is the capital of France ");
        assert_eq!(chat.title.chars().count(), AUTO_TITLE_CHARS);
    }

    #[tokio::test]
    async fn test_custom_title_is_kept() {
        let (manager, _store, _scheduler) = ready().await;
        manager.create_new_chat("Research");
        manager
            .add_message_to_current_chat(Message::user("hello"))
            .unwrap();
        assert_eq!(manager.current_chat().unwrap().title, "Research");
    }

    #[tokio::test]
    async fn test_update_last_message_creates_one_placeholder() {
        let (manager, _store, _scheduler) = ready().await;
        let id = manager.current_chat_id().unwrap();
        manager
            .add_message_to_current_chat(Message::user("Hi"))
            .unwrap();

        let snapshot = |text: &str| MessageUpdate {
            content: Some(text.to_string()),
            reasoning_content: None,
            updating: Some(true),
        };
        manager.update_last_message(&id, &snapshot("He"));
        manager.update_last_message(&id, &snapshot("Hello"));
        manager.update_last_message(&id, &snapshot("Hello"));
        manager.update_last_message(&id, &MessageUpdate::settled());

        let chat = manager.get_chat(&id).unwrap();
        assert_eq!(chat.messages.len(), 2);
        let last = chat.messages.last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.content, MessageContent::Text("Hello".to_string()));
        assert!(!last.updating);
    }

    #[tokio::test]
    async fn test_settle_after_user_message_adds_nothing() {
        let (manager, _store, _scheduler) = ready().await;
        let id = manager.current_chat_id().unwrap();
        manager
            .add_message_to_current_chat(Message::user("Hi"))
            .unwrap();
        manager.update_last_message(&id, &MessageUpdate::settled());
        assert_eq!(manager.get_chat(&id).unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn test_update_unknown_or_empty_chat_is_noop() {
        let (manager, _store, _scheduler) = ready().await;
        let id = manager.current_chat_id().unwrap();
        let update = MessageUpdate {
            content: Some("x".to_string()),
            ..Default::default()
        };
        manager.update_last_message("missing", &update);
        manager.update_last_message(&id, &update);
        assert!(manager.get_chat(&id).unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn test_only_last_message_is_updating() {
        let (manager, _store, _scheduler) = ready().await;
        let id = manager.current_chat_id().unwrap();
        manager
            .add_message_to_current_chat(Message::user("Hi"))
            .unwrap();
        manager.update_last_message(
            &id,
            &MessageUpdate {
                content: Some("partial".to_string()),
                updating: Some(true),
                ..Default::default()
            },
        );
        manager
            .add_message_to_current_chat(Message::user("next"))
            .unwrap();

        let chat = manager.get_chat(&id).unwrap();
        assert_eq!(chat.messages.iter().filter(|m| m.updating).count(), 0);
    }

    #[tokio::test]
    async fn test_pop_message_rolls_back() {
        let (manager, _store, _scheduler) = ready().await;
        manager
            .add_message_to_current_chat(Message::user("oops"))
            .unwrap();
        let popped = manager.pop_message().unwrap().unwrap();
        assert_eq!(popped.content.text(), "oops");
        assert!(manager.pop_message().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rename_and_list() {
        let (manager, _store, _scheduler) = ready().await;
        let first = manager.current_chat_id().unwrap();
        let second = manager.create_new_chat("second");
        manager.rename_chat(&first, "renamed").unwrap();

        let listed = manager.list_chats();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, first);
        assert_eq!(listed[0].title, "renamed");
        assert!(listed.iter().any(|s| s.id == second.id && s.is_current));
        assert!(manager.rename_chat("missing", "x").is_err());
    }

    #[tokio::test]
    async fn test_record_transcript_ref_upserts_by_key() {
        let (manager, _store, _scheduler) = ready().await;
        let id = manager.current_chat_id().unwrap();
        let mut entry = RefEntry::new("transcript_v_en");
        manager.record_transcript_ref(&id, entry.clone()).unwrap();
        entry.lang = Some("en".to_string());
        manager.record_transcript_ref(&id, entry).unwrap();

        let refs = manager.get_chat(&id).unwrap().transcript_refs.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].lang.as_deref(), Some("en"));
    }

    #[tokio::test]
    async fn test_reload_round_trip() {
        let (manager, store, _scheduler) = ready().await;
        manager
            .add_message_to_current_chat(Message::user("persist me"))
            .unwrap();
        manager.create_new_chat("other");
        manager.flush_now().await.unwrap();

        let (reloaded, _scheduler) = manager_over(store);
        reloaded.initialize().await.unwrap();
        for id in manager.chat_ids() {
            assert_eq!(reloaded.get_chat(&id), manager.get_chat(&id));
        }
        assert_eq!(reloaded.chat_ids(), manager.chat_ids());
    }
}
