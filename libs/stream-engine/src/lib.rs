use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use fleet_api::{EntryFields, EntryId, PositionStream, StreamEntry, StreamError};

// ═══════════════════════════════════════════════════════════════
//  MemoryStream
// ═══════════════════════════════════════════════════════════════

/// In-process durable stream with consumer-group checkpointing.
///
/// Entries are appended with strictly increasing ids and delivered to a
/// group strictly above its shared cursor, each entry to exactly one
/// consumer. A delivered entry stays in the group's pending set until
/// acknowledged; nothing reclaims stuck pending entries.
///
/// Claim and ack are serialized under one lock, so concurrent worker
/// instances in the same group never race for an entry.
pub struct MemoryStream {
    inner: Mutex<StreamInner>,
    /// Wakes readers blocked in `read_group` on every append or close.
    notify: Notify,
}

struct StreamInner {
    entries: VecDeque<StreamEntry>,
    /// Id assigned to the next append.
    next_id: u64,
    groups: HashMap<String, GroupState>,
    closed: bool,
    max_entries: usize,
}

struct GroupState {
    /// Highest id handed to any consumer in the group (the `>` cursor).
    last_delivered: u64,
    /// Delivered-but-unacknowledged entries, by claiming consumer.
    pending: HashMap<EntryId, String>,
}

impl MemoryStream {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(StreamInner {
                entries: VecDeque::new(),
                next_id: 1,
                groups: HashMap::new(),
                closed: false,
                max_entries,
            }),
            notify: Notify::new(),
        }
    }

    /// Mark the backing store unavailable. Every subsequent operation
    /// fails with `StreamError::Unavailable`; blocked readers wake up.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Size of a group's pending set (0 for an unknown group).
    pub fn pending_count(&self, group: &str) -> usize {
        self.lock()
            .groups
            .get(group)
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    /// Number of entries currently held in the log.
    pub fn entry_count(&self) -> usize {
        self.lock().entries.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StreamInner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("stream lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn append_sync(&self, fields: EntryFields) -> Result<EntryId, StreamError> {
        {
            let mut inner = self.lock();
            if inner.closed {
                return Err(StreamError::Unavailable);
            }
            let id = EntryId(inner.next_id);
            inner.next_id += 1;
            inner.entries.push_back(StreamEntry { id, fields });
            trim_acknowledged(&mut inner);
            drop(inner);
            self.notify.notify_waiters();
            Ok(id)
        }
    }

    fn create_group_sync(&self, group: &str) -> Result<(), StreamError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(StreamError::Unavailable);
        }
        // Already-exists is not a failure (BUSYGROUP special case):
        // the existing cursor and pending set are kept untouched.
        if inner.groups.contains_key(group) {
            tracing::debug!(%group, "consumer group already exists");
            return Ok(());
        }
        // New groups start at the current end of the stream.
        let at_end = inner.next_id - 1;
        inner.groups.insert(
            group.to_string(),
            GroupState {
                last_delivered: at_end,
                pending: HashMap::new(),
            },
        );
        Ok(())
    }

    /// Claim up to `max_count` never-delivered entries for `consumer`.
    /// Returns `None` while nothing is claimable.
    fn try_claim(
        &self,
        group: &str,
        consumer: &str,
        max_count: usize,
    ) -> Result<Option<Vec<StreamEntry>>, StreamError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.closed {
            return Err(StreamError::Unavailable);
        }
        let state = inner
            .groups
            .get_mut(group)
            .ok_or_else(|| StreamError::UnknownGroup(group.to_string()))?;

        let cursor = state.last_delivered;
        let mut batch = Vec::new();
        for entry in inner
            .entries
            .iter()
            .filter(|e| e.id.0 > cursor)
            .take(max_count)
        {
            state.pending.insert(entry.id, consumer.to_string());
            state.last_delivered = entry.id.0;
            batch.push(entry.clone());
        }
        if batch.is_empty() {
            Ok(None)
        } else {
            Ok(Some(batch))
        }
    }

    async fn read_group_inner(
        &self,
        group: String,
        consumer: String,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            // Register for wakeups before checking, so an append between
            // the check and the await is never missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(batch) = self.try_claim(&group, &consumer, max_count)? {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                // Timeout is an empty batch, not an error.
                return Ok(Vec::new());
            }
        }
    }

    fn ack_sync(&self, group: &str, id: EntryId) -> Result<(), StreamError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(StreamError::Unavailable);
        }
        // Idempotent: unknown group or already-acked id is a no-op.
        if let Some(state) = inner.groups.get_mut(group) {
            state.pending.remove(&id);
        }
        trim_acknowledged(&mut inner);
        Ok(())
    }
}

/// Drop fully-consumed entries from the front while over capacity.
/// An entry still below some group's cursor, or pending anywhere,
/// is never trimmed.
fn trim_acknowledged(inner: &mut StreamInner) {
    while inner.entries.len() > inner.max_entries {
        let front = match inner.entries.front() {
            Some(e) => e.id,
            None => break,
        };
        let in_use = inner
            .groups
            .values()
            .any(|g| front.0 > g.last_delivered || g.pending.contains_key(&front));
        if in_use {
            break;
        }
        inner.entries.pop_front();
    }
}

impl PositionStream for MemoryStream {
    fn append(
        &self,
        fields: EntryFields,
    ) -> Pin<Box<dyn Future<Output = Result<EntryId, StreamError>> + Send + '_>> {
        Box::pin(async move { self.append_sync(fields) })
    }

    fn create_group(
        &self,
        group: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StreamError>> + Send + '_>> {
        let group = group.to_string();
        Box::pin(async move { self.create_group_sync(&group) })
    }

    fn read_group(
        &self,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StreamEntry>, StreamError>> + Send + '_>> {
        let group = group.to_string();
        let consumer = consumer.to_string();
        Box::pin(self.read_group_inner(group, consumer, max_count, block))
    }

    fn ack(
        &self,
        group: &str,
        id: EntryId,
    ) -> Pin<Box<dyn Future<Output = Result<(), StreamError>> + Send + '_>> {
        let group = group.to_string();
        Box::pin(async move { self.ack_sync(&group, id) })
    }
}
