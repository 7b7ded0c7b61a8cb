//! The waiting queue of users currently searching for a peer
//!
//! Entries are keyed by user id, so a user can hold at most one live entry.
//! An entry's `session_id` is only changed through [`WaitingQueue::assign_session`],
//! a compare-and-swap the matchmaker uses to reserve entries for a session.
//! Every change to `session_id` is also published on the entry's pairing watch,
//! which is how a searching client learns it has been paired.

use crate::error::{MatchError, Result};
use crate::types::{QueueEntry, SearchFilters, SessionId, UserId};
use crate::utils::{current_timestamp, elapsed_since};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

struct QueueSlot {
    entry: QueueEntry,
    pairing: watch::Sender<Option<SessionId>>,
}

/// Set of searching users
#[derive(Default)]
pub struct WaitingQueue {
    entries: RwLock<HashMap<UserId, QueueSlot>>,
}

fn fifo_order(a: &QueueEntry, b: &QueueEntry) -> std::cmp::Ordering {
    a.enqueued_at
        .cmp(&b.enqueued_at)
        .then_with(|| a.user_id.cmp(&b.user_id))
}

impl WaitingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a searching user
    ///
    /// Fails with `AlreadySearching` if the user already holds an entry, paired or not.
    pub fn enqueue(&self, user_id: &str, filters: SearchFilters) -> Result<QueueEntry> {
        self.enqueue_at(user_id, filters, current_timestamp())
    }

    pub(crate) fn enqueue_at(
        &self,
        user_id: &str,
        filters: SearchFilters,
        enqueued_at: DateTime<Utc>,
    ) -> Result<QueueEntry> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| MatchError::lock_poisoned("queue"))?;

        if entries.contains_key(user_id) {
            return Err(MatchError::AlreadySearching {
                user_id: user_id.to_string(),
            }
            .into());
        }

        let entry = QueueEntry {
            user_id: user_id.to_string(),
            enqueued_at,
            session_id: None,
            filters,
        };
        let (pairing, _) = watch::channel(None);
        entries.insert(
            user_id.to_string(),
            QueueSlot {
                entry: entry.clone(),
                pairing,
            },
        );

        debug!("Enqueued user {} ({} entries)", user_id, entries.len());
        Ok(entry)
    }

    /// Remove a user's entry regardless of its pairing state
    ///
    /// Returns the removed entry; removing an absent user is a no-op. Dropping the
    /// entry closes its pairing watch.
    pub fn dequeue(&self, user_id: &str) -> Result<Option<QueueEntry>> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| MatchError::lock_poisoned("queue"))?;

        let removed = entries.remove(user_id).map(|slot| slot.entry);
        if removed.is_some() {
            debug!("Dequeued user {}", user_id);
        }
        Ok(removed)
    }

    /// The user's current entry, if any
    pub fn get(&self, user_id: &str) -> Result<Option<QueueEntry>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| MatchError::lock_poisoned("queue"))?;
        Ok(entries.get(user_id).map(|slot| slot.entry.clone()))
    }

    /// Unpaired entries, oldest first (ties broken by user id)
    pub fn list_unpaired(&self) -> Result<Vec<QueueEntry>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| MatchError::lock_poisoned("queue"))?;

        let mut unpaired: Vec<QueueEntry> = entries
            .values()
            .filter(|slot| !slot.entry.is_paired())
            .map(|slot| slot.entry.clone())
            .collect();
        unpaired.sort_by(fifo_order);
        Ok(unpaired)
    }

    /// Entries currently reserved for `session_id`, oldest first
    pub fn reserved_for(&self, session_id: SessionId) -> Result<Vec<QueueEntry>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| MatchError::lock_poisoned("queue"))?;

        let mut reserved: Vec<QueueEntry> = entries
            .values()
            .filter(|slot| slot.entry.session_id == Some(session_id))
            .map(|slot| slot.entry.clone())
            .collect();
        reserved.sort_by(fifo_order);
        Ok(reserved)
    }

    /// Number of unpaired entries
    pub fn count(&self) -> Result<usize> {
        let entries = self
            .entries
            .read()
            .map_err(|_| MatchError::lock_poisoned("queue"))?;
        Ok(entries.values().filter(|slot| !slot.entry.is_paired()).count())
    }

    /// Number of entries, paired or not
    pub fn len(&self) -> Result<usize> {
        let entries = self
            .entries
            .read()
            .map_err(|_| MatchError::lock_poisoned("queue"))?;
        Ok(entries.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Compare-and-swap the entry's session id
    ///
    /// Returns `false` without changing anything when the user has no entry or the
    /// current value differs from `expected`.
    pub fn assign_session(
        &self,
        user_id: &str,
        expected: Option<SessionId>,
        new: Option<SessionId>,
    ) -> Result<bool> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| MatchError::lock_poisoned("queue"))?;

        match entries.get_mut(user_id) {
            Some(slot) if slot.entry.session_id == expected => {
                slot.entry.session_id = new;
                slot.pairing.send_replace(new);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Watch the user's pairing; the value is the session the entry is reserved for
    pub fn pairing_watch(&self, user_id: &str) -> Result<watch::Receiver<Option<SessionId>>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| MatchError::lock_poisoned("queue"))?;

        entries
            .get(user_id)
            .map(|slot| slot.pairing.subscribe())
            .ok_or_else(|| {
                MatchError::NotSearching {
                    user_id: user_id.to_string(),
                }
                .into()
            })
    }

    /// Clear the reservation of every entry bearing `session_id`
    ///
    /// The entries keep their original `enqueued_at` and so their place in line.
    pub fn release_session(&self, session_id: SessionId) -> Result<Vec<UserId>> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| MatchError::lock_poisoned("queue"))?;

        let mut released = Vec::new();
        for slot in entries.values_mut() {
            if slot.entry.session_id == Some(session_id) {
                slot.entry.session_id = None;
                slot.pairing.send_replace(None);
                released.push(slot.entry.user_id.clone());
            }
        }
        released.sort();
        Ok(released)
    }

    /// Drop unpaired entries that have been waiting longer than `max_wait`
    pub fn remove_stale(&self, max_wait: Duration) -> Result<Vec<QueueEntry>> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| MatchError::lock_poisoned("queue"))?;

        let stale: Vec<UserId> = entries
            .values()
            .filter(|slot| !slot.entry.is_paired() && elapsed_since(slot.entry.enqueued_at) > max_wait)
            .map(|slot| slot.entry.user_id.clone())
            .collect();

        Ok(stale
            .iter()
            .filter_map(|user_id| entries.remove(user_id).map(|slot| slot.entry))
            .collect())
    }
}
