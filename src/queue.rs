//! Durable command queues.
//!
//! Each queue is a FIFO stored as a named tree in the synchronization
//! store, keyed by a big-endian sequence number. Dequeue is
//! non-destructive: the consumer peeks, processes, and acknowledges only
//! after its own transaction committed, which gives at-least-once
//! delivery across crashes. Items that keep failing are moved to a
//! dead-letter tree once they exceed the retry cap.
//!
//! Two queues exist per instance: `inbound` (commands from clients) and
//! `synchronizer` (commands derived from remote sync).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, StorageError};
use crate::storage::schema::{queue_dead_tree, queue_tree};
use crate::storage::DataStore;
use crate::types::Timestamp;

/// Name of the inbound client-command queue.
pub const INBOUND_QUEUE: &str = "inbound";

/// Name of the synchronizer-produced command queue.
pub const SYNCHRONIZER_QUEUE: &str = "synchronizer";

/// Which work a flush barrier waits for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlushKind {
    /// Drain of the inbound client-command queue.
    UserQueue,
    /// Completion of all change-replay requests enqueued before the barrier.
    ReplayQueue,
    /// Completion of the current and all earlier synchronization requests.
    Synchronization,
}

/// Stored header + payload of one queued command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// When the item was enqueued.
    pub enqueued_at: Timestamp,
    /// How many processing attempts have failed so far.
    pub retries: u32,
    /// The opaque command blob.
    pub payload: Vec<u8>,
}

/// A peeked queue entry: sequence number plus item.
#[derive(Clone, Debug, PartialEq)]
pub struct QueueEntry {
    /// Position in the queue; pass back to [`CommandQueue::ack`] /
    /// [`CommandQueue::nack`].
    pub seq: u64,
    /// The stored item.
    pub item: QueueItem,
}

/// Outcome of a negative acknowledgement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NackOutcome {
    /// The item stays queued with an incremented retry count.
    Requeued {
        /// Failed attempts so far.
        retries: u32,
    },
    /// The item exceeded the retry cap and was dead-lettered.
    DeadLettered,
}

/// One durable FIFO.
#[derive(Clone)]
pub struct CommandQueue {
    store: Arc<DataStore>,
    name: String,
    tree: String,
    dead_tree: String,
    retry_cap: u32,
}

impl CommandQueue {
    /// Opens a queue by name inside the given store.
    pub fn open(store: Arc<DataStore>, name: &str, retry_cap: u32) -> Self {
        Self {
            store,
            name: name.to_string(),
            tree: queue_tree(name),
            dead_tree: queue_dead_tree(name),
            retry_cap,
        }
    }

    /// The queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends a command blob. Returns its sequence number.
    pub fn enqueue(&self, payload: Vec<u8>) -> Result<u64> {
        let item = QueueItem {
            enqueued_at: Timestamp::now(),
            retries: 0,
            payload,
        };
        let bytes = bincode::serialize(&item).map_err(StorageError::from)?;

        let mut txn = self.store.begin_write()?;
        let seq = self.last_seq_in(&txn)?.map_or(0, |s| s + 1);
        txn.put(&self.tree, &seq.to_be_bytes(), &bytes)?;
        txn.commit()?;

        debug!(queue = %self.name, seq, "enqueued command");
        Ok(seq)
    }

    /// Peeks the front entry without removing it.
    pub fn front(&self) -> Result<Option<QueueEntry>> {
        Ok(self.peek(1)?.into_iter().next())
    }

    /// Peeks up to `limit` entries in order without removing them.
    pub fn peek(&self, limit: usize) -> Result<Vec<QueueEntry>> {
        let read = self.store.begin_read()?;
        let mut entries = Vec::new();
        let mut corrupt = Vec::new();
        read.scan(&self.tree, None, &mut |key, value| {
            let Ok(seq_bytes) = <[u8; 8]>::try_from(key) else {
                return true;
            };
            let seq = u64::from_be_bytes(seq_bytes);
            match bincode::deserialize::<QueueItem>(value) {
                Ok(item) => entries.push(QueueEntry { seq, item }),
                Err(_) => {
                    warn!(queue = %self.name, seq, "dropping undecodable queue item");
                    corrupt.push(seq);
                }
            }
            entries.len() < limit
        })?;
        drop(read);

        // An undecodable blob cannot be processed or retried; remove it
        // so it does not wedge the queue.
        for seq in corrupt {
            let mut txn = self.store.begin_write()?;
            txn.delete(&self.tree, &seq.to_be_bytes())?;
            txn.commit()?;
        }
        Ok(entries)
    }

    /// Acknowledges a processed entry, removing it permanently.
    pub fn ack(&self, seq: u64) -> Result<()> {
        let mut txn = self.store.begin_write()?;
        txn.delete(&self.tree, &seq.to_be_bytes())?;
        txn.commit()?;
        Ok(())
    }

    /// Records a processing failure.
    ///
    /// Increments the retry count; past the retry cap the item moves to
    /// the dead-letter tree and [`NackOutcome::DeadLettered`] is
    /// returned so the caller can surface an error notification.
    pub fn nack(&self, seq: u64) -> Result<NackOutcome> {
        let key = seq.to_be_bytes();
        let mut txn = self.store.begin_write()?;
        let Some(bytes) = txn.get(&self.tree, &key)? else {
            // Already acked or dead-lettered; nothing to do.
            return Ok(NackOutcome::Requeued { retries: 0 });
        };
        let mut item: QueueItem = bincode::deserialize(&bytes).map_err(StorageError::from)?;
        item.retries += 1;

        let outcome = if item.retries >= self.retry_cap {
            let bytes = bincode::serialize(&item).map_err(StorageError::from)?;
            txn.delete(&self.tree, &key)?;
            txn.put(&self.dead_tree, &key, &bytes)?;
            warn!(queue = %self.name, seq, retries = item.retries, "command dead-lettered");
            NackOutcome::DeadLettered
        } else {
            let bytes = bincode::serialize(&item).map_err(StorageError::from)?;
            txn.put(&self.tree, &key, &bytes)?;
            NackOutcome::Requeued {
                retries: item.retries,
            }
        };
        txn.commit()?;
        Ok(outcome)
    }

    /// Number of pending (non-dead-lettered) items.
    pub fn len(&self) -> Result<usize> {
        let read = self.store.begin_read()?;
        let mut count = 0;
        read.scan(&self.tree, None, &mut |_k, _v| {
            count += 1;
            true
        })?;
        Ok(count)
    }

    /// True if no items are pending.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.front()?.is_none())
    }

    /// Items currently parked in the dead-letter tree.
    pub fn dead_letters(&self) -> Result<Vec<QueueEntry>> {
        let read = self.store.begin_read()?;
        let mut entries = Vec::new();
        read.scan(&self.dead_tree, None, &mut |key, value| {
            if let (Ok(seq_bytes), Ok(item)) = (
                <[u8; 8]>::try_from(key),
                bincode::deserialize::<QueueItem>(value),
            ) {
                entries.push(QueueEntry {
                    seq: u64::from_be_bytes(seq_bytes),
                    item,
                });
            }
            true
        })?;
        Ok(entries)
    }

    fn last_seq_in(&self, txn: &crate::storage::WriteTxn) -> Result<Option<u64>> {
        let mut last = None;
        txn.scan(&self.tree, None, &mut |key, _value| {
            if let Ok(seq_bytes) = <[u8; 8]>::try_from(key) {
                last = Some(u64::from_be_bytes(seq_bytes));
            }
            true
        })?;
        // Sequence numbers must never be reused, or an acked seq could
        // collide with a live one; continue after the dead-letter tail too.
        let mut dead_last = None;
        txn.scan(&self.dead_tree, None, &mut |key, _value| {
            if let Ok(seq_bytes) = <[u8; 8]>::try_from(key) {
                dead_last = Some(u64::from_be_bytes(seq_bytes));
            }
            true
        })?;
        Ok(last.max(dead_last))
    }
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("name", &self.name)
            .field("retry_cap", &self.retry_cap)
            .finish_non_exhaustive()
    }
}
