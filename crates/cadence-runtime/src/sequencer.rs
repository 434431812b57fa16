//! Per-stream monotonic revision buffering (spec component C1).
//!
//! [`MonotonicSequencer`] enforces that keys are delivered to its consumer
//! callback in strictly increasing order, buffering out-of-order arrivals
//! and reporting gap open/close transitions exactly once per epoch.

use std::collections::BTreeMap;
use std::future::Future;

use thiserror::Error;

/// Why a key was treated as a duplicate. The underlying buffer collapses
/// both cases to the same `on_duplicate` callback; callers that care about
/// the distinction can match on this.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DuplicateKind {
    /// `key < expected`: already delivered.
    BelowExpected,
    /// `key` is already sitting in the buffer awaiting the gap to close.
    AlreadyBuffered,
}

/// Reports gap open/close transitions for a single sequencer. A gap opens
/// on the first out-of-order arrival of an epoch and closes the moment the
/// buffer drains back to empty.
pub trait GapHandler<K> {
    fn gap_detected(&mut self, expected: K, actual: K);
    fn gap_closed(&mut self);
}

/// Reports keys that arrived below `expected` or already sitting in the
/// buffer.
pub trait DuplicateHandler<K, V> {
    fn on_duplicate(&mut self, key: K, value: V, kind: DuplicateKind);
}

/// A [`GapHandler`]/[`DuplicateHandler`] pair that does nothing, for
/// callers that don't need the callbacks (e.g. `ExpectedRevision::IgnoreHistory`
/// streams, which never construct a sequencer at all).
#[derive(Default)]
pub struct NoopHandlers;

impl<K> GapHandler<K> for NoopHandlers {
    fn gap_detected(&mut self, _expected: K, _actual: K) {}
    fn gap_closed(&mut self) {}
}

impl<K, V> DuplicateHandler<K, V> for NoopHandlers {
    fn on_duplicate(&mut self, _key: K, _value: V, _kind: DuplicateKind) {}
}

#[derive(Debug, Error)]
pub enum SequencerError<E> {
    #[error("sequencer buffer exceeded its configured limit of {limit}")]
    BufferOverflow { limit: usize },
    /// Forwards `Display` only, not `source` -- `E` here is usually
    /// `anyhow::Error`, which does not implement `std::error::Error`.
    #[error("{0}")]
    Delivery(E),
}

/// A buffer enforcing strictly increasing `i32` keys over an unreliable
/// feed. One instance tracks exactly one stream.
pub struct MonotonicSequencer<V> {
    expected: i32,
    buffer: BTreeMap<i32, V>,
    buffer_limit: Option<usize>,
    gap_open: bool,
}

impl<V> MonotonicSequencer<V> {
    pub fn new(expected: i32, buffer_limit: Option<usize>) -> Self {
        MonotonicSequencer {
            expected,
            buffer: BTreeMap::new(),
            buffer_limit,
            gap_open: false,
        }
    }

    pub fn expected(&self) -> i32 {
        self.expected
    }

    pub fn is_gap_open(&self) -> bool {
        self.gap_open
    }

    /// Offers `(key, value)` to the sequencer.
    ///
    /// `deliver` is invoked, possibly multiple times in a single call, once
    /// per key that becomes deliverable (the offered key itself, plus any
    /// run of previously-buffered keys it connects to `expected`). Delivery
    /// order is always ascending and gapless. If `deliver` returns an
    /// error, draining stops immediately and the error is returned; the
    /// key that failed is considered not-yet-delivered.
    pub async fn offer<D, Fut, E>(
        &mut self,
        key: i32,
        value: V,
        gap: &mut dyn GapHandler<i32>,
        dup: &mut dyn DuplicateHandler<i32, V>,
        mut deliver: D,
    ) -> Result<(), SequencerError<E>>
    where
        D: FnMut(i32, V) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        if key < self.expected {
            dup.on_duplicate(key, value, DuplicateKind::BelowExpected);
            return Ok(());
        }

        if key > self.expected {
            if self.buffer.contains_key(&key) {
                dup.on_duplicate(key, value, DuplicateKind::AlreadyBuffered);
                return Ok(());
            }

            if !self.gap_open {
                self.gap_open = true;
                gap.gap_detected(self.expected, key);
            }

            self.buffer.insert(key, value);
            if let Some(limit) = self.buffer_limit {
                if self.buffer.len() > limit {
                    return Err(SequencerError::BufferOverflow { limit });
                }
            }

            return Ok(());
        }

        // key == expected
        deliver(key, value).await.map_err(SequencerError::Delivery)?;
        self.expected += 1;

        while let Some(next) = self.buffer.remove(&self.expected) {
            deliver(self.expected, next)
                .await
                .map_err(SequencerError::Delivery)?;
            self.expected += 1;
        }

        if self.gap_open && self.buffer.is_empty() {
            self.gap_open = false;
            gap.gap_closed();
        }

        Ok(())
    }
}
