//! Nonce allocation for reliable transaction submission
//!
//! Handles:
//! - Batched pre-fetch of consecutive nonces per (account, key) slot
//! - Coalesced refills: concurrent callers for one slot share a single fetch
//! - Background top-up when the buffer runs low
//! - Rollback of a nonce whose transaction never reached the ledger
//! - Hard refresh after the ledger reports the local nonce as invalid

use crate::config::NonceConfig;
use crate::error::{ClientError, ClientResult};
use crate::ledger::LedgerApi;

use dashmap::DashMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Identifies one nonce sequence on the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NonceKey {
    pub account_index: i64,
    pub api_key_index: u8,
}

impl NonceKey {
    pub fn new(account_index: i64, api_key_index: u8) -> Self {
        Self {
            account_index,
            api_key_index,
        }
    }
}

impl fmt::Display for NonceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.account_index, self.api_key_index)
    }
}

/// Per-slot nonce state
#[derive(Default)]
struct NonceSlot {
    /// Pre-fetched values, next to hand out at the front
    buffer: VecDeque<i64>,
    /// Next value not yet materialized into the buffer
    next_unmaterialized: Option<i64>,
    /// Most recently handed out value
    last_issued: Option<i64>,
    /// When the buffer was last confirmed against the ledger
    fetched_at: Option<Instant>,
    /// Bumped on hard refresh so in-flight top-ups are discarded
    generation: u64,
    /// A background top-up is scheduled
    topping_up: bool,
}

impl NonceSlot {
    fn is_stale(&self, freshness: Duration) -> bool {
        match self.fetched_at {
            Some(at) => at.elapsed() > freshness,
            None => true,
        }
    }

    /// Replace the buffer with `count` values starting at `start`
    fn materialize(&mut self, start: i64, count: usize) {
        self.buffer.clear();
        self.extend_from(start, count);
    }

    fn extend_from(&mut self, start: i64, target_len: usize) {
        let mut next = start;
        while self.buffer.len() < target_len {
            self.buffer.push_back(next);
            next += 1;
        }
        self.next_unmaterialized = Some(next);
    }

    fn issue(&mut self) -> Option<i64> {
        let nonce = self.buffer.pop_front()?;
        self.last_issued = Some(nonce);
        Some(nonce)
    }
}

/// Issues strictly increasing nonces per (account, key) pair
///
/// All reads and writes of a slot go through its mutex; a caller that finds
/// the buffer empty performs the refill while holding it, so callers queued
/// behind it are served from that one fetch.
pub struct NonceAllocator {
    ledger: Arc<dyn LedgerApi>,
    config: NonceConfig,
    slots: DashMap<NonceKey, Arc<Mutex<NonceSlot>>>,
}

impl NonceAllocator {
    /// Create a new nonce allocator
    pub fn new(ledger: Arc<dyn LedgerApi>, config: NonceConfig) -> Self {
        Self {
            ledger,
            config,
            slots: DashMap::new(),
        }
    }

    fn slot(&self, key: NonceKey) -> Arc<Mutex<NonceSlot>> {
        self.slots
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(NonceSlot::default())))
            .clone()
    }

    /// Get the next nonce for a key
    pub async fn allocate(&self, key: NonceKey) -> ClientResult<i64> {
        let mut nonces = self.allocate_batch(key, 1).await?;
        nonces
            .pop()
            .ok_or_else(|| ClientError::Internal(format!("empty allocation for {}", key)))
    }

    /// Reserve `n` consecutive nonces for one multi-transaction operation
    pub async fn allocate_batch(&self, key: NonceKey, n: usize) -> ClientResult<Vec<i64>> {
        if n == 0 {
            return Err(ClientError::Validation(
                "nonce batch size must be at least 1".to_string(),
            ));
        }

        let slot = self.slot(key);
        let mut state = slot.lock().await;

        if state.is_stale(self.config.freshness()) || state.buffer.len() < n {
            self.refill(key, &mut state, n).await?;
        }

        let mut issued = Vec::with_capacity(n);
        for _ in 0..n {
            let nonce = state.issue().ok_or_else(|| {
                ClientError::Internal(format!("nonce buffer for {} drained during issue", key))
            })?;
            issued.push(nonce);
        }
        debug!("Allocated nonces {:?} for {}", issued, key);

        let low_water = self.config.low_water_mark;
        if low_water > 0 && state.buffer.len() <= low_water && !state.topping_up {
            state.topping_up = true;
            self.spawn_top_up(key, slot.clone(), state.generation);
        }

        Ok(issued)
    }

    /// Fill the buffer ahead of the first allocation
    pub async fn prime(&self, key: NonceKey) -> ClientResult<()> {
        let slot = self.slot(key);
        let mut state = slot.lock().await;
        if state.is_stale(self.config.freshness()) || state.buffer.is_empty() {
            self.refill(key, &mut state, 1).await?;
        }
        debug!("Primed {} nonces for {}", state.buffer.len(), key);
        Ok(())
    }

    /// Fetch from the ledger while holding the slot lock
    async fn refill(&self, key: NonceKey, state: &mut NonceSlot, needed: usize) -> ClientResult<()> {
        let stale = state.is_stale(self.config.freshness());
        let fetched = self
            .ledger
            .next_nonce(key.account_index, key.api_key_index)
            .await
            .map_err(|e| {
                warn!("Nonce refill for {} failed: {}", key, e);
                match e {
                    ClientError::Transport(_)
                    | ClientError::Http(_)
                    | ClientError::RateLimited { .. }
                    | ClientError::Timeout { .. } => e,
                    other => ClientError::Transport(format!("nonce refill failed: {}", other)),
                }
            })?;

        // Values issued but not yet landed are still ahead of the ledger
        let start = match state.last_issued {
            Some(last) => fetched.max(last + 1),
            None => fetched,
        };
        if stale && state.last_issued.is_some_and(|last| fetched <= last) {
            debug!(
                "Ledger nonce {} for {} behind last issued {:?}, continuing from {}",
                fetched, key, state.last_issued, start
            );
        }

        let count = self.config.prefetch.max(needed);
        state.materialize(start, count);
        state.fetched_at = Some(Instant::now());
        crate::metrics::record_nonce_refill(key.api_key_index);

        debug!(
            "Refilled {} nonces for {} starting at {} (ledger {})",
            count, key, start, fetched
        );
        Ok(())
    }

    /// Extend a low buffer without blocking allocators on the round trip
    fn spawn_top_up(&self, key: NonceKey, slot: Arc<Mutex<NonceSlot>>, generation: u64) {
        let ledger = self.ledger.clone();
        let prefetch = self.config.prefetch;

        tokio::spawn(async move {
            let fetched = ledger
                .next_nonce(key.account_index, key.api_key_index)
                .await;

            let mut state = slot.lock().await;
            state.topping_up = false;

            let fetched = match fetched {
                Ok(n) => n,
                Err(e) => {
                    warn!("Background nonce top-up for {} failed: {}", key, e);
                    return;
                }
            };
            if state.generation != generation {
                debug!("Discarding top-up for {} after hard refresh", key);
                return;
            }

            // Anything below the ledger's next nonce was consumed elsewhere
            state.buffer.retain(|n| *n >= fetched);
            let start = state
                .next_unmaterialized
                .map_or(fetched, |next| next.max(fetched));
            if state.buffer.back().is_some_and(|last| *last + 1 != start) {
                state.buffer.clear();
            }
            state.extend_from(start, prefetch);
            state.fetched_at = Some(Instant::now());
            crate::metrics::record_nonce_refill(key.api_key_index);

            debug!(
                "Topped up nonces for {} to depth {} (ledger {})",
                key,
                state.buffer.len(),
                fetched
            );
        });
    }

    /// Release a nonce whose transaction did not reach the ledger
    ///
    /// The value is handed out again by the next `allocate`. If anything was
    /// issued after it, reuse would reorder the sequence, so the slot is hard
    /// refreshed instead.
    pub async fn acknowledge_failure(&self, key: NonceKey, nonce: i64) {
        let slot = self.slot(key);
        let mut state = slot.lock().await;

        if state.last_issued == Some(nonce) && state.buffer.front() != Some(&nonce) {
            state.buffer.push_front(nonce);
            state.last_issued = Some(nonce - 1);
            crate::metrics::record_nonce_rollback(key.api_key_index);
            debug!("Rolled back nonce {} for {}", nonce, key);
        } else {
            warn!(
                "Out-of-order failure for nonce {} on {} (last issued {:?}), forcing refresh",
                nonce, key, state.last_issued
            );
            Self::reset(&mut state);
            crate::metrics::record_nonce_hard_refresh(key.api_key_index);
        }
    }

    /// Discard the local buffer so the next allocation re-fetches from the ledger
    pub async fn hard_refresh(&self, key: NonceKey) {
        let slot = self.slot(key);
        let mut state = slot.lock().await;
        Self::reset(&mut state);
        crate::metrics::record_nonce_hard_refresh(key.api_key_index);
        info!("Hard refreshed nonces for {}", key);
    }

    fn reset(state: &mut NonceSlot) {
        state.buffer.clear();
        state.next_unmaterialized = None;
        state.last_issued = None;
        state.fetched_at = None;
        state.generation += 1;
    }

    /// Buffered values for a key
    pub async fn buffered(&self, key: NonceKey) -> usize {
        match self.slots.get(&key).map(|s| s.value().clone()) {
            Some(slot) => slot.lock().await.buffer.len(),
            None => 0,
        }
    }
}
