//! Write batching.
//!
//! Saves are collected into a pending window. A window is sealed when it
//! reaches `max_entries` objects or `max_bytes` bytes, when it has been open
//! for `max_age`, or when a caller asks for an explicit flush. Each sealed
//! window becomes one staged tree and one deal submission; every save in it
//! learns the outcome through its [`Waiter`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::time::Instant;

use dealstore_common::Handle;

use crate::api::JobId;
use crate::config::BatchConfig;
use crate::error::BackendError;

pub type BatchOutcome = Result<JobId, Arc<BackendError>>;

/// One object waiting to be staged.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub handle: Handle,
    /// Path relative to the repository root.
    pub relative: String,
    pub data: Bytes,
    digest: [u8; 32],
}

impl PendingWrite {
    pub fn new(handle: Handle, relative: String, data: Bytes) -> Self {
        let digest = Sha256::digest(&data).into();
        Self {
            handle,
            relative,
            data,
            digest,
        }
    }

    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest)
    }
}

/// Whether a window holding `entries` objects and `bytes` bytes must be sealed.
pub fn should_seal(policy: &BatchConfig, entries: usize, bytes: u64) -> bool {
    entries >= policy.max_entries || bytes >= policy.max_bytes
}

/// Whether a window opened at `opened_at` has outlived `max_age` at `now`.
pub fn is_expired(policy: &BatchConfig, opened_at: Instant, now: Instant) -> bool {
    now.saturating_duration_since(opened_at) >= policy.max_age()
}

struct Window {
    writes: Vec<PendingWrite>,
    index: HashMap<Handle, usize>,
    bytes: u64,
    opened_at: Instant,
    done: watch::Sender<Option<BatchOutcome>>,
}

impl Window {
    fn open(now: Instant) -> Self {
        let (done, _) = watch::channel(None);
        Self {
            writes: Vec::new(),
            index: HashMap::new(),
            bytes: 0,
            opened_at: now,
            done,
        }
    }

    fn waiter(&self) -> Waiter {
        Waiter {
            rx: self.done.subscribe(),
        }
    }

    fn seal(self) -> SealedBatch {
        SealedBatch {
            writes: self.writes,
            bytes: self.bytes,
            done: self.done,
        }
    }
}

/// A window that no longer accepts writes and is ready to be flushed.
pub struct SealedBatch {
    writes: Vec<PendingWrite>,
    bytes: u64,
    done: watch::Sender<Option<BatchOutcome>>,
}

impl SealedBatch {
    pub fn writes(&self) -> &[PendingWrite] {
        &self.writes
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Publish the outcome to every waiting save.
    pub fn complete(self, outcome: BatchOutcome) {
        self.done.send_replace(Some(outcome));
    }
}

/// Resolves once the batch a write landed in has been flushed.
pub struct Waiter {
    rx: watch::Receiver<Option<BatchOutcome>>,
}

impl Waiter {
    pub async fn wait(mut self) -> Result<JobId, BackendError> {
        let outcome = match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        match outcome {
            Some(Ok(job)) => Ok(job),
            Some(Err(err)) => Err(BackendError::Batch(err)),
            // the batch was dropped without being flushed
            None => Err(BackendError::Batch(Arc::new(BackendError::Cancelled))),
        }
    }
}

pub struct Enqueued {
    pub waiter: Waiter,
    /// Set when this write filled the window.
    pub sealed: Option<SealedBatch>,
}

#[derive(Default)]
struct State {
    window: Option<Window>,
    closed: bool,
}

pub struct Batcher {
    policy: BatchConfig,
    state: Mutex<State>,
}

impl Batcher {
    pub fn new(policy: BatchConfig) -> Self {
        Self {
            policy,
            state: Mutex::new(State::default()),
        }
    }

    /// Add `write` to the open window.
    ///
    /// A write for a handle already in the window joins it when the content
    /// matches and is rejected otherwise.
    pub fn push(&self, write: PendingWrite) -> Result<Enqueued, BackendError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(BackendError::Closed);
        }

        let window = state.window.get_or_insert_with(|| Window::open(Instant::now()));
        if let Some(&idx) = window.index.get(&write.handle) {
            if window.writes[idx].digest != write.digest {
                return Err(BackendError::ContentMismatch(write.handle));
            }
            return Ok(Enqueued {
                waiter: window.waiter(),
                sealed: None,
            });
        }

        window.bytes += write.data.len() as u64;
        window.index.insert(write.handle.clone(), window.writes.len());
        window.writes.push(write);
        let waiter = window.waiter();
        let full = should_seal(&self.policy, window.writes.len(), window.bytes);

        let sealed = if full {
            state.window.take().map(Window::seal)
        } else {
            None
        };
        Ok(Enqueued { waiter, sealed })
    }

    /// Seal the open window if it has outlived the age limit.
    pub fn take_expired(&self, now: Instant) -> Option<SealedBatch> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let expired = state
            .window
            .as_ref()
            .is_some_and(|w| is_expired(&self.policy, w.opened_at, now));
        if expired {
            state.window.take().map(Window::seal)
        } else {
            None
        }
    }

    /// Seal the open window regardless of its size or age.
    pub fn take(&self) -> Option<SealedBatch> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.window.take().map(Window::seal)
    }

    /// Refuse further writes and hand back whatever is still pending.
    pub fn shutdown(&self) -> Option<SealedBatch> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        state.window.take().map(Window::seal)
    }

    /// Number of writes in the open window.
    pub fn pending(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.window.as_ref().map_or(0, |w| w.writes.len())
    }
}
