//! # The Primary Context's Worker
//!
//! The primary context is bound to one dedicated thread, and that thread is the
//! only place the store is ever written. Everything that must happen "on the
//! primary" reaches it as a message on a bounded channel:
//!
//! ```text
//!   ctx-1.save() ──┐
//!   ctx-2.save() ──┼──► SyncSender<ActorRequest> ──► layerdb-primary thread
//!   perform(f)  ───┘         (FIFO, bounded)          │
//!                                                     ├─ Propagate → commit, notify
//!                                                     ├─ Perform   → f(&primary)
//!                                                     └─ Shutdown  → flush, exit
//! ```
//!
//! ## Why a Channel?
//!
//! The channel is the whole synchronization story for the shared resources.
//! Requests are handled one at a time in arrival order, so:
//!
//! - two commits never run concurrently
//! - saves from one context are committed in the order they were made
//! - saves from sibling contexts interleave, but each is handled whole
//!
//! The channel is bounded: if the worker falls behind, senders block instead
//! of queueing without limit.
//!
//! ## Panics
//!
//! A panicking `perform` closure must not take the worker down with it, or
//! every later save would fail. Each request runs under `catch_unwind`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info};

use crate::context::Context;
use crate::error::Result;
use crate::types::{ContextId, Generation, ThreadKey};

/// Maximum number of queued requests before senders block.
pub const ACTOR_CHANNEL_BOUND: usize = 1024;

/// Work to run on the primary thread.
pub type PrimaryJob = Box<dyn FnOnce(&Context) + Send + 'static>;

/// Requests handled by the primary context's worker.
pub enum ActorRequest {
    /// A child context merged a save; commit and report it.
    Propagate {
        origin: ContextId,
        generation: Generation,
    },

    /// Run a closure against the primary context.
    Perform(PrimaryJob),

    /// Commit anything still pending, then stop.
    Shutdown,
}

/// Creates the request channel before the primary context exists, since the
/// primary holds the sending side.
pub fn channel() -> (SyncSender<ActorRequest>, Receiver<ActorRequest>) {
    mpsc::sync_channel(ACTOR_CHANNEL_BOUND)
}

/// Owns the worker thread of the primary context.
#[derive(Debug)]
pub struct PrimaryActor {
    request_tx: SyncSender<ActorRequest>,
    thread_handle: Option<JoinHandle<()>>,
}

impl PrimaryActor {
    /// Spawns the worker and binds `primary` to it.
    pub fn spawn(primary: Context, request_rx: Receiver<ActorRequest>) -> Result<Self> {
        let request_tx = primary.mailbox();
        let worker_ctx = primary.clone();

        let thread_handle = thread::Builder::new()
            .name("layerdb-primary".to_string())
            .spawn(move || run_primary(worker_ctx, request_rx))?;

        primary.bind_owner(ThreadKey::of(thread_handle.thread()));
        info!(thread = %ThreadKey::of(thread_handle.thread()), "primary context worker started");

        Ok(Self {
            request_tx,
            thread_handle: Some(thread_handle),
        })
    }

    /// The worker's thread key.
    pub fn thread_key(&self) -> Option<ThreadKey> {
        self.thread_handle.as_ref().map(|h| ThreadKey::of(h.thread()))
    }

    /// Returns a sender for queueing requests.
    pub fn sender(&self) -> SyncSender<ActorRequest> {
        self.request_tx.clone()
    }

    /// Flushes pending commits and stops the worker.
    ///
    /// Calling this from the worker thread itself (inside `perform`) only
    /// queues the shutdown; the join is skipped.
    pub fn shutdown(&mut self) {
        let _ = self.request_tx.send(ActorRequest::Shutdown);

        if let Some(handle) = self.thread_handle.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("primary context worker panicked");
            }
        }
    }
}

impl Drop for PrimaryActor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The worker's main loop.
fn run_primary(primary: Context, request_rx: Receiver<ActorRequest>) {
    while let Ok(request) = request_rx.recv() {
        match request {
            ActorRequest::Propagate { origin, generation } => {
                let outcome = catch_unwind(AssertUnwindSafe(|| primary.commit_pending()));
                match outcome {
                    Ok(Ok(_)) => primary.notifier().publish_succeeded(origin, generation),
                    Ok(Err(err)) => primary.notifier().publish_failed(origin, generation, &err),
                    Err(_) => {
                        error!(%origin, %generation, "commit panicked");
                        let err = crate::Error::Closed("commit panicked".to_string());
                        primary.notifier().publish_failed(origin, generation, &err);
                    }
                }
            }
            ActorRequest::Perform(job) => {
                if catch_unwind(AssertUnwindSafe(|| job(&primary))).is_err() {
                    error!("perform closure panicked on the primary context");
                }
            }
            ActorRequest::Shutdown => break,
        }
    }

    // Merges that were already acknowledged to children must not be lost.
    match primary.commit_pending() {
        Ok(Some(receipt)) => debug!(generation = %receipt.generation, "flushed on shutdown"),
        Ok(None) => {}
        Err(err) => error!(error = %err, "flush on shutdown failed"),
    }
    info!("primary context worker stopped");
}

// =============================================================================
// Tests
// =============================================================================
