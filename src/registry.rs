//! # ContextRegistry
//!
//! The entry point. A registry owns one store, one primary context with its
//! worker thread, and one child context per calling thread:
//!
//! ```text
//!  ContextRegistry
//!   ├─ StoreHandle          (shared)
//!   ├─ Notifier             (shared)
//!   ├─ PlanCache            (shared)
//!   ├─ primary + PrimaryActor
//!   └─ HashMap<ThreadKey, Context>
//!        ├─ thread A → ctx-1
//!        └─ thread B → ctx-2
//! ```
//!
//! [`ContextRegistry::current`] hands a thread its context, creating it on
//! first use. The primary is never handed out for direct use: it is bound to
//! the worker, and work runs on it through [`ContextRegistry::perform`].
//!
//! The registry is a cheap `Clone` handle. When the last clone is dropped the
//! worker flushes anything still pending and stops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::actor::{self, ActorRequest, PrimaryActor};
use crate::config::{ConfigCell, StoreConfig};
use crate::context::{Context, Shared};
use crate::error::{Error, Result};
use crate::model::Model;
use crate::notify::Notifier;
use crate::query::PlanCache;
use crate::store::StoreHandle;
use crate::types::{ContextId, ThreadKey};

struct RegistryInner {
    primary: Context,
    contexts: Mutex<HashMap<ThreadKey, Context>>,
    next_context_id: AtomicU64,
    actor: Mutex<Option<PrimaryActor>>,
    config: StoreConfig,
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        if let Some(mut actor) = self
            .actor
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            actor.shutdown();
        }
    }
}

/// Thread-to-context map over one shared store.
#[derive(Clone)]
pub struct ContextRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for ContextRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextRegistry")
            .field("database", &self.inner.config.database_name)
            .field("contexts", &self.context_count())
            .finish()
    }
}

impl ContextRegistry {
    /// Opens the on-disk store named by `config`. Freezes the cell.
    ///
    /// # Errors
    ///
    /// `Error::Config` if the configured model name is not the model's.
    pub fn open(config: &ConfigCell, model: Model) -> Result<Self> {
        let config = config.get().clone();
        if config.model_name != model.name() {
            return Err(Error::Config(format!(
                "configured model '{}' but was given model '{}'",
                config.model_name,
                model.name()
            )));
        }
        let store = StoreHandle::open(config.sqlite_store_path(), model)?;
        Self::with_store(store, &config)
    }

    /// A registry over a private in-memory store.
    pub fn open_in_memory(model: Model) -> Result<Self> {
        let config = StoreConfig {
            model_name: model.name().to_string(),
            ..StoreConfig::default()
        };
        Self::with_store(StoreHandle::open_in_memory(model)?, &config)
    }

    /// A registry over an already opened store.
    pub fn with_store(store: StoreHandle, config: &StoreConfig) -> Result<Self> {
        let shared = Arc::new(Shared {
            store: Arc::new(store),
            notifier: Notifier::new(config.notify_capacity),
            plans: PlanCache::new(config.plan_cache_capacity),
        });
        let (request_tx, request_rx) = actor::channel();
        let primary = Context::primary(shared, request_tx);
        let actor = PrimaryActor::spawn(primary.clone(), request_rx)?;

        info!(database = %config.database_name, "context registry ready");
        Ok(Self {
            inner: Arc::new(RegistryInner {
                primary,
                contexts: Mutex::new(HashMap::new()),
                next_context_id: AtomicU64::new(1),
                actor: Mutex::new(Some(actor)),
                config: config.clone(),
            }),
        })
    }

    fn contexts(&self) -> MutexGuard<'_, HashMap<ThreadKey, Context>> {
        self.inner
            .contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Context Lookup
    // =========================================================================

    /// The context bound to `thread`, created on first request.
    ///
    /// For the primary's worker thread this is the primary itself.
    pub fn context_for(&self, thread: ThreadKey) -> Context {
        if self.inner.primary.owner() == Some(thread) {
            return self.inner.primary.clone();
        }
        self.contexts()
            .entry(thread)
            .or_insert_with(|| {
                let id = self.inner.next_context_id.fetch_add(1, Ordering::Relaxed);
                Context::child_of(&self.inner.primary, ContextId::from_raw(id), thread)
            })
            .clone()
    }

    /// The calling thread's context.
    pub fn current(&self) -> Context {
        self.context_for(ThreadKey::current())
    }

    /// The primary context. Only usable from inside [`Self::perform`].
    pub fn primary(&self) -> &Context {
        &self.inner.primary
    }

    /// Forgets the context of `thread`, discarding its unsaved changes.
    /// Returns whether one existed.
    pub fn dispose(&self, thread: ThreadKey) -> bool {
        let removed = self.contexts().remove(&thread);
        if let Some(ctx) = &removed {
            debug!(context_id = %ctx.id(), thread = %thread, "context disposed");
        }
        removed.is_some()
    }

    /// Number of live child contexts.
    pub fn context_count(&self) -> usize {
        self.contexts().len()
    }

    // =========================================================================
    // Primary Work
    // =========================================================================

    /// Runs `f` on the primary context and waits for its result.
    ///
    /// Called from the worker thread itself, `f` runs inline.
    ///
    /// # Errors
    ///
    /// `Error::Closed` if the worker has stopped or `f` panicked.
    pub fn perform<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Context) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.inner.primary.owner() == Some(ThreadKey::current()) {
            return Ok(f(&self.inner.primary));
        }

        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.submit(Box::new(move |ctx| {
            let _ = reply_tx.send(f(ctx));
        }))?;
        reply_rx
            .recv()
            .map_err(|_| Error::Closed("primary work did not complete".to_string()))
    }

    /// Queues `f` on the primary context without waiting.
    pub fn perform_async<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&Context) + Send + 'static,
    {
        self.submit(Box::new(f))
    }

    fn submit(&self, job: actor::PrimaryJob) -> Result<()> {
        let sender = self
            .inner
            .actor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(PrimaryActor::sender)
            .ok_or_else(|| Error::Closed("registry has shut down".to_string()))?;
        sender
            .send(ActorRequest::Perform(job))
            .map_err(|_| Error::Closed("primary context worker has shut down".to_string()))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn notifier(&self) -> &Notifier {
        self.inner.primary.notifier()
    }

    pub fn store(&self) -> &Arc<StoreHandle> {
        self.inner.primary.store()
    }

    pub fn model(&self) -> &Arc<Model> {
        self.inner.primary.model()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Flushes pending primary changes and stops the worker. Later saves from
    /// child contexts fail with `Error::Closed`.
    pub fn shutdown(&self) {
        let actor = self
            .inner
            .actor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut actor) = actor {
            actor.shutdown();
        }
    }
}
