//! # Contexts: Thread-Confined Mutation Scopes
//!
//! A [`Context`] is a scratchpad of pending changes layered over its parent.
//! Reads see the parent's state with this context's own inserts, updates and
//! deletes applied on top. Writes only touch this context until `save()`.
//!
//! ## The Hierarchy
//!
//! ```text
//!                    ┌──────────────────────┐
//!                    │     StoreHandle      │  durable, SQLite
//!                    └──────────▲───────────┘
//!                               │ commit (one transaction)
//!                    ┌──────────┴───────────┐
//!                    │   primary context    │  bound to the worker thread
//!                    └──▲───────▲───────▲───┘
//!          merge on save│       │       │
//!                 ┌─────┴──┐ ┌──┴─────┐ ┌┴───────┐
//!                 │ ctx-1  │ │ ctx-2  │ │ ctx-3  │  one per calling thread
//!                 └────────┘ └────────┘ └────────┘
//! ```
//!
//! ## Save Propagation
//!
//! `save()` on a child does two things:
//!
//! 1. **Synchronously** validate its pending changes and merge them into the
//!    primary's pending state. From this point a fresh query on the primary
//!    (or any sibling) sees the changes.
//! 2. **Asynchronously** ask the primary's worker to commit. The worker runs
//!    the commit on its own thread and reports the outcome through the
//!    [`Notifier`]. The caller gets a [`SaveTicket`] to match the event.
//!
//! Requests from one context are queued on one channel and handled in order,
//! so saves from the same context are never reordered. Siblings interleave.
//!
//! ## Merge Rules
//!
//! | Child has | Parent already has | Result in parent |
//! |-----------|--------------------|------------------|
//! | insert | - | pending insert |
//! | update | pending insert | still an insert, changed fields applied |
//! | update | pending update or committed | changed fields applied |
//! | update | pending delete, or gone from the store | ignored, delete wins |
//! | delete | pending insert | gone, leaves no trace |
//! | delete | committed or updated | pending delete |
//!
//! An update carries only the attributes and relationships the child changed.
//! They are applied over the parent's current record at merge time, so a
//! sibling's committed change to another field survives.
//!
//! The same rules apply inside a single context, which is why an entity
//! inserted then deleted before any save never reaches the store.
//!
//! ## Locking
//!
//! Each context guards its state with a `Mutex`. Locks are always taken in the
//! order child, then parent, then store connection, so the hierarchy cannot
//! deadlock. The primary holds its own lock for the whole store commit, which
//! keeps a child from observing the window between "drained from the primary"
//! and "visible in the store".
//!
//! ## Thread Affinity
//!
//! Every public operation checks that it runs on the thread the context is
//! bound to, and panics with `Error::ThreadAffinityViolation` otherwise. Using
//! a context from the wrong thread is a programming error, not something to
//! recover from at runtime.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use tracing::{debug, info};

use crate::actor::ActorRequest;
use crate::entity::ManagedEntity;
use crate::error::{Error, Result};
use crate::model::{EntityDescriptor, Model};
use crate::notify::{CommitNotice, Notifier, SaveTicket};
use crate::query::PlanCache;
use crate::store::{Changeset, CommitReceipt, StoreHandle};
use crate::types::{ContextId, Generation, ObjectId, ObjectRecord, ThreadKey};

// =============================================================================
// Shared State
// =============================================================================

/// Everything the contexts of one registry share.
pub(crate) struct Shared {
    pub(crate) store: Arc<StoreHandle>,
    pub(crate) notifier: Notifier,
    pub(crate) plans: PlanCache,
}

// =============================================================================
// Pending Changes
// =============================================================================

/// What a context knows about one id without asking upstream.
enum Local<'a> {
    Present(&'a ObjectRecord),
    Deleted,
    Unknown,
}

/// The pending insert/update/delete sets of one context.
///
/// `objects` holds the working copy of every inserted or updated record.
/// Clean records are never cached here, so reads of unchanged objects always
/// reflect the latest upstream state.
#[derive(Debug, Default)]
struct ChangeState {
    objects: HashMap<ObjectId, ObjectRecord>,
    inserted: BTreeSet<ObjectId>,
    updated: BTreeSet<ObjectId>,
    dirty: HashMap<ObjectId, Dirty>,
    deleted: BTreeMap<ObjectId, String>,
    generation: Generation,
}

/// The attribute and relationship names a context changed on one record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Dirty {
    attributes: BTreeSet<String>,
    relations: BTreeSet<String>,
}

impl Dirty {
    fn between(before: &ObjectRecord, after: &ObjectRecord) -> Self {
        let attributes = before
            .attributes
            .keys()
            .chain(after.attributes.keys())
            .filter(|name| before.attributes.get(*name) != after.attributes.get(*name))
            .cloned()
            .collect();
        let relations = before
            .relations
            .keys()
            .chain(after.relations.keys())
            .filter(|name| before.related(name) != after.related(name))
            .cloned()
            .collect();
        Self {
            attributes,
            relations,
        }
    }

    fn absorb(&mut self, other: Dirty) {
        self.attributes.extend(other.attributes);
        self.relations.extend(other.relations);
    }

    /// Copies the dirty fields of `source` onto `target`.
    fn apply(&self, source: &ObjectRecord, target: &mut ObjectRecord) {
        for name in &self.attributes {
            match source.attributes.get(name) {
                Some(value) => target.attributes.insert(name.clone(), value.clone()),
                None => target.attributes.remove(name),
            };
        }
        for name in &self.relations {
            match source.relations.get(name) {
                Some(ids) => target.relations.insert(name.clone(), ids.clone()),
                None => target.relations.remove(name),
            };
        }
    }
}

/// A child's changes rebased onto its parent's current state.
#[derive(Debug, Default)]
struct Rebased {
    inserted: Vec<ObjectRecord>,
    updated: Vec<(ObjectRecord, Dirty)>,
    deleted: Vec<(ObjectId, String)>,
    /// Updates whose object was deleted upstream first.
    dropped: Vec<ObjectId>,
}

impl Rebased {
    fn changeset(&self) -> Changeset {
        Changeset {
            inserted: self.inserted.clone(),
            updated: self.updated.iter().map(|(r, _)| r.clone()).collect(),
            deleted: self.deleted.clone(),
        }
    }
}

impl ChangeState {
    fn has_changes(&self) -> bool {
        !(self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty())
    }

    fn local(&self, id: ObjectId) -> Local<'_> {
        if self.deleted.contains_key(&id) {
            return Local::Deleted;
        }
        match self.objects.get(&id) {
            Some(record) => Local::Present(record),
            None => Local::Unknown,
        }
    }

    fn record_insert(&mut self, record: ObjectRecord) {
        self.inserted.insert(record.id);
        self.objects.insert(record.id, record);
    }

    fn record_update(&mut self, record: ObjectRecord, dirty: Dirty) {
        if self.deleted.contains_key(&record.id) {
            return;
        }
        if !self.inserted.contains(&record.id) {
            self.updated.insert(record.id);
        }
        self.dirty.entry(record.id).or_default().absorb(dirty);
        self.objects.insert(record.id, record);
    }

    fn record_delete(&mut self, id: ObjectId, entity: String) {
        self.objects.remove(&id);
        self.dirty.remove(&id);
        if self.inserted.remove(&id) {
            return;
        }
        self.updated.remove(&id);
        self.deleted.insert(id, entity);
    }

    /// Rebases a child's pending changes onto this state.
    ///
    /// An update carries only the fields the child changed, applied over the
    /// current record here, or over `upstream` for ids this state does not
    /// hold. An update to an object that is gone by now is dropped: the
    /// delete wins.
    fn rebase(
        &self,
        child: &ChangeState,
        mut upstream: impl FnMut(ObjectId) -> Result<Option<ObjectRecord>>,
    ) -> Result<Rebased> {
        let mut rebased = Rebased::default();
        for id in &child.inserted {
            if let Some(record) = child.objects.get(id) {
                rebased.inserted.push(record.clone());
            }
        }
        for id in &child.updated {
            let Some(record) = child.objects.get(id) else {
                continue;
            };
            let base = match self.local(*id) {
                Local::Present(current) => Some(current.clone()),
                Local::Deleted => None,
                Local::Unknown => upstream(*id)?,
            };
            let Some(mut base) = base else {
                rebased.dropped.push(*id);
                continue;
            };
            let dirty = child.dirty.get(id).cloned().unwrap_or_default();
            dirty.apply(record, &mut base);
            rebased.updated.push((base, dirty));
        }
        rebased.deleted = child
            .deleted
            .iter()
            .map(|(id, entity)| (*id, entity.clone()))
            .collect();
        Ok(rebased)
    }

    fn merge(&mut self, rebased: Rebased) {
        for record in rebased.inserted {
            self.record_insert(record);
        }
        for (record, dirty) in rebased.updated {
            self.record_update(record, dirty);
        }
        for (id, entity) in rebased.deleted {
            self.record_delete(id, entity);
        }
    }

    fn changeset(&self) -> Changeset {
        let pick = |ids: &BTreeSet<ObjectId>| {
            ids.iter()
                .filter_map(|id| self.objects.get(id).cloned())
                .collect::<Vec<_>>()
        };
        Changeset {
            inserted: pick(&self.inserted),
            updated: pick(&self.updated),
            deleted: self
                .deleted
                .iter()
                .map(|(id, entity)| (*id, entity.clone()))
                .collect(),
        }
    }

    fn clear_pending(&mut self) {
        self.objects.clear();
        self.inserted.clear();
        self.updated.clear();
        self.dirty.clear();
        self.deleted.clear();
    }

    /// Applies this context's changes to an upstream snapshot of one entity.
    fn overlay(&self, entity: &str, upstream: Vec<ObjectRecord>) -> Vec<ObjectRecord> {
        let mut by_id: BTreeMap<ObjectId, ObjectRecord> =
            upstream.into_iter().map(|r| (r.id, r)).collect();

        for id in self.deleted.keys() {
            by_id.remove(id);
        }
        for record in self.objects.values().filter(|r| r.entity == entity) {
            by_id.insert(record.id, record.clone());
        }
        by_id.into_values().collect()
    }
}

// =============================================================================
// Context
// =============================================================================

struct ContextInner {
    id: ContextId,
    owner: OnceLock<ThreadKey>,
    parent: Option<Weak<ContextInner>>,
    children: Mutex<Vec<Weak<ContextInner>>>,
    state: Mutex<ChangeState>,
    shared: Arc<Shared>,
    mailbox: SyncSender<ActorRequest>,
}

/// A thread-confined mutation scope.
///
/// `Context` is a cheap handle: clones refer to the same scope. It is `Send`
/// so it can be handed to the thread it is bound to, but every operation
/// checks affinity.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

fn lock(state: &Mutex<ChangeState>) -> MutexGuard<'_, ChangeState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Context {
    pub(crate) fn primary(shared: Arc<Shared>, mailbox: SyncSender<ActorRequest>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: ContextId::PRIMARY,
                owner: OnceLock::new(),
                parent: None,
                children: Mutex::new(Vec::new()),
                state: Mutex::new(ChangeState::default()),
                shared,
                mailbox,
            }),
        }
    }

    pub(crate) fn child_of(parent: &Context, id: ContextId, owner: ThreadKey) -> Self {
        let bound = OnceLock::new();
        let _ = bound.set(owner);
        let child = Self {
            inner: Arc::new(ContextInner {
                id,
                owner: bound,
                parent: Some(Arc::downgrade(&parent.inner)),
                children: Mutex::new(Vec::new()),
                state: Mutex::new(ChangeState::default()),
                shared: Arc::clone(&parent.inner.shared),
                mailbox: parent.inner.mailbox.clone(),
            }),
        };

        let mut children = parent
            .inner
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        children.retain(|c| c.strong_count() > 0);
        children.push(Arc::downgrade(&child.inner));

        debug!(context_id = %id, parent = %parent.inner.id, thread = %owner, "context created");
        child
    }

    pub(crate) fn bind_owner(&self, owner: ThreadKey) {
        let _ = self.inner.owner.set(owner);
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn is_primary(&self) -> bool {
        self.inner.parent.is_none()
    }

    /// The thread this context is bound to.
    pub fn owner(&self) -> Option<ThreadKey> {
        self.inner.owner.get().copied()
    }

    /// The parent context, if it is still alive.
    pub fn parent(&self) -> Option<Context> {
        self.inner
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| Context { inner })
    }

    /// Number of live child contexts.
    pub fn child_count(&self) -> usize {
        self.inner
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| c.strong_count() > 0)
            .count()
    }

    pub fn store(&self) -> &Arc<StoreHandle> {
        &self.inner.shared.store
    }

    pub fn model(&self) -> &Arc<Model> {
        self.inner.shared.store.model()
    }

    pub fn notifier(&self) -> &Notifier {
        &self.inner.shared.notifier
    }

    pub(crate) fn mailbox(&self) -> SyncSender<ActorRequest> {
        self.inner.mailbox.clone()
    }

    pub(crate) fn plans(&self) -> &PlanCache {
        &self.inner.shared.plans
    }

    /// Looks up an entity descriptor in the store's model.
    pub fn entity(&self, name: &str) -> Result<Arc<EntityDescriptor>> {
        self.model().entity(name)
    }

    /// Generation of the most recent `save()` on this context.
    pub fn generation(&self) -> Generation {
        self.confine();
        lock(&self.inner.state).generation
    }

    /// True if anything is pending in this context.
    pub fn has_changes(&self) -> bool {
        self.confine();
        lock(&self.inner.state).has_changes()
    }

    /// Checks that the caller runs on the thread this context is bound to.
    pub fn check_affinity(&self) -> Result<()> {
        let caller = ThreadKey::current();
        match self.inner.owner.get() {
            Some(owner) if *owner != caller => Err(Error::ThreadAffinityViolation {
                context: self.inner.id,
                owner: owner.to_string(),
                caller: describe_current_thread(caller),
            }),
            _ => Ok(()),
        }
    }

    pub(crate) fn confine(&self) {
        if let Err(err) = self.check_affinity() {
            panic!("{err}");
        }
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Creates a new entity, pending insert in this context.
    ///
    /// The entity is readable and writable at once, and gets its identity
    /// token immediately. Other contexts do not see it until `save()`.
    pub fn create(&self, descriptor: &Arc<EntityDescriptor>) -> Result<ManagedEntity> {
        self.confine();
        let descriptor = self.model().entity(descriptor.name())?;
        let record = ObjectRecord::new(self.store().allocate_id(), descriptor.name());
        let id = record.id;
        lock(&self.inner.state).record_insert(record.clone());
        Ok(ManagedEntity::new(id, descriptor, self.clone(), record))
    }

    /// Creates an entity by name. Shorthand for `entity()` + `create()`.
    pub fn create_named(&self, entity: &str) -> Result<ManagedEntity> {
        let descriptor = self.entity(entity)?;
        self.create(&descriptor)
    }

    /// Marks an entity pending-delete, cascading over owning relationships.
    ///
    /// # Errors
    ///
    /// `Error::NotFound` if the entity was obtained from another context or is
    /// no longer visible here.
    pub fn delete(&self, entity: &ManagedEntity) -> Result<()> {
        self.confine();
        if entity.context().id() != self.inner.id {
            return Err(Error::NotFound {
                id: entity.id(),
                context: self.inner.id,
            });
        }
        let mut state = lock(&self.inner.state);
        let mut visited = HashSet::new();
        if !self.delete_cascading(&mut state, entity.id(), &mut visited)? {
            return Err(Error::NotFound {
                id: entity.id(),
                context: self.inner.id,
            });
        }
        debug!(context_id = %self.inner.id, id = %entity.id(), cascaded = visited.len() - 1, "delete marked");
        Ok(())
    }

    /// Marks every visible entity of a type for deletion.
    ///
    /// All marks land in this context's pending state at once, so they reach
    /// the store in the same save as one transaction. Returns how many
    /// entities were marked (cascades not counted).
    pub fn delete_all(&self, descriptor: &Arc<EntityDescriptor>) -> Result<usize> {
        self.confine();
        let mut state = lock(&self.inner.state);
        let upstream = self.upstream_view(descriptor.name())?;
        let records = state.overlay(descriptor.name(), upstream);

        let mut visited = HashSet::new();
        let mut marked = 0;
        for record in records {
            if visited.contains(&record.id) {
                continue;
            }
            if self.delete_cascading(&mut state, record.id, &mut visited)? {
                marked += 1;
            }
        }
        debug!(context_id = %self.inner.id, entity = descriptor.name(), marked, "delete_all marked");
        Ok(marked)
    }

    fn delete_cascading(
        &self,
        state: &mut ChangeState,
        id: ObjectId,
        visited: &mut HashSet<ObjectId>,
    ) -> Result<bool> {
        if !visited.insert(id) {
            return Ok(false);
        }
        let Some(record) = self.resolve(state, id)? else {
            return Ok(false);
        };
        let descriptor = self.model().entity(&record.entity)?;
        state.record_delete(record.id, record.entity.clone());

        for rel in descriptor.relationships().iter().filter(|r| r.owns) {
            for target in record.related(&rel.name) {
                self.delete_cascading(state, *target, visited)?;
            }
        }
        Ok(true)
    }

    /// Returns a handle for an existing entity by identity token.
    pub fn object_with_id(&self, id: ObjectId) -> Result<ManagedEntity> {
        self.confine();
        let record = {
            let state = lock(&self.inner.state);
            self.resolve(&state, id)?
        };
        let record = record.ok_or(Error::NotFound {
            id,
            context: self.inner.id,
        })?;
        self.materialize(record)
    }

    /// Discards every pending change.
    pub fn rollback(&self) {
        self.confine();
        lock(&self.inner.state).clear_pending();
        debug!(context_id = %self.inner.id, "rollback");
    }

    // =========================================================================
    // Save
    // =========================================================================

    /// Saves this context.
    ///
    /// For a child: validates and merges into the primary synchronously, then
    /// queues the durable commit on the primary's worker. The outcome of that
    /// commit is only reported through the [`Notifier`].
    ///
    /// For the primary: commits synchronously and returns the outcome, and
    /// also publishes it.
    ///
    /// Every call produces exactly one save event, including calls with
    /// nothing pending.
    pub fn save(&self) -> Result<SaveTicket> {
        self.confine();
        match &self.inner.parent {
            Some(parent) => self.save_into_parent(parent),
            None => self.save_primary(),
        }
    }

    fn save_into_parent(&self, parent: &Weak<ContextInner>) -> Result<SaveTicket> {
        let mut state = lock(&self.inner.state);
        state.generation = state.generation.next();
        let ticket = SaveTicket {
            context_id: self.inner.id,
            generation: state.generation,
        };

        let result = self.merge_into(&mut state, parent);
        drop(state);

        if let Err(err) = result {
            self.notifier()
                .publish_failed(ticket.context_id, ticket.generation, &err);
            return Err(err);
        }

        let request = ActorRequest::Propagate {
            origin: ticket.context_id,
            generation: ticket.generation,
        };
        if self.inner.mailbox.send(request).is_err() {
            let err = Error::Closed("primary context worker has shut down".to_string());
            self.notifier()
                .publish_failed(ticket.context_id, ticket.generation, &err);
            return Err(err);
        }
        Ok(ticket)
    }

    fn merge_into(&self, state: &mut ChangeState, parent: &Weak<ContextInner>) -> Result<()> {
        let parent = parent
            .upgrade()
            .ok_or_else(|| Error::Closed("parent context has been dropped".to_string()))?;
        let parent = Context { inner: parent };

        let mut parent_state = lock(&parent.inner.state);
        let rebased = parent_state.rebase(state, |id| parent.lookup_upstream(id))?;
        let changes = rebased.changeset();
        self.store().validate_changes(&changes)?;

        if !rebased.dropped.is_empty() {
            debug!(
                context_id = %self.inner.id,
                dropped = ?rebased.dropped,
                "updates to deleted objects dropped"
            );
        }
        parent_state.merge(rebased);
        drop(parent_state);
        state.clear_pending();

        debug!(
            context_id = %self.inner.id,
            parent = %parent.inner.id,
            generation = %state.generation,
            inserted = changes.inserted.len(),
            updated = changes.updated.len(),
            deleted = changes.deleted.len(),
            "merged into parent"
        );
        Ok(())
    }

    fn save_primary(&self) -> Result<SaveTicket> {
        let mut state = lock(&self.inner.state);
        state.generation = state.generation.next();
        let ticket = SaveTicket {
            context_id: self.inner.id,
            generation: state.generation,
        };

        match self.commit_locked(&mut state) {
            Ok(_) => {
                drop(state);
                self.notifier()
                    .publish_succeeded(ticket.context_id, ticket.generation);
                Ok(ticket)
            }
            Err(err) => {
                drop(state);
                self.notifier()
                    .publish_failed(ticket.context_id, ticket.generation, &err);
                Err(err)
            }
        }
    }

    /// Commits whatever is pending in the primary. Runs on the worker thread.
    pub(crate) fn commit_pending(&self) -> Result<Option<CommitReceipt>> {
        self.confine();
        let mut state = lock(&self.inner.state);
        self.commit_locked(&mut state)
    }

    fn commit_locked(&self, state: &mut ChangeState) -> Result<Option<CommitReceipt>> {
        let changes = state.changeset();
        if changes.is_empty() {
            return Ok(None);
        }
        // The store validates again: the primary's own edits never passed
        // through a child merge.
        let receipt = self.store().commit(&changes)?;
        state.clear_pending();

        info!(
            generation = %receipt.generation,
            objects = receipt.ids.len(),
            entities = ?receipt.entities,
            "committed to store"
        );
        self.notifier().publish_commit(CommitNotice {
            generation: receipt.generation,
            entities: receipt.entities.clone(),
        });
        Ok(Some(receipt))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Every visible record of an entity, in identity order.
    pub(crate) fn view(&self, entity: &str) -> Result<Vec<ObjectRecord>> {
        self.confine();
        self.view_unconfined(entity)
    }

    fn view_unconfined(&self, entity: &str) -> Result<Vec<ObjectRecord>> {
        let state = lock(&self.inner.state);
        let upstream = self.upstream_view(entity)?;
        Ok(state.overlay(entity, upstream))
    }

    fn upstream_view(&self, entity: &str) -> Result<Vec<ObjectRecord>> {
        match self.parent_inner()? {
            Some(parent) => Context { inner: parent }.view_unconfined(entity),
            None => self.store().fetch_entity(entity),
        }
    }

    /// The visible record for an id, or `None` if deleted or unknown.
    pub(crate) fn lookup(&self, id: ObjectId) -> Result<Option<ObjectRecord>> {
        let state = lock(&self.inner.state);
        self.resolve(&state, id)
    }

    fn resolve(&self, state: &ChangeState, id: ObjectId) -> Result<Option<ObjectRecord>> {
        match state.local(id) {
            Local::Present(record) => Ok(Some(record.clone())),
            Local::Deleted => Ok(None),
            Local::Unknown => self.lookup_upstream(id),
        }
    }

    /// The record for an id as the parent (or the store) sees it.
    fn lookup_upstream(&self, id: ObjectId) -> Result<Option<ObjectRecord>> {
        match self.parent_inner()? {
            Some(parent) => Context { inner: parent }.lookup(id),
            None => self.store().fetch_object(id),
        }
    }

    fn parent_inner(&self) -> Result<Option<Arc<ContextInner>>> {
        match &self.inner.parent {
            None => Ok(None),
            Some(weak) => weak
                .upgrade()
                .map(Some)
                .ok_or_else(|| Error::Closed("parent context has been dropped".to_string())),
        }
    }

    /// Applies `edit` to this context's working copy of an object and marks it
    /// updated (or keeps it inserted).
    pub(crate) fn update_record(
        &self,
        id: ObjectId,
        edit: impl FnOnce(&mut ObjectRecord) -> Result<()>,
    ) -> Result<ObjectRecord> {
        self.confine();
        let mut state = lock(&self.inner.state);
        let before = self.resolve(&state, id)?.ok_or(Error::NotFound {
            id,
            context: self.inner.id,
        })?;
        let mut record = before.clone();
        edit(&mut record)?;
        state.record_update(record.clone(), Dirty::between(&before, &record));
        Ok(record)
    }

    /// Pending status of one id: `(inserted, updated, deleted)`.
    pub(crate) fn pending_status(&self, id: ObjectId) -> (bool, bool, bool) {
        self.confine();
        let state = lock(&self.inner.state);
        (
            state.inserted.contains(&id),
            state.updated.contains(&id),
            state.deleted.contains_key(&id),
        )
    }

    /// Wraps a visible record in a handle bound to this context.
    pub(crate) fn materialize(&self, record: ObjectRecord) -> Result<ManagedEntity> {
        let descriptor = self.model().entity(&record.entity)?;
        Ok(ManagedEntity::new(record.id, descriptor, self.clone(), record))
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("owner", &self.inner.owner.get())
            .finish_non_exhaustive()
    }
}

fn describe_current_thread(key: ThreadKey) -> String {
    match std::thread::current().name() {
        Some(name) => format!("{key} ({name})"),
        None => key.to_string(),
    }
}

// =============================================================================
// Tests
// =============================================================================
