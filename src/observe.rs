//! # Live Observation
//!
//! An [`ObservationHandle`] is a query result that keeps itself current. It
//! holds a compiled [`FetchPlan`], its own copy of the result rows, and a
//! receiver on the notifier's commit channel:
//!
//! ```text
//!  StoreHandle::commit ──► Notifier::publish_commit(CommitNotice)
//!                                   │
//!                                   ▼
//!  ObservationHandle::next ── entity touched? ── no ──► keep waiting
//!                                   │ yes
//!                                   ▼
//!                      re-run plan on committed rows
//!                                   │
//!                                   ▼
//!                      diff(old rows, new rows) ──► ChangeBatch
//! ```
//!
//! ## What Observations See
//!
//! Observations read committed store state only. A child context's pending
//! changes never show up, and a child's save shows up once the primary worker
//! has committed it.
//!
//! ## Missed Notices
//!
//! The handle subscribes before taking its first snapshot, so a commit that
//! lands in between is seen twice at worst: once in the snapshot, once as a
//! notice whose re-run produces an empty diff (and is skipped). If the handle
//! falls behind the broadcast buffer it re-runs the plan once and diffs against
//! what it last delivered, so intermediate states may be skipped but the
//! result is never wrong.
//!
//! ## Delta Semantics
//!
//! A [`ChangeBatch`] is a single batch update in the style of a table view:
//!
//! | Delta | Index refers to |
//! |-------|-----------------|
//! | `Delete` | position in the previous result |
//! | `Insert` | position in the new result |
//! | `Move` | `from` in the previous result, `to` in the new one |
//! | `Update` | position in the new result |
//!
//! [`ChangeBatch::apply`] performs exactly this transformation.
//!
//! ## Sharing
//!
//! Two handles opened with the same cache token and the same query share one
//! `Arc<FetchPlan>`. Rows are never shared: every handle owns its buffer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, warn};

use crate::error::Result;
use crate::notify::{CommitNotice, Notifier};
use crate::query::FetchPlan;
use crate::store::StoreHandle;
use crate::types::{Generation, ObjectId, ObjectRecord, Value};

// =============================================================================
// Deltas
// =============================================================================

/// One change to an observed result.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    Insert { index: usize, record: ObjectRecord },
    Delete { index: usize, id: ObjectId },
    Move { from: usize, to: usize, record: ObjectRecord },
    Update { index: usize, record: ObjectRecord },
}

impl Delta {
    pub fn id(&self) -> ObjectId {
        match self {
            Delta::Insert { record, .. }
            | Delta::Move { record, .. }
            | Delta::Update { record, .. } => record.id,
            Delta::Delete { id, .. } => *id,
        }
    }
}

/// The deltas produced by one store commit (or one reconciliation).
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    pub generation: Generation,
    pub deltas: Vec<Delta>,
}

impl ChangeBatch {
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn inserts(&self) -> usize {
        self.deltas
            .iter()
            .filter(|d| matches!(d, Delta::Insert { .. }))
            .count()
    }

    pub fn deletes(&self) -> usize {
        self.deltas
            .iter()
            .filter(|d| matches!(d, Delta::Delete { .. }))
            .count()
    }

    /// Transforms the previous result into the new one.
    ///
    /// `previous` must be the result the batch was computed from. Indices
    /// outside a different base are skipped.
    pub fn apply(&self, previous: &[ObjectRecord]) -> Vec<ObjectRecord> {
        let mut removed = HashSet::new();
        let mut placed: Vec<(usize, ObjectRecord)> = Vec::new();
        let mut updates = Vec::new();

        for delta in &self.deltas {
            match delta {
                Delta::Delete { index, .. } => {
                    removed.insert(*index);
                }
                Delta::Move { from, to, record } => {
                    removed.insert(*from);
                    placed.push((*to, record.clone()));
                }
                Delta::Insert { index, record } => placed.push((*index, record.clone())),
                Delta::Update { index, record } => updates.push((*index, record.clone())),
            }
        }

        let mut survivors = previous
            .iter()
            .enumerate()
            .filter(|(i, _)| !removed.contains(i))
            .map(|(_, r)| r.clone());

        let len = previous.len().saturating_sub(removed.len()) + placed.len();
        let mut slots: Vec<Option<ObjectRecord>> = vec![None; len];
        for (index, record) in placed {
            if let Some(slot) = slots.get_mut(index) {
                *slot = Some(record);
            }
        }
        let mut result: Vec<ObjectRecord> = slots
            .into_iter()
            .filter_map(|slot| slot.or_else(|| survivors.next()))
            .collect();
        for (index, record) in updates {
            if let Some(slot) = result.get_mut(index) {
                *slot = record;
            }
        }
        result
    }
}

/// A run of consecutive observed rows sharing one `section_by` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub ids: Vec<ObjectId>,
}

// =============================================================================
// Observation Handle
// =============================================================================

/// A live, incrementally updated query result.
///
/// Dropping the handle stops observation.
pub struct ObservationHandle {
    plan: Arc<FetchPlan>,
    store: Arc<StoreHandle>,
    commits: broadcast::Receiver<CommitNotice>,
    rows: Vec<ObjectRecord>,
}

impl std::fmt::Debug for ObservationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservationHandle")
            .field("entity", &self.plan.spec().entity)
            .field("rows", &self.rows.len())
            .finish()
    }
}

impl ObservationHandle {
    pub(crate) fn open(
        plan: Arc<FetchPlan>,
        store: Arc<StoreHandle>,
        notifier: &Notifier,
    ) -> Result<Self> {
        let commits = notifier.subscribe_commits();
        let rows = plan.execute(store.fetch_entity(plan.entity().name())?);
        debug!(
            entity = plan.entity().name(),
            rows = rows.len(),
            "observation opened"
        );
        Ok(Self {
            plan,
            store,
            commits,
            rows,
        })
    }

    /// The current result, as of the last delivered batch.
    pub fn snapshot(&self) -> &[ObjectRecord] {
        &self.rows
    }

    pub fn ids(&self) -> Vec<ObjectId> {
        self.rows.iter().map(|r| r.id).collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn plan(&self) -> &Arc<FetchPlan> {
        &self.plan
    }

    /// Whether both handles run the same compiled plan.
    pub fn shares_plan_with(&self, other: &ObservationHandle) -> bool {
        Arc::ptr_eq(&self.plan, &other.plan)
    }

    /// The current result grouped by the `section_by` attribute.
    ///
    /// Without `section_by` everything is one unnamed section. A null section
    /// value is named `""`.
    pub fn sections(&self) -> Vec<Section> {
        let key = self.plan.spec().section_by.as_deref();
        let mut sections: Vec<Section> = Vec::new();
        for row in &self.rows {
            let name = match key.map(|k| row.value(k)) {
                None | Some(Value::Null) => String::new(),
                Some(value) => value.to_string(),
            };
            match sections.last_mut() {
                Some(section) if section.name == name => section.ids.push(row.id),
                _ => sections.push(Section {
                    name,
                    ids: vec![row.id],
                }),
            }
        }
        sections
    }

    // =========================================================================
    // Receiving
    // =========================================================================

    /// Waits for the next commit that changes this result.
    ///
    /// # Returns
    ///
    /// - `Some(Ok(batch))` - The result changed; `snapshot()` is already current
    /// - `Some(Err(e))` - Re-running the plan failed
    /// - `None` - The notifier is gone
    pub async fn next(&mut self) -> Option<Result<ChangeBatch>> {
        loop {
            let generation = match self.commits.recv().await {
                Ok(notice) if self.concerns(&notice) => notice.generation,
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => self.lagged(n),
                Err(RecvError::Closed) => return None,
            };
            if let Some(result) = self.refresh(generation).transpose() {
                return Some(result);
            }
        }
    }

    /// Returns a pending change without waiting. `None` means nothing is ready.
    pub fn try_next(&mut self) -> Option<Result<ChangeBatch>> {
        loop {
            let generation = match self.commits.try_recv() {
                Ok(notice) if self.concerns(&notice) => notice.generation,
                Ok(_) => continue,
                Err(TryRecvError::Lagged(n)) => self.lagged(n),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            };
            if let Some(result) = self.refresh(generation).transpose() {
                return Some(result);
            }
        }
    }

    /// Blocks the current thread until the next change.
    ///
    /// Must not be called from inside an async runtime.
    pub fn next_blocking(&mut self) -> Option<Result<ChangeBatch>> {
        loop {
            let generation = match self.commits.blocking_recv() {
                Ok(notice) if self.concerns(&notice) => notice.generation,
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => self.lagged(n),
                Err(RecvError::Closed) => return None,
            };
            if let Some(result) = self.refresh(generation).transpose() {
                return Some(result);
            }
        }
    }

    fn concerns(&self, notice: &CommitNotice) -> bool {
        notice.entities.contains(self.plan.entity().name())
    }

    fn lagged(&self, missed: u64) -> Generation {
        warn!(
            entity = self.plan.entity().name(),
            missed, "observation lagged, reconciling"
        );
        self.store.generation()
    }

    /// Re-runs the plan and diffs. `Ok(None)` when nothing visible changed.
    fn refresh(&mut self, generation: Generation) -> Result<Option<ChangeBatch>> {
        let rows = self
            .plan
            .execute(self.store.fetch_entity(self.plan.entity().name())?);
        let deltas = diff(&self.rows, &rows);
        self.rows = rows;
        if deltas.is_empty() {
            return Ok(None);
        }
        debug!(
            entity = self.plan.entity().name(),
            %generation,
            deltas = deltas.len(),
            "observation changed"
        );
        Ok(Some(ChangeBatch { generation, deltas }))
    }
}

// =============================================================================
// Diff
// =============================================================================

/// Deltas turning `old` into `new`.
///
/// Rows present in both keep their relative order where possible: the longest
/// increasing run of their new positions stays put, the rest move.
pub(crate) fn diff(old: &[ObjectRecord], new: &[ObjectRecord]) -> Vec<Delta> {
    let old_pos: HashMap<ObjectId, usize> = old.iter().enumerate().map(|(i, r)| (r.id, i)).collect();
    let new_pos: HashMap<ObjectId, usize> = new.iter().enumerate().map(|(i, r)| (r.id, i)).collect();

    let mut deltas = Vec::new();

    for (index, record) in old.iter().enumerate() {
        if !new_pos.contains_key(&record.id) {
            deltas.push(Delta::Delete {
                index,
                id: record.id,
            });
        }
    }

    // Common rows in old order, tagged with their new position.
    let common: Vec<(usize, usize)> = old
        .iter()
        .enumerate()
        .filter_map(|(from, r)| new_pos.get(&r.id).map(|&to| (from, to)))
        .collect();
    let stay = longest_increasing(&common.iter().map(|&(_, to)| to).collect::<Vec<_>>());

    for (k, &(from, to)) in common.iter().enumerate() {
        let record = &new[to];
        if !stay.contains(&k) {
            deltas.push(Delta::Move {
                from,
                to,
                record: record.clone(),
            });
        } else if old[from] != *record {
            deltas.push(Delta::Update {
                index: to,
                record: record.clone(),
            });
        }
    }

    for (index, record) in new.iter().enumerate() {
        if !old_pos.contains_key(&record.id) {
            deltas.push(Delta::Insert {
                index,
                record: record.clone(),
            });
        }
    }

    deltas
}

/// Indices (into `seq`) of one longest strictly increasing subsequence.
fn longest_increasing(seq: &[usize]) -> HashSet<usize> {
    // tails[k] = index into seq of the smallest tail of a run of length k + 1
    let mut tails: Vec<usize> = Vec::new();
    let mut prev: Vec<Option<usize>> = vec![None; seq.len()];

    for (i, &value) in seq.iter().enumerate() {
        let pos = tails.partition_point(|&t| seq[t] < value);
        if pos > 0 {
            prev[i] = Some(tails[pos - 1]);
        }
        if pos == tails.len() {
            tails.push(i);
        } else {
            tails[pos] = i;
        }
    }

    let mut keep = HashSet::new();
    let mut cursor = tails.last().copied();
    while let Some(i) = cursor {
        keep.insert(i);
        cursor = prev[i];
    }
    keep
}

// =============================================================================
// Tests
// =============================================================================
