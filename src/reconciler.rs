//! Multi-client database reconciliation
//!
//! Every client appends its own [`DatabaseVersion`]s and publishes them.
//! [`DatabaseReconciler::reconcile`] merges the local log with the logs
//! downloaded from other clients into one consistent view. It is a pure
//! function of its inputs: the same set of versions yields the same result
//! no matter in which order they were fetched, so a failed sync can simply
//! run it again.
//!
//! ## Algorithm
//!
//! 1. **Acceptance.** A remote version is accepted once its causal
//!    predecessors are known: the same client's previous version and, for
//!    every other client in its clock, that client's version with the
//!    recorded counter. If any version of a client cannot be accepted, the
//!    whole new contribution of that client is quarantined and acceptance is
//!    repeated without it, since other clients may have depended on it.
//! 2. **Frontier.** The meet (component-wise minimum) of every client's
//!    latest clock, with the local client contributing its merged clock.
//!    Versions at or below the frontier have been seen by everybody.
//! 3. **Conflict detection.** For every file history touched by a newly
//!    accepted version, the touching versions above the frontier (plus older
//!    ones concurrent with them) are reduced to their causal heads. Heads are
//!    pairwise concurrent; more than one head is a conflict.
//! 4. **Resolution.** A [`ConflictPolicy`] picks the winning head, and each
//!    losing head that still has content is forked into a new history at a
//!    "conflicted copy" path. Superseded deltas are recomputed from every
//!    version touching the history: whatever is not causally at or before
//!    the winner loses, and the choice repeats inside the winner's past.
//!    Conflicts that were settled before a later edit dominated them thus
//!    supersede the same deltas on every client.
//! 5. **Output.** All known versions in causal order, the winning file
//!    versions, the forks and the merge of every clock.
//!
//! ## Examples
//!
//! ```rust
//! use std::collections::BTreeMap;
//! use syncfold::model::DatabaseVersion;
//! use syncfold::reconciler::DatabaseReconciler;
//! use syncfold::vector_clock::VectorClock;
//!
//! let remote = DatabaseVersion::new("A", VectorClock::new().increment("A"));
//! let mut logs = BTreeMap::new();
//! logs.insert("A".to_string(), vec![remote]);
//!
//! let result = DatabaseReconciler::new().reconcile("B", &[], &logs);
//! assert_eq!(result.accepted.len(), 1);
//! assert_eq!(result.merged_clock.to_string(), "(A1)");
//! ```

use crate::model::{
    DatabaseVersion, DatabaseVersionId, FileHistory, FileHistoryId, FileStatus, FileType,
    FileVersion,
};
use crate::vector_clock::{ClockOrdering, VectorClock};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info, warn};

/// One head of a conflicting history
#[derive(Debug, Clone, Copy)]
pub struct ConflictCandidate<'a> {
    /// Version that produced this state
    pub version_id: &'a DatabaseVersionId,
    /// The file state at that head
    pub file_version: &'a FileVersion,
}

/// Decides which of several concurrent file states wins
pub trait ConflictPolicy: Send + Sync + fmt::Debug {
    /// Total order over candidates; the smallest wins
    fn compare(&self, a: &ConflictCandidate<'_>, b: &ConflictCandidate<'_>) -> Ordering;
}

/// Latest content modification wins; ties go to the smaller client id
#[derive(Debug, Clone, Copy, Default)]
pub struct LatestModifiedWins;

impl ConflictPolicy for LatestModifiedWins {
    fn compare(&self, a: &ConflictCandidate<'_>, b: &ConflictCandidate<'_>) -> Ordering {
        b.file_version
            .last_modified
            .cmp(&a.file_version.last_modified)
            .then_with(|| a.version_id.client.cmp(&b.version_id.client))
            .then_with(|| a.version_id.sequence.cmp(&b.version_id.sequence))
    }
}

/// A resolved conflict on one file history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// Conflicting history
    pub history: FileHistoryId,
    /// Version holding the winning state
    pub winner: DatabaseVersionId,
    /// Versions holding losing states
    pub losers: Vec<DatabaseVersionId>,
}

/// Outcome of a reconciliation
#[derive(Debug, Clone, Default)]
pub struct MergeResult {
    /// All known versions (local and accepted) in causal order
    pub merged_history: Vec<DatabaseVersion>,
    /// Newly accepted remote versions, in causal order
    pub accepted: Vec<DatabaseVersionId>,
    /// Final state of every history touched by an accepted version
    pub winning_versions: BTreeMap<FileHistoryId, FileVersion>,
    /// Conflicts found among new versions
    pub conflicts: Vec<Conflict>,
    /// Forked histories preserving losing states
    pub conflicted_copies: Vec<FileHistory>,
    /// History deltas that lost a conflict and must not be applied
    pub losing_deltas: BTreeSet<(DatabaseVersionId, FileHistoryId)>,
    /// Histories whose losing deltas were recomputed from every known
    /// version; `losing_deltas` is complete for each of them
    pub resolved_histories: BTreeSet<FileHistoryId>,
    /// Merge of every input clock
    pub merged_clock: VectorClock,
    /// Clock below which every client has seen every version
    pub frontier: VectorClock,
    /// Clients whose new versions were rejected, with the reason
    pub quarantined: BTreeMap<String, String>,
}

impl MergeResult {
    /// True if nothing new was accepted
    pub fn is_unchanged(&self) -> bool {
        self.accepted.is_empty()
    }
}

/// Merges local and remote version logs
#[derive(Debug)]
pub struct DatabaseReconciler {
    policy: Box<dyn ConflictPolicy>,
}

impl Default for DatabaseReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseReconciler {
    /// Reconciler with the [`LatestModifiedWins`] policy
    pub fn new() -> Self {
        Self {
            policy: Box::new(LatestModifiedWins),
        }
    }

    /// Reconciler with a custom tie-break policy
    pub fn with_policy(policy: impl ConflictPolicy + 'static) -> Self {
        Self {
            policy: Box::new(policy),
        }
    }

    /// Merge the local log with remote logs
    ///
    /// # Arguments
    ///
    /// * `local_client` - Id of the reconciling client
    /// * `local` - Every version already known locally
    /// * `remote` - Downloaded versions; map keys are informational, versions
    ///   are grouped by the client recorded in their header
    pub fn reconcile(
        &self,
        local_client: &str,
        local: &[DatabaseVersion],
        remote: &BTreeMap<String, Vec<DatabaseVersion>>,
    ) -> MergeResult {
        let mut result = MergeResult::default();

        let local_ids: BTreeSet<DatabaseVersionId> = local.iter().map(|v| v.id()).collect();
        let local_clock = local
            .iter()
            .fold(VectorClock::new(), |clock, v| clock.merge(v.vector_clock()));

        let mut pending = collect_new_versions(local_client, &local_ids, remote, &mut result.quarantined);
        let accepted = accept(&local_ids, &mut pending, &mut result.quarantined);

        let mut all: Vec<&DatabaseVersion> = local.iter().chain(accepted.iter().copied()).collect();
        all.sort_by_key(|v| v.causal_key());
        all.dedup_by_key(|v| v.id());

        result.accepted = accepted.iter().map(|v| v.id()).collect();
        result.merged_clock = all
            .iter()
            .fold(local_clock.clone(), |clock, v| clock.merge(v.vector_clock()));
        result.frontier = frontier(local_client, &local_clock, &all);

        let touched: BTreeSet<&FileHistoryId> = accepted
            .iter()
            .flat_map(|v| v.file_histories.iter().map(|h| &h.id))
            .collect();
        for history in touched {
            self.resolve_history(history, &all, &local_ids, &mut result);
        }

        result.merged_history = all.into_iter().cloned().collect();
        debug!(
            "Reconciled {} new versions, {} conflicts, {} quarantined clients, clock {}",
            result.accepted.len(),
            result.conflicts.len(),
            result.quarantined.len(),
            result.merged_clock
        );
        result
    }

    fn resolve_history(
        &self,
        history: &FileHistoryId,
        all: &[&DatabaseVersion],
        local_ids: &BTreeSet<DatabaseVersionId>,
        result: &mut MergeResult,
    ) {
        let touching: Vec<&DatabaseVersion> = all
            .iter()
            .copied()
            .filter(|v| v.file_history(history).is_some())
            .collect();

        result.resolved_histories.insert(history.clone());
        for loser in self.losing_line(history, &touching) {
            result.losing_deltas.insert((loser, history.clone()));
        }

        let mut candidates: Vec<&DatabaseVersion> = touching
            .iter()
            .copied()
            .filter(|v| !v.vector_clock().dominated_by(&result.frontier))
            .collect();
        let settled_concurrent: Vec<&DatabaseVersion> = touching
            .iter()
            .copied()
            .filter(|v| v.vector_clock().dominated_by(&result.frontier))
            .filter(|v| {
                candidates
                    .iter()
                    .any(|c| c.vector_clock().compare(v.vector_clock()) == ClockOrdering::Simultaneous)
            })
            .collect();
        candidates.extend(settled_concurrent);
        candidates.sort_by_key(|v| v.causal_key());

        let heads: Vec<&DatabaseVersion> = candidates
            .iter()
            .copied()
            .filter(|v| {
                !candidates
                    .iter()
                    .any(|c| v.vector_clock().compare(c.vector_clock()) == ClockOrdering::Before)
            })
            .collect();

        let states: Vec<(DatabaseVersionId, FileVersion)> = heads
            .iter()
            .filter_map(|v| {
                v.file_history(history)
                    .and_then(|h| h.last_version())
                    .map(|fv| (v.id(), fv.clone()))
            })
            .collect();

        if states.len() <= 1 {
            if let Some((_, version)) = states.into_iter().next() {
                result.winning_versions.insert(history.clone(), version);
            }
            return;
        }

        let winner_index = self
            .pick_winner(states.iter().map(|(id, version)| (id, version)))
            .unwrap_or(0);
        let (winner_id, winner_version) = states[winner_index].clone();

        let involves_new = heads.iter().any(|h| !local_ids.contains(&h.id()));
        let losers: Vec<(DatabaseVersionId, FileVersion)> = states
            .into_iter()
            .enumerate()
            .filter(|(i, _)| *i != winner_index)
            .map(|(_, state)| state)
            .collect();

        if involves_new {
            info!(
                "Conflict on {} ({}): {} wins over {}",
                winner_version.path,
                history,
                winner_id,
                losers.iter().map(|(id, _)| id.to_string()).collect::<Vec<_>>().join(", ")
            );
            for (loser_id, loser_version) in &losers {
                if !loser_version.is_deleted() {
                    result
                        .conflicted_copies
                        .push(conflicted_copy(history, loser_id, loser_version));
                }
            }
            result.conflicts.push(Conflict {
                history: history.clone(),
                winner: winner_id,
                losers: losers.into_iter().map(|(id, _)| id).collect(),
            });
        }
        result.winning_versions.insert(history.clone(), winner_version);
    }

    /// Index of the winning state under the policy
    fn pick_winner<'a>(
        &self,
        states: impl Iterator<Item = (&'a DatabaseVersionId, &'a FileVersion)>,
    ) -> Option<usize> {
        let states: Vec<ConflictCandidate<'a>> = states
            .map(|(version_id, file_version)| ConflictCandidate {
                version_id,
                file_version,
            })
            .collect();
        (0..states.len()).min_by(|&a, &b| self.policy.compare(&states[a], &states[b]))
    }

    /// Versions whose delta of `history` lies off the winning line
    ///
    /// The policy picks a winner among the heads of all versions touching
    /// the history; every version not causally at or before it loses. The
    /// same choice then repeats inside the winner's past, so a conflict that
    /// a later edit already built upon still supersedes the same deltas.
    /// The outcome depends only on the set of versions, never on which of
    /// them were new to this run.
    fn losing_line(&self, history: &FileHistoryId, touching: &[&DatabaseVersion]) -> Vec<DatabaseVersionId> {
        let mut remaining: Vec<(&DatabaseVersion, DatabaseVersionId, &FileVersion)> = touching
            .iter()
            .filter_map(|v| {
                v.file_history(history)
                    .and_then(|h| h.last_version())
                    .map(|fv| (*v, v.id(), fv))
            })
            .collect();
        let mut losing = Vec::new();

        loop {
            let heads: Vec<usize> = (0..remaining.len())
                .filter(|&i| {
                    !remaining.iter().any(|(other, _, _)| {
                        remaining[i].0.vector_clock().compare(other.vector_clock()) == ClockOrdering::Before
                    })
                })
                .collect();
            let Some(pick) = self.pick_winner(heads.iter().map(|&i| (&remaining[i].1, remaining[i].2))) else {
                break;
            };
            let winner = remaining[heads[pick]].0;

            let mut past = Vec::new();
            for entry in &remaining {
                match entry.0.vector_clock().compare(winner.vector_clock()) {
                    ClockOrdering::Before => past.push(entry.clone()),
                    ClockOrdering::Equal => {}
                    _ => losing.push(entry.1.clone()),
                }
            }
            remaining = past;
        }

        losing.sort();
        losing
    }
}

/// Group unknown remote versions by client, rejecting malformed input
fn collect_new_versions<'a>(
    local_client: &str,
    local_ids: &BTreeSet<DatabaseVersionId>,
    remote: &'a BTreeMap<String, Vec<DatabaseVersion>>,
    quarantined: &mut BTreeMap<String, String>,
) -> BTreeMap<String, BTreeMap<u64, &'a DatabaseVersion>> {
    let mut pending: BTreeMap<String, BTreeMap<u64, &'a DatabaseVersion>> = BTreeMap::new();

    for version in remote.values().flatten() {
        let client = version.client();
        if client == local_client || local_ids.contains(&version.id()) {
            continue;
        }
        if let Err(e) = version.validate() {
            quarantine(quarantined, client, format!("invalid version {}: {}", version.id(), e));
            continue;
        }
        let slot = pending.entry(client.to_string()).or_default();
        match slot.get(&version.sequence()) {
            Some(existing) if *existing != version => {
                quarantine(
                    quarantined,
                    client,
                    format!("two different versions claim id {}", version.id()),
                );
            }
            Some(_) => {}
            None => {
                slot.insert(version.sequence(), version);
            }
        }
    }

    pending.retain(|client, _| !quarantined.contains_key(client));
    pending
}

/// Accept versions whose predecessors are known, quarantining clients
/// that cannot be fully accepted
fn accept<'a>(
    local_ids: &BTreeSet<DatabaseVersionId>,
    pending: &mut BTreeMap<String, BTreeMap<u64, &'a DatabaseVersion>>,
    quarantined: &mut BTreeMap<String, String>,
) -> Vec<&'a DatabaseVersion> {
    loop {
        let mut ordered: Vec<&DatabaseVersion> = pending.values().flat_map(|m| m.values().copied()).collect();
        ordered.sort_by_key(|v| v.causal_key());

        // Predecessors always sort first, so one pass reaches the fixpoint
        let mut known = local_ids.clone();
        let mut accepted = Vec::new();
        let mut rejected: BTreeMap<String, String> = BTreeMap::new();
        for version in ordered {
            match missing_predecessor(version, &known) {
                None => {
                    known.insert(version.id());
                    accepted.push(version);
                }
                Some(missing) => {
                    rejected.entry(version.client().to_string()).or_insert_with(|| {
                        format!("version {} is missing causal predecessor {}", version.id(), missing)
                    });
                }
            }
        }

        if rejected.is_empty() {
            return accepted;
        }
        for (client, reason) in rejected {
            pending.remove(&client);
            quarantine(quarantined, &client, reason);
        }
    }
}

fn missing_predecessor(
    version: &DatabaseVersion,
    known: &BTreeSet<DatabaseVersionId>,
) -> Option<DatabaseVersionId> {
    for (client, value) in version.vector_clock().iter() {
        let required = if client == version.client() { value - 1 } else { value };
        if required == 0 {
            continue;
        }
        let id = DatabaseVersionId {
            client: client.to_string(),
            sequence: required,
        };
        if !known.contains(&id) {
            return Some(id);
        }
    }
    None
}

fn quarantine(quarantined: &mut BTreeMap<String, String>, client: &str, reason: String) {
    if !quarantined.contains_key(client) {
        warn!("Quarantining versions of client {}: {}", client, reason);
        quarantined.insert(client.to_string(), reason);
    }
}

/// Meet of every client's latest clock
fn frontier(local_client: &str, local_clock: &VectorClock, all: &[&DatabaseVersion]) -> VectorClock {
    let mut heads: BTreeMap<&str, &VectorClock> = BTreeMap::new();
    for version in all {
        if version.client() != local_client {
            heads.insert(version.client(), version.vector_clock());
        }
    }

    heads
        .values()
        .fold(local_clock.clone(), |acc, clock| acc.meet(clock))
}

/// Path of a conflicted copy: `<stem> (<client>'s conflicted copy, <time>)<.ext>`
pub fn conflicted_copy_path(path: &str, file_type: FileType, client: &str, when: DateTime<Utc>) -> String {
    let (dir, name) = match path.rfind('/') {
        Some(i) => (&path[..=i], &path[i + 1..]),
        None => ("", path),
    };
    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 && file_type != FileType::Folder => (&name[..i], &name[i..]),
        _ => (name, ""),
    };
    format!(
        "{}{} ({}'s conflicted copy, {}){}",
        dir,
        stem,
        client,
        when.format("%Y-%m-%d %H-%M-%S"),
        ext
    )
}

/// Identity of the history forked from `history` for a losing version
pub fn conflicted_copy_id(history: &FileHistoryId, loser: &DatabaseVersionId) -> FileHistoryId {
    let sequence = loser.sequence.to_string();
    FileHistoryId::derived(&[history.as_str(), &loser.client, &sequence])
}

fn conflicted_copy(history: &FileHistoryId, loser: &DatabaseVersionId, version: &FileVersion) -> FileHistory {
    let id = conflicted_copy_id(history, loser);

    let mut copy = version.clone();
    copy.version = 1;
    copy.status = FileStatus::New;
    copy.path = conflicted_copy_path(&version.path, version.file_type, &loser.client, version.last_modified);

    FileHistory {
        id,
        versions: vec![copy],
    }
}
