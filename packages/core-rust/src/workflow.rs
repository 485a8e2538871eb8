//! Per-entity lifecycle state machine with audit history.
//!
//! A [`WorkflowGraph`] is a fixed directed acyclic graph of lifecycle states;
//! states without outgoing edges are terminal. A [`WorkflowEngine`] tracks
//! one current state per registered entity and only moves it along a direct
//! graph edge.
//!
//! # History invariant
//!
//! A successful transition appends exactly one [`TransitionRecord`] to the
//! entity's history and one [`AuditEntry`] to the global audit log. A failed
//! attempt changes nothing: not the state, not the history, not the log. So
//! for every entity, `history(id).len()` equals the number of successful
//! transitions not undone by a rollback.
//!
//! Entities are never deleted; terminal entities keep their record for audit.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Bound for types usable as workflow states.
pub trait LifecycleState:
    Copy + Eq + Hash + Ord + fmt::Debug + fmt::Display + Send + Sync + 'static
{
}

impl<T> LifecycleState for T where
    T: Copy + Eq + Hash + Ord + fmt::Debug + fmt::Display + Send + Sync + 'static
{
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while building a [`WorkflowGraph`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("workflow graph contains a cycle through `{0}`")]
    Cycle(String),
    #[error("workflow graph contains a self-loop on `{0}`")]
    SelfLoop(String),
}

/// Errors returned by [`WorkflowEngine`] operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError<S: LifecycleState> {
    #[error("entity `{0}` is already registered")]
    DuplicateEntity(String),
    #[error("entity `{0}` is not registered")]
    UnknownEntity(String),
    #[error("state `{0}` is not part of the workflow graph")]
    UnknownState(S),
    #[error("invalid transition for `{entity_id}`: {from} -> {to}")]
    InvalidTransition { entity_id: String, from: S, to: S },
    #[error("entity `{0}` has no transition to roll back")]
    NoHistory(String),
}

// ---------------------------------------------------------------------------
// WorkflowGraph
// ---------------------------------------------------------------------------

/// Directed acyclic graph of lifecycle states.
#[derive(Debug, Clone)]
pub struct WorkflowGraph<S: LifecycleState> {
    /// Outgoing edges in declaration order; every state has an entry.
    edges: BTreeMap<S, Vec<S>>,
}

impl<S: LifecycleState> WorkflowGraph<S> {
    /// Builds a graph from `(from, to)` edges.
    ///
    /// Duplicate edges collapse into one. Every state mentioned by an edge
    /// belongs to the graph.
    ///
    /// # Errors
    ///
    /// [`GraphError::SelfLoop`] or [`GraphError::Cycle`] if the edges do not
    /// form a DAG.
    pub fn new(edges: impl IntoIterator<Item = (S, S)>) -> Result<Self, GraphError> {
        let mut adjacency: BTreeMap<S, Vec<S>> = BTreeMap::new();
        for (from, to) in edges {
            if from == to {
                return Err(GraphError::SelfLoop(from.to_string()));
            }
            let targets = adjacency.entry(from).or_default();
            if !targets.contains(&to) {
                targets.push(to);
            }
            adjacency.entry(to).or_default();
        }
        let graph = Self { edges: adjacency };
        graph.check_acyclic()?;
        Ok(graph)
    }

    /// Kahn's algorithm: if a topological order cannot consume every state,
    /// the leftovers sit on a cycle.
    fn check_acyclic(&self) -> Result<(), GraphError> {
        let mut in_degree: BTreeMap<S, usize> = self.edges.keys().map(|&s| (s, 0)).collect();
        for targets in self.edges.values() {
            for target in targets {
                *in_degree.entry(*target).or_default() += 1;
            }
        }

        let mut ready: VecDeque<S> = in_degree
            .iter()
            .filter(|&(_, &deg)| deg == 0)
            .map(|(&s, _)| s)
            .collect();
        let mut visited = 0;
        while let Some(state) = ready.pop_front() {
            visited += 1;
            for target in self.allowed_transitions(state) {
                if let Some(deg) = in_degree.get_mut(target) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.push_back(*target);
                    }
                }
            }
        }

        if visited == self.edges.len() {
            return Ok(());
        }
        let on_cycle = in_degree
            .into_iter()
            .find(|(_, deg)| *deg > 0)
            .map(|(s, _)| s.to_string())
            .unwrap_or_default();
        Err(GraphError::Cycle(on_cycle))
    }

    /// Returns `true` if `state` appears in the graph.
    #[must_use]
    pub fn contains(&self, state: S) -> bool {
        self.edges.contains_key(&state)
    }

    /// Direct successors of `state`; empty for terminal or unknown states.
    #[must_use]
    pub fn allowed_transitions(&self, state: S) -> &[S] {
        self.edges.get(&state).map(Vec::as_slice).unwrap_or_default()
    }

    /// Returns `true` if `from -> to` is a direct edge.
    #[must_use]
    pub fn can_transition(&self, from: S, to: S) -> bool {
        self.allowed_transitions(from).contains(&to)
    }

    /// A state with no outgoing edges.
    #[must_use]
    pub fn is_terminal_state(&self, state: S) -> bool {
        self.contains(state) && self.allowed_transitions(state).is_empty()
    }

    /// All states in `Ord` order.
    pub fn states(&self) -> impl Iterator<Item = S> + '_ {
        self.edges.keys().copied()
    }

    /// Breadth-first shortest path from `from` to `to`, both ends included.
    ///
    /// `from == to` yields `[from]` for any state in the graph. Returns
    /// `None` when `to` is unreachable or either state is unknown.
    #[must_use]
    pub fn shortest_path(&self, from: S, to: S) -> Option<Vec<S>> {
        if !self.contains(from) || !self.contains(to) {
            return None;
        }
        if from == to {
            return Some(vec![from]);
        }

        let mut parent: HashMap<S, S> = HashMap::new();
        let mut seen: HashSet<S> = HashSet::from([from]);
        let mut frontier = VecDeque::from([from]);
        while let Some(state) = frontier.pop_front() {
            for &next in self.allowed_transitions(state) {
                if !seen.insert(next) {
                    continue;
                }
                parent.insert(next, state);
                if next == to {
                    let mut path = vec![to];
                    let mut cursor = to;
                    while let Some(&prev) = parent.get(&cursor) {
                        path.push(prev);
                        cursor = prev;
                    }
                    path.reverse();
                    return Some(path);
                }
                frontier.push_back(next);
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Dispatch lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle of a dispatched work item (vessel, vehicle, job).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    Queued,
    Allocated,
    Departed,
    Arrived,
    Cancelled,
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DispatchState::Queued => "queued",
            DispatchState::Allocated => "allocated",
            DispatchState::Departed => "departed",
            DispatchState::Arrived => "arrived",
            DispatchState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

impl WorkflowGraph<DispatchState> {
    /// `queued -> allocated -> departed -> arrived`, with `cancelled`
    /// reachable from every non-terminal state.
    #[must_use]
    pub fn dispatch() -> Self {
        use DispatchState::{Allocated, Arrived, Cancelled, Departed, Queued};
        let edges = [
            (Queued, Allocated),
            (Allocated, Departed),
            (Departed, Arrived),
            (Queued, Cancelled),
            (Allocated, Cancelled),
            (Departed, Cancelled),
        ];
        // The edge list above is a fixed DAG, so construction cannot fail.
        match Self::new(edges) {
            Ok(graph) => graph,
            Err(err) => unreachable!("dispatch graph is acyclic: {err}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One successful state change. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionRecord<S> {
    pub entity_id: String,
    pub from_state: S,
    pub to_state: S,
    pub timestamp_ms: u64,
}

/// Kind of an audit-log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Transition,
    Rollback,
}

/// Entry in the append-only global audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEntry<S> {
    pub kind: AuditKind,
    pub record: TransitionRecord<S>,
}

/// Result of one item in a bulk transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome<S: LifecycleState> {
    pub entity_id: String,
    pub result: Result<TransitionRecord<S>, WorkflowError<S>>,
}

impl<S: LifecycleState> TransitionOutcome<S> {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Read-only counters for observability collectors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkflowStats {
    pub entities: usize,
    pub active: usize,
    pub terminal: usize,
    /// Entity count per state name; states with no entity are listed as 0.
    pub by_state: BTreeMap<String, usize>,
    pub audit_entries: usize,
}

#[derive(Debug, Clone)]
struct EntityRecord<S> {
    state: S,
    history: Vec<TransitionRecord<S>>,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Tracks the lifecycle state of every registered entity.
#[derive(Debug, Clone)]
pub struct WorkflowEngine<S: LifecycleState> {
    graph: WorkflowGraph<S>,
    entities: HashMap<String, EntityRecord<S>>,
    audit_log: Vec<AuditEntry<S>>,
}

impl WorkflowEngine<DispatchState> {
    /// Engine over the built-in dispatch lifecycle.
    #[must_use]
    pub fn dispatch() -> Self {
        Self::new(WorkflowGraph::dispatch())
    }
}

impl<S: LifecycleState> WorkflowEngine<S> {
    /// Creates an empty engine over `graph`.
    #[must_use]
    pub fn new(graph: WorkflowGraph<S>) -> Self {
        Self {
            graph,
            entities: HashMap::new(),
            audit_log: Vec::new(),
        }
    }

    /// Returns the graph the engine enforces.
    #[must_use]
    pub fn graph(&self) -> &WorkflowGraph<S> {
        &self.graph
    }

    /// Registers a new entity in `initial_state`.
    ///
    /// # Errors
    ///
    /// [`WorkflowError::DuplicateEntity`] if `entity_id` is known,
    /// [`WorkflowError::UnknownState`] if the state is not in the graph.
    pub fn register(&mut self, entity_id: &str, initial_state: S) -> Result<(), WorkflowError<S>> {
        if self.entities.contains_key(entity_id) {
            return Err(WorkflowError::DuplicateEntity(entity_id.to_string()));
        }
        if !self.graph.contains(initial_state) {
            return Err(WorkflowError::UnknownState(initial_state));
        }
        self.entities.insert(
            entity_id.to_string(),
            EntityRecord {
                state: initial_state,
                history: Vec::new(),
            },
        );
        Ok(())
    }

    /// Moves an entity to `target` if that is a direct edge.
    ///
    /// # Errors
    ///
    /// [`WorkflowError::UnknownEntity`] or [`WorkflowError::InvalidTransition`];
    /// nothing is mutated on error.
    pub fn transition(
        &mut self,
        entity_id: &str,
        target: S,
        now_ms: u64,
    ) -> Result<TransitionRecord<S>, WorkflowError<S>> {
        let Some(entity) = self.entities.get_mut(entity_id) else {
            return Err(WorkflowError::UnknownEntity(entity_id.to_string()));
        };
        let from = entity.state;
        if !self.graph.can_transition(from, target) {
            debug!(entity_id, %from, to = %target, "rejected workflow transition");
            return Err(WorkflowError::InvalidTransition {
                entity_id: entity_id.to_string(),
                from,
                to: target,
            });
        }

        let record = TransitionRecord {
            entity_id: entity_id.to_string(),
            from_state: from,
            to_state: target,
            timestamp_ms: now_ms,
        };
        entity.state = target;
        entity.history.push(record.clone());
        self.audit_log.push(AuditEntry {
            kind: AuditKind::Transition,
            record: record.clone(),
        });
        Ok(record)
    }

    /// Applies [`transition`](Self::transition) to each id independently.
    ///
    /// Returns one outcome per input id, in input order; a failure for one id
    /// never prevents the others from being attempted.
    pub fn bulk_transition<I>(&mut self, entity_ids: I, target: S, now_ms: u64) -> Vec<TransitionOutcome<S>>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        entity_ids
            .into_iter()
            .map(|id| {
                let id = id.as_ref();
                TransitionOutcome {
                    entity_id: id.to_string(),
                    result: self.transition(id, target, now_ms),
                }
            })
            .collect()
    }

    /// Reverts the entity to the `from_state` of its latest transition.
    ///
    /// The undone record leaves the entity history; the audit log keeps it
    /// and gains a [`AuditKind::Rollback`] entry describing the reversal.
    ///
    /// # Errors
    ///
    /// [`WorkflowError::UnknownEntity`] or [`WorkflowError::NoHistory`].
    pub fn rollback_last_transition(
        &mut self,
        entity_id: &str,
        now_ms: u64,
    ) -> Result<TransitionRecord<S>, WorkflowError<S>> {
        let Some(entity) = self.entities.get_mut(entity_id) else {
            return Err(WorkflowError::UnknownEntity(entity_id.to_string()));
        };
        let Some(last) = entity.history.pop() else {
            return Err(WorkflowError::NoHistory(entity_id.to_string()));
        };

        let reversal = TransitionRecord {
            entity_id: entity_id.to_string(),
            from_state: entity.state,
            to_state: last.from_state,
            timestamp_ms: now_ms,
        };
        entity.state = last.from_state;
        self.audit_log.push(AuditEntry {
            kind: AuditKind::Rollback,
            record: reversal.clone(),
        });
        Ok(reversal)
    }

    /// Current state of an entity.
    #[must_use]
    pub fn get_state(&self, entity_id: &str) -> Option<S> {
        self.entities.get(entity_id).map(|e| e.state)
    }

    /// Whether the entity sits in a terminal state.
    ///
    /// # Errors
    ///
    /// [`WorkflowError::UnknownEntity`] for an unregistered id.
    pub fn is_terminal(&self, entity_id: &str) -> Result<bool, WorkflowError<S>> {
        self.get_state(entity_id)
            .map(|state| self.graph.is_terminal_state(state))
            .ok_or_else(|| WorkflowError::UnknownEntity(entity_id.to_string()))
    }

    /// Direct successors of `state` in the graph.
    #[must_use]
    pub fn allowed_transitions(&self, state: S) -> &[S] {
        self.graph.allowed_transitions(state)
    }

    /// See [`WorkflowGraph::shortest_path`].
    #[must_use]
    pub fn shortest_path(&self, from: S, to: S) -> Option<Vec<S>> {
        self.graph.shortest_path(from, to)
    }

    /// Number of entities not in a terminal state.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.entities
            .values()
            .filter(|e| !self.graph.is_terminal_state(e.state))
            .count()
    }

    /// Successful transitions of an entity, oldest first.
    #[must_use]
    pub fn history(&self, entity_id: &str) -> Option<&[TransitionRecord<S>]> {
        self.entities.get(entity_id).map(|e| e.history.as_slice())
    }

    /// The global append-only audit log.
    #[must_use]
    pub fn audit_log(&self) -> &[AuditEntry<S>] {
        &self.audit_log
    }

    /// Number of registered entities, terminal ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Returns `true` when no entity is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Snapshot of per-state counts.
    #[must_use]
    pub fn stats(&self) -> WorkflowStats {
        let mut by_state: BTreeMap<String, usize> =
            self.graph.states().map(|s| (s.to_string(), 0)).collect();
        for entity in self.entities.values() {
            *by_state.entry(entity.state.to_string()).or_default() += 1;
        }
        let active = self.active_count();
        WorkflowStats {
            entities: self.entities.len(),
            active,
            terminal: self.entities.len() - active,
            by_state,
            audit_entries: self.audit_log.len(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
