//! Card dependency graph with cycle rejection and transition gating.

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;
use tracing::{debug, info};

use crate::storage::{CardDependency, Database, DatabaseError};

/// Errors from dependency graph operations.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Dependency {card_id} -> {depends_on} would create a cycle")]
    WouldCreateCycle { card_id: String, depends_on: String },

    #[error("Duplicate dependency: {card_id} -> {depends_on}")]
    Duplicate { card_id: String, depends_on: String },

    #[error("Invalid dependency: {0}")]
    Invalid(String),
}

/// Outcome of a transition check: allowed, or blocked by the listed cards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionDecision {
    pub allowed: bool,
    /// Every card whose unmet dependency blocks the transition.
    pub blocking_card_ids: Vec<String>,
}

impl TransitionDecision {
    fn allowed() -> Self {
        Self {
            allowed: true,
            blocking_card_ids: Vec::new(),
        }
    }
}

/// Persistent card dependency graph.
#[derive(Clone)]
pub struct DependencyGraph {
    db: Database,
}

impl DependencyGraph {
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// Add a dependency edge `card_id -> depends_on`. Rejects self-edges
    /// and any edge that would make `card_id` reachable from itself; a
    /// rejected insert leaves the table untouched.
    pub async fn add_dependency(
        &self,
        card_id: &str,
        depends_on: &str,
        required_status: &str,
        blocking_statuses: &[&str],
    ) -> Result<CardDependency, GraphError> {
        if card_id.is_empty() || depends_on.is_empty() {
            return Err(GraphError::Invalid("card id cannot be empty".into()));
        }
        if card_id == depends_on {
            return Err(GraphError::WouldCreateCycle {
                card_id: card_id.to_string(),
                depends_on: depends_on.to_string(),
            });
        }

        // Reachability check runs before the insert so failure is a no-op.
        let edges = self.db.list_all_dependencies().await?;
        if reachable(&edges, depends_on, card_id) {
            debug!(card_id, depends_on, "Dependency rejected: would create cycle");
            return Err(GraphError::WouldCreateCycle {
                card_id: card_id.to_string(),
                depends_on: depends_on.to_string(),
            });
        }

        let blocking = serde_json::to_string(blocking_statuses)
            .map_err(|e| GraphError::Invalid(format!("blocking statuses: {e}")))?;

        let dep = self
            .db
            .create_card_dependency(card_id, depends_on, required_status, &blocking)
            .await
            .map_err(|e| match e {
                DatabaseError::Query(ref q) if q.contains("UNIQUE") => {
                    GraphError::Duplicate {
                        card_id: card_id.to_string(),
                        depends_on: depends_on.to_string(),
                    }
                }
                other => GraphError::Database(other),
            })?;

        info!(card_id, depends_on, required_status, "Dependency added");
        Ok(dep)
    }

    /// Whether `card_id` may transition to `target_status`. Every active,
    /// unmet dependency whose blocking set contains the target blocks the
    /// move; the decision lists all blockers, not just the first.
    pub async fn can_transition(
        &self,
        card_id: &str,
        target_status: &str,
    ) -> Result<TransitionDecision, GraphError> {
        let deps = self.db.list_dependencies_of(card_id).await?;
        if deps.is_empty() {
            return Ok(TransitionDecision::allowed());
        }

        let mut blocking = Vec::new();
        for dep in deps {
            if !dep.blocking().iter().any(|s| s == target_status) {
                continue;
            }
            let upstream_status = self.db.get_card_status(&dep.depends_on_card_id).await?;
            let satisfied = upstream_status.as_deref() == Some(dep.required_status.as_str());
            if !satisfied {
                blocking.push(dep.depends_on_card_id);
            }
        }

        Ok(TransitionDecision {
            allowed: blocking.is_empty(),
            blocking_card_ids: blocking,
        })
    }

    /// Mark the edge inactive (satisfied or withdrawn).
    pub async fn resolve_dependency(
        &self,
        card_id: &str,
        depends_on: &str,
    ) -> Result<bool, GraphError> {
        let removed = self.db.deactivate_card_dependency(card_id, depends_on).await?;
        if removed {
            info!(card_id, depends_on, "Dependency resolved");
        }
        Ok(removed)
    }

    /// Active dependencies of a card.
    pub async fn dependencies_of(&self, card_id: &str) -> Result<Vec<CardDependency>, GraphError> {
        Ok(self.db.list_dependencies_of(card_id).await?)
    }

    /// Active dependents of a card.
    pub async fn dependents_of(&self, card_id: &str) -> Result<Vec<CardDependency>, GraphError> {
        Ok(self.db.list_dependents_of(card_id).await?)
    }
}

/// BFS over active edges: is `to` reachable from `from` following
/// card -> depends_on direction?
fn reachable(edges: &[CardDependency], from: &str, to: &str) -> bool {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges {
        adjacency
            .entry(edge.card_id.as_str())
            .or_default()
            .push(edge.depends_on_card_id.as_str());
    }

    let mut visited: HashSet<&str> = HashSet::new();
    let mut frontier = VecDeque::from([from]);
    while let Some(node) = frontier.pop_front() {
        if node == to {
            return true;
        }
        if !visited.insert(node) {
            continue;
        }
        if let Some(next) = adjacency.get(node) {
            frontier.extend(next.iter().copied());
        }
    }
    false
}
