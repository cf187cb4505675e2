use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MessengerError, Result};
use crate::proc;
use crate::store::atomic;
use crate::store::lock::SwarmLock;
use crate::store::paths::Dirs;

/// One in-flight claim on a (spec, task) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    pub agent: String,
    pub session_id: String,
    pub pid: u32,
    pub claimed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A permanent completion record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    pub completed_by: String,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

pub type ClaimsTable = BTreeMap<String, BTreeMap<String, Claim>>;
pub type CompletionsTable = BTreeMap<String, BTreeMap<String, Completion>>;

/// A claim held by this agent elsewhere in the table, returned with
/// `already_have_claim` failures.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExistingClaim {
    pub spec: String,
    pub task_id: String,
    pub claimed_at: DateTime<Utc>,
}

/// Claims/completions view with the number of stale entries dropped.
#[derive(Debug, Clone)]
pub struct SwarmView {
    pub claims: ClaimsTable,
    pub completions: CompletionsTable,
    pub pruned: usize,
}

/// The swarm claim/completion store: `B/claims.json` and
/// `B/completions.json`, every mutation guarded by the swarm lock.
pub struct ClaimStore {
    dirs: Dirs,
}

impl ClaimStore {
    pub fn new(dirs: Dirs) -> Self {
        Self { dirs }
    }

    fn lock(&self) -> SwarmLock {
        SwarmLock::new(self.dirs.swarm_lock_path())
    }

    fn read_claims(&self) -> ClaimsTable {
        atomic::read_json(&self.dirs.claims_path()).unwrap_or_default()
    }

    fn read_completions(&self) -> CompletionsTable {
        atomic::read_json(&self.dirs.completions_path()).unwrap_or_default()
    }

    fn write_claims(&self, table: &ClaimsTable) -> Result<()> {
        atomic::write_json(&self.dirs.claims_path(), table)
    }

    fn write_completions(&self, table: &CompletionsTable) -> Result<()> {
        atomic::write_json(&self.dirs.completions_path(), table)
    }

    /// Claim a (spec, task) pair.
    ///
    /// Fails with `already_claimed` if the pair is claimed, and with
    /// `already_have_claim` if this agent holds any claim anywhere in the
    /// table (one in-flight claim per agent).
    pub fn claim(
        &self,
        spec: &str,
        task_id: &str,
        agent: &str,
        session_id: &str,
        reason: Option<String>,
    ) -> Result<Claim> {
        self.lock().with(|| {
            let mut claims = self.read_claims();
            prune_stale(&mut claims);

            if let Some(existing) = claims.get(spec).and_then(|t| t.get(task_id)) {
                return Err(MessengerError::AlreadyClaimed {
                    task_id: task_id.to_string(),
                    agent: existing.agent.clone(),
                });
            }

            if let Some(existing) = find_agent_claim(&claims, agent) {
                return Err(MessengerError::AlreadyHaveClaim {
                    agent: agent.to_string(),
                    spec: existing.spec,
                    task_id: existing.task_id,
                });
            }

            let claim = Claim {
                agent: agent.into(),
                session_id: session_id.into(),
                pid: std::process::id(),
                claimed_at: Utc::now(),
                reason,
            };
            claims
                .entry(spec.to_string())
                .or_default()
                .insert(task_id.to_string(), claim.clone());
            self.write_claims(&claims)?;
            Ok(claim)
        })
    }

    /// Release this agent's claim on a (spec, task) pair.
    pub fn unclaim(&self, spec: &str, task_id: &str, agent: &str) -> Result<()> {
        self.lock().with(|| {
            let mut claims = self.read_claims();
            prune_stale(&mut claims);

            let owner = claims
                .get(spec)
                .and_then(|t| t.get(task_id))
                .map(|c| c.agent.clone());
            match owner {
                None => return Err(MessengerError::NotClaimed(task_id.to_string())),
                Some(owner) if owner != agent => {
                    return Err(MessengerError::NotYourClaim {
                        task_id: task_id.to_string(),
                        owner,
                    });
                }
                Some(_) => {}
            }

            remove_claim(&mut claims, spec, task_id);
            self.write_claims(&claims)
        })
    }

    /// Complete a (spec, task) pair: removes the claim, inserts the
    /// permanent completion record. First completer wins.
    pub fn complete(
        &self,
        spec: &str,
        task_id: &str,
        agent: &str,
        notes: Option<String>,
    ) -> Result<Completion> {
        self.lock().with(|| {
            let mut completions = self.read_completions();
            if let Some(existing) = completions.get(spec).and_then(|t| t.get(task_id)) {
                return Err(MessengerError::AlreadyCompleted {
                    task_id: task_id.to_string(),
                    by: existing.completed_by.clone(),
                });
            }

            let mut claims = self.read_claims();
            prune_stale(&mut claims);

            match claims.get(spec).and_then(|t| t.get(task_id)) {
                None => return Err(MessengerError::NotClaimed(task_id.to_string())),
                Some(claim) if claim.agent != agent => {
                    return Err(MessengerError::NotYourClaim {
                        task_id: task_id.to_string(),
                        owner: claim.agent.clone(),
                    });
                }
                Some(_) => {}
            }

            remove_claim(&mut claims, spec, task_id);
            let completion = Completion {
                completed_by: agent.into(),
                completed_at: Utc::now(),
                notes,
            };
            completions
                .entry(spec.to_string())
                .or_default()
                .insert(task_id.to_string(), completion.clone());

            self.write_claims(&claims)?;
            self.write_completions(&completions)?;
            Ok(completion)
        })
    }

    /// Drop every claim owned by `agent` (clean shutdown / unregister).
    pub fn remove_agent_claims(&self, agent: &str) -> Result<usize> {
        self.lock().with(|| {
            let mut claims = self.read_claims();
            let before = count_claims(&claims);
            for tasks in claims.values_mut() {
                tasks.retain(|_, c| c.agent != agent);
            }
            claims.retain(|_, tasks| !tasks.is_empty());
            let removed = before - count_claims(&claims);
            if removed > 0 {
                self.write_claims(&claims)?;
            }
            Ok(removed)
        })
    }

    /// Read-only view of claims and completions, stale claims dropped from
    /// the returned tables.
    ///
    /// Outside the lock the prune is in-memory only; the file is repaired by
    /// the next lock-holding mutation.
    pub fn view(&self, spec: Option<&str>) -> SwarmView {
        let mut claims = self.read_claims();
        let pruned = prune_stale(&mut claims);
        let mut completions = self.read_completions();
        if let Some(spec) = spec {
            claims.retain(|k, _| k == spec);
            completions.retain(|k, _| k == spec);
        }
        if pruned > 0 {
            debug!(pruned, "dropped stale claims from view");
        }
        SwarmView {
            claims,
            completions,
            pruned,
        }
    }

    /// The claim currently held by `agent`, if any.
    pub fn claim_of(&self, agent: &str) -> Option<ExistingClaim> {
        let mut claims = self.read_claims();
        prune_stale(&mut claims);
        find_agent_claim(&claims, agent)
    }
}

fn prune_stale(claims: &mut ClaimsTable) -> usize {
    let before = count_claims(claims);
    for tasks in claims.values_mut() {
        tasks.retain(|_, claim| proc::pid_alive(claim.pid));
    }
    claims.retain(|_, tasks| !tasks.is_empty());
    before - count_claims(claims)
}

fn count_claims(claims: &ClaimsTable) -> usize {
    claims.values().map(BTreeMap::len).sum()
}

fn find_agent_claim(claims: &ClaimsTable, agent: &str) -> Option<ExistingClaim> {
    for (spec, tasks) in claims {
        for (task_id, claim) in tasks {
            if claim.agent == agent {
                return Some(ExistingClaim {
                    spec: spec.clone(),
                    task_id: task_id.clone(),
                    claimed_at: claim.claimed_at,
                });
            }
        }
    }
    None
}

fn remove_claim(claims: &mut ClaimsTable, spec: &str, task_id: &str) {
    if let Some(tasks) = claims.get_mut(spec) {
        tasks.remove(task_id);
        if tasks.is_empty() {
            claims.remove(spec);
        }
    }
}
