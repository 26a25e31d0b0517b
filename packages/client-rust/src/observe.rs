//! Durability polling.
//!
//! After a mutation the master has only acknowledged it in memory. The
//! [`ObserveHandler`] polls the key's master and replicas with the observe
//! command until the requested replication and persistence are visible,
//! the document changes under us, or the timeout expires.
//!
//! Three modes, picked from the requirement:
//!
//! | requirement                 | nodes polled      | passes when                        |
//! |-----------------------------|-------------------|------------------------------------|
//! | none                        | master, once      | key present with the expected CAS  |
//! | `PersistTo::One` only       | master            | master reports the key persisted   |
//! | anything else               | master + replicas | [`DurabilityRequirement::is_satisfied`] |
//!
//! For deletions "persisted" means `NotFound` and "replicated" means
//! `LogicalDeleted`, and CAS values are not compared.

use std::time::Duration;

use keyroute_core::{DurabilityRequirement, ObserveKeyState};
use tokio::time::{timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::pool::{NodePool, Route};
use crate::traits::NodeHandle;

/// How an observe session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurabilityOutcome {
    Satisfied,
    /// The stored CAS differs from the one written: someone else changed the
    /// document.
    Modified,
    TimedOut,
    /// The topology cannot meet the requirement. Never retried.
    ExpectationExceeded(String),
    Failed(String),
}

/// Key states that count as persisted and as replicated.
#[derive(Debug, Clone, Copy)]
struct PassingStates {
    persisted: ObserveKeyState,
    replicated: ObserveKeyState,
    check_cas: bool,
}

impl PassingStates {
    fn new(is_delete: bool) -> Self {
        if is_delete {
            Self {
                persisted: ObserveKeyState::NotFound,
                replicated: ObserveKeyState::LogicalDeleted,
                check_cas: false,
            }
        } else {
            Self {
                persisted: ObserveKeyState::FoundPersisted,
                replicated: ObserveKeyState::FoundNotPersisted,
                check_cas: true,
            }
        }
    }
}

enum Round {
    Done(DurabilityOutcome),
    Pending,
}

#[derive(Debug, Clone)]
pub struct ObserveHandler {
    pool: NodePool,
    interval: Duration,
    timeout: Duration,
}

impl ObserveHandler {
    #[must_use]
    pub fn new(pool: NodePool, interval: Duration, timeout: Duration) -> Self {
        Self {
            pool,
            interval,
            timeout,
        }
    }

    /// Checks the topology can meet `requirement` for `key` without touching
    /// the network.
    ///
    /// # Errors
    ///
    /// Returns the failing outcome when it cannot.
    pub fn precheck(&self, key: &str, requirement: DurabilityRequirement) -> Result<Route, DurabilityOutcome> {
        let route = self.pool.route(key).ok_or_else(|| {
            DurabilityOutcome::ExpectationExceeded(
                "Durability requirements are not supported by this bucket".to_string(),
            )
        })?;
        let configured = route.vbucket.configured_replicas();
        if !requirement.fits(configured) {
            return Err(DurabilityOutcome::ExpectationExceeded(format!(
                "Requested replication or persistence ({requirement}) to more nodes than the {configured} configured replicas"
            )));
        }
        Ok(route)
    }

    /// Polls until `requirement` holds for the mutation that produced `cas`.
    pub async fn observe(
        &self,
        key: &str,
        cas: u64,
        requirement: DurabilityRequirement,
        is_delete: bool,
    ) -> DurabilityOutcome {
        let route = match self.precheck(key, requirement) {
            Ok(route) => route,
            Err(outcome) => return outcome,
        };

        let targets = targets(&route);
        let persist_to = requirement.persist_to.count();
        let replicate_to = requirement.replicate_to.count();
        if targets.len() < persist_to || targets.len().saturating_sub(1) < replicate_to {
            return DurabilityOutcome::ExpectationExceeded(
                "Requested replication or persistence to more nodes than are currently online"
                    .to_string(),
            );
        }

        let states = PassingStates::new(is_delete);
        let vbucket = route.vbucket.index();
        if requirement.is_none() {
            return self.check_master(key, vbucket, cas, &targets, states).await;
        }

        let deadline = Instant::now() + self.timeout;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut rounds = 0_u32;
        loop {
            if timeout_at(deadline, ticker.tick()).await.is_err() {
                break;
            }
            rounds += 1;
            let round = async {
                if requirement.is_master_persistence() {
                    self.poll_master(key, vbucket, cas, &targets, states).await
                } else {
                    self.poll_replicated(key, vbucket, cas, requirement, &targets, states)
                        .await
                }
            };
            match timeout_at(deadline, round).await {
                Ok(Round::Done(outcome)) => {
                    debug!(key, rounds, ?outcome, "observe finished");
                    return outcome;
                }
                Ok(Round::Pending) => trace!(key, rounds, "durability not reached yet"),
                Err(_) => break,
            }
        }
        debug!(key, rounds, %requirement, "observe timed out");
        metrics::counter!("keyroute_observe_timeouts_total").increment(1);
        DurabilityOutcome::TimedOut
    }

    async fn check_master(
        &self,
        key: &str,
        vbucket: u16,
        cas: u64,
        targets: &[Target],
        states: PassingStates,
    ) -> DurabilityOutcome {
        let Some(master) = targets.iter().find(|t| t.is_master) else {
            return DurabilityOutcome::Failed("Key not found".to_string());
        };
        match master.node.observe(key, vbucket).await {
            Ok(r) if !states.check_cas => {
                if matches!(r.key_state, ObserveKeyState::NotFound | ObserveKeyState::LogicalDeleted) {
                    DurabilityOutcome::Satisfied
                } else {
                    DurabilityOutcome::Failed("Key still exists".to_string())
                }
            }
            Ok(r) if r.key_state.is_found() && cas != 0 && r.cas != cas => DurabilityOutcome::Modified,
            Ok(r) if r.key_state.is_found() => DurabilityOutcome::Satisfied,
            Ok(_) => DurabilityOutcome::Failed("Key not found".to_string()),
            Err(e) => DurabilityOutcome::Failed(e.to_string()),
        }
    }

    async fn poll_master(
        &self,
        key: &str,
        vbucket: u16,
        cas: u64,
        targets: &[Target],
        states: PassingStates,
    ) -> Round {
        let Some(master) = targets.iter().find(|t| t.is_master) else {
            return Round::Pending;
        };
        match master.node.observe(key, vbucket).await {
            Ok(r) if states.check_cas && r.cas > 0 && r.cas != cas => {
                Round::Done(DurabilityOutcome::Modified)
            }
            Ok(r) if r.key_state == states.persisted => Round::Done(DurabilityOutcome::Satisfied),
            Ok(_) => Round::Pending,
            Err(e) => {
                debug!(key, endpoint = master.node.endpoint(), error = %e, "observe on master failed");
                Round::Pending
            }
        }
    }

    async fn poll_replicated(
        &self,
        key: &str,
        vbucket: u16,
        cas: u64,
        requirement: DurabilityRequirement,
        targets: &[Target],
        states: PassingStates,
    ) -> Round {
        let mut master_persisted = false;
        let mut replica_found = 0;
        let mut replica_persisted = 0;

        for target in targets {
            let r = match target.node.observe(key, vbucket).await {
                Ok(r) => r,
                Err(e) => {
                    debug!(key, endpoint = target.node.endpoint(), error = %e, "observe failed, skipping node");
                    continue;
                }
            };
            let persisted = r.key_state == states.persisted;
            let replicated = r.key_state == states.replicated;

            if target.is_master {
                if states.check_cas && (persisted || replicated) && r.cas != cas {
                    return Round::Done(DurabilityOutcome::Modified);
                }
                master_persisted = persisted;
            } else if persisted {
                replica_persisted += 1;
                replica_found += 1;
            } else if replicated {
                replica_found += 1;
            }
        }

        if requirement.is_satisfied(replica_found, replica_persisted, master_persisted) {
            Round::Done(DurabilityOutcome::Satisfied)
        } else {
            Round::Pending
        }
    }
}

struct Target {
    node: NodeHandle,
    is_master: bool,
}

/// Master first, then every assigned replica that resolves to a node.
fn targets(route: &Route) -> Vec<Target> {
    route
        .master
        .iter()
        .map(|node| Target {
            node: node.clone(),
            is_master: true,
        })
        .chain(route.replicas.iter().map(|node| Target {
            node: node.clone(),
            is_master: false,
        }))
        .collect()
}
