//! Leader election state machine.
//!
//! Contexts sharing one store elect a leader over a broadcast channel with no
//! coordinator. This module holds only the protocol: it is driven by
//! incoming messages and clock ticks and answers with actions. Timers,
//! randomness and the channel itself belong to the caller.
//!
//! Liveness is time based: a follower that hears nothing from its leader
//! within `leader_timeout` starts a new election. When two leaders meet, the
//! higher instance id keeps the role.

use crate::{InstanceId, Timestamp};
use serde::{Deserialize, Serialize};

/// Messages exchanged on the election channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ElectionMessage {
    /// A context is looking for a leader
    Candidacy { from: InstanceId },
    /// A context just became leader
    Claim { from: InstanceId },
    /// The leader is alive
    Heartbeat { from: InstanceId },
    /// The leader is stopping
    Abdicate { from: InstanceId },
}

impl ElectionMessage {
    pub fn from(&self) -> &str {
        match self {
            ElectionMessage::Candidacy { from }
            | ElectionMessage::Claim { from }
            | ElectionMessage::Heartbeat { from }
            | ElectionMessage::Abdicate { from } => from,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Stopped,
    Candidate,
    Follower,
    Leader,
}

/// Timing knobs, all in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectionTimings {
    /// How often the leader sends heartbeats
    pub heartbeat_interval: u64,
    /// Silence after which a follower considers the leader gone
    pub leader_timeout: u64,
    /// Base wait before a candidate claims leadership
    pub settle: u64,
    /// Upper bound of the random extra wait added to `settle`
    pub jitter: u64,
}

impl Default for ElectionTimings {
    fn default() -> Self {
        Self {
            heartbeat_interval: 1_000,
            leader_timeout: 3_000,
            settle: 300,
            jitter: 300,
        }
    }
}

impl ElectionTimings {
    pub fn with_heartbeat_interval(mut self, millis: u64) -> Self {
        self.heartbeat_interval = millis;
        self
    }

    pub fn with_leader_timeout(mut self, millis: u64) -> Self {
        self.leader_timeout = millis;
        self
    }

    pub fn with_settle(mut self, millis: u64) -> Self {
        self.settle = millis;
        self
    }

    pub fn with_jitter(mut self, millis: u64) -> Self {
        self.jitter = millis;
        self
    }
}

/// What the caller has to do after feeding an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionAction {
    Broadcast(ElectionMessage),
    BecameLeader,
    LostLeadership,
}

/// Election state of one context.
#[derive(Debug, Clone)]
pub struct Election {
    id: InstanceId,
    timings: ElectionTimings,
    role: Role,
    leader: Option<InstanceId>,
    /// Candidate: when to claim leadership
    claim_at: Option<Timestamp>,
    /// Follower: when the leader is presumed dead
    leader_deadline: Option<Timestamp>,
    /// Leader: when to send the next heartbeat
    next_heartbeat: Option<Timestamp>,
}

impl Election {
    pub fn new(id: impl Into<InstanceId>, timings: ElectionTimings) -> Self {
        Self {
            id: id.into(),
            timings,
            role: Role::Stopped,
            leader: None,
            claim_at: None,
            leader_deadline: None,
            next_heartbeat: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// Last known leader, which is `self.id()` while leading.
    pub fn leader(&self) -> Option<&str> {
        self.leader.as_deref()
    }

    pub fn timings(&self) -> &ElectionTimings {
        &self.timings
    }

    /// Earliest time at which `on_tick` has something to do.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        match self.role {
            Role::Stopped => None,
            Role::Candidate => self.claim_at,
            Role::Follower => self.leader_deadline,
            Role::Leader => self.next_heartbeat,
        }
    }

    /// Join the protocol and announce candidacy. `jitter` is the random part
    /// of the claim delay, expected in `0..=timings.jitter`.
    pub fn start(&mut self, now: Timestamp, jitter: u64) -> Vec<ElectionAction> {
        self.campaign(now, self.timings.settle + jitter)
    }

    /// Leave the protocol. A leader announces its abdication.
    pub fn stop(&mut self) -> Vec<ElectionAction> {
        let mut actions = Vec::new();
        if self.role == Role::Leader {
            actions.push(ElectionAction::Broadcast(ElectionMessage::Abdicate {
                from: self.id.clone(),
            }));
            actions.push(ElectionAction::LostLeadership);
        }
        self.role = Role::Stopped;
        self.leader = None;
        self.clear_deadlines();
        actions
    }

    /// The channel dropped messages; state can no longer be trusted, so
    /// step down and run a fresh election.
    pub fn on_channel_error(&mut self, now: Timestamp, jitter: u64) -> Vec<ElectionAction> {
        if self.role == Role::Stopped {
            return Vec::new();
        }
        let mut actions = Vec::new();
        if self.role == Role::Leader {
            actions.push(ElectionAction::LostLeadership);
        }
        actions.extend(self.campaign(now, self.timings.settle + jitter));
        actions
    }

    pub fn on_message(
        &mut self,
        message: &ElectionMessage,
        now: Timestamp,
        jitter: u64,
    ) -> Vec<ElectionAction> {
        if self.role == Role::Stopped || message.from() == self.id {
            return Vec::new();
        }

        match message {
            ElectionMessage::Candidacy { .. } => {
                if self.role == Role::Leader {
                    // Let the newcomer settle right away.
                    self.next_heartbeat = Some(now + self.timings.heartbeat_interval);
                    return vec![self.heartbeat()];
                }
                Vec::new()
            }
            ElectionMessage::Claim { from } | ElectionMessage::Heartbeat { from } => {
                if self.role == Role::Leader {
                    if from.as_str() > self.id.as_str() {
                        self.follow(from.clone(), now);
                        return vec![ElectionAction::LostLeadership];
                    }
                    self.next_heartbeat = Some(now + self.timings.heartbeat_interval);
                    return vec![self.heartbeat()];
                }
                self.follow(from.clone(), now);
                Vec::new()
            }
            ElectionMessage::Abdicate { from } => {
                let from_leader = self.leader.as_deref() == Some(from.as_str());
                if self.role == Role::Leader || (self.role == Role::Follower && !from_leader) {
                    return Vec::new();
                }
                // Re-elect without the settle delay; jitter alone spreads the
                // claims.
                self.campaign(now, jitter)
            }
        }
    }

    /// Advance timers. `jitter` is only used if a follower's leader timed out.
    pub fn on_tick(&mut self, now: Timestamp, jitter: u64) -> Vec<ElectionAction> {
        match self.role {
            Role::Stopped => Vec::new(),
            Role::Candidate => match self.claim_at {
                Some(at) if now >= at => {
                    self.role = Role::Leader;
                    self.leader = Some(self.id.clone());
                    self.clear_deadlines();
                    self.next_heartbeat = Some(now + self.timings.heartbeat_interval);
                    vec![
                        ElectionAction::Broadcast(ElectionMessage::Claim {
                            from: self.id.clone(),
                        }),
                        ElectionAction::BecameLeader,
                    ]
                }
                _ => Vec::new(),
            },
            Role::Follower => match self.leader_deadline {
                Some(at) if now >= at => self.campaign(now, self.timings.settle + jitter),
                _ => Vec::new(),
            },
            Role::Leader => match self.next_heartbeat {
                Some(at) if now >= at => {
                    self.next_heartbeat = Some(now + self.timings.heartbeat_interval);
                    vec![self.heartbeat()]
                }
                _ => Vec::new(),
            },
        }
    }

    fn campaign(&mut self, now: Timestamp, delay: u64) -> Vec<ElectionAction> {
        self.role = Role::Candidate;
        self.leader = None;
        self.clear_deadlines();
        self.claim_at = Some(now + delay);
        vec![ElectionAction::Broadcast(ElectionMessage::Candidacy {
            from: self.id.clone(),
        })]
    }

    fn follow(&mut self, leader: InstanceId, now: Timestamp) {
        self.role = Role::Follower;
        self.leader = Some(leader);
        self.clear_deadlines();
        self.leader_deadline = Some(now + self.timings.leader_timeout);
    }

    fn heartbeat(&self) -> ElectionAction {
        ElectionAction::Broadcast(ElectionMessage::Heartbeat {
            from: self.id.clone(),
        })
    }

    fn clear_deadlines(&mut self) {
        self.claim_at = None;
        self.leader_deadline = None;
        self.next_heartbeat = None;
    }
}
