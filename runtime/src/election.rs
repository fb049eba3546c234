//! Leader election across contexts sharing a broadcast channel.
//!
//! Each [`LeaderElector`] drives one engine [`Election`] from a background
//! task: channel messages, deadlines and shutdown are multiplexed with
//! `tokio::select!`, and the resulting actions are broadcast or published on
//! a watch channel. Only the elected leader should run background
//! replication; see [`Leadership`].

use harbor_engine::{
    Election, ElectionAction, ElectionMessage, ElectionTimings, InstanceId, Role, Timestamp,
};
use rand::Rng;
use std::sync::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

/// Anything that can tell whether this context currently leads.
pub trait Leadership: Send + Sync {
    fn is_leader(&self) -> bool;
}

/// Leadership for a context that is known to be alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysLeader;

impl Leadership for AlwaysLeader {
    fn is_leader(&self) -> bool {
        true
    }
}

/// Observable state of an elector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadershipState {
    pub role: Role,
    pub leader: Option<InstanceId>,
}

/// The channel contexts use to talk to each other.
pub fn election_channel(capacity: usize) -> broadcast::Sender<ElectionMessage> {
    broadcast::channel(capacity).0
}

pub struct LeaderElector {
    id: InstanceId,
    state: watch::Receiver<LeadershipState>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LeaderElector {
    /// Join the election on `channel` under a random instance id.
    pub fn start(channel: broadcast::Sender<ElectionMessage>, timings: ElectionTimings) -> Self {
        Self::start_with_id(uuid::Uuid::new_v4().to_string(), channel, timings)
    }

    pub fn start_with_id(
        id: impl Into<InstanceId>,
        channel: broadcast::Sender<ElectionMessage>,
        timings: ElectionTimings,
    ) -> Self {
        let id = id.into();
        let (state_tx, state_rx) = watch::channel(LeadershipState {
            role: Role::Candidate,
            leader: None,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let runner = Runner {
            election: Election::new(id.clone(), timings),
            receiver: channel.subscribe(),
            channel,
            state: state_tx,
            epoch: Instant::now(),
        };
        let task = tokio::spawn(runner.run(shutdown_rx));

        tracing::info!(instance = %id, "Leader election started");

        Self {
            id,
            state: state_rx,
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> LeadershipState {
        self.state.borrow().clone()
    }

    /// Id of the leader this context currently follows, or its own.
    pub fn leader(&self) -> Option<InstanceId> {
        self.state.borrow().leader.clone()
    }

    /// Watch for role changes.
    pub fn subscribe(&self) -> watch::Receiver<LeadershipState> {
        self.state.clone()
    }

    /// Leave the election. A leader abdicates so the others re-elect
    /// without waiting for the heartbeat timeout.
    pub async fn stop(&self) {
        let task = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(_) => None,
        };
        let Some(task) = task else {
            return;
        };
        let _ = self.shutdown.send(true);
        if let Err(e) = task.await {
            tracing::warn!(instance = %self.id, error = %e, "Election task ended abnormally");
        }
        tracing::info!(instance = %self.id, "Leader election stopped");
    }
}

impl Leadership for LeaderElector {
    fn is_leader(&self) -> bool {
        self.state.borrow().role == Role::Leader
    }
}

impl Drop for LeaderElector {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

struct Runner {
    election: Election,
    channel: broadcast::Sender<ElectionMessage>,
    receiver: broadcast::Receiver<ElectionMessage>,
    state: watch::Sender<LeadershipState>,
    epoch: Instant,
}

impl Runner {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let actions = self.election.start(self.now(), self.jitter());
        self.perform(actions);

        loop {
            let deadline = self
                .election
                .next_deadline()
                .map(|at| self.epoch + Duration::from_millis(at));

            tokio::select! {
                _ = shutdown.changed() => break,
                message = self.receiver.recv() => match message {
                    Ok(message) => {
                        let actions = self.election.on_message(&message, self.now(), self.jitter());
                        self.perform(actions);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(
                            instance = %self.election.id(),
                            missed,
                            "Election channel lagged, re-electing"
                        );
                        let actions = self.election.on_channel_error(self.now(), self.jitter());
                        self.perform(actions);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = sleep_until(deadline) => {
                    let actions = self.election.on_tick(self.now(), self.jitter());
                    self.perform(actions);
                }
            }
        }

        let actions = self.election.stop();
        self.perform(actions);
    }

    fn now(&self) -> Timestamp {
        self.epoch.elapsed().as_millis() as Timestamp
    }

    fn jitter(&self) -> u64 {
        let max = self.election.timings().jitter;
        rand::thread_rng().gen_range(0..=max)
    }

    fn perform(&mut self, actions: Vec<ElectionAction>) {
        let id = self.election.id().to_string();
        for action in actions {
            match action {
                ElectionAction::Broadcast(message) => {
                    // No receivers only means every other context is gone.
                    let _ = self.channel.send(message);
                }
                ElectionAction::BecameLeader => {
                    tracing::info!(instance = %id, "Became leader");
                }
                ElectionAction::LostLeadership => {
                    tracing::info!(instance = %id, "Lost leadership");
                }
            }
        }

        let next = LeadershipState {
            role: self.election.role(),
            leader: self.election.leader().map(str::to_string),
        };
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timings() -> ElectionTimings {
        ElectionTimings::default()
    }

    #[tokio::test(start_paused = true)]
    async fn lone_context_becomes_leader() {
        let channel = election_channel(64);
        let elector = LeaderElector::start_with_id("solo", channel, timings());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(elector.is_leader());
        assert_eq!(elector.leader().as_deref(), Some("solo"));
        elector.stop().await;
        assert!(!elector.is_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn always_leader() {
        assert!(AlwaysLeader.is_leader());
    }
}
