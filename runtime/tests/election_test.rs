//! Leader election across several contexts sharing one channel.
//!
//! Time is paused so timeouts elapse instantly and deterministically.

use harbor_engine::{ElectionMessage, ElectionTimings, Role};
use harbor_runtime::{election_channel, LeaderElector, Leadership};
use std::time::Duration;
use tokio::sync::broadcast;

fn timings() -> ElectionTimings {
    ElectionTimings::default()
}

fn start_all(ids: &[&str]) -> (broadcast::Sender<ElectionMessage>, Vec<LeaderElector>) {
    let channel = election_channel(64);
    let electors = ids
        .iter()
        .map(|id| LeaderElector::start_with_id(*id, channel.clone(), timings()))
        .collect();
    (channel, electors)
}

fn leaders(electors: &[LeaderElector]) -> Vec<String> {
    electors
        .iter()
        .filter(|e| e.is_leader())
        .map(|e| e.id().to_string())
        .collect()
}

/// Exactly one leader, and everyone agrees on who it is.
fn assert_settled(electors: &[LeaderElector]) -> String {
    let leaders = leaders(electors);
    assert_eq!(leaders.len(), 1, "leaders: {leaders:?}");
    let leader = leaders[0].clone();
    for elector in electors {
        assert_eq!(elector.leader().as_deref(), Some(leader.as_str()), "{}", elector.id());
    }
    leader
}

// ============================================================================
// Election
// ============================================================================

#[tokio::test(start_paused = true)]
async fn five_contexts_elect_one_leader() {
    let (_channel, electors) = start_all(&["a", "b", "c", "d", "e"]);
    tokio::time::sleep(Duration::from_secs(5)).await;

    let leader = assert_settled(&electors);
    for elector in electors.iter().filter(|e| e.id() != leader) {
        assert_eq!(elector.state().role, Role::Follower);
    }

    // Heartbeats keep the result stable
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(assert_settled(&electors), leader);

    for elector in &electors {
        elector.stop().await;
    }
}

#[tokio::test(start_paused = true)]
async fn abdication_triggers_reelection() {
    let (_channel, mut electors) = start_all(&["a", "b", "c", "d", "e"]);
    tokio::time::sleep(Duration::from_secs(5)).await;
    let leader = assert_settled(&electors);

    let position = electors.iter().position(|e| e.id() == leader).unwrap();
    let old = electors.remove(position);
    old.stop().await;
    assert!(!old.is_leader());

    // Well below the heartbeat timeout: followers react to the abdication
    tokio::time::sleep(Duration::from_secs(1)).await;
    let next = assert_settled(&electors);
    assert_ne!(next, leader);
    assert_eq!(electors.len(), 4);

    for elector in &electors {
        elector.stop().await;
    }
}

#[tokio::test(start_paused = true)]
async fn silent_leader_times_out() {
    let (_channel, mut electors) = start_all(&["a", "b", "c", "d", "e"]);
    tokio::time::sleep(Duration::from_secs(5)).await;
    let leader = assert_settled(&electors);

    // Dropping aborts the task without abdicating
    let position = electors.iter().position(|e| e.id() == leader).unwrap();
    drop(electors.remove(position));

    tokio::time::sleep(Duration::from_millis(500)).await;
    for elector in &electors {
        assert_eq!(elector.leader().as_deref(), Some(leader.as_str()));
    }

    tokio::time::sleep(Duration::from_secs(6)).await;
    let next = assert_settled(&electors);
    assert_ne!(next, leader);

    for elector in &electors {
        elector.stop().await;
    }
}

#[tokio::test(start_paused = true)]
async fn newcomer_follows_existing_leader() {
    let (channel, mut electors) = start_all(&["a", "b"]);
    tokio::time::sleep(Duration::from_secs(2)).await;
    let leader = assert_settled(&electors);

    // A higher id joining later does not take over
    electors.push(LeaderElector::start_with_id("z", channel.clone(), timings()));
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(assert_settled(&electors), leader);
    assert_eq!(electors[2].state().role, Role::Follower);

    for elector in &electors {
        elector.stop().await;
    }
}

#[tokio::test(start_paused = true)]
async fn role_changes_are_observable() {
    let channel = election_channel(16);
    let elector = LeaderElector::start(channel, timings());
    let mut state = elector.subscribe();

    state.changed().await.unwrap();
    while state.borrow_and_update().role != Role::Leader {
        state.changed().await.unwrap();
    }
    assert!(elector.is_leader());
    assert_eq!(elector.leader().as_deref(), Some(elector.id()));
    assert!(uuid::Uuid::parse_str(elector.id()).is_ok());

    elector.stop().await;
    assert_eq!(elector.state().role, Role::Stopped);
    assert!(elector.leader().is_none());
}
