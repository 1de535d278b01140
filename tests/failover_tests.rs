//! Failover tests: heartbeat expiry, sweep-driven reclaim, reclaim race
//! safety, and terminal finality.

mod test_harness;

use std::time::Duration;

use drover::store::{HeartbeatStore, UnitPatch, UnitStore};
use drover::unit::{RunnerId, Unit, UnitRequest, UnitStatus};
use test_harness::{
    TestFleet, assert_eventually, start_delegate_server, test_runner_config, wait_for,
};

fn stored_unit(id: &str, url: &str) -> Unit {
    Unit::received(
        id.to_string(),
        UnitRequest {
            url: url.to_string(),
            body: serde_json::json!({"x": 1}),
            tenant: "acme".to_string(),
            response_topic: None,
        },
    )
}

/// Seed the store with a unit claimed by a runner that is already dead:
/// heartbeat row present but aged far past any threshold.
async fn seed_dead_runner_with_unit(fleet: &TestFleet, unit_id: &str, url: &str) -> RunnerId {
    let dead = RunnerId::generate();
    fleet.heartbeats.create(dead).await.unwrap();
    fleet
        .heartbeats
        .force_expire(dead, chrono::Duration::seconds(60))
        .await;

    fleet.units.insert(&stored_unit(unit_id, url)).await.unwrap();
    fleet
        .units
        .update_fields(unit_id, UnitPatch::claim(dead))
        .await
        .unwrap();
    dead
}

/// Test 1: a unit claimed by a crashed runner is reclaimed by a survivor's
/// sweep and driven to a terminal state under the new owner.
#[tokio::test]
async fn dead_runners_unit_is_reclaimed_and_finished() {
    let server = start_delegate_server().await;
    let fleet = TestFleet::new();
    let dead = seed_dead_runner_with_unit(&fleet, "u2", &server.url("/ok")).await;

    let survivor = fleet.start_runner(test_runner_config()).await;

    let units = fleet.units.clone();
    assert_eventually(
        || async {
            matches!(
                units.get("u2").await.unwrap(),
                Some(unit) if unit.status == UnitStatus::Finished
            )
        },
        Duration::from_secs(5),
        "survivor should reclaim and finish the unit",
    )
    .await;

    let unit = fleet.units.get("u2").await.unwrap().unwrap();
    assert_eq!(
        unit.runner_id,
        Some(survivor.id),
        "terminal unit should carry the new owner"
    );
    assert!(
        fleet.heartbeats.last_heartbeat(dead).await.is_none(),
        "dead heartbeat row should be deleted"
    );
    assert_eq!(server.hit_count(), 1, "executed exactly once more");
}

/// Test 2: the sweep never touches terminal units, even when their owner
/// is dead.
#[tokio::test]
async fn sweep_ignores_terminal_units() {
    let fleet = TestFleet::new();
    let dead = RunnerId::generate();
    fleet.heartbeats.create(dead).await.unwrap();
    fleet
        .heartbeats
        .force_expire(dead, chrono::Duration::seconds(60))
        .await;

    fleet
        .units
        .insert(&stored_unit("done", "http://unused.invalid/"))
        .await
        .unwrap();
    fleet
        .units
        .update_fields("done", UnitPatch::claim(dead))
        .await
        .unwrap();
    fleet
        .units
        .update_fields(
            "done",
            UnitPatch::terminal(UnitStatus::Finished, serde_json::json!("ok")),
        )
        .await
        .unwrap();

    let _survivor = fleet.start_runner(test_runner_config()).await;

    // The sweep declares the dead runner dead...
    let heartbeats = fleet.heartbeats.clone();
    assert_eventually(
        || async { heartbeats.last_heartbeat(dead).await.is_none() },
        Duration::from_secs(5),
        "dead heartbeat should be swept",
    )
    .await;

    // ...but the finished unit is left exactly as it was.
    let unit = fleet.units.get("done").await.unwrap().unwrap();
    assert_eq!(unit.status, UnitStatus::Finished);
    assert_eq!(unit.runner_id, Some(dead));
    assert_eq!(unit.result, Some(serde_json::json!("ok")));
}

/// Test 3: two survivors sweeping the same dead runner concurrently
/// produce exactly one reclaim and exactly one re-execution.
#[tokio::test]
async fn concurrent_sweeps_reclaim_exactly_once() {
    let server = start_delegate_server().await;
    let fleet = TestFleet::new();
    seed_dead_runner_with_unit(&fleet, "u1", &server.url("/ok")).await;

    let _survivor_a = fleet.start_runner(test_runner_config()).await;
    let _survivor_b = fleet.start_runner(test_runner_config()).await;

    let units = fleet.units.clone();
    assert_eventually(
        || async {
            matches!(
                units.get("u1").await.unwrap(),
                Some(unit) if unit.status == UnitStatus::Finished
            )
        },
        Duration::from_secs(5),
        "unit should be re-executed",
    )
    .await;

    // Let both survivors run a few more sweep cycles before counting.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        server.hit_count(),
        1,
        "exactly one of the racing sweeps may re-execute the unit"
    );
}

/// Test 4: a live runner's heartbeat is monotonically non-decreasing and
/// its row survives while the runner lives.
#[tokio::test]
async fn live_heartbeat_is_monotonic() {
    let fleet = TestFleet::new();
    let runner = fleet.start_runner(test_runner_config()).await;

    let mut previous = fleet
        .heartbeats
        .last_heartbeat(runner.id)
        .await
        .expect("heartbeat registered at startup");

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(120)).await;
        let current = fleet
            .heartbeats
            .last_heartbeat(runner.id)
            .await
            .expect("row persists while the runner lives");
        assert!(current >= previous, "heartbeat must never move backwards");
        previous = current;
    }
}

/// Test 5: a live owner's in-progress units are never reclaimed by peers.
#[tokio::test]
async fn live_owners_units_are_left_alone() {
    let fleet = TestFleet::new();
    let live = fleet.start_runner(test_runner_config()).await;
    let _peer = fleet.start_runner(test_runner_config()).await;

    // A unit mid-execution under the live runner.
    fleet
        .units
        .insert(&stored_unit("busy", "http://unused.invalid/"))
        .await
        .unwrap();
    fleet
        .units
        .update_fields("busy", UnitPatch::claim(live.id))
        .await
        .unwrap();

    // Give the peer several sweep cycles.
    tokio::time::sleep(Duration::from_millis(600)).await;

    let unit = fleet.units.get("busy").await.unwrap().unwrap();
    assert_eq!(unit.status, UnitStatus::InProgress);
    assert_eq!(unit.runner_id, Some(live.id));
    assert!(fleet.heartbeats.last_heartbeat(live.id).await.is_some());
}

/// Test 6: a crashed runner stops renewing, ages past the threshold, and a
/// survivor both finishes its unit and removes its heartbeat row.
#[tokio::test]
async fn crash_is_detected_via_stale_heartbeat() {
    let server = start_delegate_server().await;
    let fleet = TestFleet::new();

    let doomed = fleet.start_runner(test_runner_config()).await;
    doomed.crash();

    // The crashed runner still owns an unfinished unit.
    fleet
        .units
        .insert(&stored_unit("u9", &server.url("/ok")))
        .await
        .unwrap();
    fleet
        .units
        .update_fields("u9", UnitPatch::claim(doomed.id))
        .await
        .unwrap();

    let survivor = fleet.start_runner(test_runner_config()).await;

    // Expiry takes interval * multiplier of real time.
    let units = fleet.units.clone();
    assert_eventually(
        || async {
            matches!(
                units.get("u9").await.unwrap(),
                Some(unit) if unit.status == UnitStatus::Finished
            )
        },
        Duration::from_secs(10),
        "survivor should recover the crashed runner's unit",
    )
    .await;

    let unit = fleet.units.get("u9").await.unwrap().unwrap();
    assert_eq!(unit.runner_id, Some(survivor.id));

    // Deleted exactly once, coincident with its declared death.
    let heartbeats = fleet.heartbeats.clone();
    let doomed_id = doomed.id;
    assert!(
        wait_for(
            || async { heartbeats.last_heartbeat(doomed_id).await.is_none() },
            Duration::from_secs(5),
            Duration::from_millis(20),
        )
        .await,
        "crashed runner's heartbeat row should be gone"
    );
}
