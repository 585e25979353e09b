// SPDX-License-Identifier: Apache-2.0
//! End-to-end engine scenarios over the in-memory substrate: two engines,
//! separate store connections, coordination only through writes and the
//! subscription pump.

use std::sync::Arc;
use std::time::Duration;
use tessel_proto::{
    paths, Difficulty, ParticipantId, PieceId, PieceRecord, ProgressRecord, PuzzleSpec, SessionId,
    SessionState,
};
use tessel_store::{MemoryStore, SharedStore};
use tessel_sync::{SyncConfig, SyncEngine, SyncEvent};
use tokio::sync::broadcast;
use tokio::time::timeout;

fn puzzle() -> PuzzleSpec {
    PuzzleSpec {
        id: "p".into(),
        image_url: "mem://img".into(),
        image_width: 300,
        image_height: 200,
        cols: 3,
        rows: 2,
        difficulty: Difficulty::Easy,
    }
}

async fn host(store: &MemoryStore) -> SyncEngine {
    SyncEngine::create(
        Arc::new(store.client()),
        SessionId::new("s1"),
        ParticipantId::new("host"),
        "Host",
        puzzle(),
        SyncConfig::default(),
        1_000,
        42,
    )
    .await
    .expect("create session")
}

async fn guest(store: &MemoryStore, name: &str, now_ms: u64) -> SyncEngine {
    SyncEngine::join(
        Arc::new(store.client()),
        SessionId::new("s1"),
        ParticipantId::new(name),
        name,
        SyncConfig::default(),
        now_ms,
    )
    .await
    .expect("join session")
}

/// Drag a piece onto its exact target and drop it.
async fn place(engine: &SyncEngine, piece: PieceId, now_ms: u64) {
    assert!(
        engine.begin_drag(piece, now_ms).await.unwrap(),
        "lock on piece {piece} should be grantable"
    );
    let target = engine.puzzle().target_transform(piece);
    engine.drag_move(piece, target, now_ms + 200).await.unwrap();
    let outcome = engine.drag_release(piece, now_ms + 400).await.unwrap();
    assert_eq!(outcome, tessel_sync::pieces::DropOutcome::Placed);
}

/// Poll until `cond` holds; remote changes reach an engine's view through
/// its subscription pump, which runs on its own task.
async fn wait_until<F: Fn() -> bool>(cond: F) {
    timeout(Duration::from_secs(1), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Await the next event matching `pred`, skipping unrelated ones.
async fn wait_for<F>(rx: &mut broadcast::Receiver<SyncEvent>, mut pred: F) -> SyncEvent
where
    F: FnMut(&SyncEvent) -> bool,
{
    loop {
        let event = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed");
        if pred(&event) {
            return event;
        }
    }
}

#[tokio::test]
async fn cooperative_session_completes_exactly_once() {
    let store = MemoryStore::new();
    let host = host(&store).await;
    let guest = guest(&store, "ada", 1_100).await;
    let mut host_events = host.events();
    let mut guest_events = guest.events();

    host.start_session(2_000).await.unwrap();
    wait_until(|| guest.session_state() == Some(SessionState::Playing)).await;

    // Host and guest alternate placements a few seconds apart.
    let mut now = 10_000u64;
    for piece in 0..6u32 {
        let engine = if piece % 2 == 0 { &host } else { &guest };
        place(engine, piece, now).await;
        now += 6_000;
    }

    // Both sides observe the terminal event, each exactly once.
    let host_done = wait_for(&mut host_events, |e| {
        matches!(e, SyncEvent::SessionCompleted(_))
    })
    .await;
    let guest_done = wait_for(&mut guest_events, |e| {
        matches!(e, SyncEvent::SessionCompleted(_))
    })
    .await;
    let (SyncEvent::SessionCompleted(a), SyncEvent::SessionCompleted(b)) =
        (host_done, guest_done)
    else {
        unreachable!()
    };
    assert_eq!(a, b, "both engines must see the same completion record");

    // No second terminal event is ever delivered.
    tokio::task::yield_now().await;
    while let Ok(event) = host_events.try_recv() {
        assert!(!matches!(event, SyncEvent::SessionCompleted(_)));
    }

    let progress = host.progress().unwrap();
    assert_eq!(progress.completed_count, 6);
    assert!((progress.percent() - 100.0).abs() < 1e-9);
    assert_eq!(host.session_state(), Some(SessionState::Completed));

    // Terminal state rejects further interaction.
    assert!(host.begin_drag(0, now).await.is_err());
}

#[tokio::test]
async fn remote_placements_reach_other_engines() {
    let store = MemoryStore::new();
    let host = host(&store).await;
    let guest = guest(&store, "ada", 1_100).await;
    let mut host_events = host.events();

    host.start_session(2_000).await.unwrap();
    wait_until(|| guest.session_state() == Some(SessionState::Playing)).await;
    place(&guest, 3, 10_000).await;

    let event = wait_for(&mut host_events, |e| {
        matches!(e, SyncEvent::PiecePlaced { .. })
    })
    .await;
    let SyncEvent::PiecePlaced { piece_id, by } = event else {
        unreachable!()
    };
    assert_eq!(piece_id, 3);
    assert_eq!(by, Some(ParticipantId::new("ada")));

    let view = host
        .piece_list()
        .into_iter()
        .find(|p| p.piece_id == 3)
        .unwrap();
    assert!(view.is_placed);
    assert_eq!(view.current, host.puzzle().target_transform(3));
}

#[tokio::test]
async fn contended_piece_grants_one_engine_and_stale_locks_are_stolen() {
    let store = MemoryStore::new();
    let host = host(&store).await;
    let guest = guest(&store, "ada", 1_100).await;
    host.start_session(2_000).await.unwrap();
    wait_until(|| guest.session_state() == Some(SessionState::Playing)).await;

    assert!(host.begin_drag(0, 3_000).await.unwrap());
    // Live lock: denied, silently.
    assert!(!guest.begin_drag(0, 4_000).await.unwrap());

    // The host goes silent; once the idle TTL passes the guest steals the
    // lock directly on acquisition.
    let ttl = SyncConfig::default().lock_ttl_ms;
    assert!(!guest.begin_drag(0, 3_000 + ttl).await.unwrap());
    assert!(guest.begin_drag(0, 3_001 + ttl).await.unwrap());

    // The original holder's release is now a no-op.
    let outcome = host.drag_release(0, 3_002 + ttl).await.unwrap();
    assert_eq!(outcome, tessel_sync::pieces::DropOutcome::NotOwner);
}

#[tokio::test]
async fn presence_sweep_releases_locks_of_lost_participants() {
    let store = MemoryStore::new();
    let host = host(&store).await;
    let guest = guest(&store, "ada", 1_100).await;
    host.start_session(2_000).await.unwrap();
    wait_until(|| guest.session_state() == Some(SessionState::Playing)).await;

    assert!(guest.begin_drag(2, 3_000).await.unwrap());

    // Heartbeat silence past the offline threshold.
    let lost = host.sweep_presence(60_000).await.unwrap();
    assert_eq!(lost, vec![ParticipantId::new("ada")]);

    // The swept participant's lock is gone; the host can take the piece.
    assert!(host.begin_drag(2, 60_100).await.unwrap());
}

#[tokio::test]
async fn placement_points_accumulate_with_speed_and_combo() {
    let store = MemoryStore::new();
    let host = host(&store).await;
    host.start_session(2_000).await.unwrap();

    // Fast first placement: base 100 + speed 25.
    place(&host, 0, 10_000).await;
    // Second placement 600 ms later chains a combo: 100 + 25 + 10.
    place(&host, 1, 11_000).await;

    let me = host
        .participants()
        .into_iter()
        .find(|p| p.participant_id == ParticipantId::new("host"))
        .unwrap();
    assert_eq!(me.moves, 2);
    assert_eq!(me.accurate_drops, 2);
    assert_eq!(me.points, 260);
}

#[tokio::test]
async fn reset_reopens_placed_pieces_in_a_new_epoch() {
    let store = MemoryStore::new();
    let host = host(&store).await;
    host.start_session(2_000).await.unwrap();
    place(&host, 0, 10_000).await;
    assert_eq!(host.progress().unwrap().completed_count, 1);

    let epoch = host.reset_session(20_000, 77).await.unwrap();
    assert_eq!(epoch, 2);

    // Wait for the pump to fold the new epoch into the view.
    wait_until(|| host.session().map(|s| s.epoch) == Some(2)).await;
    wait_until(|| {
        host.piece_list()
            .iter()
            .find(|p| p.piece_id == 0)
            .is_some_and(|p| !p.is_placed)
    })
    .await;
    wait_until(|| host.progress().is_some_and(|p| p.epoch == 2)).await;

    assert_eq!(host.progress().unwrap().completed_count, 0);
    // The same piece can be placed again in the new epoch.
    place(&host, 0, 30_000).await;
    assert_eq!(host.progress().unwrap().completed_count, 1);
}

/// Mark every piece placed by `who` directly on the store, as if a
/// participant finished the board and then vanished before anyone could
/// react.
async fn seed_board_placed(store: &MemoryStore, who: &ParticipantId) {
    let client = store.client();
    for (path, versioned) in client
        .read_tree(&paths::pieces(&SessionId::new("s1")))
        .await
        .unwrap()
    {
        let mut rec: PieceRecord = serde_json::from_value(versioned.value).unwrap();
        rec.current = rec.target;
        rec.is_placed = true;
        rec.placed_by = Some(who.clone());
        rec.seq += 1;
        client
            .write(&path, serde_json::to_value(&rec).unwrap())
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn reconcile_completes_a_board_finished_by_a_vanished_participant() {
    let store = MemoryStore::new();
    let host = host(&store).await;
    let mut host_events = host.events();
    host.start_session(2_000).await.unwrap();
    wait_until(|| host.session_state() == Some(SessionState::Playing)).await;

    // All six pieces are down, but the finisher crashed before its last
    // increment landed: the counter is stuck one short.
    seed_board_placed(&store, &ParticipantId::new("ghost")).await;
    let drifted = ProgressRecord {
        completed_count: 5,
        total: 6,
        epoch: 1,
    };
    store
        .client()
        .write(
            &paths::progress(&SessionId::new("s1")),
            serde_json::to_value(drifted).unwrap(),
        )
        .await
        .unwrap();

    // The repair both fixes the counter and claims the terminal transition.
    let repaired = host.reconcile_progress(40_000).await.unwrap();
    assert_eq!(repaired.completed_count, 6);
    assert!(repaired.is_complete());

    wait_until(|| host.session_state() == Some(SessionState::Completed)).await;
    wait_for(&mut host_events, |e| {
        matches!(e, SyncEvent::SessionCompleted(_))
    })
    .await;
    tokio::task::yield_now().await;
    while let Ok(event) = host_events.try_recv() {
        assert!(!matches!(event, SyncEvent::SessionCompleted(_)));
    }
}

#[tokio::test]
async fn observed_threshold_completes_without_a_local_placement() {
    let store = MemoryStore::new();
    let host = host(&store).await;
    let guest = guest(&store, "ada", 1_100).await;
    let mut host_events = host.events();
    let mut guest_events = guest.events();
    host.start_session(2_000).await.unwrap();
    wait_until(|| guest.session_state() == Some(SessionState::Playing)).await;

    // The finisher's last increment did land, but it vanished before
    // attempting the transition. Neither surviving engine placed anything;
    // both must still react to the full counter arriving on their pumps.
    seed_board_placed(&store, &ParticipantId::new("ghost")).await;
    let full = ProgressRecord {
        completed_count: 6,
        total: 6,
        epoch: 1,
    };
    store
        .client()
        .write(
            &paths::progress(&SessionId::new("s1")),
            serde_json::to_value(full).unwrap(),
        )
        .await
        .unwrap();

    wait_until(|| host.session_state() == Some(SessionState::Completed)).await;
    wait_until(|| guest.session_state() == Some(SessionState::Completed)).await;

    let host_done = wait_for(&mut host_events, |e| {
        matches!(e, SyncEvent::SessionCompleted(_))
    })
    .await;
    let guest_done = wait_for(&mut guest_events, |e| {
        matches!(e, SyncEvent::SessionCompleted(_))
    })
    .await;
    let (SyncEvent::SessionCompleted(a), SyncEvent::SessionCompleted(b)) =
        (host_done, guest_done)
    else {
        unreachable!()
    };
    assert_eq!(a, b, "one winner; everyone sees its record");

    tokio::task::yield_now().await;
    while let Ok(event) = host_events.try_recv() {
        assert!(!matches!(event, SyncEvent::SessionCompleted(_)));
    }
    while let Ok(event) = guest_events.try_recv() {
        assert!(!matches!(event, SyncEvent::SessionCompleted(_)));
    }
}

#[tokio::test]
async fn shutdown_fires_disconnect_cleanup_for_presence() {
    let store = MemoryStore::new();
    let host = host(&store).await;
    let guest = guest(&store, "ada", 1_100).await;
    host.start_session(2_000).await.unwrap();

    guest.shutdown().await.unwrap();

    // Disconnect cleanup flipped the online flag without deleting the record.
    let client = store.client();
    let rec = client
        .read(&tessel_proto::paths::participant(
            &SessionId::new("s1"),
            &ParticipantId::new("ada"),
        ))
        .await
        .unwrap()
        .unwrap();
    let rec: tessel_proto::ParticipantRecord = serde_json::from_value(rec.value).unwrap();
    assert!(!rec.online);
}
