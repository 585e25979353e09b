// SPDX-License-Identifier: Apache-2.0
//! Per-participant engine facade.
//!
//! One [`SyncEngine`] runs inside each participant process. Local
//! manipulation (drag begin/move/release) mutates the local view
//! synchronously and propagates through the store; remote changes arrive on
//! the subscription pump and are folded into the view with echo suppression
//! and per-piece sequence ordering. The rendering layer consumes
//! [`SyncEngine::piece_list`] and the [`SyncEvent`] stream; it never touches
//! the store directly.

use crate::locks::{LockManager, LockOutcome, ReleaseOutcome};
use crate::pieces::{DropOutcome, PieceSync};
use crate::presence::PresenceManager;
use crate::progress::{placement_points, ProgressCoordinator};
use crate::session::{create_session, SessionControl};
use crate::{from_json, SyncConfig, SyncError, SyncEvent};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tessel_proto::{
    paths, ParticipantId, ParticipantRecord, PieceId, PieceRecord, ProgressRecord, PuzzleSpec,
    SessionId, SessionRecord, SessionState, Transform,
};
use tessel_store::{SharedStore, StoreError, Subscription};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const EVENT_CAPACITY: usize = 256;

/// Connectivity to the shared substrate as observed by this engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Normal operation.
    Connected,
    /// A transactional write exhausted retries; state may lag briefly.
    Degraded,
    /// The substrate is unreachable; piece interaction is blocked until an
    /// operation succeeds again.
    Reconnecting,
}

/// Rendering-facing snapshot of one piece.
#[derive(Debug, Clone, PartialEq)]
pub struct PieceView {
    /// Piece id.
    pub piece_id: PieceId,
    /// Correct final transform.
    pub target: Transform,
    /// Current transform.
    pub current: Transform,
    /// Whether the piece is placed.
    pub is_placed: bool,
    /// Current lock holder, if any.
    pub lock_owner: Option<ParticipantId>,
}

struct ViewState {
    session: Option<SessionRecord>,
    progress: Option<ProgressRecord>,
    pieces: BTreeMap<PieceId, PieceRecord>,
    participants: BTreeMap<ParticipantId, ParticipantRecord>,
    combo_count: u32,
    last_placement_ms: Option<u64>,
    drag_started_ms: HashMap<PieceId, u64>,
    connection: ConnectionState,
    completion_seen: bool,
    // Latest caller-supplied timestamp; the pump borrows it when it has to
    // race the terminal transition on a remotely observed threshold.
    clock_ms: u64,
}

impl ViewState {
    fn new(now_ms: u64) -> Self {
        Self {
            session: None,
            progress: None,
            pieces: BTreeMap::new(),
            participants: BTreeMap::new(),
            combo_count: 0,
            last_placement_ms: None,
            drag_started_ms: HashMap::new(),
            connection: ConnectionState::Connected,
            completion_seen: false,
            clock_ms: now_ms,
        }
    }
}

/// The synchronization core for one participant in one session.
pub struct SyncEngine {
    store: Arc<dyn SharedStore>,
    session_id: SessionId,
    me: ParticipantId,
    cfg: SyncConfig,
    puzzle: PuzzleSpec,
    locks: LockManager,
    pieces: PieceSync,
    progress: ProgressCoordinator,
    presence: PresenceManager,
    control: SessionControl,
    view: Arc<Mutex<ViewState>>,
    events: broadcast::Sender<SyncEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Create a new session on the store (host path) and join it.
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        store: Arc<dyn SharedStore>,
        session_id: SessionId,
        host: ParticipantId,
        display_name: &str,
        puzzle: PuzzleSpec,
        cfg: SyncConfig,
        now_ms: u64,
        scramble_seed: u64,
    ) -> Result<Self, SyncError> {
        create_session(
            store.as_ref(),
            &session_id,
            &host,
            &puzzle,
            now_ms,
            scramble_seed,
        )
        .await?;
        Self::attach(store, session_id, host, display_name, true, cfg, now_ms).await
    }

    /// Join an existing session as a non-host participant.
    pub async fn join(
        store: Arc<dyn SharedStore>,
        session_id: SessionId,
        me: ParticipantId,
        display_name: &str,
        cfg: SyncConfig,
        now_ms: u64,
    ) -> Result<Self, SyncError> {
        Self::attach(store, session_id, me, display_name, false, cfg, now_ms).await
    }

    async fn attach(
        store: Arc<dyn SharedStore>,
        session_id: SessionId,
        me: ParticipantId,
        display_name: &str,
        is_host: bool,
        cfg: SyncConfig,
        now_ms: u64,
    ) -> Result<Self, SyncError> {
        let puzzle_path = paths::puzzle(&session_id);
        let versioned = store
            .read(&puzzle_path)
            .await?
            .ok_or_else(|| SyncError::UnknownSession(session_id.to_string()))?;
        let puzzle: PuzzleSpec = from_json(&puzzle_path, &versioned.value)?;

        let locks = LockManager::new(Arc::clone(&store), session_id.clone(), cfg.clone());
        let pieces = PieceSync::new(Arc::clone(&store), session_id.clone(), cfg.clone());
        let progress = ProgressCoordinator::new(Arc::clone(&store), session_id.clone(), cfg.clone());
        let presence = PresenceManager::new(Arc::clone(&store), session_id.clone(), cfg.clone());
        let control = SessionControl::new(Arc::clone(&store), session_id.clone(), cfg.clone());

        presence
            .join(&ParticipantRecord::joined(
                me.clone(),
                display_name,
                is_host,
                now_ms,
            ))
            .await?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let view = Arc::new(Mutex::new(ViewState::new(now_ms)));

        // Subscribe first, then seed: replayed events are deduplicated by
        // the per-piece sequence ordering, so the overlap is harmless.
        let subscription = store.subscribe(&paths::session(&session_id)).await?;
        let snapshot = store.read_tree(&paths::session(&session_id)).await?;
        {
            let mut guard = view.lock().unwrap_or_else(|e| e.into_inner());
            for (path, versioned) in snapshot {
                apply_change(
                    &mut guard,
                    &events,
                    &me,
                    &session_id,
                    &path,
                    Some(versioned.value),
                );
            }
        }

        let engine = Self {
            store,
            session_id,
            me,
            cfg,
            puzzle,
            locks,
            pieces,
            progress,
            presence,
            control,
            view,
            events,
            pump: Mutex::new(None),
        };
        engine.spawn_pump(subscription);
        Ok(engine)
    }

    fn spawn_pump(&self, mut subscription: Subscription) {
        let view = Arc::clone(&self.view);
        let events = self.events.clone();
        let me = self.me.clone();
        let session_id = self.session_id.clone();
        let progress = ProgressCoordinator::new(
            Arc::clone(&self.store),
            session_id.clone(),
            self.cfg.clone(),
        );
        let handle = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let due = {
                    let mut guard = view.lock().unwrap_or_else(|e| e.into_inner());
                    apply_change(&mut guard, &events, &me, &session_id, &event.path, event.value);
                    completion_due(&guard, &me)
                };
                // Every observer of the threshold crossing must race the
                // terminal transition, or a session whose final placer
                // vanished stays at 100% forever. Losing the race is the
                // common case and a no-op.
                if let Some((stats, now_ms)) = due {
                    race_completion(&progress, &view, &events, &stats, now_ms).await;
                }
            }
            debug!(session = %session_id, "store subscription closed");
        });
        *self.pump.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    fn view(&self) -> MutexGuard<'_, ViewState> {
        self.view.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    /// Note the outcome of a store-touching operation, tracking the
    /// connected/reconnecting transition both ways.
    fn observe_connectivity<T>(&self, result: Result<T, SyncError>) -> Result<T, SyncError> {
        match &result {
            Err(SyncError::Store(StoreError::Unavailable)) => {
                let mut view = self.view();
                if view.connection != ConnectionState::Reconnecting {
                    view.connection = ConnectionState::Reconnecting;
                    drop(view);
                    warn!(session = %self.session_id, "store unreachable; blocking interaction");
                    self.emit(SyncEvent::ConnectionChanged(ConnectionState::Reconnecting));
                }
            }
            Ok(_) => {
                let mut view = self.view();
                if view.connection != ConnectionState::Connected {
                    view.connection = ConnectionState::Connected;
                    drop(view);
                    self.emit(SyncEvent::ConnectionChanged(ConnectionState::Connected));
                }
            }
            Err(_) => {}
        }
        result
    }

    /// A transactional write ran out of retries: flag the degraded state
    /// (cleared by the next successful operation) and tell the UI.
    fn mark_degraded(&self) {
        let mut view = self.view();
        if view.connection == ConnectionState::Connected {
            view.connection = ConnectionState::Degraded;
            drop(view);
            self.emit(SyncEvent::ConnectionChanged(ConnectionState::Degraded));
        }
        self.emit(SyncEvent::SyncDegraded);
    }

    /// Remember the caller's clock so the pump can timestamp a completion
    /// it has to claim on the caller's behalf.
    fn note_time(&self, now_ms: u64) {
        let mut view = self.view();
        view.clock_ms = view.clock_ms.max(now_ms);
    }

    // ── Read surface ────────────────────────────────────────────────

    /// Subscribe to engine events.
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// This participant's id.
    pub fn participant_id(&self) -> &ParticipantId {
        &self.me
    }

    /// The immutable puzzle description.
    pub fn puzzle(&self) -> &PuzzleSpec {
        &self.puzzle
    }

    /// Live snapshot of every piece for the rendering layer.
    pub fn piece_list(&self) -> Vec<PieceView> {
        self.view()
            .pieces
            .values()
            .map(|rec| PieceView {
                piece_id: rec.piece_id,
                target: rec.target,
                current: rec.current,
                is_placed: rec.is_placed,
                lock_owner: rec.lock_owner.clone(),
            })
            .collect()
    }

    /// Current session state, if the session still exists.
    pub fn session_state(&self) -> Option<SessionState> {
        self.view().session.as_ref().map(|s| s.state)
    }

    /// Current session record snapshot, if the session still exists.
    pub fn session(&self) -> Option<SessionRecord> {
        self.view().session.clone()
    }

    /// Current global progress.
    pub fn progress(&self) -> Option<ProgressRecord> {
        self.view().progress
    }

    /// Current participant roster snapshot.
    pub fn participants(&self) -> Vec<ParticipantRecord> {
        self.view().participants.values().cloned().collect()
    }

    /// Current substrate connectivity.
    pub fn connection_state(&self) -> ConnectionState {
        self.view().connection
    }

    // ── Drag gestures ───────────────────────────────────────────────

    /// Ask for exclusive rights on a piece to begin a drag.
    ///
    /// `Ok(false)` covers every silent denial: someone else holds the lock,
    /// the piece is placed, the store is too contended, or the substrate is
    /// unreachable. A lost race is not an error surfaced to the user.
    pub async fn begin_drag(&self, piece: PieceId, now_ms: u64) -> Result<bool, SyncError> {
        self.note_time(now_ms);
        {
            let view = self.view();
            if view.connection == ConnectionState::Reconnecting {
                return Ok(false);
            }
            match view.session.as_ref().map(|s| s.state) {
                Some(SessionState::Playing) => {}
                Some(state) => return Err(SyncError::NotPlaying(state)),
                None => return Err(SyncError::UnknownSession(self.session_id.to_string())),
            }
        }

        let outcome = self
            .observe_connectivity(self.locks.acquire(piece, &self.me, now_ms).await)?;
        match outcome {
            LockOutcome::Granted => {
                let mut view = self.view();
                if let Some(rec) = view.pieces.get_mut(&piece) {
                    rec.lock_owner = Some(self.me.clone());
                    rec.lock_ms = now_ms;
                    rec.seq += 1;
                }
                view.drag_started_ms.insert(piece, now_ms);
                Ok(true)
            }
            LockOutcome::Denied => Ok(false),
            LockOutcome::Busy => {
                self.mark_degraded();
                Ok(false)
            }
        }
    }

    /// Stream an in-progress drag transform.
    ///
    /// No-op unless this participant holds the lock in the local view. The
    /// local view is updated synchronously; the store write is
    /// fire-and-forget.
    pub async fn drag_move(
        &self,
        piece: PieceId,
        to: Transform,
        now_ms: u64,
    ) -> Result<(), SyncError> {
        self.note_time(now_ms);
        let seq = {
            let mut view = self.view();
            let Some(rec) = view.pieces.get_mut(&piece) else {
                return Err(SyncError::UnknownPiece(piece));
            };
            if rec.lock_owner.as_ref() != Some(&self.me) {
                return Ok(());
            }
            rec.current = to;
            rec.seq += 1;
            rec.lock_ms = now_ms;
            rec.seq
        };
        self.observe_connectivity(self.pieces.stream_move(piece, to, seq, now_ms).await)
    }

    /// Drop the piece: run placement validation, release the lock, and on a
    /// correct placement update scoring, progress, and — when this drop was
    /// the last one — race the completion transition.
    pub async fn drag_release(&self, piece: PieceId, now_ms: u64) -> Result<DropOutcome, SyncError> {
        self.note_time(now_ms);
        let (dropped_at, move_duration_ms) = {
            let mut view = self.view();
            let Some(rec) = view.pieces.get(&piece) else {
                return Err(SyncError::UnknownPiece(piece));
            };
            let dropped_at = rec.current;
            let started = view.drag_started_ms.remove(&piece);
            (dropped_at, started.map_or(0, |s| now_ms.saturating_sub(s)))
        };

        let outcome = self.observe_connectivity(
            self.pieces
                .release(piece, &self.me, dropped_at, self.puzzle.difficulty, now_ms)
                .await,
        )?;

        match outcome {
            DropOutcome::Placed => {
                self.apply_local_placement(piece, now_ms);
                self.score_placement(piece, move_duration_ms, now_ms).await?;
            }
            DropOutcome::Left => {
                {
                    let mut view = self.view();
                    if let Some(rec) = view.pieces.get_mut(&piece) {
                        rec.lock_owner = None;
                        rec.seq += 1;
                    }
                }
                self.bump_move_counter(false, 0).await?;
            }
            DropOutcome::NotOwner => {
                // Lock was evicted or stolen while we dragged; reconcile the
                // local view with that reality.
                let mut view = self.view();
                if let Some(rec) = view.pieces.get_mut(&piece) {
                    if rec.lock_owner.as_ref() == Some(&self.me) {
                        rec.lock_owner = None;
                    }
                }
            }
            DropOutcome::Busy => {
                self.mark_degraded();
            }
        }
        Ok(outcome)
    }

    /// Abandon a drag without a meaningful drop position (e.g. the gesture
    /// ended outside a valid context). The lock is still released.
    pub async fn drag_cancel(&self, piece: PieceId, now_ms: u64) -> Result<(), SyncError> {
        self.note_time(now_ms);
        {
            let mut view = self.view();
            view.drag_started_ms.remove(&piece);
            if let Some(rec) = view.pieces.get_mut(&piece) {
                if rec.lock_owner.as_ref() == Some(&self.me) {
                    rec.lock_owner = None;
                    rec.seq += 1;
                }
            }
        }
        let result = self.locks.release(piece, &self.me, now_ms).await;
        match self.observe_connectivity(result) {
            Ok(ReleaseOutcome::Released | ReleaseOutcome::NotOwner) => Ok(()),
            Ok(ReleaseOutcome::Busy) => {
                self.mark_degraded();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn apply_local_placement(&self, piece: PieceId, now_ms: u64) {
        let mut view = self.view();
        if let Some(rec) = view.pieces.get_mut(&piece) {
            rec.current = rec.target;
            rec.is_placed = true;
            rec.placed_by = Some(self.me.clone());
            rec.lock_owner = None;
            rec.seq += 1;
        }
        let chained = view
            .last_placement_ms
            .is_some_and(|prev| now_ms.saturating_sub(prev) <= self.cfg.combo_window_ms);
        view.combo_count = if chained { view.combo_count + 1 } else { 0 };
        view.last_placement_ms = Some(now_ms);
        drop(view);
        self.emit(SyncEvent::PiecePlaced {
            piece_id: piece,
            by: Some(self.me.clone()),
        });
    }

    async fn score_placement(
        &self,
        piece: PieceId,
        move_duration_ms: u64,
        now_ms: u64,
    ) -> Result<(), SyncError> {
        let combo = self.view().combo_count;
        let points = placement_points(move_duration_ms, combo, &self.cfg);
        self.bump_move_counter(true, points).await?;

        let epoch = {
            let view = self.view();
            view.session.as_ref().map_or(1, |s| s.epoch)
        };
        let updated = self
            .observe_connectivity(self.progress.record_placed(piece, epoch).await)
            .or_else(|e| match e {
                SyncError::Store(StoreError::Busy { .. }) => {
                    self.mark_degraded();
                    Ok(None)
                }
                other => Err(other),
            })?;

        if let Some(progress) = updated {
            {
                let mut view = self.view();
                view.progress = Some(progress);
            }
            self.emit(SyncEvent::ProgressChanged {
                completed: progress.completed_count,
                total: progress.total,
            });
            if progress.is_complete() {
                self.try_complete(now_ms).await?;
            }
        }
        Ok(())
    }

    async fn try_complete(&self, now_ms: u64) -> Result<(), SyncError> {
        let stats = {
            let view = self.view();
            view.participants.get(&self.me).cloned()
        };
        let Some(stats) = stats else {
            return Ok(());
        };
        let won = self
            .observe_connectivity(self.progress.complete_if_won(&stats, now_ms).await)?;
        if let Some(record) = won {
            let mut view = self.view();
            if let Some(session) = view.session.as_mut() {
                session.state = SessionState::Completed;
                session.completion = Some(record.clone());
            }
            let fresh = !view.completion_seen;
            view.completion_seen = true;
            drop(view);
            if fresh {
                self.emit(SyncEvent::SessionCompleted(record));
            }
        }
        Ok(())
    }

    async fn bump_move_counter(&self, accurate: bool, points: u64) -> Result<(), SyncError> {
        let (path, fields) = {
            let mut view = self.view();
            let Some(rec) = view.participants.get_mut(&self.me) else {
                return Ok(());
            };
            rec.moves += 1;
            if accurate {
                rec.accurate_drops += 1;
                rec.points += points;
            }
            let mut fields = serde_json::Map::new();
            fields.insert("moves".into(), serde_json::Value::from(rec.moves));
            fields.insert(
                "accurate_drops".into(),
                serde_json::Value::from(rec.accurate_drops),
            );
            fields.insert("points".into(), serde_json::Value::from(rec.points));
            (paths::participant(&self.session_id, &self.me), fields)
        };
        self.observe_connectivity(
            self.store
                .update(&path, fields)
                .await
                .map_err(SyncError::from),
        )
    }

    // ── Presence and maintenance ────────────────────────────────────

    /// Record a heartbeat for this participant.
    pub async fn heartbeat(&self, now_ms: u64) -> Result<(), SyncError> {
        self.note_time(now_ms);
        self.observe_connectivity(self.presence.heartbeat(&self.me, now_ms).await)
    }

    /// Flag heartbeat-silent participants offline and release their locks.
    pub async fn sweep_presence(&self, now_ms: u64) -> Result<Vec<ParticipantId>, SyncError> {
        self.note_time(now_ms);
        let lost = self
            .observe_connectivity(self.presence.sweep_offline(now_ms).await)?;
        for participant in &lost {
            let released = self.locks.release_all_for(participant, now_ms).await?;
            if !released.is_empty() {
                debug!(
                    participant = %participant,
                    pieces = released.len(),
                    "released locks of lost participant"
                );
            }
        }
        Ok(lost)
    }

    /// Force-release locks idle past the TTL (any observer may run this).
    pub async fn evict_stale_locks(&self, now_ms: u64) -> Result<Vec<PieceId>, SyncError> {
        self.note_time(now_ms);
        self.observe_connectivity(self.locks.evict_stale(now_ms).await)
    }

    /// Reconcile the progress counter against an authoritative piece scan.
    ///
    /// When the repaired counter turns out to be full, the terminal
    /// transition is raced here too: the finisher may have vanished between
    /// its last increment and the completion attempt.
    pub async fn reconcile_progress(&self, now_ms: u64) -> Result<ProgressRecord, SyncError> {
        self.note_time(now_ms);
        let progress = self.observe_connectivity(self.progress.reconcile().await)?;
        let changed = {
            let mut view = self.view();
            let changed = view.progress != Some(progress);
            view.progress = Some(progress);
            changed
        };
        if changed {
            self.emit(SyncEvent::ProgressChanged {
                completed: progress.completed_count,
                total: progress.total,
            });
        }
        if progress.is_complete() {
            self.try_complete(now_ms).await?;
        }
        Ok(progress)
    }

    /// Best-effort ephemeral cursor broadcast.
    pub async fn broadcast_cursor(&self, x: f64, y: f64, now_ms: u64) -> Result<(), SyncError> {
        self.note_time(now_ms);
        self.observe_connectivity(self.presence.broadcast_cursor(&self.me, x, y, now_ms).await)
    }

    // ── Host controls ───────────────────────────────────────────────

    /// Host: start the session (`Waiting → Playing`).
    pub async fn start_session(&self, now_ms: u64) -> Result<(), SyncError> {
        self.note_time(now_ms);
        self.observe_connectivity(self.control.start(&self.me, now_ms).await)
    }

    /// Host: pause the session.
    pub async fn pause_session(&self) -> Result<(), SyncError> {
        self.observe_connectivity(self.control.pause(&self.me).await)
    }

    /// Host: resume a paused session.
    pub async fn resume_session(&self) -> Result<(), SyncError> {
        self.observe_connectivity(self.control.resume(&self.me).await)
    }

    /// Host: rescramble into a fresh epoch.
    pub async fn reset_session(&self, now_ms: u64, scramble_seed: u64) -> Result<u64, SyncError> {
        self.note_time(now_ms);
        let epoch = self
            .observe_connectivity(
                self.control
                    .reset(&self.me, &self.puzzle, now_ms, scramble_seed)
                    .await,
            )?;
        let mut view = self.view();
        view.combo_count = 0;
        view.last_placement_ms = None;
        view.drag_started_ms.clear();
        view.completion_seen = false;
        Ok(epoch)
    }

    /// Host: tear the session down for everyone.
    pub async fn end_session(&self) -> Result<(), SyncError> {
        self.observe_connectivity(self.control.end(&self.me).await)
    }

    /// Leave the session and close this engine's store handle, firing any
    /// registered disconnect cleanup.
    pub async fn shutdown(&self) -> Result<(), SyncError> {
        let _ = self.presence.leave(&self.me).await;
        if let Some(handle) = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        self.store.disconnect().await?;
        Ok(())
    }
}

/// Fold one store change into the local view, emitting events for the
/// transitions the rendering layer cares about.
fn apply_change(
    view: &mut ViewState,
    events: &broadcast::Sender<SyncEvent>,
    me: &ParticipantId,
    session_id: &SessionId,
    path: &str,
    value: Option<serde_json::Value>,
) {
    let root = paths::session(session_id);
    let Some(rest) = path.strip_prefix(&root) else {
        return;
    };
    let rel = rest.strip_prefix('/').unwrap_or("");

    if rel == "meta" {
        apply_meta(view, events, value);
    } else if rel == "progress" {
        apply_progress(view, events, value);
    } else if let Some(id) = rel.strip_prefix("pieces/") {
        if let Ok(piece) = id.parse::<PieceId>() {
            apply_piece(view, events, me, piece, value);
        }
    } else if let Some(id) = rel.strip_prefix("participants/") {
        apply_participant(view, events, me, &ParticipantId::new(id), value);
    }
    // `puzzle` is immutable and `cursors/*` are cosmetic; neither feeds the
    // view.
}

fn apply_meta(
    view: &mut ViewState,
    events: &broadcast::Sender<SyncEvent>,
    value: Option<serde_json::Value>,
) {
    let Some(value) = value else {
        view.session = None;
        return;
    };
    let Ok(meta) = serde_json::from_value::<SessionRecord>(value) else {
        return;
    };
    let old_epoch = view.session.as_ref().map(|s| s.epoch);
    if old_epoch.is_some() && old_epoch != Some(meta.epoch) {
        // New epoch: local combo/drag state belongs to the old board.
        view.combo_count = 0;
        view.last_placement_ms = None;
        view.drag_started_ms.clear();
        view.completion_seen = false;
    }
    if let Some(record) = &meta.completion {
        if !view.completion_seen {
            view.completion_seen = true;
            let _ = events.send(SyncEvent::SessionCompleted(record.clone()));
        }
    }
    view.session = Some(meta);
}

fn apply_progress(
    view: &mut ViewState,
    events: &broadcast::Sender<SyncEvent>,
    value: Option<serde_json::Value>,
) {
    let Some(value) = value else {
        view.progress = None;
        return;
    };
    let Ok(progress) = serde_json::from_value::<ProgressRecord>(value) else {
        return;
    };
    if view.progress != Some(progress) {
        let _ = events.send(SyncEvent::ProgressChanged {
            completed: progress.completed_count,
            total: progress.total,
        });
    }
    view.progress = Some(progress);
}

fn apply_piece(
    view: &mut ViewState,
    events: &broadcast::Sender<SyncEvent>,
    me: &ParticipantId,
    piece: PieceId,
    value: Option<serde_json::Value>,
) {
    let Some(value) = value else {
        view.pieces.remove(&piece);
        return;
    };
    let Ok(incoming) = serde_json::from_value::<PieceRecord>(value) else {
        return;
    };
    let newly_placed;
    match view.pieces.get(&piece) {
        Some(existing) => {
            // Echo suppression: while we hold the lock locally, our own view
            // is authoritative and remote frames (including our own echoes)
            // are ignored.
            if existing.lock_owner.as_ref() == Some(me) {
                return;
            }
            // Same-epoch frames must advance the sequence number;
            // out-of-order and duplicate frames are dropped.
            if incoming.epoch == existing.epoch && incoming.seq <= existing.seq {
                return;
            }
            newly_placed = incoming.is_placed && !existing.is_placed;
        }
        None => newly_placed = incoming.is_placed,
    }
    if newly_placed {
        let _ = events.send(SyncEvent::PiecePlaced {
            piece_id: piece,
            by: incoming.placed_by.clone(),
        });
    }
    view.pieces.insert(piece, incoming);
}

fn apply_participant(
    view: &mut ViewState,
    events: &broadcast::Sender<SyncEvent>,
    me: &ParticipantId,
    participant: &ParticipantId,
    value: Option<serde_json::Value>,
) {
    let Some(value) = value else {
        if view.participants.remove(participant).is_some() && participant != me {
            let _ = events.send(SyncEvent::ParticipantLeft(participant.clone()));
        }
        return;
    };
    let Ok(incoming) = serde_json::from_value::<ParticipantRecord>(value) else {
        return;
    };
    let was_online = view
        .participants
        .get(participant)
        .is_some_and(|p| p.online);
    if participant != me {
        if incoming.online && !was_online {
            let _ = events.send(SyncEvent::ParticipantJoined(participant.clone()));
        } else if !incoming.online && was_online {
            let _ = events.send(SyncEvent::ParticipantLeft(participant.clone()));
        }
    }
    view.participants.insert(participant.clone(), incoming);
}

/// Does the folded view call for a completion attempt? Full progress while
/// the session still says `Playing`, in the same epoch (a reset bumps both
/// records; a stale counter must never finish a fresh board). Returns the
/// stats and clock the race needs.
fn completion_due(view: &ViewState, me: &ParticipantId) -> Option<(ParticipantRecord, u64)> {
    if view.completion_seen {
        return None;
    }
    let progress = view.progress?;
    let session = view.session.as_ref()?;
    if !progress.is_complete()
        || session.state != SessionState::Playing
        || progress.epoch != session.epoch
    {
        return None;
    }
    let stats = view.participants.get(me)?.clone();
    Some((stats, view.clock_ms))
}

/// Race the `Playing → Completed` CAS and fold a win into the view. Losers
/// learn the outcome from the winner's meta event; errors here are retried
/// on the next observation of the threshold.
async fn race_completion(
    progress: &ProgressCoordinator,
    view: &Mutex<ViewState>,
    events: &broadcast::Sender<SyncEvent>,
    stats: &ParticipantRecord,
    now_ms: u64,
) {
    match progress.complete_if_won(stats, now_ms).await {
        Ok(Some(record)) => {
            let mut guard = view.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(session) = guard.session.as_mut() {
                session.state = SessionState::Completed;
                session.completion = Some(record.clone());
            }
            let fresh = !guard.completion_seen;
            guard.completion_seen = true;
            drop(guard);
            if fresh {
                let _ = events.send(SyncEvent::SessionCompleted(record));
            }
        }
        Ok(None) => {}
        Err(e) => debug!(error = %e, "completion attempt failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_proto::Difficulty;
    use tessel_store::MemoryStore;

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

    async fn host_engine(store: &MemoryStore) -> SyncEngine {
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
        .unwrap()
    }

    #[tokio::test]
    async fn interaction_is_gated_on_playing_state() {
        let store = MemoryStore::new();
        let engine = host_engine(&store).await;

        assert!(matches!(
            engine.begin_drag(0, 2_000).await,
            Err(SyncError::NotPlaying(SessionState::Waiting))
        ));

        engine.start_session(2_000).await.unwrap();
        assert!(engine.begin_drag(0, 2_100).await.unwrap());

        engine.drag_cancel(0, 2_200).await.unwrap();
        engine.pause_session().await.unwrap();
        assert!(matches!(
            engine.begin_drag(0, 2_300).await,
            Err(SyncError::NotPlaying(SessionState::Paused))
        ));
    }

    #[tokio::test]
    async fn unreachable_store_blocks_interaction_then_recovers() {
        let store = MemoryStore::new();
        let engine = host_engine(&store).await;
        engine.start_session(2_000).await.unwrap();

        store.set_unavailable(true).await;
        assert!(matches!(
            engine.heartbeat(3_000).await,
            Err(SyncError::Store(StoreError::Unavailable))
        ));
        assert_eq!(engine.connection_state(), ConnectionState::Reconnecting);
        // Blocked, silently.
        assert!(!engine.begin_drag(0, 3_100).await.unwrap());

        store.set_unavailable(false).await;
        engine.heartbeat(4_000).await.unwrap();
        assert_eq!(engine.connection_state(), ConnectionState::Connected);
        assert!(engine.begin_drag(0, 4_100).await.unwrap());
    }

    #[test]
    fn stale_and_echoed_piece_frames_do_not_disturb_the_view() {
        let me = ParticipantId::new("host");
        let sid = SessionId::new("s1");
        let path = paths::piece(&sid, 7);
        let (events, mut rx) = broadcast::channel(8);
        let mut view = ViewState::new(0);

        let mut rec = PieceRecord {
            piece_id: 7,
            target: Transform::at(10.0, 10.0),
            current: Transform::at(0.0, 0.0),
            is_placed: false,
            placed_by: None,
            lock_owner: None,
            lock_ms: 0,
            seq: 5,
            epoch: 1,
        };
        apply_change(&mut view, &events, &me, &sid, &path, crate::to_json(&rec));
        assert_eq!(view.pieces[&7].seq, 5);

        // Duplicate/out-of-order frame in the same epoch: dropped.
        rec.current = Transform::at(99.0, 99.0);
        apply_change(&mut view, &events, &me, &sid, &path, crate::to_json(&rec));
        assert_eq!(view.pieces[&7].current, Transform::at(0.0, 0.0));

        // While we hold the lock locally, even newer frames are echoes.
        view.pieces.get_mut(&7).unwrap().lock_owner = Some(me.clone());
        rec.seq = 9;
        apply_change(&mut view, &events, &me, &sid, &path, crate::to_json(&rec));
        assert_eq!(view.pieces[&7].current, Transform::at(0.0, 0.0));

        // Lock released: the next advancing frame lands and a placement
        // flip fires exactly one event.
        view.pieces.get_mut(&7).unwrap().lock_owner = None;
        rec.seq = 6;
        rec.current = rec.target;
        rec.is_placed = true;
        rec.placed_by = Some(ParticipantId::new("guest"));
        apply_change(&mut view, &events, &me, &sid, &path, crate::to_json(&rec));
        assert!(view.pieces[&7].is_placed);
        assert!(matches!(
            rx.try_recv(),
            Ok(SyncEvent::PiecePlaced { piece_id: 7, by: Some(p) }) if p.as_str() == "guest"
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn drag_cancel_always_releases_the_lock() {
        let store = MemoryStore::new();
        let engine = host_engine(&store).await;
        engine.start_session(2_000).await.unwrap();

        assert!(engine.begin_drag(3, 2_100).await.unwrap());
        engine.drag_cancel(3, 2_200).await.unwrap();

        let rec = store
            .client()
            .read(&paths::piece(&SessionId::new("s1"), 3))
            .await
            .unwrap()
            .unwrap();
        let rec: PieceRecord = serde_json::from_value(rec.value).unwrap();
        assert!(rec.lock_owner.is_none());
    }
}
