// Analysis request and evaluation update types shared across the crate.

use std::sync::Arc;

/// Search limit for one analysis request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchLimit {
    /// Search to a fixed depth in plies.
    Depth(u32),
    /// Search for a fixed wall-clock time in milliseconds.
    MoveTime(u64),
}

/// One immutable analysis request. Created by the caller on each request and
/// superseded, never mutated, by the next one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Work {
    /// FEN of the initial position.
    pub initial_fen: String,
    /// Moves played from the initial position, in UCI notation.
    pub moves: Vec<String>,
    pub limit: SearchLimit,
    /// Number of principal variations to report.
    pub multi_pv: u32,
    /// Engine search threads.
    pub threads: u32,
    /// Engine hash table budget in megabytes.
    pub hash_mb: u32,
    /// Monotonically increasing per-caller request identifier.
    pub request_id: u64,
}

/// Engine score from the side to move's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Score {
    /// Signed centipawn value.
    Cp(i32),
    /// Mate in N moves; negative means getting mated.
    Mate(i32),
}

/// Decoded fields of one `info` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchInfo {
    pub depth: u32,
    pub seldepth: u32,
    /// 1-based index of the reported principal variation.
    pub multipv: u32,
    pub score: Score,
    pub nodes: u64,
    pub nps: u64,
    /// Best line as an ordered move sequence.
    pub pv: Vec<String>,
}

/// One decoded engine output event, forwarded to the listener and not
/// retained. Updates belonging to a superseded work never reach a listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalUpdate {
    /// Intermediate search progress.
    Progress { request_id: u64, info: SearchInfo },
    /// Search concluded; exactly one per completed work.
    Final {
        request_id: u64,
        best_move: String,
        ponder: Option<String>,
    },
}

impl EvalUpdate {
    /// Identifier of the work this update belongs to.
    pub fn request_id(&self) -> u64 {
        match self {
            EvalUpdate::Progress { request_id, .. } => *request_id,
            EvalUpdate::Final { request_id, .. } => *request_id,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, EvalUpdate::Final { .. })
    }
}

/// Receives every delivered evaluation update.
pub type UpdateListener = Arc<dyn Fn(EvalUpdate) + Send + Sync>;

/// Fired once if boot fails; the instance is terminally `Failed` afterwards.
pub type FailureListener = Arc<dyn Fn() + Send + Sync>;

/// Download progress as `(bytes_received, bytes_total)`; total is unknown
/// when the server sends no content length.
pub type ProgressListener = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Listener set registered at construction (rebound on pool reuse).
/// Update listeners run on the instance's reader task with no internal
/// locks held, so they may call back into the instance.
#[derive(Clone)]
pub struct Listeners {
    pub on_update: UpdateListener,
    pub on_failure: FailureListener,
    pub on_progress: ProgressListener,
}

impl Default for Listeners {
    fn default() -> Self {
        Self {
            on_update: Arc::new(|_| {}),
            on_failure: Arc::new(|| {}),
            on_progress: Arc::new(|_, _| {}),
        }
    }
}
