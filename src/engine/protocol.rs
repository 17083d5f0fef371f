// UCI protocol layer — encodes work into engine commands, decodes output
// lines into evaluation updates, and enforces single-active-work discipline.

use tracing::{debug, warn};

use crate::config::{DEFAULT_HASH_MB, DEFAULT_MULTI_PV, DEFAULT_THREADS};
use crate::work::{EvalUpdate, Score, SearchInfo, SearchLimit, Work};

/// Delivers one command line to the loaded execution context.
pub type SendCommand = Box<dyn Fn(&str) + Send + Sync>;

/// Closed decoding of one engine output line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineLine {
    Info(SearchInfo),
    BestMove {
        best: String,
        ponder: Option<String>,
    },
    Unrecognized,
}

/// Decode one line of engine output. Anything that doesn't form a complete
/// progress or final-result event is `Unrecognized` (e.g. `info string`,
/// `readyok`, currmove-only info lines).
pub fn decode_line(line: &str) -> EngineLine {
    let mut tokens = line.split_whitespace();
    match tokens.next() {
        Some("bestmove") => {
            let best = match tokens.next() {
                Some(m) => m.to_string(),
                None => return EngineLine::Unrecognized,
            };
            let ponder = match (tokens.next(), tokens.next()) {
                (Some("ponder"), Some(m)) => Some(m.to_string()),
                _ => None,
            };
            EngineLine::BestMove { best, ponder }
        }
        Some("info") => {
            let mut depth = 0u32;
            let mut seldepth = 0u32;
            let mut multipv = 1u32;
            let mut score: Option<Score> = None;
            let mut nodes = 0u64;
            let mut nps = 0u64;
            let mut pv: Vec<String> = Vec::new();

            while let Some(tok) = tokens.next() {
                match tok {
                    "depth" => {
                        if let Some(v) = tokens.next().and_then(|s| s.parse().ok()) {
                            depth = v;
                        }
                    }
                    "seldepth" => {
                        if let Some(v) = tokens.next().and_then(|s| s.parse().ok()) {
                            seldepth = v;
                        }
                    }
                    "multipv" => {
                        if let Some(v) = tokens.next().and_then(|s| s.parse().ok()) {
                            multipv = v;
                        }
                    }
                    "score" => match tokens.next() {
                        Some("cp") => {
                            score = tokens.next().and_then(|s| s.parse().ok()).map(Score::Cp);
                        }
                        Some("mate") => {
                            score = tokens.next().and_then(|s| s.parse().ok()).map(Score::Mate);
                        }
                        _ => {}
                    },
                    // Bound annotations follow the score value; skip them.
                    "lowerbound" | "upperbound" => {}
                    "nodes" => {
                        if let Some(v) = tokens.next().and_then(|s| s.parse().ok()) {
                            nodes = v;
                        }
                    }
                    "nps" => {
                        if let Some(v) = tokens.next().and_then(|s| s.parse().ok()) {
                            nps = v;
                        }
                    }
                    "pv" => {
                        pv = tokens.by_ref().map(|s| s.to_string()).collect();
                    }
                    _ => {}
                }
            }

            match score {
                Some(score) => EngineLine::Info(SearchInfo {
                    depth,
                    seldepth,
                    multipv,
                    score,
                    nodes,
                    nps,
                    pv,
                }),
                None => EngineLine::Unrecognized,
            }
        }
        _ => EngineLine::Unrecognized,
    }
}

/// UCI option values as last sent. A freshly booted engine starts with the
/// standard defaults; `setoption` is only sent on change.
struct SentOptions {
    threads: u32,
    hash_mb: u32,
    multi_pv: u32,
}

impl Default for SentOptions {
    fn default() -> Self {
        Self {
            threads: DEFAULT_THREADS,
            hash_mb: DEFAULT_HASH_MB,
            multi_pv: DEFAULT_MULTI_PV,
        }
    }
}

/// Protocol state for one engine instance.
///
/// At most one work is active at a time. Issuing a new work while one is
/// active sends `stop` and parks the replacement until the superseded
/// search's `bestmove` arrives; every event decoded in between (the
/// superseded bestmove included) is suppressed.
///
/// Decoded updates are returned, not delivered: the owner forwards them to
/// its listener after releasing the protocol lock, so a listener may call
/// back into the instance.
pub struct Protocol {
    send: Option<SendCommand>,
    work: Option<Work>,
    next_work: Option<Work>,
    stop_requested: bool,
    opts: SentOptions,
}

impl Protocol {
    pub fn new() -> Self {
        Self {
            send: None,
            work: None,
            next_work: None,
            stop_requested: false,
            opts: SentOptions::default(),
        }
    }

    /// Register the outbound command channel of the loaded context and flush
    /// any work queued before boot completed.
    pub fn connected(&mut self, send: SendCommand) {
        self.send = Some(send);
        self.swap_work();
    }

    /// Single entry point for starting or stopping analysis. `None` stops
    /// any active computation with no queued replacement. Calling again
    /// before the engine responds silently drops the intermediate work.
    pub fn compute(&mut self, work: Option<Work>) {
        if let Some(dropped) = self.next_work.take() {
            debug!("work {} dropped before it was started", dropped.request_id);
        }
        self.next_work = work;

        if self.work.is_some() {
            if !self.stop_requested {
                self.stop_requested = true;
                self.send_line("stop");
            }
        } else {
            self.swap_work();
        }
    }

    /// Whether a search is in flight, including the transient window between
    /// a stop request and the replacement start.
    pub fn is_computing(&self) -> bool {
        self.work.is_some() || self.next_work.is_some()
    }

    /// Feed one line of engine output. Returns the update to deliver, if
    /// the line formed one and it belongs to the active work; the caller
    /// invokes the listener with the protocol lock released.
    pub fn received(&mut self, line: &str) -> Option<EvalUpdate> {
        match decode_line(line) {
            EngineLine::Info(info) => {
                if self.stop_requested {
                    debug!("suppressing info for superseded work");
                    return None;
                }
                match &self.work {
                    Some(work) => Some(EvalUpdate::Progress {
                        request_id: work.request_id,
                        info,
                    }),
                    None => {
                        debug!("ignoring info line with no active work");
                        None
                    }
                }
            }
            EngineLine::BestMove { best, ponder } => {
                let update = match self.work.take() {
                    Some(work) => {
                        if self.stop_requested {
                            debug!(
                                "suppressing bestmove for superseded work {}",
                                work.request_id
                            );
                            None
                        } else {
                            Some(EvalUpdate::Final {
                                request_id: work.request_id,
                                best_move: best,
                                ponder,
                            })
                        }
                    }
                    None => {
                        warn!("unexpected bestmove with no active work: {}", line);
                        None
                    }
                };
                self.stop_requested = false;
                self.swap_work();
                update
            }
            EngineLine::Unrecognized => {
                debug!("ignoring unrecognized engine line: {}", line);
                None
            }
        }
    }

    /// Promote the parked work to active and send its commands, if the
    /// channel is up and nothing is in flight.
    fn swap_work(&mut self) {
        if self.work.is_some() || self.send.is_none() {
            return;
        }
        if let Some(work) = self.next_work.take() {
            self.start_work(&work);
            self.work = Some(work);
        }
    }

    fn start_work(&mut self, work: &Work) {
        if work.threads != self.opts.threads {
            self.send_line(&format!("setoption name Threads value {}", work.threads));
            self.opts.threads = work.threads;
        }
        if work.hash_mb != self.opts.hash_mb {
            self.send_line(&format!("setoption name Hash value {}", work.hash_mb));
            self.opts.hash_mb = work.hash_mb;
        }
        if work.multi_pv != self.opts.multi_pv {
            self.send_line(&format!("setoption name MultiPV value {}", work.multi_pv));
            self.opts.multi_pv = work.multi_pv;
        }

        let position = if work.moves.is_empty() {
            format!("position fen {}", work.initial_fen)
        } else {
            format!(
                "position fen {} moves {}",
                work.initial_fen,
                work.moves.join(" ")
            )
        };
        self.send_line(&position);

        let go = match work.limit {
            SearchLimit::Depth(d) => format!("go depth {}", d),
            SearchLimit::MoveTime(ms) => format!("go movetime {}", ms),
        };
        self.send_line(&go);
    }

    fn send_line(&self, line: &str) {
        match &self.send {
            Some(send) => send(line),
            None => warn!("dropping command, no channel registered: {}", line),
        }
    }
}
