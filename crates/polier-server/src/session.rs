//! Per-connection session state: the turn buffer that accumulates
//! transcript fragments, the handle of the in-flight response task, and
//! the idle-flush timer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Silence long enough to treat the buffered fragments as a finished
/// utterance.
pub const IDLE_FLUSH_TIMEOUT: Duration = Duration::from_millis(1250);

pub const MAX_TURN_FRAGMENTS: usize = 50;
pub const MAX_TURN_CHARS: usize = 8_000;

/// What closed the turn. Reported to the client on `turn_complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    IdleTimeout,
    ExplicitEndTurn,
    Limits,
}

impl FlushTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            FlushTrigger::IdleTimeout => "idle_timeout",
            FlushTrigger::ExplicitEndTurn => "explicit_end_turn",
            FlushTrigger::Limits => "limits",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Appended,
    /// The fragment was rejected; the buffered turn must be flushed
    /// as-is.
    TooLarge,
}

/// Accumulates trimmed transcript fragments until something closes the
/// turn.
#[derive(Debug)]
pub struct TurnBuffer {
    fragments: Vec<String>,
    chars: usize,
    max_fragments: usize,
    max_chars: usize,
}

impl Default for TurnBuffer {
    fn default() -> Self {
        Self::new(MAX_TURN_FRAGMENTS, MAX_TURN_CHARS)
    }
}

impl TurnBuffer {
    pub fn new(max_fragments: usize, max_chars: usize) -> Self {
        Self {
            fragments: Vec::new(),
            chars: 0,
            max_fragments,
            max_chars,
        }
    }

    /// Append one fragment. The caller trims and drops empty fragments
    /// before calling.
    pub fn push(&mut self, fragment: &str) -> PushOutcome {
        let fragment_chars = fragment.chars().count();
        if self.fragments.len() + 1 > self.max_fragments
            || self.chars + fragment_chars > self.max_chars
        {
            return PushOutcome::TooLarge;
        }
        self.fragments.push(fragment.to_string());
        self.chars += fragment_chars;
        PushOutcome::Appended
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Drain the buffer into one newline-joined utterance. `None` when
    /// nothing is buffered.
    pub fn take_joined(&mut self) -> Option<String> {
        if self.fragments.is_empty() {
            return None;
        }
        let joined = self.fragments.join("\n");
        self.fragments.clear();
        self.chars = 0;
        let trimmed = joined.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(trimmed.to_string())
    }

    pub fn clear(&mut self) {
        self.fragments.clear();
        self.chars = 0;
    }
}

/// One websocket connection's mutable state.
///
/// The idle timer is epoch-guarded: every restart or cancellation bumps
/// `timer_epoch`, and a timer that wakes with a stale epoch must not
/// flush. This closes the window between aborting a timer task and it
/// having already passed its sleep.
pub struct Session {
    pub conversation_id: String,
    pub turn: Mutex<TurnBuffer>,
    pub active_response: Mutex<Option<JoinHandle<()>>>,
    pub idle_timer: Mutex<Option<JoinHandle<()>>>,
    timer_epoch: AtomicU64,
}

impl Session {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            turn: Mutex::new(TurnBuffer::default()),
            active_response: Mutex::new(None),
            idle_timer: Mutex::new(None),
            timer_epoch: AtomicU64::new(0),
        }
    }

    /// Bump the epoch and return the new value; a timer armed against
    /// this value only fires while it is still current.
    pub fn next_timer_epoch(&self) -> u64 {
        self.timer_epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn timer_epoch_is_current(&self, epoch: u64) -> bool {
        self.timer_epoch.load(Ordering::SeqCst) == epoch
    }

    /// Invalidate and abort any armed idle timer.
    pub async fn cancel_idle_timer(&self) {
        self.timer_epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.idle_timer.lock().await.take() {
            handle.abort();
        }
    }
}
