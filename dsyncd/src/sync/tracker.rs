use std::time::Duration;

use tokio::time::Instant;

use super::paths::path_lower;
use super::queue::ActionKind;

pub const DEFAULT_TRACKER_TTL: Duration = Duration::from_secs(30);

/// Handle for a pending self-inflicted mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackToken(u64);

#[derive(Debug)]
struct PendingOperation {
    token: u64,
    path_lower: String,
    kind: ActionKind,
    deadline: Instant,
}

/// Remembers mutations the engine performs itself so that the events they
/// cause (echoes) can be told apart from real changes.
///
/// Each entry matches at most one event and expires after the TTL whether or
/// not its echo ever arrives.
#[derive(Debug)]
pub struct OperationTracker {
    ttl: Duration,
    next_token: u64,
    pending: Vec<PendingOperation>,
}

impl OperationTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            next_token: 0,
            pending: Vec::new(),
        }
    }

    pub fn begin(&mut self, path: &str, kind: ActionKind) -> TrackToken {
        self.next_token += 1;
        let token = self.next_token;
        self.pending.push(PendingOperation {
            token,
            path_lower: path_lower(path),
            kind,
            deadline: Instant::now() + self.ttl,
        });
        TrackToken(token)
    }

    /// One-shot: a match consumes the entry.
    pub fn is_tracked(&mut self, path: &str, kind: ActionKind) -> bool {
        self.is_tracked_any(path, &[kind])
    }

    pub fn is_tracked_any(&mut self, path: &str, kinds: &[ActionKind]) -> bool {
        self.purge_expired();
        let key = path_lower(path);
        match self
            .pending
            .iter()
            .position(|op| op.path_lower == key && kinds.contains(&op.kind))
        {
            Some(idx) => {
                self.pending.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Restarts the TTL of an entry, once its mutation has completed.
    pub fn refresh(&mut self, token: TrackToken) {
        let deadline = Instant::now() + self.ttl;
        if let Some(op) = self.pending.iter_mut().find(|op| op.token == token.0) {
            op.deadline = deadline;
        }
    }

    /// Forgets an entry whose echo will never come.
    pub fn end(&mut self, token: TrackToken) {
        self.pending.retain(|op| op.token != token.0);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.pending.retain(|op| op.deadline > now);
    }
}

impl Default for OperationTracker {
    fn default() -> Self {
        Self::new(DEFAULT_TRACKER_TTL)
    }
}
