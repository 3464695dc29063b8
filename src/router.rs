//! Response correlation for requests sent over one connection.
//!
//! DESIGN
//! ======
//! Each outstanding request owns a oneshot sender keyed by its numeric id.
//! An inbound response either resolves exactly one outstanding request or,
//! when no id matches, is handed back as a push for the general message
//! hooks. Correlation is strictly by id; verb and path are kept for logs.
//!
//! STATES
//! ======
//! NEW (registered) → RESOLVED (matching response arrived)
//!                  → UNMATCHED (timed out, or abandoned on teardown)

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use frames::{Message, Response};
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("request id {0} is already outstanding")]
    DuplicateId(u64),
}

/// What the router did with one inbound message.
#[derive(Debug)]
pub enum Routed {
    /// Delivered to the outstanding request with this id.
    Resolved { id: u64 },
    /// Unsolicited: server request, or a response no request is waiting for.
    Push(Message),
    /// Keepalive traffic.
    Noop,
    /// Unknown wire type, dropped.
    Ignored { wire_type: i32 },
}

struct Pending {
    verb: String,
    path: String,
    reply: oneshot::Sender<Response>,
}

/// Keepalive ids remembered per router.
pub const RECENT_KEEPALIVES: usize = 16;

pub struct Router {
    pending: Mutex<HashMap<u64, Pending>>,
    /// Ids of the most recent keepalives, oldest first.
    keepalives: Mutex<VecDeque<u64>>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Self { pending: Mutex::new(HashMap::new()), keepalives: Mutex::new(VecDeque::with_capacity(RECENT_KEEPALIVES)) }
    }

    /// Register an outstanding request (NEW) and return the receiver its response lands on.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::DuplicateId`] if `id` is already outstanding.
    pub fn register(
        &self,
        id: u64,
        verb: &str,
        path: &str,
    ) -> Result<oneshot::Receiver<Response>, RouterError> {
        let mut pending = self.lock();
        if pending.contains_key(&id) {
            return Err(RouterError::DuplicateId(id));
        }
        let (reply, rx) = oneshot::channel();
        pending.insert(id, Pending { verb: verb.to_owned(), path: path.to_owned(), reply });
        Ok(rx)
    }

    /// Remember the id of a keepalive just sent so its response is swallowed,
    /// even when a later keepalive goes out before the echo arrives.
    pub fn note_keepalive(&self, id: u64) {
        let mut keepalives = self.keepalives.lock().unwrap_or_else(PoisonError::into_inner);
        if keepalives.len() == RECENT_KEEPALIVES {
            keepalives.pop_front();
        }
        keepalives.push_back(id);
    }

    fn is_keepalive(&self, id: u64) -> bool {
        id != 0 && self.keepalives.lock().unwrap_or_else(PoisonError::into_inner).contains(&id)
    }

    /// Classify one inbound message, resolving its request when the id matches.
    pub fn route(&self, message: Message) -> Routed {
        match message {
            Message::Response(response) => {
                let id = response.id;
                let entry = self.lock().remove(&id);
                if let Some(entry) = entry {
                    debug!(id, verb = %entry.verb, path = %entry.path, status = response.status, "router: resolved");
                    if entry.reply.send(response).is_err() {
                        debug!(id, "router: requester went away before the response");
                    }
                    return Routed::Resolved { id };
                }
                if self.is_keepalive(id) {
                    return Routed::Noop;
                }
                Routed::Push(Message::Response(response))
            }
            Message::Keepalive(_) => Routed::Noop,
            Message::Request(request) => Routed::Push(Message::Request(request)),
            Message::Unknown { wire_type } => Routed::Ignored { wire_type },
        }
    }

    /// Drop an outstanding request (UNMATCHED). Returns whether it was still pending.
    pub fn abandon(&self, id: u64) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Drop every outstanding request. Waiters observe a closed channel.
    pub fn abandon_all(&self) -> usize {
        let drained = std::mem::take(&mut *self.lock());
        drained.len()
    }

    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_outstanding(&self, id: u64) -> bool {
        self.lock().contains_key(&id)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// =============================================================================
// REQUEST IDS
// =============================================================================

/// Timestamp-derived request ids, strictly increasing per connection.
///
/// Ids stay millisecond timestamps as the service expects, but two requests
/// issued within the same millisecond get consecutive values instead of
/// colliding.
#[derive(Debug, Default)]
pub struct RequestIds {
    last: AtomicU64,
}

impl RequestIds {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.next_after(now_ms())
    }

    fn next_after(&self, now: u64) -> u64 {
        let mut current = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(current.saturating_add(1));
            match self.last.compare_exchange_weak(current, candidate, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return candidate,
                Err(actual) => current = actual,
            }
        }
    }
}

fn now_ms() -> u64 {
    let Ok(duration) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    u64::try_from(duration.as_millis()).unwrap_or(0)
}

#[cfg(test)]
#[path = "router_test.rs"]
mod tests;
