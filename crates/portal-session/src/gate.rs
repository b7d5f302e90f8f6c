//! The "session restored" gate.
//!
//! [`restore_gate`] creates a linked pair: a single [`RestoreSignal`] (the
//! writer, owned by the session manager) and any number of [`RestoreGate`]
//! readers (held by the request gateway). While the gate is closed, callers
//! of [`RestoreGate::admit`] are parked in a FIFO queue. Opening the gate
//! releases them in arrival order and hands each one a [`Turn`]; turns are
//! served strictly by ticket number so released requests reach the
//! transport in the order they were queued.
//!
//! A parked caller whose timeout fires before release is removed from the
//! queue. Timeout and release race first-wins under the queue lock.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};

/// Creates a closed gate and its writer.
#[must_use]
pub fn restore_gate() -> (RestoreSignal, RestoreGate) {
    let (turns, _) = watch::channel(Turnstile::default());
    let inner = Arc::new(GateInner {
        state: Mutex::new(GateState::default()),
        turns,
    });
    (
        RestoreSignal {
            inner: Arc::clone(&inner),
        },
        RestoreGate { inner },
    )
}

#[derive(Debug)]
struct GateInner {
    state: Mutex<GateState>,
    turns: watch::Sender<Turnstile>,
}

#[derive(Debug, Default)]
struct GateState {
    restored: bool,
    queue: VecDeque<Waiter>,
    next_id: u64,
    next_ticket: u64,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    path: String,
    release: oneshot::Sender<u64>,
}

/// Ticket currently allowed to send, plus tickets given up out of order.
#[derive(Debug, Default)]
struct Turnstile {
    next: u64,
    forfeited: BTreeSet<u64>,
}

impl GateInner {
    fn state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish_turn(&self, ticket: u64) {
        self.turns.send_modify(|turnstile| {
            if turnstile.next == ticket {
                turnstile.next += 1;
                while turnstile.forfeited.remove(&turnstile.next) {
                    turnstile.next += 1;
                }
            } else if ticket > turnstile.next {
                turnstile.forfeited.insert(ticket);
            }
        });
    }
}

/// Writer side of the gate. There is exactly one per gate.
#[derive(Debug)]
pub struct RestoreSignal {
    inner: Arc<GateInner>,
}

impl RestoreSignal {
    /// Opens the gate and releases every queued request in arrival order.
    ///
    /// Returns the number of requests released. Opening an open gate is a
    /// no-op.
    pub fn mark_restored(&self) -> usize {
        let mut state = self.inner.state();
        if state.restored {
            return 0;
        }
        state.restored = true;

        let mut released = 0;
        while let Some(waiter) = state.queue.pop_front() {
            let ticket = state.next_ticket;
            if waiter.release.send(ticket).is_ok() {
                state.next_ticket += 1;
                released += 1;
                debug!(path = %waiter.path, ticket, "Released queued request");
            }
        }
        drop(state);

        info!(released, "Session restored, gate opened");
        released
    }

    /// Returns a reader for this gate.
    #[must_use]
    pub fn gate(&self) -> RestoreGate {
        RestoreGate {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Reader side of the gate.
#[derive(Debug, Clone)]
pub struct RestoreGate {
    inner: Arc<GateInner>,
}

/// Outcome of passing the gate.
#[derive(Debug)]
pub enum Admission {
    /// The gate was already open; the request was never queued.
    Open,
    /// The request was queued and has been released with a send turn.
    Released(Turn),
}

impl RestoreGate {
    /// Returns `true` once the session has been restored.
    #[must_use]
    pub fn is_restored(&self) -> bool {
        self.inner.state().restored
    }

    /// Number of requests currently parked in the queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.state().queue.len()
    }

    /// Waits until the gate opens or `timeout` elapses.
    ///
    /// Dropping the returned future removes the caller from the queue.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::SessionRestorationTimeout` if the timeout fires
    /// before the gate opens.
    pub async fn admit(&self, path: &str, timeout: Duration) -> Result<Admission> {
        let mut parked = {
            let mut state = self.inner.state();
            if state.restored {
                return Ok(Admission::Open);
            }
            let id = state.next_id;
            state.next_id += 1;
            let (release, receiver) = oneshot::channel();
            state.queue.push_back(Waiter {
                id,
                path: path.to_string(),
                release,
            });
            debug!(path, queued = state.queue.len(), "Request queued until session is restored");
            Parked {
                id,
                receiver,
                inner: &self.inner,
                armed: true,
            }
        };

        let outcome = tokio::time::timeout(timeout, &mut parked.receiver).await;
        match outcome {
            Ok(Ok(ticket)) => {
                parked.defuse();
                Ok(Admission::Released(Turn::new(ticket, &self.inner)))
            }
            Ok(Err(_)) | Err(_) => {
                // Lost the race only if release already handed us a ticket
                if let Some(ticket) = parked.expire() {
                    return Ok(Admission::Released(Turn::new(ticket, &self.inner)));
                }
                let waited_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(path, waited_ms, "Queued request expired before session restore");
                Err(SessionError::restoration_timeout(path, waited_ms))
            }
        }
    }
}

/// Queue entry owned by a waiting `admit` call.
struct Parked<'a> {
    id: u64,
    receiver: oneshot::Receiver<u64>,
    inner: &'a Arc<GateInner>,
    armed: bool,
}

impl Parked<'_> {
    fn defuse(&mut self) {
        self.armed = false;
    }

    /// Removes the entry from the queue. Returns the ticket instead if the
    /// entry had already been released.
    fn expire(&mut self) -> Option<u64> {
        self.armed = false;
        let mut state = self.inner.state();
        if let Some(pos) = state.queue.iter().position(|w| w.id == self.id) {
            state.queue.remove(pos);
            return None;
        }
        drop(state);
        self.receiver.try_recv().ok()
    }
}

impl Drop for Parked<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Some(ticket) = self.expire() {
                self.inner.finish_turn(ticket);
            }
        }
    }
}

/// Permission to send, served in release order.
///
/// Dropping a turn passes it on, whether or not it was waited for.
#[derive(Debug)]
pub struct Turn {
    ticket: u64,
    inner: Arc<GateInner>,
}

impl Turn {
    fn new(ticket: u64, inner: &Arc<GateInner>) -> Self {
        Self {
            ticket,
            inner: Arc::clone(inner),
        }
    }

    /// Position of this turn in release order.
    #[must_use]
    pub const fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Waits until every earlier turn has been used or given up.
    pub async fn wait(&self) {
        let mut turns = self.inner.turns.subscribe();
        // The sender lives as long as `self.inner`, so this cannot fail
        let _ = turns.wait_for(|t| t.next >= self.ticket).await;
    }
}

impl Drop for Turn {
    fn drop(&mut self) {
        self.inner.finish_turn(self.ticket);
    }
}
