//! Server-authoritative call session coordination.
//!
//! The server tracks one ephemeral session per user while a call is being
//! negotiated, relays the opaque WebRTC payloads between exactly the two
//! endpoints, auto-declines offers to a busy peer, and enforces the ring
//! timeout so a crashed client can't leave its peer stuck ringing.
//!
//! Signal payloads are never inspected beyond the `type` discriminator
//! (`offer` / `answer` / `ice-candidate` / `hangup` / `decline`).

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::state::AppState;
use crate::ws::broadcast::emit;
use crate::ws::protocol::ServerEvent;

/// Phase of an in-flight call session. Absence of a session means idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    /// Sent an offer, waiting for the callee to answer
    Calling,
    /// Received an offer, not yet answered
    Ringing,
    /// Answer delivered to both ends
    Connected,
}

#[derive(Debug)]
struct CallSession {
    peer: i64,
    phase: CallPhase,
    /// Distinguishes this negotiation from later ones between the same pair,
    /// so a stale ring-timeout task can't tear down a newer call.
    epoch: u64,
    /// ICE candidates held back until both ends have their descriptions.
    pending: Vec<Value>,
}

/// Outcome of an offer attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum OfferOutcome {
    /// Caller is Calling, callee is Ringing; relay the offer and arm the timer.
    Ring { epoch: u64 },
    /// The sender already has a session — invalid, drop.
    CallerBusy,
    /// The callee is mid-call — auto-decline back to the caller.
    CalleeBusy,
}

/// Outcome of an ICE candidate from a session participant.
#[derive(Debug, PartialEq, Eq)]
pub enum CandidateOutcome {
    /// Both descriptions are set — relay immediately.
    Relay(Value),
    /// Held until the session connects.
    Queued,
    /// No matching session — drop.
    Dropped,
}

/// In-memory call session table, at most one session per user.
///
/// Mutations never hold two entries at once: an offer claims the caller's
/// slot, then the callee's via the entry API, rolling the caller back if the
/// callee slot is taken. Two users racing to call each other both observe a
/// busy peer and both get declined — never a half-built call.
#[derive(Debug, Clone, Default)]
pub struct CallTable {
    sessions: Arc<DashMap<i64, CallSession>>,
    epochs: Arc<AtomicU64>,
}

impl CallTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase of a user's session, if any.
    pub fn phase(&self, user_id: i64) -> Option<CallPhase> {
        self.sessions.get(&user_id).map(|s| s.phase)
    }

    /// Begin a call negotiation: caller -> Calling, callee -> Ringing.
    pub fn begin_offer(&self, caller: i64, callee: i64) -> OfferOutcome {
        let epoch = self.epochs.fetch_add(1, Ordering::Relaxed);

        match self.sessions.entry(caller) {
            Entry::Occupied(_) => return OfferOutcome::CallerBusy,
            Entry::Vacant(slot) => {
                slot.insert(CallSession {
                    peer: callee,
                    phase: CallPhase::Calling,
                    epoch,
                    pending: Vec::new(),
                });
            }
        }

        match self.sessions.entry(callee) {
            Entry::Occupied(entry) => {
                // Lost the race or callee mid-call. The entry guard must be
                // released before touching the caller's slot: the peer may be
                // rolling back its own offer at this moment, and holding the
                // callee shard while removing from the caller shard would
                // deadlock against it.
                drop(entry);
                self.sessions.remove_if(&caller, |_, s| s.epoch == epoch);
                OfferOutcome::CalleeBusy
            }
            Entry::Vacant(slot) => {
                slot.insert(CallSession {
                    peer: caller,
                    phase: CallPhase::Ringing,
                    epoch,
                    pending: Vec::new(),
                });
                OfferOutcome::Ring { epoch }
            }
        }
    }

    /// The ringing callee answered. Transitions both ends to Connected and
    /// returns the queued candidates `(caller's, callee's)` for flushing, or
    /// None when the transition is not valid from the current state.
    pub fn accept(&self, callee: i64, caller: i64) -> Option<(Vec<Value>, Vec<Value>)> {
        {
            let session = self.sessions.get(&callee)?;
            if session.phase != CallPhase::Ringing || session.peer != caller {
                return None;
            }
        }

        let caller_pending = {
            let mut session = self.sessions.get_mut(&caller)?;
            if session.phase != CallPhase::Calling || session.peer != callee {
                return None;
            }
            session.phase = CallPhase::Connected;
            std::mem::take(&mut session.pending)
        };

        let callee_pending = {
            let mut session = self.sessions.get_mut(&callee)?;
            session.phase = CallPhase::Connected;
            std::mem::take(&mut session.pending)
        };

        Some((caller_pending, callee_pending))
    }

    /// Queue an ICE candidate while negotiating, or hand it back for
    /// immediate relay once connected.
    pub fn candidate(&self, from: i64, to: i64, candidate: Value) -> CandidateOutcome {
        match self.sessions.get_mut(&from) {
            Some(mut session) if session.peer == to => match session.phase {
                CallPhase::Connected => CandidateOutcome::Relay(candidate),
                CallPhase::Calling | CallPhase::Ringing => {
                    session.pending.push(candidate);
                    CandidateOutcome::Queued
                }
            },
            _ => CandidateOutcome::Dropped,
        }
    }

    /// Tear down a user's session from any phase (hangup, decline, or
    /// disconnect), clearing the peer's matching session too.
    /// Returns the peer to notify, or None when the user was idle.
    pub fn teardown(&self, user_id: i64) -> Option<i64> {
        let (_, session) = self.sessions.remove(&user_id)?;
        self.sessions
            .remove_if(&session.peer, |_, s| s.peer == user_id);
        Some(session.peer)
    }

    /// Ring timeout fired. Clears both sessions iff the same negotiation is
    /// still waiting for an answer. Returns true when the call rang out.
    pub fn expire(&self, caller: i64, callee: i64, epoch: u64) -> bool {
        let removed = self.sessions.remove_if(&caller, |_, s| {
            s.epoch == epoch && s.phase == CallPhase::Calling && s.peer == callee
        });
        if removed.is_none() {
            return false;
        }
        self.sessions
            .remove_if(&callee, |_, s| s.epoch == epoch && s.peer == caller);
        true
    }
}

/// Dispatch an inbound `webrtc:signal` frame. `from` is always the
/// authenticated connection's user, never taken from the payload.
pub fn handle_signal(state: &AppState, from: i64, to: i64, signal: Value) {
    if from == to {
        tracing::debug!(user_id = from, "Dropping self-addressed signal");
        return;
    }
    match signal.get("type").and_then(Value::as_str) {
        Some("offer") => handle_offer(state, from, to, signal),
        Some("answer") => handle_answer(state, from, to, signal),
        Some("ice-candidate") => handle_candidate(state, from, to, signal),
        Some("hangup") | Some("decline") => handle_teardown(state, from, signal),
        other => {
            tracing::debug!(user_id = from, signal_type = ?other, "Dropping unknown signal");
        }
    }
}

fn handle_offer(state: &AppState, caller: i64, callee: i64, signal: Value) {
    match state.calls.begin_offer(caller, callee) {
        OfferOutcome::CallerBusy => {
            tracing::debug!(caller, callee, "Dropping offer from busy caller");
        }
        OfferOutcome::CalleeBusy => {
            // Indistinguishable on the wire from a human decline.
            tracing::debug!(caller, callee, "Callee busy, auto-declining");
            emit(
                &state.connections,
                caller,
                &ServerEvent::WebrtcSignal {
                    from_user_id: callee,
                    signal: json!({ "type": "decline" }),
                },
            );
        }
        OfferOutcome::Ring { epoch } => {
            emit(
                &state.connections,
                callee,
                &ServerEvent::WebrtcSignal {
                    from_user_id: caller,
                    signal,
                },
            );
            arm_ring_timeout(state, caller, callee, epoch);
        }
    }
}

/// No answer within the window: clear both ends, tell the caller the call
/// rang out and clear the callee's stale ringing state.
fn arm_ring_timeout(state: &AppState, caller: i64, callee: i64, epoch: u64) {
    let state = state.clone();
    tokio::spawn(async move {
        tokio::time::sleep(state.ring_timeout).await;
        if !state.calls.expire(caller, callee, epoch) {
            return;
        }
        tracing::debug!(caller, callee, "Call rang out without an answer");
        emit(
            &state.connections,
            caller,
            &ServerEvent::WebrtcSignal {
                from_user_id: callee,
                signal: json!({ "type": "hangup", "reason": "timeout" }),
            },
        );
        emit(
            &state.connections,
            callee,
            &ServerEvent::WebrtcSignal {
                from_user_id: caller,
                signal: json!({ "type": "hangup" }),
            },
        );
    });
}

fn handle_answer(state: &AppState, callee: i64, caller: i64, signal: Value) {
    let Some((caller_pending, callee_pending)) = state.calls.accept(callee, caller) else {
        tracing::debug!(callee, caller, "Dropping answer with no ringing session");
        return;
    };

    emit(
        &state.connections,
        caller,
        &ServerEvent::WebrtcSignal {
            from_user_id: callee,
            signal,
        },
    );

    // Flush candidates queued before the descriptions were set, in arrival order.
    for candidate in caller_pending {
        emit(
            &state.connections,
            callee,
            &ServerEvent::WebrtcSignal {
                from_user_id: caller,
                signal: candidate,
            },
        );
    }
    for candidate in callee_pending {
        emit(
            &state.connections,
            caller,
            &ServerEvent::WebrtcSignal {
                from_user_id: callee,
                signal: candidate,
            },
        );
    }
}

fn handle_candidate(state: &AppState, from: i64, to: i64, signal: Value) {
    match state.calls.candidate(from, to, signal) {
        CandidateOutcome::Relay(candidate) => {
            emit(
                &state.connections,
                to,
                &ServerEvent::WebrtcSignal {
                    from_user_id: from,
                    signal: candidate,
                },
            );
        }
        CandidateOutcome::Queued => {}
        CandidateOutcome::Dropped => {
            tracing::debug!(from, to, "Dropping candidate with no matching session");
        }
    }
}

fn handle_teardown(state: &AppState, from: i64, signal: Value) {
    // The session records the authoritative peer; the payload's target is
    // ignored so a confused client can't hang up a third party's call.
    let Some(peer) = state.calls.teardown(from) else {
        tracing::debug!(user_id = from, "Dropping hangup/decline from idle user");
        return;
    };
    emit(
        &state.connections,
        peer,
        &ServerEvent::WebrtcSignal {
            from_user_id: from,
            signal,
        },
    );
}

/// Transport closed mid-call: behaves like an explicit hangup from that side.
pub fn hangup_on_disconnect(state: &AppState, user_id: i64) {
    if let Some(peer) = state.calls.teardown(user_id) {
        tracing::debug!(user_id, peer, "Implicit hangup on disconnect");
        emit(
            &state.connections,
            peer,
            &ServerEvent::WebrtcSignal {
                from_user_id: user_id,
                signal: json!({ "type": "hangup" }),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_rings_and_second_offer_is_busy() {
        let calls = CallTable::new();
        assert!(matches!(calls.begin_offer(1, 2), OfferOutcome::Ring { .. }));
        assert_eq!(calls.phase(1), Some(CallPhase::Calling));
        assert_eq!(calls.phase(2), Some(CallPhase::Ringing));

        // Third party calling either busy end is declined
        assert_eq!(calls.begin_offer(3, 2), OfferOutcome::CalleeBusy);
        assert_eq!(calls.phase(3), None, "loser's slot rolled back");
        // Busy caller re-offering is dropped
        assert_eq!(calls.begin_offer(1, 3), OfferOutcome::CallerBusy);
    }

    #[test]
    fn accept_connects_both_ends_and_flushes_queue_in_order() {
        let calls = CallTable::new();
        calls.begin_offer(1, 2);

        // Caller trickles candidates before the answer arrives
        assert_eq!(calls.candidate(1, 2, json!({"c": 1})), CandidateOutcome::Queued);
        assert_eq!(calls.candidate(1, 2, json!({"c": 2})), CandidateOutcome::Queued);

        let (caller_pending, callee_pending) = calls.accept(2, 1).expect("valid answer");
        assert_eq!(caller_pending, vec![json!({"c": 1}), json!({"c": 2})]);
        assert!(callee_pending.is_empty());
        assert_eq!(calls.phase(1), Some(CallPhase::Connected));
        assert_eq!(calls.phase(2), Some(CallPhase::Connected));

        // Once connected, candidates relay straight through
        assert!(matches!(
            calls.candidate(1, 2, json!({"c": 3})),
            CandidateOutcome::Relay(_)
        ));
    }

    #[test]
    fn accept_is_rejected_outside_ringing() {
        let calls = CallTable::new();
        assert!(calls.accept(2, 1).is_none(), "no session at all");

        calls.begin_offer(1, 2);
        assert!(calls.accept(1, 2).is_none(), "caller cannot answer its own offer");

        calls.accept(2, 1).unwrap();
        assert!(calls.accept(2, 1).is_none(), "already connected");
    }

    #[test]
    fn candidate_from_stranger_is_dropped() {
        let calls = CallTable::new();
        calls.begin_offer(1, 2);
        assert_eq!(calls.candidate(3, 2, json!({})), CandidateOutcome::Dropped);
        assert_eq!(calls.candidate(1, 3, json!({})), CandidateOutcome::Dropped);
    }

    #[test]
    fn teardown_clears_both_sessions() {
        let calls = CallTable::new();
        calls.begin_offer(1, 2);
        assert_eq!(calls.teardown(1), Some(2));
        assert_eq!(calls.phase(1), None);
        assert_eq!(calls.phase(2), None);
        assert_eq!(calls.teardown(1), None, "idle teardown is a no-op");

        // Pair is callable again
        assert!(matches!(calls.begin_offer(2, 1), OfferOutcome::Ring { .. }));
    }

    #[test]
    fn racing_mutual_offers_never_wedge() {
        // Two users dialing each other at once: each offer claims its own
        // slot and then probes the peer's. The rollback must not run under
        // the peer-slot guard or the two offers block each other forever.
        let calls = CallTable::new();
        let handles: Vec<_> = [(1i64, 2i64), (2, 1)]
            .into_iter()
            .map(|(me, peer)| {
                let calls = calls.clone();
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        calls.begin_offer(me, peer);
                        calls.teardown(me);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("offer loop panicked");
        }

        // Whatever the final interleaving left behind, the pair recovers.
        calls.teardown(1);
        calls.teardown(2);
        assert!(matches!(calls.begin_offer(1, 2), OfferOutcome::Ring { .. }));
    }

    #[test]
    fn expire_only_hits_the_same_unanswered_negotiation() {
        let calls = CallTable::new();
        let OfferOutcome::Ring { epoch } = calls.begin_offer(1, 2) else {
            panic!("expected ring");
        };

        // Answered before the timer fired: expire must not touch it
        calls.accept(2, 1).unwrap();
        assert!(!calls.expire(1, 2, epoch));
        assert_eq!(calls.phase(1), Some(CallPhase::Connected));

        calls.teardown(1);

        // A later negotiation has a different epoch
        let OfferOutcome::Ring { epoch: second } = calls.begin_offer(1, 2) else {
            panic!("expected ring");
        };
        assert!(!calls.expire(1, 2, epoch), "stale timer is ignored");
        assert!(calls.expire(1, 2, second));
        assert_eq!(calls.phase(1), None);
        assert_eq!(calls.phase(2), None);
    }
}
