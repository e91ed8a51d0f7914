//! Perfect-negotiation decision core.
//!
//! When two peers observe each other's `peer-joined` near-simultaneously,
//! both construct offers ("glare"). The tie is broken by a fixed role per
//! peer pair: the *polite* side yields to an incoming offer during a
//! collision, the *impolite* side ignores it. Roles derive deterministically
//! from username comparison, so for unique usernames exactly one offer is
//! honored per collision.
//!
//! This module is pure state and predicates; the I/O lives in
//! [`peer`](super::peer).

/// Deterministic role assignment: the lexicographically greater username is
/// polite toward the other. Symmetric and stable for the lifetime of the
/// peer relationship.
pub(crate) fn is_polite(local: &str, remote: &str) -> bool {
    local > remote
}

/// Mutable negotiation flags for one peer relationship.
///
/// `making_offer` is true only while a local offer is being constructed and
/// installed as the local description; it gates re-entrancy so at most one
/// local offer/answer round is in flight.
#[derive(Debug, Default)]
pub(crate) struct Negotiation {
    pub making_offer: bool,
    pub polite: bool,
}

impl Negotiation {
    /// Fix the role for a newly observed peer. Recomputed fresh for any new
    /// peer relationship.
    pub fn peer_joined(&mut self, local: &str, remote: &str) {
        self.polite = is_polite(local, remote);
    }

    /// An offer collision exists while we are mid-offer ourselves or the
    /// peer connection is not settled.
    pub fn offer_collision(&self, signaling_stable: bool) -> bool {
        self.making_offer || !signaling_stable
    }

    /// Whether an incoming offer must be dropped: collision and we are the
    /// impolite side. The polite side always proceeds.
    pub fn should_ignore_offer(&self, signaling_stable: bool) -> bool {
        !self.polite && self.offer_collision(signaling_stable)
    }
}
