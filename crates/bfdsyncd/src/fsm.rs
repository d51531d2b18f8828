//! BFD session state machine.
//!
//! Pure transition logic: given the stored record and one event, compute the
//! next record and the ordered offload/notification effects. Nothing here
//! touches the store or the adapter; [`crate::orch`] executes the result.
//!
//! | Current | Peer advertises | Next | Effects |
//! |---|---|---|---|
//! | any | AdminDown | Down | clear remote discriminator, edit tx, notify AdminDown |
//! | Up | Down | Init | edit tx |
//! | Up | Up | Up | acknowledge a poll |
//! | Init | Up | Up | create or edit tx, edit rx, notify Up |
//! | Down | Init | Up | edit tx, edit rx, notify Up |
//! | Down | Down (remote newly learned) | Init | edit tx |
//!
//! Other combinations leave the state alone. Changed peer timers add a
//! receive-session edit after the transition effects.

use std::fmt;

use tracing::{debug, trace};

use crate::packet::InboundPacket;
use crate::record::BfdSessionRecord;
use crate::types::{BfdSessionAttribute, BfdSessionState, BFD_SINGLE_HOP_TTL};

/// Side effect of a step, executed in order after the record is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Re-program the transmit session with the new record.
    EditTx,
    /// Same as `EditTx`; creates the transmit session if it is missing.
    CreateOrEditTx,
    /// Answer a poll: transmit once with F set, then clear it.
    AckPoll,
    /// Create or re-program the receive session.
    EditRx,
    Notify(BfdSessionState),
}

/// Why a packet was dropped without touching the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Single-hop packet that did not arrive with TTL 255.
    NotAdjacent { ttl: Option<u8> },
    /// Your Discriminator names a different session.
    DiscriminatorMismatch { local: u32, received: u32 },
    /// My Discriminator changed while the remote one was known.
    PeerIdentityChanged { known: u32, received: u32 },
    /// The session is administratively down and ignores its peer.
    LocallyAdminDown,
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAdjacent { ttl: Some(ttl) } => write!(f, "not adjacent (ttl {})", ttl),
            Self::NotAdjacent { ttl: None } => write!(f, "not adjacent (ttl unknown)"),
            Self::DiscriminatorMismatch { local, received } => write!(
                f,
                "your discriminator {} does not match local {}",
                received, local
            ),
            Self::PeerIdentityChanged { known, received } => write!(
                f,
                "peer discriminator changed from {} to {}",
                known, received
            ),
            Self::LocallyAdminDown => write!(f, "session is admin down"),
        }
    }
}

/// Computed transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub previous: BfdSessionState,
    pub record: BfdSessionRecord,
    pub effects: Vec<Effect>,
    pub timers_changed: bool,
}

impl Step {
    fn new(previous: BfdSessionState, record: BfdSessionRecord) -> Self {
        Self {
            previous,
            record,
            effects: Vec::new(),
            timers_changed: false,
        }
    }

    pub fn state_changed(&self) -> bool {
        self.previous != self.record.state
    }

    fn push(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    /// Adds one `EditRx` unless the transition already issued one.
    fn ensure_rx_edit(&mut self) {
        if !self.effects.contains(&Effect::EditRx) {
            self.effects.push(Effect::EditRx);
        }
    }

    fn edits_tx(&self) -> bool {
        self.effects
            .iter()
            .any(|e| matches!(e, Effect::EditTx | Effect::CreateOrEditTx | Effect::AckPoll))
    }
}

/// Outcome of offering a packet to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Discard(DiscardReason),
    Apply(Step),
}

/// Runs packet admission and the transition table.
pub fn on_packet(record: &BfdSessionRecord, inbound: &InboundPacket) -> Verdict {
    let pkt = &inbound.packet;

    // Only the peer's own AdminDown gets through to an admin-down session
    if record.state == BfdSessionState::AdminDown && pkt.state != BfdSessionState::AdminDown {
        return Verdict::Discard(DiscardReason::LocallyAdminDown);
    }
    if !record.multihop && inbound.ttl != Some(BFD_SINGLE_HOP_TTL) {
        return Verdict::Discard(DiscardReason::NotAdjacent { ttl: inbound.ttl });
    }
    if pkt.your_discriminator != 0 && pkt.your_discriminator != record.local_discriminator {
        return Verdict::Discard(DiscardReason::DiscriminatorMismatch {
            local: record.local_discriminator,
            received: pkt.your_discriminator,
        });
    }

    let mut next = record.clone();
    let newly_learned = if record.remote_discriminator == 0 || pkt.your_discriminator == 0 {
        next.remote_discriminator = pkt.my_discriminator;
        pkt.my_discriminator != record.remote_discriminator
    } else if pkt.my_discriminator != record.remote_discriminator {
        return Verdict::Discard(DiscardReason::PeerIdentityChanged {
            known: record.remote_discriminator,
            received: pkt.my_discriminator,
        });
    } else {
        false
    };

    let timers_changed = next.remote_multiplier != pkt.multiplier
        || next.remote_min_echo_rx_us != pkt.required_min_echo_rx_us
        || next.remote_min_tx_us != pkt.desired_min_tx_us
        || next.remote_min_rx_us != pkt.required_min_rx_us;
    if timers_changed {
        next.remote_multiplier = pkt.multiplier;
        next.remote_min_echo_rx_us = pkt.required_min_echo_rx_us;
        next.remote_min_tx_us = pkt.desired_min_tx_us;
        next.remote_min_rx_us = pkt.required_min_rx_us;
    }

    // F answers our outstanding poll
    let poll_completed = pkt.final_flag && next.poll_pending;
    if poll_completed {
        next.poll_pending = false;
    }

    let mut step = Step::new(record.state, next);
    step.timers_changed = timers_changed;

    match (record.state, pkt.state) {
        (_, BfdSessionState::AdminDown) => {
            step.record.state = BfdSessionState::Down;
            step.record.remote_discriminator = 0;
            step.push(Effect::EditTx);
            step.push(Effect::Notify(BfdSessionState::AdminDown));
        }
        (BfdSessionState::Up, BfdSessionState::Down) => {
            step.record.state = BfdSessionState::Init;
            step.push(Effect::EditTx);
        }
        (BfdSessionState::Up, BfdSessionState::Up) => {
            if pkt.poll {
                step.push(Effect::AckPoll);
            }
        }
        (BfdSessionState::Init, BfdSessionState::Up) => {
            step.record.state = BfdSessionState::Up;
            step.push(Effect::CreateOrEditTx);
            step.push(Effect::EditRx);
            step.push(Effect::Notify(BfdSessionState::Up));
        }
        (BfdSessionState::Down, BfdSessionState::Init) => {
            step.record.state = BfdSessionState::Up;
            step.push(Effect::EditTx);
            step.push(Effect::EditRx);
            step.push(Effect::Notify(BfdSessionState::Up));
        }
        (BfdSessionState::Down, BfdSessionState::Down) if newly_learned => {
            step.record.state = BfdSessionState::Init;
            step.push(Effect::EditTx);
        }
        (current, advertised) => {
            trace!(
                local = record.local_discriminator,
                "no transition for {} on peer {}",
                current,
                advertised
            );
        }
    }

    if poll_completed && !step.edits_tx() {
        // Stop sending P
        step.push(Effect::EditTx);
    }
    if timers_changed {
        step.ensure_rx_edit();
    }

    debug!(
        local = record.local_discriminator,
        remote = step.record.remote_discriminator,
        from = %step.previous,
        to = %step.record.state,
        effects = ?step.effects,
        "bfd packet step"
    );
    Verdict::Apply(step)
}

/// Detection timer expiry. `None` when the session is already Down.
pub fn on_timeout(record: &BfdSessionRecord) -> Option<Step> {
    if record.state == BfdSessionState::Down {
        return None;
    }

    let mut next = record.clone();
    next.state = BfdSessionState::Down;
    next.remote_discriminator = 0;
    next.poll_pending = false;
    next.final_pending = false;

    let mut step = Step::new(record.state, next);
    step.push(Effect::EditTx);
    step.push(Effect::Notify(BfdSessionState::Down));
    Some(step)
}

/// Operator edit of a live session. `None` when nothing changes.
///
/// Changing local timers on an Up session starts a poll sequence; the
/// peer's F ends it in [`on_packet`].
pub fn on_attribute(record: &BfdSessionRecord, attr: &BfdSessionAttribute) -> Option<Step> {
    let mut next = record.clone();
    let mut timers = false;

    match *attr {
        BfdSessionAttribute::LocalMinTx(us) if us != record.min_tx_us => {
            next.min_tx_us = us;
            timers = true;
        }
        BfdSessionAttribute::LocalMinRx(us) if us != record.min_rx_us => {
            next.min_rx_us = us;
            timers = true;
        }
        BfdSessionAttribute::Multiplier(mult) if mult != record.multiplier => {
            next.multiplier = mult;
            timers = true;
        }
        BfdSessionAttribute::Tos(tos) if tos != record.tos => {
            next.tos = tos;
        }
        BfdSessionAttribute::AdminDown(true) if record.state != BfdSessionState::AdminDown => {
            next.state = BfdSessionState::AdminDown;
            next.remote_discriminator = 0;
            next.poll_pending = false;
            next.final_pending = false;
            let mut step = Step::new(record.state, next);
            step.push(Effect::EditTx);
            step.push(Effect::Notify(BfdSessionState::AdminDown));
            return Some(step);
        }
        BfdSessionAttribute::AdminDown(false) if record.state == BfdSessionState::AdminDown => {
            next.state = BfdSessionState::Down;
            let mut step = Step::new(record.state, next);
            step.push(Effect::EditTx);
            step.push(Effect::Notify(BfdSessionState::Down));
            return Some(step);
        }
        _ => return None,
    }

    if timers && record.state == BfdSessionState::Up {
        next.poll_pending = true;
    }
    let mut step = Step::new(record.state, next);
    step.push(Effect::EditTx);
    if timers && record.rx_session.is_valid() {
        step.push(Effect::EditRx);
    }
    Some(step)
}
