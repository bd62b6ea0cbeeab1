//! Connection state machine.
//!
//! Every change of [`ConnectionState`] goes through [`transition`], a single
//! `(state, trigger) -> state` table. Triggers come either from the controller's own
//! operations or from the access-link driver's asynchronous signals.
//!
//! ```text
//!                 LinksUp               Start
//! Disconnected ───────────▶ Connected ─────────▶ Polling
//!       ▲                    │  ▲                   │
//!       │  Disconnect/       │  └──── Stop ─────────┘
//!       └─ LinkDown ─────────┴──────────────────────┘
//! ```

use crate::core::ConnectionState;
use std::fmt;

/// Event that may move the controller between states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// Both links finished connecting.
    LinksUp,
    /// Driver reported its transport up. Never enough on its own to become connected.
    LinkUp,
    /// Driver reported its transport down.
    LinkDown,
    /// Timer armed.
    Start,
    /// Timer disarmed.
    Stop,
    /// Caller asked to release both links.
    Disconnect,
}

impl Trigger {
    /// Operation name used in `InvalidState` diagnostics.
    pub fn operation(self) -> &'static str {
        match self {
            Trigger::LinksUp => "connect",
            Trigger::LinkUp => "accept a link-up signal",
            Trigger::LinkDown => "accept a link-down signal",
            Trigger::Start => "start polling",
            Trigger::Stop => "stop polling",
            Trigger::Disconnect => "disconnect",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outcome of looking a trigger up in the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Move to the given state (may equal the current one for idempotent triggers).
    To(ConnectionState),
    /// The trigger is not allowed from the current state.
    Rejected,
}

/// The transition table.
pub fn transition(from: ConnectionState, trigger: Trigger) -> Transition {
    use ConnectionState::*;
    use Trigger::*;

    match (from, trigger) {
        (Disconnected, LinksUp) => Transition::To(Connected),
        (Connected | Polling, LinksUp) => Transition::Rejected,

        // Driver link-up alone never gates the connected state.
        (state, LinkUp) => Transition::To(state),

        (_, LinkDown) => Transition::To(Disconnected),

        (Connected, Start) => Transition::To(Polling),
        (Disconnected | Polling, Start) => Transition::Rejected,

        (Polling, Stop) => Transition::To(Connected),
        (state @ (Connected | Disconnected), Stop) => Transition::To(state),

        (_, Disconnect) => Transition::To(Disconnected),
    }
}
