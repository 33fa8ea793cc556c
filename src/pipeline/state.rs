use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

use crate::events::{EventSender, SessionEventKind};

/// Stage of the turn cycle a session is in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Listening,
    Transcribing,
    Reasoning,
    Speaking,
    Interrupted,
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TurnState::Listening => "listening",
            TurnState::Transcribing => "transcribing",
            TurnState::Reasoning => "reasoning",
            TurnState::Speaking => "speaking",
            TurnState::Interrupted => "interrupted",
        };
        f.write_str(name)
    }
}

impl TurnState {
    /// Transitions allowed in the turn cycle (agent-initiated speech aside)
    pub fn can_transition(self, to: TurnState) -> bool {
        use TurnState::*;
        matches!(
            (self, to),
            (Listening, Transcribing)
                | (Transcribing, Reasoning)
                | (Transcribing, Listening)
                | (Reasoning, Speaking)
                | (Speaking, Listening)
                | (Transcribing, Interrupted)
                | (Reasoning, Interrupted)
                | (Speaking, Interrupted)
                | (Interrupted, Listening)
        )
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Illegal turn transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: TurnState,
    pub to: TurnState,
}

/// Holds the single current `TurnState` of a session.
///
/// Every change goes through `transition` (or `begin_agent_utterance`), is
/// published on a watch channel and reported as a `StateChanged` event.
pub struct TurnMachine {
    state: TurnState,
    tx: watch::Sender<TurnState>,
    events: EventSender,
}

impl TurnMachine {
    pub fn new(events: EventSender) -> (Self, watch::Receiver<TurnState>) {
        let (tx, rx) = watch::channel(TurnState::Listening);
        (
            Self {
                state: TurnState::Listening,
                tx,
                events,
            },
            rx,
        )
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn transition(&mut self, to: TurnState) -> Result<(), IllegalTransition> {
        if !self.state.can_transition(to) {
            return Err(IllegalTransition {
                from: self.state,
                to,
            });
        }
        self.apply(to);
        Ok(())
    }

    /// Listening -> Speaking, for speech the agent starts on its own (greeting)
    pub fn begin_agent_utterance(&mut self) -> Result<(), IllegalTransition> {
        if self.state != TurnState::Listening {
            return Err(IllegalTransition {
                from: self.state,
                to: TurnState::Speaking,
            });
        }
        self.apply(TurnState::Speaking);
        Ok(())
    }

    fn apply(&mut self, to: TurnState) {
        let from = self.state;
        self.state = to;
        debug!(
            "Session {} turn state: {} -> {}",
            self.events.session_id(),
            from,
            to
        );
        self.tx.send_replace(to);
        self.events.emit(SessionEventKind::StateChanged { from, to });
    }
}
