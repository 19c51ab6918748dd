use std::{
    fmt,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
pub enum DownloadState {
    Idle,
    Queued,
    Downloading,
    Paused,
    /// Waiting for connectivity (or a retry backoff) before continuing.
    PausedAwaitingConnection,
    Verifying,
    Completed,
    Failed,
}

impl DownloadState {
    pub const ALL: [Self; 8] = [
        Self::Idle,
        Self::Queued,
        Self::Downloading,
        Self::Paused,
        Self::PausedAwaitingConnection,
        Self::Verifying,
        Self::Completed,
        Self::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Queued => "QUEUED",
            Self::Downloading => "DOWNLOADING",
            Self::Paused => "PAUSED",
            Self::PausedAwaitingConnection => "PAUSED_AWAITING_CONNECTION",
            Self::Verifying => "VERIFYING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether a transfer or verification job may be running in this state.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Downloading | Self::Verifying)
    }

    /// The legal transition table. `Idle` is reachable from every state since
    /// it models cancellation and deletion.
    pub fn can_transition_to(self, to: Self) -> bool {
        use DownloadState::*;

        if to == Idle {
            return true;
        }

        match self {
            Idle => matches!(to, Queued | Completed | Failed),
            Queued => matches!(to, Downloading | Paused | Failed),
            Downloading => matches!(to, Paused | PausedAwaitingConnection | Verifying | Failed),
            Paused => matches!(to, Queued),
            PausedAwaitingConnection => matches!(to, Queued | Failed),
            Verifying => matches!(to, Completed | Failed),
            Completed | Failed => false,
        }
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Eq, PartialEq)]
#[error("Unknown download state: {0:?}")]
pub struct ParseStateError(pub String);

impl FromStr for DownloadState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL.iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ParseStateError(s.to_owned()))
    }
}

/// One committed state change. The textual form is
/// `<timestamp>|<from>-><to>`, which is what gets persisted.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Transition {
    pub timestamp_millis: u64,
    pub from: DownloadState,
    pub to: DownloadState,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}->{}", self.timestamp_millis, self.from, self.to)
    }
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum ParseTransitionError {
    #[error("Malformed transition record: {0:?}")]
    Malformed(String),
    #[error("Bad timestamp in transition record: {0:?}")]
    BadTimestamp(String),
    #[error(transparent)]
    BadState(#[from] ParseStateError),
}

impl FromStr for Transition {
    type Err = ParseTransitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (timestamp, states) = s.split_once('|')
            .ok_or_else(|| ParseTransitionError::Malformed(s.to_owned()))?;
        let (from, to) = states.split_once("->")
            .ok_or_else(|| ParseTransitionError::Malformed(s.to_owned()))?;

        Ok(Self {
            timestamp_millis: timestamp.parse()
                .map_err(|_| ParseTransitionError::BadTimestamp(timestamp.to_owned()))?,
            from: from.parse()?,
            to: to.parse()?,
        })
    }
}

/// Join transition records into the comma separated form used by the
/// checkpoint store.
pub fn format_history(history: &[Transition]) -> String {
    history.iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

pub fn parse_history(s: &str) -> Result<Vec<Transition>, ParseTransitionError> {
    s.split(',')
        .filter(|entry| !entry.is_empty())
        .map(str::parse)
        .collect()
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Owned state holder enforcing the transition table. Requests that are not
/// in the table are ignored with a warning so that racing callers cannot put
/// the machine into an inconsistent state.
#[derive(Debug)]
pub struct StateMachine {
    state: DownloadState,
    history: Vec<Transition>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new(DownloadState::Idle)
    }
}

impl StateMachine {
    pub fn new(state: DownloadState) -> Self {
        Self {
            state,
            history: vec![],
        }
    }

    /// Rebuild a machine from persisted state.
    pub fn with_history(state: DownloadState, history: Vec<Transition>) -> Self {
        Self {
            state,
            history,
        }
    }

    pub fn state(&self) -> DownloadState {
        self.state
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn can_transition_to(&self, to: DownloadState) -> bool {
        self.state.can_transition_to(to)
    }

    /// Attempt to move to `to`. Returns the committed transition or [`None`]
    /// if the request was illegal and therefore ignored.
    pub fn transition(&mut self, to: DownloadState) -> Option<Transition> {
        if !self.state.can_transition_to(to) {
            warn!("Ignoring illegal state transition: {} -> {}", self.state, to);
            return None;
        }

        let transition = Transition {
            timestamp_millis: now_millis(),
            from: self.state,
            to,
        };
        debug!("State transition: {}", transition);

        self.state = to;
        self.history.push(transition);

        Some(transition)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    use DownloadState::*;

    #[test]
    fn test_transition_table() {
        let legal = [
            (Idle, Queued),
            (Idle, Completed),
            (Queued, Downloading),
            (Queued, Paused),
            (Downloading, Paused),
            (Downloading, PausedAwaitingConnection),
            (Downloading, Verifying),
            (Paused, Queued),
            (PausedAwaitingConnection, Queued),
            (Verifying, Completed),
            (Verifying, Failed),
        ];
        for (from, to) in legal {
            assert!(from.can_transition_to(to), "{from} -> {to}");
        }

        for from in DownloadState::ALL {
            assert!(from.can_transition_to(Idle), "{from} -> IDLE");
        }

        let illegal = [
            (Idle, Downloading),
            (Idle, Verifying),
            (Queued, Verifying),
            (Paused, Downloading),
            (Paused, Verifying),
            (Completed, Queued),
            (Completed, Downloading),
            (Failed, Queued),
            (Verifying, Downloading),
            (PausedAwaitingConnection, Paused),
        ];
        for (from, to) in illegal {
            assert!(!from.can_transition_to(to), "{from} -> {to}");
        }
    }

    #[test]
    fn test_illegal_transition_is_noop() {
        for from in DownloadState::ALL {
            for to in DownloadState::ALL {
                let mut machine = StateMachine::new(from);
                let result = machine.transition(to);

                if from.can_transition_to(to) {
                    assert_matches!(result, Some(t) if t.from == from && t.to == to);
                    assert_eq!(machine.state(), to);
                    assert_eq!(machine.history().len(), 1);
                } else {
                    assert_eq!(result, None);
                    assert_eq!(machine.state(), from);
                    assert!(machine.history().is_empty());
                }
            }
        }
    }

    #[test]
    fn test_state_names() {
        for state in DownloadState::ALL {
            assert_eq!(state.as_str().parse::<DownloadState>(), Ok(state));
        }

        assert_matches!("bogus".parse::<DownloadState>(), Err(ParseStateError(s)) if s == "bogus");
    }

    #[test]
    fn test_history_format() {
        let history = vec![
            Transition { timestamp_millis: 100, from: Idle, to: Queued },
            Transition { timestamp_millis: 250, from: Queued, to: Downloading },
        ];

        let s = format_history(&history);
        assert_eq!(s, "100|IDLE->QUEUED,250|QUEUED->DOWNLOADING");
        assert_eq!(parse_history(&s), Ok(history));
        assert_eq!(parse_history(""), Ok(vec![]));

        assert_matches!(parse_history("100|IDLE"), Err(ParseTransitionError::Malformed(_)));
        assert_matches!(parse_history("x|IDLE->QUEUED"), Err(ParseTransitionError::BadTimestamp(_)));
        assert_matches!(parse_history("1|IDLE->NOPE"), Err(ParseTransitionError::BadState(_)));
    }
}
