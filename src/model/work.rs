//! Work items, their identifiers, and the delivery state machine.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// One admitted capture tracked by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Assigned by the store in creation order. Never reused.
    pub id: WorkId,

    /// Where the captured image lives. Owned by the pipeline until the
    /// cleanup sweep removes it.
    pub artifact_ref: ArtifactRef,

    /// Current lifecycle state.
    pub state: State,

    /// Number of delivery attempts so far, including one interrupted by a crash.
    pub attempt_count: u32,

    /// Last failure description, if any.
    pub last_error: Option<String>,

    /// Response payload once the item is `Done`.
    pub result: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Newtype for work item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkId(pub i64);

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for WorkId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<i64>()
            .map(WorkId)
            .map_err(|_| Error::Other(format!("invalid work item id: {s}")))
    }
}

/// Opaque locator for a captured artifact (a file path for the shipped adapters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    pub fn new(locator: impl Into<String>) -> Self {
        Self(locator.into())
    }

    pub fn from_path(path: &Path) -> Self {
        Self(path.to_string_lossy().into_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }
}

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Admitted, waiting for a worker.
    Pending,
    /// Claimed by exactly one worker, delivery in progress.
    InFlight,
    /// Delivered; result stored. Terminal.
    Done,
    /// Transient failure, waiting for its backoff to elapse.
    FailedRetryable,
    /// Rejected or out of attempts. Terminal.
    FailedTerminal,
}

impl State {
    pub const ALL: [State; 5] = [
        State::Pending,
        State::InFlight,
        State::Done,
        State::FailedRetryable,
        State::FailedTerminal,
    ];

    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;
        matches!(
            (self, to),
            (Pending, InFlight)
                | (FailedRetryable, InFlight) // retry
                | (InFlight, Done)
                | (InFlight, FailedRetryable)
                | (InFlight, FailedTerminal)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Done | State::FailedTerminal)
    }

    /// Is this item waiting for delivery (belongs in the queue)?
    pub fn is_deliverable(self) -> bool {
        matches!(self, State::Pending | State::FailedRetryable)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Pending => "pending",
            State::InFlight => "in_flight",
            State::Done => "done",
            State::FailedRetryable => "failed_retryable",
            State::FailedTerminal => "failed_terminal",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(State::Pending),
            "in_flight" => Ok(State::InFlight),
            "done" => Ok(State::Done),
            "failed_retryable" => Ok(State::FailedRetryable),
            "failed_terminal" => Ok(State::FailedTerminal),
            _ => Err(Error::Other(format!("unknown state: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Updates
// ---------------------------------------------------------------------------

/// A new item as produced by capture admission, before the store assigns an id.
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub artifact_ref: ArtifactRef,
    pub created_at: DateTime<Utc>,
}

impl NewWorkItem {
    pub fn new(artifact_ref: ArtifactRef) -> Self {
        Self {
            artifact_ref,
            created_at: Utc::now(),
        }
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }
}

/// The target of a guarded state transition.
///
/// `last_error` and `result` are only written when `Some`; `None` keeps the
/// stored value.
#[derive(Debug, Clone)]
pub struct StateUpdate {
    pub to: State,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub result: Option<String>,
}

impl StateUpdate {
    /// Claim an item for delivery, counting the attempt up front.
    pub fn claim(item: &WorkItem) -> Self {
        Self {
            to: State::InFlight,
            attempt_count: item.attempt_count + 1,
            last_error: None,
            result: None,
        }
    }

    pub fn done(item: &WorkItem, result: String) -> Self {
        Self {
            to: State::Done,
            attempt_count: item.attempt_count,
            last_error: None,
            result: Some(result),
        }
    }

    pub fn failed(item: &WorkItem, to: State, error: impl Into<String>) -> Self {
        Self {
            to,
            attempt_count: item.attempt_count,
            last_error: Some(error.into()),
            result: None,
        }
    }
}

/// Prompt sent alongside every artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptConfig {
    pub model: String,
    pub prompt: String,
}

pub const DEFAULT_MODEL: &str = "gpt-5";

pub const DEFAULT_PROMPT: &str = "The image contains a single question, either multiple-choice or numeric. \
Reason briefly, then answer on its own line as <answer>X</answer>, where X is the option letter \
for multiple-choice or the final value for numeric questions. Also emit one line <type>T</type> \
with T one of MCQ, NUM, OTHER. Plain text only.";

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            prompt: DEFAULT_PROMPT.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_forward_transitions_are_allowed() {
        use State::*;
        let allowed = [
            (Pending, InFlight),
            (FailedRetryable, InFlight),
            (InFlight, Done),
            (InFlight, FailedRetryable),
            (InFlight, FailedTerminal),
        ];
        for from in State::ALL {
            for to in State::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn state_round_trips_through_its_column_name() {
        for state in State::ALL {
            assert_eq!(state.as_str().parse::<State>().unwrap(), state);
        }
        assert!("claimed".parse::<State>().is_err());
    }

    #[test]
    fn claim_counts_the_attempt() {
        let now = Utc::now();
        let item = WorkItem {
            id: WorkId(7),
            artifact_ref: ArtifactRef::new("/tmp/a.png"),
            state: State::FailedRetryable,
            attempt_count: 2,
            last_error: Some("timeout".into()),
            result: None,
            created_at: now,
            updated_at: now,
        };
        let update = StateUpdate::claim(&item);
        assert_eq!(update.to, State::InFlight);
        assert_eq!(update.attempt_count, 3);
        assert!(update.last_error.is_none());
    }
}
