//! Serializable execution state that survives a handoff.
//!
//! `StateSnapshot` is the only value that crosses the process boundary during
//! a swap. It is serialized with bincode onto the handoff pipe by the exiting
//! process and decoded to completion by its replacement (see
//! [`crate::handoff`]).

use serde::{Deserialize, Serialize};

/// Tags for the application state machine.
///
/// `None` and `Error` are terminal-failure states and `Done` is
/// terminal-success; the runtime never dispatches those to a handler. The
/// remaining tags are resolved through the handler registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateTag {
    None,
    Init,
    ProcessLine,
    MutateLine,
    Done,
    Error,
}

impl StateTag {
    /// True for tags the runtime resolves itself instead of dispatching.
    pub fn is_terminal(self) -> bool {
        matches!(self, StateTag::None | StateTag::Done | StateTag::Error)
    }
}

/// Complete execution state transferred between generations.
///
/// Created empty at process start, populated by first-run initialization or
/// by decoding a handoff payload, mutated only by the runtime and the state
/// handlers, and serialized exactly once when a swap is triggered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// State the machine will dispatch next.
    pub current_state: StateTag,
    /// State that produced `current_state`.
    pub previous_state: StateTag,
    /// Successful handoffs since the very first launch. 0 = never swapped.
    pub generation: u32,
    /// Version string of the generation-0 binary. Write-once.
    pub initial_version: String,

    // Payload fields. The framework carries these across the wire but never
    // interprets them.
    /// Line of text currently being mutated.
    pub line_text: String,
    /// Mutations applied to the current line so far.
    pub line_count: u32,
    /// Mutations to apply per line.
    pub num_mutations: u32,
    /// Lines fully processed so far.
    pub lines_done: u32,
    /// Lines to process before the payload finishes. 0 = run until quit.
    pub max_lines: u32,
    /// Pacing delay for the process-line step, in milliseconds.
    pub step_delay_ms: u64,
}

impl StateSnapshot {
    /// Snapshot for a generation-0 launch.
    pub fn first_run(version: &str) -> Self {
        Self {
            current_state: StateTag::Init,
            previous_state: StateTag::None,
            generation: 0,
            initial_version: version.to_string(),
            line_text: String::new(),
            line_count: 0,
            num_mutations: 0,
            lines_done: 0,
            max_lines: 0,
            step_delay_ms: 1000,
        }
    }

    /// Snapshot substituted when a handoff payload cannot be decoded.
    ///
    /// The runtime treats `Error` as an ordinary terminal-failure state, so a
    /// corrupt payload surfaces as a nonzero exit rather than a crash.
    pub fn recovery_error() -> Self {
        Self {
            current_state: StateTag::Error,
            ..Self::first_run("")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated() -> StateSnapshot {
        StateSnapshot {
            current_state: StateTag::MutateLine,
            previous_state: StateTag::ProcessLine,
            generation: 7,
            initial_version: "0.1.0".to_string(),
            line_text: "the quick brown fox".to_string(),
            line_count: 3,
            num_mutations: 10,
            lines_done: 2,
            max_lines: 5,
            step_delay_ms: 250,
        }
    }

    #[test]
    fn bincode_roundtrip_preserves_every_field() {
        let snapshot = populated();

        let bytes = bincode::serialize(&snapshot).expect("serialize failed");
        let restored: StateSnapshot = bincode::deserialize(&bytes).expect("deserialize failed");

        assert_eq!(restored, snapshot);
    }

    #[test]
    fn first_run_starts_in_init_at_generation_zero() {
        let snapshot = StateSnapshot::first_run("0.2.0");

        assert_eq!(snapshot.current_state, StateTag::Init);
        assert_eq!(snapshot.previous_state, StateTag::None);
        assert_eq!(snapshot.generation, 0);
        assert_eq!(snapshot.initial_version, "0.2.0");
    }

    #[test]
    fn recovery_error_is_a_terminal_failure() {
        let snapshot = StateSnapshot::recovery_error();

        assert_eq!(snapshot.current_state, StateTag::Error);
        assert!(snapshot.current_state.is_terminal());
    }

    #[test]
    fn terminal_tags() {
        assert!(StateTag::None.is_terminal());
        assert!(StateTag::Done.is_terminal());
        assert!(StateTag::Error.is_terminal());
        assert!(!StateTag::Init.is_terminal());
        assert!(!StateTag::ProcessLine.is_terminal());
        assert!(!StateTag::MutateLine.is_terminal());
    }
}
