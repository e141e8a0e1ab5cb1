//! Cooperative state-machine runtime with deferred swap decisions.
//!
//! The runtime repeatedly dispatches the snapshot's current state to a
//! registered handler, then consults the signal source exactly once per
//! completed transition - never mid-transition, so a swap can never observe
//! partially mutated payload state.

use std::collections::{HashMap, HashSet};

use crate::input::{Signal, SignalSource};
use crate::snapshot::{StateSnapshot, StateTag};

/// Terminal result of a runtime loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The payload reached `Done`, or the user quit.
    Success,
    /// A terminal-failure state (`None`, `Error`) or an unregistered tag.
    Failure,
    /// An upgrade was requested and the machine is parked in a safe state.
    SwapRequested,
}

/// One step of application payload logic.
pub trait StateHandler {
    /// Execute the state against the snapshot and return the next tag.
    fn step(&mut self, snapshot: &mut StateSnapshot) -> StateTag;
}

/// Drives registered state handlers and merges in console signals.
pub struct StateMachineRuntime<S: SignalSource> {
    handlers: HashMap<StateTag, Box<dyn StateHandler>>,
    safe_states: HashSet<StateTag>,
    signals: S,
}

impl<S: SignalSource> StateMachineRuntime<S> {
    pub fn new(signals: S) -> Self {
        Self {
            handlers: HashMap::new(),
            safe_states: HashSet::new(),
            signals,
        }
    }

    /// Register the handler dispatched for `tag`.
    pub fn register(&mut self, tag: StateTag, handler: Box<dyn StateHandler>) {
        self.handlers.insert(tag, handler);
    }

    /// Declare `tag` safe to interrupt for a handoff.
    pub fn declare_safe(&mut self, tag: StateTag) {
        self.safe_states.insert(tag);
    }

    /// Run the machine until a terminal outcome.
    ///
    /// The signal source is activated for the duration of the loop and
    /// restored on every exit path, so a later interactive prompt (an INIT
    /// state asking for input, or whatever runs after us) sees a normally
    /// behaving stdin.
    pub fn run(&mut self, snapshot: &mut StateSnapshot) -> Outcome {
        log::info!("running state machine from {:?}", snapshot.current_state);
        if let Err(e) = self.signals.activate() {
            log::warn!("could not switch console to scanning mode: {}", e);
        }
        let outcome = self.run_loop(snapshot);
        self.signals.restore();
        log::info!("state machine stopped: {:?}", outcome);
        outcome
    }

    fn run_loop(&mut self, snapshot: &mut StateSnapshot) -> Outcome {
        loop {
            let next = match snapshot.current_state {
                StateTag::Done => return Outcome::Success,
                StateTag::None | StateTag::Error => return Outcome::Failure,
                tag => match self.handlers.get_mut(&tag) {
                    Some(handler) => handler.step(snapshot),
                    None => {
                        log::error!("no handler registered for state {:?}", tag);
                        return Outcome::Failure;
                    }
                },
            };
            snapshot.previous_state = snapshot.current_state;
            snapshot.current_state = next;

            // Consulted exactly once per completed transition.
            match self.signals.poll() {
                Signal::Quit => return Outcome::Success,
                Signal::Upgrade if self.safe_states.contains(&snapshot.current_state) => {
                    // Consume the latch so a failed handoff does not retrigger
                    // without a fresh request.
                    self.signals.take_upgrade_latch();
                    return Outcome::SwapRequested;
                }
                Signal::Upgrade | Signal::None => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;

    /// Signal source fed from a fixed script; records lifecycle calls.
    struct ScriptedSignals {
        script: VecDeque<Signal>,
        activated: bool,
        restored: bool,
        latches_taken: usize,
    }

    impl ScriptedSignals {
        fn new(script: &[Signal]) -> Self {
            Self {
                script: script.iter().copied().collect(),
                activated: false,
                restored: false,
                latches_taken: 0,
            }
        }
    }

    impl SignalSource for ScriptedSignals {
        fn activate(&mut self) -> io::Result<()> {
            self.activated = true;
            Ok(())
        }

        fn poll(&mut self) -> Signal {
            self.script.pop_front().unwrap_or(Signal::None)
        }

        fn take_upgrade_latch(&mut self) {
            self.latches_taken += 1;
        }

        fn restore(&mut self) {
            self.restored = true;
        }
    }

    struct FnHandler<F: FnMut(&mut StateSnapshot) -> StateTag>(F);

    impl<F: FnMut(&mut StateSnapshot) -> StateTag> StateHandler for FnHandler<F> {
        fn step(&mut self, snapshot: &mut StateSnapshot) -> StateTag {
            (self.0)(snapshot)
        }
    }

    fn runtime(script: &[Signal]) -> StateMachineRuntime<ScriptedSignals> {
        StateMachineRuntime::new(ScriptedSignals::new(script))
    }

    #[test]
    fn done_yields_success() {
        let mut rt = runtime(&[]);
        let mut snapshot = StateSnapshot::first_run("t");
        snapshot.current_state = StateTag::Done;

        assert_eq!(rt.run(&mut snapshot), Outcome::Success);
    }

    #[test]
    fn error_and_none_yield_failure() {
        for tag in [StateTag::Error, StateTag::None] {
            let mut rt = runtime(&[]);
            let mut snapshot = StateSnapshot::first_run("t");
            snapshot.current_state = tag;

            assert_eq!(rt.run(&mut snapshot), Outcome::Failure);
        }
    }

    #[test]
    fn unregistered_tag_yields_failure() {
        let mut rt = runtime(&[]);
        let mut snapshot = StateSnapshot::first_run("t");

        // Init has no handler registered here.
        assert_eq!(rt.run(&mut snapshot), Outcome::Failure);
    }

    #[test]
    fn transitions_record_previous_state() {
        let mut rt = runtime(&[]);
        rt.register(StateTag::Init, Box::new(FnHandler(|_| StateTag::Done)));
        let mut snapshot = StateSnapshot::first_run("t");

        assert_eq!(rt.run(&mut snapshot), Outcome::Success);
        assert_eq!(snapshot.previous_state, StateTag::Init);
        assert_eq!(snapshot.current_state, StateTag::Done);
    }

    #[test]
    fn quit_overrides_in_progress_work() {
        let mut rt = runtime(&[Signal::Quit]);
        // Handler would loop forever without the signal.
        rt.register(StateTag::Init, Box::new(FnHandler(|_| StateTag::Init)));
        let mut snapshot = StateSnapshot::first_run("t");

        assert_eq!(rt.run(&mut snapshot), Outcome::Success);
    }

    #[test]
    fn upgrade_is_deferred_until_a_safe_state() {
        // Machine cycles Init -> MutateLine -> MutateLine -> ProcessLine.
        // Only ProcessLine is safe; the latched upgrade must ride along
        // through the unsafe states.
        let mut rt = runtime(&[Signal::Upgrade, Signal::Upgrade, Signal::Upgrade]);
        rt.register(StateTag::Init, Box::new(FnHandler(|_| StateTag::MutateLine)));
        let mut mutate_steps = 0;
        rt.register(
            StateTag::MutateLine,
            Box::new(FnHandler(move |_| {
                mutate_steps += 1;
                if mutate_steps < 2 {
                    StateTag::MutateLine
                } else {
                    StateTag::ProcessLine
                }
            })),
        );
        rt.declare_safe(StateTag::ProcessLine);
        let mut snapshot = StateSnapshot::first_run("t");

        assert_eq!(rt.run(&mut snapshot), Outcome::SwapRequested);
        assert_eq!(snapshot.current_state, StateTag::ProcessLine);
        assert_eq!(snapshot.previous_state, StateTag::MutateLine);
        assert_eq!(rt.signals.latches_taken, 1);
    }

    #[test]
    fn quit_wins_over_a_pending_upgrade() {
        let mut rt = runtime(&[Signal::Upgrade, Signal::Quit]);
        rt.register(StateTag::Init, Box::new(FnHandler(|_| StateTag::MutateLine)));
        rt.register(
            StateTag::MutateLine,
            Box::new(FnHandler(|_| StateTag::MutateLine)),
        );
        // ProcessLine would be the safe state, but the machine never gets
        // there before the quit arrives.
        rt.declare_safe(StateTag::ProcessLine);
        let mut snapshot = StateSnapshot::first_run("t");

        assert_eq!(rt.run(&mut snapshot), Outcome::Success);
        assert_eq!(rt.signals.latches_taken, 0);
    }

    #[test]
    fn signal_source_is_restored_on_every_exit_path() {
        for (tag, script) in [
            (StateTag::Done, vec![]),
            (StateTag::Error, vec![]),
            (StateTag::Init, vec![Signal::Quit]),
        ] {
            let mut rt = runtime(&script);
            rt.register(StateTag::Init, Box::new(FnHandler(|_| StateTag::Init)));
            let mut snapshot = StateSnapshot::first_run("t");
            snapshot.current_state = tag;

            rt.run(&mut snapshot);
            assert!(rt.signals.activated);
            assert!(rt.signals.restored);
        }
    }
}
