//! hotswap-app: payload states and program entrypoint.
//!
//! Wires the demo payload into the swap framework: resume-or-initialize,
//! run the state machine, and either exit or hand the snapshot to the next
//! generation of the binary.

mod states;

use std::env;
use std::io::{self, Write};

use anyhow::Context;

use hotswap_core::handoff;
use hotswap_core::{Outcome, StateMachineRuntime, StateSnapshot, StateTag, TerminalSignalWatcher};

pub use states::{InitState, MutateLineState, ProcessLineState};

/// Version compiled into this binary. Becomes `initial_version` at
/// generation 0 and travels unchanged through every later handoff.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Program entrypoint. Returns the process exit code.
pub fn run() -> i32 {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match try_run() {
        Ok(code) => {
            log::info!("terminating with code {}", code);
            code
        }
        Err(e) => {
            log::error!("fatal: {:#}", e);
            1
        }
    }
}

fn try_run() -> anyhow::Result<i32> {
    let args: Vec<String> = env::args().collect();
    let executable = env::current_exe().context("could not resolve own executable path")?;

    let mut snapshot = match handoff::resume_if_applicable(&args) {
        Some(snapshot) => {
            log::info!(
                "this is generation {} running {} software (initial version {})",
                snapshot.generation,
                VERSION,
                snapshot.initial_version
            );
            snapshot
        }
        None => {
            log::info!("initial call");
            first_run(&args)
        }
    };

    let mut runtime = StateMachineRuntime::new(TerminalSignalWatcher::new());
    runtime.register(StateTag::Init, Box::new(InitState));
    runtime.register(StateTag::ProcessLine, Box::new(ProcessLineState));
    runtime.register(StateTag::MutateLine, Box::new(MutateLineState));
    // States at which a swap may interrupt us: never mid-mutation.
    runtime.declare_safe(StateTag::Init);
    runtime.declare_safe(StateTag::ProcessLine);

    loop {
        match runtime.run(&mut snapshot) {
            Outcome::Success => return Ok(0),
            Outcome::Failure => return Ok(1),
            Outcome::SwapRequested => {
                let _ = io::stdout().flush();
                // On success the exec replaces this image and we never get
                // here. On failure we still hold the authoritative snapshot,
                // so keep serving as the current generation; the next swap
                // needs a fresh request.
                if let Err(e) = handoff::handoff(&executable, &snapshot) {
                    log::error!("swap failed: {}; continuing on current generation", e);
                }
            }
        }
    }
}

/// Build the generation-0 snapshot from the payload's positional knobs:
/// `[mutations-per-line] [line-budget] [step-delay-ms]`.
fn first_run(args: &[String]) -> StateSnapshot {
    let mut snapshot = StateSnapshot::first_run(VERSION);
    if let Some(n) = args.get(1).and_then(|a| a.parse().ok()) {
        snapshot.num_mutations = n;
    }
    if let Some(n) = args.get(2).and_then(|a| a.parse().ok()) {
        snapshot.max_lines = n;
    }
    if let Some(n) = args.get(3).and_then(|a| a.parse().ok()) {
        snapshot.step_delay_ms = n;
    }
    snapshot
}
