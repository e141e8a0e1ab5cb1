//! Demo payload: mutate a user-provided line of text.
//!
//! These are the per-release states the swap framework drives. INIT asks the
//! user for a line, PROCESS_LINE echoes it with a pacing delay and decides
//! where to go next, MUTATE_LINE randomly rewrites one character. The
//! framework treats all of this as opaque; it only sees the returned tags.

use std::io::{self, Write};
use std::thread;
use std::time::Duration;

use rand::Rng;

use hotswap_core::input;
use hotswap_core::{StateHandler, StateSnapshot, StateTag};

/// Characters a mutation may substitute in.
const MUTATION_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Prompts for a fresh line of text to mutate.
pub struct InitState;

impl StateHandler for InitState {
    fn step(&mut self, snapshot: &mut StateSnapshot) -> StateTag {
        println!("Please provide a line of text for me to mutate");
        let _ = io::stdout().flush();
        let line = match input::read_line_blocking() {
            Ok(line) => line,
            Err(e) => {
                log::error!("could not read a line from the console: {}", e);
                return StateTag::Error;
            }
        };
        println!("Thanks!");
        let _ = io::stdout().flush();
        snapshot.line_text = line;
        snapshot.line_count = 0;
        StateTag::ProcessLine
    }
}

/// Echoes the current line and decides whether to keep mutating it.
pub struct ProcessLineState;

impl StateHandler for ProcessLineState {
    fn step(&mut self, snapshot: &mut StateSnapshot) -> StateTag {
        println!("{} mutations: {}", snapshot.line_count, snapshot.line_text);
        let _ = io::stdout().flush();
        snapshot.line_count += 1;
        thread::sleep(Duration::from_millis(snapshot.step_delay_ms));

        if snapshot.line_count >= snapshot.num_mutations {
            // Line finished. Either the whole run is done, or we go back
            // for another line of input.
            snapshot.lines_done += 1;
            if snapshot.max_lines > 0 && snapshot.lines_done >= snapshot.max_lines {
                StateTag::Done
            } else {
                StateTag::Init
            }
        } else {
            StateTag::MutateLine
        }
    }
}

/// Randomly rewrites one character of the current line.
pub struct MutateLineState;

impl StateHandler for MutateLineState {
    fn step(&mut self, snapshot: &mut StateSnapshot) -> StateTag {
        let mut bytes = snapshot.line_text.clone().into_bytes();
        if !bytes.is_empty() {
            let mut rng = rand::thread_rng();
            let target = rng.gen_range(0..bytes.len());
            bytes[target] = MUTATION_CHARS[rng.gen_range(0..MUTATION_CHARS.len())];
            // Byte-level substitution can break a multi-byte character;
            // lossy conversion keeps the line valid.
            snapshot.line_text = String::from_utf8_lossy(&bytes).into_owned();
        }
        StateTag::ProcessLine
    }
}
