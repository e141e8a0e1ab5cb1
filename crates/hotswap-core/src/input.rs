//! Non-blocking console signal watching.
//!
//! While the state machine runs, stdin is switched into a mode where a read
//! returns immediately when no input is pending: non-canonical termios with
//! `VMIN = 0` on a tty (so single keypresses arrive without a newline), or
//! `O_NONBLOCK` on a pipe. Between state transitions the runtime drains
//! whatever is pending: `q` requests an immediate quit, `u` latches an
//! upgrade request until the machine reaches a safe state.

use std::io;

/// Result of polling the console between state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Nothing pending.
    None,
    /// Upgrade requested, possibly latched from an earlier poll.
    Upgrade,
    /// Quit requested. Always wins over a pending upgrade.
    Quit,
}

/// How the runtime observes out-of-band user signals.
///
/// Split out as a trait so the loop in [`crate::runtime`] can be driven by
/// scripted signals in tests.
pub trait SignalSource {
    /// Switch the underlying stream into non-blocking scanning mode.
    fn activate(&mut self) -> io::Result<()>;

    /// Drain pending input and report the strongest signal seen.
    fn poll(&mut self) -> Signal;

    /// Clear a latched upgrade request, once a swap has been handed out.
    fn take_upgrade_latch(&mut self);

    /// Restore the stream to its normal blocking mode. Must be idempotent.
    fn restore(&mut self);
}

#[cfg(unix)]
pub use tty::{read_line_blocking, TerminalSignalWatcher};

#[cfg(unix)]
mod tty {
    use super::{Signal, SignalSource};
    use std::io;
    use std::os::unix::io::RawFd;

    /// Stdin mode to reinstate when scanning stops.
    enum SavedMode {
        Termios(libc::termios),
        Flags(libc::c_int),
    }

    /// Edge-triggered watcher for the `u`/`q` control characters on stdin.
    pub struct TerminalSignalWatcher {
        fd: RawFd,
        saved: Option<SavedMode>,
        upgrade_latched: bool,
    }

    impl TerminalSignalWatcher {
        pub fn new() -> Self {
            Self {
                fd: libc::STDIN_FILENO,
                saved: None,
                upgrade_latched: false,
            }
        }

        /// Interpret a batch of drained bytes.
        ///
        /// `q` always wins, even over an upgrade latched in the same batch;
        /// unrelated characters are ignored and do not reset the latch.
        fn scan(&mut self, bytes: &[u8]) -> Signal {
            let mut quit = false;
            for &byte in bytes {
                match byte {
                    b'q' => quit = true,
                    b'u' => self.upgrade_latched = true,
                    _ => {}
                }
            }
            if quit {
                Signal::Quit
            } else if self.upgrade_latched {
                Signal::Upgrade
            } else {
                Signal::None
            }
        }
    }

    impl Default for TerminalSignalWatcher {
        fn default() -> Self {
            Self::new()
        }
    }

    impl SignalSource for TerminalSignalWatcher {
        fn activate(&mut self) -> io::Result<()> {
            if self.saved.is_some() {
                return Ok(());
            }
            if unsafe { libc::isatty(self.fd) } == 1 {
                let mut flags: libc::termios = unsafe { std::mem::zeroed() };
                if unsafe { libc::tcgetattr(self.fd, &mut flags) } < 0 {
                    return Err(io::Error::last_os_error());
                }
                let saved = flags;
                // Raw, zero-minimum reads: a poll with nothing pending
                // returns immediately instead of waiting for a full line.
                flags.c_lflag &= !libc::ICANON;
                flags.c_cc[libc::VMIN] = 0;
                flags.c_cc[libc::VTIME] = 0;
                if unsafe { libc::tcsetattr(self.fd, libc::TCSANOW, &flags) } < 0 {
                    return Err(io::Error::last_os_error());
                }
                self.saved = Some(SavedMode::Termios(saved));
            } else {
                // Not a terminal (e.g. a test harness pipe): O_NONBLOCK gives
                // the same scanning behavior.
                let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
                if flags < 0 {
                    return Err(io::Error::last_os_error());
                }
                if unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
                    return Err(io::Error::last_os_error());
                }
                self.saved = Some(SavedMode::Flags(flags));
            }
            Ok(())
        }

        fn poll(&mut self) -> Signal {
            let mut pending = Vec::new();
            let mut buf = [0u8; 64];
            loop {
                let n = unsafe {
                    libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                };
                if n <= 0 {
                    break;
                }
                pending.extend_from_slice(&buf[..n as usize]);
            }
            self.scan(&pending)
        }

        fn take_upgrade_latch(&mut self) {
            self.upgrade_latched = false;
        }

        fn restore(&mut self) {
            match self.saved.take() {
                Some(SavedMode::Termios(saved)) => unsafe {
                    libc::tcsetattr(self.fd, libc::TCSANOW, &saved);
                },
                Some(SavedMode::Flags(flags)) => unsafe {
                    libc::fcntl(self.fd, libc::F_SETFL, flags);
                },
                None => {}
            }
        }
    }

    impl Drop for TerminalSignalWatcher {
        fn drop(&mut self) {
            self.restore();
        }
    }

    /// Read one line from stdin in blocking mode.
    ///
    /// Saves the current stdin mode, switches to blocking single-byte reads,
    /// consumes bytes up to and including the newline, then reinstates the
    /// previous mode. Reading through the raw fd keeps look-ahead characters
    /// (a typed-ahead `u` or `q`) visible to the next watcher poll instead of
    /// stranding them in a userspace buffer.
    ///
    /// Returns `UnexpectedEof` if the stream is already closed, so a payload
    /// prompting in a loop cannot spin forever on a dead console.
    pub fn read_line_blocking() -> io::Result<String> {
        let fd = libc::STDIN_FILENO;
        if unsafe { libc::isatty(fd) } == 1 {
            let mut flags: libc::termios = unsafe { std::mem::zeroed() };
            if unsafe { libc::tcgetattr(fd, &mut flags) } < 0 {
                return Err(io::Error::last_os_error());
            }
            let saved = flags;
            flags.c_lflag &= !libc::ICANON;
            flags.c_cc[libc::VMIN] = 1;
            flags.c_cc[libc::VTIME] = 0;
            if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &flags) } < 0 {
                return Err(io::Error::last_os_error());
            }
            let result = read_until_newline(fd);
            unsafe { libc::tcsetattr(fd, libc::TCSANOW, &saved) };
            result
        } else {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
            if flags < 0 {
                return Err(io::Error::last_os_error());
            }
            if unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) } < 0 {
                return Err(io::Error::last_os_error());
            }
            let result = read_until_newline(fd);
            unsafe { libc::fcntl(fd, libc::F_SETFL, flags) };
            result
        }
    }

    fn read_until_newline(fd: RawFd) -> io::Result<String> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = unsafe { libc::read(fd, byte.as_mut_ptr() as *mut libc::c_void, 1) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if n == 0 {
                if line.is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "console input closed",
                    ));
                }
                break;
            }
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn quit_wins_over_upgrade_in_the_same_batch() {
            let mut watcher = TerminalSignalWatcher::new();
            assert_eq!(watcher.scan(b"uq"), Signal::Quit);
        }

        #[test]
        fn quit_wins_even_when_upgrade_was_latched_earlier() {
            let mut watcher = TerminalSignalWatcher::new();
            assert_eq!(watcher.scan(b"u"), Signal::Upgrade);
            assert_eq!(watcher.scan(b"q"), Signal::Quit);
        }

        #[test]
        fn upgrade_latch_persists_across_polls() {
            let mut watcher = TerminalSignalWatcher::new();
            assert_eq!(watcher.scan(b"u"), Signal::Upgrade);
            assert_eq!(watcher.scan(b""), Signal::Upgrade);
            assert_eq!(watcher.scan(b"xyz"), Signal::Upgrade);
        }

        #[test]
        fn unrelated_characters_are_ignored() {
            let mut watcher = TerminalSignalWatcher::new();
            assert_eq!(watcher.scan(b"hello"), Signal::None);
            assert_eq!(watcher.scan(b""), Signal::None);
        }

        #[test]
        fn take_upgrade_latch_clears_the_latch() {
            let mut watcher = TerminalSignalWatcher::new();
            assert_eq!(watcher.scan(b"u"), Signal::Upgrade);
            watcher.take_upgrade_latch();
            assert_eq!(watcher.scan(b""), Signal::None);
        }
    }
}
