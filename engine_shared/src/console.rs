//! Console input plumbing shared by the host and client binaries.
//!
//! Lines are read on a plain thread (stdin is blocking) and forwarded to the
//! tick loop over a bounded channel. Blank lines are skipped.

use std::io::{BufRead, Write};
use std::thread::JoinHandle;

use tokio::sync::mpsc;

/// Forwards trimmed, non-empty lines from `input` until end of input, a read
/// error, or the receiver going away. Writes a `] ` prompt before each read.
pub fn forward_lines(mut input: impl BufRead, mut prompt: impl Write, tx: &mpsc::Sender<String>) {
    loop {
        let _ = write!(prompt, "] ");
        let _ = prompt.flush();
        let mut line = String::new();
        // Ok(0) is end of input.
        if matches!(input.read_line(&mut line), Ok(0) | Err(_)) {
            break;
        }
        let line = line.trim();
        if !line.is_empty() && tx.blocking_send(line.to_string()).is_err() {
            break;
        }
    }
}

/// Spawns the stdin reader thread.
pub fn spawn_stdin_reader(tx: mpsc::Sender<String>) -> JoinHandle<()> {
    std::thread::spawn(move || forward_lines(std::io::stdin().lock(), std::io::stdout(), &tx))
}
