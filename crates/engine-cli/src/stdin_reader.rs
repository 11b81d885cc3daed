//! Stdin reader thread
//!
//! Feeds lines through a channel so the command loop never blocks on
//! I/O while a search is running.

use std::io::BufRead;

use crossbeam_channel::{unbounded, Receiver};

pub fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = unbounded();
    std::thread::Builder::new()
        .name("stdin-reader".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(l) => {
                        if tx.send(l).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        })
        .expect("failed to spawn stdin reader");
    rx
}
