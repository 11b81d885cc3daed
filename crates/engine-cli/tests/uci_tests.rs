//! End-to-end UCI protocol tests

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, Stdio};
use std::time::{Duration, Instant};

use assert_cmd::cargo::CommandCargoExt;
use assert_cmd::Command;
use predicates::prelude::*;

fn engine_cmd() -> Command {
    Command::cargo_bin("rxiangqi").expect("binary builds")
}

fn engine_raw() -> std::process::Command {
    std::process::Command::cargo_bin("rxiangqi").expect("binary builds")
}

#[test]
fn test_uci_handshake() {
    let mut cmd = engine_cmd();
    cmd.write_stdin("uci\nquit\n");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("id name rxiangqi"))
        .stdout(predicate::str::contains("option name Hash"))
        .stdout(predicate::str::contains("option name Threads"))
        .stdout(predicate::str::contains("uciok"));
}

#[test]
fn test_isready() {
    let mut cmd = engine_cmd();
    cmd.write_stdin("isready\nquit\n");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("readyok"));
}

#[test]
fn test_go_depth_emits_bestmove() {
    let mut cmd = engine_cmd();
    cmd.write_stdin("position startpos\ngo depth 2\nquit\n");
    cmd.assert().success().stdout(
        predicate::str::is_match(r"bestmove [a-i][0-9][a-i][0-9]").unwrap(),
    );
}

#[test]
fn test_perft_reference_counts() {
    let mut cmd = engine_cmd();
    cmd.write_stdin("position startpos\nperft 2\nquit\n");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Nodes searched: 1920"));
}

#[test]
fn test_position_with_moves_and_illegal_tail() {
    // The illegal third move stops the advance; the engine still plays
    let mut cmd = engine_cmd();
    cmd.write_stdin("position startpos moves b2e2 h9g7 a0a9\ngo depth 1\nquit\n");
    cmd.assert()
        .success()
        .stdout(predicate::str::is_match(r"bestmove [a-i][0-9][a-i][0-9]").unwrap());
}

#[test]
fn test_unknown_command_reported() {
    let mut cmd = engine_cmd();
    cmd.write_stdin("xyzzy\nquit\n");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Unknown command"));
}

#[test]
fn test_d_shows_startpos_fen() {
    let mut cmd = engine_cmd();
    cmd.write_stdin("d\nquit\n");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains(
            "rnbakabnr/9/1c5c1/p1p1p1p1p/9/9/P1P1P1P1P/1C5C1/9/RNBAKABNR w",
        ));
}

struct Session {
    child: Child,
    reader: BufReader<std::process::ChildStdout>,
}

impl Session {
    fn start() -> Session {
        let mut child = engine_raw()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("engine starts");
        let reader = BufReader::new(child.stdout.take().unwrap());
        Session { child, reader }
    }

    fn send(&mut self, line: &str) {
        let stdin = self.child.stdin.as_mut().unwrap();
        writeln!(stdin, "{line}").unwrap();
        stdin.flush().unwrap();
    }

    fn wait_for(&mut self, needle: &str, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        let mut line = String::new();
        while Instant::now() < deadline {
            line.clear();
            if self.reader.read_line(&mut line).unwrap_or(0) == 0 {
                return None;
            }
            if line.contains(needle) {
                return Some(line.clone());
            }
        }
        None
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[test]
fn test_stop_during_infinite_search() {
    let mut s = Session::start();
    s.send("uci");
    assert!(s.wait_for("uciok", Duration::from_secs(10)).is_some());
    s.send("position startpos");
    s.send("go infinite");
    std::thread::sleep(Duration::from_millis(100));
    s.send("stop");
    let bm = s
        .wait_for("bestmove", Duration::from_secs(10))
        .expect("bestmove after stop");
    // The reported move must be one of the 44 legal opening moves
    let m = bm
        .split_whitespace()
        .nth(1)
        .expect("bestmove carries a move");
    assert!(m.len() == 4, "move text {m}");
    s.send("quit");
}

#[test]
fn test_multithreaded_search_stays_sane() {
    // Four workers over the shared table must agree on a legal move
    let mut cmd = engine_cmd();
    cmd.write_stdin("setoption name Threads value 4\nposition startpos\ngo depth 3\nquit\n");
    cmd.assert()
        .success()
        .stdout(predicate::str::is_match(r"bestmove [a-i][0-9][a-i][0-9]").unwrap());
}

#[test]
fn test_ponderhit_releases_search() {
    let mut s = Session::start();
    s.send("position startpos");
    s.send("go ponder movetime 50");
    std::thread::sleep(Duration::from_millis(150));
    s.send("ponderhit");
    assert!(s
        .wait_for("bestmove", Duration::from_secs(10))
        .is_some());
    s.send("quit");
}
