//! Engine session and command dispatch

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use anyhow::{Context, Result};

use engine_core::eval::{Evaluator, MaterialEvaluator};
use engine_core::movegen;
use engine_core::position::{Position, START_FEN};
use engine_core::search::{
    select_best_thread, LimitsType, SearchManager, ThreadPool, ThreadResult, TimeOptions,
    TranspositionTable, Worker,
};
use engine_core::types::{Move, VALUE_INFINITE};
use engine_core::uci;

const ENGINE_NAME: &str = "rxiangqi";
const ENGINE_AUTHOR: &str = "the rxiangqi developers";

/// Positions exercised by `bench`
const BENCH_FENS: &[&str] = &[
    START_FEN,
    "r1bakabnr/9/1cn4c1/p1p1p1p1p/9/9/P1P1P1P1P/1C2C1N2/9/RNBAKAB1R w",
    "2baka3/9/c3b3c/p3p3p/2p3p2/9/P1P1P1P1P/4B4/4A4/2BAK2R1 w",
    "4k4/9/9/9/9/9/9/4p4/2r6/3K5 w",
    "1rbaka3/9/2n1b1c2/p1p1p3p/6p2/2P6/P3P1P1P/2N1C4/9/1RBAKABN1 b",
];
const BENCH_DEPTH: i32 = 8;

#[derive(Clone)]
struct Options {
    hash_mb: usize,
    threads: usize,
    multi_pv: usize,
    move_overhead: i64,
    nodestime: i64,
    ponder: bool,
    show_wdl: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            hash_mb: 16,
            threads: 1,
            multi_pv: 1,
            move_overhead: 10,
            nodestime: 0,
            ponder: false,
            show_wdl: false,
        }
    }
}

pub struct Engine {
    pos: Position,
    tt: Arc<TranspositionTable>,
    evaluator: Arc<dyn Evaluator>,
    pool: Arc<ThreadPool>,
    main_worker: Arc<Mutex<Worker>>,

    stop: Arc<AtomicBool>,
    aborted: Arc<AtomicBool>,
    increase_depth: Arc<AtomicBool>,
    ponder_flag: Arc<AtomicBool>,
    stop_on_ponderhit: Arc<AtomicBool>,

    search_handle: Option<JoinHandle<()>>,
    options: Options,
}

impl Engine {
    pub fn new() -> Result<Engine> {
        let options = Options::default();
        let stop = Arc::new(AtomicBool::new(false));
        let aborted = Arc::new(AtomicBool::new(false));
        let increase_depth = Arc::new(AtomicBool::new(true));
        let ponder_flag = Arc::new(AtomicBool::new(false));
        let stop_on_ponderhit = Arc::new(AtomicBool::new(false));
        let evaluator: Arc<dyn Evaluator> = Arc::new(MaterialEvaluator);

        let tt = Arc::new(TranspositionTable::new(options.hash_mb));
        let pool = Arc::new(ThreadPool::new(
            options.threads.saturating_sub(1),
            Arc::clone(&tt),
            Arc::clone(&evaluator),
            Arc::clone(&stop),
            Arc::clone(&aborted),
            Arc::clone(&increase_depth),
        ));
        let main_worker = Arc::new(Mutex::new(Self::build_main_worker(
            &tt,
            &evaluator,
            &stop,
            &aborted,
            &increase_depth,
            &ponder_flag,
            &stop_on_ponderhit,
        )));

        Ok(Engine {
            pos: Position::startpos(),
            tt,
            evaluator,
            pool,
            main_worker,
            stop,
            aborted,
            increase_depth,
            ponder_flag,
            stop_on_ponderhit,
            search_handle: None,
            options,
        })
    }

    fn build_main_worker(
        tt: &Arc<TranspositionTable>,
        evaluator: &Arc<dyn Evaluator>,
        stop: &Arc<AtomicBool>,
        aborted: &Arc<AtomicBool>,
        increase_depth: &Arc<AtomicBool>,
        ponder_flag: &Arc<AtomicBool>,
        stop_on_ponderhit: &Arc<AtomicBool>,
    ) -> Worker {
        let mut w = Worker::new(
            Arc::clone(tt),
            Arc::clone(evaluator),
            Arc::clone(stop),
            Arc::clone(aborted),
            Arc::clone(increase_depth),
            0,
        );
        w.manager = Some(SearchManager::new(
            Arc::clone(ponder_flag),
            Arc::clone(stop_on_ponderhit),
        ));
        w
    }

    /// Tear down and recreate the table and the workers after a Hash
    /// or Threads change.
    fn rebuild(&mut self) {
        self.stop_search_and_join();
        self.tt = Arc::new(TranspositionTable::new(self.options.hash_mb));
        self.pool = Arc::new(ThreadPool::new(
            self.options.threads.saturating_sub(1),
            Arc::clone(&self.tt),
            Arc::clone(&self.evaluator),
            Arc::clone(&self.stop),
            Arc::clone(&self.aborted),
            Arc::clone(&self.increase_depth),
        ));
        self.main_worker = Arc::new(Mutex::new(Self::build_main_worker(
            &self.tt,
            &self.evaluator,
            &self.stop,
            &self.aborted,
            &self.increase_depth,
            &self.ponder_flag,
            &self.stop_on_ponderhit,
        )));
    }

    /// Dispatch one command line. Returns false on `quit`.
    pub fn handle_command(&mut self, line: &str) -> Result<bool> {
        let mut tokens = line.split_whitespace();
        let Some(cmd) = tokens.next() else {
            return Ok(true);
        };
        let rest: Vec<&str> = tokens.collect();

        match cmd {
            "uci" => self.cmd_uci(),
            "isready" => println!("readyok"),
            "ucinewgame" => self.cmd_new_game(),
            "setoption" => self.cmd_setoption(&rest),
            "position" => self.cmd_position(&rest)?,
            "go" => self.cmd_go(&rest),
            "stop" => {
                self.stop.store(true, Ordering::Release);
            }
            "ponderhit" => {
                self.ponder_flag.store(false, Ordering::Release);
                if self.stop_on_ponderhit.load(Ordering::Relaxed) {
                    self.stop.store(true, Ordering::Release);
                }
            }
            "quit" => return Ok(false),
            "d" => {
                self.stop_search_and_join();
                println!("{}", self.pos);
            }
            "eval" => self.cmd_eval(),
            "flip" => {
                self.stop_search_and_join();
                self.pos = self.pos.flip();
            }
            "perft" => {
                if let Some(d) = rest.first().and_then(|t| t.parse::<u32>().ok()) {
                    self.cmd_perft(d);
                }
            }
            "bench" => self.bench(),
            "compiler" => {
                println!(
                    "{} {} (rustc, {} profile)",
                    ENGINE_NAME,
                    env!("CARGO_PKG_VERSION"),
                    if cfg!(debug_assertions) { "debug" } else { "release" }
                );
            }
            _ => println!("Unknown command: '{line}'. Type help for more information."),
        }
        Ok(true)
    }

    fn cmd_uci(&self) {
        println!("id name {} {}", ENGINE_NAME, env!("CARGO_PKG_VERSION"));
        println!("id author {ENGINE_AUTHOR}");
        println!("option name Hash type spin default 16 min 1 max 1048576");
        println!("option name Threads type spin default 1 min 1 max 512");
        println!("option name MultiPV type spin default 1 min 1 max 128");
        println!("option name Move Overhead type spin default 10 min 0 max 5000");
        println!("option name nodestime type spin default 0 min 0 max 10000");
        println!("option name Ponder type check default false");
        println!("option name UCI_ShowWDL type check default false");
        println!("uciok");
    }

    fn cmd_new_game(&mut self) {
        self.stop_search_and_join();
        self.tt.clear();
        self.pool.clear();
        let mut w = self.main_worker.lock().unwrap();
        w.clear();
        if let Some(mgr) = w.manager.as_mut() {
            mgr.tm.clear();
            mgr.best_previous_score = VALUE_INFINITE;
            mgr.best_previous_average_score = VALUE_INFINITE;
        }
        drop(w);
        self.pos = Position::startpos();
    }

    fn cmd_setoption(&mut self, rest: &[&str]) {
        // setoption name <name with spaces> value <value>
        let mut name_parts = Vec::new();
        let mut value_parts = Vec::new();
        let mut in_name = false;
        let mut in_value = false;
        for t in rest {
            match *t {
                "name" => {
                    in_name = true;
                    in_value = false;
                }
                "value" => {
                    in_value = true;
                    in_name = false;
                }
                _ => {
                    if in_value {
                        value_parts.push(*t);
                    } else if in_name {
                        name_parts.push(*t);
                    }
                }
            }
        }
        let name = name_parts.join(" ");
        let value = value_parts.join(" ");

        match name.as_str() {
            "Hash" => {
                if let Ok(mb) = value.parse::<usize>() {
                    self.options.hash_mb = mb.clamp(1, 1 << 20);
                    self.rebuild();
                }
            }
            "Threads" => {
                if let Ok(n) = value.parse::<usize>() {
                    self.options.threads = n.clamp(1, 512);
                    self.rebuild();
                }
            }
            "MultiPV" => {
                if let Ok(n) = value.parse::<usize>() {
                    self.options.multi_pv = n.clamp(1, 128);
                }
            }
            "Move Overhead" => {
                if let Ok(n) = value.parse::<i64>() {
                    self.options.move_overhead = n.clamp(0, 5000);
                }
            }
            "nodestime" => {
                if let Ok(n) = value.parse::<i64>() {
                    self.options.nodestime = n.clamp(0, 10000);
                }
            }
            "Ponder" => self.options.ponder = value.eq_ignore_ascii_case("true"),
            "UCI_ShowWDL" => self.options.show_wdl = value.eq_ignore_ascii_case("true"),
            _ => println!("No such option: {name}"),
        }
    }

    fn cmd_position(&mut self, rest: &[&str]) -> Result<()> {
        self.stop_search_and_join();

        let mut it = rest.iter().peekable();
        let pos = match it.next() {
            Some(&"startpos") => Position::startpos(),
            Some(&"fen") => {
                let mut fen_parts = Vec::new();
                while let Some(&&t) = it.peek() {
                    if t == "moves" {
                        break;
                    }
                    fen_parts.push(t);
                    it.next();
                }
                Position::from_fen(&fen_parts.join(" ")).context("parsing fen")?
            }
            _ => return Ok(()),
        };

        self.pos = pos;
        if it.next() == Some(&"moves") {
            for token in it {
                let m = uci::to_move(&self.pos, token);
                if m.is_none() {
                    // The offending move and everything after it is dropped
                    log::warn!("illegal move '{token}' in position command");
                    break;
                }
                self.pos.do_move(m);
            }
        }
        Ok(())
    }

    fn cmd_eval(&mut self) {
        self.stop_search_and_join();
        if self.pos.in_check() {
            println!("Final evaluation: none (in check)");
            return;
        }
        let (psqt, positional) = self.evaluator.evaluate(&self.pos);
        let v = engine_core::eval::evaluate(self.evaluator.as_ref(), &self.pos, 0);
        println!("psqt        {:+.2}", uci::to_cp(psqt, &self.pos) as f64 / 100.0);
        println!("positional  {:+.2}", uci::to_cp(positional, &self.pos) as f64 / 100.0);
        println!(
            "Final evaluation {:+.2} (side to move)",
            uci::to_cp(v, &self.pos) as f64 / 100.0
        );
    }

    fn cmd_perft(&mut self, depth: u32) {
        self.stop_search_and_join();
        let mut pos = self.pos.clone();
        let started = Instant::now();
        let nodes = movegen::perft_divide(&mut pos, depth);
        let elapsed = started.elapsed();
        println!();
        println!("Nodes searched: {nodes}");
        println!("Time: {} ms", elapsed.as_millis());
    }

    fn cmd_go(&mut self, rest: &[&str]) {
        let mut limits = LimitsType {
            start_time: Instant::now(),
            ..LimitsType::default()
        };

        fn next_i64<'a>(it: &mut std::slice::Iter<'a, &'a str>) -> i64 {
            it.next().and_then(|t| t.parse::<i64>().ok()).unwrap_or(0)
        }

        let mut it = rest.iter();
        while let Some(&token) = it.next() {
            match token {
                "wtime" => limits.time[0] = next_i64(&mut it),
                "btime" => limits.time[1] = next_i64(&mut it),
                "winc" => limits.inc[0] = next_i64(&mut it),
                "binc" => limits.inc[1] = next_i64(&mut it),
                "movestogo" => limits.movestogo = next_i64(&mut it) as i32,
                "depth" => limits.depth = next_i64(&mut it) as i32,
                "nodes" => limits.nodes = next_i64(&mut it) as u64,
                "movetime" => limits.movetime = next_i64(&mut it),
                "mate" => limits.mate = next_i64(&mut it) as i32,
                "perft" => limits.perft = next_i64(&mut it) as u32,
                "infinite" => limits.infinite = true,
                "ponder" => limits.ponder = true,
                "searchmoves" => {
                    for t in it.by_ref() {
                        let m = uci::to_move(&self.pos, t);
                        if m.is_some() {
                            limits.searchmoves.push(m);
                        }
                    }
                }
                _ => {}
            }
        }

        if limits.perft > 0 {
            self.cmd_perft(limits.perft);
            return;
        }

        self.launch_search(limits);
    }

    fn launch_search(&mut self, limits: LimitsType) {
        self.stop_search_and_join();

        self.stop.store(false, Ordering::Release);
        self.aborted.store(false, Ordering::Release);
        self.stop_on_ponderhit.store(false, Ordering::Release);
        self.ponder_flag.store(limits.ponder, Ordering::Release);
        self.increase_depth.store(true, Ordering::Release);

        let multi_pv = self.options.multi_pv;
        let counters = {
            let mut w = self.main_worker.lock().unwrap();
            if let Some(mgr) = w.manager.as_mut() {
                mgr.time_options = TimeOptions {
                    move_overhead: self.options.move_overhead,
                    nodestime: self.options.nodestime,
                    ponder: self.options.ponder,
                };
                mgr.show_wdl = self.options.show_wdl;
                mgr.silent = false;
            }
            w.prepare_search(&self.pos, limits.clone(), multi_pv);
            let mut counters = vec![Arc::clone(&w.nodes)];
            counters.extend(self.pool.node_counters());
            w.node_counters = counters.clone();
            counters
        };

        self.pool.start_thinking(&self.pos, &limits, multi_pv, &counters);

        let worker = Arc::clone(&self.main_worker);
        let pool = Arc::clone(&self.pool);
        let tt = Arc::clone(&self.tt);
        let pos = self.pos.clone();

        self.search_handle = Some(
            std::thread::Builder::new()
                .name("search-main".into())
                .stack_size(64 * 1024 * 1024)
                .spawn(move || {
                    let mut guard = worker.lock().unwrap();
                    let w: &mut Worker = &mut guard;
                    w.start_searching();
                    pool.wait_for_search_finished();

                    let main_result = ThreadResult {
                        completed_depth: w.completed_depth,
                        score: w.root_moves.first().map_or(-VALUE_INFINITE, |rm| rm.score),
                        mv: w.root_moves.first().map_or(Move::NONE, |rm| rm.mv()),
                        pv: w
                            .root_moves
                            .first()
                            .map_or_else(Vec::new, |rm| rm.pv.clone()),
                    };
                    let mut results = vec![main_result];
                    results.extend(pool.results());
                    let best_idx = select_best_thread(&results);
                    let chosen = results[best_idx].clone();

                    let average = w
                        .root_moves
                        .first()
                        .map_or(chosen.score, |rm| rm.average_score);
                    if let Some(mgr) = w.manager.as_mut() {
                        mgr.best_previous_score = chosen.score;
                        mgr.best_previous_average_score = average;
                    }

                    // A better helper result must be re-announced
                    if best_idx != 0 && chosen.mv.is_ok() && chosen.score != -VALUE_INFINITE {
                        let mut line = format!(
                            "info depth {} score {} pv",
                            chosen.completed_depth,
                            uci::format_score(chosen.score, &pos)
                        );
                        for m in &chosen.pv {
                            line.push(' ');
                            line.push_str(&m.to_string());
                        }
                        println!("{line}");
                    }

                    let ponder = ponder_move(&tt, &pos, &chosen);
                    match ponder {
                        Some(p) => println!("bestmove {} ponder {}", chosen.mv, p),
                        None => println!("bestmove {}", chosen.mv),
                    }
                })
                .expect("failed to spawn search thread"),
        );
    }

    /// Built-in fixed-depth benchmark over a small position suite
    pub fn bench(&mut self) {
        self.stop_search_and_join();

        let mut total_nodes: u64 = 0;
        let started = Instant::now();

        for (i, fen) in BENCH_FENS.iter().enumerate() {
            let pos = match Position::from_fen(fen) {
                Ok(p) => p,
                Err(e) => {
                    log::error!("bench fen {i} invalid: {e}");
                    continue;
                }
            };

            self.stop.store(false, Ordering::Release);
            self.aborted.store(false, Ordering::Release);
            let mut w = self.main_worker.lock().unwrap();
            if let Some(mgr) = w.manager.as_mut() {
                mgr.silent = true;
            }
            let limits = LimitsType {
                depth: BENCH_DEPTH,
                start_time: Instant::now(),
                ..LimitsType::default()
            };
            w.prepare_search(&pos, limits, 1);
            w.start_searching();
            let nodes = w.nodes_searched();
            total_nodes += nodes;
            if let Some(mgr) = w.manager.as_mut() {
                mgr.silent = false;
            }
            drop(w);

            println!(
                "Position {}/{}: nodes {}",
                i + 1,
                BENCH_FENS.len(),
                nodes
            );
        }

        let elapsed_ms = started.elapsed().as_millis().max(1) as u64;
        println!("===========================");
        println!("Total time (ms) : {elapsed_ms}");
        println!("Nodes searched  : {total_nodes}");
        println!("Nodes/second    : {}", total_nodes * 1000 / elapsed_ms);
    }

    fn stop_search_and_join(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.ponder_flag.store(false, Ordering::Release);
        if let Some(handle) = self.search_handle.take() {
            let _ = handle.join();
        }
    }

    pub fn quit(&mut self) {
        self.stop_search_and_join();
    }
}

/// Pick a ponder reply: from the PV when long enough, else from the TT
fn ponder_move(tt: &TranspositionTable, pos: &Position, chosen: &ThreadResult) -> Option<Move> {
    if chosen.pv.len() > 1 && chosen.pv[1].is_ok() {
        return Some(chosen.pv[1]);
    }
    if !chosen.mv.is_ok() {
        return None;
    }
    let mut p = pos.clone();
    p.do_move(chosen.mv);
    let (hit, data, _) = tt.probe(p.key());
    if hit && data.mv.is_ok() && movegen::legal_moves(&p).contains(data.mv) {
        return Some(data.mv);
    }
    None
}
