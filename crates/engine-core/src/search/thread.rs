//! Helper-thread pool
//!
//! The main worker searches on the caller's thread; helpers run the
//! same iterative deepening in their own OS threads, sharing the
//! transposition table and the stop flags. Each helper thread parks in
//! a Condvar idle loop between searches.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::eval::Evaluator;
use crate::position::Position;
use crate::types::{is_loss, is_win, Depth, Move, Value, VALUE_INFINITE};

use super::tt::TranspositionTable;
use super::worker::Worker;
use super::LimitsType;

const SEARCH_STACK_SIZE: usize = 64 * 1024 * 1024;

/// Outcome summary of one worker, for best-thread selection
#[derive(Debug, Clone)]
pub struct ThreadResult {
    pub completed_depth: Depth,
    pub score: Value,
    pub mv: Move,
    pub pv: Vec<Move>,
}

/// Pool of helper threads
pub struct ThreadPool {
    threads: Vec<Thread>,
}

impl ThreadPool {
    pub fn new(
        helper_count: usize,
        tt: Arc<TranspositionTable>,
        evaluator: Arc<dyn Evaluator>,
        stop: Arc<AtomicBool>,
        aborted: Arc<AtomicBool>,
        increase_depth: Arc<AtomicBool>,
    ) -> ThreadPool {
        let mut pool = ThreadPool {
            threads: Vec::new(),
        };
        for id in 1..=helper_count {
            pool.threads.push(Thread::new(
                id,
                Arc::clone(&tt),
                Arc::clone(&evaluator),
                Arc::clone(&stop),
                Arc::clone(&aborted),
                Arc::clone(&increase_depth),
            ));
        }
        pool
    }

    pub fn helper_count(&self) -> usize {
        self.threads.len()
    }

    /// Node counters of every helper
    pub fn node_counters(&self) -> Vec<Arc<AtomicU64>> {
        self.threads
            .iter()
            .map(|t| t.with_worker(|w| Arc::clone(&w.nodes)))
            .collect()
    }

    /// Hand the root position to all helpers and wake them
    pub fn start_thinking(
        &self,
        pos: &Position,
        limits: &LimitsType,
        multi_pv: usize,
        node_counters: &[Arc<AtomicU64>],
    ) {
        for thread in &self.threads {
            thread.with_worker(|w| {
                w.prepare_search(pos, limits.clone(), multi_pv);
                w.node_counters = node_counters.to_vec();
            });
            thread.start_searching();
        }
    }

    /// Block until every helper is idle again
    pub fn wait_for_search_finished(&self) {
        for thread in &self.threads {
            thread.wait_for_search_finished();
        }
    }

    /// Reset every helper's histories (new game)
    pub fn clear(&self) {
        for thread in &self.threads {
            thread.schedule(ThreadTask::Clear);
        }
        self.wait_for_search_finished();
    }

    /// Result summaries, for `select_best_thread`
    pub fn results(&self) -> Vec<ThreadResult> {
        self.threads
            .iter()
            .map(|t| {
                t.with_worker(|w| ThreadResult {
                    completed_depth: w.completed_depth,
                    score: w.root_moves.first().map_or(-VALUE_INFINITE, |rm| rm.score),
                    mv: w.root_moves.first().map_or(Move::NONE, |rm| rm.mv()),
                    pv: w.root_moves.first().map_or_else(Vec::new, |rm| rm.pv.clone()),
                })
            })
            .collect()
    }
}

/// Pick the most trusted result. Index 0 is the main worker; helpers
/// follow in pool order. Votes weight each root move by score margin
/// and completed depth; decisive scores override the vote.
pub fn select_best_thread(results: &[ThreadResult]) -> usize {
    debug_assert!(!results.is_empty());
    if results.len() == 1 {
        return 0;
    }

    let min_score = results
        .iter()
        .map(|r| r.score)
        .min()
        .unwrap_or(-VALUE_INFINITE);

    let mut votes: HashMap<Move, i64> = HashMap::new();
    for r in results {
        *votes.entry(r.mv).or_insert(0) +=
            ((r.score - min_score + 14) as i64) * r.completed_depth as i64;
    }

    let mut best = 0usize;
    for (i, th) in results.iter().enumerate().skip(1) {
        let best_r = &results[best];

        if is_loss(best_r.score) {
            // Try to find a thread with a better (even losing) score
            if th.score > best_r.score {
                best = i;
            }
        } else if is_win(th.score) || is_loss(th.score) {
            if th.score > best_r.score {
                best = i;
            }
        } else if !is_loss(th.score)
            && (votes[&th.mv] > votes[&best_r.mv]
                || (votes[&th.mv] == votes[&best_r.mv]
                    && th.completed_depth > best_r.completed_depth))
        {
            best = i;
        }
    }
    best
}

enum ThreadTask {
    Search,
    Clear,
}

struct ThreadState {
    searching: bool,
    exit: bool,
    task: Option<ThreadTask>,
}

struct ThreadInner {
    worker: Mutex<Worker>,
    state: Mutex<ThreadState>,
    condvar: Condvar,
}

/// One helper thread and its parked worker
pub struct Thread {
    id: usize,
    inner: Arc<ThreadInner>,
    handle: Option<JoinHandle<()>>,
}

impl Thread {
    fn new(
        id: usize,
        tt: Arc<TranspositionTable>,
        evaluator: Arc<dyn Evaluator>,
        stop: Arc<AtomicBool>,
        aborted: Arc<AtomicBool>,
        increase_depth: Arc<AtomicBool>,
    ) -> Thread {
        let worker = Worker::new(tt, evaluator, stop, aborted, increase_depth, id);
        let inner = Arc::new(ThreadInner {
            worker: Mutex::new(worker),
            state: Mutex::new(ThreadState {
                searching: false,
                exit: false,
                task: None,
            }),
            condvar: Condvar::new(),
        });
        let inner_clone = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name(format!("search-{id}"))
            .stack_size(SEARCH_STACK_SIZE)
            .spawn(move || idle_loop(inner_clone))
            .expect("failed to spawn search helper thread");

        Thread {
            id,
            inner,
            handle: Some(handle),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    fn start_searching(&self) {
        self.schedule(ThreadTask::Search);
    }

    fn schedule(&self, task: ThreadTask) {
        let mut state = self.inner.state.lock().unwrap();
        while state.searching {
            state = self.inner.condvar.wait(state).unwrap();
        }
        state.task = Some(task);
        state.searching = true;
        self.inner.condvar.notify_all();
    }

    pub fn wait_for_search_finished(&self) {
        let mut state = self.inner.state.lock().unwrap();
        while state.searching {
            state = self.inner.condvar.wait(state).unwrap();
        }
    }

    pub fn with_worker<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Worker) -> R,
    {
        let mut worker = self.inner.worker.lock().unwrap();
        f(&mut worker)
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.exit = true;
            state.searching = true;
            self.inner.condvar.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn idle_loop(inner: Arc<ThreadInner>) {
    loop {
        let task = {
            let mut state = inner.state.lock().unwrap();
            while !state.searching {
                state = inner.condvar.wait(state).unwrap();
            }
            if state.exit {
                return;
            }
            state.task.take()
        };

        if let Some(task) = task {
            let mut worker = inner.worker.lock().unwrap();
            match task {
                ThreadTask::Search => worker.start_searching(),
                ThreadTask::Clear => worker.clear(),
            }
        }

        let mut state = inner.state.lock().unwrap();
        state.searching = false;
        inner.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{mate_in, mated_in};

    fn result(depth: Depth, score: Value, raw: u16) -> ThreadResult {
        ThreadResult {
            completed_depth: depth,
            score,
            mv: Move::from_raw(raw),
            pv: vec![Move::from_raw(raw)],
        }
    }

    #[test]
    fn test_select_single() {
        assert_eq!(select_best_thread(&[result(10, 50, 130)]), 0);
    }

    #[test]
    fn test_select_prefers_agreeing_deeper_thread() {
        // Two helpers agree on a different move at greater depth: the
        // vote shifts away from the main thread
        let rs = [
            result(10, 20, 130),
            result(14, 60, 200),
            result(13, 55, 200),
        ];
        let best = select_best_thread(&rs);
        assert!(best == 1 || best == 2);
        assert_eq!(rs[best].mv, Move::from_raw(200));
    }

    #[test]
    fn test_select_prefers_proven_mate() {
        let rs = [result(20, 80, 130), result(9, mate_in(7), 200)];
        assert_eq!(select_best_thread(&rs), 1);
    }

    #[test]
    fn test_select_avoids_unproven_mated() {
        // Main thinks it is mated; a helper disagrees with a normal score
        let rs = [result(20, mated_in(9), 130), result(12, -100, 200)];
        assert_eq!(select_best_thread(&rs), 1);
    }

    #[test]
    fn test_smp_search_returns_legal_move() {
        use crate::position::Position;
        use crate::search::{LimitsType, SearchManager};

        crate::bitboard::init();
        let tt = Arc::new(TranspositionTable::new(4));
        let stop = Arc::new(AtomicBool::new(false));
        let aborted = Arc::new(AtomicBool::new(false));
        let inc = Arc::new(AtomicBool::new(true));
        let evaluator: Arc<dyn Evaluator> = Arc::new(crate::eval::MaterialEvaluator);

        let pool = ThreadPool::new(
            2,
            Arc::clone(&tt),
            Arc::clone(&evaluator),
            Arc::clone(&stop),
            Arc::clone(&aborted),
            Arc::clone(&inc),
        );

        let mut main = Worker::new(tt, evaluator, stop, aborted, inc, 0);
        let mut mgr = SearchManager::new(
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(false)),
        );
        mgr.silent = true;
        main.manager = Some(mgr);

        let pos = Position::startpos();
        let limits = LimitsType {
            depth: 4,
            ..LimitsType::default()
        };
        main.prepare_search(&pos, limits.clone(), 1);
        let mut counters = vec![Arc::clone(&main.nodes)];
        counters.extend(pool.node_counters());
        main.node_counters = counters.clone();

        pool.start_thinking(&pos, &limits, 1, &counters);
        main.start_searching();
        pool.wait_for_search_finished();

        let mut results = vec![ThreadResult {
            completed_depth: main.completed_depth,
            score: main.root_moves[0].score,
            mv: main.root_moves[0].mv(),
            pv: main.root_moves[0].pv.clone(),
        }];
        results.extend(pool.results());
        let best = select_best_thread(&results);
        let chosen = &results[best];
        assert!(crate::movegen::legal_moves(&pos).contains(chosen.mv));
    }

    #[test]
    fn test_pool_spawns_and_clears() {
        crate::bitboard::init();
        let tt = Arc::new(TranspositionTable::new(1));
        let stop = Arc::new(AtomicBool::new(false));
        let aborted = Arc::new(AtomicBool::new(false));
        let inc = Arc::new(AtomicBool::new(true));
        let pool = ThreadPool::new(
            2,
            tt,
            Arc::new(crate::eval::MaterialEvaluator),
            stop,
            aborted,
            inc,
        );
        assert_eq!(pool.helper_count(), 2);
        assert_eq!(pool.node_counters().len(), 2);
        pool.clear();
        pool.wait_for_search_finished();
    }
}
