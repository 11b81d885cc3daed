//! The search worker
//!
//! One worker per thread. Each runs the same iterative-deepening loop
//! over a private history set and a shared transposition table; the
//! main worker additionally runs the time manager and prints UCI info.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::eval::{self, Evaluator};
use crate::movegen;
use crate::position::{Position, RuleJudge};
use crate::types::{
    is_decisive, is_loss, is_valid, is_win, mate_in, mated_in, Bound, Color, Depth, Move, Piece,
    PieceType, Square, Value, DEPTH_QS, DEPTH_UNSEARCHED, MAX_PLY, PIECE_VALUE, VALUE_DRAW,
    VALUE_INFINITE, VALUE_MATE, VALUE_MATED_IN_MAX_PLY, VALUE_MATE_IN_MAX_PLY, VALUE_NONE,
    VALUE_ZERO,
};
use crate::uci;

use super::history::{
    pawn_structure_index, stat_bonus, stat_malus, ButterflyHistory, CapturePieceToHistory,
    ContHistIndex, ContinuationCorrectionHistory, ContinuationHistory, CorrectionHistory,
    LowPlyHistory, PawnHistory, CORRECTION_HISTORY_LIMIT, LOW_PLY_HISTORY_SIZE,
};
use super::movepick::{MovePicker, PickContext};
use super::timeman::{TimeManagement, TimeOptions};
use super::tt::{value_from_tt, value_to_tt, TranspositionTable};
use super::{
    root_move_order, LimitsType, PvTable, RootMove, Stack, STACK_GUARD, STACK_OFFSET,
};

const NODE_ROOT: u8 = 0;
const NODE_PV: u8 = 1;
const NODE_NON_PV: u8 = 2;

/// Main-thread state: time control, score memory, output duty
pub struct SearchManager {
    pub tm: TimeManagement,
    pub time_options: TimeOptions,
    pub ponder: Arc<AtomicBool>,
    pub stop_on_ponderhit: Arc<AtomicBool>,
    pub best_previous_score: Value,
    pub best_previous_average_score: Value,
    pub iter_value: [Value; 4],
    pub previous_time_reduction: f64,
    pub original_time_adjust: f64,
    pub calls_cnt: i32,
    pub show_wdl: bool,
    /// Suppress info output (bench, tests)
    pub silent: bool,
}

impl SearchManager {
    pub fn new(ponder: Arc<AtomicBool>, stop_on_ponderhit: Arc<AtomicBool>) -> SearchManager {
        SearchManager {
            tm: TimeManagement::new(),
            time_options: TimeOptions::default(),
            ponder,
            stop_on_ponderhit,
            best_previous_score: VALUE_INFINITE,
            best_previous_average_score: VALUE_INFINITE,
            iter_value: [VALUE_ZERO; 4],
            previous_time_reduction: 0.85,
            original_time_adjust: -1.0,
            calls_cnt: 0,
            show_wdl: false,
            silent: false,
        }
    }
}

/// One search thread's worth of state
pub struct Worker {
    pub root_pos: Position,
    pub root_moves: Vec<RootMove>,
    pub limits: LimitsType,
    pub multi_pv: usize,

    pub tt: Arc<TranspositionTable>,
    pub evaluator: Arc<dyn Evaluator>,
    pub stop: Arc<AtomicBool>,
    pub aborted: Arc<AtomicBool>,
    pub increase_depth: Arc<AtomicBool>,
    pub nodes: Arc<AtomicU64>,
    /// Counters of every worker in the pool, for nps/limit checks
    pub node_counters: Vec<Arc<AtomicU64>>,
    pub thread_id: usize,

    // Private histories
    main_history: ButterflyHistory,
    low_ply_history: LowPlyHistory,
    capture_history: CapturePieceToHistory,
    pawn_history: PawnHistory,
    continuation_history: ContinuationHistory,
    pawn_correction_history: CorrectionHistory,
    major_correction_history: CorrectionHistory,
    minor_correction_history: CorrectionHistory,
    non_pawn_correction_history: [CorrectionHistory; 2],
    continuation_correction_history: ContinuationCorrectionHistory,

    stack: Vec<Stack>,
    pv_table: PvTable,
    reductions: [i32; MAX_PLY],

    pub root_depth: Depth,
    pub completed_depth: Depth,
    pub sel_depth: i32,
    pub best_move_changes: f64,
    pub nmp_min_ply: i32,
    optimism: [Value; 2],
    pv_idx: usize,
    pv_last: usize,
    root_delta: Value,

    /// Present on the main worker only
    pub manager: Option<SearchManager>,
}

impl Worker {
    pub fn new(
        tt: Arc<TranspositionTable>,
        evaluator: Arc<dyn Evaluator>,
        stop: Arc<AtomicBool>,
        aborted: Arc<AtomicBool>,
        increase_depth: Arc<AtomicBool>,
        thread_id: usize,
    ) -> Worker {
        let mut w = Worker {
            root_pos: Position::startpos(),
            root_moves: Vec::new(),
            limits: LimitsType::default(),
            multi_pv: 1,
            tt,
            evaluator,
            stop,
            aborted,
            increase_depth,
            nodes: Arc::new(AtomicU64::new(0)),
            node_counters: Vec::new(),
            thread_id,
            main_history: ButterflyHistory::new(),
            low_ply_history: LowPlyHistory::new(),
            capture_history: CapturePieceToHistory::new(),
            pawn_history: PawnHistory::new(),
            continuation_history: ContinuationHistory::new(),
            pawn_correction_history: CorrectionHistory::new(),
            major_correction_history: CorrectionHistory::new(),
            minor_correction_history: CorrectionHistory::new(),
            non_pawn_correction_history: [CorrectionHistory::new(), CorrectionHistory::new()],
            continuation_correction_history: ContinuationCorrectionHistory::new(),
            stack: vec![Stack::default(); MAX_PLY + STACK_OFFSET + STACK_GUARD],
            pv_table: PvTable::new(),
            reductions: [0; MAX_PLY],
            root_depth: 0,
            completed_depth: 0,
            sel_depth: 0,
            best_move_changes: 0.0,
            nmp_min_ply: 0,
            optimism: [0; 2],
            pv_idx: 0,
            pv_last: 0,
            root_delta: 1,
            manager: None,
        };
        w.clear();
        w
    }

    #[inline]
    pub fn is_main(&self) -> bool {
        self.manager.is_some()
    }

    /// Reset histories, usually before a new game
    pub fn clear(&mut self) {
        self.main_history.fill(61);
        self.low_ply_history.fill(106);
        self.capture_history.fill(-598);
        self.pawn_history.fill(-1181);
        self.pawn_correction_history.fill(0);
        self.major_correction_history.fill(0);
        self.minor_correction_history.fill(0);
        self.non_pawn_correction_history[0].fill(0);
        self.non_pawn_correction_history[1].fill(0);
        self.continuation_correction_history.fill(0);
        self.continuation_history.fill(-427);

        for i in 1..MAX_PLY {
            self.reductions[i] = (14.60 * (i as f64).ln()) as i32;
        }
    }

    /// Total nodes across the pool (falls back to our own counter)
    pub fn nodes_searched(&self) -> u64 {
        if self.node_counters.is_empty() {
            self.nodes.load(Ordering::Relaxed)
        } else {
            self.node_counters
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .sum()
        }
    }

    /// Prepare root state for a new `go`
    pub fn prepare_search(&mut self, pos: &Position, limits: LimitsType, multi_pv: usize) {
        self.root_pos = pos.clone();
        self.limits = limits;
        self.nodes.store(0, Ordering::Relaxed);
        self.root_depth = 0;
        self.completed_depth = 0;
        self.sel_depth = 0;
        self.best_move_changes = 0.0;
        self.nmp_min_ply = 0;

        self.root_moves.clear();
        for m in movegen::legal_moves(pos).iter() {
            if self.limits.searchmoves.is_empty() || self.limits.searchmoves.contains(m) {
                self.root_moves.push(RootMove::new(*m));
            }
        }
        self.multi_pv = multi_pv.min(self.root_moves.len().max(1));
    }

    /// Entry point of a worker thread
    pub fn start_searching(&mut self) {
        if !self.is_main() {
            self.iterative_deepening();
            return;
        }

        if let Some(mut mgr) = self.manager.take() {
            let opts = mgr.time_options;
            mgr.tm.init(
                &mut self.limits,
                self.root_pos.side_to_move(),
                self.root_pos.game_ply(),
                &opts,
                &mut mgr.original_time_adjust,
            );
            mgr.calls_cnt = 0;
            self.manager = Some(mgr);
        }
        self.tt.new_search();

        if self.root_moves.is_empty() {
            // No legal move: report a mated score and bail out
            self.root_moves.push(RootMove::new(Move::NONE));
            if !self.manager.as_ref().unwrap().silent {
                println!("info depth 0 score mate 0");
            }
        } else {
            self.iterative_deepening();
        }

        // In ponder or infinite mode the protocol owner decides when we
        // may report; spin until it does
        while !self.stop.load(Ordering::Relaxed)
            && (self
                .manager
                .as_ref()
                .map(|m| m.ponder.load(Ordering::Relaxed))
                .unwrap_or(false)
                || self.limits.infinite)
        {
            std::thread::yield_now();
        }

        self.stop.store(true, Ordering::Release);

        if self.limits.npmsec != 0 {
            let searched = self.nodes_searched() as i64;
            let inc = self.limits.inc[self.root_pos.side_to_move().index()];
            if let Some(mgr) = self.manager.as_mut() {
                mgr.tm.advance_nodes_time(searched - inc);
            }
        }
    }

    // =========================================================================
    // Iterative deepening
    // =========================================================================

    pub fn iterative_deepening(&mut self) {
        if self.root_moves.is_empty() {
            return;
        }

        let mut pos = self.root_pos.clone();
        let us = pos.side_to_move();

        let mut last_best_pv: Vec<Move> = vec![Move::NONE];
        let mut last_best_score = -VALUE_INFINITE;
        let mut last_best_move_depth = 0;

        let mut time_reduction = 1.0f64;
        let mut tot_best_move_changes = 0.0f64;
        let mut iter_idx = 0usize;
        let mut search_again_counter = 0;

        // Reset the stack; sentinel frames stay neutral
        for (i, frame) in self.stack.iter_mut().enumerate() {
            *frame = Stack::default();
            frame.ply = i as i32 - STACK_OFFSET as i32;
        }

        if let Some(mgr) = self.manager.as_mut() {
            let fill = if mgr.best_previous_score == VALUE_INFINITE {
                VALUE_ZERO
            } else {
                mgr.best_previous_score
            };
            mgr.iter_value = [fill; 4];
        }

        self.low_ply_history.fill(106);

        while {
            self.root_depth += 1;
            self.root_depth < MAX_PLY as Depth
                && !self.stop.load(Ordering::Relaxed)
                && !(self.limits.depth != 0 && self.is_main() && self.root_depth > self.limits.depth)
        } {
            if self.is_main() {
                tot_best_move_changes /= 2.0;
            }

            for rm in &mut self.root_moves {
                rm.previous_score = rm.score;
            }

            self.pv_last = self.root_moves.len();

            if !self.increase_depth.load(Ordering::Relaxed) {
                search_again_counter += 1;
            }

            let multi_pv = self.multi_pv.min(self.root_moves.len());
            self.pv_idx = 0;
            while self.pv_idx < multi_pv {
                self.sel_depth = 0;

                // Aspiration window around the running average
                let rm = &self.root_moves[self.pv_idx];
                let mut delta = 10 + (rm.mean_squared_score.abs() / 44420) as Value;
                let avg = if rm.average_score == -VALUE_INFINITE {
                    VALUE_ZERO
                } else {
                    rm.average_score
                };
                let mut alpha = (avg - delta).max(-VALUE_INFINITE);
                let mut beta = (avg + delta).min(VALUE_INFINITE);

                self.optimism[us.index()] = 99 * avg / (avg.abs() + 92);
                self.optimism[(!us).index()] = -self.optimism[us.index()];

                let mut failed_high_cnt = 0;
                let mut best_value;
                loop {
                    let adjusted_depth = (self.root_depth
                        - failed_high_cnt
                        - 3 * (search_again_counter + 1) / 4)
                        .max(1);
                    self.root_delta = beta - alpha;
                    best_value = self.search::<NODE_ROOT>(
                        &mut pos,
                        STACK_OFFSET,
                        alpha,
                        beta,
                        adjusted_depth,
                        false,
                    );

                    self.root_moves[self.pv_idx..self.pv_last].sort_by(root_move_order);

                    if self.stop.load(Ordering::Relaxed) {
                        break;
                    }

                    if best_value <= alpha {
                        beta = (alpha + beta) / 2;
                        alpha = (best_value - delta).max(-VALUE_INFINITE);
                        failed_high_cnt = 0;
                        if let Some(mgr) = self.manager.as_mut() {
                            mgr.stop_on_ponderhit.store(false, Ordering::Relaxed);
                        }
                    } else if best_value >= beta {
                        beta = (best_value + delta).min(VALUE_INFINITE);
                        failed_high_cnt += 1;
                    } else {
                        break;
                    }

                    delta += delta / 3;
                    debug_assert!(alpha >= -VALUE_INFINITE && beta <= VALUE_INFINITE);
                }

                self.root_moves[..self.pv_idx + 1].sort_by(root_move_order);

                if self.is_main()
                    && (self.stop.load(Ordering::Relaxed) || self.pv_idx + 1 == multi_pv)
                    && !(self.aborted.load(Ordering::Relaxed)
                        && is_loss(self.root_moves[0].uci_score))
                {
                    self.emit_pv(self.root_depth);
                }

                if self.stop.load(Ordering::Relaxed) {
                    break;
                }
                self.pv_idx += 1;
            }

            if !self.stop.load(Ordering::Relaxed) {
                self.completed_depth = self.root_depth;
            }

            // Never trust an unproven mated-in score from an aborted pass
            if self.aborted.load(Ordering::Relaxed)
                && self.root_moves[0].score != -VALUE_INFINITE
                && is_loss(self.root_moves[0].score)
            {
                if let Some(idx) = self
                    .root_moves
                    .iter()
                    .position(|rm| rm.mv() == last_best_pv[0])
                {
                    self.root_moves.swap(0, idx);
                    self.root_moves[0].pv = last_best_pv.clone();
                    self.root_moves[0].score = last_best_score;
                    self.root_moves[0].uci_score = last_best_score;
                }
            } else if self.root_moves[0].mv() != last_best_pv[0] {
                last_best_pv = self.root_moves[0].pv.clone();
                last_best_score = self.root_moves[0].score;
                last_best_move_depth = self.root_depth;
            }

            if !self.is_main() {
                continue;
            }

            // Mate-in-N satisfied?
            if self.limits.mate != 0
                && self.root_moves[0].score == self.root_moves[0].uci_score
                && ((self.root_moves[0].score >= VALUE_MATE_IN_MAX_PLY
                    && crate::types::VALUE_MATE - self.root_moves[0].score
                        <= 2 * self.limits.mate)
                    || (self.root_moves[0].score != -VALUE_INFINITE
                        && self.root_moves[0].score <= VALUE_MATED_IN_MAX_PLY
                        && crate::types::VALUE_MATE + self.root_moves[0].score
                            <= 2 * self.limits.mate))
            {
                self.stop.store(true, Ordering::Release);
            }

            tot_best_move_changes += self.best_move_changes;
            self.best_move_changes = 0.0;

            // Soft time control
            let stop_on_ponderhit = self
                .manager
                .as_ref()
                .map(|m| m.stop_on_ponderhit.load(Ordering::Relaxed))
                .unwrap_or(false);
            if self.limits.use_time_management()
                && !self.stop.load(Ordering::Relaxed)
                && !stop_on_ponderhit
            {
                let nodes_total = self.nodes_searched().max(1);
                let nodes_effort = self.root_moves[0].effort * 144 / nodes_total;

                let best_value = self.root_moves[0].score;
                let mgr = self.manager.as_ref().unwrap();
                let mut falling_eval = (86.0
                    + 14.0 * (mgr.best_previous_average_score - best_value) as f64
                    + 4.0 * (mgr.iter_value[iter_idx] - best_value) as f64)
                    / 566.87;
                falling_eval = falling_eval.clamp(0.62, 1.76);

                time_reduction = if last_best_move_depth + 12 < self.completed_depth {
                    1.59
                } else {
                    0.63
                };
                let reduction =
                    (1.91 + mgr.previous_time_reduction) / (3.17 * time_reduction);
                let best_move_instability = 0.87 + 1.62 * tot_best_move_changes;

                let total_time = mgr.tm.optimum() as f64
                    * falling_eval
                    * reduction
                    * best_move_instability;
                let elapsed = {
                    let n = self.nodes_searched();
                    mgr.tm.elapsed(|| n)
                };

                let pondering = mgr.ponder.load(Ordering::Relaxed);
                if self.completed_depth >= 9
                    && nodes_effort >= 111
                    && elapsed as f64 > total_time * 0.73
                    && !pondering
                {
                    self.stop.store(true, Ordering::Release);
                }

                if elapsed as f64 > total_time {
                    if pondering {
                        mgr.stop_on_ponderhit.store(true, Ordering::Relaxed);
                    } else {
                        self.stop.store(true, Ordering::Release);
                    }
                } else {
                    self.increase_depth.store(
                        pondering || (elapsed as f64) <= total_time * 0.279,
                        Ordering::Relaxed,
                    );
                }
            }

            if let Some(mgr) = self.manager.as_mut() {
                mgr.iter_value[iter_idx] = self.root_moves[0].score;
            }
            iter_idx = (iter_idx + 1) & 3;
        }

        if let Some(mgr) = self.manager.as_mut() {
            mgr.previous_time_reduction = time_reduction;
        }
    }

    // =========================================================================
    // Main search
    // =========================================================================

    #[allow(clippy::too_many_lines)]
    fn search<const NT: u8>(
        &mut self,
        pos: &mut Position,
        ss: usize,
        mut alpha: Value,
        mut beta: Value,
        mut depth: Depth,
        cut_node: bool,
    ) -> Value {
        let pv_node = NT != NODE_NON_PV;
        let root_node = NT == NODE_ROOT;
        let all_node = !(pv_node || cut_node);

        // Step 1. Dive into quiescence at the horizon
        if depth <= 0 {
            return if pv_node {
                self.qsearch::<true>(pos, ss, alpha, beta)
            } else {
                self.qsearch::<false>(pos, ss, alpha, beta)
            };
        }
        depth = depth.min(MAX_PLY as Depth - 1);

        debug_assert!(-VALUE_INFINITE <= alpha && alpha < beta && beta <= VALUE_INFINITE);
        debug_assert!(pv_node || alpha == beta - 1);
        debug_assert!(!(pv_node && cut_node));

        let ply = self.stack[ss].ply;
        let in_check = pos.in_check();
        let prior_capture = pos.captured_piece();
        let us = pos.side_to_move();
        let excluded_move = self.stack[ss].excluded_move;

        self.stack[ss].in_check = in_check;
        self.stack[ss].move_count = 0;
        let mut best_value = -VALUE_INFINITE;
        let mut best_move = Move::NONE;

        if self.is_main() {
            self.check_time();
        }

        if pv_node && self.sel_depth < ply + 1 {
            self.sel_depth = ply + 1;
        }

        if !root_node {
            // Step 2. Rule adjudication and abort checks
            match pos.rule_judge(ply) {
                RuleJudge::Terminal(v) => {
                    return if v == VALUE_DRAW {
                        self.value_draw()
                    } else {
                        v
                    };
                }
                RuleJudge::Hint(v) => {
                    debug_assert!(v != VALUE_DRAW);
                    if v > VALUE_DRAW {
                        alpha = alpha.max(VALUE_DRAW - 1);
                    } else {
                        beta = beta.min(VALUE_DRAW + 1);
                    }
                    if alpha >= beta {
                        return alpha;
                    }
                }
                RuleJudge::None => {}
            }

            if self.stop.load(Ordering::Relaxed) || ply >= MAX_PLY as i32 {
                return if ply >= MAX_PLY as i32 && !in_check {
                    self.evaluate(pos)
                } else {
                    self.value_draw()
                };
            }

            // Step 3. Mate-distance pruning
            alpha = alpha.max(mated_in(ply));
            beta = beta.min(mate_in(ply + 1));
            if alpha >= beta {
                return alpha;
            }
        }

        debug_assert!((0..MAX_PLY as i32).contains(&ply));

        self.stack[ss + 2].cutoff_cnt = 0;
        let prev_move = self.stack[ss - 1].current_move;
        let prev_sq = if prev_move.is_ok() {
            Some(prev_move.to_sq())
        } else {
            None
        };
        self.stack[ss].stat_score = 0;

        // Step 4. Transposition table lookup. The writer borrows the
        // cloned handle, not `self`, so history updates stay possible.
        let pos_key = pos.key();
        let tt = Arc::clone(&self.tt);
        let (tt_hit, mut tt_data, tt_writer) = tt.probe(pos_key);
        self.stack[ss].tt_hit = tt_hit;
        tt_data.mv = if root_node {
            self.root_moves[self.pv_idx].mv()
        } else if tt_hit {
            tt_data.mv
        } else {
            Move::NONE
        };
        tt_data.value = if tt_hit {
            value_from_tt(tt_data.value, ply, pos.rule60_count())
        } else {
            VALUE_NONE
        };
        let tt_pv = if excluded_move.is_some() {
            self.stack[ss].tt_pv
        } else {
            pv_node || (tt_hit && tt_data.is_pv)
        };
        self.stack[ss].tt_pv = tt_pv;
        let tt_capture = tt_data.mv.is_ok() && pos.capture(tt_data.mv);

        // Early TT cutoff at non-PV nodes
        if !pv_node
            && excluded_move.is_none()
            && tt_data.depth > depth - i32::from(tt_data.value <= beta)
            && is_valid(tt_data.value)
            && tt_data.bound.admits(if tt_data.value >= beta {
                Bound::Lower
            } else {
                Bound::Upper
            })
            && (cut_node == (tt_data.value >= beta) || depth > 9)
        {
            // A quiet TT move that fails high improves move ordering
            if tt_data.mv.is_ok() && tt_data.value >= beta {
                if !tt_capture {
                    self.update_quiet_histories(pos, ss, tt_data.mv, stat_bonus(depth) * 747 / 1024);
                }
                if let Some(psq) = prev_sq {
                    if self.stack[ss - 1].move_count <= 2 && prior_capture.is_none() {
                        let pc = pos.piece_on(psq);
                        self.update_continuation_histories(
                            ss - 1,
                            pc,
                            psq,
                            -stat_malus(depth + 1) * 1091 / 1024,
                        );
                    }
                }
            }

            // The graph-history interaction makes high rule60 cutoffs unsafe
            if pos.rule60_count() < 110 {
                return tt_data.value;
            }
        }

        // Step 5. Static evaluation
        let correction_value = self.correction_value(pos, ss);
        let mut unadjusted_static_eval = VALUE_NONE;
        let mut improving = false;

        if in_check {
            // Evaluation is meaningless in check; inherit our last one
            self.stack[ss].static_eval = self.stack[ss - 2].static_eval;
        } else {
            let mut eval;
            if excluded_move.is_some() {
                unadjusted_static_eval = self.stack[ss].static_eval;
                eval = unadjusted_static_eval;
            } else if tt_hit {
                unadjusted_static_eval = if is_valid(tt_data.eval) {
                    tt_data.eval
                } else {
                    self.evaluate(pos)
                };
                eval = to_corrected_static_eval(unadjusted_static_eval, correction_value);
                self.stack[ss].static_eval = eval;

                // The stored search value is a better estimate
                if is_valid(tt_data.value)
                    && tt_data.bound.admits(if tt_data.value > eval {
                        Bound::Lower
                    } else {
                        Bound::Upper
                    })
                {
                    eval = tt_data.value;
                }
            } else {
                unadjusted_static_eval = self.evaluate(pos);
                eval = to_corrected_static_eval(unadjusted_static_eval, correction_value);
                self.stack[ss].static_eval = eval;
                tt_writer.write(
                    pos_key,
                    VALUE_NONE,
                    tt_pv,
                    Bound::None,
                    DEPTH_UNSEARCHED,
                    Move::NONE,
                    unadjusted_static_eval,
                );
            }

            // The eval swing since our previous move improves quiet ordering
            if prev_move.is_ok() && !self.stack[ss - 1].in_check && prior_capture.is_none() {
                let bonus = (-17
                    * (self.stack[ss - 1].static_eval + self.stack[ss].static_eval))
                    .clamp(-1024, 2058)
                    + 332;
                self.main_history
                    .update(!us, prev_move, bonus * 1340 / 1024);
                if let Some(psq) = prev_sq {
                    let pc = pos.piece_on(psq);
                    if pc.piece_type() != PieceType::Pawn {
                        self.pawn_history.update(
                            pawn_structure_index(pos),
                            pc,
                            psq,
                            bonus * 1159 / 1024,
                        );
                    }
                }
            }

            improving = self.stack[ss].static_eval > self.stack[ss - 2].static_eval;
            let opponent_worsening =
                self.stack[ss].static_eval + self.stack[ss - 1].static_eval > 2;

            // Step 6. Razoring
            if eval < alpha - 1373 - 252 * depth * depth {
                let value = self.qsearch::<false>(pos, ss, alpha - 1, alpha);
                if value < alpha && !is_decisive(value) {
                    return value;
                }
            }

            // Step 7. Futility pruning
            if !tt_pv
                && depth < 16
                && eval
                    - futility_margin(depth, cut_node && !tt_hit, improving, opponent_worsening)
                    - self.stack[ss - 1].stat_score / 159
                    + i32::from(self.stack[ss].static_eval == eval)
                        * (40 - correction_value.abs() / 131072)
                    >= beta
                && eval >= beta
                && (!tt_data.mv.is_ok() || tt_capture)
                && !is_loss(beta)
                && !is_win(eval)
            {
                return beta + (eval - beta) / 3;
            }

            improving = improving || self.stack[ss].static_eval >= beta + 113;

            // Step 8. Null-move search with verification
            if cut_node
                && prev_move != Move::NULL
                && eval >= beta
                && self.stack[ss].static_eval >= beta - 8 * depth + 189
                && excluded_move.is_none()
                && pos.major_material(us) != 0
                && ply >= self.nmp_min_ply
                && !is_loss(beta)
            {
                debug_assert!(eval - beta >= 0);
                let r = ((eval - beta) / 254).min(5) + depth / 3 + 5;

                self.stack[ss].current_move = Move::NULL;
                self.stack[ss].cont_hist = ContHistIndex::default();

                pos.do_null_move();
                let null_value =
                    -self.search::<NODE_NON_PV>(pos, ss + 1, -beta, -beta + 1, depth - r, false);
                pos.undo_null_move();

                if null_value >= beta && !is_win(null_value) {
                    if self.nmp_min_ply != 0 || depth < 15 {
                        return null_value;
                    }

                    debug_assert!(self.nmp_min_ply == 0);

                    // Verify at high depth with null moves disabled
                    self.nmp_min_ply = ply + 3 * (depth - r) / 4;
                    let v = self.search::<NODE_NON_PV>(pos, ss, beta - 1, beta, depth - r, false);
                    self.nmp_min_ply = 0;

                    if v >= beta {
                        return null_value;
                    }
                }
            }

            // Step 9. Internal iterative reductions
            if pv_node && !tt_data.mv.is_ok() {
                depth -= 2;
            }
            if depth <= 0 {
                return self.qsearch::<true>(pos, ss, alpha, beta);
            }
            if cut_node
                && depth >= 7
                && (!tt_data.mv.is_ok() || tt_data.bound == Bound::Upper)
            {
                depth -= 1 + i32::from(!tt_data.mv.is_ok());
            }

            // Step 10. ProbCut
            let prob_cut_beta = beta + 234 - 66 * i32::from(improving);
            if !pv_node
                && depth > 4
                && !is_decisive(beta)
                && !(tt_data.depth >= depth - 3
                    && is_valid(tt_data.value)
                    && tt_data.value < prob_cut_beta)
            {
                debug_assert!(prob_cut_beta < VALUE_INFINITE && prob_cut_beta > beta);

                let mut mp = MovePicker::new_probcut(
                    pos,
                    tt_data.mv,
                    prob_cut_beta - self.stack[ss].static_eval,
                );
                loop {
                    let m = {
                        let ctx = self.pick_context(ss, pos);
                        mp.next_move(pos, &ctx)
                    };
                    if m.is_none() {
                        break;
                    }
                    if m == excluded_move || !pos.legal(m) {
                        continue;
                    }
                    debug_assert!(pos.capture(m));

                    let moved = pos.moved_piece(m);
                    let captured = pos.piece_on(m.to_sq());

                    self.stack[ss].current_move = m;
                    self.stack[ss].cont_hist = ContHistIndex {
                        in_check,
                        capture: true,
                        piece: moved,
                        to: m.to_sq(),
                    };

                    self.nodes.fetch_add(1, Ordering::Relaxed);
                    pos.do_move(m);

                    // A cheap qsearch probe, then the confirming search
                    let mut value = -self.qsearch::<false>(
                        pos,
                        ss + 1,
                        -prob_cut_beta,
                        -prob_cut_beta + 1,
                    );
                    if value >= prob_cut_beta {
                        value = -self.search::<NODE_NON_PV>(
                            pos,
                            ss + 1,
                            -prob_cut_beta,
                            -prob_cut_beta + 1,
                            depth - 4,
                            !cut_node,
                        );
                    }

                    pos.undo_move(m);

                    if value >= prob_cut_beta {
                        self.capture_history.update(
                            moved,
                            m.to_sq(),
                            captured.piece_type(),
                            1226,
                        );
                        tt_writer.write(
                            pos_key,
                            value_to_tt(value, ply),
                            tt_pv,
                            Bound::Lower,
                            depth - 3,
                            m,
                            unadjusted_static_eval,
                        );
                        return if is_decisive(value) {
                            value
                        } else {
                            value - (prob_cut_beta - beta)
                        };
                    }
                }
            }
        }

        // Step 11. Small ProbCut from the TT
        let prob_cut_beta = beta + 441;
        if tt_data.bound.admits(Bound::Lower)
            && tt_data.depth >= depth - 3
            && is_valid(tt_data.value)
            && tt_data.value >= prob_cut_beta
            && !is_decisive(beta)
            && !is_decisive(tt_data.value)
        {
            return prob_cut_beta;
        }

        // Step 12. The move loop
        let killers = self.stack[ss].killers;
        let mut mp = MovePicker::new(pos, tt_data.mv, depth, killers);

        let mut value;
        let mut move_count = 0;
        let mut quiets_searched: SmallVec<[Move; 32]> = SmallVec::new();
        let mut captures_searched: SmallVec<[Move; 32]> = SmallVec::new();

        loop {
            let m = {
                let ctx = self.pick_context(ss, pos);
                mp.next_move(pos, &ctx)
            };
            if m.is_none() {
                break;
            }
            debug_assert!(m.is_ok());

            if m == excluded_move {
                continue;
            }
            if !pos.legal(m) {
                continue;
            }

            // At root only consider moves of the current PV window
            if root_node
                && !self.root_moves[self.pv_idx..self.pv_last]
                    .iter()
                    .any(|rm| rm.mv() == m)
            {
                continue;
            }

            move_count += 1;
            self.stack[ss].move_count = move_count;

            if pv_node {
                self.pv_table.clear(ply as usize + 1);
            }

            let mut extension: Depth = 0;
            let capture = pos.capture(m);
            let moved_piece = pos.moved_piece(m);
            let gives_check = pos.gives_check(m);

            let mut new_depth = depth - 1;
            let delta = beta - alpha;
            let mut r = self.reduction(improving, depth, move_count, delta);

            // Step 13. Shallow-depth pruning
            if !root_node && pos.major_material(us) != 0 && !is_loss(best_value) {
                if move_count >= futility_move_count(improving, depth) {
                    mp.skip_quiet_moves();
                }

                let lmr_depth = new_depth - r / 1054;

                if capture || gives_check {
                    let captured = pos.piece_on(m.to_sq());
                    let capt_hist =
                        self.capture_history
                            .get(moved_piece, m.to_sq(), captured.piece_type())
                            as i32;

                    // Futility for captures
                    if !gives_check && lmr_depth < 18 && !in_check {
                        let futility_value = self.stack[ss].static_eval
                            + 332
                            + 371 * lmr_depth
                            + PIECE_VALUE[captured.index()]
                            + capt_hist / 5;
                        if futility_value <= alpha {
                            continue;
                        }
                    }

                    // SEE pruning for captures and checks
                    let see_hist = (capt_hist / 28).clamp(-243 * depth, 179 * depth);
                    if !pos.see_ge(m, -275 * depth - see_hist) {
                        continue;
                    }
                } else {
                    let cont0 = self
                        .continuation_history
                        .slice(self.stack[ss - 1].cont_hist)
                        .get(moved_piece, m.to_sq()) as i32;
                    let cont1 = self
                        .continuation_history
                        .slice(self.stack[ss - 2].cont_hist)
                        .get(moved_piece, m.to_sq()) as i32;
                    let mut history = cont0
                        + cont1
                        + self
                            .pawn_history
                            .get(pawn_structure_index(pos), moved_piece, m.to_sq())
                            as i32;

                    // Continuation-history pruning
                    if history < -3190 * depth {
                        continue;
                    }

                    history += 2 * self.main_history.get(us, m) as i32;

                    let mut lmr_depth = lmr_depth + history / 3718;

                    let futility_value = self.stack[ss].static_eval
                        + if best_value < self.stack[ss].static_eval - 45 {
                            215
                        } else {
                            96
                        }
                        + 120 * lmr_depth;

                    // Parent futility
                    if !in_check && lmr_depth < 10 && futility_value <= alpha {
                        if best_value <= futility_value
                            && !is_decisive(best_value)
                            && !is_win(futility_value)
                        {
                            best_value = futility_value;
                        }
                        continue;
                    }

                    lmr_depth = lmr_depth.max(0);

                    // Negative-SEE pruning
                    if !pos.see_ge(m, -36 * lmr_depth * lmr_depth) {
                        continue;
                    }
                }
            }

            // Step 14. Extensions
            if ply < self.root_depth * 2 {
                // Singular extension: the TT move stands alone
                if !root_node
                    && m == tt_data.mv
                    && excluded_move.is_none()
                    && depth >= 4 - i32::from(self.completed_depth > 32) + i32::from(tt_pv)
                    && is_valid(tt_data.value)
                    && !is_decisive(tt_data.value)
                    && tt_data.bound.admits(Bound::Lower)
                    && tt_data.depth >= depth - 3
                {
                    let singular_beta =
                        tt_data.value - (41 + 73 * i32::from(tt_pv && !pv_node)) * depth / 76;
                    let singular_depth = new_depth / 2;

                    self.stack[ss].excluded_move = m;
                    value = self.search::<NODE_NON_PV>(
                        pos,
                        ss,
                        singular_beta - 1,
                        singular_beta,
                        singular_depth,
                        cut_node,
                    );
                    self.stack[ss].excluded_move = Move::NONE;

                    if value < singular_beta {
                        let double_margin = 246 * i32::from(pv_node) - 108 * i32::from(!tt_capture);
                        let triple_margin = 132 + 334 * i32::from(pv_node)
                            - 279 * i32::from(!tt_capture)
                            + 68 * i32::from(tt_pv);

                        extension = 1
                            + i32::from(value < singular_beta - double_margin)
                            + i32::from(value < singular_beta - triple_margin);

                        depth += i32::from(!pv_node && depth < 20);
                    } else if value >= beta && !is_decisive(value) {
                        // Multi-cut: several moves already beat beta
                        return value;
                    } else if tt_data.value >= beta {
                        extension = -3;
                    } else if cut_node {
                        extension = -2;
                    }
                } else if pv_node
                    && prev_sq == Some(m.to_sq())
                    && self.capture_history.get(
                        moved_piece,
                        m.to_sq(),
                        pos.piece_on(m.to_sq()).piece_type(),
                    ) > 5255
                {
                    // Recapture extension
                    extension = 1;
                }
            }

            new_depth += extension;

            self.stack[ss].current_move = m;
            self.stack[ss].cont_hist = ContHistIndex {
                in_check,
                capture,
                piece: moved_piece,
                to: m.to_sq(),
            };
            let node_count_before = if root_node {
                self.nodes.load(Ordering::Relaxed)
            } else {
                0
            };

            // Step 15. Make the move
            self.nodes.fetch_add(1, Ordering::Relaxed);
            pos.do_move(m);

            // Reduction adjustments
            if tt_pv {
                r -= 1024
                    + i32::from(tt_data.value > alpha) * 1024
                    + i32::from(tt_data.depth >= depth) * 1024;
            }
            if pv_node {
                r -= 1024;
            }

            r += 330;
            r -= correction_value.abs() / 32768;

            if cut_node {
                r += 3179 - i32::from(tt_data.depth >= depth && tt_pv) * 949;
            }
            if tt_capture && !capture {
                r += 1401 + i32::from(depth < 8) * 1471;
            }
            if self.stack[ss + 1].cutoff_cnt > 3 {
                r += 1332 + i32::from(all_node) * 959;
            } else if m == tt_data.mv {
                r -= 2775;
            }

            let stat_score = if capture {
                7 * PIECE_VALUE[pos.captured_piece().index()]
                    + self.capture_history.get(
                        moved_piece,
                        m.to_sq(),
                        pos.captured_piece().piece_type(),
                    ) as i32
                    - 5000
            } else {
                2 * self.main_history.get(us, m) as i32
                    + self
                        .continuation_history
                        .slice(self.stack[ss - 1].cont_hist)
                        .get(moved_piece, m.to_sq()) as i32
                    + self
                        .continuation_history
                        .slice(self.stack[ss - 2].cont_hist)
                        .get(moved_piece, m.to_sq()) as i32
                    - 4241
            };
            self.stack[ss].stat_score = stat_score;
            r -= stat_score * 2652 / 18912;

            // Step 16. Late move reductions
            if depth >= 2 && move_count > 1 {
                let d = (new_depth - r / 1024)
                    .min(new_depth + i32::from(!all_node) + i32::from(pv_node && best_move.is_none()))
                    .max(1);

                value = -self.search::<NODE_NON_PV>(pos, ss + 1, -(alpha + 1), -alpha, d, true);

                if value > alpha && d < new_depth {
                    let do_deeper = value > best_value + 58 + 2 * new_depth;
                    let do_shallower = value < best_value + 8;
                    new_depth += i32::from(do_deeper) - i32::from(do_shallower);

                    if new_depth > d {
                        value = -self.search::<NODE_NON_PV>(
                            pos,
                            ss + 1,
                            -(alpha + 1),
                            -alpha,
                            new_depth,
                            !cut_node,
                        );
                    }

                    let bonus = i32::from(value >= beta) * 2048;
                    self.update_continuation_histories(ss, moved_piece, m.to_sq(), bonus);
                }
            }
            // Step 17. Full-depth zero-window search when LMR is skipped
            else if !pv_node || move_count > 1 {
                if !tt_data.mv.is_ok() {
                    r += 1744;
                }
                value = -self.search::<NODE_NON_PV>(
                    pos,
                    ss + 1,
                    -(alpha + 1),
                    -alpha,
                    new_depth - i32::from(r > 4047),
                    !cut_node,
                );
            } else {
                value = VALUE_ZERO; // overwritten by the PV search below
            }

            // Full PV search for the first move or after a fail high
            if pv_node && (move_count == 1 || value > alpha) {
                self.pv_table.clear(ply as usize + 1);

                if m == tt_data.mv && ply <= self.root_depth * 2 {
                    new_depth = new_depth.max(1);
                }

                value = -self.search::<NODE_PV>(pos, ss + 1, -beta, -alpha, new_depth, false);
            }

            // Step 18. Undo
            pos.undo_move(m);

            debug_assert!(value > -VALUE_INFINITE && value < VALUE_INFINITE);

            // Step 19. A stopped search leaves untrustworthy values
            if self.stop.load(Ordering::Relaxed) {
                return VALUE_ZERO;
            }

            if root_node {
                let nodes_now = self.nodes.load(Ordering::Relaxed);
                let rm = self
                    .root_moves
                    .iter_mut()
                    .find(|rm| rm.mv() == m)
                    .expect("root move list contains every searched root move");

                rm.effort += nodes_now - node_count_before;
                rm.average_score = if rm.average_score != -VALUE_INFINITE {
                    (2 * value + rm.average_score) / 3
                } else {
                    value
                };
                rm.mean_squared_score = if rm.mean_squared_score
                    != -(VALUE_INFINITE as i64) * (VALUE_INFINITE as i64)
                {
                    ((value as i64) * (value.abs() as i64) + rm.mean_squared_score) / 2
                } else {
                    (value as i64) * (value.abs() as i64)
                };

                if move_count == 1 || value > alpha {
                    rm.score = value;
                    rm.uci_score = value;
                    rm.sel_depth = self.sel_depth;
                    rm.score_lowerbound = false;
                    rm.score_upperbound = false;

                    if value >= beta {
                        rm.score_lowerbound = true;
                        rm.uci_score = beta;
                    } else if value <= alpha {
                        rm.score_upperbound = true;
                        rm.uci_score = alpha;
                    }

                    rm.pv.truncate(1);
                    rm.pv.extend_from_slice(self.pv_table.line(1));

                    if move_count > 1 && self.pv_idx == 0 {
                        self.best_move_changes += 1.0;
                    }
                } else {
                    rm.score = -VALUE_INFINITE;
                }
            }

            // Promote equal-scoring alternatives now and then, so long
            // plans do not get stuck on the first move found
            let inc = i32::from(
                value == best_value
                    && ply + 2 >= self.root_depth
                    && (self.nodes.load(Ordering::Relaxed) & 15) == 0
                    && !is_win(value.abs() + 1),
            );

            if value + inc > best_value {
                best_value = value;

                if value + inc > alpha {
                    best_move = m;

                    if pv_node && !root_node {
                        self.pv_table.update(ply as usize, m);
                    }

                    if value >= beta {
                        self.stack[ss].cutoff_cnt +=
                            i32::from(!tt_data.mv.is_ok()) + i32::from(extension < 2);
                        if !capture && m != self.stack[ss].killers[0] {
                            self.stack[ss].killers[1] = self.stack[ss].killers[0];
                            self.stack[ss].killers[0] = m;
                        }
                        break;
                    }

                    // Shrink the remaining effort after a score improvement
                    if depth > 2 && depth < 10 && !is_decisive(value) {
                        depth -= 2;
                    }
                    debug_assert!(depth > 0);
                    alpha = value;
                }
            }

            if m != best_move && move_count <= 32 {
                if capture {
                    captures_searched.push(m);
                } else {
                    quiets_searched.push(m);
                }
            }
        }

        // Step 20. Mate and stalemate detection, stats updates
        debug_assert!(
            move_count != 0 || !in_check || excluded_move.is_some()
                || movegen::legal_moves(pos).len() == 0
        );

        // Soften fail highs at non-PV nodes
        if !pv_node
            && best_value >= beta
            && !is_decisive(best_value)
            && !is_decisive(beta)
            && !is_decisive(alpha)
        {
            best_value = (best_value * depth + beta) / (depth + 1);
        }

        if move_count == 0 {
            // No legal moves: mated (or excluded-search fail low)
            best_value = if excluded_move.is_some() {
                alpha
            } else {
                mated_in(ply)
            };
        } else if best_move.is_some() {
            self.update_all_stats(
                pos,
                ss,
                best_move,
                prev_sq,
                &quiets_searched,
                &captures_searched,
                depth,
            );
        } else if let Some(psq) = prev_sq {
            if prior_capture.is_none() {
                // The opponent's quiet move refuted this whole subtree
                let mut bonus_scale = 184 * i32::from(depth > 6)
                    + 80 * i32::from(!all_node)
                    + 152 * i32::from(self.stack[ss - 1].move_count > 11)
                    + 77 * i32::from(
                        !in_check && best_value <= self.stack[ss].static_eval - 157,
                    )
                    + 169 * i32::from(
                        !self.stack[ss - 1].in_check
                            && best_value <= -self.stack[ss - 1].static_eval - 99,
                    );
                bonus_scale += (-self.stack[ss - 1].stat_score / 79).min(234);
                bonus_scale = bonus_scale.max(0);

                let scaled_bonus = stat_bonus(depth) * bonus_scale / 32;
                let pc = pos.piece_on(psq);
                self.update_continuation_histories(ss - 1, pc, psq, scaled_bonus * 416 / 1024);
                self.main_history
                    .update(!us, prev_move, scaled_bonus * 212 / 1024);
                if pc.piece_type() != PieceType::Pawn {
                    self.pawn_history.update(
                        pawn_structure_index(pos),
                        pc,
                        psq,
                        scaled_bonus * 1073 / 1024,
                    );
                }
            } else {
                // A capture led to the fail low: reward recapturing it
                let captured = pos.captured_piece();
                debug_assert!(captured.is_some());
                self.capture_history.update(
                    pos.piece_on(psq),
                    psq,
                    captured.piece_type(),
                    stat_bonus(depth) * 2,
                );
            }
        } else if tt_data.mv.is_ok() && !all_node {
            self.main_history
                .update(us, tt_data.mv, stat_bonus(depth) * 287 / 1024);
        }

        // An all-node below a ttPv parent is itself worth remembering
        if best_value <= alpha {
            self.stack[ss].tt_pv = tt_pv || (self.stack[ss - 1].tt_pv && depth > 3);
        }

        if excluded_move.is_none() && !(root_node && self.pv_idx > 0) {
            let bound = if best_value >= beta {
                Bound::Lower
            } else if pv_node && best_move.is_some() {
                Bound::Exact
            } else {
                Bound::Upper
            };
            tt_writer.write(
                pos_key,
                value_to_tt(best_value, ply),
                self.stack[ss].tt_pv,
                bound,
                depth,
                best_move,
                unadjusted_static_eval,
            );
        }

        // Track the static-eval error for future corrections
        if !in_check
            && !(best_move.is_some() && pos.capture(best_move))
            && ((best_value < self.stack[ss].static_eval && best_value < beta)
                || (best_value > self.stack[ss].static_eval && best_move.is_some()))
        {
            let bonus = ((best_value - self.stack[ss].static_eval) * depth / 8).clamp(
                -CORRECTION_HISTORY_LIMIT / 4,
                CORRECTION_HISTORY_LIMIT / 4,
            );
            self.pawn_correction_history
                .update(us, pos.pawn_key(), bonus * 148 / 128);
            self.major_correction_history
                .update(us, pos.major_key(), bonus * 185 / 128);
            self.minor_correction_history
                .update(us, pos.minor_key(), bonus * 101 / 128);
            self.non_pawn_correction_history[Color::White.index()].update(
                us,
                pos.non_pawn_key(Color::White),
                bonus * 139 / 128,
            );
            self.non_pawn_correction_history[Color::Black.index()].update(
                us,
                pos.non_pawn_key(Color::Black),
                bonus * 139 / 128,
            );

            if prev_move.is_ok() {
                let prev = self.stack[ss - 2].cont_hist;
                self.continuation_correction_history.update(
                    prev.piece,
                    prev.to,
                    pos.piece_on(prev_move.to_sq()),
                    prev_move.to_sq(),
                    bonus,
                );
            }
        }

        debug_assert!(best_value > -VALUE_INFINITE && best_value < VALUE_INFINITE);
        best_value
    }

    // =========================================================================
    // Quiescence search
    // =========================================================================

    fn qsearch<const PV: bool>(
        &mut self,
        pos: &mut Position,
        ss: usize,
        mut alpha: Value,
        mut beta: Value,
    ) -> Value {
        debug_assert!(alpha >= -VALUE_INFINITE && alpha < beta && beta <= VALUE_INFINITE);
        debug_assert!(PV || alpha == beta - 1);

        let ply = self.stack[ss].ply;
        let in_check = pos.in_check();
        let us = pos.side_to_move();

        if PV {
            self.pv_table.clear(ply as usize);
        }

        self.stack[ss].in_check = in_check;
        let mut best_move = Move::NONE;
        let mut move_count = 0;

        if PV && self.sel_depth < ply + 1 {
            self.sel_depth = ply + 1;
        }

        // Rule adjudication; the draw path stays unperturbed here
        match pos.rule_judge(ply) {
            RuleJudge::Terminal(v) => return v,
            RuleJudge::Hint(v) => {
                debug_assert!(v != VALUE_DRAW);
                if v > VALUE_DRAW {
                    alpha = alpha.max(VALUE_DRAW);
                } else {
                    beta = beta.min(VALUE_DRAW);
                }
                if alpha >= beta {
                    return alpha;
                }
            }
            RuleJudge::None => {}
        }

        if ply >= MAX_PLY as i32 {
            return if !in_check {
                self.evaluate(pos)
            } else {
                VALUE_DRAW
            };
        }

        // TT lookup at quiescence depth
        let pos_key = pos.key();
        let tt = Arc::clone(&self.tt);
        let (tt_hit, mut tt_data, tt_writer) = tt.probe(pos_key);
        self.stack[ss].tt_hit = tt_hit;
        tt_data.mv = if tt_hit { tt_data.mv } else { Move::NONE };
        tt_data.value = if tt_hit {
            value_from_tt(tt_data.value, ply, pos.rule60_count())
        } else {
            VALUE_NONE
        };
        let pv_hit = tt_hit && tt_data.is_pv;

        if !PV
            && tt_data.depth >= DEPTH_QS
            && is_valid(tt_data.value)
            && tt_data.bound.admits(if tt_data.value >= beta {
                Bound::Lower
            } else {
                Bound::Upper
            })
        {
            return tt_data.value;
        }

        // Static evaluation and stand pat
        let correction_value = self.correction_value(pos, ss);
        let mut unadjusted_static_eval = VALUE_NONE;
        let mut best_value;
        let futility_base;

        if in_check {
            best_value = -VALUE_INFINITE;
            futility_base = -VALUE_INFINITE;
        } else {
            if tt_hit {
                unadjusted_static_eval = if is_valid(tt_data.eval) {
                    tt_data.eval
                } else {
                    self.evaluate(pos)
                };
                best_value = to_corrected_static_eval(unadjusted_static_eval, correction_value);
                self.stack[ss].static_eval = best_value;

                if is_valid(tt_data.value)
                    && tt_data.bound.admits(if tt_data.value > best_value {
                        Bound::Lower
                    } else {
                        Bound::Upper
                    })
                {
                    best_value = tt_data.value;
                }
            } else {
                // After a null move the sign-flipped parent eval is free
                unadjusted_static_eval =
                    if self.stack[ss - 1].current_move != Move::NULL {
                        self.evaluate(pos)
                    } else {
                        -self.stack[ss - 1].static_eval
                    };
                best_value = to_corrected_static_eval(unadjusted_static_eval, correction_value);
                self.stack[ss].static_eval = best_value;
            }

            // Stand pat
            if best_value >= beta {
                if !is_decisive(best_value) {
                    best_value = (best_value + beta) / 2;
                }
                if !tt_hit {
                    tt_writer.write(
                        pos_key,
                        value_to_tt(best_value, ply),
                        false,
                        Bound::Lower,
                        DEPTH_UNSEARCHED,
                        Move::NONE,
                        unadjusted_static_eval,
                    );
                }
                return best_value;
            }

            if best_value > alpha {
                alpha = best_value;
            }

            futility_base = self.stack[ss].static_eval + 204;
        }

        let prev_move = self.stack[ss - 1].current_move;
        let prev_sq = if prev_move.is_ok() {
            Some(prev_move.to_sq())
        } else {
            None
        };

        let mut mp = MovePicker::new(pos, tt_data.mv, DEPTH_QS, [Move::NONE; 2]);

        loop {
            let m = {
                let ctx = self.pick_context(ss, pos);
                mp.next_move(pos, &ctx)
            };
            if m.is_none() {
                break;
            }
            debug_assert!(m.is_ok());

            if !pos.legal(m) {
                continue;
            }

            let gives_check = pos.gives_check(m);
            let capture = pos.capture(m);

            move_count += 1;

            // Pruning
            if !is_loss(best_value) && pos.major_material(us) != 0 {
                // Futility and move-count pruning
                if !gives_check && Some(m.to_sq()) != prev_sq && !is_loss(futility_base) {
                    if move_count > 2 {
                        continue;
                    }

                    let futility_value =
                        futility_base + PIECE_VALUE[pos.piece_on(m.to_sq()).index()];

                    if futility_value <= alpha {
                        best_value = best_value.max(futility_value);
                        continue;
                    }

                    if !pos.see_ge(m, alpha - futility_base) {
                        best_value = alpha.min(futility_base);
                        continue;
                    }
                }

                // Continuation-history pruning for quiet evasions
                if !capture {
                    let moved = pos.moved_piece(m);
                    let cont0 = self
                        .continuation_history
                        .slice(self.stack[ss - 1].cont_hist)
                        .get(moved, m.to_sq()) as i32;
                    let cont1 = self
                        .continuation_history
                        .slice(self.stack[ss - 2].cont_hist)
                        .get(moved, m.to_sq()) as i32;
                    let pawn = self
                        .pawn_history
                        .get(pawn_structure_index(pos), moved, m.to_sq())
                        as i32;
                    if cont0 + cont1 + pawn <= 3047 {
                        continue;
                    }
                }

                // SEE pruning
                if !pos.see_ge(m, -102) {
                    continue;
                }
            }

            self.stack[ss].current_move = m;
            self.stack[ss].cont_hist = ContHistIndex {
                in_check,
                capture,
                piece: pos.moved_piece(m),
                to: m.to_sq(),
            };

            self.nodes.fetch_add(1, Ordering::Relaxed);
            pos.do_move(m);
            let value = -self.qsearch::<PV>(pos, ss + 1, -beta, -alpha);
            pos.undo_move(m);

            debug_assert!(value > -VALUE_INFINITE && value < VALUE_INFINITE);

            if value > best_value {
                best_value = value;

                if value > alpha {
                    best_move = m;

                    if PV {
                        self.pv_table.update(ply as usize, m);
                    }

                    if value < beta {
                        alpha = value;
                    } else {
                        break;
                    }
                }
            }
        }

        // Mated: every in-check node without moves is checkmate here
        if best_value == -VALUE_INFINITE {
            debug_assert!(movegen::legal_moves(pos).len() == 0);
            return mated_in(ply);
        }

        if !is_decisive(best_value) && best_value >= beta {
            best_value = (3 * best_value + beta) / 4;
        }

        tt_writer.write(
            pos_key,
            value_to_tt(best_value, ply),
            pv_hit,
            if best_value >= beta {
                Bound::Lower
            } else {
                Bound::Upper
            },
            DEPTH_QS,
            best_move,
            unadjusted_static_eval,
        );

        debug_assert!(best_value > -VALUE_INFINITE && best_value < VALUE_INFINITE);
        best_value
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn reduction(&self, improving: bool, depth: Depth, move_count: i32, delta: Value) -> i32 {
        let d = (depth as usize).min(MAX_PLY - 1);
        let mn = (move_count as usize).min(MAX_PLY - 1);
        let reduction_scale = self.reductions[d] * self.reductions[mn];
        reduction_scale - delta * 1181 / self.root_delta.max(1)
            + i32::from(!improving) * reduction_scale / 3
            + 2199
    }

    fn evaluate(&self, pos: &Position) -> Value {
        eval::evaluate(
            self.evaluator.as_ref(),
            pos,
            self.optimism[pos.side_to_move().index()],
        )
    }

    /// Draw value with a one-bit node-count wiggle against three-fold
    /// blindness
    #[inline]
    fn value_draw(&self) -> Value {
        VALUE_DRAW - 1 + (self.nodes.load(Ordering::Relaxed) & 0x2) as Value
    }

    fn correction_value(&self, pos: &Position, ss: usize) -> i32 {
        let us = pos.side_to_move();
        let m = self.stack[ss - 1].current_move;

        let pcv = self.pawn_correction_history.get(us, pos.pawn_key()) as i32;
        let macv = self.major_correction_history.get(us, pos.major_key()) as i32;
        let micv = self.minor_correction_history.get(us, pos.minor_key()) as i32;
        let wnpcv = self.non_pawn_correction_history[Color::White.index()]
            .get(us, pos.non_pawn_key(Color::White)) as i32;
        let bnpcv = self.non_pawn_correction_history[Color::Black.index()]
            .get(us, pos.non_pawn_key(Color::Black)) as i32;
        let cntcv = if m.is_ok() {
            let prev = self.stack[ss - 2].cont_hist;
            self.continuation_correction_history.get(
                prev.piece,
                prev.to,
                pos.piece_on(m.to_sq()),
                m.to_sq(),
            ) as i32
        } else {
            0
        };

        4539 * pcv + 3697 * macv + 3347 * micv + 7373 * (wnpcv + bnpcv) + 8482 * cntcv
    }

    fn pick_context<'a>(&'a self, ss: usize, pos: &Position) -> PickContext<'a> {
        let cont = |i: usize| -> Option<&'a super::history::PieceToHistory> {
            Some(self.continuation_history.slice(self.stack[ss - i].cont_hist))
        };
        PickContext {
            main_history: &self.main_history,
            low_ply_history: &self.low_ply_history,
            capture_history: &self.capture_history,
            pawn_history: &self.pawn_history,
            pawn_index: pawn_structure_index(pos),
            cont_hist: [cont(1), cont(2), cont(3), cont(4), None, cont(6)],
            ply: self.stack[ss].ply,
        }
    }

    /// Histories of the move pairs at plies -1, -2, -3, -4 and -6
    fn update_continuation_histories(&mut self, ss: usize, pc: Piece, to: Square, bonus: i32) {
        const CONT_BONUS: [(usize, i32); 5] = [(1, 1024), (2, 571), (3, 339), (4, 500), (6, 592)];
        let in_check = self.stack[ss].in_check;
        for (i, weight) in CONT_BONUS {
            if in_check && i > 2 {
                break;
            }
            if self.stack[ss - i].current_move.is_ok() {
                let idx = self.stack[ss - i].cont_hist;
                self.continuation_history
                    .slice_mut(idx)
                    .update(pc, to, bonus * weight / 1024);
            }
        }
    }

    fn update_quiet_histories(&mut self, pos: &Position, ss: usize, m: Move, bonus: i32) {
        let us = pos.side_to_move();
        self.main_history.update(us, m, bonus);

        let ply = self.stack[ss].ply;
        if (ply as usize) < LOW_PLY_HISTORY_SIZE {
            self.low_ply_history
                .update(ply as usize, m, bonus * 874 / 1024);
        }

        self.update_continuation_histories(ss, pos.moved_piece(m), m.to_sq(), bonus * 853 / 1024);

        self.pawn_history.update(
            pawn_structure_index(pos),
            pos.moved_piece(m),
            m.to_sq(),
            bonus * 628 / 1024,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn update_all_stats(
        &mut self,
        pos: &Position,
        ss: usize,
        best_move: Move,
        prev_sq: Option<Square>,
        quiets_searched: &[Move],
        captures_searched: &[Move],
        depth: Depth,
    ) {
        let bonus = stat_bonus(depth);
        let malus = stat_malus(depth);

        if !pos.capture(best_move) {
            self.update_quiet_histories(pos, ss, best_move, bonus * 1131 / 1024);
            for &m in quiets_searched {
                self.update_quiet_histories(pos, ss, m, -malus * 1028 / 1024);
            }
        } else {
            let moved = pos.moved_piece(best_move);
            let captured = pos.piece_on(best_move.to_sq()).piece_type();
            self.capture_history
                .update(moved, best_move.to_sq(), captured, bonus * 1291 / 1024);
        }

        // A refuted early quiet from the previous ply loses credit
        if let Some(psq) = prev_sq {
            if self.stack[ss - 1].move_count
                == 1 + i32::from(self.stack[ss - 1].tt_hit)
                && pos.captured_piece().is_none()
            {
                let pc = pos.piece_on(psq);
                self.update_continuation_histories(ss - 1, pc, psq, -malus * 919 / 1024);
            }
        }

        for &m in captures_searched {
            let moved = pos.moved_piece(m);
            let captured = pos.piece_on(m.to_sq()).piece_type();
            self.capture_history
                .update(moved, m.to_sq(), captured, -malus * 1090 / 1024);
        }
    }

    // =========================================================================
    // Time checks and output
    // =========================================================================

    fn check_time(&mut self) {
        let Some(mgr) = self.manager.as_mut() else {
            return;
        };
        mgr.calls_cnt -= 1;
        if mgr.calls_cnt > 0 {
            return;
        }
        mgr.calls_cnt = if self.limits.nodes != 0 {
            (self.limits.nodes / 1024).min(512) as i32
        } else {
            512
        };

        if mgr.ponder.load(Ordering::Relaxed) {
            return;
        }

        let total_nodes = if self.node_counters.is_empty() {
            self.nodes.load(Ordering::Relaxed)
        } else {
            self.node_counters
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .sum()
        };
        let elapsed = mgr.tm.elapsed(|| total_nodes);

        if self.completed_depth >= 1
            && ((self.limits.use_time_management()
                && (elapsed > mgr.tm.maximum()
                    || mgr.stop_on_ponderhit.load(Ordering::Relaxed)))
                || (self.limits.movetime != 0 && elapsed >= self.limits.movetime)
                || (self.limits.nodes != 0 && total_nodes >= self.limits.nodes))
        {
            self.stop.store(true, Ordering::Release);
            self.aborted.store(true, Ordering::Release);
        }
    }

    /// Print `info` lines for the multipv window
    fn emit_pv(&self, depth: Depth) {
        let Some(mgr) = self.manager.as_ref() else {
            return;
        };
        if mgr.silent {
            return;
        }

        let nodes = self.nodes_searched();
        let time_ms = mgr.tm.elapsed_time().max(1);
        let multi_pv = self.multi_pv.min(self.root_moves.len());
        let hashfull = self.tt.hashfull();

        for i in 0..multi_pv {
            let rm = &self.root_moves[i];
            let updated = rm.score != -VALUE_INFINITE;
            if depth == 1 && !updated && i > 0 {
                continue;
            }

            let d = if updated { depth } else { (depth - 1).max(1) };
            let v = if updated {
                rm.uci_score
            } else if rm.previous_score == -VALUE_INFINITE {
                VALUE_ZERO
            } else {
                rm.previous_score
            };

            let mut line = format!(
                "info depth {} seldepth {} multipv {} score {}",
                d,
                rm.sel_depth,
                i + 1,
                uci::format_score(v, &self.root_pos)
            );
            if i == self.pv_idx && updated {
                if rm.score_lowerbound {
                    line.push_str(" lowerbound");
                } else if rm.score_upperbound {
                    line.push_str(" upperbound");
                }
            }
            if mgr.show_wdl {
                line.push_str(&format!(" wdl {}", uci::format_wdl(v, &self.root_pos)));
            }
            line.push_str(&format!(
                " nodes {} nps {} hashfull {} time {} pv",
                nodes,
                nodes * 1000 / time_ms as u64,
                hashfull,
                time_ms
            ));
            for m in &rm.pv {
                line.push(' ');
                line.push_str(&m.to_string());
            }
            println!("{line}");
        }
    }
}

/// Futility margin by depth, shaped by node expectations
fn futility_margin(d: Depth, no_tt_cut_node: bool, improving: bool, opp_worsening: bool) -> Value {
    let futility_mult = 140 - 33 * i32::from(no_tt_cut_node);
    let improving_deduction = i32::from(improving) * futility_mult * 2;
    let worsening_deduction = i32::from(opp_worsening) * futility_mult / 3;
    futility_mult * d - improving_deduction - worsening_deduction
}

/// Late quiets beyond this count are skipped at shallow depth
const fn futility_move_count(improving: bool, depth: Depth) -> i32 {
    (3 + depth * depth) / (2 - improving as i32)
}

/// Apply the correction history to a raw static eval, staying clear of
/// the mate range
fn to_corrected_static_eval(v: Value, cv: i32) -> Value {
    (v + cv / 131072).clamp(VALUE_MATED_IN_MAX_PLY + 1, VALUE_MATE_IN_MAX_PLY - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::MaterialEvaluator;

    fn make_worker() -> Worker {
        crate::bitboard::init();
        let tt = Arc::new(TranspositionTable::new(4));
        let stop = Arc::new(AtomicBool::new(false));
        let aborted = Arc::new(AtomicBool::new(false));
        let increase = Arc::new(AtomicBool::new(true));
        let mut w = Worker::new(
            tt,
            Arc::new(MaterialEvaluator),
            stop,
            aborted,
            increase,
            0,
        );
        let ponder = Arc::new(AtomicBool::new(false));
        let soph = Arc::new(AtomicBool::new(false));
        let mut mgr = SearchManager::new(ponder, soph);
        mgr.silent = true;
        w.manager = Some(mgr);
        w
    }

    fn search_fen(fen: &str, depth: Depth) -> (Move, Value) {
        let mut w = make_worker();
        let pos = Position::from_fen(fen).unwrap();
        let limits = LimitsType {
            depth,
            ..LimitsType::default()
        };
        w.prepare_search(&pos, limits, 1);
        w.start_searching();
        (w.root_moves[0].mv(), w.root_moves[0].score)
    }

    #[test]
    fn test_startpos_depth1_returns_legal_move() {
        let mut w = make_worker();
        let pos = Position::startpos();
        let limits = LimitsType {
            depth: 1,
            ..LimitsType::default()
        };
        w.prepare_search(&pos, limits, 1);
        assert_eq!(w.root_moves.len(), 44);
        w.start_searching();
        let best = w.root_moves[0].mv();
        assert!(movegen::legal_moves(&pos).contains(best));
        assert!(w.root_moves[0].score > -VALUE_INFINITE);
    }

    #[test]
    fn test_finds_mate_in_one() {
        // Ladder mate: rook a0 goes to a9 while rook b8 seals rank 8
        let (best, score) = search_fen("4k4/1R7/9/9/9/9/9/9/9/R2K5 w", 4);
        assert_eq!(score, mate_in(1), "score {score}");
        assert_eq!(best.to_string(), "a0a9");
    }

    #[test]
    fn test_search_is_deterministic_single_thread() {
        let (m1, s1) = search_fen(crate::position::START_FEN, 5);
        let (m2, s2) = search_fen(crate::position::START_FEN, 5);
        assert_eq!(m1, m2);
        assert_eq!(s1, s2);
    }

    #[test]
    fn test_node_limit_stops_search() {
        let mut w = make_worker();
        let pos = Position::startpos();
        let limits = LimitsType {
            nodes: 2000,
            ..LimitsType::default()
        };
        w.prepare_search(&pos, limits, 1);
        w.start_searching();
        // Some slack: the limit is polled every few hundred nodes
        assert!(w.nodes_searched() < 600_000);
        assert!(w.root_moves[0].mv().is_ok());
    }

    #[test]
    fn test_deeper_search_not_weaker_on_tactics() {
        // Hanging rook on the shared file: capture it at any depth
        let fen = "3k5/9/9/9/9/3r5/9/9/9/3RK4 w";
        let (m1, _) = search_fen(fen, 1);
        let (m4, _) = search_fen(fen, 4);
        let pos = Position::from_fen(fen).unwrap();
        assert!(pos.capture(m1) || pos.capture(m4));
    }

    #[test]
    fn test_futility_margin_shape() {
        assert!(futility_margin(4, false, false, false) > futility_margin(1, false, false, false));
        assert!(
            futility_margin(4, false, true, false) < futility_margin(4, false, false, false)
        );
    }

    #[test]
    fn test_futility_move_count_grows() {
        assert!(futility_move_count(false, 2) < futility_move_count(false, 6));
        assert!(futility_move_count(true, 4) > futility_move_count(false, 4));
    }

    #[test]
    fn test_corrected_eval_clamped() {
        let v = to_corrected_static_eval(VALUE_MATE_IN_MAX_PLY + 100, i32::MAX / 2);
        assert!(v < VALUE_MATE_IN_MAX_PLY);
        let v = to_corrected_static_eval(-VALUE_MATE, i32::MIN / 2);
        assert!(v > VALUE_MATED_IN_MAX_PLY);
    }
}
