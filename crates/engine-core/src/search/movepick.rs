//! Staged move ordering
//!
//! Emits moves one at a time without materializing the full list up
//! front. Stage order in the main search:
//!
//! 1. `MainTT` - the transposition move
//! 2. `CaptureInit` / `GoodCapture` - winning captures by SEE
//! 3. `Killer` - stored killer quiets
//! 4. `QuietInit` / `GoodQuiet` - quiets by history score
//! 5. `BadCapture` - captures deferred by SEE
//! 6. `BadQuiet` - the quiet tail
//!
//! Evasion, quiescence and probcut stage families mirror the same
//! machinery with reduced scope.

use crate::movegen::{generate, GenType, MoveList};
use crate::position::Position;
use crate::types::{Depth, ExtMove, Move, Value, DEPTH_QS, MAX_MOVES, PIECE_VALUE};

use super::history::{
    ButterflyHistory, CapturePieceToHistory, LowPlyHistory, PawnHistory, PieceToHistory,
    LOW_PLY_HISTORY_SIZE,
};

/// Histories the picker scores with, borrowed per call so the caller
/// can update them between emitted moves.
pub struct PickContext<'a> {
    pub main_history: &'a ButterflyHistory,
    pub low_ply_history: &'a LowPlyHistory,
    pub capture_history: &'a CapturePieceToHistory,
    pub pawn_history: &'a PawnHistory,
    pub pawn_index: usize,
    pub cont_hist: [Option<&'a PieceToHistory>; 6],
    pub ply: i32,
}

/// Quiets below this score are deferred to the bad-quiet stage
const GOOD_QUIET_THRESHOLD: i32 = -14000;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Stage {
    MainTT,
    CaptureInit,
    GoodCapture,
    Killer,
    QuietInit,
    GoodQuiet,
    BadCapture,
    BadQuiet,

    EvasionTT,
    EvasionInit,
    Evasion,

    QSearchTT,
    QCaptureInit,
    QCapture,

    ProbCutTT,
    ProbCutInit,
    ProbCut,
}

/// Staged move picker
pub struct MovePicker {
    stage: Stage,
    tt_move: Move,
    killers: [Move; 2],
    probcut_threshold: Value,
    depth: Depth,
    skip_quiets: bool,

    moves: [ExtMove; MAX_MOVES],
    cur: usize,
    end_cur: usize,
    end_bad_captures: usize,
    end_captures: usize,
    end_generated: usize,
    killer_idx: usize,
    emitted_killers: [Move; 2],
}

impl MovePicker {
    /// Main-search and quiescence constructor
    pub fn new(pos: &Position, tt_move: Move, depth: Depth, killers: [Move; 2]) -> MovePicker {
        let tt_ok = tt_move.is_ok() && pos.pseudo_legal(tt_move);
        let stage = if pos.in_check() {
            if tt_ok {
                Stage::EvasionTT
            } else {
                Stage::EvasionInit
            }
        } else if depth > DEPTH_QS {
            if tt_ok {
                Stage::MainTT
            } else {
                Stage::CaptureInit
            }
        } else if tt_ok {
            Stage::QSearchTT
        } else {
            Stage::QCaptureInit
        };

        MovePicker {
            stage,
            tt_move,
            killers,
            probcut_threshold: 0,
            depth,
            skip_quiets: false,
            moves: [ExtMove::new(Move::NONE, 0); MAX_MOVES],
            cur: 0,
            end_cur: 0,
            end_bad_captures: 0,
            end_captures: 0,
            end_generated: 0,
            killer_idx: 0,
            emitted_killers: [Move::NONE; 2],
        }
    }

    /// ProbCut constructor: captures with SEE at least `threshold`
    pub fn new_probcut(pos: &Position, tt_move: Move, threshold: Value) -> MovePicker {
        debug_assert!(!pos.in_check());
        let stage = if tt_move.is_ok()
            && pos.capture(tt_move)
            && pos.pseudo_legal(tt_move)
            && pos.see_ge(tt_move, threshold)
        {
            Stage::ProbCutTT
        } else {
            Stage::ProbCutInit
        };

        MovePicker {
            stage,
            tt_move,
            killers: [Move::NONE; 2],
            probcut_threshold: threshold,
            depth: DEPTH_QS,
            skip_quiets: false,
            moves: [ExtMove::new(Move::NONE, 0); MAX_MOVES],
            cur: 0,
            end_cur: 0,
            end_bad_captures: 0,
            end_captures: 0,
            end_generated: 0,
            killer_idx: 0,
            emitted_killers: [Move::NONE; 2],
        }
    }

    /// Stop emitting quiets; only bad captures remain after this
    pub fn skip_quiet_moves(&mut self) {
        self.skip_quiets = true;
    }

    /// Next pseudo-legal move, or `Move::NONE` when exhausted
    pub fn next_move(&mut self, pos: &Position, ctx: &PickContext) -> Move {
        loop {
            match self.stage {
                Stage::MainTT | Stage::EvasionTT | Stage::QSearchTT | Stage::ProbCutTT => {
                    self.stage = match self.stage {
                        Stage::MainTT => Stage::CaptureInit,
                        Stage::EvasionTT => Stage::EvasionInit,
                        Stage::QSearchTT => Stage::QCaptureInit,
                        _ => Stage::ProbCutInit,
                    };
                    return self.tt_move;
                }

                Stage::CaptureInit | Stage::QCaptureInit | Stage::ProbCutInit => {
                    self.cur = 0;
                    self.end_bad_captures = 0;
                    let mut list = MoveList::new();
                    generate(pos, GenType::Captures, &mut list);
                    let count = list.len();
                    for (i, m) in list.iter().enumerate() {
                        self.moves[i] = ExtMove::new(*m, 0);
                    }
                    self.end_cur = count;
                    self.end_captures = count;

                    self.score_captures(pos, ctx);
                    partial_insertion_sort(&mut self.moves[..self.end_cur], i32::MIN);

                    self.stage = match self.stage {
                        Stage::CaptureInit => Stage::GoodCapture,
                        Stage::QCaptureInit => Stage::QCapture,
                        _ => Stage::ProbCut,
                    };
                }

                Stage::GoodCapture => {
                    if let Some(m) = self.select_good_capture(pos) {
                        return m;
                    }
                    self.stage = Stage::Killer;
                }

                Stage::Killer => {
                    while self.killer_idx < 2 {
                        let k = self.killers[self.killer_idx];
                        self.killer_idx += 1;
                        if k.is_ok()
                            && k != self.tt_move
                            && !self.skip_quiets
                            && pos.pseudo_legal(k)
                            && !pos.capture(k)
                        {
                            self.emitted_killers[self.killer_idx - 1] = k;
                            return k;
                        }
                    }
                    self.stage = Stage::QuietInit;
                }

                Stage::QuietInit => {
                    if !self.skip_quiets {
                        let mut list = MoveList::new();
                        generate(pos, GenType::Quiets, &mut list);
                        let count = list.len();
                        for (i, m) in list.iter().enumerate() {
                            self.moves[self.end_captures + i] = ExtMove::new(*m, 0);
                        }
                        self.end_cur = self.end_captures + count;
                        self.end_generated = self.end_cur;
                        self.cur = self.end_captures;

                        self.score_quiets(pos, ctx);
                        let threshold = -3560 * self.depth;
                        partial_insertion_sort(&mut self.moves[self.cur..self.end_cur], threshold);
                    }
                    self.stage = Stage::GoodQuiet;
                }

                Stage::GoodQuiet => {
                    if !self.skip_quiets {
                        if let Some(m) = self.select(|ext| ext.value > GOOD_QUIET_THRESHOLD) {
                            return m;
                        }
                    }
                    // Rewind to the deferred bad captures
                    self.cur = 0;
                    self.end_cur = self.end_bad_captures;
                    self.stage = Stage::BadCapture;
                }

                Stage::BadCapture => {
                    if let Some(m) = self.select(|_| true) {
                        return m;
                    }
                    self.cur = self.end_captures;
                    self.end_cur = self.end_generated;
                    self.stage = Stage::BadQuiet;
                }

                Stage::BadQuiet => {
                    if !self.skip_quiets {
                        if let Some(m) = self.select(|ext| ext.value <= GOOD_QUIET_THRESHOLD) {
                            return m;
                        }
                    }
                    return Move::NONE;
                }

                Stage::EvasionInit => {
                    // Over-generate: every pseudo-legal move is a
                    // candidate evasion, legality filtering is the
                    // caller's job anyway
                    let mut list = MoveList::new();
                    generate(pos, GenType::NonEvasions, &mut list);
                    let count = list.len();
                    for (i, m) in list.iter().enumerate() {
                        self.moves[i] = ExtMove::new(*m, 0);
                    }
                    self.cur = 0;
                    self.end_cur = count;
                    self.end_generated = count;

                    self.score_evasions(pos, ctx);
                    partial_insertion_sort(&mut self.moves[..self.end_cur], i32::MIN);

                    self.stage = Stage::Evasion;
                }

                Stage::Evasion => {
                    return self.select(|_| true).unwrap_or(Move::NONE);
                }

                Stage::QCapture => {
                    return self.select(|_| true).unwrap_or(Move::NONE);
                }

                Stage::ProbCut => {
                    let threshold = self.probcut_threshold;
                    return self
                        .select_with_pos(pos, |pos, ext| pos.see_ge(ext.mv, threshold))
                        .unwrap_or(Move::NONE);
                }
            }
        }
    }

    // =========================================================================
    // Scoring
    // =========================================================================

    fn score_captures(&mut self, pos: &Position, ctx: &PickContext) {
        for i in self.cur..self.end_cur {
            let m = self.moves[i].mv;
            let to = m.to_sq();
            let pc = pos.moved_piece(m);
            let captured = pos.piece_on(to);

            let mut value = ctx.capture_history.get(pc, to, captured.piece_type()) as i32;
            value += 6 * PIECE_VALUE[captured.index()];
            self.moves[i].value = value;
        }
    }

    fn score_quiets(&mut self, pos: &Position, ctx: &PickContext) {
        let us = pos.side_to_move();

        for i in self.cur..self.end_cur {
            let m = self.moves[i].mv;
            let to = m.to_sq();
            let pc = pos.moved_piece(m);
            let mut value = 0i32;

            value += 2 * ctx.main_history.get(us, m) as i32;
            value += 2 * ctx.pawn_history.get(ctx.pawn_index, pc, to) as i32;

            for idx in [0, 1, 2, 3, 5] {
                if let Some(ch) = ctx.cont_hist[idx] {
                    value += ch.get(pc, to) as i32;
                }
            }

            if (ctx.ply as usize) < LOW_PLY_HISTORY_SIZE {
                let ply_idx = ctx.ply as usize;
                value += 8 * ctx.low_ply_history.get(ply_idx, m) as i32 / (1 + ctx.ply);
            }

            self.moves[i].value = value;
        }
    }

    fn score_evasions(&mut self, pos: &Position, ctx: &PickContext) {
        let us = pos.side_to_move();

        for i in self.cur..self.end_cur {
            let m = self.moves[i].mv;
            let to = m.to_sq();
            let pc = pos.moved_piece(m);

            if pos.capture(m) {
                // Capturing the checker first
                self.moves[i].value = PIECE_VALUE[pos.piece_on(to).index()] + (1 << 28);
            } else {
                let mut value = ctx.main_history.get(us, m) as i32;
                if let Some(ch) = ctx.cont_hist[0] {
                    value += ch.get(pc, to) as i32;
                }
                if (ctx.ply as usize) < LOW_PLY_HISTORY_SIZE {
                    let ply_idx = ctx.ply as usize;
                    value += 2 * ctx.low_ply_history.get(ply_idx, m) as i32 / (1 + ctx.ply);
                }
                self.moves[i].value = value;
            }
        }
    }

    // =========================================================================
    // Selection
    // =========================================================================

    fn select_good_capture(&mut self, pos: &Position) -> Option<Move> {
        while self.cur < self.end_cur {
            let ext = self.moves[self.cur];
            self.cur += 1;

            if ext.mv == self.tt_move {
                continue;
            }

            // Losing captures wait for the bad-capture stage
            let threshold = -ext.value / 18;
            if pos.see_ge(ext.mv, threshold) {
                return Some(ext.mv);
            }
            self.moves.swap(self.end_bad_captures, self.cur - 1);
            self.end_bad_captures += 1;
        }
        None
    }

    fn select<F>(&mut self, filter: F) -> Option<Move>
    where
        F: Fn(&ExtMove) -> bool,
    {
        while self.cur < self.end_cur {
            let ext = self.moves[self.cur];
            self.cur += 1;

            if ext.mv == self.tt_move || self.is_emitted_killer(ext.mv) {
                continue;
            }
            if filter(&ext) {
                return Some(ext.mv);
            }
        }
        None
    }

    fn select_with_pos<F>(&mut self, pos: &Position, filter: F) -> Option<Move>
    where
        F: Fn(&Position, &ExtMove) -> bool,
    {
        while self.cur < self.end_cur {
            let ext = self.moves[self.cur];
            self.cur += 1;

            if ext.mv == self.tt_move {
                continue;
            }
            if filter(pos, &ext) {
                return Some(ext.mv);
            }
        }
        None
    }

    /// Killers already emitted by the killer stage
    fn is_emitted_killer(&self, m: Move) -> bool {
        m == self.emitted_killers[0] || m == self.emitted_killers[1]
    }
}

/// Sort the prefix of moves scoring at least `limit`, descending
fn partial_insertion_sort(moves: &mut [ExtMove], limit: i32) {
    let mut sorted_end = 0;

    for p in 1..moves.len() {
        if moves[p].value >= limit {
            let tmp = moves[p];
            moves[p] = moves[sorted_end + 1];
            sorted_end += 1;

            let mut q = sorted_end;
            while q > 0 && moves[q - 1].value < tmp.value {
                moves[q] = moves[q - 1];
                q -= 1;
            }
            moves[q] = tmp;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::history::{
        ButterflyHistory, CapturePieceToHistory, LowPlyHistory, PawnHistory,
    };

    struct Bundle {
        main: ButterflyHistory,
        low: LowPlyHistory,
        cap: CapturePieceToHistory,
        pawn: PawnHistory,
    }

    impl Bundle {
        fn new() -> Bundle {
            Bundle {
                main: ButterflyHistory::new(),
                low: LowPlyHistory::new(),
                cap: CapturePieceToHistory::new(),
                pawn: PawnHistory::new(),
            }
        }

        fn ctx(&self) -> PickContext<'_> {
            PickContext {
                main_history: &self.main,
                low_ply_history: &self.low,
                capture_history: &self.cap,
                pawn_history: &self.pawn,
                pawn_index: 0,
                cont_hist: [None; 6],
                ply: 0,
            }
        }
    }

    fn drain(pos: &Position, mut mp: MovePicker, ctx: &PickContext) -> Vec<Move> {
        let mut out = Vec::new();
        loop {
            let m = mp.next_move(pos, ctx);
            if m.is_none() {
                break;
            }
            out.push(m);
        }
        out
    }

    #[test]
    fn test_emits_all_pseudo_legal_once() {
        let pos = Position::startpos();
        let b = Bundle::new();
        let mp = MovePicker::new(&pos, Move::NONE, 8, [Move::NONE; 2]);
        let emitted = drain(&pos, mp, &b.ctx());

        let mut all = MoveList::new();
        generate(&pos, GenType::NonEvasions, &mut all);
        assert_eq!(emitted.len(), all.len());

        let mut seen = std::collections::HashSet::new();
        for m in &emitted {
            assert!(seen.insert(*m), "duplicate {m}");
        }
    }

    #[test]
    fn test_tt_move_first() {
        let pos = Position::startpos();
        let b = Bundle::new();
        let mut all = MoveList::new();
        generate(&pos, GenType::Quiets, &mut all);
        let tt = *all.iter().next().unwrap();
        let mp = MovePicker::new(&pos, tt, 8, [Move::NONE; 2]);
        let emitted = drain(&pos, mp, &b.ctx());
        assert_eq!(emitted[0], tt);
        assert_eq!(emitted.iter().filter(|m| **m == tt).count(), 1);
    }

    #[test]
    fn test_captures_before_quiets() {
        // Position with an en-prise pawn: capture comes out first
        let pos =
            Position::from_fen("3k5/9/9/9/9/3p5/9/9/9/3RK4 w").unwrap();
        let b = Bundle::new();
        let mp = MovePicker::new(&pos, Move::NONE, 8, [Move::NONE; 2]);
        let emitted = drain(&pos, mp, &b.ctx());
        assert!(pos.capture(emitted[0]), "first move {} not a capture", emitted[0]);
    }

    #[test]
    fn test_qsearch_mode_yields_captures_only() {
        let pos =
            Position::from_fen("3k5/9/9/9/9/3p5/9/9/9/3RK4 w").unwrap();
        let b = Bundle::new();
        let mp = MovePicker::new(&pos, Move::NONE, DEPTH_QS, [Move::NONE; 2]);
        let emitted = drain(&pos, mp, &b.ctx());
        assert!(!emitted.is_empty());
        for m in emitted {
            assert!(pos.capture(m), "{m} is not a capture");
        }
    }

    #[test]
    fn test_skip_quiets() {
        let pos = Position::startpos();
        let b = Bundle::new();
        let mut mp = MovePicker::new(&pos, Move::NONE, 8, [Move::NONE; 2]);
        mp.skip_quiet_moves();
        let ctx = b.ctx();
        loop {
            let m = mp.next_move(&pos, &ctx);
            if m.is_none() {
                break;
            }
            assert!(pos.capture(m), "{m} should have been skipped");
        }
    }

    #[test]
    fn test_evasions_when_in_check() {
        let pos = Position::from_fen("4k4/9/9/9/4p4/4C4/9/9/9/4K4 b").unwrap();
        assert!(pos.in_check());
        let b = Bundle::new();
        let mp = MovePicker::new(&pos, Move::NONE, 8, [Move::NONE; 2]);
        let emitted = drain(&pos, mp, &b.ctx());
        // At least the legal evasions must be among the emitted moves
        let legal = crate::movegen::legal_moves(&pos);
        for m in legal.iter() {
            assert!(emitted.contains(m), "missing evasion {m}");
        }
    }

    #[test]
    fn test_partial_insertion_sort() {
        let mut moves = [
            ExtMove::new(Move::from_raw(1), 100),
            ExtMove::new(Move::from_raw(2), 50),
            ExtMove::new(Move::from_raw(3), 200),
            ExtMove::new(Move::from_raw(4), 10),
            ExtMove::new(Move::from_raw(5), 150),
        ];
        partial_insertion_sort(&mut moves, 100);
        assert_eq!(moves[0].value, 200);
        assert_eq!(moves[1].value, 150);
        assert_eq!(moves[2].value, 100);
    }

    #[test]
    fn test_killer_emitted_after_captures() {
        let pos = Position::startpos();
        let b = Bundle::new();
        let mut quiets = MoveList::new();
        generate(&pos, GenType::Quiets, &mut quiets);
        let killer = *quiets.iter().nth(5).unwrap();
        let mp = MovePicker::new(&pos, Move::NONE, 8, [killer, Move::NONE]);
        let emitted = drain(&pos, mp, &b.ctx());
        // No captures at startpos, so the killer leads
        assert_eq!(emitted[0], killer);
        assert_eq!(emitted.iter().filter(|m| **m == killer).count(), 1);
    }
}
