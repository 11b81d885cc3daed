//! Board state and move execution

use crate::bitboard::{
    advisor_attacks, bishop_attacks, cannon_attacks, king_attacks, knight_attacks,
    knight_attacks_to, pawn_attacks, pawn_attacks_to, rook_attacks, Bitboard,
};
use crate::types::{
    mate_in, mated_in, Color, File, Move, Piece, PieceType, Rank, Square, Value, PIECE_VALUE,
    VALUE_DRAW,
};

use super::state::{DirtyPiece, StateInfo};
use super::zobrist::ZOBRIST;

/// Start position in FEN form
pub const START_FEN: &str = "rnbakabnr/9/1c5c1/p1p1p1p1p/9/9/P1P1P1P1P/1C5C1/9/RNBAKABNR w";

/// FEN parse failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FenError(pub String);

impl std::fmt::Display for FenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bad fen: {}", self.0)
    }
}

impl std::error::Error for FenError {}

/// Outcome of the repetition / 60-move judgment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleJudge {
    /// No rule applies
    None,
    /// Position is terminal by rule with this value
    Terminal(Value),
    /// Two-fold repetition whose three-fold would be decisive; the
    /// value bounds what search can prove on this line
    Hint(Value),
}

/// A full xiangqi position with its reversible history
#[derive(Clone)]
pub struct Position {
    board: [Piece; Square::NUM],
    by_type: [Bitboard; PieceType::NUM],
    by_color: [Bitboard; Color::NUM],
    side_to_move: Color,
    game_ply: i32,
    states: Vec<StateInfo>,
}

impl Position {
    /// Parse a FEN string
    pub fn from_fen(fen: &str) -> Result<Position, FenError> {
        let mut pos = Position {
            board: [Piece::NONE; Square::NUM],
            by_type: [Bitboard::EMPTY; PieceType::NUM],
            by_color: [Bitboard::EMPTY; Color::NUM],
            side_to_move: Color::White,
            game_ply: 0,
            states: Vec::with_capacity(256),
        };

        let mut parts = fen.split_whitespace();
        let board_part = parts.next().ok_or_else(|| FenError("empty".into()))?;

        let rows: Vec<&str> = board_part.split('/').collect();
        if rows.len() != 10 {
            return Err(FenError(format!("{} rows", rows.len())));
        }
        for (i, row) in rows.iter().enumerate() {
            let rank = 9 - i as u8;
            let mut file = 0u8;
            for c in row.chars() {
                if let Some(d) = c.to_digit(10) {
                    file += d as u8;
                } else {
                    let pc = Piece::from_char(c)
                        .ok_or_else(|| FenError(format!("bad piece '{c}'")))?;
                    if file >= 9 {
                        return Err(FenError(format!("row {row} too long")));
                    }
                    let sq = Square::new(
                        File::from_u8(file).unwrap(),
                        Rank::from_u8(rank).unwrap(),
                    );
                    pos.put_piece(pc, sq);
                    file += 1;
                }
            }
            if file != 9 {
                return Err(FenError(format!("row {row} has {file} files")));
            }
        }

        pos.side_to_move = match parts.next() {
            Some("w") | None => Color::White,
            Some("b") => Color::Black,
            Some(x) => return Err(FenError(format!("bad side '{x}'"))),
        };

        // Skip the castling/en-passant placeholders when present
        let mut rest: Vec<&str> = parts.collect();
        rest.retain(|t| *t != "-");
        let rule60 = rest.first().and_then(|t| t.parse::<i32>().ok()).unwrap_or(0);
        let fullmove = rest.get(1).and_then(|t| t.parse::<i32>().ok()).unwrap_or(1);
        pos.game_ply =
            ((fullmove - 1) * 2 + if pos.side_to_move == Color::Black { 1 } else { 0 }).max(0);

        if pos.pieces_of(Color::White, PieceType::King).count() != 1
            || pos.pieces_of(Color::Black, PieceType::King).count() != 1
        {
            return Err(FenError("need exactly one king per side".into()));
        }

        let mut st = StateInfo {
            rule60,
            ..StateInfo::default()
        };
        pos.compute_keys(&mut st);
        pos.states.push(st);
        let checkers = pos.compute_checkers();
        pos.states.last_mut().unwrap().checkers = checkers;
        Ok(pos)
    }

    /// The start position
    pub fn startpos() -> Position {
        Position::from_fen(START_FEN).expect("start fen is valid")
    }

    /// Render the current position as FEN
    pub fn fen(&self) -> String {
        let mut s = String::new();
        for rank in (0..10).rev() {
            let mut empty = 0;
            for file in 0..9 {
                let sq = Square::new(File::from_u8(file).unwrap(), Rank::from_u8(rank).unwrap());
                let pc = self.board[sq.index()];
                if pc.is_none() {
                    empty += 1;
                } else {
                    if empty > 0 {
                        s.push_str(&empty.to_string());
                        empty = 0;
                    }
                    s.push(pc.to_char());
                }
            }
            if empty > 0 {
                s.push_str(&empty.to_string());
            }
            if rank > 0 {
                s.push('/');
            }
        }
        s.push(' ');
        s.push(if self.side_to_move == Color::White { 'w' } else { 'b' });
        s.push_str(&format!(
            " - - {} {}",
            self.rule60_count(),
            self.game_ply / 2 + 1
        ));
        s
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    #[inline]
    fn st(&self) -> &StateInfo {
        self.states.last().expect("state stack never empty")
    }

    #[inline]
    pub fn side_to_move(&self) -> Color {
        self.side_to_move
    }

    #[inline]
    pub fn game_ply(&self) -> i32 {
        self.game_ply
    }

    #[inline]
    pub fn piece_on(&self, sq: Square) -> Piece {
        self.board[sq.index()]
    }

    #[inline]
    pub fn occupied(&self) -> Bitboard {
        self.by_type[0]
    }

    #[inline]
    pub fn pieces(&self, c: Color) -> Bitboard {
        self.by_color[c.index()]
    }

    #[inline]
    pub fn piece_bb(&self, pt: PieceType) -> Bitboard {
        self.by_type[pt.index()]
    }

    #[inline]
    pub fn pieces_of(&self, c: Color, pt: PieceType) -> Bitboard {
        self.by_color[c.index()] & self.by_type[pt.index()]
    }

    #[inline]
    pub fn king_square(&self, c: Color) -> Square {
        self.pieces_of(c, PieceType::King).lsb_unchecked()
    }

    #[inline]
    pub fn key(&self) -> u64 {
        self.st().key
    }

    #[inline]
    pub fn pawn_key(&self) -> u64 {
        self.st().pawn_key
    }

    #[inline]
    pub fn major_key(&self) -> u64 {
        self.st().major_key
    }

    #[inline]
    pub fn minor_key(&self) -> u64 {
        self.st().minor_key
    }

    #[inline]
    pub fn non_pawn_key(&self, c: Color) -> u64 {
        self.st().non_pawn_key[c.index()]
    }

    #[inline]
    pub fn rule60_count(&self) -> i32 {
        self.st().rule60
    }

    #[inline]
    pub fn checkers(&self) -> Bitboard {
        self.st().checkers
    }

    #[inline]
    pub fn in_check(&self) -> bool {
        self.st().checkers.is_not_empty()
    }

    /// Piece captured by the last move
    #[inline]
    pub fn captured_piece(&self) -> Piece {
        self.st().captured
    }

    /// Board delta of the last move
    #[inline]
    pub fn dirty_piece(&self) -> DirtyPiece {
        self.st().dirty
    }

    /// The move that produced the current position
    #[inline]
    pub fn last_move(&self) -> Move {
        self.st().last_move
    }

    #[inline]
    pub fn moved_piece(&self, m: Move) -> Piece {
        self.board[m.from_sq().index()]
    }

    /// Does this move capture something?
    #[inline]
    pub fn capture(&self, m: Move) -> bool {
        self.board[m.to_sq().index()].is_some()
    }

    /// Summed rook/cannon/knight material of one side
    pub fn major_material(&self, c: Color) -> Value {
        let mut v = 0;
        for pt in [PieceType::Rook, PieceType::Cannon, PieceType::Knight] {
            v += PIECE_VALUE[pt.index()] * self.pieces_of(c, pt).count() as Value;
        }
        v
    }

    /// Major material of both sides together
    pub fn major_material_total(&self) -> Value {
        self.major_material(Color::White) + self.major_material(Color::Black)
    }

    /// Piece count by type over both colors
    pub fn count(&self, pt: PieceType) -> i32 {
        self.piece_bb(pt).count() as i32
    }

    // =========================================================================
    // Attack queries
    // =========================================================================

    /// All pieces of both colors attacking `sq` under `occ`
    pub fn attackers_to(&self, sq: Square, occ: Bitboard) -> Bitboard {
        (rook_attacks(sq, occ) & self.piece_bb(PieceType::Rook))
            | (cannon_attacks(sq, occ) & self.piece_bb(PieceType::Cannon))
            | (knight_attacks_to(sq, occ) & self.piece_bb(PieceType::Knight))
            | (bishop_attacks(sq, occ) & self.piece_bb(PieceType::Bishop))
            | (king_attacks(sq) & self.piece_bb(PieceType::King))
            | (advisor_attacks(sq) & self.piece_bb(PieceType::Advisor))
            | (pawn_attacks_to(Color::White, sq) & self.pieces_of(Color::White, PieceType::Pawn))
            | (pawn_attacks_to(Color::Black, sq) & self.pieces_of(Color::Black, PieceType::Pawn))
    }

    /// Checkers against the side to move
    fn compute_checkers(&self) -> Bitboard {
        let us = self.side_to_move;
        let them = !us;
        let ksq = self.king_square(us);
        let occ = self.occupied();
        (rook_attacks(ksq, occ) & self.pieces_of(them, PieceType::Rook))
            | (cannon_attacks(ksq, occ) & self.pieces_of(them, PieceType::Cannon))
            | (knight_attacks_to(ksq, occ) & self.pieces_of(them, PieceType::Knight))
            | (pawn_attacks_to(them, ksq) & self.pieces_of(them, PieceType::Pawn))
    }

    /// Is this pseudo-legal move legal (no self-check, no facing kings)?
    pub fn legal(&self, m: Move) -> bool {
        debug_assert!(m.is_ok());
        let us = self.side_to_move;
        let them = !us;
        let from = m.from_sq();
        let to = m.to_sq();
        let pc = self.piece_on(from);
        debug_assert!(pc.is_some() && pc.color() == us);

        let from_bb = Bitboard::from_square(from);
        let to_bb = Bitboard::from_square(to);
        let occ = (self.occupied() ^ from_bb) | to_bb;
        let ksq = if pc.piece_type() == PieceType::King {
            to
        } else {
            self.king_square(us)
        };

        // A capture removes the victim from the attacker sets
        let gone = !to_bb;

        // Rook rays carry the flying-general rule: the enemy king acts
        // as a rook along the open file
        let rooks =
            (self.pieces_of(them, PieceType::Rook) | self.pieces_of(them, PieceType::King)) & gone;
        if (rook_attacks(ksq, occ) & rooks).is_not_empty() {
            return false;
        }
        if (cannon_attacks(ksq, occ) & self.pieces_of(them, PieceType::Cannon) & gone)
            .is_not_empty()
        {
            return false;
        }
        if (knight_attacks_to(ksq, occ) & self.pieces_of(them, PieceType::Knight) & gone)
            .is_not_empty()
        {
            return false;
        }
        if (pawn_attacks_to(them, ksq) & self.pieces_of(them, PieceType::Pawn) & gone)
            .is_not_empty()
        {
            return false;
        }
        true
    }

    /// Does `m` fit the movement rules from the current position?
    pub fn pseudo_legal(&self, m: Move) -> bool {
        if !m.is_ok() {
            return false;
        }
        let us = self.side_to_move;
        let from = m.from_sq();
        let to = m.to_sq();
        let pc = self.piece_on(from);
        if pc.is_none() || pc.color() != us {
            return false;
        }
        let dest = self.piece_on(to);
        if dest.is_some() && dest.color() == us {
            return false;
        }
        let occ = self.occupied();
        match pc.piece_type() {
            PieceType::Rook => rook_attacks(from, occ).contains(to),
            PieceType::Cannon => {
                if dest.is_some() {
                    cannon_attacks(from, occ).contains(to)
                } else {
                    rook_attacks(from, occ).contains(to)
                }
            }
            PieceType::Knight => knight_attacks(from, occ).contains(to),
            PieceType::Bishop => bishop_attacks(from, occ).contains(to),
            PieceType::Advisor => advisor_attacks(from).contains(to),
            PieceType::King => king_attacks(from).contains(to),
            PieceType::Pawn => pawn_attacks(us, from).contains(to),
            PieceType::None => false,
        }
    }

    /// Would `m` deliver check?
    pub fn gives_check(&self, m: Move) -> bool {
        let us = self.side_to_move;
        let from = m.from_sq();
        let to = m.to_sq();
        let pc = self.piece_on(from);
        let ksq = self.king_square(!us);

        let from_bb = Bitboard::from_square(from);
        let to_bb = Bitboard::from_square(to);
        let occ = (self.occupied() ^ from_bb) | to_bb;

        // Direct check from the destination square
        let direct = match pc.piece_type() {
            PieceType::Rook => rook_attacks(to, occ).contains(ksq),
            PieceType::Cannon => cannon_attacks(to, occ).contains(ksq),
            PieceType::Knight => knight_attacks(to, occ).contains(ksq),
            PieceType::Pawn => pawn_attacks(us, to).contains(ksq),
            _ => false,
        };
        if direct {
            return true;
        }

        // Discovered check: the vacated square may open a line or free
        // a knight leg or turn a piece into a cannon screen
        let moved = !from_bb;
        if (rook_attacks(ksq, occ) & self.pieces_of(us, PieceType::Rook) & moved).is_not_empty() {
            return true;
        }
        if (cannon_attacks(ksq, occ) & self.pieces_of(us, PieceType::Cannon) & moved)
            .is_not_empty()
        {
            return true;
        }
        if (knight_attacks_to(ksq, occ) & self.pieces_of(us, PieceType::Knight) & moved)
            .is_not_empty()
        {
            return true;
        }
        if (pawn_attacks_to(us, ksq) & self.pieces_of(us, PieceType::Pawn) & moved).is_not_empty()
        {
            return true;
        }
        false
    }

    // =========================================================================
    // Move execution
    // =========================================================================

    fn put_piece(&mut self, pc: Piece, sq: Square) {
        debug_assert!(self.board[sq.index()].is_none());
        self.board[sq.index()] = pc;
        self.by_type[0].set(sq);
        self.by_type[pc.piece_type().index()].set(sq);
        self.by_color[pc.color().index()].set(sq);
    }

    fn remove_piece(&mut self, sq: Square) -> Piece {
        let pc = self.board[sq.index()];
        debug_assert!(pc.is_some());
        self.board[sq.index()] = Piece::NONE;
        self.by_type[0].clear(sq);
        self.by_type[pc.piece_type().index()].clear(sq);
        self.by_color[pc.color().index()].clear(sq);
        pc
    }

    fn compute_keys(&self, st: &mut StateInfo) {
        st.key = 0;
        st.pawn_key = 0;
        st.major_key = 0;
        st.minor_key = 0;
        st.non_pawn_key = [0; 2];
        for sq in self.occupied() {
            let pc = self.board[sq.index()];
            let k = ZOBRIST.psq[pc.index()][sq.index()];
            st.key ^= k;
            match pc.piece_type() {
                PieceType::Pawn => st.pawn_key ^= k,
                PieceType::Rook | PieceType::Cannon | PieceType::Knight => st.major_key ^= k,
                PieceType::Advisor | PieceType::Bishop => st.minor_key ^= k,
                _ => {}
            }
            if pc.piece_type() != PieceType::Pawn {
                st.non_pawn_key[pc.color().index()] ^= k;
            }
        }
        if self.side_to_move == Color::Black {
            st.key ^= ZOBRIST.side;
        }
    }

    fn xor_aux_keys(st: &mut StateInfo, pc: Piece, sq: Square) {
        let k = ZOBRIST.psq[pc.index()][sq.index()];
        match pc.piece_type() {
            PieceType::Pawn => st.pawn_key ^= k,
            PieceType::Rook | PieceType::Cannon | PieceType::Knight => st.major_key ^= k,
            PieceType::Advisor | PieceType::Bishop => st.minor_key ^= k,
            _ => {}
        }
        if pc.piece_type() != PieceType::Pawn {
            st.non_pawn_key[pc.color().index()] ^= k;
        }
    }

    /// Make a move. The caller guarantees legality.
    pub fn do_move(&mut self, m: Move) {
        debug_assert!(m.is_ok());
        let us = self.side_to_move;
        let from = m.from_sq();
        let to = m.to_sq();
        let pc = self.board[from.index()];
        debug_assert!(pc.is_some() && pc.color() == us);

        let mut st = *self.st();
        st.last_move = m;
        st.plies_from_null += 1;
        st.dirty = DirtyPiece::default();

        let captured = self.board[to.index()];
        if captured.is_some() {
            debug_assert!(captured.color() != us);
            self.remove_piece(to);
            st.key ^= ZOBRIST.psq[captured.index()][to.index()];
            Self::xor_aux_keys(&mut st, captured, to);
            st.rule60 = 0;
            st.dirty.piece[1] = captured;
            st.dirty.from[1] = Some(to);
            st.dirty.to[1] = None;
            st.dirty.count = 2;
        } else {
            st.rule60 += 1;
            st.dirty.count = 1;
        }
        st.captured = captured;

        self.remove_piece(from);
        self.put_piece(pc, to);
        st.key ^= ZOBRIST.psq[pc.index()][from.index()] ^ ZOBRIST.psq[pc.index()][to.index()];
        Self::xor_aux_keys(&mut st, pc, from);
        Self::xor_aux_keys(&mut st, pc, to);
        st.key ^= ZOBRIST.side;

        st.dirty.piece[0] = pc;
        st.dirty.from[0] = Some(from);
        st.dirty.to[0] = Some(to);

        self.side_to_move = !us;
        self.game_ply += 1;
        st.checkers = Bitboard::EMPTY;
        self.states.push(st);
        let checkers = self.compute_checkers();
        self.states.last_mut().unwrap().checkers = checkers;
    }

    /// Unmake the last move
    pub fn undo_move(&mut self, m: Move) {
        debug_assert!(self.st().last_move == m);
        let st = self.states.pop().expect("undo without do");
        self.side_to_move = !self.side_to_move;
        self.game_ply -= 1;

        let from = m.from_sq();
        let to = m.to_sq();
        let pc = self.remove_piece(to);
        self.put_piece(pc, from);
        if st.captured.is_some() {
            self.put_piece(st.captured, to);
        }
    }

    /// Pass the move without moving
    pub fn do_null_move(&mut self) {
        debug_assert!(!self.in_check());
        let mut st = *self.st();
        st.key ^= ZOBRIST.side;
        st.rule60 += 1;
        st.plies_from_null = 0;
        st.captured = Piece::NONE;
        st.last_move = Move::NULL;
        st.checkers = Bitboard::EMPTY;
        st.dirty = DirtyPiece::default();
        self.side_to_move = !self.side_to_move;
        self.game_ply += 1;
        self.states.push(st);
    }

    pub fn undo_null_move(&mut self) {
        debug_assert!(self.st().last_move == Move::NULL);
        self.states.pop();
        self.side_to_move = !self.side_to_move;
        self.game_ply -= 1;
    }

    /// Zobrist key of the position after `m`, without making it
    pub fn key_after(&self, m: Move) -> u64 {
        let from = m.from_sq();
        let to = m.to_sq();
        let pc = self.board[from.index()];
        let captured = self.board[to.index()];
        let mut k = self.st().key ^ ZOBRIST.side;
        k ^= ZOBRIST.psq[pc.index()][from.index()] ^ ZOBRIST.psq[pc.index()][to.index()];
        if captured.is_some() {
            k ^= ZOBRIST.psq[captured.index()][to.index()];
        }
        k
    }

    // =========================================================================
    // Exchange evaluation
    // =========================================================================

    /// Is the swap-off on `m`'s destination worth at least `threshold`?
    pub fn see_ge(&self, m: Move, threshold: Value) -> bool {
        if !m.is_ok() {
            return 0 >= threshold;
        }
        let from = m.from_sq();
        let to = m.to_sq();

        let mut swap = PIECE_VALUE[self.piece_on(to).index()] - threshold;
        if swap < 0 {
            return false;
        }
        swap = PIECE_VALUE[self.piece_on(from).index()] - swap;
        if swap <= 0 {
            return true;
        }

        let mut occ =
            self.occupied() ^ Bitboard::from_square(from) ^ Bitboard::from_square(to);
        let mut stm = self.side_to_move;
        let mut attackers = self.attackers_to(to, occ);
        let mut res = 1i32;

        // Least-valuable-attacker order
        const ORDER: [PieceType; 6] = [
            PieceType::Pawn,
            PieceType::Bishop,
            PieceType::Advisor,
            PieceType::Knight,
            PieceType::Cannon,
            PieceType::Rook,
        ];

        loop {
            stm = !stm;
            attackers &= occ;
            let stm_attackers = attackers & self.pieces(stm);
            if stm_attackers.is_empty() {
                break;
            }
            res ^= 1;

            let mut picked = None;
            for pt in ORDER {
                let bb = stm_attackers & self.piece_bb(pt);
                if bb.is_not_empty() {
                    picked = Some((pt, bb.lsb_unchecked()));
                    break;
                }
            }
            match picked {
                Some((pt, sq)) => {
                    swap = PIECE_VALUE[pt.index()] - swap;
                    if swap < res {
                        break;
                    }
                    occ.toggle(sq);
                    // Cannons change their reach with every removal, so
                    // rebuild the attacker set instead of x-raying
                    attackers = self.attackers_to(to, occ);
                }
                None => {
                    // Only the king is left to recapture; it may do so
                    // only when the opponent has no more attackers
                    return if (attackers & self.pieces(!stm)).is_not_empty() {
                        res ^ 1 != 0
                    } else {
                        res != 0
                    };
                }
            }
        }
        res != 0
    }

    // =========================================================================
    // Rule adjudication
    // =========================================================================

    /// Repetition and 60-move judgment
    pub fn rule_judge(&self, ply: i32) -> RuleJudge {
        let st = self.st();

        if st.rule60 >= 120 {
            let terminal = if self.in_check() && !self.has_legal_moves() {
                mated_in(ply)
            } else {
                VALUE_DRAW
            };
            return RuleJudge::Terminal(terminal);
        }

        let end = st.rule60.min(st.plies_from_null);
        if end < 4 {
            return RuleJudge::None;
        }

        let cur = self.states.len() - 1;
        let mut repetitions = 0;
        let mut first_match = 0usize;
        let mut i = 4usize;
        while i as i32 <= end && i <= cur {
            let idx = cur - i;
            if self.states[idx].key == st.key {
                repetitions += 1;
                if repetitions == 1 {
                    first_match = idx;
                } else {
                    break;
                }
            }
            i += 2;
        }

        if repetitions == 0 {
            return RuleJudge::None;
        }

        // Check flags along the cycle: states where we are to move tell
        // whether they checked us, and vice versa
        let mut us_all_check = true;
        let mut them_all_check = true;
        let mut j = first_match + 1;
        while j <= cur {
            let checked = self.states[j].checkers.is_not_empty();
            if (cur - j) % 2 == 1 {
                // Opponent to move here: our move gave this check
                us_all_check &= checked;
            } else {
                them_all_check &= checked;
            }
            j += 1;
        }

        let value = if us_all_check && !them_all_check {
            // We are the perpetual checker and lose
            mated_in(ply)
        } else if them_all_check && !us_all_check {
            mate_in(ply)
        } else {
            VALUE_DRAW
        };

        if value == VALUE_DRAW || repetitions >= 2 {
            RuleJudge::Terminal(value)
        } else {
            RuleJudge::Hint(value)
        }
    }

    /// True when at least one legal move exists
    pub fn has_legal_moves(&self) -> bool {
        crate::movegen::has_legal_moves(self)
    }

    /// Mirror the position top-to-bottom with colors swapped
    pub fn flip(&self) -> Position {
        let mut pos = Position {
            board: [Piece::NONE; Square::NUM],
            by_type: [Bitboard::EMPTY; PieceType::NUM],
            by_color: [Bitboard::EMPTY; Color::NUM],
            side_to_move: !self.side_to_move,
            game_ply: self.game_ply,
            states: Vec::with_capacity(16),
        };
        for sq in self.occupied() {
            let pc = self.board[sq.index()];
            pos.put_piece(Piece::new(!pc.color(), pc.piece_type()), sq.flip_rank());
        }
        let mut st = StateInfo {
            rule60: self.rule60_count(),
            ..StateInfo::default()
        };
        pos.compute_keys(&mut st);
        pos.states.push(st);
        let checkers = pos.compute_checkers();
        pos.states.last_mut().unwrap().checkers = checkers;
        pos
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, " +---+---+---+---+---+---+---+---+---+")?;
        for rank in (0..10).rev() {
            write!(f, " |")?;
            for file in 0..9 {
                let sq = Square::new(File::from_u8(file).unwrap(), Rank::from_u8(rank).unwrap());
                write!(f, " {} |", self.board[sq.index()].to_char())?;
            }
            writeln!(f, " {rank}")?;
            writeln!(f, " +---+---+---+---+---+---+---+---+---+")?;
        }
        writeln!(f, "   a   b   c   d   e   f   g   h   i")?;
        writeln!(f)?;
        writeln!(f, "Fen: {}", self.fen())?;
        write!(f, "Key: {:016X}", self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sq(s: &str) -> Square {
        let b = s.as_bytes();
        Square::new(
            File::from_char(b[0] as char).unwrap(),
            Rank::from_char(b[1] as char).unwrap(),
        )
    }

    fn mv(s: &str) -> Move {
        Move::new(sq(&s[0..2]), sq(&s[2..4]))
    }

    #[test]
    fn test_startpos_layout() {
        let pos = Position::startpos();
        assert_eq!(pos.piece_on(sq("a0")), Piece::W_ROOK);
        assert_eq!(pos.piece_on(sq("e0")), Piece::W_KING);
        assert_eq!(pos.piece_on(sq("b2")), Piece::W_CANNON);
        assert_eq!(pos.piece_on(sq("a3")), Piece::W_PAWN);
        assert_eq!(pos.piece_on(sq("e9")), Piece::B_KING);
        assert_eq!(pos.piece_on(sq("h7")), Piece::B_CANNON);
        assert_eq!(pos.occupied().count(), 32);
        assert_eq!(pos.side_to_move(), Color::White);
        assert!(!pos.in_check());
    }

    #[test]
    fn test_fen_roundtrip() {
        let pos = Position::startpos();
        let fen = pos.fen();
        let pos2 = Position::from_fen(&fen).unwrap();
        assert_eq!(pos2.key(), pos.key());
        assert_eq!(pos2.fen(), fen);
    }

    #[test]
    fn test_bad_fen() {
        assert!(Position::from_fen("").is_err());
        assert!(Position::from_fen("9/9/9/9/9/9/9/9/9/9 w").is_err()); // no kings
        assert!(Position::from_fen("x8/9/9/9/9/9/9/9/9/9 w").is_err());
    }

    #[test]
    fn test_do_undo_roundtrip() {
        let mut pos = Position::startpos();
        let key = pos.key();
        let pawn_key = pos.pawn_key();
        let occ = pos.occupied();
        let rule60 = pos.rule60_count();

        let m = mv("b2e2"); // cannon to the central file
        assert!(pos.pseudo_legal(m));
        assert!(pos.legal(m));
        pos.do_move(m);
        assert_ne!(pos.key(), key);
        assert_eq!(pos.side_to_move(), Color::Black);
        pos.undo_move(m);

        assert_eq!(pos.key(), key);
        assert_eq!(pos.pawn_key(), pawn_key);
        assert_eq!(pos.occupied(), occ);
        assert_eq!(pos.rule60_count(), rule60);
        assert_eq!(pos.side_to_move(), Color::White);
    }

    #[test]
    fn test_capture_resets_rule60() {
        let mut pos = Position::startpos();
        pos.do_move(mv("b2e2")); // cannon behind the e3 pawn screen
        assert_eq!(pos.rule60_count(), 1);
        pos.do_move(mv("h7e7")); // black mirrors
        pos.do_move(mv("e2e6")); // cannon takes the e6 pawn over the screen
        assert_eq!(pos.captured_piece(), Piece::B_PAWN);
        assert_eq!(pos.rule60_count(), 0);
    }

    #[test]
    fn test_null_move_key_flips_side_only() {
        let mut pos = Position::startpos();
        let key = pos.key();
        pos.do_null_move();
        assert_ne!(pos.key(), key);
        assert_eq!(pos.side_to_move(), Color::Black);
        pos.undo_null_move();
        assert_eq!(pos.key(), key);
    }

    #[test]
    fn test_key_after_matches_do_move() {
        let mut pos = Position::startpos();
        for m in [mv("b2e2"), mv("b0c2"), mv("h2e2")] {
            if !pos.pseudo_legal(m) {
                continue;
            }
            let predicted = pos.key_after(m);
            pos.do_move(m);
            assert_eq!(pos.key(), predicted);
            pos.undo_move(m);
        }
    }

    #[test]
    fn test_cannon_check_detection() {
        // Cannon on e4 with a screen on e5 checks the king on e9
        let pos = Position::from_fen("4k4/9/9/9/4p4/4C4/9/9/9/4K4 b").unwrap();
        assert!(pos.in_check());
        // With a second piece between screen and king, no check
        let pos = Position::from_fen("4k4/9/4n4/9/4p4/9/4C4/9/9/3K5 b").unwrap();
        assert!(!pos.in_check());
    }

    #[test]
    fn test_flying_general_illegal() {
        // Kings on the same file, one blocker; moving it away is illegal
        let pos = Position::from_fen("4k4/9/9/9/4n4/9/9/9/9/4K4 b").unwrap();
        // Every knight move leaves the e-file and exposes the kings
        let m = mv("e5g4");
        assert!(pos.pseudo_legal(m));
        assert!(!pos.legal(m));
        let m2 = mv("e5d3");
        assert!(pos.pseudo_legal(m2));
        assert!(!pos.legal(m2));
    }

    #[test]
    fn test_gives_check_matches_do_move() {
        // gives_check must agree with checkers() after the move, across
        // a handful of legal moves from tactical positions
        let fens = [
            START_FEN,
            "4k4/9/9/9/9/9/9/9/9/3RK4 w",
            "3ak4/9/4b4/9/9/9/4p4/4C4/9/4K4 w",
            "rnbakabnr/9/1c5c1/p1p1p1p1p/9/9/P1P1P1P1P/1C5C1/9/RNBAKABNR b",
        ];
        for fen in fens {
            let mut pos = Position::from_fen(fen).unwrap();
            let moves = crate::movegen::legal_moves(&pos);
            for m in moves.iter() {
                let predicted = pos.gives_check(*m);
                pos.do_move(*m);
                assert_eq!(pos.in_check(), predicted, "fen={fen} m={m}");
                pos.undo_move(*m);
            }
        }
    }

    #[test]
    fn test_see_simple() {
        // Rook takes an undefended pawn: wins exactly a pawn
        let pos = Position::from_fen("3k5/9/9/9/9/3p5/9/9/9/3RK4 w").unwrap();
        let take = mv("d0d4");
        assert!(pos.capture(take));
        assert!(pos.see_ge(take, 0));
        assert!(pos.see_ge(take, crate::types::PAWN_VALUE));
        assert!(!pos.see_ge(take, crate::types::PAWN_VALUE + 1));
    }

    #[test]
    fn test_see_defended() {
        // Rook takes a pawn defended by a rook: loses rook for pawn
        let pos = Position::from_fen("3r1k3/9/9/9/9/3p5/9/9/9/3RK4 w").unwrap();
        let take = mv("d0d4");
        assert!(pos.capture(take));
        assert!(pos.see_ge(take, crate::types::PAWN_VALUE - crate::types::ROOK_VALUE));
        assert!(!pos.see_ge(take, 0));
    }

    #[test]
    fn test_rule_judge_repetition_draw() {
        let mut pos = Position::startpos();
        // Shuffle both rooks back and forth: the start position recurs
        let cycle = [mv("a0a1"), mv("a9a8"), mv("a1a0"), mv("a8a9")];
        for m in cycle.iter().take(3) {
            assert_eq!(pos.rule_judge(0), RuleJudge::None);
            pos.do_move(*m);
        }
        pos.do_move(cycle[3]);
        assert_eq!(pos.rule_judge(5), RuleJudge::Terminal(VALUE_DRAW));
    }

    #[test]
    fn test_rule60_draw() {
        let mut pos = Position::startpos();
        let cycle = [
            mv("a0a1"),
            mv("a9a8"),
            mv("a1b1"),
            mv("a8b8"),
            mv("b1a1"),
            mv("b8a8"),
            mv("a1a0"),
            mv("a8a9"),
        ];
        // The judge fires on repetition well before 120 plies, so only
        // verify the counter bookkeeping here
        for m in cycle.iter().take(4) {
            pos.do_move(*m);
        }
        assert_eq!(pos.rule60_count(), 4);
    }

    #[test]
    fn test_major_material() {
        let pos = Position::startpos();
        use crate::types::{CANNON_VALUE, KNIGHT_VALUE, ROOK_VALUE};
        let expect = 2 * (ROOK_VALUE + CANNON_VALUE + KNIGHT_VALUE);
        assert_eq!(pos.major_material(Color::White), expect);
        assert_eq!(pos.major_material(Color::Black), expect);
    }

    #[test]
    fn test_random_walk_roundtrip() {
        use rand::{Rng, SeedableRng};
        use rand_xoshiro::Xoshiro256PlusPlus;

        // Every observable field must survive do/undo across a random
        // game walk, keys included
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0xC0FFEE);
        let mut pos = Position::startpos();
        let start_fen = pos.fen();
        let mut keys = vec![pos.key()];
        let mut occs = vec![pos.occupied()];
        let mut played = Vec::new();

        for _ in 0..60 {
            let moves = crate::movegen::legal_moves(&pos);
            if moves.is_empty() {
                break;
            }
            let m = moves.as_slice()[rng.gen_range(0..moves.len())];
            pos.do_move(m);
            played.push(m);
            keys.push(pos.key());
            occs.push(pos.occupied());
        }

        while let Some(m) = played.pop() {
            pos.undo_move(m);
            keys.pop();
            occs.pop();
            assert_eq!(pos.key(), *keys.last().unwrap());
            assert_eq!(pos.occupied(), *occs.last().unwrap());
        }
        assert_eq!(pos.fen(), start_fen);
    }

    #[test]
    fn test_flip() {
        let pos = Position::startpos();
        let flipped = pos.flip();
        assert_eq!(flipped.side_to_move(), Color::Black);
        assert_eq!(flipped.piece_on(sq("a0")), Piece::B_ROOK);
        assert_eq!(flipped.occupied().count(), 32);
        // Flipping twice restores the board
        let back = flipped.flip();
        assert_eq!(back.fen(), pos.fen());
    }
}
