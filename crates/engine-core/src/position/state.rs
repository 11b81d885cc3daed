//! Per-move reversible state

use crate::bitboard::Bitboard;
use crate::types::{Move, Piece, Square};

/// Record of what a move changed on the board, for incremental
/// evaluator refresh. At most two pieces change per move: the mover,
/// and a captured piece going off the board.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirtyPiece {
    pub count: u8,
    pub piece: [Piece; 2],
    pub from: [Option<Square>; 2],
    pub to: [Option<Square>; 2],
}

/// Reversible state for one ply
///
/// `Position` keeps these on a stack; the top frame describes the
/// current position.
#[derive(Debug, Clone, Copy)]
pub struct StateInfo {
    /// Zobrist key of the position
    pub key: u64,
    /// Key over pawns only
    pub pawn_key: u64,
    /// Key over rooks, cannons and knights
    pub major_key: u64,
    /// Key over advisors and bishops
    pub minor_key: u64,
    /// Keys over each color's non-pawn pieces
    pub non_pawn_key: [u64; 2],
    /// Plies since the last capture (the 60-move rule counts 120)
    pub rule60: i32,
    /// Plies since the last null move
    pub plies_from_null: i32,
    /// Piece captured by the move that produced this state
    pub captured: Piece,
    /// The move that produced this state
    pub last_move: Move,
    /// Pieces giving check to the side to move
    pub checkers: Bitboard,
    /// Board delta of the producing move
    pub dirty: DirtyPiece,
}

impl Default for StateInfo {
    fn default() -> Self {
        StateInfo {
            key: 0,
            pawn_key: 0,
            major_key: 0,
            minor_key: 0,
            non_pawn_key: [0; 2],
            rule60: 0,
            plies_from_null: 0,
            captured: Piece::NONE,
            last_move: Move::NONE,
            checkers: Bitboard::EMPTY,
            dirty: DirtyPiece::default(),
        }
    }
}
