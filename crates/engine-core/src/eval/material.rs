//! Built-in material and piece-square evaluator

use crate::bitboard::{knight_attacks, rook_attacks, Bitboard};
use crate::position::Position;
use crate::types::{Color, PieceType, Square, Value, PIECE_VALUE};

use super::Evaluator;

/// Piece-square bonuses from red's point of view, indexed by square.
/// Black uses the rank-flipped square. Values are small relative to
/// material so the psqt half dominates the positional half.
#[rustfmt::skip]
const PAWN_PSQ: [i16; Square::NUM] = [
      0,   0,   0,   0,   0,   0,   0,   0,   0,
      0,   0,   0,   0,   0,   0,   0,   0,   0,
      0,   0,   0,   0,   0,   0,   0,   0,   0,
      4,   0,   8,   0,  10,   0,   8,   0,   4,
      8,   0,  12,   0,  16,   0,  12,   0,   8,
     25,  35,  45,  55,  60,  55,  45,  35,  25,
     30,  45,  55,  70,  75,  70,  55,  45,  30,
     30,  50,  65,  80,  90,  80,  65,  50,  30,
     25,  45,  60,  75,  80,  75,  60,  45,  25,
     10,  15,  20,  25,  25,  25,  20,  15,  10,
];

#[rustfmt::skip]
const KNIGHT_PSQ: [i16; Square::NUM] = [
    -20, -10,  -5,  -5,  -8,  -5,  -5, -10, -20,
    -10,   0,   5,   5,   2,   5,   5,   0, -10,
     -5,   8,  12,  10,   5,  10,  12,   8,  -5,
     -5,  10,  18,  20,  20,  20,  18,  10,  -5,
      0,  15,  22,  25,  22,  25,  22,  15,   0,
      5,  20,  30,  32,  30,  32,  30,  20,   5,
      5,  22,  32,  35,  32,  35,  32,  22,   5,
      0,  20,  30,  35,  35,  35,  30,  20,   0,
     -5,  12,  20,  25,  22,  25,  20,  12,  -5,
    -10,   0,   8,  10,   8,  10,   8,   0, -10,
];

#[rustfmt::skip]
const CANNON_PSQ: [i16; Square::NUM] = [
      0,   0,   5,   8,  12,   8,   5,   0,   0,
      0,   5,   8,  10,  10,  10,   8,   5,   0,
      5,   8,  10,   5,   0,   5,  10,   8,   5,
      2,   5,   8,   5,  10,   5,   8,   5,   2,
      0,   2,   5,   8,  12,   8,   5,   2,   0,
      0,   2,   5,   8,  12,   8,   5,   2,   0,
      0,   5,   8,  10,  15,  10,   8,   5,   0,
      2,   8,  10,  12,  18,  12,  10,   8,   2,
      5,  10,  12,  15,  20,  15,  12,  10,   5,
      2,   8,  10,  12,  15,  12,  10,   8,   2,
];

#[rustfmt::skip]
const ROOK_PSQ: [i16; Square::NUM] = [
     -5,   3,   2,   8,   8,   8,   2,   3,  -5,
      2,   8,   8,  12,  12,  12,   8,   8,   2,
      2,   8,   6,  12,  10,  12,   6,   8,   2,
      5,  12,  10,  15,  12,  15,  10,  12,   5,
      8,  15,  12,  18,  15,  18,  12,  15,   8,
     10,  18,  15,  22,  18,  22,  15,  18,  10,
     12,  20,  18,  25,  22,  25,  18,  20,  12,
     12,  22,  18,  25,  22,  25,  18,  22,  12,
     12,  20,  18,  28,  25,  28,  18,  20,  12,
     10,  18,  15,  22,  20,  22,  15,  18,  10,
];

/// Material plus piece-square evaluator
///
/// psqt: material and table sums. positional: mobility of rooks and
/// knights plus a tempo grain, kept small so the two halves differ and
/// the complexity blend in the adapter has something to work with.
#[derive(Default)]
pub struct MaterialEvaluator;

impl MaterialEvaluator {
    fn psqt_for(&self, pos: &Position, c: Color) -> Value {
        let mut v: Value = 0;
        for pt in PieceType::NON_KING {
            for sq in pos.pieces_of(c, pt) {
                v += PIECE_VALUE[pt.index()];
                let idx = if c == Color::White {
                    sq.index()
                } else {
                    sq.flip_rank().index()
                };
                v += match pt {
                    PieceType::Pawn => PAWN_PSQ[idx] as Value,
                    PieceType::Knight => KNIGHT_PSQ[idx] as Value,
                    PieceType::Cannon => CANNON_PSQ[idx] as Value,
                    PieceType::Rook => ROOK_PSQ[idx] as Value,
                    _ => 0,
                };
            }
        }
        v
    }

    fn mobility_for(&self, pos: &Position, c: Color) -> Value {
        let occ = pos.occupied();
        let ours = pos.pieces(c);
        let mut v: Value = 0;
        for sq in pos.pieces_of(c, PieceType::Rook) {
            v += 2 * (rook_attacks(sq, occ) & !ours).count() as Value;
        }
        for sq in pos.pieces_of(c, PieceType::Knight) {
            v += 3 * (knight_attacks(sq, occ) & !ours).count() as Value;
        }
        // Pawns across the river gain activity
        let river = if c == Color::White {
            Bitboard::BLACK_HALF
        } else {
            Bitboard::WHITE_HALF
        };
        v += 12 * (pos.pieces_of(c, PieceType::Pawn) & river).count() as Value;
        v
    }
}

impl Evaluator for MaterialEvaluator {
    fn evaluate(&self, pos: &Position) -> (Value, Value) {
        let us = pos.side_to_move();
        let them = !us;
        let psqt = self.psqt_for(pos, us) - self.psqt_for(pos, them);
        let positional = self.mobility_for(pos, us) - self.mobility_for(pos, them) + 8;
        (psqt, positional)
    }

    fn name(&self) -> &str {
        "material"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symmetric_startpos() {
        let pos = Position::startpos();
        let eval = MaterialEvaluator;
        let (psqt, positional) = eval.evaluate(&pos);
        // Mirror symmetry: only the tempo grain remains
        assert_eq!(psqt, 0);
        assert_eq!(positional, 8);
    }

    #[test]
    fn test_flip_negates_psqt() {
        let pos = Position::from_fen("3k5/9/9/9/9/9/9/9/9/R3K4 w").unwrap();
        let eval = MaterialEvaluator;
        let (psqt_w, _) = eval.evaluate(&pos);
        let flipped = pos.flip();
        let (psqt_b, _) = eval.evaluate(&flipped);
        assert_eq!(psqt_w, psqt_b);
    }

    #[test]
    fn test_pawn_advance_appreciates() {
        // A pawn across the river outscores one at home
        let home = Position::from_fen("4k4/9/9/9/9/9/4P4/9/9/4K4 w").unwrap();
        let crossed = Position::from_fen("4k4/9/9/4P4/9/9/9/9/9/4K4 w").unwrap();
        let eval = MaterialEvaluator;
        let (p1, m1) = eval.evaluate(&home);
        let (p2, m2) = eval.evaluate(&crossed);
        assert!(p2 + m2 > p1 + m1);
    }
}
