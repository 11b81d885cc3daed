//! UCI notation and score conversion
//!
//! Moves print as `<file><rank><file><rank>`; scores convert to
//! centipawns through a material-fitted logistic model, which also
//! yields the win/draw/loss estimate.

use crate::movegen;
use crate::position::Position;
use crate::types::{
    is_valid, Move, PieceType, Value, VALUE_MATE, VALUE_MATED_IN_MAX_PLY, VALUE_MATE_IN_MAX_PLY,
};

struct WinRateParams {
    a: f64,
    b: f64,
}

/// Coefficients of the material-dependent logistic fit
fn win_rate_params(pos: &Position) -> WinRateParams {
    let material = 10 * pos.count(PieceType::Rook)
        + 5 * pos.count(PieceType::Knight)
        + 5 * pos.count(PieceType::Cannon)
        + 3 * pos.count(PieceType::Bishop)
        + 2 * pos.count(PieceType::Advisor)
        + pos.count(PieceType::Pawn);

    let m = material.clamp(17, 110) as f64 / 65.0;

    const AS: [f64; 4] = [220.59891365, -810.35730430, 928.68185198, 79.83955423];
    const BS: [f64; 4] = [61.99287416, -233.72674182, 325.85508322, -68.72720854];

    let a = ((AS[0] * m + AS[1]) * m + AS[2]) * m + AS[3];
    let b = ((BS[0] * m + BS[1]) * m + BS[2]) * m + BS[3];

    WinRateParams { a, b }
}

/// Win probability in permille for the side to move
fn win_rate_model(v: Value, pos: &Position) -> i32 {
    let p = win_rate_params(pos);
    (0.5 + 1000.0 / (1.0 + ((p.a - v as f64) / p.b).exp())) as i32
}

/// Internal value to centipawns; mate scores are not meaningful here
pub fn to_cp(v: Value, pos: &Position) -> i32 {
    let p = win_rate_params(pos);
    (100.0 * v as f64 / p.a).round() as i32
}

/// `cp N` or `mate N` as used in `info score`
pub fn format_score(v: Value, pos: &Position) -> String {
    debug_assert!(is_valid(v));
    if v.abs() < VALUE_MATE_IN_MAX_PLY.min(-VALUE_MATED_IN_MAX_PLY) {
        format!("cp {}", to_cp(v, pos))
    } else {
        let plies = if v > 0 {
            VALUE_MATE - v
        } else {
            -(VALUE_MATE + v)
        };
        let mate = if plies > 0 { (plies + 1) / 2 } else { plies / 2 };
        format!("mate {mate}")
    }
}

/// `W D L` in permille
pub fn format_wdl(v: Value, pos: &Position) -> String {
    let wdl_w = win_rate_model(v, pos);
    let wdl_l = win_rate_model(-v, pos);
    let wdl_d = 1000 - wdl_w - wdl_l;
    format!("{wdl_w} {wdl_d} {wdl_l}")
}

/// Parse a move in coordinate notation against the legal moves
pub fn to_move(pos: &Position, s: &str) -> Move {
    for m in movegen::legal_moves(pos).iter() {
        if m.to_string() == s {
            return *m;
        }
    }
    Move::NONE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{mate_in, mated_in};

    #[test]
    fn test_to_cp_monotonic_and_signed() {
        let pos = Position::startpos();
        assert_eq!(to_cp(0, &pos), 0);
        assert!(to_cp(500, &pos) > 0);
        assert!(to_cp(-500, &pos) < 0);
        assert!(to_cp(1000, &pos) > to_cp(500, &pos));
    }

    #[test]
    fn test_format_score_cp_and_mate() {
        let pos = Position::startpos();
        assert!(format_score(100, &pos).starts_with("cp "));
        assert_eq!(format_score(mate_in(3), &pos), "mate 2");
        assert_eq!(format_score(mate_in(1), &pos), "mate 1");
        assert_eq!(format_score(mated_in(4), &pos), "mate -2");
    }

    #[test]
    fn test_wdl_sums_to_thousand() {
        let pos = Position::startpos();
        for v in [-800, -50, 0, 50, 800] {
            let s = format_wdl(v, &pos);
            let parts: Vec<i32> = s.split(' ').map(|t| t.parse().unwrap()).collect();
            assert_eq!(parts.len(), 3);
            assert_eq!(parts.iter().sum::<i32>(), 1000);
            for p in parts {
                assert!((0..=1000).contains(&p));
            }
        }
    }

    #[test]
    fn test_wdl_balanced_at_zero() {
        let pos = Position::startpos();
        let s = format_wdl(0, &pos);
        let parts: Vec<i32> = s.split(' ').map(|t| t.parse().unwrap()).collect();
        assert_eq!(parts[0], parts[2]);
    }

    #[test]
    fn test_to_move_parses_legal_only() {
        let pos = Position::startpos();
        let m = to_move(&pos, "b2e2");
        assert!(m.is_ok());
        assert_eq!(m.to_string(), "b2e2");
        assert_eq!(to_move(&pos, "a0a9"), Move::NONE);
        assert_eq!(to_move(&pos, "zz"), Move::NONE);
    }
}
