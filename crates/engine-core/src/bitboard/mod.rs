//! Bitboards and precomputed attack tables

mod core;
mod tables;

pub use self::core::{Bitboard, BitboardIter};
pub use tables::{
    advisor_attacks, aligned, attacks_bb, between_bb, bishop_attacks, cannon_attacks, init,
    king_attacks, knight_attacks, knight_attacks_to, line_bb, pawn_attacks, pawn_attacks_to,
    pseudo_attacks, rook_attacks,
};
