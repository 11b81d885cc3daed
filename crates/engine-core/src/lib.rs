//! rxiangqi engine core
//!
//! Bitboard move generation for the 9x10 xiangqi board, an
//! alpha-beta search with lazy-SMP workers over a shared transposition
//! table, and UCI time management. The evaluator is pluggable through
//! the `eval::Evaluator` trait; a material evaluator is built in.

pub mod bitboard;
pub mod eval;
pub mod movegen;
pub mod position;
pub mod search;
pub mod types;
pub mod uci;

/// Initialize global tables. Call once at startup before searching.
pub fn init() {
    bitboard::init();
}
