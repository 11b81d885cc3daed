//! Position, move execution and rule adjudication

mod pos;
mod state;
mod zobrist;

pub use pos::{FenError, Position, RuleJudge, START_FEN};
pub use state::{DirtyPiece, StateInfo};
pub use zobrist::ZOBRIST;
