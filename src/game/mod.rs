//! Game Logic Module
//!
//! Pure Quarto rules. No I/O, no async.
//!
//! ## Module Structure
//!
//! - `piece`: Piece identity, attributes, piece sets
//! - `board`: 4x4 board, winning lines
//! - `state`: Rule engine (turns, move legality, win/draw detection)

pub mod piece;
pub mod board;
pub mod state;

// Re-export key types
pub use piece::{Piece, PieceSet, Size, Shape, Colour, Fill};
pub use board::{Board, PlacementError, FIELD_COUNT, LINES};
pub use state::{Game, Move, MoveError, PlayerNumber};
