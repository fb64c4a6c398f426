//! Game State Definitions
//!
//! The authoritative rule engine for one match.
//! Holds the board, the piece the current player must place, and the pieces
//! still available to hand over. No I/O happens here.

use serde::{Serialize, Deserialize};
use std::fmt;

use crate::game::board::{Board, PlacementError};
use crate::game::piece::{Piece, PieceSet};

// =============================================================================
// PLAYER NUMBER
// =============================================================================

/// Seat in a match. Player one moves first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PlayerNumber {
    /// Opens the match by choosing the first piece.
    One = 1,
    /// Places the first piece.
    Two = 2,
}

impl PlayerNumber {
    /// The opposing seat.
    #[inline]
    pub fn other(self) -> PlayerNumber {
        match self {
            PlayerNumber::One => PlayerNumber::Two,
            PlayerNumber::Two => PlayerNumber::One,
        }
    }

    /// Numeric value (1 or 2).
    #[inline]
    pub fn number(self) -> u8 {
        self as u8
    }

    /// Zero-based seat index.
    #[inline]
    pub fn index(self) -> usize {
        self as usize - 1
    }
}

impl fmt::Display for PlayerNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

// =============================================================================
// MOVE
// =============================================================================

/// A single turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Move {
    /// Opening turn: no piece is held yet, only choose one for the opponent.
    Opening {
        /// Piece handed to the opponent.
        give: Piece,
    },
    /// Regular turn: place the held piece, then hand one over.
    Place {
        /// Target field (0-15).
        field: usize,
        /// Piece handed to the opponent, `None` on the final placement.
        give: Option<Piece>,
    },
}

impl Move {
    /// Opening move.
    pub fn opening(give: Piece) -> Self {
        Move::Opening { give }
    }

    /// Placement move.
    pub fn place(field: usize, give: Option<Piece>) -> Self {
        Move::Place { field, give }
    }

    /// Target field, if the move places a piece.
    pub fn field(&self) -> Option<usize> {
        match self {
            Move::Opening { .. } => None,
            Move::Place { field, .. } => Some(*field),
        }
    }

    /// Piece handed over, if any.
    pub fn give(&self) -> Option<Piece> {
        match self {
            Move::Opening { give } => Some(*give),
            Move::Place { give, .. } => *give,
        }
    }
}

/// Why a move is illegal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MoveError {
    /// The game already has a winner or a full board.
    #[error("game is over")]
    GameOver,

    /// A placement was supplied but no piece is held.
    #[error("no piece is held, only a piece may be chosen")]
    UnexpectedPlacement,

    /// A piece is held but the move does not place it.
    #[error("held piece must be placed")]
    MissingPlacement,

    /// Target field is outside the board.
    #[error("field {0} is off the board")]
    FieldOffBoard(usize),

    /// Target field already holds a piece.
    #[error("field {0} is occupied")]
    FieldOccupied(usize),

    /// Chosen piece is placed or already held.
    #[error("piece {0} is not available")]
    PieceUnavailable(Piece),

    /// Pieces remain but none was chosen.
    #[error("a next piece must be chosen")]
    MissingNextPiece,
}

impl From<PlacementError> for MoveError {
    fn from(err: PlacementError) -> Self {
        match err {
            PlacementError::OffBoard(i) => MoveError::FieldOffBoard(i),
            PlacementError::Occupied(i) => MoveError::FieldOccupied(i),
        }
    }
}

// =============================================================================
// GAME
// =============================================================================

/// Rule engine state for one match.
///
/// Invariant between moves: `available`, `held` and the pieces on the board
/// partition the full 16-piece set.
///
/// `Clone` produces a fully independent copy for look-ahead.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Game {
    /// Whose turn it is.
    current_player: PlayerNumber,
    /// Piece the current player must place (`None` before the opening move
    /// and after the final placement).
    held: Option<Piece>,
    /// Pieces neither placed nor held.
    available: PieceSet,
    /// The board.
    board: Board,
    /// Player who made the most recent move.
    last_mover: Option<PlayerNumber>,
    /// Moves applied so far.
    moves_played: u32,
}

impl Default for Game {
    fn default() -> Self {
        Self::new()
    }
}

impl Game {
    /// New game, player one to open.
    pub fn new() -> Self {
        Self::with_starting_player(PlayerNumber::One)
    }

    /// New game with an explicit opener.
    pub fn with_starting_player(starting: PlayerNumber) -> Self {
        Self {
            current_player: starting,
            held: None,
            available: PieceSet::FULL,
            board: Board::new(),
            last_mover: None,
            moves_played: 0,
        }
    }

    /// Player whose move it is.
    pub fn current_player(&self) -> PlayerNumber {
        self.current_player
    }

    /// Piece that must be placed this turn.
    pub fn held_piece(&self) -> Option<Piece> {
        self.held
    }

    /// Pieces neither on the board nor held.
    pub fn available_pieces(&self) -> PieceSet {
        self.available
    }

    /// Current board.
    pub fn board(&self) -> &Board {
        &self.board
    }

    pub fn last_mover(&self) -> Option<PlayerNumber> {
        self.last_mover
    }

    pub fn moves_played(&self) -> u32 {
        self.moves_played
    }

    /// Check a move without applying it.
    pub fn validate(&self, mv: &Move) -> Result<(), MoveError> {
        if self.is_over() {
            return Err(MoveError::GameOver);
        }

        match (*mv, self.held) {
            (Move::Opening { .. }, Some(_)) => Err(MoveError::MissingPlacement),
            (Move::Place { .. }, None) => Err(MoveError::UnexpectedPlacement),
            (Move::Opening { give }, None) => self.check_give(Some(give)),
            (Move::Place { field, give }, Some(_)) => {
                if !Board::is_field(field) {
                    return Err(MoveError::FieldOffBoard(field));
                }
                if !self.board.is_empty_field(field) {
                    return Err(MoveError::FieldOccupied(field));
                }
                self.check_give(give)
            }
        }
    }

    fn check_give(&self, give: Option<Piece>) -> Result<(), MoveError> {
        match give {
            Some(piece) if self.available.contains(piece) => Ok(()),
            Some(piece) => Err(MoveError::PieceUnavailable(piece)),
            None if self.available.is_empty() => Ok(()),
            None => Err(MoveError::MissingNextPiece),
        }
    }

    /// [`Game::validate`] as a bool.
    pub fn is_valid_move(&self, mv: &Move) -> bool {
        self.validate(mv).is_ok()
    }

    /// Apply a move and pass the turn.
    ///
    /// Illegal moves leave the state untouched.
    pub fn do_move(&mut self, mv: &Move) -> Result<(), MoveError> {
        self.validate(mv)?;

        if let (Move::Place { field, .. }, Some(held)) = (*mv, self.held) {
            self.board.place(field, held)?;
        }

        let give = mv.give();
        if let Some(piece) = give {
            self.available.remove(piece);
        }
        self.held = give;

        self.last_mover = Some(self.current_player);
        self.current_player = self.current_player.other();
        self.moves_played += 1;
        Ok(())
    }

    /// Player owning a winning line, if any.
    ///
    /// Only the player who completes a line can own it, so this is the
    /// most recent mover.
    pub fn winner(&self) -> Option<PlayerNumber> {
        if self.board.has_winner() {
            self.last_mover
        } else {
            None
        }
    }

    /// Board full and nobody won.
    pub fn is_draw(&self) -> bool {
        self.board.is_full() && !self.board.has_winner()
    }

    /// Won or drawn.
    pub fn is_over(&self) -> bool {
        self.board.has_winner() || self.board.is_full()
    }

    /// Every legal move in the current position.
    pub fn legal_moves(&self) -> Vec<Move> {
        if self.is_over() {
            return Vec::new();
        }

        let gives: Vec<Option<Piece>> = if self.available.is_empty() {
            vec![None]
        } else {
            self.available.iter().map(Some).collect()
        };

        match self.held {
            None => self.available.iter().map(Move::opening).collect(),
            Some(_) => (0..crate::game::board::FIELD_COUNT)
                .filter(|&field| self.board.is_empty_field(field))
                .flat_map(|field| gives.iter().map(move |&give| Move::place(field, give)))
                .collect(),
        }
    }
}

/// Depth-first search for a placement order that fills the board
/// without any intermediate win.
#[cfg(test)]
pub(crate) fn drawn_layout() -> Vec<(usize, Piece)> {
    fn search(board: &mut Board, remaining: &mut Vec<Piece>, out: &mut Vec<(usize, Piece)>) -> bool {
        let field = out.len();
        if field == 16 {
            return true;
        }
        for i in 0..remaining.len() {
            let p = remaining[i];
            let mut next = board.clone();
            next.place(field, p).unwrap();
            if next.has_winner() {
                continue;
            }
            remaining.remove(i);
            out.push((field, p));
            let saved = std::mem::replace(board, next);
            if search(board, remaining, out) {
                return true;
            }
            *board = saved;
            out.pop();
            remaining.insert(i, p);
        }
        false
    }

    let mut board = Board::new();
    let mut remaining: Vec<Piece> = Piece::all().collect();
    let mut out = Vec::new();
    assert!(search(&mut board, &mut remaining, &mut out), "no drawn layout");
    out
}
