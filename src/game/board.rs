//! Board
//!
//! 4x4 grid of fields, indexed row-major 0-15.
//! Pieces are only ever added; a placed piece never moves.

use serde::{Serialize, Deserialize};

use crate::game::piece::{share_attribute, Piece};

/// Fields per side.
pub const BOARD_DIM: usize = 4;

/// Total fields.
pub const FIELD_COUNT: usize = BOARD_DIM * BOARD_DIM;

/// The 10 lines that can win: 4 rows, 4 columns, 2 diagonals.
pub const LINES: [[usize; 4]; 10] = [
    [0, 1, 2, 3],
    [4, 5, 6, 7],
    [8, 9, 10, 11],
    [12, 13, 14, 15],
    [0, 4, 8, 12],
    [1, 5, 9, 13],
    [2, 6, 10, 14],
    [3, 7, 11, 15],
    [0, 5, 10, 15],
    [3, 6, 9, 12],
];

/// Error placing a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PlacementError {
    /// Index outside 0-15.
    #[error("field {0} is off the board")]
    OffBoard(usize),

    /// Field already holds a piece.
    #[error("field {0} is occupied")]
    Occupied(usize),
}

/// The playing board.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    fields: [Option<Piece>; FIELD_COUNT],
}

impl Board {
    /// Empty board.
    pub fn new() -> Self {
        Self::default()
    }

    /// Row-major index for (row, col).
    #[inline]
    pub fn index(row: usize, col: usize) -> usize {
        row * BOARD_DIM + col
    }

    /// Check a linear index is on the board.
    #[inline]
    pub fn is_field(index: usize) -> bool {
        index < FIELD_COUNT
    }

    /// Piece at a field, `None` if empty or off the board.
    pub fn get(&self, index: usize) -> Option<Piece> {
        self.fields.get(index).copied().flatten()
    }

    /// True for an on-board field with no piece.
    pub fn is_empty_field(&self, index: usize) -> bool {
        Self::is_field(index) && self.fields[index].is_none()
    }

    /// Place a piece on an empty field.
    pub fn place(&mut self, index: usize, piece: Piece) -> Result<(), PlacementError> {
        let slot = self.fields.get_mut(index).ok_or(PlacementError::OffBoard(index))?;
        if slot.is_some() {
            return Err(PlacementError::Occupied(index));
        }
        *slot = Some(piece);
        Ok(())
    }

    /// Number of occupied fields.
    pub fn occupied(&self) -> usize {
        self.fields.iter().filter(|f| f.is_some()).count()
    }

    /// True once all 16 fields hold a piece.
    pub fn is_full(&self) -> bool {
        self.fields.iter().all(Option::is_some)
    }

    /// Pieces currently on the board, in field order.
    pub fn pieces(&self) -> impl Iterator<Item = Piece> + '_ {
        self.fields.iter().flatten().copied()
    }

    /// True when the line is full and its pieces share an attribute.
    pub fn is_winning_line(&self, line: &[usize; 4]) -> bool {
        let pieces: Option<Vec<Piece>> = line.iter().map(|&index| self.get(index)).collect();
        pieces.map_or(false, |pieces| share_attribute(&pieces))
    }

    /// First winning line on the board, if any.
    pub fn winning_line(&self) -> Option<[usize; 4]> {
        LINES.iter().find(|line| self.is_winning_line(line)).copied()
    }

    /// True if any line is winning.
    pub fn has_winner(&self) -> bool {
        self.winning_line().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn piece(id: u8) -> Piece {
        Piece::new(id).unwrap()
    }

    #[test]
    fn test_board_starts_empty() {
        let board = Board::new();
        for i in 0..FIELD_COUNT {
            assert!(board.is_empty_field(i));
            assert!(board.get(i).is_none());
        }
        assert_eq!(board.occupied(), 0);
        assert!(!board.is_full());
    }

    #[test]
    fn test_index_and_bounds() {
        assert_eq!(Board::index(0, 0), 0);
        assert_eq!(Board::index(1, 1), 5);
        assert_eq!(Board::index(3, 3), 15);
        assert!(Board::is_field(15));
        assert!(!Board::is_field(16));
    }

    #[test]
    fn test_place_rejects_occupied_and_off_board() {
        let mut board = Board::new();
        board.place(5, piece(3)).unwrap();
        assert_eq!(board.get(5), Some(piece(3)));
        assert_eq!(board.place(5, piece(4)), Err(PlacementError::Occupied(5)));
        assert_eq!(board.get(5), Some(piece(3)));
        assert_eq!(board.place(16, piece(4)), Err(PlacementError::OffBoard(16)));
    }

    #[test]
    fn test_row_win_on_shared_attribute() {
        let mut board = Board::new();
        // 1, 3, 5, 7 are all large
        for (field, id) in [(0, 1), (1, 3), (2, 5), (3, 7)] {
            board.place(field, piece(id)).unwrap();
        }
        assert_eq!(board.winning_line(), Some([0, 1, 2, 3]));
    }

    #[test]
    fn test_diagonal_win_on_shared_clear_bit() {
        let mut board = Board::new();
        // 0, 2, 4, 6 all small
        for (field, id) in [(3, 0), (6, 2), (9, 4), (12, 6)] {
            board.place(field, piece(id)).unwrap();
        }
        assert!(board.has_winner());
    }

    #[test]
    fn test_full_line_without_common_attribute() {
        let mut board = Board::new();
        for (field, id) in [(4, 0), (5, 15), (6, 3), (7, 12)] {
            board.place(field, piece(id)).unwrap();
        }
        assert!(!board.has_winner());
    }

    #[test]
    fn test_incomplete_line_never_wins() {
        let mut board = Board::new();
        for (field, id) in [(0, 1), (1, 3), (2, 5)] {
            board.place(field, piece(id)).unwrap();
        }
        assert!(!board.has_winner());
    }

    #[test]
    fn test_full_board() {
        let mut board = Board::new();
        for (field, p) in Piece::all().enumerate() {
            board.place(field, p).unwrap();
        }
        assert!(board.is_full());
        assert_eq!(board.pieces().count(), 16);
    }
}
