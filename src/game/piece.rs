//! Piece Model
//!
//! The 16 Quarto pieces, each identified by a 4-bit id.
//! Every bit of the id is one binary attribute, so line checks
//! reduce to bitwise AND over the pieces in the line.

use serde::{Serialize, Deserialize};
use std::fmt;

/// Number of distinct pieces (and board fields).
pub const PIECE_COUNT: u8 = 16;

/// Mask covering the four attribute bits.
pub const ATTRIBUTE_MASK: u8 = 0b1111;

// =============================================================================
// ATTRIBUTES
// =============================================================================

/// Piece height (bit 0).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Size {
    /// Bit clear.
    Small,
    /// Bit set.
    Large,
}

/// Piece outline (bit 1).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Shape {
    /// Bit clear.
    Round,
    /// Bit set.
    Square,
}

/// Piece colour (bit 2).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Colour {
    /// Bit clear.
    White,
    /// Bit set.
    Black,
}

/// Piece top (bit 3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Fill {
    /// Bit clear.
    Hollow,
    /// Bit set.
    Solid,
}

// =============================================================================
// PIECE
// =============================================================================

/// A single piece, stored as its canonical id (0-15).
///
/// Implements Ord so piece sets iterate in id order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Piece(u8);

impl Piece {
    /// Size bit.
    pub const SIZE_BIT: u8 = 0b0001;
    /// Shape bit.
    pub const SHAPE_BIT: u8 = 0b0010;
    /// Colour bit.
    pub const COLOUR_BIT: u8 = 0b0100;
    /// Fill bit.
    pub const FILL_BIT: u8 = 0b1000;

    /// Create from an id, `None` if outside 0-15.
    pub const fn new(id: u8) -> Option<Self> {
        if id < PIECE_COUNT {
            Some(Self(id))
        } else {
            None
        }
    }

    /// Create from a signed wire value.
    pub fn from_wire(id: i32) -> Option<Self> {
        u8::try_from(id).ok().and_then(Self::new)
    }

    /// Build the piece with the given attributes.
    pub const fn from_attributes(size: Size, shape: Shape, colour: Colour, fill: Fill) -> Self {
        let mut id = 0;
        if matches!(size, Size::Large) {
            id |= Self::SIZE_BIT;
        }
        if matches!(shape, Shape::Square) {
            id |= Self::SHAPE_BIT;
        }
        if matches!(colour, Colour::Black) {
            id |= Self::COLOUR_BIT;
        }
        if matches!(fill, Fill::Solid) {
            id |= Self::FILL_BIT;
        }
        Self(id)
    }

    /// Canonical id.
    #[inline]
    pub const fn id(self) -> u8 {
        self.0
    }

    /// Attribute bitmask (same value as the id).
    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Size attribute, bit 0.
    pub fn size(self) -> Size {
        if self.0 & Self::SIZE_BIT != 0 { Size::Large } else { Size::Small }
    }

    /// Shape attribute, bit 1.
    pub fn shape(self) -> Shape {
        if self.0 & Self::SHAPE_BIT != 0 { Shape::Square } else { Shape::Round }
    }

    /// Colour attribute, bit 2.
    pub fn colour(self) -> Colour {
        if self.0 & Self::COLOUR_BIT != 0 { Colour::Black } else { Colour::White }
    }

    /// Fill attribute, bit 3.
    pub fn fill(self) -> Fill {
        if self.0 & Self::FILL_BIT != 0 { Fill::Solid } else { Fill::Hollow }
    }

    /// Iterate over all 16 pieces in id order.
    pub fn all() -> impl Iterator<Item = Piece> {
        (0..PIECE_COUNT).map(Piece)
    }
}

impl fmt::Display for Piece {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// True when the pieces agree on at least one attribute value.
///
/// AND of the ids catches attributes all set; AND of the complements
/// catches attributes all clear.
pub fn share_attribute(pieces: &[Piece]) -> bool {
    if pieces.is_empty() {
        return false;
    }
    let all_set = pieces.iter().fold(ATTRIBUTE_MASK, |acc, p| acc & p.bits());
    let all_clear = pieces.iter().fold(ATTRIBUTE_MASK, |acc, p| acc & !p.bits()) & ATTRIBUTE_MASK;
    all_set != 0 || all_clear != 0
}

// =============================================================================
// PIECE SET
// =============================================================================

/// Set of pieces as a 16-bit mask (bit n = piece n).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PieceSet(u16);

impl PieceSet {
    /// No pieces.
    pub const EMPTY: PieceSet = PieceSet(0);

    /// All 16 pieces.
    pub const FULL: PieceSet = PieceSet(u16::MAX);

    #[inline]
    pub fn contains(self, piece: Piece) -> bool {
        self.0 & (1 << piece.id()) != 0
    }

    /// Insert, returning false if already present.
    pub fn insert(&mut self, piece: Piece) -> bool {
        let had = self.contains(piece);
        self.0 |= 1 << piece.id();
        !had
    }

    /// Remove, returning false if absent.
    pub fn remove(&mut self, piece: Piece) -> bool {
        let had = self.contains(piece);
        self.0 &= !(1 << piece.id());
        had
    }

    #[inline]
    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Raw mask.
    pub fn bits(self) -> u16 {
        self.0
    }

    /// Iterate members in id order.
    pub fn iter(self) -> impl Iterator<Item = Piece> {
        Piece::all().filter(move |p| self.contains(*p))
    }
}

impl FromIterator<Piece> for PieceSet {
    fn from_iter<I: IntoIterator<Item = Piece>>(iter: I) -> Self {
        let mut set = PieceSet::EMPTY;
        for piece in iter {
            set.insert(piece);
        }
        set
    }
}
