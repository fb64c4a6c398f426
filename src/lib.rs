//! # Quarto Match Server
//!
//! Authoritative server for two-player Quarto over a line-based TCP protocol.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      QUARTO SERVER                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  game/             - Rule engine (pure, no I/O)              │
//! │  ├── piece.rs      - 4-bit pieces and piece sets             │
//! │  ├── board.rs      - 4x4 board, winning lines                │
//! │  └── state.rs      - Turns, move legality, win/draw          │
//! │                                                              │
//! │  network/          - Server                                  │
//! │  ├── connection.rs - Line connection + receive loop          │
//! │  ├── protocol.rs   - Wire commands and replies               │
//! │  ├── client.rs     - Per-connection client state             │
//! │  ├── handler.rs    - Command dispatch                        │
//! │  ├── registry.rs   - Clients, queue, pairing                 │
//! │  ├── session.rs    - Match state machine                     │
//! │  └── server.rs     - Accept loop, config                     │
//! │                                                              │
//! │  ratings.rs        - Persistent scores                       │
//! │  client/           - Protocol client for front ends          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Match flow
//!
//! `LOGIN` then `QUEUE`; two queued clients are paired into a session that
//! announces `NEWGAME~p1~p2`. Players alternate `MOVE` commands, each
//! validated by the rule engine and echoed to both sides, until a win,
//! a draw, or a disconnect ends the match with `GAMEOVER`.

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod client;
pub mod game;
pub mod network;
pub mod ratings;

// Re-export commonly used types
pub use game::{Board, Game, Move, MoveError, Piece, PieceSet, PlayerNumber};
pub use network::{GameServer, GameServerError, ServerConfig};
pub use ratings::{FileRatingStore, MemoryRatingStore, RatingStore};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
