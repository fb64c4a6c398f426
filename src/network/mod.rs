//! Network Layer
//!
//! Line-based TCP server for Quarto matches.
//! All rule decisions are delegated to `game/`.

pub mod client;
pub mod connection;
pub mod handler;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod server;

pub use client::{Client, ClientId};
pub use connection::{Connection, ConnectionError, ConnectionHandler};
pub use handler::ClientHandler;
pub use protocol::{Command, GameResult, ProtocolError, ServerMessage};
pub use registry::{FifoPairing, PairingStrategy, QueueEntry, Registry, RegistryError, SkillWindowPairing};
pub use session::{MatchSession, MoveOutcome, MoveRequest, SessionConfig, SessionError, SessionId, SessionState};
pub use server::{ConfigError, GameServer, GameServerError, PairingMode, ServerConfig};
