//! Match Client
//!
//! Client side of the line protocol for front ends and automated players.
//! Server lines are decoded and delivered to a [`MatchListener`]; commands
//! go out through [`GameClient`].
//!
//! Per match the listener sees `on_connected` once, then `on_match_start`,
//! any number of `on_opponent_or_echoed_move`, and `on_match_over`.
//! `on_error` and `on_chat` may arrive at any point.

use std::sync::Arc;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::game::piece::Piece;
use crate::network::connection::{Connection, ConnectionError, ConnectionHandler};
use crate::network::protocol::{Command, GameResult, ServerMessage, NO_PIECE, OPENING_LOCATION};

/// Callbacks for a presentation client.
///
/// The wire does not say who made a move, so implementations must tell
/// their own confirmed move apart from the opponent's.
pub trait MatchListener: Send + Sync {
    /// Connection established.
    fn on_connected(&self);

    /// Match announced. `player_one` moves first.
    fn on_match_start(&self, player_one: &str, player_two: &str);

    /// A move was applied. `location` is `None` for the opening move,
    /// `piece` is `None` on the final placement.
    fn on_opponent_or_echoed_move(&self, location: Option<usize>, piece: Option<Piece>);

    /// Match over.
    fn on_match_over(&self, result: &GameResult);

    /// Server rejected a request.
    fn on_error(&self, message: &str);

    /// Chat line.
    fn on_chat(&self, sender: &str, text: &str);
}

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Could not connect.
    #[error("Connect failed: {0}")]
    Io(#[from] std::io::Error),

    /// Receive loop could not start.
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

struct ListenerAdapter {
    listener: Arc<dyn MatchListener>,
}

impl ListenerAdapter {
    fn deliver(&self, message: ServerMessage) {
        let listener = &self.listener;
        match message {
            ServerMessage::NewGame { player_one, player_two } => listener.on_match_start(&player_one, &player_two),
            ServerMessage::Move { location, piece } => match decode_move(location, piece) {
                Some((location, piece)) => listener.on_opponent_or_echoed_move(location, piece),
                None => warn!("Server sent an out-of-range move: {:?} {}", location, piece),
            },
            ServerMessage::GameOver(result) => listener.on_match_over(&result),
            ServerMessage::Error(reason) => listener.on_error(&reason),
            ServerMessage::Chat { sender, text } => listener.on_chat(&sender, &text),
            other => debug!("Server: {}", other),
        }
    }
}

fn decode_move(location: Option<i32>, piece: i32) -> Option<(Option<usize>, Option<Piece>)> {
    let location = match location {
        None | Some(OPENING_LOCATION) => None,
        Some(loc) => Some(usize::try_from(loc).ok().filter(|&l| l < 16)?),
    };
    let piece = match piece {
        NO_PIECE => None,
        id => Some(Piece::from_wire(id)?),
    };
    Some((location, piece))
}

#[async_trait]
impl ConnectionHandler for ListenerAdapter {
    async fn on_start(&self, connection: &Arc<Connection>) {
        info!("Connected to {}", connection.peer());
        self.listener.on_connected();
    }

    async fn on_message(&self, _connection: &Arc<Connection>, line: String) {
        match ServerMessage::parse(&line) {
            Ok(message) => self.deliver(message),
            Err(e) => warn!("Unreadable server line {:?}: {}", line, e),
        }
    }

    async fn on_disconnect(&self, connection: &Arc<Connection>) {
        info!("Disconnected from {}", connection.peer());
    }
}

/// A protocol client.
pub struct GameClient {
    connection: Arc<Connection>,
    receive_task: JoinHandle<()>,
}

impl GameClient {
    /// Connect over TCP and start listening.
    pub async fn connect(addr: impl ToSocketAddrs, listener: Arc<dyn MatchListener>) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        Self::attach(Connection::from_tcp(stream), listener)
    }

    /// Use an existing duplex stream.
    pub fn from_stream<S>(stream: S, listener: Arc<dyn MatchListener>) -> Result<Self, ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::attach(Connection::new(stream, "server"), listener)
    }

    fn attach(connection: Arc<Connection>, listener: Arc<dyn MatchListener>) -> Result<Self, ClientError> {
        let receive_task = connection.start(Arc::new(ListenerAdapter { listener }))?;
        Ok(Self { connection, receive_task })
    }

    /// Send a raw command.
    pub async fn send(&self, command: &Command) -> bool {
        self.connection.send(&command.to_string()).await
    }

    pub async fn hello(&self, description: &str) -> bool {
        self.send(&Command::Hello { description: Some(description.to_string()) }).await
    }

    pub async fn login(&self, username: &str) -> bool {
        self.send(&Command::Login { username: username.to_string() }).await
    }

    pub async fn queue(&self) -> bool {
        self.send(&Command::Queue).await
    }

    /// Send a move. `location` is `None` for the opening move,
    /// `piece` is `None` on the final placement.
    pub async fn play(&self, location: Option<usize>, piece: Option<Piece>) -> bool {
        let piece = piece.map_or(NO_PIECE, |p| i32::from(p.id()));
        // Board indices are below 16, so the conversion cannot truncate.
        let location = location.map(|l| l as i32);
        self.send(&Command::Move { location, piece }).await
    }

    pub async fn list(&self) -> bool {
        self.send(&Command::List).await
    }

    pub async fn chat(&self, text: &str) -> bool {
        self.send(&Command::Chat { text: text.to_string() }).await
    }

    pub async fn rank(&self) -> bool {
        self.send(&Command::Rank).await
    }

    pub fn is_connected(&self) -> bool {
        !self.connection.is_closed()
    }

    /// Close the connection and wait for the receive loop.
    pub async fn close(self) {
        self.connection.close();
        let _ = self.receive_task.await;
    }
}
