//! Connected Client State
//!
//! Per-connection state tracked by the server: username, current opponent
//! and seat. Created on accept, dropped when the connection closes.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::game::state::PlayerNumber;
use crate::network::connection::Connection;
use crate::network::protocol::ServerMessage;

/// Process-unique client identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(u64);

impl ClientId {
    /// Allocate the next identifier.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ClientId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Default)]
struct ClientState {
    /// Set once on login.
    username: Option<String>,
    /// Valid only while in a match.
    opponent: Option<Weak<Client>>,
    player: Option<PlayerNumber>,
}

/// A connected client.
pub struct Client {
    id: ClientId,
    connection: Arc<Connection>,
    state: Mutex<ClientState>,
}

impl Client {
    /// Create a client for a fresh connection.
    pub fn new(connection: Arc<Connection>) -> Arc<Self> {
        Arc::new(Self {
            id: ClientId::next(),
            connection,
            state: Mutex::new(ClientState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn username(&self) -> Option<String> {
        self.state().username.clone()
    }

    pub fn is_logged_in(&self) -> bool {
        self.state().username.is_some()
    }

    /// Bind the username. Returns false if one is already bound.
    pub(crate) fn set_username(&self, name: &str) -> bool {
        let mut state = self.state();
        if state.username.is_some() {
            return false;
        }
        state.username = Some(name.to_string());
        true
    }

    /// Username, or the client id for clients that never logged in.
    pub fn display_name(&self) -> String {
        self.username().unwrap_or_else(|| self.id.to_string())
    }

    pub fn opponent(&self) -> Option<Arc<Client>> {
        self.state().opponent.as_ref().and_then(Weak::upgrade)
    }

    pub fn player_number(&self) -> Option<PlayerNumber> {
        self.state().player
    }

    /// Enter a match.
    pub(crate) fn join_match(&self, opponent: &Arc<Client>, player: PlayerNumber) {
        let mut state = self.state();
        state.opponent = Some(Arc::downgrade(opponent));
        state.player = Some(player);
    }

    /// Leave the current match.
    pub(crate) fn leave_match(&self) {
        let mut state = self.state();
        state.opponent = None;
        state.player = None;
    }

    /// Send a protocol message.
    pub async fn send(&self, message: &ServerMessage) -> bool {
        self.connection.send(&message.to_line()).await
    }

    /// Send `ERROR~<reason>`.
    pub async fn send_error(&self, reason: impl fmt::Display) -> bool {
        self.send(&ServerMessage::error(reason)).await
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("username", &self.username())
            .field("peer", &self.connection.peer())
            .finish()
    }
}
