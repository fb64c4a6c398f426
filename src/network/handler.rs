//! Client Command Dispatch
//!
//! Parses each line from a client and routes it to the registry or the
//! client's active match. Every failure is reported to the sender as
//! `ERROR~<reason>`; nothing here closes the connection.

use std::sync::Arc;
use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::network::client::Client;
use crate::network::connection::{Connection, ConnectionHandler};
use crate::network::protocol::{Command, ServerMessage};
use crate::network::registry::{Registry, RegistryError};
use crate::network::session::{MoveOutcome, MoveRequest};

/// Connection handler for one server-side client.
pub struct ClientHandler {
    client: Arc<Client>,
    registry: Arc<Registry>,
    /// Sent in reply to `HELLO`.
    server_description: String,
}

impl ClientHandler {
    /// Create a handler.
    pub fn new(client: Arc<Client>, registry: Arc<Registry>, server_description: impl Into<String>) -> Self {
        Self {
            client,
            registry,
            server_description: server_description.into(),
        }
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// Handle one parsed command.
    #[instrument(skip(self), fields(client = %self.client.display_name()))]
    pub async fn dispatch(&self, command: Command) {
        let client = &self.client;
        match command {
            Command::Hello { description } => {
                if let Some(description) = description {
                    debug!("Client describes itself as {:?}", description);
                }
                client
                    .send(&ServerMessage::Hello { description: self.server_description.clone() })
                    .await;
            }
            Command::Login { username } => match self.registry.login(client, &username).await {
                Ok(()) => {
                    client.send(&ServerMessage::LoginOk).await;
                }
                Err(e) => {
                    client.send_error(e).await;
                }
            },
            Command::Queue => {
                if let Err(e) = self.registry.add_to_queue(client).await {
                    client.send_error(e).await;
                }
            }
            Command::Move { location, piece } => {
                let request = MoveRequest::from_wire(location, piece);
                match self.registry.submit_move(client, request).await {
                    Ok(MoveOutcome::Finished(result)) => info!("Match finished: {:?}", result),
                    Ok(_) => {}
                    Err(e) => {
                        client.send_error(e).await;
                    }
                }
            }
            Command::List => {
                let names = self.registry.usernames().await;
                client.send(&ServerMessage::List(names)).await;
            }
            Command::Chat { text } => {
                let Some(sender) = client.username() else {
                    client.send_error(RegistryError::MustLogin).await;
                    return;
                };
                let message = ServerMessage::Chat { sender, text };
                for recipient in self.registry.logged_in_clients().await {
                    recipient.send(&message).await;
                }
            }
            Command::Rank => {
                let rankings = self.registry.ratings().rankings();
                client.send(&ServerMessage::Rank(rankings)).await;
            }
        }
    }
}

#[async_trait]
impl ConnectionHandler for ClientHandler {
    async fn on_start(&self, connection: &Arc<Connection>) {
        info!("Client {} connected from {}", self.client.id(), connection.peer());
    }

    async fn on_message(&self, _connection: &Arc<Connection>, line: String) {
        match Command::parse(&line) {
            Ok(command) => self.dispatch(command).await,
            Err(e) => {
                debug!("Bad input from {}: {:?} ({})", self.client.display_name(), line, e);
                self.client.send_error(e).await;
            }
        }
    }

    async fn on_disconnect(&self, connection: &Arc<Connection>) {
        info!("Client {} ({}) disconnected", self.client.display_name(), connection.peer());
        self.registry.handle_disconnect(&self.client).await;
    }
}
