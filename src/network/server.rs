//! TCP Game Server
//!
//! Accepts line-protocol connections, attaches a [`ClientHandler`] to each,
//! and runs the background matchmaking loop.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};

use crate::network::client::Client;
use crate::network::connection::Connection;
use crate::network::handler::ClientHandler;
use crate::network::registry::{FifoPairing, PairingStrategy, Registry, SkillWindowPairing};
use crate::network::session::SessionConfig;
use crate::ratings::{RatingError, RatingStore};

/// Which pairing strategy the registry uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingMode {
    /// Two longest waiters.
    Fifo,
    /// Rating window that widens with wait time.
    Skill,
}

impl FromStr for PairingMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fifo" => Ok(PairingMode::Fifo),
            "skill" => Ok(PairingMode::Skill),
            _ => Err(()),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Rating file.
    pub ratings_path: PathBuf,
    /// Rating points per decisive result.
    pub rating_delta: i32,
    /// Pairing strategy.
    pub pairing: PairingMode,
    /// Base rating window for skill pairing.
    pub skill_window: u32,
    /// Window growth per waited second for skill pairing.
    pub skill_widen: u32,
    /// How often the queue is re-checked.
    pub matchmaking_interval: Duration,
    /// Sent in reply to `HELLO`.
    pub description: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5555)),
            max_connections: 1000,
            ratings_path: PathBuf::from("ratings.txt"),
            rating_delta: 25,
            pairing: PairingMode::Fifo,
            skill_window: 100,
            skill_widen: 10,
            matchmaking_interval: Duration::from_secs(1),
            description: format!("Quarto server v{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Variable present but unparseable.
    #[error("Invalid value for {var}: {value:?}")]
    Invalid {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

impl ServerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Create config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            bind_addr: parse_var(&lookup, "QUARTO_BIND_ADDR", defaults.bind_addr)?,
            max_connections: parse_var(&lookup, "QUARTO_MAX_CONNECTIONS", defaults.max_connections)?,
            ratings_path: lookup("QUARTO_RATINGS_FILE").map(PathBuf::from).unwrap_or(defaults.ratings_path),
            rating_delta: parse_var(&lookup, "QUARTO_RATING_DELTA", defaults.rating_delta)?,
            pairing: parse_var(&lookup, "QUARTO_PAIRING", defaults.pairing)?,
            skill_window: parse_var(&lookup, "QUARTO_SKILL_WINDOW", defaults.skill_window)?,
            skill_widen: parse_var(&lookup, "QUARTO_SKILL_WIDEN", defaults.skill_widen)?,
            matchmaking_interval: defaults.matchmaking_interval,
            description: defaults.description,
        })
    }

    /// Build the configured pairing strategy.
    pub fn pairing_strategy(&self) -> Box<dyn PairingStrategy> {
        match self.pairing {
            PairingMode::Fifo => Box::new(FifoPairing),
            PairingMode::Skill => Box::new(SkillWindowPairing {
                base_window: self.skill_window,
                widen_per_second: self.skill_widen,
            }),
        }
    }

    /// Session settings derived from this config.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig { rating_delta: self.rating_delta }
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// Bad configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Rating store unavailable.
    #[error("Rating store error: {0}")]
    Ratings(#[from] RatingError),
}

/// The game server.
pub struct GameServer {
    /// Server configuration.
    config: ServerConfig,
    /// Clients, queue and matches.
    registry: Arc<Registry>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server.
    pub fn new(config: ServerConfig, ratings: Arc<dyn RatingStore>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let registry = Registry::new(ratings, config.pairing_strategy(), config.session_config());

        Self {
            config,
            registry: Arc::new(registry),
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    #[instrument(skip(self, listener))]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        info!("Game server listening on {}", listener.local_addr()?);

        let matchmaking_handle = tokio::spawn(Self::run_matchmaking_loop(
            self.registry.clone(),
            self.config.matchmaking_interval,
        ));

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.registry.client_count().await;
                            if clients_count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream).await;
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        matchmaking_handle.abort();
        for client in self.registry.all_clients().await {
            client.connection().close();
        }

        Ok(())
    }

    /// Register a client and start its receive loop.
    async fn handle_connection(&self, stream: TcpStream) {
        let connection = Connection::from_tcp(stream);
        let client = Client::new(connection.clone());
        self.registry.register(client.clone()).await;

        let handler = Arc::new(ClientHandler::new(
            client,
            self.registry.clone(),
            self.config.description.clone(),
        ));
        if let Err(e) = connection.start(handler) {
            error!("Failed to start connection {}: {}", connection.peer(), e);
        }
    }

    /// Run matchmaking loop.
    ///
    /// Pairing also happens on every queue join; this catches pairs that
    /// only become acceptable as skill windows widen.
    async fn run_matchmaking_loop(registry: Arc<Registry>, period: Duration) {
        let mut interval = interval(period);

        loop {
            interval.tick().await;
            let started = registry.try_pair().await;
            if started > 0 {
                debug!("Matchmaking loop started {} matches", started);
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.registry.client_count().await
    }

    /// Get active session count.
    pub async fn session_count(&self) -> usize {
        self.registry.session_count().await
    }

    /// Get matchmaking queue size.
    pub async fn queue_size(&self) -> usize {
        self.registry.queue_size().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratings::MemoryRatingStore;
    use std::collections::HashMap;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::task::JoinHandle;

    struct TestClient {
        lines: Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl TestClient {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read, writer) = stream.into_split();
            Self { lines: BufReader::new(read).lines(), writer }
        }

        async fn send(&mut self, line: &str) {
            self.writer.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
        }

        async fn recv(&mut self) -> Option<String> {
            tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .expect("timed out waiting for a line")
                .unwrap_or(None)
        }

        async fn expect(&mut self, expected: &str) {
            assert_eq!(self.recv().await.as_deref(), Some(expected));
        }

        async fn login(addr: SocketAddr, name: &str) -> Self {
            let mut client = Self::connect(addr).await;
            client.send(&format!("LOGIN~{}", name)).await;
            client.expect("LOGIN~SUCCESS").await;
            client
        }
    }

    async fn start(config: ServerConfig) -> (Arc<GameServer>, Arc<MemoryRatingStore>, SocketAddr, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ratings = Arc::new(MemoryRatingStore::new());
        let server = Arc::new(GameServer::new(config, ratings.clone()));
        let serving = server.clone();
        let handle = tokio::spawn(async move {
            serving.serve(listener).await.unwrap();
        });
        (server, ratings, addr, handle)
    }

    /// Poll (connections, sessions) until `check` holds.
    async fn wait_for_counts(server: &GameServer, check: impl Fn(usize, usize) -> bool) {
        for _ in 0..100 {
            if check(server.connection_count().await, server.session_count().await) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 5555);
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.rating_delta, 25);
        assert_eq!(config.pairing, PairingMode::Fifo);
    }

    #[test]
    fn test_server_config_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("QUARTO_BIND_ADDR", "127.0.0.1:7000"),
            ("QUARTO_PAIRING", "Skill"),
            ("QUARTO_SKILL_WINDOW", "50"),
            ("QUARTO_RATINGS_FILE", "/tmp/r.txt"),
        ]
        .into_iter()
        .collect();
        let config = ServerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.pairing, PairingMode::Skill);
        assert_eq!(config.skill_window, 50);
        assert_eq!(config.skill_widen, 10);
        assert_eq!(config.ratings_path, PathBuf::from("/tmp/r.txt"));
    }

    #[test]
    fn test_server_config_rejects_bad_values() {
        let err = ServerConfig::from_lookup(|k| (k == "QUARTO_MAX_CONNECTIONS").then(|| "lots".to_string()))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid { var: "QUARTO_MAX_CONNECTIONS", value: "lots".into() }
        );
        assert!(ServerConfig::from_lookup(|k| (k == "QUARTO_PAIRING").then(|| "elo".to_string())).is_err());
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = GameServer::new(ServerConfig::default(), Arc::new(MemoryRatingStore::new()));

        assert_eq!(server.connection_count().await, 0);
        assert_eq!(server.session_count().await, 0);
        assert_eq!(server.queue_size().await, 0);
    }

    #[tokio::test]
    async fn test_server_shutdown() {
        let (server, _, addr, handle) = start(ServerConfig::default()).await;
        let mut client = TestClient::connect(addr).await;
        wait_for_counts(&server, |connections, _| connections == 1).await;

        server.shutdown();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(client.recv().await, None);
    }

    #[tokio::test]
    async fn test_full_match_over_tcp() {
        let (server, ratings, addr, _handle) = start(ServerConfig::default()).await;

        let mut alice = TestClient::login(addr, "Alice").await;
        let mut bob = TestClient::login(addr, "Bob").await;

        alice.send("QUEUE").await;
        alice.expect("QUEUE~WAITING").await;
        bob.send("QUEUE").await;
        bob.expect("QUEUE~WAITING").await;
        alice.expect("NEWGAME~Alice~Bob").await;
        bob.expect("NEWGAME~Alice~Bob").await;

        // Row 0 becomes 1, 3, 5, 7 on the tenth move: all tall.
        let moves = [
            "MOVE~1", "MOVE~0~2", "MOVE~4~3", "MOVE~1~4", "MOVE~8~5",
            "MOVE~2~6", "MOVE~5~8", "MOVE~10~9", "MOVE~15~7",
        ];
        for (i, line) in moves.iter().enumerate() {
            let mover = if i % 2 == 0 { &mut alice } else { &mut bob };
            mover.send(line).await;
            alice.expect(line).await;
            bob.expect(line).await;
        }

        bob.send("MOVE~3~0").await;
        alice.expect("GAMEOVER~VICTORY~Bob").await;
        bob.expect("GAMEOVER~VICTORY~Bob").await;

        wait_for_counts(&server, |_, sessions| sessions == 0).await;
        assert_eq!(ratings.score("Bob"), 1025);
        assert_eq!(ratings.score("Alice"), 975);

        alice.send("RANK").await;
        alice.expect("RANK~Bob~1025~Alice~975").await;
    }

    #[tokio::test]
    async fn test_disconnect_mid_match_over_tcp() {
        let (server, ratings, addr, _handle) = start(ServerConfig::default()).await;

        let mut alice = TestClient::login(addr, "Alice").await;
        let mut bob = TestClient::login(addr, "Bob").await;
        alice.send("QUEUE").await;
        bob.send("QUEUE").await;
        alice.expect("QUEUE~WAITING").await;
        alice.expect("NEWGAME~Alice~Bob").await;
        bob.expect("QUEUE~WAITING").await;
        bob.expect("NEWGAME~Alice~Bob").await;

        alice.send("MOVE~3").await;
        alice.expect("MOVE~3").await;
        bob.expect("MOVE~3").await;

        drop(alice);
        bob.expect("GAMEOVER~VICTORY~Bob").await;
        wait_for_counts(&server, |connections, _| connections == 1).await;
        assert_eq!(server.session_count().await, 0);
        assert!(ratings.rankings().is_empty());

        bob.send("MOVE~0~4").await;
        bob.expect("ERROR~Not in game").await;
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let config = ServerConfig { max_connections: 1, ..Default::default() };
        let (server, _, addr, _handle) = start(config).await;

        let mut first = TestClient::connect(addr).await;
        first.send("HELLO").await;
        assert!(first.recv().await.is_some_and(|l| l.starts_with("HELLO~")));

        let mut second = TestClient::connect(addr).await;
        assert_eq!(second.recv().await, None);
        assert_eq!(server.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_skill_pairing_via_matchmaking_loop() {
        let config = ServerConfig {
            pairing: PairingMode::Skill,
            skill_window: 0,
            skill_widen: 100,
            matchmaking_interval: Duration::from_millis(100),
            ..Default::default()
        };
        let (server, ratings, addr, _handle) = start(config).await;
        ratings.update_score("Bob", 150).await.unwrap();

        let mut alice = TestClient::login(addr, "Alice").await;
        let mut bob = TestClient::login(addr, "Bob").await;
        alice.send("QUEUE").await;
        alice.expect("QUEUE~WAITING").await;
        bob.send("QUEUE").await;
        bob.expect("QUEUE~WAITING").await;
        assert_eq!(server.queue_size().await, 2);

        // Gap of 150 fits once Alice has waited two seconds.
        tokio::time::timeout(Duration::from_secs(5), alice.expect("NEWGAME~Alice~Bob"))
            .await
            .unwrap();
        bob.expect("NEWGAME~Alice~Bob").await;
    }
}
