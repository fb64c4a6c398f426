//! Client Registry & Matchmaking
//!
//! Process-wide bookkeeping: connected clients, the wait queue and the
//! client-to-session map, all behind one lock. Pairing runs under that lock
//! so queue joins, pairing and disconnect cleanup never interleave. Sends
//! made under the lock only enqueue on the peer's connection.
//!
//! Lock order is registry, then session.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::network::client::{Client, ClientId};
use crate::network::protocol::ServerMessage;
use crate::network::session::{MatchSession, MoveOutcome, MoveRequest, SessionConfig};
use crate::ratings::RatingStore;

/// Registry precondition failures. The `Display` text is the `ERROR~` reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Command needs a bound username.
    #[error("Must login first")]
    MustLogin,

    /// Username already bound on this connection.
    #[error("Already logged in")]
    AlreadyLoggedIn,

    /// Another connection holds the name.
    #[error("Username already taken")]
    UsernameTaken,

    /// Blank username.
    #[error("Username must not be empty")]
    EmptyUsername,

    /// Client is queued or playing.
    #[error("Already in game or queue")]
    AlreadyQueued,

    /// Client has no active match.
    #[error("Not in game")]
    NotInGame,
}

// =============================================================================
// PAIRING
// =============================================================================

/// Matchmaking queue entry.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Waiting client.
    pub client: Arc<Client>,
    /// Join time.
    pub queued_at: Instant,
    /// Rating at join time.
    pub rating: u32,
}

impl QueueEntry {
    /// Time spent waiting as of `now`.
    pub fn waited(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.queued_at)
    }
}

/// Chooses which two queued clients to pair.
pub trait PairingStrategy: Send + Sync {
    /// Indices `(first, second)` into the queue, `first < second`.
    /// The entry at `first` becomes player one.
    fn select(&self, queue: &[QueueEntry], now: Instant) -> Option<(usize, usize)>;

    /// Name for logs.
    fn name(&self) -> &'static str;
}

/// Pair the two longest waiters.
#[derive(Debug, Clone, Copy, Default)]
pub struct FifoPairing;

impl PairingStrategy for FifoPairing {
    fn select(&self, queue: &[QueueEntry], _now: Instant) -> Option<(usize, usize)> {
        (queue.len() >= 2).then_some((0, 1))
    }

    fn name(&self) -> &'static str {
        "fifo"
    }
}

/// Pair by rating, widening the allowed gap the longer the head waits.
#[derive(Debug, Clone, Copy)]
pub struct SkillWindowPairing {
    /// Allowed rating gap at zero wait.
    pub base_window: u32,
    /// Extra gap per second waited.
    pub widen_per_second: u32,
}

impl Default for SkillWindowPairing {
    fn default() -> Self {
        Self {
            base_window: 100,
            widen_per_second: 10,
        }
    }
}

impl SkillWindowPairing {
    /// Allowed gap for an entry as of `now`.
    pub fn window(&self, entry: &QueueEntry, now: Instant) -> u32 {
        let seconds = u32::try_from(entry.waited(now).as_secs()).unwrap_or(u32::MAX);
        self.base_window
            .saturating_add(self.widen_per_second.saturating_mul(seconds))
    }
}

impl PairingStrategy for SkillWindowPairing {
    fn select(&self, queue: &[QueueEntry], now: Instant) -> Option<(usize, usize)> {
        queue.iter().enumerate().find_map(|(i, head)| {
            let window = self.window(head, now);
            queue[i + 1..]
                .iter()
                .position(|other| head.rating.abs_diff(other.rating) <= window)
                .map(|offset| (i, i + 1 + offset))
        })
    }

    fn name(&self) -> &'static str {
        "skill"
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

#[derive(Default)]
struct RegistryInner {
    /// Connected clients, in connection order.
    clients: BTreeMap<ClientId, Arc<Client>>,
    /// Wait queue, longest waiter first.
    queue: Vec<QueueEntry>,
    /// Active match per client.
    matches: HashMap<ClientId, Arc<MatchSession>>,
}

impl RegistryInner {
    fn is_queued(&self, id: ClientId) -> bool {
        self.queue.iter().any(|e| e.client.id() == id)
    }

    /// Drop both players' entries if they still point at `session`.
    fn release(&mut self, session: &MatchSession) {
        for player in session.players() {
            let owned = self
                .matches
                .get(&player.id())
                .is_some_and(|s| std::ptr::eq(Arc::as_ptr(s), session));
            if owned {
                self.matches.remove(&player.id());
            }
        }
    }
}

/// The client registry.
pub struct Registry {
    inner: Mutex<RegistryInner>,
    pairing: Box<dyn PairingStrategy>,
    ratings: Arc<dyn RatingStore>,
    session_config: SessionConfig,
}

impl Registry {
    /// Create an empty registry.
    pub fn new(
        ratings: Arc<dyn RatingStore>,
        pairing: Box<dyn PairingStrategy>,
        session_config: SessionConfig,
    ) -> Self {
        info!("Registry using {} pairing", pairing.name());
        Self {
            inner: Mutex::new(RegistryInner::default()),
            pairing,
            ratings,
            session_config,
        }
    }

    pub fn ratings(&self) -> &Arc<dyn RatingStore> {
        &self.ratings
    }

    /// Track a newly connected client.
    pub async fn register(&self, client: Arc<Client>) {
        self.inner.lock().await.clients.insert(client.id(), client);
    }

    /// Bind a unique, non-empty username.
    #[instrument(skip(self, client), fields(client = %client.id()))]
    pub async fn login(&self, client: &Client, name: &str) -> Result<(), RegistryError> {
        if name.trim().is_empty() {
            return Err(RegistryError::EmptyUsername);
        }

        let inner = self.inner.lock().await;
        if client.is_logged_in() {
            return Err(RegistryError::AlreadyLoggedIn);
        }
        let taken = inner
            .clients
            .values()
            .any(|c| c.id() != client.id() && c.username().as_deref() == Some(name));
        if taken {
            return Err(RegistryError::UsernameTaken);
        }
        if !client.set_username(name) {
            return Err(RegistryError::AlreadyLoggedIn);
        }

        info!("{} logged in as {}", client.connection().peer(), name);
        Ok(())
    }

    /// Logged-in usernames, connection order.
    pub async fn usernames(&self) -> Vec<String> {
        self.inner
            .lock()
            .await
            .clients
            .values()
            .filter_map(|c| c.username())
            .collect()
    }

    /// Logged-in clients, connection order.
    pub async fn logged_in_clients(&self) -> Vec<Arc<Client>> {
        self.inner
            .lock()
            .await
            .clients
            .values()
            .filter(|c| c.is_logged_in())
            .cloned()
            .collect()
    }

    /// Every connected client.
    pub async fn all_clients(&self) -> Vec<Arc<Client>> {
        self.inner.lock().await.clients.values().cloned().collect()
    }

    /// Enqueue a client, acknowledge, then try to pair.
    #[instrument(skip(self, client), fields(client = %client.display_name()))]
    pub async fn add_to_queue(&self, client: &Arc<Client>) -> Result<(), RegistryError> {
        let Some(name) = client.username() else {
            return Err(RegistryError::MustLogin);
        };

        let mut inner = self.inner.lock().await;
        if inner.is_queued(client.id()) || inner.matches.contains_key(&client.id()) {
            return Err(RegistryError::AlreadyQueued);
        }

        inner.queue.push(QueueEntry {
            client: Arc::clone(client),
            queued_at: Instant::now(),
            rating: self.ratings.score(&name),
        });
        info!("{} queued ({} waiting)", name, inner.queue.len());
        client.send(&ServerMessage::Queued).await;

        self.pair_locked(&mut inner).await;
        Ok(())
    }

    /// Pair as many waiting clients as the strategy allows.
    pub async fn try_pair(&self) -> usize {
        let mut inner = self.inner.lock().await;
        self.pair_locked(&mut inner).await
    }

    async fn pair_locked(&self, inner: &mut RegistryInner) -> usize {
        let mut started = 0;
        while let Some((first, second)) = self.pairing.select(&inner.queue, Instant::now()) {
            let second = inner.queue.remove(second);
            let first = inner.queue.remove(first);

            let session = MatchSession::new(
                first.client.clone(),
                second.client.clone(),
                Arc::clone(&self.ratings),
                self.session_config.clone(),
            );
            inner.matches.insert(first.client.id(), Arc::clone(&session));
            inner.matches.insert(second.client.id(), Arc::clone(&session));
            debug!(
                "Paired {} ({}) with {} ({}) in {}",
                first.client.display_name(),
                first.rating,
                second.client.display_name(),
                second.rating,
                session.id()
            );

            session.start_game().await;
            started += 1;
        }
        started
    }

    /// Remove a client and clean up its queue entry or match.
    #[instrument(skip(self, client), fields(client = %client.display_name()))]
    pub async fn handle_disconnect(&self, client: &Client) {
        let mut inner = self.inner.lock().await;
        inner.clients.remove(&client.id());

        let before = inner.queue.len();
        inner.queue.retain(|e| e.client.id() != client.id());
        if inner.queue.len() != before {
            info!("Removed {} from queue", client.display_name());
        }

        if let Some(session) = inner.matches.remove(&client.id()) {
            session.disconnect(client).await;
            inner.release(&session);
        }
    }

    /// Free both players of a finished session. Idempotent.
    pub async fn end_session(&self, session: &MatchSession) {
        self.inner.lock().await.release(session);
    }

    pub async fn session_for(&self, client: &Client) -> Option<Arc<MatchSession>> {
        self.inner.lock().await.matches.get(&client.id()).cloned()
    }

    /// Forward a move to the client's match and release it if it ended.
    pub async fn submit_move(&self, client: &Client, request: MoveRequest) -> Result<MoveOutcome, RegistryError> {
        let session = self.session_for(client).await.ok_or(RegistryError::NotInGame)?;
        let outcome = session.handle_move(client, request).await;
        if outcome.is_finished() {
            self.end_session(&session).await;
        }
        Ok(outcome)
    }

    /// Get connected client count.
    pub async fn client_count(&self) -> usize {
        self.inner.lock().await.clients.len()
    }

    /// Get matchmaking queue size.
    pub async fn queue_size(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    /// Get active session count.
    pub async fn session_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.matches.values().map(|s| s.id()).collect::<HashSet<_>>().len()
    }

    pub async fn is_queued(&self, client: &Client) -> bool {
        self.inner.lock().await.is_queued(client.id())
    }
}
