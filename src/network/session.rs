//! Match Session
//!
//! One live match between two clients. Owns the rule engine, enforces turn
//! order, detects terminal outcomes and notifies both players.
//!
//! ```text
//! Starting --start_game--> InProgress --win/draw/disconnect--> Ended
//! ```
//!
//! All mutation happens under the session lock, so validate, apply and
//! broadcast form one atomic step. The session never touches the registry;
//! callers free both clients when a move or disconnect ends the match.

use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::game::piece::Piece;
use crate::game::state::{Game, Move, MoveError, PlayerNumber};
use crate::network::client::Client;
use crate::network::protocol::{GameResult, ServerMessage, NO_PIECE, OPENING_LOCATION};
use crate::ratings::RatingStore;

/// Unique session identifier.
pub type SessionId = Uuid;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Constructed, not yet announced.
    Starting,
    /// Turns alternate.
    InProgress,
    /// Terminal. The session ignores all further input.
    Ended,
}

/// Configuration for a match session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Rating points moved from loser to winner.
    pub rating_delta: i32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { rating_delta: 25 }
    }
}

/// Session errors. The `Display` text is the `ERROR~` reason.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Move before `start_game`.
    #[error("Match not started")]
    NotStarted,

    /// Client is not seated in this match.
    #[error("Not in game")]
    NotParticipant,

    /// Move from the player who is not to move.
    #[error("Not your turn")]
    NotYourTurn,

    /// Location neither the opening code nor a board field.
    #[error("Illegal location")]
    IllegalLocation(i32),

    /// Piece code outside 0-16, or the no-piece code where a piece is needed.
    #[error("Invalid move")]
    UnknownPiece(i32),

    /// Rejected by the rule engine.
    #[error("Invalid move")]
    InvalidMove(#[source] MoveError),
}

/// A move as received on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveRequest {
    /// Target field, or -1 for the opening move.
    pub location: i32,
    /// Piece handed over, or 16 for none.
    pub piece: i32,
}

impl MoveRequest {
    /// Piece-only form.
    pub fn opening(piece: i32) -> Self {
        Self { location: OPENING_LOCATION, piece }
    }

    /// Location and piece form.
    pub fn place(location: i32, piece: i32) -> Self {
        Self { location, piece }
    }

    /// From the two wire forms of `MOVE`.
    pub fn from_wire(location: Option<i32>, piece: i32) -> Self {
        Self {
            location: location.unwrap_or(OPENING_LOCATION),
            piece,
        }
    }

    fn is_opening(&self) -> bool {
        self.location == OPENING_LOCATION
    }

    /// Translate into a rule engine move.
    pub fn to_move(&self) -> Result<Move, SessionError> {
        let field = match self.location {
            OPENING_LOCATION => None,
            loc @ 0..=15 => Some(loc as usize),
            other => return Err(SessionError::IllegalLocation(other)),
        };
        let give = match self.piece {
            NO_PIECE => None,
            id => Some(Piece::from_wire(id).ok_or(SessionError::UnknownPiece(id))?),
        };
        match (field, give) {
            (None, Some(give)) => Ok(Move::opening(give)),
            (None, None) => Err(SessionError::UnknownPiece(self.piece)),
            (Some(field), give) => Ok(Move::place(field, give)),
        }
    }

    /// Echo sent to both players.
    pub fn echo(&self) -> ServerMessage {
        ServerMessage::Move {
            location: (!self.is_opening()).then_some(self.location),
            piece: self.piece,
        }
    }
}

impl fmt::Display for MoveRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.echo(), f)
    }
}

/// Result of [`MatchSession::handle_move`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
    /// Session already ended, input dropped.
    Ignored,
    /// Move refused; the sender got an error.
    Rejected(SessionError),
    /// Move applied and echoed, match continues.
    Continued,
    /// Move applied and ended the match.
    Finished(GameResult),
}

impl MoveOutcome {
    pub fn is_finished(&self) -> bool {
        matches!(self, MoveOutcome::Finished(_))
    }
}

struct SessionInner {
    state: SessionState,
    game: Game,
}

/// A match session.
pub struct MatchSession {
    id: SessionId,
    /// Seats in order: player one, player two.
    players: [Arc<Client>; 2],
    inner: Mutex<SessionInner>,
    ratings: Arc<dyn RatingStore>,
    config: SessionConfig,
}

impl MatchSession {
    /// Create a session. `player_one` moves first.
    pub fn new(
        player_one: Arc<Client>,
        player_two: Arc<Client>,
        ratings: Arc<dyn RatingStore>,
        config: SessionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            players: [player_one, player_two],
            inner: Mutex::new(SessionInner {
                state: SessionState::Starting,
                game: Game::new(),
            }),
            ratings,
            config,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Both players, seat order.
    pub fn players(&self) -> &[Arc<Client>; 2] {
        &self.players
    }

    pub fn player(&self, seat: PlayerNumber) -> &Arc<Client> {
        &self.players[seat.index()]
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// Independent copy of the rule engine state.
    pub async fn game(&self) -> Game {
        self.inner.lock().await.game.clone()
    }

    fn seat_of(&self, client: &Client) -> Option<PlayerNumber> {
        if self.players[0].id() == client.id() {
            Some(PlayerNumber::One)
        } else if self.players[1].id() == client.id() {
            Some(PlayerNumber::Two)
        } else {
            None
        }
    }

    fn name(&self, seat: PlayerNumber) -> String {
        self.player(seat).display_name()
    }

    async fn broadcast(&self, message: &ServerMessage) {
        let line = message.to_line();
        for player in &self.players {
            if !player.connection().send(&line).await {
                debug!("Could not deliver {:?} to {}", line, player.display_name());
            }
        }
    }

    fn unlink(&self) {
        for player in &self.players {
            player.leave_match();
        }
    }

    /// Announce the match and link the players. No-op unless Starting.
    #[instrument(skip(self), fields(session = %self.id))]
    pub async fn start_game(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Starting {
            return;
        }

        let [one, two] = &self.players;
        one.join_match(two, PlayerNumber::One);
        two.join_match(one, PlayerNumber::Two);
        inner.state = SessionState::InProgress;

        let player_one = self.name(PlayerNumber::One);
        let player_two = self.name(PlayerNumber::Two);
        info!("Match started: {} vs {}", player_one, player_two);
        self.broadcast(&ServerMessage::NewGame { player_one, player_two }).await;
    }

    /// Validate, apply and broadcast one move.
    #[instrument(skip(self, client), fields(session = %self.id, client = %client.display_name()))]
    pub async fn handle_move(&self, client: &Client, request: MoveRequest) -> MoveOutcome {
        let mut inner = self.inner.lock().await;

        let result = self.apply(&mut inner, client, &request);
        let seat = match result {
            Ok(seat) => seat,
            Err(None) => return MoveOutcome::Ignored,
            Err(Some(err)) => {
                debug!("Rejected {}: {:?}", request, err);
                client.send_error(&err).await;
                return MoveOutcome::Rejected(err);
            }
        };

        let winner = inner.game.winner();
        let draw = inner.game.is_draw();
        if let Some(winner) = winner {
            inner.state = SessionState::Ended;
            let result = GameResult::Victory { winner: self.name(winner) };
            self.finish(&inner.game, &result).await;
            self.record_result(winner).await;
            return MoveOutcome::Finished(result);
        }
        if draw {
            inner.state = SessionState::Ended;
            let result = GameResult::Draw;
            self.finish(&inner.game, &result).await;
            return MoveOutcome::Finished(result);
        }

        debug!("Player {} played {}", seat, request);
        self.broadcast(&request.echo()).await;
        MoveOutcome::Continued
    }

    /// Checks in protocol order, then the rule engine. `Err(None)` means ended.
    fn apply(
        &self,
        inner: &mut SessionInner,
        client: &Client,
        request: &MoveRequest,
    ) -> Result<PlayerNumber, Option<SessionError>> {
        match inner.state {
            SessionState::Ended => return Err(None),
            SessionState::Starting => return Err(Some(SessionError::NotStarted)),
            SessionState::InProgress => {}
        }
        let seat = self.seat_of(client).ok_or(Some(SessionError::NotParticipant))?;
        if seat != inner.game.current_player() {
            return Err(Some(SessionError::NotYourTurn));
        }
        let mv = request.to_move().map_err(Some)?;
        inner
            .game
            .do_move(&mv)
            .map_err(|e| Some(SessionError::InvalidMove(e)))?;
        Ok(seat)
    }

    async fn finish(&self, game: &Game, result: &GameResult) {
        info!("Match over: {:?}", result);
        match serde_json::to_string(game.board()) {
            Ok(json) => debug!("Final board: {}", json),
            Err(e) => warn!("Could not serialize final board: {}", e),
        }
        self.broadcast(&ServerMessage::GameOver(result.clone())).await;
        self.unlink();
    }

    async fn record_result(&self, winner: PlayerNumber) {
        let delta = self.config.rating_delta;
        let updates = [(self.name(winner), delta), (self.name(winner.other()), -delta)];
        for (name, change) in updates {
            if let Err(e) = self.ratings.update_score(&name, change).await {
                error!("Failed to update rating for {}: {}", name, e);
            }
        }
    }

    /// Forfeit by `client`. The other player wins; ratings are untouched.
    ///
    /// Returns false if the session had already ended.
    #[instrument(skip(self, client), fields(session = %self.id, client = %client.display_name()))]
    pub async fn disconnect(&self, client: &Client) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Ended {
            return false;
        }
        inner.state = SessionState::Ended;

        let Some(seat) = self.seat_of(client) else {
            warn!("Disconnect from a client outside the match");
            self.unlink();
            return true;
        };
        let other = self.player(seat.other());
        let result = GameResult::Victory { winner: self.name(seat.other()) };
        info!("{} left, {} wins by forfeit", client.display_name(), other.display_name());

        other.send(&ServerMessage::GameOver(result)).await;
        self.unlink();
        true
    }
}

impl fmt::Debug for MatchSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatchSession")
            .field("id", &self.id)
            .field("players", &[self.name(PlayerNumber::One), self.name(PlayerNumber::Two)])
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::state::drawn_layout;
    use crate::network::connection::Connection;
    use crate::ratings::MemoryRatingStore;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines};

    struct Seat {
        client: Arc<Client>,
        lines: Lines<BufReader<DuplexStream>>,
    }

    impl Seat {
        fn new(name: &str) -> Self {
            let (local, remote) = tokio::io::duplex(4096);
            let client = Client::new(Connection::new(local, name));
            assert!(client.set_username(name));
            Self { client, lines: BufReader::new(remote).lines() }
        }

        async fn recv(&mut self) -> String {
            tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .expect("timed out waiting for a line")
                .unwrap()
                .expect("stream closed")
        }

        async fn assert_silent(&mut self) {
            let res = tokio::time::timeout(Duration::from_millis(50), self.lines.next_line()).await;
            assert!(res.is_err(), "unexpected line: {:?}", res);
        }
    }

    fn setup() -> (Arc<MatchSession>, Seat, Seat, Arc<MemoryRatingStore>) {
        let alice = Seat::new("Alice");
        let bob = Seat::new("Bob");
        let ratings = Arc::new(MemoryRatingStore::new());
        let session = MatchSession::new(
            alice.client.clone(),
            bob.client.clone(),
            ratings.clone(),
            SessionConfig::default(),
        );
        (session, alice, bob, ratings)
    }

    async fn started() -> (Arc<MatchSession>, Seat, Seat, Arc<MemoryRatingStore>) {
        let (session, mut alice, mut bob, ratings) = setup();
        session.start_game().await;
        assert_eq!(alice.recv().await, "NEWGAME~Alice~Bob");
        assert_eq!(bob.recv().await, "NEWGAME~Alice~Bob");
        (session, alice, bob, ratings)
    }

    /// Nine moves after which Bob wins with `place(3, 0)`.
    /// Row 0 ends up 1, 3, 5, 7: all tall.
    async fn play_to_match_point(session: &MatchSession, alice: &mut Seat, bob: &mut Seat) {
        let moves = [
            MoveRequest::opening(1),
            MoveRequest::place(0, 2),
            MoveRequest::place(4, 3),
            MoveRequest::place(1, 4),
            MoveRequest::place(8, 5),
            MoveRequest::place(2, 6),
            MoveRequest::place(5, 8),
            MoveRequest::place(10, 9),
            MoveRequest::place(15, 7),
        ];
        for (i, request) in moves.iter().enumerate() {
            let mover = if i % 2 == 0 { &alice.client } else { &bob.client };
            assert_eq!(session.handle_move(mover, *request).await, MoveOutcome::Continued);
        }
        for _ in 0..moves.len() {
            alice.recv().await;
            bob.recv().await;
        }
    }

    #[test]
    fn test_move_request_translation() {
        assert_eq!(MoveRequest::opening(3).to_move(), Ok(Move::opening(Piece::new(3).unwrap())));
        assert_eq!(
            MoveRequest::place(5, 7).to_move(),
            Ok(Move::place(5, Piece::new(7)))
        );
        assert_eq!(MoveRequest::place(15, 16).to_move(), Ok(Move::place(15, None)));
        assert_eq!(MoveRequest::place(16, 1).to_move(), Err(SessionError::IllegalLocation(16)));
        assert_eq!(MoveRequest::place(-2, 1).to_move(), Err(SessionError::IllegalLocation(-2)));
        assert_eq!(MoveRequest::place(3, 17).to_move(), Err(SessionError::UnknownPiece(17)));
        assert_eq!(MoveRequest::opening(16).to_move(), Err(SessionError::UnknownPiece(16)));
        assert_eq!(MoveRequest::opening(3).echo().to_line(), "MOVE~3");
        assert_eq!(MoveRequest::place(5, 16).echo().to_line(), "MOVE~5~16");
    }

    #[tokio::test]
    async fn test_start_game_links_players() {
        let (session, alice, bob, _) = started().await;
        assert_eq!(session.state().await, SessionState::InProgress);
        assert_eq!(alice.client.player_number(), Some(PlayerNumber::One));
        assert_eq!(bob.client.player_number(), Some(PlayerNumber::Two));
        assert_eq!(alice.client.opponent().map(|c| c.id()), Some(bob.client.id()));
    }

    #[tokio::test]
    async fn test_move_before_start_rejected() {
        let (session, mut alice, _bob, _) = setup();
        let outcome = session.handle_move(&alice.client, MoveRequest::opening(3)).await;
        assert_eq!(outcome, MoveOutcome::Rejected(SessionError::NotStarted));
        assert_eq!(alice.recv().await, "ERROR~Match not started");
    }

    #[tokio::test]
    async fn test_opening_and_placement_echoed() {
        let (session, mut alice, mut bob, _) = started().await;

        assert_eq!(session.handle_move(&alice.client, MoveRequest::opening(3)).await, MoveOutcome::Continued);
        assert_eq!(alice.recv().await, "MOVE~3");
        assert_eq!(bob.recv().await, "MOVE~3");

        assert_eq!(session.handle_move(&bob.client, MoveRequest::place(5, 7)).await, MoveOutcome::Continued);
        assert_eq!(alice.recv().await, "MOVE~5~7");
        assert_eq!(bob.recv().await, "MOVE~5~7");

        let game = session.game().await;
        assert_eq!(game.board().get(5), Piece::new(3));
        assert_eq!(game.held_piece(), Piece::new(7));
        assert_eq!(game.current_player(), PlayerNumber::One);
    }

    #[tokio::test]
    async fn test_out_of_turn_rejected() {
        let (session, mut alice, mut bob, _) = started().await;
        let outcome = session.handle_move(&bob.client, MoveRequest::opening(3)).await;
        assert_eq!(outcome, MoveOutcome::Rejected(SessionError::NotYourTurn));
        assert_eq!(bob.recv().await, "ERROR~Not your turn");
        alice.assert_silent().await;
        assert_eq!(session.game().await, Game::new());
    }

    #[tokio::test]
    async fn test_occupied_field_rejected() {
        let (session, mut alice, mut bob, _) = started().await;
        session.handle_move(&alice.client, MoveRequest::opening(3)).await;
        session.handle_move(&bob.client, MoveRequest::place(5, 7)).await;
        for seat in [&mut alice, &mut bob] {
            seat.recv().await;
            seat.recv().await;
        }

        let before = session.game().await;
        let outcome = session.handle_move(&alice.client, MoveRequest::place(5, 8)).await;
        assert!(matches!(outcome, MoveOutcome::Rejected(SessionError::InvalidMove(MoveError::FieldOccupied(5)))));
        assert_eq!(alice.recv().await, "ERROR~Invalid move");
        bob.assert_silent().await;
        assert_eq!(session.game().await, before);
    }

    #[tokio::test]
    async fn test_illegal_location_rejected() {
        let (session, mut alice, mut bob, _) = started().await;
        session.handle_move(&alice.client, MoveRequest::opening(1)).await;
        alice.recv().await;
        bob.recv().await;

        let outcome = session.handle_move(&bob.client, MoveRequest::place(20, 2)).await;
        assert_eq!(outcome, MoveOutcome::Rejected(SessionError::IllegalLocation(20)));
        assert_eq!(bob.recv().await, "ERROR~Illegal location");
        alice.assert_silent().await;
    }

    #[tokio::test]
    async fn test_victory_on_tenth_move() {
        let (session, mut alice, mut bob, ratings) = started().await;

        play_to_match_point(&session, &mut alice, &mut bob).await;

        let outcome = session.handle_move(&bob.client, MoveRequest::place(3, 0)).await;
        assert_eq!(outcome, MoveOutcome::Finished(GameResult::Victory { winner: "Bob".into() }));
        assert_eq!(alice.recv().await, "GAMEOVER~VICTORY~Bob");
        assert_eq!(bob.recv().await, "GAMEOVER~VICTORY~Bob");
        assert_eq!(session.state().await, SessionState::Ended);
        assert!(alice.client.opponent().is_none());
        assert!(bob.client.player_number().is_none());

        assert_eq!(ratings.score("Bob"), 1025);
        assert_eq!(ratings.score("Alice"), 975);

        // Inert afterwards
        assert_eq!(session.handle_move(&alice.client, MoveRequest::place(6, 10)).await, MoveOutcome::Ignored);
        assert!(!session.disconnect(&alice.client).await);
        alice.assert_silent().await;
    }

    #[tokio::test]
    async fn test_draw_on_full_board() {
        let (session, mut alice, mut bob, ratings) = started().await;
        let layout = drawn_layout();

        let mut requests = vec![MoveRequest::opening(layout[0].1.id() as i32)];
        for (i, (field, _)) in layout.iter().enumerate() {
            let give = layout.get(i + 1).map_or(NO_PIECE, |(_, p)| p.id() as i32);
            requests.push(MoveRequest::place(*field as i32, give));
        }

        let last = requests.len() - 1;
        for (i, request) in requests.into_iter().enumerate() {
            let mover = if i % 2 == 0 { &alice.client } else { &bob.client };
            let outcome = session.handle_move(mover, request).await;
            if i == last {
                assert_eq!(outcome, MoveOutcome::Finished(GameResult::Draw));
            } else {
                assert_eq!(outcome, MoveOutcome::Continued);
                alice.recv().await;
                bob.recv().await;
            }
        }

        assert_eq!(alice.recv().await, "GAMEOVER~DRAW");
        assert_eq!(bob.recv().await, "GAMEOVER~DRAW");
        assert!(ratings.rankings().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_forfeits_once() {
        let (session, mut alice, mut bob, ratings) = started().await;
        session.handle_move(&alice.client, MoveRequest::opening(3)).await;
        alice.recv().await;
        bob.recv().await;

        assert!(session.disconnect(&alice.client).await);
        assert_eq!(bob.recv().await, "GAMEOVER~VICTORY~Bob");
        assert!(bob.client.opponent().is_none());
        assert_eq!(session.state().await, SessionState::Ended);

        assert!(!session.disconnect(&bob.client).await);
        assert_eq!(session.handle_move(&bob.client, MoveRequest::place(0, 1)).await, MoveOutcome::Ignored);
        bob.assert_silent().await;
        assert!(ratings.rankings().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_simultaneous_moves_apply_once() {
        for _ in 0..20 {
            let (session, mut alice, mut bob, _) = started().await;

            let from_alice = {
                let (session, client) = (session.clone(), alice.client.clone());
                tokio::spawn(async move { session.handle_move(&client, MoveRequest::opening(3)).await })
            };
            let from_bob = {
                let (session, client) = (session.clone(), bob.client.clone());
                tokio::spawn(async move { session.handle_move(&client, MoveRequest::opening(5)).await })
            };
            let (alice_outcome, bob_outcome) = tokio::join!(from_alice, from_bob);

            assert_eq!(alice_outcome.unwrap(), MoveOutcome::Continued);
            match bob_outcome.unwrap() {
                MoveOutcome::Rejected(SessionError::NotYourTurn) => {
                    assert_eq!(bob.recv().await, "ERROR~Not your turn");
                    assert_eq!(bob.recv().await, "MOVE~3");
                }
                MoveOutcome::Rejected(SessionError::InvalidMove(_)) => {
                    assert_eq!(bob.recv().await, "MOVE~3");
                    assert_eq!(bob.recv().await, "ERROR~Invalid move");
                }
                other => panic!("second opening was not rejected: {:?}", other),
            }
            assert_eq!(alice.recv().await, "MOVE~3");
            alice.assert_silent().await;
            bob.assert_silent().await;

            let game = session.game().await;
            assert_eq!(game.held_piece(), Piece::new(3));
            assert_eq!(game.current_player(), PlayerNumber::Two);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_winning_move_racing_disconnect_ends_once() {
        for _ in 0..20 {
            let (session, mut alice, mut bob, ratings) = started().await;
            play_to_match_point(&session, &mut alice, &mut bob).await;

            let winning = {
                let (session, client) = (session.clone(), bob.client.clone());
                tokio::spawn(async move { session.handle_move(&client, MoveRequest::place(3, 0)).await })
            };
            let leaving = {
                let (session, client) = (session.clone(), alice.client.clone());
                tokio::spawn(async move { session.disconnect(&client).await })
            };
            let (outcome, forfeited) = tokio::join!(winning, leaving);
            let (outcome, forfeited) = (outcome.unwrap(), forfeited.unwrap());

            let victory = GameResult::Victory { winner: "Bob".into() };
            if forfeited {
                assert_eq!(outcome, MoveOutcome::Ignored);
                assert!(ratings.rankings().is_empty());
                alice.assert_silent().await;
            } else {
                assert_eq!(outcome, MoveOutcome::Finished(victory));
                assert_eq!(ratings.score("Bob"), 1025);
                assert_eq!(alice.recv().await, "GAMEOVER~VICTORY~Bob");
            }
            assert_eq!(bob.recv().await, "GAMEOVER~VICTORY~Bob");
            bob.assert_silent().await;

            assert_eq!(session.state().await, SessionState::Ended);
            assert_eq!(session.handle_move(&alice.client, MoveRequest::place(6, 10)).await, MoveOutcome::Ignored);
            assert!(!session.disconnect(&bob.client).await);
        }
    }
}
