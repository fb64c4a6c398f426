//! Protocol Messages
//!
//! Line-based wire format. One message per line, fields separated by `~`,
//! the first field is the command name.
//!
//! ```text
//! client -> server: HELLO[~desc]  LOGIN~name  QUEUE  MOVE~piece  MOVE~loc~piece
//!                   LIST  CHAT~text  RANK
//! server -> client: HELLO~desc  LOGIN~SUCCESS  QUEUE~WAITING  NEWGAME~p1~p2
//!                   MOVE~piece  MOVE~loc~piece  GAMEOVER~DRAW  GAMEOVER~VICTORY~name
//!                   ERROR~reason  CHAT~sender~text  LIST~names...  RANK~name~score...
//! ```

use std::fmt;

/// Field separator.
pub const SEPARATOR: char = '~';

/// Piece code for "no next piece" on the final placement.
pub const NO_PIECE: i32 = 16;

/// Location code for the opening move.
pub const OPENING_LOCATION: i32 = -1;

/// Parse failures at the protocol boundary.
///
/// The `Display` text is sent to the client after `ERROR~`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Blank line.
    #[error("Empty message")]
    Empty,

    /// First field is not a known command.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Argument count does not fit the command.
    #[error("Wrong number of arguments for {0}")]
    WrongArity(&'static str),

    /// Numeric argument did not parse.
    #[error("Invalid number: {0}")]
    InvalidNumber(String),
}

fn split_head(line: &str) -> Result<(&str, Option<&str>), ProtocolError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Err(ProtocolError::Empty);
    }
    Ok(match line.split_once(SEPARATOR) {
        Some((head, rest)) => (head, Some(rest)),
        None => (line, None),
    })
}

fn split_args(rest: Option<&str>) -> Vec<&str> {
    rest.map(|r| r.split(SEPARATOR).collect()).unwrap_or_default()
}

fn parse_number(arg: &str) -> Result<i32, ProtocolError> {
    arg.trim()
        .parse()
        .map_err(|_| ProtocolError::InvalidNumber(arg.to_string()))
}

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Commands sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Greeting, with an optional client description.
    Hello {
        /// Client description.
        description: Option<String>,
    },
    /// Bind a username to the connection.
    Login {
        /// Requested name.
        username: String,
    },
    /// Join matchmaking.
    Queue,
    /// Make a move in the active match.
    Move {
        /// Target field, `None` for the piece-only form.
        location: Option<i32>,
        /// Piece handed over (16 for none).
        piece: i32,
    },
    /// List logged-in users.
    List,
    /// Broadcast text.
    Chat {
        /// Message body (may contain the separator).
        text: String,
    },
    /// Request the rankings.
    Rank,
}

impl Command {
    pub const HELLO: &'static str = "HELLO";
    pub const LOGIN: &'static str = "LOGIN";
    pub const QUEUE: &'static str = "QUEUE";
    pub const MOVE: &'static str = "MOVE";
    pub const LIST: &'static str = "LIST";
    pub const CHAT: &'static str = "CHAT";
    pub const RANK: &'static str = "RANK";

    /// Parse a single line.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let (head, rest) = split_head(line)?;

        // CHAT keeps the rest of the line intact
        if head == Self::CHAT {
            return match rest {
                Some(text) => Ok(Command::Chat { text: text.to_string() }),
                None => Err(ProtocolError::WrongArity(Self::CHAT)),
            };
        }

        let args = split_args(rest);
        match head {
            Self::HELLO => match args.as_slice() {
                [] => Ok(Command::Hello { description: None }),
                [desc] => Ok(Command::Hello { description: Some(desc.to_string()) }),
                _ => Err(ProtocolError::WrongArity(Self::HELLO)),
            },
            Self::LOGIN => match args.as_slice() {
                [name] => Ok(Command::Login { username: name.to_string() }),
                _ => Err(ProtocolError::WrongArity(Self::LOGIN)),
            },
            Self::QUEUE => no_args(&args, Self::QUEUE, Command::Queue),
            Self::LIST => no_args(&args, Self::LIST, Command::List),
            Self::RANK => no_args(&args, Self::RANK, Command::Rank),
            Self::MOVE => match args.as_slice() {
                [piece] => Ok(Command::Move { location: None, piece: parse_number(piece)? }),
                [location, piece] => Ok(Command::Move {
                    location: Some(parse_number(location)?),
                    piece: parse_number(piece)?,
                }),
                _ => Err(ProtocolError::WrongArity(Self::MOVE)),
            },
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

    /// Name on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Hello { .. } => Self::HELLO,
            Command::Login { .. } => Self::LOGIN,
            Command::Queue => Self::QUEUE,
            Command::Move { .. } => Self::MOVE,
            Command::List => Self::LIST,
            Command::Chat { .. } => Self::CHAT,
            Command::Rank => Self::RANK,
        }
    }
}

fn no_args(args: &[&str], name: &'static str, command: Command) -> Result<Command, ProtocolError> {
    if args.is_empty() {
        Ok(command)
    } else {
        Err(ProtocolError::WrongArity(name))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = SEPARATOR;
        match self {
            Command::Hello { description: Some(d) } => write!(f, "{}{sep}{}", Self::HELLO, d),
            Command::Login { username } => write!(f, "{}{sep}{}", Self::LOGIN, username),
            Command::Move { location: Some(l), piece } => write!(f, "{}{sep}{}{sep}{}", Self::MOVE, l, piece),
            Command::Move { location: None, piece } => write!(f, "{}{sep}{}", Self::MOVE, piece),
            Command::Chat { text } => write!(f, "{}{sep}{}", Self::CHAT, text),
            other => f.write_str(other.name()),
        }
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Terminal match outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameResult {
    /// Named player won.
    Victory {
        /// Winner's username.
        winner: String,
    },
    /// Board full, no winner.
    Draw,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Greeting reply.
    Hello {
        /// Server description.
        description: String,
    },
    /// Login accepted.
    LoginOk,
    /// Added to the wait queue.
    Queued,
    /// Match start. Player one moves first.
    NewGame {
        /// First mover.
        player_one: String,
        /// Second mover.
        player_two: String,
    },
    /// A move applied in the match (echoed to both players).
    Move {
        /// Target field, `None` for the opening move.
        location: Option<i32>,
        /// Piece handed over.
        piece: i32,
    },
    /// Match over.
    GameOver(GameResult),
    /// Rejected request.
    Error(String),
    /// Chat broadcast.
    Chat {
        /// Sender username.
        sender: String,
        /// Message body.
        text: String,
    },
    /// Logged-in usernames.
    List(Vec<String>),
    /// Rankings, highest first.
    Rank(Vec<(String, u32)>),
}

impl ServerMessage {
    pub const HELLO: &'static str = "HELLO";
    pub const LOGIN: &'static str = "LOGIN";
    pub const QUEUE: &'static str = "QUEUE";
    pub const NEWGAME: &'static str = "NEWGAME";
    pub const MOVE: &'static str = "MOVE";
    pub const GAMEOVER: &'static str = "GAMEOVER";
    pub const ERROR: &'static str = "ERROR";
    pub const CHAT: &'static str = "CHAT";
    pub const LIST: &'static str = "LIST";
    pub const RANK: &'static str = "RANK";

    const SUCCESS: &'static str = "SUCCESS";
    const WAITING: &'static str = "WAITING";
    const VICTORY: &'static str = "VICTORY";
    const DRAW: &'static str = "DRAW";

    /// Build an error reply from anything displayable.
    pub fn error(reason: impl fmt::Display) -> Self {
        ServerMessage::Error(reason.to_string())
    }

    /// Encode as a single line without the trailing newline.
    pub fn to_line(&self) -> String {
        self.to_string()
    }

    /// Decode a server line (client side).
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let (head, rest) = split_head(line)?;
        match head {
            Self::HELLO => Ok(ServerMessage::Hello { description: rest.unwrap_or_default().to_string() }),
            Self::LOGIN => match rest {
                Some(Self::SUCCESS) => Ok(ServerMessage::LoginOk),
                _ => Err(ProtocolError::WrongArity(Self::LOGIN)),
            },
            Self::QUEUE => match rest {
                Some(Self::WAITING) => Ok(ServerMessage::Queued),
                _ => Err(ProtocolError::WrongArity(Self::QUEUE)),
            },
            Self::ERROR => Ok(ServerMessage::Error(rest.unwrap_or_default().to_string())),
            Self::CHAT => match rest.and_then(|r| r.split_once(SEPARATOR)) {
                Some((sender, text)) => Ok(ServerMessage::Chat {
                    sender: sender.to_string(),
                    text: text.to_string(),
                }),
                None => Err(ProtocolError::WrongArity(Self::CHAT)),
            },
            Self::NEWGAME => match split_args(rest).as_slice() {
                [p1, p2] => Ok(ServerMessage::NewGame {
                    player_one: p1.to_string(),
                    player_two: p2.to_string(),
                }),
                _ => Err(ProtocolError::WrongArity(Self::NEWGAME)),
            },
            Self::MOVE => match split_args(rest).as_slice() {
                [piece] => Ok(ServerMessage::Move { location: None, piece: parse_number(piece)? }),
                [location, piece] => Ok(ServerMessage::Move {
                    location: Some(parse_number(location)?),
                    piece: parse_number(piece)?,
                }),
                _ => Err(ProtocolError::WrongArity(Self::MOVE)),
            },
            Self::GAMEOVER => match split_args(rest).as_slice() {
                [Self::DRAW] => Ok(ServerMessage::GameOver(GameResult::Draw)),
                [Self::VICTORY, winner] => Ok(ServerMessage::GameOver(GameResult::Victory {
                    winner: winner.to_string(),
                })),
                _ => Err(ProtocolError::WrongArity(Self::GAMEOVER)),
            },
            Self::LIST => Ok(ServerMessage::List(
                split_args(rest).into_iter().map(str::to_string).collect(),
            )),
            Self::RANK => {
                let args = split_args(rest);
                if args.len() % 2 != 0 {
                    return Err(ProtocolError::WrongArity(Self::RANK));
                }
                args.chunks(2)
                    .map(|pair| {
                        let score = pair[1]
                            .parse::<u32>()
                            .map_err(|_| ProtocolError::InvalidNumber(pair[1].to_string()))?;
                        Ok((pair[0].to_string(), score))
                    })
                    .collect::<Result<Vec<_>, _>>()
                    .map(ServerMessage::Rank)
            }
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = SEPARATOR;
        match self {
            ServerMessage::Hello { description } => write!(f, "{}{sep}{}", Self::HELLO, description),
            ServerMessage::LoginOk => write!(f, "{}{sep}{}", Self::LOGIN, Self::SUCCESS),
            ServerMessage::Queued => write!(f, "{}{sep}{}", Self::QUEUE, Self::WAITING),
            ServerMessage::NewGame { player_one, player_two } => {
                write!(f, "{}{sep}{}{sep}{}", Self::NEWGAME, player_one, player_two)
            }
            ServerMessage::Move { location: Some(l), piece } => write!(f, "{}{sep}{}{sep}{}", Self::MOVE, l, piece),
            ServerMessage::Move { location: None, piece } => write!(f, "{}{sep}{}", Self::MOVE, piece),
            ServerMessage::GameOver(GameResult::Draw) => write!(f, "{}{sep}{}", Self::GAMEOVER, Self::DRAW),
            ServerMessage::GameOver(GameResult::Victory { winner }) => {
                write!(f, "{}{sep}{}{sep}{}", Self::GAMEOVER, Self::VICTORY, winner)
            }
            ServerMessage::Error(reason) => write!(f, "{}{sep}{}", Self::ERROR, reason),
            ServerMessage::Chat { sender, text } => write!(f, "{}{sep}{}{sep}{}", Self::CHAT, sender, text),
            ServerMessage::List(names) => {
                f.write_str(Self::LIST)?;
                for name in names {
                    write!(f, "{sep}{}", name)?;
                }
                Ok(())
            }
            ServerMessage::Rank(entries) => {
                f.write_str(Self::RANK)?;
                for (name, score) in entries {
                    write!(f, "{sep}{}{sep}{}", name, score)?;
                }
                Ok(())
            }
        }
    }
}
