//! Line protocol types for bridge-engine communication.
//!
//! Outbound lines are [`Command`]s, encoded from a verb and an ordered list of
//! key/value parameters. Inbound lines decode into [`ResponseEvent`]s. Both
//! directions are stateless: nothing here remembers previous lines.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Monotonic identifier assigned by the bridge to each caller command.
pub type CommandId = u64;

/// Ordered key/value parameters. Keys with an empty value encode as bare flags
/// (`go infinite`, `position startpos`).
pub type Params = Vec<(String, String)>;

const GO_KEYWORDS: &[&str] = &[
    "searchmoves",
    "wtime",
    "btime",
    "winc",
    "binc",
    "movestogo",
    "depth",
    "nodes",
    "movetime",
    "mate",
    "perft",
    "infinite",
    "ponder",
];
const POSITION_KEYWORDS: &[&str] = &["startpos", "fen", "moves"];
const SETOPTION_KEYWORDS: &[&str] = &["name", "value"];

/// Protocol verb of an outbound command.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Verb {
    Uci,
    IsReady,
    UciNewGame,
    Position,
    Go,
    SetOption,
    Stop,
    PonderHit,
    Quit,
    /// Engine-specific verb the bridge has no grammar for (`d`, `flip`, `eval`).
    Custom(String),
}

/// How parameters of a verb are laid out on the line.
enum Grammar {
    /// No parameters allowed.
    Bare,
    /// Parameters are introduced by protocol keywords; values may span tokens.
    Keywords(&'static [&'static str]),
    /// Single-token key/value pairs.
    Pairs,
}

/// Scheduling class of a command, derived from its verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandClass {
    /// `uci`, answered by `uciok`.
    Handshake,
    /// `isready`, answered by `readyok`.
    Sync,
    /// `go`, answered by `bestmove`.
    Search,
    /// No reply expected; done once written.
    Oneway,
    /// Sent immediately even while a search is outstanding.
    Control,
}

impl CommandClass {
    /// Whether this class holds a slot in the pending table until a terminal event.
    pub fn awaits_reply(&self) -> bool {
        matches!(self, Self::Handshake | Self::Sync | Self::Search)
    }

    /// Whether `event` is the terminal reply for this class.
    pub fn is_answered_by(&self, event: &ResponseEvent) -> bool {
        matches!(
            (self, event),
            (Self::Handshake, ResponseEvent::UciOk)
                | (Self::Sync, ResponseEvent::Ready)
                | (Self::Search, ResponseEvent::BestMove { .. })
        )
    }
}

impl Verb {
    pub fn parse(s: &str) -> Self {
        match s {
            "uci" => Self::Uci,
            "isready" => Self::IsReady,
            "ucinewgame" => Self::UciNewGame,
            "position" => Self::Position,
            "go" => Self::Go,
            "setoption" => Self::SetOption,
            "stop" => Self::Stop,
            "ponderhit" => Self::PonderHit,
            "quit" => Self::Quit,
            other => Self::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Uci => "uci",
            Self::IsReady => "isready",
            Self::UciNewGame => "ucinewgame",
            Self::Position => "position",
            Self::Go => "go",
            Self::SetOption => "setoption",
            Self::Stop => "stop",
            Self::PonderHit => "ponderhit",
            Self::Quit => "quit",
            Self::Custom(s) => s,
        }
    }

    pub fn class(&self) -> CommandClass {
        match self {
            Self::Uci => CommandClass::Handshake,
            Self::IsReady => CommandClass::Sync,
            Self::Go => CommandClass::Search,
            Self::Stop | Self::PonderHit | Self::Quit => CommandClass::Control,
            Self::UciNewGame | Self::Position | Self::SetOption | Self::Custom(_) => {
                CommandClass::Oneway
            }
        }
    }

    fn grammar(&self) -> Grammar {
        match self {
            Self::Uci | Self::IsReady | Self::UciNewGame | Self::Stop | Self::PonderHit | Self::Quit => {
                Grammar::Bare
            }
            Self::Go => Grammar::Keywords(GO_KEYWORDS),
            Self::Position => Grammar::Keywords(POSITION_KEYWORDS),
            Self::SetOption => Grammar::Keywords(SETOPTION_KEYWORDS),
            Self::Custom(_) => Grammar::Pairs,
        }
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single outbound command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub id: CommandId,
    pub verb: Verb,
    pub params: Params,
    pub deadline: Option<Duration>,
}

fn is_token(s: &str) -> bool {
    !s.is_empty() && !s.chars().any(|c| c.is_whitespace() || c.is_control())
}

fn invalid(msg: impl Into<String>) -> BridgeError {
    BridgeError::InvalidCommand(msg.into())
}

impl Command {
    pub fn new(id: CommandId, verb: Verb, params: Params) -> Self {
        Self {
            id,
            verb,
            params,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Encode into one protocol line, without the line terminator.
    ///
    /// Fails with [`BridgeError::InvalidCommand`] when any part could inject a
    /// line break or would not parse back into the same verb and parameters.
    pub fn encode(&self) -> Result<String> {
        let verb = self.verb.as_str();
        if !is_token(verb) {
            return Err(invalid(format!("verb {verb:?} is not a single token")));
        }
        // A custom verb spelled like a built-in would dodge that verb's class and grammar.
        if matches!(self.verb, Verb::Custom(_)) && !matches!(Verb::parse(verb), Verb::Custom(_)) {
            return Err(invalid(format!("'{verb}' is a built-in verb, not a custom one")));
        }

        let mut line = String::from(verb);
        match self.verb.grammar() {
            Grammar::Bare => {
                if !self.params.is_empty() {
                    return Err(invalid(format!("'{verb}' takes no parameters")));
                }
            }
            Grammar::Keywords(keywords) => {
                for (key, value) in &self.params {
                    if !keywords.contains(&key.as_str()) {
                        return Err(invalid(format!("'{verb}' does not accept '{key}'")));
                    }
                    if value.chars().any(char::is_control) {
                        return Err(invalid(format!("value of '{key}' contains a control character")));
                    }
                    let tokens: Vec<&str> = value.split_whitespace().collect();
                    if tokens.join(" ") != *value {
                        return Err(invalid(format!("value of '{key}' has irregular spacing")));
                    }
                    if let Some(kw) = tokens.iter().find(|t| keywords.contains(t)) {
                        return Err(invalid(format!(
                            "value of '{key}' contains the keyword '{kw}'"
                        )));
                    }
                    line.push(' ');
                    line.push_str(key);
                    if !value.is_empty() {
                        line.push(' ');
                        line.push_str(value);
                    }
                }
            }
            Grammar::Pairs => {
                for (key, value) in &self.params {
                    if !is_token(key) || !is_token(value) {
                        return Err(invalid(format!(
                            "'{verb}' parameters must be single tokens, got {key:?}={value:?}"
                        )));
                    }
                    line.push(' ');
                    line.push_str(key);
                    line.push(' ');
                    line.push_str(value);
                }
            }
        }
        Ok(line)
    }

    /// Recover verb and parameters from an encoded line.
    pub fn parse(line: &str) -> Result<(Verb, Params)> {
        let mut tokens = line.split_whitespace();
        let verb = Verb::parse(tokens.next().ok_or_else(|| invalid("empty command line"))?);

        let mut params: Params = Vec::new();
        match verb.grammar() {
            Grammar::Bare => {
                if tokens.next().is_some() {
                    return Err(invalid(format!("'{verb}' takes no parameters")));
                }
            }
            Grammar::Keywords(keywords) => {
                for tok in tokens {
                    if keywords.contains(&tok) {
                        params.push((tok.to_string(), String::new()));
                        continue;
                    }
                    let Some((_, value)) = params.last_mut() else {
                        return Err(invalid(format!("'{tok}' appears before any keyword")));
                    };
                    if !value.is_empty() {
                        value.push(' ');
                    }
                    value.push_str(tok);
                }
            }
            Grammar::Pairs => {
                let rest: Vec<&str> = tokens.collect();
                if rest.len() % 2 != 0 {
                    return Err(invalid(format!("'{verb}' has an unpaired parameter")));
                }
                params = rest
                    .chunks(2)
                    .map(|pair| (pair[0].to_string(), pair[1].to_string()))
                    .collect();
            }
        }
        Ok((verb, params))
    }
}

/// Encode a command into a protocol line.
pub fn encode(command: &Command) -> Result<String> {
    command.encode()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreKind {
    /// Centipawns from the side to move.
    Cp,
    /// Moves to mate; negative when being mated.
    Mate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreBound {
    Lower,
    Upper,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    pub kind: ScoreKind,
    pub value: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bound: Option<ScoreBound>,
}

/// Win/draw/loss estimate in per mille.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wdl {
    pub win: u32,
    pub draw: u32,
    pub loss: u32,
}

/// Search progress reported by an `info` line. Every field is optional since
/// engines emit different subsets at different points of a search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seldepth: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multipv: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<Score>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wdl: Option<Wdl>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nps: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hashfull: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tbhits: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currmove: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currmovenumber: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pv: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub string: Option<String>,
}

/// An engine option declared in reply to `uci`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionDecl {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vars: Vec<String>,
}

/// Inbound event decoded from one engine line (or synthesized on exit).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseEvent {
    /// `readyok`
    Ready,
    /// `uciok`
    UciOk,
    BestMove {
        mv: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        ponder: Option<String>,
    },
    Info(InfoEvent),
    Id {
        field: String,
        value: String,
    },
    Option(OptionDecl),
    Error {
        message: String,
    },
    /// Synthesized by the bridge when the engine exits; never decoded.
    EngineExit {
        code: Option<i32>,
    },
}

impl ResponseEvent {
    /// Whether this event can complete a pending request.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Ready | Self::UciOk | Self::BestMove { .. } | Self::Error { .. }
        )
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::UciOk => "uciok",
            Self::BestMove { .. } => "bestmove",
            Self::Info(_) => "info",
            Self::Id { .. } => "id",
            Self::Option(_) => "option",
            Self::Error { .. } => "error",
            Self::EngineExit { .. } => "engine_exit",
        }
    }
}

fn unparseable(line: &str) -> BridgeError {
    BridgeError::UnparseableLine(line.to_string())
}

/// Decode one inbound line.
///
/// Unknown tokens inside a recognized event are skipped. Only a line that
/// cannot be classified at all is an error.
pub fn decode(line: &str) -> Result<ResponseEvent> {
    let line = line.trim();
    let mut tokens = line.split_whitespace();
    let Some(head) = tokens.next() else {
        return Err(unparseable(line));
    };

    match head {
        "readyok" => Ok(ResponseEvent::Ready),
        "uciok" => Ok(ResponseEvent::UciOk),
        "bestmove" => {
            let mv = tokens.next().ok_or_else(|| unparseable(line))?.to_string();
            let ponder = match tokens.next() {
                Some("ponder") => tokens.next().map(str::to_string),
                _ => None,
            };
            Ok(ResponseEvent::BestMove { mv, ponder })
        }
        "info" => Ok(ResponseEvent::Info(decode_info(tokens))),
        "id" => {
            let field = tokens.next().ok_or_else(|| unparseable(line))?.to_string();
            let value = tokens.collect::<Vec<_>>().join(" ");
            Ok(ResponseEvent::Id { field, value })
        }
        "option" => decode_option(tokens)
            .map(ResponseEvent::Option)
            .ok_or_else(|| unparseable(line)),
        _ if line.starts_with("Unknown command") || line.starts_with("No such option") => {
            Ok(ResponseEvent::Error {
                message: line.to_string(),
            })
        }
        _ => Err(unparseable(line)),
    }
}

fn next_num<'a, T: std::str::FromStr>(tokens: &mut impl Iterator<Item = &'a str>) -> Option<T> {
    tokens.next().and_then(|t| t.parse().ok())
}

fn decode_info<'a>(mut tokens: impl Iterator<Item = &'a str>) -> InfoEvent {
    let mut info = InfoEvent::default();

    while let Some(tok) = tokens.next() {
        match tok {
            "depth" => info.depth = next_num(&mut tokens),
            "seldepth" => info.seldepth = next_num(&mut tokens),
            "multipv" => info.multipv = next_num(&mut tokens),
            "nodes" => info.nodes = next_num(&mut tokens),
            "nps" => info.nps = next_num(&mut tokens),
            "hashfull" => info.hashfull = next_num(&mut tokens),
            "tbhits" => info.tbhits = next_num(&mut tokens),
            "time" => info.time_ms = next_num(&mut tokens),
            "currmovenumber" => info.currmovenumber = next_num(&mut tokens),
            "currmove" => info.currmove = tokens.next().map(str::to_string),
            "score" => {
                let kind = match tokens.next() {
                    Some("cp") => Some(ScoreKind::Cp),
                    Some("mate") => Some(ScoreKind::Mate),
                    _ => None,
                };
                let value = next_num::<i32>(&mut tokens);
                if let (Some(kind), Some(value)) = (kind, value) {
                    info.score = Some(Score {
                        kind,
                        value,
                        bound: None,
                    });
                }
            }
            "lowerbound" | "upperbound" => {
                if let Some(score) = info.score.as_mut() {
                    score.bound = Some(if tok == "lowerbound" {
                        ScoreBound::Lower
                    } else {
                        ScoreBound::Upper
                    });
                }
            }
            "wdl" => {
                let w = next_num(&mut tokens);
                let d = next_num(&mut tokens);
                let l = next_num(&mut tokens);
                if let (Some(win), Some(draw), Some(loss)) = (w, d, l) {
                    info.wdl = Some(Wdl { win, draw, loss });
                }
            }
            "pv" => {
                info.pv = tokens.by_ref().map(str::to_string).collect();
            }
            "string" => {
                info.string = Some(tokens.by_ref().collect::<Vec<_>>().join(" "));
            }
            _ => {}
        }
    }
    info
}

fn decode_option<'a>(tokens: impl Iterator<Item = &'a str>) -> Option<OptionDecl> {
    const KEYS: &[&str] = &["name", "type", "default", "min", "max", "var"];

    let mut fields: Vec<(&str, Vec<&str>)> = Vec::new();
    for tok in tokens {
        if KEYS.contains(&tok) {
            fields.push((tok, Vec::new()));
        } else if let Some((_, value)) = fields.last_mut() {
            value.push(tok);
        }
    }

    let mut decl = OptionDecl::default();
    let mut has_name = false;
    for (key, value) in fields {
        let value = value.join(" ");
        match key {
            "name" => {
                has_name = !value.is_empty();
                decl.name = value;
            }
            "type" => decl.kind = Some(value),
            "default" => decl.default = Some(value),
            "min" => decl.min = value.parse().ok(),
            "max" => decl.max = value.parse().ok(),
            "var" => decl.vars.push(value),
            _ => {}
        }
    }
    has_name.then_some(decl)
}
