//! Wire-level constants and line-format helpers for the match server's
//! line-oriented, UTF-8, newline-terminated client protocol (§4.3), plus
//! the JSON shapes exchanged with the manager client.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default listening port.
pub const DEFAULT_PORT: u16 = 1919;
/// Listen backlog, per §6.
pub const LISTEN_BACKLOG: u32 = 10;

/// The fixed handshake greeting, sent verbatim before the client's role
/// is known. Preserved byte-for-byte — see the Open Questions.
pub const HANDSHAKE_PROTOCOL_GREETING: &str = "protocol genmove_analyze";
/// Token identifying an engine client in the handshake reply.
pub const ENGINE_VERSION_TOKEN: &str = "e1";
/// Token identifying a manager client in the handshake reply.
pub const MANAGER_VERSION_TOKEN: &str = "m1";
/// Token that, if present among the handshake reply's tokens, marks an
/// engine as analysis-capable.
pub const ANALYSIS_CAPABILITY_TOKEN: &str = "genmove_analyze";

/// Which side of the board a move belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayColor {
    Black,
    White,
}

impl PlayColor {
    /// Lowercase wire letter, as the protocol's `<color>` fields expect.
    pub fn letter(self) -> char {
        match self {
            PlayColor::Black => 'b',
            PlayColor::White => 'w',
        }
    }

    pub fn opposite(self) -> PlayColor {
        match self {
            PlayColor::Black => PlayColor::White,
            PlayColor::White => PlayColor::Black,
        }
    }
}

/// `username` request line.
pub fn line_username() -> &'static str {
    "username"
}

/// `password` request line.
pub fn line_password() -> &'static str {
    "password"
}

/// `info <text>` one-way line.
pub fn line_info(text: &str) -> String {
    format!("info {text}")
}

/// `setup <gid> <size> <komi> <main_time_ms> <nameA> <nameB>` one-way line.
pub fn line_setup(
    gid: u64,
    board_size: usize,
    komi: f64,
    main_time_ms: u64,
    black_name: &str,
    white_name: &str,
) -> String {
    format!("setup {gid} {board_size} {komi} {main_time_ms} {black_name} {white_name}")
}

/// `play <color> <move> <time_left_ms>` one-way line.
pub fn line_play(color: PlayColor, move_text: &str, opponent_time_left_ms: i64) -> String {
    format!("play {} {move_text} {opponent_time_left_ms}", color.letter())
}

/// `genmove <color> <time_left_ms>` request line.
pub fn line_genmove(color: PlayColor, time_left_ms: i64) -> String {
    format!("genmove {} {time_left_ms}", color.letter())
}

/// `gameover <date> <result> <err>` request line.
pub fn line_gameover(date: &str, result: &str, err: &str) -> String {
    format!("gameover {date} {result} {err}")
}

/// `queries` request line, sent to the manager each master pass.
pub fn line_queries() -> &'static str {
    "queries"
}

/// `status <json>` one-way line, pushed to the manager.
pub fn line_status(status_json: &str) -> String {
    format!("status {status_json}")
}

/// The manager's `queries` response, parsed server-side. An empty query
/// set is sent by the manager as the literal empty string, not `"{}"` —
/// [`ManagerQuery::parse`] treats both the same way.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ManagerQuery {
    /// Present (any value) iff the manager is requesting a status snapshot.
    #[serde(default)]
    pub client_status: Option<serde_json::Value>,
    /// A command string to append to the server's command queue.
    #[serde(default)]
    pub command: Option<String>,
}

impl ManagerQuery {
    /// Parses a `queries` reply line. A blank line, or a line that fails
    /// to parse as a JSON object, yields an empty query (§7:
    /// parse_failure silently drops the data).
    pub fn parse(line: &str) -> ManagerQuery {
        let line = line.trim();
        if line.is_empty() {
            return ManagerQuery::default();
        }
        serde_json::from_str(line).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.client_status.is_none() && self.command.is_none()
    }
}

/// One row of the server status snapshot pushed to the manager.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClientStatusEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    pub gid: Option<u64>,
}

/// `{fid_string -> entry}`, serialized compactly for the `status` line.
pub type ServerStatus = BTreeMap<String, ClientStatusEntry>;

/// Serializes a status snapshot the way the manager expects: compact,
/// no surrounding whitespace.
pub fn encode_status(status: &ServerStatus) -> String {
    serde_json::to_string(status).unwrap_or_else(|_| "{}".to_string())
}
