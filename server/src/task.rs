//! The serializable records that cross the master/worker boundary: a
//! [`Task`] travels master → worker on a per-worker ready queue, a
//! [`Completion`] travels worker → master on the shared completion
//! channel (§5).

use crate::link::{ClientLink, Role};
use std::path::PathBuf;

/// Identity the master keeps resident even while the client's link has
/// moved into a worker for the duration of a match.
#[derive(Clone, Debug)]
pub struct ClientInfo {
    pub fid: u64,
    pub name: String,
    pub role: Role,
    pub supports_analysis: bool,
}

impl ClientInfo {
    pub fn from_link(link: &ClientLink) -> ClientInfo {
        ClientInfo {
            fid: link.fid,
            name: link.name.clone(),
            role: link.role,
            supports_analysis: link.supports_analysis,
        }
    }
}

/// A client as carried on a [`Task`]/[`Completion`]: detached link plus
/// the identity snapshot taken at dispatch time.
pub struct PlayerHandle {
    pub info: ClientInfo,
    pub link: ClientLink,
}

/// Per-match tunables, defaulted from [`crate::config::Config`] and
/// overridable per `match fid` invocation (§6).
#[derive(Clone, Debug)]
pub struct MatchSettings {
    pub board_size: usize,
    pub komi: f64,
    pub main_time_seconds: u64,
    pub rule: String,
    pub resume_record_path: Option<PathBuf>,
    pub store_directory: PathBuf,
}

/// A dispatched match: created by the master, lives in the worker for
/// the game's duration, returned (as a [`Completion`]) on the finished
/// channel.
pub struct Task {
    pub gid: u64,
    pub pid: usize,
    pub black: PlayerHandle,
    pub white: PlayerHandle,
    pub settings: MatchSettings,
}

/// What a worker hands back once a match (or a misrouted task, see
/// §4.5 point 2) is done with it.
pub struct Completion {
    pub gid: u64,
    pub pid: usize,
    pub black: PlayerHandle,
    pub white: PlayerHandle,
}
