//! Command-line / environment configuration. Loading a config *file* is
//! out of scope (§1); every tunable named in §6 is a flag with a matching
//! env var, following `clap`'s `derive` + `env` idiom.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "goplay-server", about = "Match-play server for Go-like engines")]
pub struct Config {
    /// TCP port to listen on.
    #[arg(long, env = "GOPLAY_PORT", default_value_t = protocol::DEFAULT_PORT)]
    pub port: u16,

    /// Password the manager client must present at handshake.
    #[arg(long, env = "GOPLAY_MANAGER_PASSWORD", default_value = "")]
    pub manager_password: String,

    /// Number of worker executors. Defaults to logical CPU count, minimum 1.
    #[arg(long, env = "GOPLAY_WORKERS")]
    pub workers: Option<usize>,

    /// Default board size for a match that doesn't specify one.
    #[arg(long, env = "GOPLAY_BOARD_SIZE", default_value_t = 19)]
    pub board_size: usize,

    /// Default komi.
    #[arg(long, env = "GOPLAY_KOMI", default_value_t = 7.5)]
    pub komi: f64,

    /// Default main time, in seconds, per player.
    #[arg(long, env = "GOPLAY_MAIN_TIME_SECONDS", default_value_t = 300)]
    pub main_time_seconds: u64,

    /// Default directory a match's record is written into.
    #[arg(long, env = "GOPLAY_STORE_DIR", default_value = "store")]
    pub store_dir: PathBuf,

    /// Root directory under which per-match store directories are resolved.
    #[arg(long, env = "GOPLAY_RECORD_ROOT", default_value = ".")]
    pub record_root: PathBuf,
}

impl Config {
    /// Resolves `workers` against the host's logical CPU count, minimum 1.
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }).max(1)
    }
}
