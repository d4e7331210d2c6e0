//! The master loop (§4.6): accepts connections, handshakes them off the
//! hot path, talks to the manager, drains operator/manager commands, and
//! reaps finished matches. Runs as a single task on the main executor;
//! the actual game play happens on the worker pool (§4.5).

use crate::command;
use crate::config::Config;
use crate::link::{ClientLink, LinkError, perform_handshake};
use crate::registry::{Registry, RegistryError};
use crate::task::{MatchSettings, PlayerHandle, Task};
use crossbeam_channel::{Receiver as WorkerRx, Sender as WorkerTx};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// One pass through the master loop, per the Design Notes' cadence.
const PASS_INTERVAL: Duration = Duration::from_millis(200);

/// A client that finished the handshake exchange, handed from the
/// background handshake task to the master loop. `crashed` is set for a
/// manager whose password mismatched (§4.6, §9): the spec has the bad
/// password latch a crash but still register the client briefly, with
/// hygiene closing it on the next pass, rather than dropping the socket
/// mid-handshake.
struct HandshakenClient {
    link: ClientLink,
    crashed: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no idle worker available")]
    NoWorkerAvailable,
    #[error("client {0} is not waiting")]
    ClientNotWaiting(u64),
    #[error("worker pool channel closed")]
    WorkerChannelClosed,
}

/// Server-wide mutable state the master loop and command handlers share.
pub struct Master {
    pub(crate) listener: TcpListener,
    pub(crate) config: Config,
    pub(crate) registry: Registry,
    pub(crate) ready_txs: Vec<WorkerTx<Task>>,
    pub(crate) finished_rx: WorkerRx<crate::task::Completion>,
    pub(crate) worker_loads: Vec<usize>,
    /// `gid -> pid` for every match currently in flight (`show game`, §6;
    /// its size must always equal the sum of `worker_loads`, §8).
    pub(crate) live_games: HashMap<u64, usize>,
    pub(crate) next_fid: u64,
    pub(crate) next_gid: u64,
    pub(crate) command_queue: VecDeque<String>,
    pub(crate) accepted_rx: mpsc::UnboundedReceiver<HandshakenClient>,
    accepted_tx: mpsc::UnboundedSender<HandshakenClient>,
    stdin_rx: mpsc::UnboundedReceiver<String>,
    pub(crate) shutting_down: bool,
}

impl Master {
    pub fn new(
        listener: TcpListener,
        config: Config,
        ready_txs: Vec<WorkerTx<Task>>,
        finished_rx: WorkerRx<crate::task::Completion>,
    ) -> Master {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        spawn_stdin_reader(stdin_tx);
        let worker_count = ready_txs.len();
        Master {
            listener,
            config,
            registry: Registry::new(),
            ready_txs,
            finished_rx,
            worker_loads: vec![0; worker_count],
            live_games: HashMap::new(),
            next_fid: 1,
            next_gid: 1,
            command_queue: VecDeque::new(),
            accepted_rx,
            accepted_tx,
            stdin_rx,
            shutting_down: false,
        }
    }

    /// Runs until a `quit` command is processed.
    pub async fn run(&mut self) {
        while !self.shutting_down {
            self.accept_new_connections();
            self.drain_handshaken_clients();
            self.sweep_crashed_clients();
            self.probe_one_waiting_engine().await;
            self.manager_intake().await;
            self.drain_stdin();
            self.execute_queued_commands().await;
            // `quit` schedules every client for removal and then flips
            // `shutting_down`, so the pass that processes it is also the
            // last one `while !self.shutting_down` will ever run — sweep
            // again here rather than relying on a next pass that never
            // comes.
            self.sweep_crashed_clients();
            self.drain_completions();
            tokio::time::sleep(PASS_INTERVAL).await;
        }
    }

    /// Drains every connection already sitting in the listen backlog,
    /// handing each off to a background handshake task, then returns —
    /// a zero-duration timeout turns `accept()` into a non-blocking poll
    /// so one slow-to-connect client can never stall a master pass.
    async fn accept_new_connections(&mut self) {
        loop {
            match tokio::time::timeout(Duration::ZERO, self.listener.accept()).await {
                Ok(Ok((socket, _addr))) => {
                    let fid = self.next_fid;
                    self.next_fid += 1;
                    let tx = self.accepted_tx.clone();
                    let manager_password = self.config.manager_password.clone();
                    tokio::spawn(async move {
                        let mut link = ClientLink::new_detached(fid, socket);
                        link.attach();
                        match perform_handshake(&mut link, &manager_password).await {
                            Ok(()) => {
                                let _ = tx.send(HandshakenClient { link, crashed: false });
                            }
                            Err(LinkError::BadPassword) => {
                                tracing::warn!(fid, "manager password mismatch, registering crashed for next hygiene sweep");
                                let _ = tx.send(HandshakenClient { link, crashed: true });
                            }
                            Err(e) => tracing::warn!(fid, error = %e, "client handshake failed"),
                        }
                    });
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "accept failed");
                    break;
                }
                Err(_timed_out) => break,
            }
        }
    }

    fn drain_handshaken_clients(&mut self) {
        while let Ok(handshaken) = self.accepted_rx.try_recv() {
            let HandshakenClient { link, crashed } = handshaken;
            let fid = link.fid;
            let role = link.role;
            match self.registry.insert_waiting(link) {
                Ok(_) => {
                    tracing::info!(fid, ?role, "client registered");
                    if crashed {
                        self.registry.mark_crashed(fid);
                    }
                }
                Err(RegistryError::ManagerAlreadyConnected) => {
                    tracing::warn!(fid, "rejecting second manager connection");
                }
            }
        }
    }

    fn sweep_crashed_clients(&mut self) {
        for fid in self.registry.fids_due_for_removal() {
            if self.registry.manager_fid() == Some(fid) {
                tracing::info!(fid, "removed manager client");
            }
            self.registry.remove(fid);
            tracing::info!(fid, "removed client");
        }
    }

    /// Proactively detects a dead waiting engine between matches, rather
    /// than only discovering it when the next dispatch tries to use it.
    /// §4.6: the probed engine is chosen uniformly at random each pass.
    async fn probe_one_waiting_engine(&mut self) {
        let waiting = self.registry.waiting_engine_fids();
        if waiting.is_empty() {
            return;
        }
        let fid = waiting[rand::thread_rng().gen_range(0..waiting.len())];

        let Some(entry) = self.registry.get_mut(fid) else { return };
        let Some(link) = entry.link.as_mut() else { return };
        link.attach();
        if link.request(protocol::line_username()).await.is_err() {
            self.registry.mark_crashed(fid);
        }
    }

    async fn manager_intake(&mut self) {
        let Some(manager_fid) = self.registry.manager_fid() else { return };
        let reply = {
            let Some(entry) = self.registry.get_mut(manager_fid) else { return };
            let Some(link) = entry.link.as_mut() else { return };
            link.attach();
            link.request(protocol::line_queries()).await
        };
        let query = match reply {
            Ok(line) => protocol::ManagerQuery::parse(&line),
            Err(e) => {
                tracing::warn!(fid = manager_fid, error = %e, "manager query exchange failed");
                self.registry.mark_crashed(manager_fid);
                return;
            }
        };

        if let Some(cmd) = query.command {
            self.command_queue.push_back(cmd);
        }
        if query.client_status.is_some() {
            let status_json = protocol::encode_status(&self.registry.status_snapshot());
            let sent = {
                let Some(entry) = self.registry.get_mut(manager_fid) else { return };
                let Some(link) = entry.link.as_mut() else { return };
                link.send_line(&protocol::line_status(&status_json)).await
            };
            if sent.is_err() {
                self.registry.mark_crashed(manager_fid);
            }
        }
    }

    fn drain_stdin(&mut self) {
        while let Ok(line) = self.stdin_rx.try_recv() {
            self.command_queue.push_back(line);
        }
    }

    async fn execute_queued_commands(&mut self) {
        while let Some(cmd) = self.command_queue.pop_front() {
            command::execute(self, &cmd).await;
        }
    }

    fn drain_completions(&mut self) {
        while let Ok(completion) = self.finished_rx.try_recv() {
            if let Some(load) = self.worker_loads.get_mut(completion.pid) {
                *load = load.saturating_sub(1);
            }
            // Indexed by the completion's own gid, never a stale outer
            // variable — see the Open Questions in SPEC_FULL.md.
            self.live_games.remove(&completion.gid);
            self.registry.return_from_match(PlayerHandle { info: completion.black.info, link: completion.black.link });
            self.registry.return_from_match(PlayerHandle { info: completion.white.info, link: completion.white.link });
            tracing::info!(gid = completion.gid, "match completion recorded");
        }
    }

    /// Dispatches a match between two currently-waiting engines onto the
    /// least-loaded worker (§4.5, the fixed minimum-load selection — the
    /// source's comparison never updates its running minimum past the
    /// first candidate; this picks the true minimum).
    pub fn dispatch(&mut self, black_fid: u64, white_fid: u64, overrides: MatchOverrides) -> Result<u64, DispatchError> {
        if self.ready_txs.is_empty() {
            return Err(DispatchError::NoWorkerAvailable);
        }
        let pid = self
            .worker_loads
            .iter()
            .enumerate()
            .min_by_key(|(_, load)| **load)
            .map(|(pid, _)| pid)
            .ok_or(DispatchError::NoWorkerAvailable)?;

        let gid = self.next_gid;

        let black = self.registry.take_for_match(black_fid, gid, pid).ok_or(DispatchError::ClientNotWaiting(black_fid))?;
        let white = match self.registry.take_for_match(white_fid, gid, pid) {
            Some(handle) => handle,
            None => {
                self.registry.return_from_match(black);
                return Err(DispatchError::ClientNotWaiting(white_fid));
            }
        };

        let settings = overrides.into_settings(&self.config);
        let task = Task { gid, pid, black, white, settings };

        if self.ready_txs[pid].send(task).is_err() {
            // Can't happen once the worker pool is up, but don't strand
            // the players' links if it ever does.
            if let Some(entry) = self.registry.get_mut(black_fid) {
                if entry.link.is_none() {
                    tracing::error!(gid, "worker channel closed mid-dispatch; players are stranded");
                }
            }
            return Err(DispatchError::WorkerChannelClosed);
        }

        self.worker_loads[pid] += 1;
        self.live_games.insert(gid, pid);
        self.next_gid += 1;
        Ok(gid)
    }
}

/// Per-invocation overrides for a `match` command (§6), defaulted from
/// [`Config`] when absent.
#[derive(Clone, Debug, Default)]
pub struct MatchOverrides {
    pub board_size: Option<usize>,
    pub komi: Option<f64>,
    pub main_time_seconds: Option<u64>,
    pub rule: Option<String>,
    pub resume_record_path: Option<PathBuf>,
    pub store_dir: Option<PathBuf>,
}

impl MatchOverrides {
    fn into_settings(self, config: &Config) -> MatchSettings {
        let store_dir = self.store_dir.unwrap_or_else(|| config.store_dir.clone());
        MatchSettings {
            board_size: self.board_size.unwrap_or(config.board_size),
            komi: self.komi.unwrap_or(config.komi),
            main_time_seconds: self.main_time_seconds.unwrap_or(config.main_time_seconds),
            rule: self.rule.unwrap_or_else(|| "chinese-like".to_string()),
            resume_record_path: self.resume_record_path,
            store_directory: config.record_root.join(store_dir),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{ClientLink, Role};
    use crate::registry::PlayState;
    use crate::task::{ClientInfo, Completion, PlayerHandle};
    use std::path::PathBuf;
    use tokio::net::TcpStream;

    fn test_config() -> Config {
        Config {
            port: 0,
            manager_password: String::new(),
            workers: Some(2),
            board_size: 9,
            komi: 7.5,
            main_time_seconds: 300,
            store_dir: PathBuf::from("store"),
            record_root: PathBuf::from("."),
        }
    }

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let accept = listener.accept();
        let (client, (server, _)) = tokio::join!(connect, accept);
        (client.unwrap(), server)
    }

    async fn register_waiting_engine(master: &mut Master, fid: u64, name: &str) {
        let (_peer, socket) = loopback_pair().await;
        let mut link = ClientLink::new_detached(fid, socket);
        link.role = Role::Engine;
        link.name = name.to_string();
        master.registry.insert_waiting(link).unwrap();
    }

    /// §8: `sum over workers of load == number of tasks in live game table`,
    /// both right after dispatch and after the match's completion is drained.
    #[tokio::test]
    async fn dispatch_and_completion_preserve_load_invariant() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (ready_tx_a, _ready_rx_a) = crossbeam_channel::unbounded();
        let (ready_tx_b, _ready_rx_b) = crossbeam_channel::unbounded();
        let (finished_tx, finished_rx) = crossbeam_channel::unbounded();
        let mut master = Master::new(listener, test_config(), vec![ready_tx_a, ready_tx_b], finished_rx);

        register_waiting_engine(&mut master, 1, "alice").await;
        register_waiting_engine(&mut master, 2, "bob").await;

        let gid = master.dispatch(1, 2, MatchOverrides::default()).unwrap();
        let total_load: usize = master.worker_loads.iter().sum();
        assert_eq!(total_load, master.live_games.len());
        assert_eq!(total_load, 1);
        assert!(matches!(master.registry.get(1).unwrap().state, PlayState::Playing { gid: g, .. } if g == gid));

        // No waiting client may be `playing` at the same time — the waiting
        // set `match random` draws from must exclude it.
        assert!(master.registry.waiting_engine_fids().is_empty());

        let black_link = ClientLink::new_detached(1, TcpStream::connect(master.listener.local_addr().unwrap()).await.unwrap());
        let white_link = ClientLink::new_detached(2, TcpStream::connect(master.listener.local_addr().unwrap()).await.unwrap());
        let completion = Completion {
            gid,
            pid: master.live_games[&gid],
            black: PlayerHandle { info: ClientInfo { fid: 1, name: "alice".to_string(), role: Role::Engine, supports_analysis: false }, link: black_link },
            white: PlayerHandle { info: ClientInfo { fid: 2, name: "bob".to_string(), role: Role::Engine, supports_analysis: false }, link: white_link },
        };
        finished_tx.send(completion).unwrap();
        master.drain_completions();

        let total_load: usize = master.worker_loads.iter().sum();
        assert_eq!(total_load, master.live_games.len());
        assert_eq!(total_load, 0);
        assert_eq!(master.registry.get(1).unwrap().state, PlayState::Waiting);
        assert_eq!(master.registry.get(2).unwrap().state, PlayState::Waiting);
        assert_eq!(master.registry.waiting_engine_fids().len(), 2);
    }

    /// `quit` must actually remove every client from the registry in the
    /// same pass it's processed, since `Master::run`'s loop never gets a
    /// further pass once `shutting_down` flips — it can't rely on the
    /// next hygiene sweep to do the work.
    #[tokio::test]
    async fn quit_removes_every_client_in_the_same_pass() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (ready_tx, _ready_rx) = crossbeam_channel::unbounded();
        let (_finished_tx, finished_rx) = crossbeam_channel::unbounded();
        let mut master = Master::new(listener, test_config(), vec![ready_tx], finished_rx);

        register_waiting_engine(&mut master, 1, "alice").await;
        register_waiting_engine(&mut master, 2, "bob").await;

        master.command_queue.push_back("quit".to_string());
        master.execute_queued_commands().await;
        assert!(master.shutting_down);
        // Mirrors the extra sweep `Master::run` performs right after
        // `execute_queued_commands`, in the very same pass `quit` runs in.
        master.sweep_crashed_clients();

        assert!(master.registry.get(1).is_none());
        assert!(master.registry.get(2).is_none());
        assert!(master.registry.fids().is_empty());
    }

    /// A second manager handshake must not displace the incumbent.
    #[tokio::test]
    async fn second_manager_handshake_does_not_displace_incumbent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (ready_tx, _ready_rx) = crossbeam_channel::unbounded();
        let (_finished_tx, finished_rx) = crossbeam_channel::unbounded();
        let mut master = Master::new(listener, test_config(), vec![ready_tx], finished_rx);

        let (_peer_a, socket_a) = loopback_pair().await;
        let mut manager_a = ClientLink::new_detached(10, socket_a);
        manager_a.role = Role::Manager;
        manager_a.name = "ops".to_string();
        master.registry.insert_waiting(manager_a).unwrap();

        let (_peer_b, socket_b) = loopback_pair().await;
        let mut manager_b = ClientLink::new_detached(11, socket_b);
        manager_b.role = Role::Manager;
        manager_b.name = "intruder".to_string();
        assert!(master.registry.insert_waiting(manager_b).is_err());

        assert_eq!(master.registry.manager_fid(), Some(10));
    }
}

fn spawn_stdin_reader(tx: mpsc::UnboundedSender<String>) {
    std::thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || {
            use std::io::BufRead;
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(text) => {
                        if tx.send(text).is_err() {
                            return;
                        }
                    }
                    Err(_) => return,
                }
            }
        })
        .expect("stdin reader thread spawns");
}

