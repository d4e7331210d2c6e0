//! The master's client table (§4.6): every attached client, waiting or
//! mid-match, keyed by `fid`. A client's [`ClientLink`] lives here while
//! it's `Waiting` and moves out onto a [`crate::task::Task`] while it's
//! `Playing` — the registry only ever holds a link for a client that
//! isn't currently owned by a worker.

use crate::link::{ClientLink, Role};
use crate::task::{ClientInfo, PlayerHandle};
use protocol::{ClientStatusEntry, ServerStatus};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("a manager client is already connected")]
    ManagerAlreadyConnected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayState {
    Waiting,
    Playing { gid: u64, pid: usize },
}

/// One registered client. `link` is `Some` exactly while `state` is
/// `Waiting`; dispatch takes it, completion gives it back.
pub struct ClientEntry {
    pub info: ClientInfo,
    pub state: PlayState,
    pub crashed: bool,
    pub link: Option<ClientLink>,
}

#[derive(Default)]
pub struct Registry {
    clients: HashMap<u64, ClientEntry>,
    manager_fid: Option<u64>,
    scheduled_for_removal: std::collections::HashSet<u64>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Registers a freshly handshaken client as `Waiting`. Rejects a
    /// second simultaneous manager (§4.6, Design Notes).
    pub fn insert_waiting(&mut self, link: ClientLink) -> Result<u64, RegistryError> {
        if link.role == Role::Manager && self.manager_fid.is_some() {
            return Err(RegistryError::ManagerAlreadyConnected);
        }
        let info = ClientInfo::from_link(&link);
        let fid = info.fid;
        if link.role == Role::Manager {
            self.manager_fid = Some(fid);
        }
        self.clients.insert(
            fid,
            ClientEntry { info, state: PlayState::Waiting, crashed: false, link: Some(link) },
        );
        Ok(fid)
    }

    pub fn remove(&mut self, fid: u64) -> Option<ClientEntry> {
        if self.manager_fid == Some(fid) {
            self.manager_fid = None;
        }
        self.scheduled_for_removal.remove(&fid);
        self.clients.remove(&fid)
    }

    pub fn get(&self, fid: u64) -> Option<&ClientEntry> {
        self.clients.get(&fid)
    }

    pub fn get_mut(&mut self, fid: u64) -> Option<&mut ClientEntry> {
        self.clients.get_mut(&fid)
    }

    pub fn manager_fid(&self) -> Option<u64> {
        self.manager_fid
    }

    pub fn fids(&self) -> Vec<u64> {
        self.clients.keys().copied().collect()
    }

    /// Every registered client, for the `show client` operator command.
    pub fn entries(&self) -> impl Iterator<Item = (&u64, &ClientEntry)> {
        self.clients.iter()
    }

    /// Engines sitting idle, eligible for dispatch into a new match.
    pub fn waiting_engine_fids(&self) -> Vec<u64> {
        self.clients
            .iter()
            .filter(|(_, e)| !e.crashed && e.info.role == Role::Engine && e.state == PlayState::Waiting)
            .map(|(fid, _)| *fid)
            .collect()
    }

    pub fn crashed_fids(&self) -> Vec<u64> {
        self.clients.iter().filter(|(_, e)| e.crashed).map(|(fid, _)| *fid).collect()
    }

    pub fn mark_crashed(&mut self, fid: u64) {
        if let Some(entry) = self.clients.get_mut(&fid) {
            entry.crashed = true;
        }
    }

    /// Schedules `fid` for removal on the next hygiene pass (the `close`
    /// operator command, §6) without latching it `crashed` — a distinct
    /// reason for the same sweep action.
    pub fn schedule_removal(&mut self, fid: u64) {
        self.scheduled_for_removal.insert(fid);
    }

    /// Every fid the next hygiene sweep should close: latched-crashed
    /// clients and clients explicitly scheduled via `close`.
    pub fn fids_due_for_removal(&self) -> Vec<u64> {
        let mut fids: Vec<u64> = self
            .clients
            .iter()
            .filter(|(fid, e)| e.crashed || self.scheduled_for_removal.contains(fid))
            .map(|(fid, _)| *fid)
            .collect();
        fids.sort_unstable();
        fids.dedup();
        fids
    }

    /// Pulls a waiting client's link out for dispatch, marking it
    /// `Playing`. Returns `None` if the client is absent or already
    /// mid-match (the dispatcher should skip it).
    pub fn take_for_match(&mut self, fid: u64, gid: u64, pid: usize) -> Option<PlayerHandle> {
        let entry = self.clients.get_mut(&fid)?;
        let mut link = entry.link.take()?;
        // Detach before the link crosses onto the worker's ready queue —
        // only the raw socket, not the buffered half, crosses an executor
        // boundary (§5, Design Notes).
        link.detach();
        entry.state = PlayState::Playing { gid, pid };
        Some(PlayerHandle { info: entry.info.clone(), link })
    }

    /// Hands a client's link back after its match ends, returning it to
    /// `Waiting`. A client removed mid-match (disconnected deliberately)
    /// is simply dropped.
    pub fn return_from_match(&mut self, handle: PlayerHandle) {
        if let Some(entry) = self.clients.get_mut(&handle.info.fid) {
            entry.link = Some(handle.link);
            entry.state = PlayState::Waiting;
        }
    }

    /// Builds the manager-facing status snapshot (§4.6, §7).
    pub fn status_snapshot(&self) -> ServerStatus {
        let mut status = ServerStatus::new();
        for (fid, entry) in &self.clients {
            let kind = match entry.info.role {
                Role::Engine => "engine",
                Role::Manager => "manager",
            };
            let (status_text, gid) = match (entry.crashed, entry.state) {
                (true, _) => ("crashed".to_string(), None),
                (false, PlayState::Waiting) => ("waiting".to_string(), None),
                (false, PlayState::Playing { gid, .. }) => ("playing".to_string(), Some(gid)),
            };
            status.insert(
                fid.to_string(),
                ClientStatusEntry { name: entry.info.name.clone(), kind: kind.to_string(), status: status_text, gid },
            );
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let accept = listener.accept();
        let (client, (server, _)) = tokio::join!(connect, accept);
        (client.unwrap(), server)
    }

    fn engine_link(fid: u64, socket: TcpStream, name: &str) -> ClientLink {
        let mut link = ClientLink::new_detached(fid, socket);
        link.role = Role::Engine;
        link.name = name.to_string();
        link
    }

    #[tokio::test]
    async fn dispatch_removes_link_and_marks_playing() {
        let (a, _b) = socket_pair().await;
        let mut registry = Registry::new();
        let fid = registry.insert_waiting(engine_link(1, a, "gnugo")).unwrap();

        assert_eq!(registry.waiting_engine_fids(), vec![fid]);
        let handle = registry.take_for_match(fid, 7, 0).unwrap();
        assert_eq!(handle.info.name, "gnugo");
        assert!(registry.waiting_engine_fids().is_empty());
        assert_eq!(registry.get(fid).unwrap().state, PlayState::Playing { gid: 7, pid: 0 });

        registry.return_from_match(handle);
        assert_eq!(registry.waiting_engine_fids(), vec![fid]);
    }

    #[tokio::test]
    async fn second_manager_is_rejected() {
        let (a, _b) = socket_pair().await;
        let (c, _d) = socket_pair().await;
        let mut registry = Registry::new();

        let mut manager_a = ClientLink::new_detached(1, a);
        manager_a.role = Role::Manager;
        manager_a.name = "ops".to_string();
        registry.insert_waiting(manager_a).unwrap();

        let mut manager_b = ClientLink::new_detached(2, c);
        manager_b.role = Role::Manager;
        manager_b.name = "ops2".to_string();
        assert!(matches!(registry.insert_waiting(manager_b), Err(RegistryError::ManagerAlreadyConnected)));
    }

    #[tokio::test]
    async fn crashed_client_is_excluded_from_dispatch_and_listed_for_hygiene() {
        let (a, _b) = socket_pair().await;
        let mut registry = Registry::new();
        let fid = registry.insert_waiting(engine_link(1, a, "flaky")).unwrap();
        registry.mark_crashed(fid);
        assert!(registry.waiting_engine_fids().is_empty());
        assert_eq!(registry.crashed_fids(), vec![fid]);
    }
}
