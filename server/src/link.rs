//! A client link owns one TCP connection and exposes line-oriented
//! request/response exchanges (§4.3).
//!
//! The connection's buffered half is only materialized while a party
//! (master or worker) is actively exchanging lines with the client —
//! [`ConnState`] models this as a sum type with an attach/detach
//! transition, per the Design Notes: a [`ConnState::Detached`] socket is
//! what crosses the master/worker boundary on the ready and completion
//! channels; [`ConnState::Attached`] is what a single owner reads/writes
//! through.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Engine,
    Manager,
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("client closed the connection")]
    Closed,
    #[error("link is not attached for a line exchange")]
    NotAttached,
    #[error("handshake reply was neither `e1` nor `m1`")]
    BadVersion,
    #[error("manager password mismatch")]
    BadPassword,
}

enum ConnState {
    Detached(TcpStream),
    Attached {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    },
}

/// One client's connection plus its handshake-derived identity.
pub struct ClientLink {
    pub fid: u64,
    pub name: String,
    pub role: Role,
    pub supports_analysis: bool,
    state: Option<ConnState>,
}

impl ClientLink {
    /// Wraps a freshly accepted socket. Role/name/analysis are filled in
    /// by [`perform_handshake`].
    pub fn new_detached(fid: u64, socket: TcpStream) -> ClientLink {
        ClientLink {
            fid,
            name: String::new(),
            role: Role::Engine,
            supports_analysis: false,
            state: Some(ConnState::Detached(socket)),
        }
    }

    /// Splits the socket and wraps the read half in a line buffer.
    /// A no-op if already attached.
    pub fn attach(&mut self) {
        let state = self.state.take().expect("link state always present");
        self.state = Some(match state {
            ConnState::Detached(socket) => {
                let (read_half, write_half) = socket.into_split();
                ConnState::Attached { reader: BufReader::new(read_half), writer: write_half }
            }
            attached => attached,
        });
    }

    /// Reunites the split halves back into a plain socket so it can cross
    /// to another executor. A no-op if already detached.
    ///
    /// Any bytes still sitting in the read buffer beyond the last
    /// consumed line are dropped — `BufReader::into_inner` discards them.
    /// That's fine here because the protocol is strict request/response:
    /// a link is only ever detached between exchanges, never mid-line.
    pub fn detach(&mut self) {
        let state = self.state.take().expect("link state always present");
        self.state = Some(match state {
            ConnState::Attached { reader, writer } => {
                let read_half = reader.into_inner();
                let socket = read_half
                    .reunite(writer)
                    .expect("read/write halves came from the same split");
                ConnState::Detached(socket)
            }
            detached => detached,
        });
    }

    fn halves(&mut self) -> Result<(&mut BufReader<OwnedReadHalf>, &mut OwnedWriteHalf), LinkError> {
        match self.state.as_mut().expect("link state always present") {
            ConnState::Attached { reader, writer } => Ok((reader, writer)),
            ConnState::Detached(_) => Err(LinkError::NotAttached),
        }
    }

    /// Sends a one-way line. Any I/O failure latches nothing by itself —
    /// the caller marks the client crashed.
    pub async fn send_line(&mut self, line: &str) -> Result<(), LinkError> {
        let (_, writer) = self.halves()?;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    /// Reads one line, stripped of its trailing newline. An empty read
    /// (EOF) is reported as [`LinkError::Closed`].
    pub async fn recv_line(&mut self) -> Result<String, LinkError> {
        let (reader, _) = self.halves()?;
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(LinkError::Closed);
        }
        while matches!(line.chars().last(), Some('\n') | Some('\r')) {
            line.pop();
        }
        Ok(line)
    }

    /// Sends a line and awaits the one-line reply.
    pub async fn request(&mut self, line: &str) -> Result<String, LinkError> {
        self.send_line(line).await?;
        self.recv_line().await
    }
}

/// Runs the three-step handshake (§4.3) against an attached link. On
/// success, fills in `role`/`name`/`supports_analysis`. On a manager
/// password mismatch, still fills in what was learned before returning
/// `Err(LinkError::BadPassword)` — the caller latches `crashed`; hygiene
/// closes the socket on the next master pass.
pub async fn perform_handshake(link: &mut ClientLink, manager_password: &str) -> Result<(), LinkError> {
    let reply = link.request(protocol::HANDSHAKE_PROTOCOL_GREETING).await?;
    let mut tokens = reply.split_whitespace();
    let role = match tokens.next() {
        Some(protocol::ENGINE_VERSION_TOKEN) => Role::Engine,
        Some(protocol::MANAGER_VERSION_TOKEN) => Role::Manager,
        _ => return Err(LinkError::BadVersion),
    };
    let supports_analysis =
        role == Role::Engine && reply.split_whitespace().any(|t| t == protocol::ANALYSIS_CAPABILITY_TOKEN);

    let name = link.request(protocol::line_username()).await?.trim().to_string();
    let password = link.request(protocol::line_password()).await?;

    link.role = role;
    link.name = name;
    link.supports_analysis = supports_analysis;

    if role == Role::Manager && password.trim() != manager_password {
        return Err(LinkError::BadPassword);
    }
    Ok(())
}
