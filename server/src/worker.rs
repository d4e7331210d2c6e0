//! One worker: an OS thread that owns its own `tokio` runtime and plays
//! as many matches concurrently as the ready queue hands it (§4.5).
//!
//! Each worker is identified by a `pid` (pool index, not an OS process
//! id). A [`crate::task::Task`] popped off the shared ready queue that
//! doesn't belong to this worker (§4.5 point 2 — a defensive check
//! against a future dispatcher bug, not something that should happen
//! today) is pushed back onto the completion channel unaltered rather
//! than dropped, since [`crate::task::Task`] and [`crate::task::Completion`]
//! share the same `gid`/`pid`/`black`/`white` shape.

use crate::driver;
use crate::task::{Completion, Task};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::time::Duration;
use tokio::task::JoinSet;

const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Runs on its own OS thread for the lifetime of the process. Returns
/// once the ready queue is disconnected (master shutdown) and every
/// in-flight match has finished.
pub fn run_worker(pid: usize, ready_rx: Receiver<Task>, finished_tx: Sender<Completion>) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name(format!("worker-{pid}"))
        .build()
        .expect("worker runtime builds");

    runtime.block_on(worker_main(pid, ready_rx, finished_tx));
}

async fn worker_main(pid: usize, ready_rx: Receiver<Task>, finished_tx: Sender<Completion>) {
    let mut in_flight: JoinSet<Completion> = JoinSet::new();

    loop {
        while let Some(result) = in_flight.try_join_next() {
            match result {
                Ok(completion) => {
                    if finished_tx.send(completion).is_err() {
                        return;
                    }
                }
                Err(join_err) => {
                    tracing::error!(pid, error = %join_err, "match task panicked");
                }
            }
        }

        let ready_rx = ready_rx.clone();
        let popped = tokio::task::spawn_blocking(move || ready_rx.recv_timeout(POLL_TIMEOUT))
            .await
            .expect("blocking recv doesn't panic");

        match popped {
            Ok(task) if task.pid == pid => {
                in_flight.spawn(driver::play_match(task));
            }
            Ok(task) => {
                tracing::warn!(pid, routed_pid = task.pid, gid = task.gid, "misrouted task, forwarding unaltered");
                let completion = Completion { gid: task.gid, pid: task.pid, black: task.black, white: task.white };
                if finished_tx.send(completion).is_err() {
                    return;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                if in_flight.is_empty() {
                    return;
                }
                if let Some(result) = in_flight.join_next().await {
                    if let Ok(completion) = result {
                        if finished_tx.send(completion).is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{ClientLink, Role};
    use crate::task::{ClientInfo, MatchSettings, PlayerHandle};
    use tokio::net::{TcpListener, TcpStream};

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let accept = listener.accept();
        let (client, (server, _)) = tokio::join!(connect, accept);
        (client.unwrap(), server)
    }

    fn player(fid: u64, name: &str, socket: TcpStream) -> PlayerHandle {
        let mut link = ClientLink::new_detached(fid, socket);
        link.role = Role::Engine;
        link.name = name.to_string();
        PlayerHandle { info: ClientInfo::from_link(&link), link }
    }

    fn settings(dir: &std::path::Path) -> MatchSettings {
        MatchSettings {
            board_size: 9,
            komi: 7.5,
            main_time_seconds: 300,
            rule: "chinese-like".to_string(),
            resume_record_path: None,
            store_directory: dir.to_path_buf(),
        }
    }

    /// A task dispatched to the wrong worker (§4.5 point 2) must come back
    /// on the completion channel unaltered, not be played locally.
    #[tokio::test]
    async fn misrouted_task_is_forwarded_unaltered_without_being_played() {
        let (black_sock, _black_peer) = loopback_pair().await;
        let (white_sock, _white_peer) = loopback_pair().await;
        let dir = std::env::temp_dir().join("goplay-worker-test-misroute");

        let (ready_tx, ready_rx) = crossbeam_channel::unbounded();
        let (finished_tx, finished_rx) = crossbeam_channel::unbounded();

        let task = Task {
            gid: 11,
            pid: 1,
            black: player(1, "black", black_sock),
            white: player(2, "white", white_sock),
            settings: settings(&dir),
        };
        ready_tx.send(task).unwrap();
        drop(ready_tx);

        let handle = tokio::spawn(worker_main(0, ready_rx, finished_tx));
        let completion = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(c) = finished_rx.try_recv() {
                    return c;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("completion forwarded before timeout");

        assert_eq!(completion.gid, 11);
        assert_eq!(completion.pid, 1);
        handle.abort();
    }

    /// A task routed to the right worker is actually played and reaped.
    #[tokio::test]
    async fn correctly_routed_task_is_played_and_reaped() {
        let (black_sock, black_peer) = loopback_pair().await;
        let (white_sock, white_peer) = loopback_pair().await;
        let dir = std::env::temp_dir().join("goplay-worker-test-route");

        async fn pass_once(socket: TcpStream) {
            let mut link = ClientLink::new_detached(0, socket);
            link.attach();
            let _setup = link.recv_line().await.unwrap();
            let _genmove = link.recv_line().await.unwrap();
            link.send_line("pass").await.unwrap();
            if link.recv_line().await.is_ok() {
                let _ = link.send_line("ok").await;
            }
        }
        let black_task = tokio::spawn(pass_once(black_peer));
        let white_task = tokio::spawn(pass_once(white_peer));

        let (ready_tx, ready_rx) = crossbeam_channel::unbounded();
        let (finished_tx, finished_rx) = crossbeam_channel::unbounded();

        let task = Task {
            gid: 12,
            pid: 0,
            black: player(1, "black", black_sock),
            white: player(2, "white", white_sock),
            settings: settings(&dir),
        };
        ready_tx.send(task).unwrap();
        drop(ready_tx);

        let handle = tokio::spawn(worker_main(0, ready_rx, finished_tx));
        let completion = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(c) = finished_rx.try_recv() {
                    return c;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("completion reaped before timeout");

        assert_eq!(completion.gid, 12);
        black_task.await.unwrap();
        white_task.await.unwrap();
        handle.abort();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
