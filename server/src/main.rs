//! Binary entry point: parses configuration, binds the listening socket,
//! spins up the worker pool, and runs the master loop (§6) until `quit`.

mod command;
mod config;
mod driver;
mod link;
mod master;
mod registry;
mod task;
mod worker;

use anyhow::Context;
use clap::Parser;
use config::Config;
use master::Master;
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=trace", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .init();

    let config = Config::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("master")
        .build()
        .expect("master runtime builds");

    if let Err(e) = runtime.block_on(run(config)) {
        tracing::error!(error = ?e, "startup failed");
        std::process::exit(1);
    }

    // §6: `quit` exits 1 — it is the only way `run` returns successfully.
    std::process::exit(1);
}

/// Binds the listener, spins up the worker pool, and runs the master
/// loop to completion (i.e. until a `quit` command is processed).
async fn run(config: Config) -> anyhow::Result<()> {
    let listener = bind_listener(config.port).context("failed to bind listening socket")?;
    tracing::info!(port = config.port, "listening");

    let worker_count = config.worker_count();
    let mut ready_txs = Vec::with_capacity(worker_count);
    let (finished_tx, finished_rx) = crossbeam_channel::unbounded();

    for pid in 0..worker_count {
        let (ready_tx, ready_rx) = crossbeam_channel::unbounded();
        ready_txs.push(ready_tx);
        let finished_tx = finished_tx.clone();
        std::thread::Builder::new()
            .name(format!("worker-pool-{pid}"))
            .spawn(move || worker::run_worker(pid, ready_rx, finished_tx))
            .context("failed to spawn worker thread")?;
    }
    // The master never uses its own clone of `finished_tx`; drop it so the
    // channel only closes once every worker thread has exited.
    drop(finished_tx);

    let mut master = Master::new(listener, config, ready_txs, finished_rx);
    master.run().await;
    Ok(())
}

/// Binds on all interfaces with the configured backlog (§6), rather than
/// tokio's default backlog — `socket2` is the standard way to reach the
/// `listen()` backlog parameter tokio's own API doesn't expose.
fn bind_listener(port: u16) -> anyhow::Result<tokio::net::TcpListener> {
    use socket2::{Domain, Socket, Type};

    let addr: SocketAddr = (std::net::Ipv4Addr::UNSPECIFIED, port).into();
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(protocol::LISTEN_BACKLOG as i32)?;
    let std_listener: std::net::TcpListener = socket.into();
    Ok(tokio::net::TcpListener::from_std(std_listener)?)
}
