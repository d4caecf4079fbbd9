//! Listener loop and the state shared by every connection worker.

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpSocket, TcpStream},
    select,
    task::{JoinError, JoinSet},
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::{
    bet::WinPredicate,
    draw::DrawCoordinator,
    store::{BetStore, BetStoreGateway},
    worker,
};

/// How often finished connection workers are reclaimed.
const REAP_INTERVAL: Duration = Duration::from_millis(500);

/// Process-wide state handed to every connection worker.
pub struct ServerState {
    store: BetStoreGateway,
    draw: DrawCoordinator,
}

impl ServerState {
    pub fn new(
        total_agencies: usize,
        store: impl BetStore + 'static,
        predicate: impl WinPredicate + 'static,
    ) -> Self {
        Self {
            store: BetStoreGateway::new(store),
            draw: DrawCoordinator::new(total_agencies, predicate),
        }
    }

    pub fn store(&self) -> &BetStoreGateway {
        &self.store
    }

    pub fn draw(&self) -> &DrawCoordinator {
        &self.draw
    }
}

pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl Server {
    pub fn new(listener: TcpListener, state: Arc<ServerState>) -> Self {
        Self { listener, state }
    }

    /// Binds `addr` with the given accept backlog.
    pub fn bind(addr: SocketAddr, backlog: u32, state: ServerState) -> Result<Self> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .context("failed to create listening socket")?;
        socket
            .set_reuseaddr(true)
            .context("failed to set SO_REUSEADDR")?;
        socket
            .bind(addr)
            .with_context(|| format!("failed to bind {addr}"))?;
        let listener = socket
            .listen(backlog)
            .with_context(|| format!("failed to listen on {addr}"))?;

        Ok(Self::new(listener, Arc::new(state)))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    /// Accepts agencies until `shutdown` resolves.
    ///
    /// After shutdown the listening socket is closed and in-flight workers
    /// run to completion before this returns.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, state } = self;
        let mut workers = JoinSet::new();
        let mut reap = tokio::time::interval(REAP_INTERVAL);
        reap.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("action: receive_shutdown_signal | result: in_progress");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state, &mut workers);
                }
                _ = reap.tick() => reap_finished(&mut workers),
            }
        }

        drop(listener);
        if !workers.is_empty() {
            info!(in_flight = workers.len(), "waiting for connections to finish");
        }
        while let Some(result) = workers.join_next().await {
            log_worker_exit(result);
        }
        info!("action: receive_shutdown_signal | result: success");

        Ok(())
    }

    /// Runs until SIGINT or, on unix, SIGTERM.
    pub async fn run_until_signal(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<ServerState>,
    workers: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => {
            info!(ip = %peer.ip(), "action: accept_connections | result: success");
            spawn_worker(stream, peer, state, workers);
        }
        // Accept failures are transient; the loop simply tries again.
        Err(err) => warn!(error = ?err, "action: accept_connections | result: fail"),
    }
}

fn spawn_worker(
    stream: TcpStream,
    peer: SocketAddr,
    state: &Arc<ServerState>,
    workers: &mut JoinSet<()>,
) {
    let state = Arc::clone(state);
    workers.spawn(async move {
        if let Err(err) = worker::handle_connection(stream, &state).await {
            warn!(peer = %peer, error = ?err, "connection closed with error");
        }
    });
}

fn reap_finished(workers: &mut JoinSet<()>) {
    while let Some(result) = workers.try_join_next() {
        log_worker_exit(result);
    }
}

fn log_worker_exit(result: Result<(), JoinError>) {
    match result {
        Ok(()) => debug!("connection worker finished"),
        Err(err) => warn!(error = ?err, "connection worker panicked"),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                select! {
                    result = tokio::signal::ctrl_c() => log_ctrl_c(result),
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                warn!(error = ?err, "failed to install SIGTERM handler");
                log_ctrl_c(tokio::signal::ctrl_c().await);
            }
        }
    }

    #[cfg(not(unix))]
    log_ctrl_c(tokio::signal::ctrl_c().await);
}

fn log_ctrl_c(result: std::io::Result<()>) {
    if let Err(err) = result {
        warn!(error = ?err, "failed to install ctrl-c handler");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bet::WinningNumber, store::MemoryBetStore};

    #[tokio::test]
    async fn shutdown_stops_accepting() {
        let state = ServerState::new(1, MemoryBetStore::new(), WinningNumber(7));
        let server = Server::bind("127.0.0.1:0".parse().unwrap(), 8, state).expect("bind");
        let addr = server.local_addr().expect("local addr");

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.run_until(async move {
            let _ = shutdown_rx.await;
        }));

        TcpStream::connect(addr).await.expect("server accepts");
        let _ = shutdown_tx.send(());
        handle.await.expect("server task").expect("server result");

        assert!(TcpStream::connect(addr).await.is_err());
    }
}
