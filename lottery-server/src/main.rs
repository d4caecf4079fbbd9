use anyhow::Result;
use clap::Parser;
use tracing::{debug, info, warn};

use lottery_server::{
    bet::WinningNumber,
    cli::Cli,
    server::{Server, ServerState},
    store::FileBetStore,
};

fn init_tracing(default_level: &str) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let state = ServerState::new(
        cli.agencies as usize,
        FileBetStore::new(&cli.bets_file),
        WinningNumber(cli.winning_number),
    );
    let server = Server::bind(cli.listen, cli.backlog, state)?;
    let addr = server.local_addr()?;
    info!("server listening on {}", addr);
    debug!(?cli, "action: config | result: success");

    if let Err(err) = server.run_until_signal().await {
        warn!("server exited with error: {err:?}");
        return Err(err);
    }

    Ok(())
}
