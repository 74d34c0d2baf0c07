use std::io;

use comms::TcpMesh;
use log::info;
use tokio::signal;

use party::{PartyConfig, session};

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let config = PartyConfig::from_env()?;
    let role = config.role;
    info!(role = role.id(); "starting as {role}");

    let mesh = TcpMesh::connect(role, &config.peers, config.timeouts()).await?;
    info!(role = role.id(); "connected to every peer");

    tokio::select! {
        ret = session::run(&config, mesh) => {
            let state = ret?;
            info!(
                executed = state.executed, skipped = state.skipped;
                "wrapping up, mean loss {:?}", state.mean_loss()
            );
        }
        _ = signal::ctrl_c() => {
            info!("received SIGTERM");
        }
    }

    Ok(())
}
