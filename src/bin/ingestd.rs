//! The ingestion daemon: wires Config, Store, Scheduler, and Supervisor
//! together and runs until a shutdown signal arrives.

use bf1942_ingest::config::Config;
use bf1942_ingest::querier::UdpGameSpyClient;
use bf1942_ingest::supervisor::Supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();

    let config = Config::from_env().map_err(|e| {
        log::error!("configuration error: {e}");
        anyhow::anyhow!(e)
    })?;

    let supervisor = Supervisor::bootstrap(config, UdpGameSpyClient).await?;
    supervisor.run().await
}
