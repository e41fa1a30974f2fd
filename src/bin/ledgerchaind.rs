use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use ledgerchaind::config::{self, NodeConfig};
use ledgerchaind::consensus::chain::Chain;
use ledgerchaind::net::discovery::PeerTable;
use ledgerchaind::net::orchestrator::Orchestrator;
use ledgerchaind::net::transport::Server;
use ledgerchaind::node::file_store::FileStorage;
use ledgerchaind::node::persistence::ChainStorage;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let data_dir = std::env::var("LEDGERCHAIN_DATA_DIR")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(config::default_data_dir);
    std::fs::create_dir_all(&data_dir)?;
    eprintln!("[init] data dir: {}", data_dir.display());

    let bind_addr: SocketAddr = std::env::var("LEDGERCHAIN_BIND_ADDR")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| "0.0.0.0:9735".parse().unwrap());

    let node_config = Arc::new(NodeConfig::new(data_dir));

    let storage: Arc<dyn ChainStorage> = Arc::new(FileStorage::new(
        node_config.persistence.data_dir.clone(),
        node_config.persistence.max_backup_files,
    ));

    let chain = if storage.exists() {
        match storage.load() {
            Ok(chain) => {
                eprintln!("[init] loaded chain, height {}", chain.length().saturating_sub(1));
                chain
            }
            Err(e) => {
                eprintln!("[init] failed to load saved chain ({e}), starting from genesis");
                Chain::new_chain()
            }
        }
    } else {
        eprintln!("[init] no saved chain, starting from genesis");
        Chain::new_chain()
    };
    storage.save(&chain)?;
    let chain = Arc::new(RwLock::new(chain));

    let server = Server::new(node_config.transport.clone());
    let peer_table = Arc::new(PeerTable::new(node_config.discovery.clone()));

    let bootstrap_peers: Vec<SocketAddr> = std::env::var("LEDGERCHAIN_PEERS")
        .unwrap_or_default()
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();
    ledgerchaind::net::discovery::bootstrap(&peer_table, &bootstrap_peers).await;

    let orchestrator = Orchestrator::new(chain.clone(), storage.clone(), server.clone(), peer_table.clone(), node_config.clone());

    let cancel = orchestrator.cancellation_token();
    let listen_orchestrator = orchestrator.clone();
    let listen_server = server.clone();
    let listen_cancel = cancel.clone();
    let listen_handle = tokio::spawn(async move {
        let result = listen_server
            .listen(bind_addr, listen_cancel, move |from, message| {
                let orchestrator = listen_orchestrator.clone();
                tokio::spawn(async move {
                    orchestrator.dispatch(from, message).await;
                });
            })
            .await;
        if let Err(e) = result {
            eprintln!("[net] listener stopped: {e}");
        }
    });

    tokio::spawn(orchestrator.clone().run_periodic_sync());
    tokio::spawn(orchestrator.clone().run_height_polling());
    tokio::spawn(orchestrator.clone().run_partition_sweep());
    tokio::spawn(orchestrator.clone().run_discovery_health_sweep());
    tokio::spawn(orchestrator.clone().run_discovery_propagation_sweep());

    eprintln!("[init] node listening on {bind_addr}");

    tokio::signal::ctrl_c().await?;
    eprintln!("[shutdown] signal received, saving chain");
    orchestrator.shutdown();
    storage.save(&*chain.read().await)?;
    drop(listen_handle);

    Ok(())
}
