#![cfg_attr(not(test), deny(clippy::panic))]

use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use world_beacon_server::config::{Cli, Config};
use world_beacon_server::geo::{CsvGeolocate, Geolocate};
use world_beacon_server::identity::MojangVerifier;
use world_beacon_server::logging;
use world_beacon_server::server::Server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_level.as_deref(), cli.log_dir.as_deref());

    let config = match Config::load(cli) {
        Ok(config) => Arc::new(config),
        Err(err) => {
            error!(%err, "invalid configuration");
            process::exit(1);
        }
    };

    let geolocate: Arc<dyn Geolocate> = match config.geo_db.as_deref() {
        Some(path) => match CsvGeolocate::load(path) {
            Ok(db) => {
                info!(file = %path.display(), entries = db.len(), "loaded geo database");
                Arc::new(db)
            }
            Err(err) => {
                error!(%err, file = %path.display(), "failed to load geo database");
                process::exit(1);
            }
        },
        None => {
            info!("no geo database configured, sessions will not be geolocated");
            Arc::new(CsvGeolocate::empty())
        }
    };

    let verifier = Arc::new(MojangVerifier::new());
    let server = Arc::new(Server::new(config, verifier, geolocate)?);

    tokio::select! {
        result = Arc::clone(&server).run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            Ok(())
        }
    }
}
