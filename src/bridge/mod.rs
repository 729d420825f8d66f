//! Activation-spot bridge
//!
//! Polls the activator feed and posts each new spot to the cluster through
//! an ordinary logged-in console connection.
//!
//! ```text
//! Bridge (one loop, owns all state)
//! ├── SpotApi            GET feed -> Vec<ActivationSpot>
//! ├── SeenSet            ids already forwarded
//! └── ClusterConnection  login + `dx` commands
//! ```

pub mod api;
pub mod cluster;
pub mod seen;

use std::io;
use std::thread;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::BridgeConfig;
use api::{ActivationSpot, SpotApi};
use cluster::ClusterConnection;
use seen::SeenSet;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Spot feed request failed: {0}")]
    Http(#[source] Box<ureq::Error>),

    #[error("Failed to read spot feed: {0}")]
    Body(#[source] io::Error),

    #[error("Malformed spot feed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to connect to cluster at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Cluster did not send a login prompt")]
    NoPrompt,

    #[error("Failed to send to cluster: {0}")]
    Send(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

pub struct Bridge {
    config: BridgeConfig,
    api: SpotApi,
    cluster: ClusterConnection,
    seen: SeenSet,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            api: SpotApi::new(&config.api_url),
            cluster: ClusterConnection::new(&config),
            seen: SeenSet::new(config.max_seen),
            config,
        }
    }

    /// Poll forever
    pub fn run(&mut self) {
        info!(
            callsign = %self.config.callsign,
            cluster = %format!("{}:{}", self.config.cluster_host, self.config.cluster_port),
            interval = ?self.config.check_interval(),
            min_mhz = self.config.min_freq_mhz,
            max_mhz = self.config.max_freq_mhz,
            "Spot bridge starting"
        );

        loop {
            let spots = match self.api.fetch() {
                Ok(spots) => spots,
                Err(e) => {
                    warn!("{}", e);
                    Vec::new()
                }
            };
            self.process(&spots);
            thread::sleep(self.config.check_interval());
        }
    }

    /// Forward every new, usable spot of one batch. Returns how many were
    /// posted.
    pub fn process(&mut self, spots: &[ActivationSpot]) -> usize {
        let mut posted = 0;

        for spot in spots {
            let Some(spot) = spot.to_cluster_spot(&self.config) else {
                continue;
            };
            if self.seen.contains(&spot.id) {
                continue;
            }

            match self.cluster.send_spot(&spot) {
                Ok(()) => {
                    self.seen.insert(&spot.id);
                    posted += 1;
                    info!(
                        callsign = %spot.callsign,
                        freq_mhz = spot.freq_mhz,
                        comment = %spot.comment,
                        "Spotted"
                    );
                }
                Err(e) => {
                    warn!(callsign = %spot.callsign, "{}", e);
                    // Cluster unreachable; retry the rest next round
                    if !self.cluster.is_connected() {
                        break;
                    }
                }
            }
        }

        if posted > 0 {
            info!(posted, tracked = self.seen.len(), "Added spots");
        }
        posted
    }
}
