//! [`WirelessLink`] for a bridge running on a general purpose host.
//!
//! The operating system owns the network there. Joining only records which network is
//! expected, and the uplink counts as up while the host has a route to the probe address.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::credentials::Credentials;
use crate::error::Result;
use crate::uplink::WirelessLink;

pub struct HostLink {
    probe_address: String,
    network: Mutex<Option<String>>,
}

impl HostLink {
    pub fn new(probe_address: impl Into<String>) -> Self {
        Self {
            probe_address: probe_address.into(),
            network: Mutex::new(None),
        }
    }

    async fn has_route(&self) -> std::io::Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        // Connecting a UDP socket sends nothing, it only resolves a route.
        socket.connect(self.probe_address.as_str()).await
    }
}

#[async_trait]
impl WirelessLink for HostLink {
    async fn join(&self, credentials: &Credentials) -> Result<()> {
        info!(network = %credentials.network_name, "uplink is managed by the host");
        if let Ok(mut network) = self.network.lock() {
            *network = Some(credentials.network_name.clone());
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        match self.has_route().await {
            Ok(()) => true,
            Err(err) => {
                debug!(probe = %self.probe_address, %err, "no route to probe address");
                false
            }
        }
    }

    async fn start_access_point(&self, name: &str) -> Result<()> {
        warn!(name, "cannot host an access point here, waiting for credentials");
        Ok(())
    }

    async fn leave(&self) {
        if let Ok(mut network) = self.network.lock() {
            if let Some(network) = network.take() {
                debug!(%network, "left uplink");
            }
        }
    }
}
