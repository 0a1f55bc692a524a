//! Modbus TCP endpoint in front of the bridge.
//!
//! Each accepted peer gets its own task. Requests are handled one at a time per peer: the PDU is
//! handed to [`Bridge::submit`] and the answer (or an exception built from the error) goes back
//! with the peer's transaction id and unit id.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Deserialize;
use strum_macros::Display;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bridge::{Bridge, Request};
use crate::error::{Error, Result};
use crate::frame::{self, MbapHeader, MBAP_HEADER_LEN};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub bind: SocketAddr,
    /// Peers beyond this many are refused.
    pub max_clients: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 502)),
            max_clients: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ProtocolKind {
    ModbusTcp,
}

/// A peer as shown to the management surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectedPeer {
    pub address: SocketAddr,
    pub protocol: ProtocolKind,
}

type PeerTable = Arc<Mutex<HashMap<SocketAddr, JoinHandle<()>>>>;

pub struct ModbusTcpServer {
    listener: TcpListener,
    bridge: Arc<Bridge>,
    peers: PeerTable,
    max_clients: usize,
}

impl ModbusTcpServer {
    pub async fn bind(config: &EndpointConfig, bridge: Arc<Bridge>) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(config.bind).await?;
        let address = listener.local_addr()?;
        info!(%address, max_clients = config.max_clients, "modbus tcp endpoint listening");
        Ok(Arc::new(Self {
            listener,
            bridge,
            peers: Arc::new(Mutex::new(HashMap::new())),
            max_clients: config.max_clients,
        }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept peers until the task is dropped.
    pub async fn run(self: Arc<Self>) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(err) => warn!(%err, "accept failed"),
            }
        }
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        let mut peers = lock(&self.peers);
        if peers.len() >= self.max_clients {
            warn!(%peer, max_clients = self.max_clients, "peer refused, client table full");
            return;
        }
        info!(%peer, "peer connected");

        let bridge = self.bridge.clone();
        let table = self.peers.clone();
        let handle = tokio::spawn(async move {
            match serve_peer(&bridge, stream, peer).await {
                Ok(()) => info!(%peer, "peer disconnected"),
                Err(err) => warn!(%peer, %err, "peer dropped"),
            }
            lock(&table).remove(&peer);
        });
        peers.insert(peer, handle);
    }

    pub fn connected_peers(&self) -> Vec<ConnectedPeer> {
        lock(&self.peers)
            .keys()
            .map(|&address| ConnectedPeer {
                address,
                protocol: ProtocolKind::ModbusTcp,
            })
            .collect()
    }

    /// Close every connection from `ip`, releasing the channel if one of them holds it.
    /// Returns how many connections were closed.
    pub fn disconnect_peer(&self, ip: IpAddr) -> usize {
        let closed: Vec<(SocketAddr, JoinHandle<()>)> = {
            let mut peers = lock(&self.peers);
            let addresses: Vec<SocketAddr> =
                peers.keys().filter(|addr| addr.ip() == ip).copied().collect();
            addresses
                .into_iter()
                .filter_map(|addr| peers.remove(&addr).map(|handle| (addr, handle)))
                .collect()
        };
        for (address, handle) in &closed {
            handle.abort();
            self.bridge.release_peer(*address);
            info!(peer = %address, "peer disconnected by request");
        }
        closed.len()
    }
}

fn lock(peers: &PeerTable) -> MutexGuard<'_, HashMap<SocketAddr, JoinHandle<()>>> {
    peers.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn serve_peer(bridge: &Bridge, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let mut header = [0u8; MBAP_HEADER_LEN];
    loop {
        match stream.read_exact(&mut header).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        let mbap = MbapHeader::parse(&header)?;
        let mut pdu = vec![0u8; mbap.pdu_len()?];
        stream.read_exact(&mut pdu).await?;
        let function = pdu[0];
        debug!(%peer, transaction_id = mbap.transaction_id, unit_id = mbap.unit_id, function, "request");

        let request = Request {
            peer,
            unit_id: mbap.unit_id,
            transaction_id: mbap.transaction_id,
            pdu,
        };
        let answer = match forward(bridge, request).await {
            Ok(pdu) => pdu,
            Err(err) => {
                warn!(%peer, transaction_id = mbap.transaction_id, %err, "request failed");
                frame::exception_pdu(function, err.exception_code()).to_vec()
            }
        };
        stream
            .write_all(&frame::encode_tcp(mbap.transaction_id, mbap.unit_id, &answer))
            .await?;
    }
}

async fn forward(bridge: &Bridge, request: Request) -> Result<Vec<u8>> {
    let response = bridge.submit(request).await?.wait().await?;
    if response.pdu.is_empty() {
        return Err(Error::InvalidResponse);
    }
    Ok(response.pdu)
}
