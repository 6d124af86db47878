use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::codec::{read_frame, write_frame, WireReply};
use super::{NetworkError, Transport};
use crate::raft::{NodeId, RaftRequest, RaftResponse};

/// Dials peers over TCP. Connections are opened lazily and reused while they
/// stay healthy; a failed exchange discards its connection.
pub struct TcpTransport {
    addresses: HashMap<NodeId, String>,
    connect_timeout: Duration,
    idle: Mutex<HashMap<NodeId, Vec<TcpStream>>>,
}

impl TcpTransport {
    pub fn new(addresses: HashMap<NodeId, String>) -> Self {
        Self {
            addresses,
            connect_timeout: Duration::from_secs(1),
            idle: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn address(&self, peer: NodeId) -> Option<&str> {
        self.addresses.get(&peer).map(String::as_str)
    }

    async fn connect(&self, peer: NodeId) -> Result<TcpStream, NetworkError> {
        let address = self.address(peer).ok_or(NetworkError::UnknownPeer(peer))?;
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| NetworkError::Timeout(self.connect_timeout))??;
        stream.set_nodelay(true)?;
        debug!("connected to peer {} at {}", peer, address);
        Ok(stream)
    }

    async fn checkout(&self, peer: NodeId) -> Result<TcpStream, NetworkError> {
        let pooled = self.idle.lock().await.get_mut(&peer).and_then(Vec::pop);
        match pooled {
            Some(stream) => Ok(stream),
            None => self.connect(peer).await,
        }
    }

    async fn checkin(&self, peer: NodeId, stream: TcpStream) {
        self.idle.lock().await.entry(peer).or_default().push(stream);
    }
}

async fn exchange(
    stream: &mut TcpStream,
    peer: NodeId,
    request: &RaftRequest,
) -> Result<RaftResponse, NetworkError> {
    write_frame(stream, request).await?;
    match read_frame::<_, WireReply>(stream).await? {
        Some(Ok(response)) => Ok(response),
        Some(Err(message)) => Err(NetworkError::Remote(message)),
        None => Err(NetworkError::Disconnected(peer)),
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(&self, peer: NodeId, request: RaftRequest) -> Result<RaftResponse, NetworkError> {
        let mut stream = self.checkout(peer).await?;
        let result = exchange(&mut stream, peer, &request).await;
        match &result {
            // A remote error still leaves the stream framed correctly.
            Ok(_) | Err(NetworkError::Remote(_)) => self.checkin(peer, stream).await,
            Err(e) => debug!(
                "{} to peer {} failed, dropping connection: {}",
                request.operation_name(),
                peer,
                e
            ),
        }
        result
    }
}
