use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use super::codec::{read_frame, write_frame, WireReply};
use super::NetworkError;
use crate::raft::{Raft, RaftRequest};

/// Accepts peer connections and feeds their requests to a [`Raft`] handle.
pub struct RaftServer {
    listener: TcpListener,
    raft: Raft,
    shutdown: Arc<Notify>,
}

impl RaftServer {
    pub async fn bind(address: &str, raft: Raft) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(address).await?;
        Self::from_listener(listener, raft)
    }

    /// Serves on an already bound listener.
    pub fn from_listener(listener: TcpListener, raft: Raft) -> Result<Self, NetworkError> {
        info!(
            "[{}] listening for peers on {}",
            raft.id(),
            listener.local_addr()?
        );
        Ok(Self {
            listener,
            raft,
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        Ok(self.listener.local_addr()?)
    }

    /// Notifying this handle makes [`RaftServer::serve`] return.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    pub async fn serve(self) -> Result<(), NetworkError> {
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("[{}] server shutting down", self.raft.id());
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("[{}] accept failed: {}", self.raft.id(), e);
                            continue;
                        }
                    };
                    let raft = self.raft.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, raft.clone()).await {
                            debug!("[{}] connection from {} closed: {}", raft.id(), remote, e);
                        }
                    });
                }
            }
        }
    }
}

async fn serve_connection(mut stream: TcpStream, raft: Raft) -> Result<(), NetworkError> {
    stream.set_nodelay(true)?;
    while let Some(request) = read_frame::<_, RaftRequest>(&mut stream).await? {
        let operation = request.operation_name();
        let reply: WireReply = raft.handle(request).await.map_err(|e| e.to_string());
        if let Err(e) = &reply {
            debug!("[{}] {} failed: {}", raft.id(), operation, e);
        }
        write_frame(&mut stream, &reply).await?;
    }
    Ok(())
}
