//! Liveness responder for the process monitor.
//!
//! The monitor sends a UDP datagram to every worker; a live worker answers
//! with an empty datagram.
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to bind health socket {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

const MAX_PING_BYTES: usize = 512;

/// Background task answering health pings.
#[derive(Debug)]
pub struct Acker {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Acker {
    /// Listens on `0.0.0.0:<port>`; a failed reply is retried up to `retries` times.
    pub async fn spawn(port: u16, retries: u32) -> Result<Self> {
        Self::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)), retries).await
    }

    pub async fn bind(addr: SocketAddr, retries: u32) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        let local_addr = socket.local_addr()?;
        tracing::info!(addr = %local_addr, retries, "health acker listening");
        let task = tokio::spawn(respond(socket, retries));
        Ok(Self { local_addr, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Cancels the responder and waits for it to finish.
    pub async fn stop(self) {
        self.task.abort();
        match self.task.await {
            Ok(()) => {}
            Err(err) if err.is_cancelled() => {}
            Err(err) => tracing::warn!(error = %err, "health acker task failed"),
        }
        tracing::debug!(addr = %self.local_addr, "health acker stopped");
    }
}

async fn respond(socket: UdpSocket, retries: u32) {
    let mut buf = [0u8; MAX_PING_BYTES];
    loop {
        let peer = match socket.recv_from(&mut buf).await {
            Ok((_, peer)) => peer,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read health ping");
                continue;
            }
        };
        let mut attempt = 0;
        while let Err(err) = socket.send_to(&[], peer).await {
            attempt += 1;
            if attempt > retries {
                tracing::warn!(%peer, error = %err, "giving up on health reply");
                break;
            }
            tracing::debug!(%peer, attempt, error = %err, "retrying health reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn ping(target: SocketAddr) -> usize {
        let client = UdpSocket::bind("127.0.0.1:0").await.expect("client");
        client.send_to(b"ping", target).await.expect("send");
        let mut buf = [0u8; 16];
        let (len, _) = tokio::time::timeout(Duration::from_secs(1), client.recv_from(&mut buf))
            .await
            .expect("timely reply")
            .expect("reply");
        len
    }

    #[tokio::test]
    async fn answers_every_ping_with_empty_datagram() {
        let acker = Acker::bind("127.0.0.1:0".parse().expect("addr"), 3)
            .await
            .expect("bind");
        let target = acker.local_addr();
        assert_eq!(ping(target).await, 0);
        assert_eq!(ping(target).await, 0);
        acker.stop().await;
    }

    #[tokio::test]
    async fn stopped_acker_releases_port() {
        let acker = Acker::bind("127.0.0.1:0".parse().expect("addr"), 0)
            .await
            .expect("bind");
        let addr = acker.local_addr();
        acker.stop().await;
        let again = Acker::bind(addr, 0).await.expect("rebind");
        again.stop().await;
    }

    #[tokio::test]
    async fn spawn_binds_all_interfaces() {
        let acker = Acker::spawn(0, 1).await.expect("spawn");
        assert!(acker.local_addr().ip().is_unspecified());
        let target = SocketAddr::from((Ipv4Addr::LOCALHOST, acker.local_addr().port()));
        assert_eq!(ping(target).await, 0);
        acker.stop().await;
    }
}
