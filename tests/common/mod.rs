#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tftpd::{MemoryStorage, Packet, Registry, ServerConfig, TftpServer, BLOCK_SIZE};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Longest a test waits for a datagram it expects.
pub const RECV_WAIT: Duration = Duration::from_secs(2);

/// Short timeouts so retry and dally paths finish quickly.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        timeout_ms: 100,
        max_retries: 4,
        terminal_max_retries: 2,
        dally_factor: 3,
        ..ServerConfig::default()
    }
}

/// A server on 127.0.0.1 backed by a `MemoryStorage`, stopped on drop.
pub struct TestServer {
    pub addr: SocketAddr,
    pub storage: MemoryStorage,
    pub registry: Registry,
    shutdown: CancellationToken,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: ServerConfig) -> Self {
        let storage = MemoryStorage::new();
        let server = TftpServer::bind_with_storage(config, Arc::new(storage.clone()))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let registry = server.registry();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.run_until(shutdown.clone()));

        Self {
            addr,
            storage,
            registry,
            shutdown,
        }
    }

    pub async fn client(&self) -> Client {
        Client::connect(self.addr).await
    }

    /// Wait for every session to leave the registry.
    pub async fn wait_idle(&self) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !self.registry.is_empty() {
            assert!(
                Instant::now() < deadline,
                "sessions still registered: {:?}",
                self.registry.snapshot()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A scripted TFTP client on its own socket, so its address is its TID.
pub struct Client {
    socket: UdpSocket,
    listener: SocketAddr,
    peer: Option<SocketAddr>,
}

impl Client {
    pub async fn connect(listener: SocketAddr) -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            listener,
            peer: None,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    /// The session endpoint, learnt from the first reply not sent by the listener.
    pub fn peer(&self) -> SocketAddr {
        self.peer.expect("no reply from a session endpoint yet")
    }

    pub async fn request(&self, packet: Packet) {
        self.send_raw_to(self.listener, &packet.encode().unwrap()).await;
    }

    pub async fn send(&self, packet: Packet) {
        self.send_raw_to(self.peer(), &packet.encode().unwrap()).await;
    }

    pub async fn send_raw_to(&self, dest: SocketAddr, datagram: &[u8]) {
        self.socket.send_to(datagram, dest).await.unwrap();
    }

    pub async fn recv(&mut self) -> Packet {
        self.recv_from().await.0
    }

    pub async fn recv_from(&mut self) -> (Packet, SocketAddr) {
        self.try_recv(RECV_WAIT)
            .await
            .expect("expected a datagram from the server")
    }

    pub async fn try_recv(&mut self, wait: Duration) -> Option<(Packet, SocketAddr)> {
        let mut buf = [0u8; 1024];
        let (len, from) = tokio::time::timeout(wait, self.socket.recv_from(&mut buf))
            .await
            .ok()?
            .unwrap();
        if from != self.listener && self.peer.is_none() {
            self.peer = Some(from);
        }
        Some((Packet::decode(&buf[..len]).unwrap(), from))
    }

    pub async fn expect_silence(&mut self, wait: Duration) {
        if let Some((packet, from)) = self.try_recv(wait).await {
            panic!("expected silence, got {:?} from {}", packet, from);
        }
    }

    /// Read a whole file, acknowledging every block.
    pub async fn download(&mut self, filename: &str) -> Result<Vec<u8>, Packet> {
        self.request(rrq(filename)).await;

        let mut expected = 1u16;
        let mut out = Vec::new();
        loop {
            match self.recv().await {
                Packet::Data { block, payload } if block == expected => {
                    out.extend_from_slice(&payload);
                    self.send(Packet::Ack { block }).await;
                    if payload.len() < BLOCK_SIZE {
                        return Ok(out);
                    }
                    expected += 1;
                }
                Packet::Data { block, .. } => self.send(Packet::Ack { block }).await,
                error @ Packet::Error { .. } => return Err(error),
                other => panic!("unexpected {:?} during download", other),
            }
        }
    }

    /// Write a whole file, resending a block until it is acknowledged.
    pub async fn upload(&mut self, filename: &str, contents: &[u8]) -> Result<(), Packet> {
        self.request(wrq(filename)).await;
        match self.recv().await {
            Packet::Ack { block: 0 } => {}
            error @ Packet::Error { .. } => return Err(error),
            other => panic!("unexpected {:?} instead of ACK 0", other),
        }

        let mut chunks: Vec<&[u8]> = contents.chunks(BLOCK_SIZE).collect();
        if contents.len() % BLOCK_SIZE == 0 {
            chunks.push(&[]);
        }

        for (index, chunk) in chunks.into_iter().enumerate() {
            let block = (index + 1) as u16;
            self.send(data(block, chunk)).await;
            loop {
                match self.try_recv(Duration::from_millis(200)).await {
                    Some((Packet::Ack { block: acked }, _)) if acked == block => break,
                    Some((Packet::Ack { .. }, _)) => continue,
                    Some((error @ Packet::Error { .. }, _)) => return Err(error),
                    Some((other, _)) => panic!("unexpected {:?} during upload", other),
                    None => self.send(data(block, chunk)).await,
                }
            }
        }
        Ok(())
    }
}

pub fn rrq(filename: &str) -> Packet {
    Packet::ReadRequest {
        filename: filename.to_string(),
    }
}

pub fn wrq(filename: &str) -> Packet {
    Packet::WriteRequest {
        filename: filename.to_string(),
    }
}

pub fn data(block: u16, payload: &[u8]) -> Packet {
    Packet::Data {
        block,
        payload: Bytes::copy_from_slice(payload),
    }
}

/// Deterministic, non-repeating-per-block file content.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
