//! UDP listener and request dispatcher for the TFTP server

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::ServerConfig;
use crate::packet::Packet;
use crate::registry::{Registration, Registry, SessionInfo};
use crate::session::Session;
use crate::storage::{DirStorage, Storage};
use crate::transport::{LossyTransport, Transport};
use crate::types::{ErrorCode, Result, TftpError, TransferId, RECV_BUFFER_SIZE};

const EXPECTING_REQUEST: &str = "Illegal TFTP operation. Expecting a Write Request or Read Request.";

/// TFTP server: answers requests at the well-known endpoint and runs each
/// admitted transfer as its own task on its own ephemeral socket.
pub struct TftpServer {
    socket: UdpSocket,
    config: ServerConfig,
    storage: Arc<dyn Storage>,
    registry: Registry,
}

impl TftpServer {
    /// Bind `config.bind_addr`, serving files from `config.root_dir`
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let storage = Arc::new(DirStorage::new(config.root_dir.clone()));
        Self::bind_with_storage(config, storage).await
    }

    /// Bind `config.bind_addr`, serving files from `storage`
    pub async fn bind_with_storage(config: ServerConfig, storage: Arc<dyn Storage>) -> Result<Self> {
        config.validate()?;
        let socket = UdpSocket::bind(config.bind_addr).await?;
        info!("TFTP server bound to {}", socket.local_addr()?);

        Ok(Self {
            socket,
            config,
            storage,
            registry: Registry::new(),
        })
    }

    /// Get the local address this server is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Live transfers. The handle stays valid after the server is moved into `run`.
    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    /// Serve forever
    pub async fn run(self) -> Result<()> {
        self.run_until(CancellationToken::new()).await
    }

    /// Serve until `shutdown` is cancelled. Transfers already admitted keep
    /// running to their own end.
    pub async fn run_until(self, shutdown: CancellationToken) -> Result<()> {
        info!("TFTP server starting...");

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("TFTP server stopping, {} transfers still running", self.registry.len());
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from_addr)) => {
                        debug!("Received {} bytes from {}", len, from_addr);

                        if let Err(e) = self.handle_datagram(from_addr, &buf[..len]).await {
                            error!("Error handling datagram from {}: {}", from_addr, e);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving UDP packet: {}", e);
                    }
                }
            }
        }
    }

    /// Classify one datagram that arrived at the well-known endpoint
    async fn handle_datagram(&self, from_addr: SocketAddr, data: &[u8]) -> Result<()> {
        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(TftpError::UnknownOpcode(opcode)) => {
                warn!("Unknown opcode {} from {}", opcode, from_addr);
                return self
                    .send_error(from_addr, ErrorCode::IllegalOperation, EXPECTING_REQUEST)
                    .await;
            }
            Err(TftpError::UnsupportedMode(mode)) => {
                warn!("Request from {} uses unsupported mode '{}'", from_addr, mode);
                let message = format!("Illegal TFTP operation. Transfer mode '{mode}' is not supported, use octet.");
                return self
                    .send_error(from_addr, ErrorCode::IllegalOperation, &message)
                    .await;
            }
            Err(e) => {
                warn!("Dropping malformed datagram from {}: {}", from_addr, e);
                return Ok(());
            }
        };

        match packet {
            Packet::ReadRequest { filename } => self.accept_read(from_addr, filename).await,
            Packet::WriteRequest { filename } => self.accept_write(from_addr, filename).await,
            Packet::Error { code, message } => {
                debug!("Ignoring error {} from {}: {}", code, from_addr, message);
                Ok(())
            }
            other => {
                warn!("Unexpected {:?} from {} at the listener", other.opcode(), from_addr);
                self.send_error(from_addr, ErrorCode::IllegalOperation, EXPECTING_REQUEST)
                    .await
            }
        }
    }

    /// RRQ: the file must exist before a session is admitted
    async fn accept_read(&self, tid: TransferId, filename: String) -> Result<()> {
        if self.registry.contains(&tid) {
            debug!("Duplicate request from {} ignored", tid);
            return Ok(());
        }

        if !self.storage.exists(&filename).await {
            info!("RRQ from {} for missing file {}", tid, filename);
            return self.send_file_not_found(tid, &filename).await;
        }

        let source = match self.storage.open_for_read(&filename).await {
            Ok(source) => source,
            Err(e) => {
                warn!("Could not open {} for {}: {}", filename, tid, e);
                return self.send_file_not_found(tid, &filename).await;
            }
        };

        let transport = self.session_transport().await?;
        let policy = self.config.transfer_policy();
        self.launch(Session::sending(tid, filename, transport, source, policy))
    }

    /// WRQ: admitted unconditionally, an existing file is overwritten on commit
    async fn accept_write(&self, tid: TransferId, filename: String) -> Result<()> {
        if self.registry.contains(&tid) {
            debug!("Duplicate request from {} ignored", tid);
            return Ok(());
        }

        let transport = self.session_transport().await?;
        let policy = self.config.transfer_policy();
        let storage = Arc::clone(&self.storage);
        self.launch(Session::receiving(tid, filename, transport, storage, policy))
    }

    /// A fresh endpoint on the listener's address, with loss injection applied
    async fn session_transport(&self) -> Result<LossyTransport<UdpSocket>> {
        let listen_ip = self.socket.local_addr()?.ip();
        let socket = UdpSocket::bind(SocketAddr::new(listen_ip, 0)).await?;
        Ok(LossyTransport::new(socket, self.config.loss_probability))
    }

    /// Register the session and hand it to its own task
    fn launch<T: Transport + 'static>(&self, session: Session<T>) -> Result<()> {
        let tid = session.tid();
        let info = SessionInfo {
            role: session.role(),
            filename: session.filename().to_string(),
            local_addr: session.local_addr()?,
        };

        let Some(registration) = self.registry.admit(tid, info.clone()) else {
            debug!("Duplicate request from {} ignored", tid);
            return Ok(());
        };

        info!(
            "Admitted {} transfer of {} for {} on {}",
            info.role, info.filename, tid, info.local_addr
        );

        let span = info_span!("session", tid = %tid, role = %info.role, file = %info.filename);
        tokio::spawn(drive(session, registration).instrument(span));
        Ok(())
    }

    async fn send_file_not_found(&self, dest: SocketAddr, filename: &str) -> Result<()> {
        let message = format!("File {filename} not found.");
        self.send_error(dest, ErrorCode::FileNotFound, &message).await
    }

    /// Send an ERROR packet from the well-known endpoint
    async fn send_error(&self, dest: SocketAddr, code: ErrorCode, message: &str) -> Result<()> {
        let encoded = Packet::error(code, message).encode()?;
        self.socket.send_to(&encoded, dest).await?;
        debug!("Sent error {} to {}", code, dest);
        Ok(())
    }
}

/// Run a session to its end; the registry entry goes with `registration`.
async fn drive<T: Transport>(session: Session<T>, registration: Registration) {
    match session.run().await {
        Ok(()) => info!("Transfer complete"),
        Err(e) if e.is_presumed_dead() => warn!("Client presumed terminated: {}", e),
        Err(e) if e.is_protocol_violation() => error!("Protocol violation, transfer aborted: {}", e),
        Err(e) => warn!("Transfer aborted: {}", e),
    }
    drop(registration);
}
