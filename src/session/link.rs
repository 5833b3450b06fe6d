//! Send-and-wait primitive shared by both transfer directions.
//!
//! A [`Link`] binds a transport to one peer. Everything a session receives
//! goes through [`Link::recv_from_peer`], so both directions reject stray
//! datagrams the same way, and every wait-for-reply goes through
//! [`Link::await_reply`], so both directions count timeouts the same way.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::packet::Packet;
use crate::transport::Transport;
use crate::types::{ErrorCode, Result, TftpError, TransferId, RECV_BUFFER_SIZE};

/// What to do with a packet received while waiting.
#[derive(Debug)]
pub enum Verdict<R> {
    /// This is the reply we were waiting for.
    Accept(R),
    /// Send the outstanding packet again and keep waiting.
    Retransmit,
    /// Send this datagram and keep waiting.
    Reply(Bytes),
    /// Not interesting; keep waiting.
    Ignore,
    /// Give up on the transfer.
    Fail(TftpError),
}

/// The block a wait is for and how many timeouts it may absorb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Awaiting {
    pub block: u16,
    pub terminal: bool,
    pub limit: u32,
}

/// A transport bound to one peer.
#[derive(Debug)]
pub struct Link<T> {
    transport: T,
    peer: TransferId,
    timeout: Duration,
    buf: Vec<u8>,
}

impl<T: Transport> Link<T> {
    pub fn new(transport: T, peer: TransferId, timeout: Duration) -> Self {
        Self {
            transport,
            peer,
            timeout,
            buf: vec![0u8; RECV_BUFFER_SIZE],
        }
    }

    pub fn peer(&self) -> TransferId {
        self.peer
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub async fn send(&self, datagram: &[u8]) -> Result<()> {
        self.transport.send_to(datagram, self.peer).await?;
        Ok(())
    }

    /// Wait up to `wait` for a decodable packet from the peer.
    ///
    /// Datagrams from other endpoints and undecodable datagrams are dropped
    /// without a reply. An ERROR from the peer ends the wait with
    /// [`TftpError::Remote`], unless it is an UnknownTransferId complaint,
    /// which concerns some other exchange and is ignored. `Ok(None)` means
    /// the wait timed out.
    pub async fn recv_from_peer(&mut self, wait: Duration) -> Result<Option<Packet>> {
        self.recv_until(Instant::now() + wait).await
    }

    /// [`Link::recv_from_peer`] with an absolute deadline.
    pub async fn recv_until(&mut self, deadline: Instant) -> Result<Option<Packet>> {
        loop {
            let (len, from) = match timeout_at(deadline, self.transport.recv_from(&mut self.buf)).await {
                Ok(received) => received?,
                Err(_) => return Ok(None),
            };

            if from != self.peer {
                debug!("Ignoring {} byte datagram from foreign endpoint {}", len, from);
                continue;
            }

            match Packet::decode(&self.buf[..len]) {
                Ok(Packet::Error {
                    code: ErrorCode::UnknownTransferId,
                    message,
                }) => {
                    debug!("Peer reported an unknown transfer ID: {}", message);
                }
                Ok(Packet::Error { code, message }) => {
                    warn!("Peer sent error {}: {}", code, message);
                    return Err(TftpError::Remote { code, message });
                }
                Ok(packet) => return Ok(Some(packet)),
                Err(e) => debug!("Ignoring undecodable datagram from peer: {}", e),
            }
        }
    }

    /// Wait for the reply to `retransmit`, which the caller has already sent
    /// once.
    ///
    /// Each timeout resends `retransmit`; the `awaiting.limit + 1`-th
    /// timeout fails with [`TftpError::RetriesExhausted`]. Packets that do
    /// arrive are handed to `judge`. A packet that is not accepted leaves the
    /// current round's deadline where it was, so a peer repeating stale or
    /// useless packets cannot keep the wait alive past
    /// `(awaiting.limit + 1) * timeout`.
    pub async fn await_reply<R, F>(
        &mut self,
        retransmit: &[u8],
        awaiting: Awaiting,
        mut judge: F,
    ) -> Result<R>
    where
        F: FnMut(Packet) -> Verdict<R>,
    {
        let mut timeouts = 0u32;
        let mut deadline = Instant::now() + self.timeout;
        loop {
            match self.recv_until(deadline).await? {
                None => {
                    timeouts += 1;
                    if timeouts > awaiting.limit {
                        return Err(TftpError::RetriesExhausted {
                            block: awaiting.block,
                            attempts: awaiting.limit,
                            terminal: awaiting.terminal,
                        });
                    }
                    debug!(
                        "Timeout on block {}, retransmitting ({}/{})",
                        awaiting.block, timeouts, awaiting.limit
                    );
                    self.send(retransmit).await?;
                    deadline = Instant::now() + self.timeout;
                }
                Some(packet) => match judge(packet) {
                    Verdict::Accept(value) => return Ok(value),
                    Verdict::Retransmit => self.send(retransmit).await?,
                    Verdict::Reply(datagram) => self.send(&datagram).await?,
                    Verdict::Ignore => {}
                    Verdict::Fail(e) => return Err(e),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::encode_ack;
    use tokio::net::UdpSocket;

    const WAIT: Duration = Duration::from_millis(40);

    struct Harness {
        link: Link<UdpSocket>,
        peer: UdpSocket,
        link_addr: SocketAddr,
    }

    async fn harness() -> Harness {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let link_addr = socket.local_addr().unwrap();
        let link = Link::new(socket, peer.local_addr().unwrap(), WAIT);
        Harness {
            link,
            peer,
            link_addr,
        }
    }

    fn awaiting(limit: u32) -> Awaiting {
        Awaiting {
            block: 1,
            terminal: false,
            limit,
        }
    }

    async fn count_arrivals(socket: &UdpSocket, within: Duration) -> usize {
        let mut buf = [0u8; 64];
        let mut count = 0;
        while tokio::time::timeout(within, socket.recv_from(&mut buf)).await.is_ok() {
            count += 1;
        }
        count
    }

    #[tokio::test]
    async fn ignores_foreign_datagrams() {
        let Harness {
            mut link,
            peer,
            link_addr,
        } = harness().await;
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        stranger.send_to(&encode_ack(1), link_addr).await.unwrap();
        peer.send_to(&encode_ack(2), link_addr).await.unwrap();

        let packet = link.recv_from_peer(Duration::from_secs(2)).await.unwrap();
        assert_eq!(packet, Some(Packet::Ack { block: 2 }));
    }

    #[tokio::test]
    async fn undecodable_and_unknown_tid_datagrams_are_skipped() {
        let Harness {
            mut link,
            peer,
            link_addr,
        } = harness().await;

        peer.send_to(b"\x00\x09junk", link_addr).await.unwrap();
        let unknown_tid = Packet::error(ErrorCode::UnknownTransferId, "not mine")
            .encode()
            .unwrap();
        peer.send_to(&unknown_tid, link_addr).await.unwrap();
        peer.send_to(&encode_ack(3), link_addr).await.unwrap();

        let packet = link.recv_from_peer(Duration::from_secs(2)).await.unwrap();
        assert_eq!(packet, Some(Packet::Ack { block: 3 }));
    }

    #[tokio::test]
    async fn peer_error_ends_the_wait() {
        let Harness {
            mut link,
            peer,
            link_addr,
        } = harness().await;
        let error = Packet::error(ErrorCode::DiskFull, "no space").encode().unwrap();
        peer.send_to(&error, link_addr).await.unwrap();

        let err = link.recv_from_peer(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(
            err,
            TftpError::Remote {
                code: ErrorCode::DiskFull,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn silence_is_a_timeout() {
        let Harness { mut link, .. } = harness().await;
        let packet = link.recv_from_peer(WAIT).await.unwrap();
        assert_eq!(packet, None);
    }

    #[tokio::test]
    async fn exhausts_after_limit_retransmissions() {
        let Harness { mut link, peer, .. } = harness().await;
        let outstanding = encode_ack(0);

        let err = link
            .await_reply(&outstanding, awaiting(3), |_| Verdict::<()>::Ignore)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TftpError::RetriesExhausted {
                block: 1,
                attempts: 3,
                terminal: false
            }
        ));

        // Only the retransmissions; the caller sends the first copy.
        assert_eq!(count_arrivals(&peer, WAIT).await, 3);
    }

    #[tokio::test]
    async fn stale_packets_do_not_extend_the_wait() {
        let Harness {
            mut link,
            peer,
            link_addr,
        } = harness().await;
        let outstanding = encode_ack(1);

        // Stale ACKs arrive four times per timeout, forever.
        let flood = tokio::spawn(async move {
            loop {
                peer.send_to(&encode_ack(0), link_addr).await.unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        let started = Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            link.await_reply(&outstanding, awaiting(2), |packet| match packet {
                Packet::Ack { block: 0 } => Verdict::<()>::Retransmit,
                Packet::Ack { .. } => Verdict::Accept(()),
                _ => Verdict::Ignore,
            }),
        )
        .await;
        flood.abort();

        let err = result.expect("wait outlived its retry budget").unwrap_err();
        assert!(matches!(
            err,
            TftpError::RetriesExhausted {
                block: 1,
                attempts: 2,
                ..
            }
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn judge_decides_the_outcome() {
        let Harness {
            mut link,
            peer,
            link_addr,
        } = harness().await;
        let outstanding = encode_ack(7);

        peer.send_to(&encode_ack(1), link_addr).await.unwrap();
        peer.send_to(&encode_ack(2), link_addr).await.unwrap();
        peer.send_to(&encode_ack(3), link_addr).await.unwrap();

        let accepted = link
            .await_reply(&outstanding, awaiting(5), |packet| match packet {
                Packet::Ack { block: 1 } => Verdict::Retransmit,
                Packet::Ack { block: 2 } => Verdict::Reply(encode_ack(99)),
                Packet::Ack { block } => Verdict::Accept(block),
                _ => Verdict::Ignore,
            })
            .await
            .unwrap();
        assert_eq!(accepted, 3);

        let mut buf = [0u8; 16];
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], &outstanding[..]);
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], &encode_ack(99)[..]);
    }
}
