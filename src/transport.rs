//! Datagram transport used by transfer sessions.
//!
//! [`Transport`] is the send/receive capability a session talks through.
//! It is implemented for `tokio::net::UdpSocket`; [`LossyTransport`] wraps
//! any transport and drops outbound datagrams at random, which is how the
//! retry engine is exercised against an unreliable network.

use std::io;
use std::net::SocketAddr;

use futures::future::{BoxFuture, FutureExt};
use rand::Rng;
use tokio::net::UdpSocket;
use tracing::debug;

/// A datagram endpoint.
pub trait Transport: Send + Sync {
    /// Send one datagram to `peer`.
    fn send_to<'a>(&'a self, datagram: &'a [u8], peer: SocketAddr) -> BoxFuture<'a, io::Result<()>>;

    /// Wait for the next datagram, returning its length and source.
    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<(usize, SocketAddr)>>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Transport for UdpSocket {
    fn send_to<'a>(&'a self, datagram: &'a [u8], peer: SocketAddr) -> BoxFuture<'a, io::Result<()>> {
        async move {
            UdpSocket::send_to(self, datagram, peer).await?;
            Ok(())
        }
        .boxed()
    }

    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<(usize, SocketAddr)>> {
        UdpSocket::recv_from(self, buf).boxed()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Drops each outbound datagram with a fixed probability.
#[derive(Debug)]
pub struct LossyTransport<T> {
    inner: T,
    loss_probability: f64,
}

impl<T: Transport> LossyTransport<T> {
    /// `loss_probability` is clamped to `[0, 1]`; NaN means no loss.
    pub fn new(inner: T, loss_probability: f64) -> Self {
        let loss_probability = if loss_probability.is_nan() {
            0.0
        } else {
            loss_probability.clamp(0.0, 1.0)
        };
        Self {
            inner,
            loss_probability,
        }
    }

    pub fn loss_probability(&self) -> f64 {
        self.loss_probability
    }

    fn should_drop(&self) -> bool {
        self.loss_probability > 0.0 && rand::thread_rng().gen_bool(self.loss_probability)
    }
}

impl<T: Transport> Transport for LossyTransport<T> {
    fn send_to<'a>(&'a self, datagram: &'a [u8], peer: SocketAddr) -> BoxFuture<'a, io::Result<()>> {
        if self.should_drop() {
            debug!("Dropped {} byte datagram to {}", datagram.len(), peer);
            return futures::future::ready(Ok(())).boxed();
        }
        self.inner.send_to(datagram, peer)
    }

    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<(usize, SocketAddr)>> {
        self.inner.recv_from(buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
