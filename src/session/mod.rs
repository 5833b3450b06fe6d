//! Transfer sessions.
//!
//! A [`Session`] is one client's transfer: a [`Link`] to the client's TID
//! plus the state machine for its direction. The owning task calls
//! [`Session::advance`] until it reports [`Progress::Finished`] or fails;
//! nothing outside the session mutates its state.
//!
//! One call to `advance` is one full block exchange. For a receiving
//! session that has committed its upload, one call is the whole dallying
//! period.

mod link;
mod receive;
mod send;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

pub use link::{Awaiting, Link, Verdict};
pub use receive::ReceiveState;
pub use send::SendState;

use crate::config::TransferPolicy;
use crate::storage::{ByteSource, Storage};
use crate::transport::Transport;
use crate::types::{Result, Role, TransferId};
use receive::ReceiveMachine;
use send::SendMachine;

/// Outcome of one successful [`Session::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// More exchanges remain
    Continue,
    /// The transfer is over and the session can be dropped
    Finished,
}

/// Where a session's state machine currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Sending(SendState),
    Receiving(ReceiveState),
}

enum Machine {
    Send(SendMachine),
    Receive(ReceiveMachine),
}

pub struct Session<T> {
    filename: String,
    link: Link<T>,
    machine: Machine,
}

impl<T: Transport> Session<T> {
    /// A session that streams `source` to `tid`.
    pub fn sending(
        tid: TransferId,
        filename: impl Into<String>,
        transport: T,
        source: ByteSource,
        policy: TransferPolicy,
    ) -> Self {
        Self {
            filename: filename.into(),
            link: Link::new(transport, tid, policy.timeout),
            machine: Machine::Send(SendMachine::new(source, policy)),
        }
    }

    /// A session that accepts an upload from `tid` and commits it to `storage`.
    pub fn receiving(
        tid: TransferId,
        filename: impl Into<String>,
        transport: T,
        storage: Arc<dyn Storage>,
        policy: TransferPolicy,
    ) -> Self {
        let filename = filename.into();
        Self {
            link: Link::new(transport, tid, policy.timeout),
            machine: Machine::Receive(ReceiveMachine::new(filename.clone(), storage, policy)),
            filename,
        }
    }

    pub fn tid(&self) -> TransferId {
        self.link.peer()
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn role(&self) -> Role {
        match self.machine {
            Machine::Send(_) => Role::Sending,
            Machine::Receive(_) => Role::Receiving,
        }
    }

    /// The session's own endpoint.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.link.local_addr()
    }

    pub fn state(&self) -> SessionState {
        match &self.machine {
            Machine::Send(m) => SessionState::Sending(m.state()),
            Machine::Receive(m) => SessionState::Receiving(m.state()),
        }
    }

    /// The block in flight when sending, the block expected next when receiving.
    pub fn block(&self) -> u16 {
        match &self.machine {
            Machine::Send(m) => m.current_block(),
            Machine::Receive(m) => m.expected_block(),
        }
    }

    /// True once the terminal block has been acknowledged (sending) or
    /// committed (receiving).
    pub fn is_completed(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Sending(SendState::Done)
                | SessionState::Receiving(ReceiveState::Dallying | ReceiveState::Done)
        )
    }

    /// Run one protocol step. Any error leaves the session aborted.
    pub async fn advance(&mut self) -> Result<Progress> {
        match &mut self.machine {
            Machine::Send(m) => m.advance(&mut self.link).await,
            Machine::Receive(m) => m.advance(&mut self.link).await,
        }
    }

    /// Advance until the transfer finishes or fails.
    pub async fn run(mut self) -> Result<()> {
        loop {
            if self.advance().await? == Progress::Finished {
                return Ok(());
            }
        }
    }

    /// Payload bytes held for a receiving session that has not committed yet.
    pub fn buffered(&self) -> usize {
        match &self.machine {
            Machine::Send(_) => 0,
            Machine::Receive(m) => m.buffered(),
        }
    }
}
