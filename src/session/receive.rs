//! RECEIVING direction: collect an upload, commit it, then dally.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, info};

use super::link::{Awaiting, Link, Verdict};
use super::Progress;
use crate::config::TransferPolicy;
use crate::packet::{encode_ack, Packet};
use crate::storage::Storage;
use crate::transport::Transport;
use crate::types::{next_block, Result, TftpError, BLOCK_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    /// Ack(0) not yet answered by DATA 1
    AwaitingFirstData,
    Receiving,
    /// The terminal block arrived; content is being written to storage
    Committing,
    /// Committed; still answering duplicates of the final block
    Dallying,
    Done,
    Aborted,
}

pub(crate) struct ReceiveMachine {
    state: ReceiveState,
    filename: String,
    storage: Arc<dyn Storage>,
    expected_block: u16,
    content: BytesMut,
    last_ack: Bytes,
    final_block: Option<u16>,
    policy: TransferPolicy,
}

impl ReceiveMachine {
    pub(crate) fn new(filename: String, storage: Arc<dyn Storage>, policy: TransferPolicy) -> Self {
        Self {
            state: ReceiveState::AwaitingFirstData,
            filename,
            storage,
            expected_block: 1,
            content: BytesMut::new(),
            last_ack: encode_ack(0),
            final_block: None,
            policy,
        }
    }

    pub(crate) fn state(&self) -> ReceiveState {
        self.state
    }

    pub(crate) fn expected_block(&self) -> u16 {
        self.expected_block
    }

    /// Bytes accepted so far and not yet committed.
    pub(crate) fn buffered(&self) -> usize {
        self.content.len()
    }

    /// Accept one block, or, once committed, run the whole dallying period.
    pub(crate) async fn advance<T: Transport>(&mut self, link: &mut Link<T>) -> Result<Progress> {
        let step = match self.state {
            ReceiveState::Done => return Ok(Progress::Finished),
            ReceiveState::Aborted => return Err(TftpError::Aborted),
            ReceiveState::Dallying => return Ok(self.dally(link).await),
            ReceiveState::AwaitingFirstData => match link.send(&self.last_ack).await {
                Ok(()) => self.receive_block(link).await,
                Err(e) => Err(e),
            },
            ReceiveState::Receiving | ReceiveState::Committing => self.receive_block(link).await,
        };

        if step.is_err() {
            self.state = ReceiveState::Aborted;
        }
        step
    }

    async fn receive_block<T: Transport>(&mut self, link: &mut Link<T>) -> Result<Progress> {
        let expected = self.expected_block;
        let awaiting = Awaiting {
            block: expected,
            terminal: false,
            limit: self.policy.max_retries,
        };
        let payload = link
            .await_reply(&self.last_ack, awaiting, |packet| match packet {
                Packet::Data { block, payload } if block == expected => Verdict::Accept(payload),
                Packet::Data { block, .. } if block < expected => {
                    debug!("Duplicate DATA {}, re-acknowledging", block);
                    Verdict::Reply(encode_ack(block))
                }
                Packet::Data { block, .. } => Verdict::Fail(TftpError::BlockGap {
                    received: block,
                    expected,
                }),
                other => {
                    debug!("Ignoring {:?} while awaiting DATA {}", other.opcode(), expected);
                    Verdict::Ignore
                }
            })
            .await?;

        self.content.extend_from_slice(&payload);
        self.last_ack = encode_ack(expected);

        if payload.len() < BLOCK_SIZE {
            self.state = ReceiveState::Committing;
            let contents = self.content.split().freeze();
            let size = contents.len();
            self.storage.write_all(&self.filename, contents).await?;
            info!("Committed {} bytes to {}", size, self.filename);

            link.send(&self.last_ack).await?;
            self.final_block = Some(expected);
            self.expected_block = expected.saturating_add(1);
            self.state = ReceiveState::Dallying;
            return Ok(Progress::Continue);
        }

        link.send(&self.last_ack).await?;
        self.expected_block = next_block(expected)?;
        self.state = ReceiveState::Receiving;
        Ok(Progress::Continue)
    }

    /// Answer duplicates of the final block until the peer goes quiet.
    ///
    /// The content is already committed, so nothing here can fail the
    /// transfer.
    async fn dally<T: Transport>(&mut self, link: &mut Link<T>) -> Progress {
        let final_block = self.final_block.unwrap_or(0);
        // Every packet, answered or not, uses up one round.
        for _ in 0..self.policy.max_dally_replies {
            match link.recv_from_peer(self.policy.dally_timeout).await {
                Ok(None) => break,
                Ok(Some(Packet::Data { block, .. })) if block <= final_block => {
                    debug!("Duplicate DATA {} while dallying, re-acknowledging", block);
                    if let Err(e) = link.send(&encode_ack(block)).await {
                        debug!("Could not re-acknowledge while dallying: {}", e);
                        break;
                    }
                }
                Ok(Some(other)) => {
                    debug!("Ignoring {:?} while dallying", other.opcode());
                }
                Err(e) => {
                    debug!("Dallying ended early: {}", e);
                    break;
                }
            }
        }
        self.state = ReceiveState::Done;
        Progress::Finished
    }
}
