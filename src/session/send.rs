//! SENDING direction: stream a file to the peer one acknowledged block at a time.

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tracing::debug;

use super::link::{Awaiting, Link, Verdict};
use super::Progress;
use crate::config::TransferPolicy;
use crate::packet::Packet;
use crate::storage::ByteSource;
use crate::transport::Transport;
use crate::types::{next_block, Result, TftpError, BLOCK_SIZE, MAX_DATA_PACKET_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    /// Nothing sent yet
    AwaitingFirstBlock,
    /// The previous block was acknowledged; the next one is ready to go out
    Streaming,
    /// A block is in flight
    AwaitingAck,
    /// The terminal block was acknowledged
    Done,
    Aborted,
}

pub(crate) struct SendMachine {
    state: SendState,
    source: ByteSource,
    current_block: u16,
    last_sent: Bytes,
    policy: TransferPolicy,
}

impl SendMachine {
    pub(crate) fn new(source: ByteSource, policy: TransferPolicy) -> Self {
        Self {
            state: SendState::AwaitingFirstBlock,
            source,
            current_block: 1,
            last_sent: Bytes::new(),
            policy,
        }
    }

    pub(crate) fn state(&self) -> SendState {
        self.state
    }

    /// Block that is in flight, or will be sent next.
    pub(crate) fn current_block(&self) -> u16 {
        self.current_block
    }

    /// Send one block and wait until the peer acknowledges it.
    pub(crate) async fn advance<T: Transport>(&mut self, link: &mut Link<T>) -> Result<Progress> {
        match self.state {
            SendState::Done => return Ok(Progress::Finished),
            SendState::Aborted => return Err(TftpError::Aborted),
            SendState::AwaitingFirstBlock | SendState::Streaming | SendState::AwaitingAck => {}
        }

        match self.exchange_block(link).await {
            Ok(progress) => Ok(progress),
            Err(e) => {
                self.state = SendState::Aborted;
                Err(e)
            }
        }
    }

    async fn exchange_block<T: Transport>(&mut self, link: &mut Link<T>) -> Result<Progress> {
        // A retried advance after AwaitingAck resends what is in flight
        // instead of consuming more of the source.
        if self.state != SendState::AwaitingAck {
            let payload = self.read_block().await?;
            self.last_sent = Packet::Data {
                block: self.current_block,
                payload,
            }
            .encode()?;
            self.state = SendState::AwaitingAck;
        }

        let terminal = self.last_sent.len() < MAX_DATA_PACKET_LEN;
        link.send(&self.last_sent).await?;

        let expected = self.current_block;
        let awaiting = Awaiting {
            block: expected,
            terminal,
            limit: self.policy.retry_limit(terminal),
        };
        link.await_reply(&self.last_sent, awaiting, |packet| match packet {
            Packet::Ack { block } if block == expected => Verdict::Accept(()),
            Packet::Ack { block } if block < expected => {
                debug!("Stale ACK {} while block {} is in flight", block, expected);
                Verdict::Retransmit
            }
            Packet::Ack { block } => Verdict::Fail(TftpError::AckAhead {
                acked: block,
                expected,
            }),
            other => {
                debug!("Ignoring {:?} while awaiting ACK {}", other.opcode(), expected);
                Verdict::Ignore
            }
        })
        .await?;

        if terminal {
            self.state = SendState::Done;
            return Ok(Progress::Finished);
        }
        self.current_block = next_block(self.current_block)?;
        self.state = SendState::Streaming;
        Ok(Progress::Continue)
    }

    /// Read until a full block or the end of the source.
    async fn read_block(&mut self) -> Result<Bytes> {
        let mut block = vec![0u8; BLOCK_SIZE];
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            let n = self.source.read(&mut block[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        block.truncate(filled);
        Ok(Bytes::from(block))
    }
}
