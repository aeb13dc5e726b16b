//! Socket halves wrapped with the ring buffers the codec runs on.

use std::io;

use bytes::Bytes;
use oac_proto::codec::{self, MAX_FIXED_FRAME_SIZE};
use oac_proto::{CodecError, FixedBuffer, Message, RingBuffer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use crate::error::ProtocolError;

pub(crate) struct FrameReader {
    reader: OwnedReadHalf,
    ring: RingBuffer,
    scratch: Box<[u8]>,
}

impl FrameReader {
    pub fn new(reader: OwnedReadHalf, capacity: usize) -> Self {
        let capacity = capacity.max(MAX_FIXED_FRAME_SIZE);
        Self {
            reader,
            ring: RingBuffer::new(capacity),
            scratch: vec![0u8; capacity].into_boxed_slice(),
        }
    }

    /// Reads whatever the socket has into the ring. `Ok(0)` means EOF.
    ///
    /// Cancel safe: bytes are only moved into the ring after the read completes.
    pub async fn fill(&mut self) -> io::Result<usize> {
        let room = self.ring.available_for_write().min(self.scratch.len());
        if room == 0 {
            return Err(io::Error::new(io::ErrorKind::Other, "receive buffer full"));
        }
        let n = self.reader.read(&mut self.scratch[..room]).await?;
        self.ring.write(&self.scratch[..n]);
        Ok(n)
    }

    /// Decodes the next whole message, or `Ok(None)` until more bytes arrive.
    pub fn next_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        if self.ring.is_empty() {
            return Ok(None);
        }
        self.ring.set_mark();
        match codec::decode(&mut self.ring) {
            Ok(msg) => {
                self.ring.unset_mark();
                Ok(Some(msg))
            }
            Err(e) if e.is_incomplete() => {
                self.ring.reset();
                if self.ring.available_for_write() == 0 {
                    return Err(ProtocolError::ReceiveBufferOverflow(self.ring.capacity()));
                }
                Ok(None)
            }
            Err(e) => {
                self.ring.reset();
                debug!("wire: undecodable input: {}", hex::encode(self.ring.peek_all()));
                Err(e.into())
            }
        }
    }
}

pub(crate) struct FrameWriter {
    writer: OwnedWriteHalf,
    ring: RingBuffer,
    frame: FixedBuffer,
    scratch: Box<[u8]>,
}

impl FrameWriter {
    pub fn new(writer: OwnedWriteHalf, capacity: usize) -> Self {
        let capacity = capacity.max(MAX_FIXED_FRAME_SIZE);
        Self {
            writer,
            ring: RingBuffer::new(capacity),
            frame: FixedBuffer::new(capacity),
            scratch: vec![0u8; capacity].into_boxed_slice(),
        }
    }

    /// Encodes `msg` into a standalone frame. Messages larger than the send
    /// buffer are refused here, before anything reaches the socket.
    pub fn stage(&mut self, msg: &Message) -> Result<Bytes, CodecError> {
        self.frame.clear();
        let res = codec::encode(msg, &mut self.frame);
        if res.is_err() {
            self.frame.clear();
        }
        res.map(|_| self.frame.take())
    }

    pub async fn transmit(&mut self, frame: &[u8]) -> io::Result<()> {
        let mut offset = 0;
        while offset < frame.len() {
            offset += self.ring.write(&frame[offset..]);
            while !self.ring.is_empty() {
                let n = self.ring.read(&mut self.scratch);
                self.writer.write_all(&self.scratch[..n]).await?;
            }
        }
        Ok(())
    }

    pub async fn send(&mut self, msg: &Message) -> Result<(), crate::CommunicationError> {
        let frame = self.stage(msg).map_err(ProtocolError::from)?;
        self.transmit(&frame).await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        if let Err(e) = self.writer.shutdown().await {
            debug!("wire: shutdown: {}", e);
        }
    }
}
