//! Byte staging buffers for the FlightVars connection.
//!
//! [`RingBuffer`] is the streaming circular buffer that sits between a socket
//! and the codec. It supports a read mark so a decoder can try to parse a whole
//! message and, when the bytes are not all there yet, rewind without losing
//! anything. [`FixedBuffer`] is the non-streaming variant used to stage a
//! single frame: a write either fits entirely or is refused.

use std::io;

use bytes::{Bytes, BytesMut};

use crate::error::BufferError;

/// Fixed-capacity circular byte buffer with independent read/write cursors.
///
/// While a mark is set, bytes read since the mark stay reserved: they cannot be
/// overwritten, so `available_for_read() + available_for_write()` equals the
/// capacity minus the bytes consumed since the mark. Without a mark the sum is
/// exactly the capacity.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    data: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
    len: usize,
    mark: Option<usize>,
    read_since_mark: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
            len: 0,
            mark: None,
            read_since_mark: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn available_for_read(&self) -> usize {
        self.len
    }

    pub fn available_for_write(&self) -> usize {
        self.capacity() - self.len - self.read_since_mark
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_marked(&self) -> bool {
        self.mark.is_some()
    }

    /// Copies as many bytes as fit and returns how many were taken.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.available_for_write());
        if n == 0 {
            return 0;
        }
        let cap = self.capacity();
        let first = n.min(cap - self.write_pos);
        self.data[self.write_pos..self.write_pos + first].copy_from_slice(&bytes[..first]);
        self.data[..n - first].copy_from_slice(&bytes[first..n]);
        self.write_pos = (self.write_pos + n) % cap;
        self.len += n;
        n
    }

    /// Moves up to `out.len()` bytes into `out` in FIFO order and returns the count.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len);
        if n == 0 {
            return 0;
        }
        let cap = self.capacity();
        let first = n.min(cap - self.read_pos);
        out[..first].copy_from_slice(&self.data[self.read_pos..self.read_pos + first]);
        out[first..n].copy_from_slice(&self.data[..n - first]);
        self.read_pos = (self.read_pos + n) % cap;
        self.len -= n;
        if self.mark.is_some() {
            self.read_since_mark += n;
        }
        n
    }

    /// Reads up to `max_len` bytes into a fresh vector.
    pub fn read_vec(&mut self, max_len: usize) -> Vec<u8> {
        let mut out = vec![0u8; max_len.min(self.len)];
        let n = self.read(&mut out);
        out.truncate(n);
        out
    }

    /// Copies the unread bytes without consuming them.
    pub fn peek_all(&self) -> Vec<u8> {
        let cap = self.capacity();
        (0..self.len).map(|i| self.data[(self.read_pos + i) % cap]).collect()
    }

    /// Remembers the current read cursor. Setting a new mark commits any
    /// reads made since the previous one.
    pub fn set_mark(&mut self) {
        self.mark = Some(self.read_pos);
        self.read_since_mark = 0;
    }

    /// Rewinds the read cursor to the mark and clears it. Every byte read
    /// since the mark becomes readable again. No-op without a mark.
    pub fn reset(&mut self) {
        if let Some(pos) = self.mark.take() {
            self.read_pos = pos;
            self.len += self.read_since_mark;
            self.read_since_mark = 0;
        }
    }

    /// Drops the mark, permanently committing reads made since it was set.
    pub fn unset_mark(&mut self) {
        self.mark = None;
        self.read_since_mark = 0;
    }

    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.len = 0;
        self.unset_mark();
    }
}

// `read` returning 0 on an empty buffer makes `read_exact` report
// `UnexpectedEof`, which the codec surfaces as an incomplete message.
impl io::Read for RingBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(RingBuffer::read(self, buf))
    }
}

impl io::Write for RingBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(RingBuffer::write(self, buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Bounded frame buffer: writes are all-or-nothing.
#[derive(Debug, Clone)]
pub struct FixedBuffer {
    buf: BytesMut,
    limit: usize,
}

impl FixedBuffer {
    pub fn new(limit: usize) -> Self {
        Self { buf: BytesMut::with_capacity(limit), limit }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.buf.len()
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<usize, BufferError> {
        if bytes.len() > self.remaining() {
            return Err(BufferError::CapacityExhausted {
                requested: bytes.len(),
                available: self.remaining(),
            });
        }
        self.buf.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Hands the staged bytes out and leaves the buffer empty.
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

impl io::Write for FixedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        FixedBuffer::write(self, buf).map_err(|e| io::Error::new(io::ErrorKind::WriteZero, e))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
