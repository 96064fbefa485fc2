//! Internal buffer for the stream port.

use super::{RecvError, SendError};
use std::io;

/// Size of a single read from the underlying stream.
const READ_CHUNK: usize = 16 * 1024;

/// Growable buffer used to reassemble values on receive and to hold
/// the unsent tail of a value on transmit.
pub struct IOBuf {
    /// Valid data (possibly none) is `buf[start..]`.
    buf: Vec<u8>,
    start: usize,
}

impl IOBuf {
    pub fn new() -> IOBuf {
        IOBuf {
            buf: Vec::with_capacity(READ_CHUNK),
            start: 0,
        }
    }

    pub fn empty(&self) -> bool {
        self.start == self.buf.len()
    }

    pub fn size(&self) -> usize {
        self.buf.len() - self.start
    }

    pub fn data(&self) -> &[u8] {
        &self.buf[self.start..]
    }

    /// Discards `len` bytes off the beginning of the contained data.
    pub fn consume(&mut self, len: usize) {
        self.start += len.min(self.size());
        if self.empty() {
            self.flush();
        }
    }

    pub fn flush(&mut self) {
        self.buf.clear();
        self.start = 0;
    }

    fn compact(&mut self) {
        if self.start != 0 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
    }

    /// Reads one chunk from `reader`. `NotReady` means the reader would block.
    pub fn refill<T: io::Read>(&mut self, reader: &mut T) -> Result<(), RecvError> {
        self.compact();
        let mut chunk = [0u8; READ_CHUNK];
        match reader.read(&mut chunk) {
            Ok(0) => Err(RecvError::Disconnected),
            Ok(size) => {
                self.buf.extend_from_slice(&chunk[..size]);
                Ok(())
            }
            Err(e) => match e.kind() {
                io::ErrorKind::WouldBlock => Err(RecvError::NotReady),
                io::ErrorKind::Interrupted => Ok(()),
                _ => Err(RecvError::IO(e)),
            },
        }
    }

    pub fn add_data(&mut self, data: &[u8]) {
        self.compact();
        self.buf.extend_from_slice(data);
    }

    /// Writes as much of the contained data as possible to `writer`.
    pub fn drain<T: io::Write>(&mut self, writer: &mut T) -> Result<(), SendError> {
        if self.empty() {
            return Ok(());
        }
        match writer.write(self.data()) {
            Ok(size) => {
                self.consume(size);
                if self.empty() {
                    Ok(())
                } else {
                    Err(SendError::MustDrain)
                }
            }
            Err(e) => match e.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {
                    Err(SendError::MustDrain)
                }
                _ => Err(SendError::IO(e)),
            },
        }
    }
}
