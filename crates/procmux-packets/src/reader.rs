use std::io::{ErrorKind, Read};

use bytes::BytesMut;

use crate::codec::{decode_packet, Packet, DEFAULT_MAX_PAYLOAD};
use crate::error::{PacketError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads complete packets from any `Read` stream.
///
/// Handles partial reads internally — callers always get complete packets.
pub struct PacketReader<T> {
    inner: T,
    buf: BytesMut,
    max_payload: usize,
}

impl<T: Read> PacketReader<T> {
    /// Create a packet reader with the default payload cap.
    pub fn new(inner: T) -> Self {
        Self::with_max_payload(inner, DEFAULT_MAX_PAYLOAD)
    }

    /// Create a packet reader with an explicit payload cap.
    pub fn with_max_payload(inner: T, max_payload: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            max_payload,
        }
    }

    /// Read the next complete packet (blocking).
    ///
    /// Returns `Err(PacketError::ConnectionClosed)` when EOF is reached.
    pub fn read_packet(&mut self) -> Result<(u32, Packet)> {
        loop {
            if let Some(packet) = decode_packet(&mut self.buf, self.max_payload)? {
                return Ok(packet);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(PacketError::Io(err)),
            };

            if read == 0 {
                return Err(PacketError::ConnectionClosed);
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}
