//! Frame reassembly over an async byte stream
//!
//! The reader keeps a carry-over buffer across socket reads and yields one
//! complete frame at a time. Oversized frames are skipped without buffering
//! their payload; envelope frames are decrypted in place when a cipher
//! context is installed, and a frame that fails to decrypt is dropped with
//! a log line rather than killing the session. Socket reads are sliced by a
//! timeout so the caller can observe shutdown between frames.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::warn;

use crate::crypto::SessionCipher;
use crate::protocol::{command, flags, timeouts, HEADER_SIZE};

const READ_CHUNK: usize = 16 * 1024;

/// One reassembled frame as delivered to the receiver
#[derive(Debug, PartialEq)]
pub struct Frame {
    /// Complete frame bytes (header included), decrypted if enveloped
    pub bytes: Vec<u8>,
    /// Whether the frame arrived inside an encryption envelope
    pub encrypted: bool,
}

impl Frame {
    pub fn code(&self) -> u16 {
        u16::from_be_bytes([self.bytes[0], self.bytes[1]])
    }

    pub fn flags(&self) -> u16 {
        u16::from_be_bytes([self.bytes[2], self.bytes[3]])
    }

    pub fn request_id(&self) -> u32 {
        u32::from_be_bytes([self.bytes[8], self.bytes[9], self.bytes[10], self.bytes[11]])
    }

    pub fn is_binary(&self) -> bool {
        self.flags() & flags::BINARY != 0
    }

    pub fn is_end_of_file(&self) -> bool {
        self.flags() & flags::END_OF_FILE != 0
    }

    /// Raw payload of a binary frame; the count word carries its length
    pub fn binary_payload(&self) -> &[u8] {
        let declared = u32::from_be_bytes([
            self.bytes[12],
            self.bytes[13],
            self.bytes[14],
            self.bytes[15],
        ]) as usize;
        let avail = self.bytes.len() - HEADER_SIZE;
        &self.bytes[HEADER_SIZE..HEADER_SIZE + declared.min(avail)]
    }
}

/// Outcome of one read attempt
#[derive(Debug, PartialEq)]
pub enum FrameEvent {
    Frame(Frame),
    /// Read slice elapsed with no complete frame; check the stop signal
    Idle,
    /// Peer closed the connection
    Eof,
}

pub struct FrameReader {
    buf: Vec<u8>,
    /// Remaining byte count of an oversized frame being discarded unread
    skip: usize,
    max_frame_size: usize,
    read_slice: Duration,
}

impl FrameReader {
    pub fn new(max_frame_size: usize) -> Self {
        FrameReader {
            buf: Vec::new(),
            skip: 0,
            max_frame_size,
            read_slice: Duration::from_millis(timeouts::READ_SLICE_MS),
        }
    }

    #[cfg(test)]
    fn with_read_slice(max_frame_size: usize, read_slice: Duration) -> Self {
        FrameReader {
            read_slice,
            ..FrameReader::new(max_frame_size)
        }
    }

    /// Read until one complete frame is available, the read slice elapses,
    /// or the stream ends. Decryption happens here so length validation
    /// downstream always sees clear frames.
    pub async fn next_frame<R>(
        &mut self,
        stream: &mut R,
        cipher: Option<&SessionCipher>,
    ) -> Result<FrameEvent>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            // Drop bytes belonging to a frame we decided not to keep
            if self.skip > 0 {
                let n = self.skip.min(self.buf.len());
                self.buf.drain(..n);
                self.skip -= n;
            }

            if self.skip == 0 && self.buf.len() >= 8 {
                let declared =
                    u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]])
                        as usize;
                if declared < HEADER_SIZE {
                    // Cannot resynchronize framing after a nonsense length
                    bail!("frame declares impossible size {} bytes", declared);
                }
                if declared > self.max_frame_size {
                    warn!(
                        size = declared,
                        max = self.max_frame_size,
                        "discarding oversized frame"
                    );
                    self.skip = declared;
                    continue;
                }
                if self.buf.len() >= declared {
                    let frame: Vec<u8> = self.buf.drain(..declared).collect();
                    let code = u16::from_be_bytes([frame[0], frame[1]]);
                    if code == command::ENCRYPTED_FRAME {
                        let Some(ctx) = cipher else {
                            warn!("dropping encrypted frame: no cipher context installed");
                            continue;
                        };
                        match ctx.open_frame(&frame) {
                            Ok(inner) => {
                                if !check_inner_size(&inner) {
                                    continue;
                                }
                                return Ok(FrameEvent::Frame(Frame {
                                    bytes: inner,
                                    encrypted: true,
                                }));
                            }
                            Err(e) => {
                                // Recoverable: drop this frame only
                                warn!(error = %e, "unable to decrypt received frame");
                                continue;
                            }
                        }
                    }
                    return Ok(FrameEvent::Frame(Frame {
                        bytes: frame,
                        encrypted: false,
                    }));
                }
            }

            match timeout(self.read_slice, self.fill(stream)).await {
                Ok(Ok(0)) => return Ok(FrameEvent::Eof),
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => return Err(e),
                Err(_) => return Ok(FrameEvent::Idle),
            }
        }
    }

    async fn fill<R>(&mut self, stream: &mut R) -> Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        let mut chunk = [0u8; READ_CHUNK];
        let n = stream
            .read(&mut chunk)
            .await
            .context("socket read failed")?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }
}

/// A decrypted inner frame must describe exactly its own length
fn check_inner_size(frame: &[u8]) -> bool {
    let declared = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
    if declared != frame.len() {
        warn!(
            declared,
            actual = frame.len(),
            "inner frame size mismatch after decryption"
        );
        return false;
    }
    true
}

/// Write one complete frame with a size-scaled deadline
pub async fn write_frame<W>(stream: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let deadline = timeouts::write_deadline(frame.len());
    match timeout(deadline, stream.write_all(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e).context("socket write failed"),
        Err(_) => bail!("frame write timeout ({} ms)", deadline.as_millis()),
    }
}

/// Build a raw/binary frame; the count word carries the payload length
pub fn build_raw_frame(code: u16, extra_flags: u16, request_id: u32, payload: &[u8]) -> Vec<u8> {
    let total = HEADER_SIZE + payload.len();
    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&code.to_be_bytes());
    buf.extend_from_slice(&(flags::BINARY | extra_flags).to_be_bytes());
    buf.extend_from_slice(&(total as u32).to_be_bytes());
    buf.extend_from_slice(&request_id.to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Handshake;
    use crate::message::Message;
    use crate::protocol::field;

    fn test_reader() -> FrameReader {
        FrameReader::with_read_slice(1024 * 1024, Duration::from_millis(50))
    }

    async fn expect_frame(reader: &mut FrameReader, stream: &mut tokio::io::DuplexStream) -> Frame {
        match reader.next_frame(stream, None).await.unwrap() {
            FrameEvent::Frame(f) => f,
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reassembles_across_partial_writes() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let frame = Message::completion(3, 0).encode();

        let writer = tokio::spawn(async move {
            for chunk in frame.chunks(5) {
                client.write_all(chunk).await.unwrap();
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            client
        });

        let mut reader = test_reader();
        let got = loop {
            match reader.next_frame(&mut server, None).await.unwrap() {
                FrameEvent::Frame(f) => break f,
                FrameEvent::Idle => continue,
                FrameEvent::Eof => panic!("eof"),
            }
        };
        assert_eq!(got.bytes, Message::completion(3, 0).encode());
        assert!(!got.encrypted);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_two_frames_in_one_write() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let f1 = Message::new(1, 1).encode();
        let f2 = Message::new(2, 2).encode();
        let mut both = f1.clone();
        both.extend_from_slice(&f2);
        client.write_all(&both).await.unwrap();

        let mut reader = test_reader();
        assert_eq!(expect_frame(&mut reader, &mut server).await.bytes, f1);
        assert_eq!(expect_frame(&mut reader, &mut server).await.bytes, f2);
    }

    #[tokio::test]
    async fn test_oversized_frame_skipped_without_buffering() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let mut reader = FrameReader::with_read_slice(64, Duration::from_millis(50));

        // Header declares 1000 bytes, far over the 64-byte cap
        let mut oversized = Vec::new();
        oversized.extend_from_slice(&0x0001u16.to_be_bytes());
        oversized.extend_from_slice(&0u16.to_be_bytes());
        oversized.extend_from_slice(&1000u32.to_be_bytes());
        oversized.extend_from_slice(&7u32.to_be_bytes());
        oversized.extend_from_slice(&0u32.to_be_bytes());
        oversized.resize(1000, 0xAA);
        client.write_all(&oversized).await.unwrap();

        let good = Message::new(9, 9).encode();
        client.write_all(&good).await.unwrap();

        // The oversized frame is silently discarded; the next frame survives
        let got = expect_frame(&mut reader, &mut server).await;
        assert_eq!(got.bytes, good);
    }

    #[tokio::test]
    async fn test_impossible_size_is_fatal() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let mut junk = vec![0u8; 16];
        junk[4..8].copy_from_slice(&4u32.to_be_bytes()); // size < header
        client.write_all(&junk).await.unwrap();

        let mut reader = test_reader();
        assert!(reader.next_frame(&mut server, None).await.is_err());
    }

    #[tokio::test]
    async fn test_idle_then_frame() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let mut reader = FrameReader::with_read_slice(1024, Duration::from_millis(10));
        assert_eq!(
            reader.next_frame(&mut server, None).await.unwrap(),
            FrameEvent::Idle
        );
        let frame = Message::new(4, 4).encode();
        client.write_all(&frame).await.unwrap();
        assert_eq!(expect_frame(&mut reader, &mut server).await.bytes, frame);
    }

    #[tokio::test]
    async fn test_eof() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let mut reader = test_reader();
        assert_eq!(
            reader.next_frame(&mut server, None).await.unwrap(),
            FrameEvent::Eof
        );
    }

    #[tokio::test]
    async fn test_encrypted_frame_round_trip() {
        let initiator = Handshake::initiate();
        let request = initiator.request_message(1);
        let peer = request.get_binary(field::PUBLIC_KEY).unwrap().to_vec();
        let (reply, server_cipher) = Handshake::respond(&peer, 1).unwrap();
        let client_cipher = initiator
            .complete(reply.get_binary(field::PUBLIC_KEY).unwrap())
            .unwrap();

        let (mut client, mut server) = tokio::io::duplex(4096);
        let inner = Message::completion(11, 0).encode();
        let envelope = client_cipher.seal_frame(&inner).unwrap();
        client.write_all(&envelope).await.unwrap();

        let mut reader = test_reader();
        let got = match reader
            .next_frame(&mut server, Some(&server_cipher))
            .await
            .unwrap()
        {
            FrameEvent::Frame(f) => f,
            other => panic!("expected frame, got {:?}", other),
        };
        assert!(got.encrypted);
        assert_eq!(got.bytes, inner);
    }

    #[tokio::test]
    async fn test_undecryptable_frame_dropped_session_survives() {
        let initiator = Handshake::initiate();
        let request = initiator.request_message(1);
        let peer = request.get_binary(field::PUBLIC_KEY).unwrap().to_vec();
        let (_reply, server_cipher) = Handshake::respond(&peer, 1).unwrap();

        let (mut client, mut server) = tokio::io::duplex(8192);
        // Garbage envelope: valid outer header, undecryptable body
        let mut bogus = Vec::new();
        bogus.extend_from_slice(&command::ENCRYPTED_FRAME.to_be_bytes());
        bogus.extend_from_slice(&0u16.to_be_bytes());
        bogus.extend_from_slice(&64u32.to_be_bytes());
        bogus.extend_from_slice(&0u32.to_be_bytes());
        bogus.extend_from_slice(&(64u32 - 28).to_be_bytes());
        bogus.resize(64, 0x55);
        client.write_all(&bogus).await.unwrap();

        let good = Message::new(6, 6).encode();
        client.write_all(&good).await.unwrap();

        let mut reader = test_reader();
        let got = match reader
            .next_frame(&mut server, Some(&server_cipher))
            .await
            .unwrap()
        {
            FrameEvent::Frame(f) => f,
            other => panic!("expected frame, got {:?}", other),
        };
        assert_eq!(got.bytes, good);
    }

    #[tokio::test]
    async fn test_raw_frame_payload() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let payload = b"chunk of file data";
        let frame = build_raw_frame(command::FILE_DATA, flags::END_OF_FILE, 12, payload);
        client.write_all(&frame).await.unwrap();

        let mut reader = test_reader();
        let got = expect_frame(&mut reader, &mut server).await;
        assert!(got.is_binary());
        assert!(got.is_end_of_file());
        assert_eq!(got.request_id(), 12);
        assert_eq!(got.binary_payload(), payload);
    }
}
