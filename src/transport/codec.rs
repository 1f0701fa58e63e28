//! Concatenated-JSON framing over an async byte stream.
//!
//! Each side emits one JSON object per message with no length prefix or
//! delimiter; the reader finds object boundaries with a streaming
//! deserializer, buffering whatever the socket hands it. A clean EOF
//! between frames surfaces as [`Error::Closed`], which callers treat
//! differently from a malformed frame.

use bytes::{Buf, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("could not encode message: {0}")]
    Encode(serde_json::Error),
    #[error("could not decode message: {0}")]
    Decode(serde_json::Error),
    #[error("connection closed")]
    Closed,
}

/// Decodes a stream of concatenated JSON objects.
pub struct Reader<R> {
    inner: R,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> Reader<R> {
    pub fn new(inner: R) -> Self {
        Reader {
            inner,
            buffer: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Read the next message, pulling more bytes from the stream until one
    /// complete JSON object is available.
    pub async fn read<T: DeserializeOwned>(&mut self) -> Result<T, Error> {
        loop {
            let (value, consumed) = {
                let mut stream =
                    serde_json::Deserializer::from_slice(&self.buffer).into_iter::<T>();
                match stream.next() {
                    Some(Ok(value)) => (Some(value), stream.byte_offset()),
                    Some(Err(e)) if e.is_eof() => (None, 0),
                    Some(Err(e)) => return Err(Error::Decode(e)),
                    None => (None, 0),
                }
            };
            if let Some(value) = value {
                self.buffer.advance(consumed);
                return Ok(value);
            }

            if self.inner.read_buf(&mut self.buffer).await? == 0 {
                // EOF between frames closes cleanly; EOF inside a frame is
                // a decode failure.
                if self.buffer.iter().all(|b| b.is_ascii_whitespace()) {
                    return Err(Error::Closed);
                }
                return match serde_json::from_slice::<T>(&self.buffer) {
                    Ok(value) => {
                        self.buffer.clear();
                        Ok(value)
                    }
                    Err(e) => Err(Error::Decode(e)),
                };
            }
        }
    }
}

/// Encodes messages as concatenated JSON objects.
pub struct Writer<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> Writer<W> {
    pub fn new(inner: W) -> Self {
        Writer { inner }
    }

    pub async fn write<T: Serialize>(&mut self, message: &T) -> Result<(), Error> {
        let encoded = serde_json::to_vec(message).map_err(Error::Encode)?;
        self.inner.write_all(&encoded).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ClientMessage, MessageType};
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn round_trip() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = Writer::new(client);
        let mut reader = Reader::new(server);

        let sent = ClientMessage::successful(MessageType::Register, "");
        writer.write(&sent).await.unwrap();

        let received: ClientMessage = reader.read().await.unwrap();
        assert!(received.is_successful());
        assert_eq!(received.message_type, MessageType::Register);
    }

    #[tokio::test]
    async fn finds_boundaries_in_concatenated_frames() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = Reader::new(server);

        // Two frames in a single write, no separator.
        client
            .write_all(
                br#"{"Type":"X","Status":"Successful","Id":"1"}{"Type":"Y","Status":"Failed","Id":"2"}"#,
            )
            .await
            .unwrap();

        let first: ClientMessage = reader.read().await.unwrap();
        let second: ClientMessage = reader.read().await.unwrap();
        assert_eq!(first.id, "1");
        assert_eq!(second.id, "2");
    }

    #[tokio::test]
    async fn reassembles_split_frames() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = Reader::new(server);

        let read = tokio::spawn(async move { reader.read::<ClientMessage>().await });

        client
            .write_all(br#"{"Type":"X","Sta"#)
            .await
            .unwrap();
        tokio::task::yield_now().await;
        client
            .write_all(br#"tus":"Successful","Id":"42"}"#)
            .await
            .unwrap();

        let received = read.await.unwrap().unwrap();
        assert_eq!(received.id, "42");
    }

    #[tokio::test]
    async fn clean_eof_reads_as_closed() {
        let (client, server) = tokio::io::duplex(1024);
        let mut reader = Reader::new(server);
        drop(client);

        match reader.read::<ClientMessage>().await {
            Err(Error::Closed) => {}
            other => panic!("expected Closed, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn truncated_frame_reads_as_decode_error() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = Reader::new(server);

        client.write_all(br#"{"Type":"X","#).await.unwrap();
        drop(client);

        match reader.read::<ClientMessage>().await {
            Err(Error::Decode(_)) => {}
            other => panic!("expected Decode, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn garbage_reads_as_decode_error() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = Reader::new(server);

        client.write_all(b"not json at all").await.unwrap();

        match reader.read::<ClientMessage>().await {
            Err(Error::Decode(_)) => {}
            other => panic!("expected Decode, got {:?}", other.map(|_| ())),
        }
    }
}
