//! Newline-delimited JSON framing codec for the gossip mesh's wire protocol.
//!
//! One [`MeshMessage`] per line. A malformed line is reported to the caller
//! as [`ProtocolError::Malformed`] without closing the stream — per the
//! error-handling design, the session stays open and the caller simply
//! drops that line and reads the next one.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};

use crate::model::Belief;

/// The four message types exchanged over a gossip mesh TCP session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeshMessage {
    /// Mandatory first message on every session, carrying the sender's
    /// identity.
    Announce { node_id: String },
    /// A full Belief payload, either freshly produced or relayed with a
    /// decremented hop count.
    Belief {
        #[serde(flatten)]
        belief: Belief,
    },
    /// Request to play a chirp after `delay_s` on the responder's own
    /// deterministic frequency channel.
    AcousticPing {
        request_id: String,
        delay_s: f64,
        sample_rate: u32,
        freq_start: f64,
        freq_end: f64,
        chirp_duration: f64,
    },
    /// Acknowledgement of an `acoustic_ping`.
    AcousticPong {
        request_id: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Errors from reading/parsing the wire protocol.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reads newline-delimited [`MeshMessage`]s from an async byte stream.
pub struct FrameReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            lines: BufReader::new(inner).lines(),
        }
    }

    /// Reads and parses the next non-blank line.
    ///
    /// Returns `Ok(None)` on clean EOF (the peer closed the connection).
    /// Returns `Err(ProtocolError::Malformed(_))` for a line that isn't
    /// valid JSON or doesn't match any known message shape; the caller
    /// should log it and keep reading rather than tear down the session.
    pub async fn read_message(&mut self) -> Result<Option<MeshMessage>, ProtocolError> {
        loop {
            let line = self.lines.next_line().await?;
            let Some(line) = line else {
                return Ok(None);
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return serde_json::from_str::<MeshMessage>(trimmed)
                .map(Some)
                .map_err(|e| ProtocolError::Malformed(e.to_string()));
        }
    }
}

/// Writes [`MeshMessage`]s as newline-delimited JSON to an async byte
/// stream.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_message(&mut self, message: &MeshMessage) -> std::io::Result<()> {
        let mut line =
            serde_json::to_string(message).expect("MeshMessage always serializes to JSON");
        line.push('\n');
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.flush().await
    }

    /// Hands back the underlying writer, e.g. to fold it into a combined
    /// read/write session after a handshake write.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Belief;

    #[tokio::test]
    async fn round_trips_an_announce_message() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        writer
            .write_message(&MeshMessage::Announce {
                node_id: "node-a".into(),
            })
            .await
            .unwrap();

        let mut reader = FrameReader::new(server);
        let message = reader.read_message().await.unwrap().unwrap();
        match message {
            MeshMessage::Announce { node_id } => assert_eq!(node_id, "node-a"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn round_trips_a_belief_message() {
        let (client, server) = tokio::io::duplex(8192);
        let mut writer = FrameWriter::new(client);
        let mut belief = Belief::new("node-a", 100.0);
        belief.sequence_number = 7;
        writer
            .write_message(&MeshMessage::Belief { belief })
            .await
            .unwrap();

        let mut reader = FrameReader::new(server);
        match reader.read_message().await.unwrap().unwrap() {
            MeshMessage::Belief { belief } => {
                assert_eq!(belief.node_id, "node-a");
                assert_eq!(belief.sequence_number, 7);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn a_malformed_line_is_reported_without_closing_the_stream() {
        let (mut client, server) = tokio::io::duplex(4096);
        client.write_all(b"not json\n").await.unwrap();
        client
            .write_all(b"{\"type\":\"announce\",\"node_id\":\"node-b\"}\n")
            .await
            .unwrap();

        let mut reader = FrameReader::new(server);
        assert!(matches!(
            reader.read_message().await,
            Err(ProtocolError::Malformed(_))
        ));
        match reader.read_message().await.unwrap().unwrap() {
            MeshMessage::Announce { node_id } => assert_eq!(node_id, "node-b"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn eof_is_reported_as_none() {
        let (client, server) = tokio::io::duplex(4096);
        drop(client);
        let mut reader = FrameReader::new(server);
        assert!(reader.read_message().await.unwrap().is_none());
    }
}
