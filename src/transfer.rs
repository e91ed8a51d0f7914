//! File transfer engine: chunking on the way out, reassembly on the way in.
//!
//! The engine is transport-agnostic. Outgoing files are split into ordered
//! `file_chunk` envelopes pushed through a [`ChunkSink`]; incoming chunk
//! streams accumulate per filename in [`ChunkStreams`] until the terminal
//! chunk arrives.
//!
//! Both transports deliver in order and reliably (WebSocket over TCP, data
//! channel over SCTP), so chunks carry no sequence numbers; an unordered
//! transport would need them plus a completion set.

use std::collections::HashMap;

use tracing::debug;

use crate::codec::Envelope;
use crate::config::{CHUNK_PACING, MAX_FILE_SIZE};
use crate::error::{ChatError, Result};

/// A file queued for sending.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub filename: String,
    pub mime: Option<String>,
    pub bytes: Vec<u8>,
}

/// A fully reassembled incoming file.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingFile {
    pub sender: String,
    pub filename: String,
    pub mime: Option<String>,
    pub payload: Vec<u8>,
}

/// Where outgoing chunk envelopes go.
///
/// Implemented by each transport over its own write path; the engine checks
/// readiness before every chunk so a mid-transfer close stops emission.
pub trait ChunkSink {
    /// Whether the transport is currently open for traffic.
    fn is_ready(&self) -> bool;

    /// Deliver one envelope to the transport.
    fn send(
        &mut self,
        env: Envelope,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

// ── Sending ──────────────────────────────────────────────────────────────────

/// Split `file` into ordered chunks of at most `chunk_size` bytes and push
/// them through `sink`, the final chunk flagged `end = true`.
///
/// Rejects files over [`MAX_FILE_SIZE`] before emitting anything, and fails
/// with [`ChatError::NotReady`] the moment the sink stops being ready — the
/// caller may retry once the connection reports open again. Sleeps briefly
/// between chunks so a bulk transfer does not starve other traffic.
pub async fn send_file<S: ChunkSink>(
    file: &OutgoingFile,
    sender: &str,
    chunk_size: usize,
    sink: &mut S,
) -> Result<()> {
    let total = file.bytes.len();
    if total > MAX_FILE_SIZE {
        return Err(ChatError::TooLarge {
            size: total,
            max: MAX_FILE_SIZE,
        });
    }
    if !sink.is_ready() {
        return Err(ChatError::NotReady);
    }

    debug!(
        event = "file_send_start",
        filename = %file.filename,
        bytes = total,
        chunk_size,
        "Starting chunked file send"
    );

    let mut offset = 0;
    loop {
        let chunk_end = (offset + chunk_size).min(total);
        let last = chunk_end == total;

        if !sink.is_ready() {
            return Err(ChatError::NotReady);
        }
        sink.send(Envelope::FileChunk {
            sender: sender.to_owned(),
            filename: file.filename.clone(),
            chunk: file.bytes[offset..chunk_end].to_vec(),
            mime: file.mime.clone(),
            end: last,
        })
        .await?;

        if last {
            break;
        }
        offset = chunk_end;
        tokio::time::sleep(CHUNK_PACING).await;
    }

    debug!(event = "file_send_done", filename = %file.filename, "File send complete");
    Ok(())
}

// ── Receiving ────────────────────────────────────────────────────────────────

struct ChunkStream {
    sender: String,
    mime: Option<String>,
    buf: Vec<u8>,
}

/// Per-filename accumulation buffers for files being reassembled.
///
/// Owned exclusively by the receiving transport task; entries are destroyed
/// on the terminal chunk or wholesale on connection close.
#[derive(Default)]
pub struct ChunkStreams {
    streams: HashMap<String, ChunkStream>,
}

impl ChunkStreams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk to the stream keyed by `filename`.
    ///
    /// On `end = true`, returns the reassembled file and removes the stream
    /// entry. Chunks are assumed to arrive in order; the first chunk's sender
    /// and mime type win.
    pub fn accept(
        &mut self,
        sender: String,
        filename: String,
        chunk: Vec<u8>,
        mime: Option<String>,
        end: bool,
    ) -> Option<IncomingFile> {
        let stream = self
            .streams
            .entry(filename.clone())
            .or_insert_with(|| ChunkStream {
                sender,
                mime,
                buf: Vec::new(),
            });
        stream.buf.extend_from_slice(&chunk);

        if !end {
            return None;
        }
        let stream = self.streams.remove(&filename)?;
        debug!(
            event = "file_reassembled",
            filename = %filename,
            bytes = stream.buf.len(),
            "Incoming file complete"
        );
        Some(IncomingFile {
            sender: stream.sender,
            filename,
            mime: stream.mime,
            payload: stream.buf,
        })
    }

    /// Whether a stream for `filename` is currently accumulating.
    pub fn in_progress(&self, filename: &str) -> bool {
        self.streams.contains_key(filename)
    }

    /// Discard all in-progress streams (connection close).
    pub fn clear(&mut self) {
        if !self.streams.is_empty() {
            debug!(
                event = "file_streams_discarded",
                count = self.streams.len(),
                "Dropping in-progress chunk streams"
            );
        }
        self.streams.clear();
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Sink that records envelopes and can be flipped to not-ready.
    struct RecordingSink {
        ready: Arc<AtomicBool>,
        sent: Vec<Envelope>,
        /// Flip `ready` off after this many sends, if set.
        drop_ready_after: Option<usize>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                ready: Arc::new(AtomicBool::new(true)),
                sent: Vec::new(),
                drop_ready_after: None,
            }
        }
    }

    impl ChunkSink for RecordingSink {
        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        async fn send(&mut self, env: Envelope) -> Result<()> {
            self.sent.push(env);
            if let Some(limit) = self.drop_ready_after {
                if self.sent.len() >= limit {
                    self.ready.store(false, Ordering::SeqCst);
                }
            }
            Ok(())
        }
    }

    fn chunk_fields(env: &Envelope) -> (&[u8], bool) {
        match env {
            Envelope::FileChunk { chunk, end, .. } => (chunk, *end),
            other => panic!("expected file_chunk, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn send_file_emits_ordered_chunks_with_terminal_flag() {
        let file = OutgoingFile {
            filename: "big.bin".into(),
            mime: None,
            bytes: (0..2500u32).map(|i| i as u8).collect(),
        };
        let mut sink = RecordingSink::new();
        send_file(&file, "alice", 1024, &mut sink).await.unwrap();

        assert_eq!(sink.sent.len(), 3);
        let (c0, e0) = chunk_fields(&sink.sent[0]);
        let (c1, e1) = chunk_fields(&sink.sent[1]);
        let (c2, e2) = chunk_fields(&sink.sent[2]);
        assert_eq!((c0.len(), e0), (1024, false));
        assert_eq!((c1.len(), e1), (1024, false));
        assert_eq!((c2.len(), e2), (452, true));

        let reassembled: Vec<u8> = [c0, c1, c2].concat();
        assert_eq!(reassembled, file.bytes);
    }

    #[tokio::test]
    async fn send_file_empty_file_is_one_terminal_chunk() {
        let file = OutgoingFile {
            filename: "empty".into(),
            mime: None,
            bytes: Vec::new(),
        };
        let mut sink = RecordingSink::new();
        send_file(&file, "alice", 1024, &mut sink).await.unwrap();
        assert_eq!(sink.sent.len(), 1);
        let (chunk, end) = chunk_fields(&sink.sent[0]);
        assert!(chunk.is_empty());
        assert!(end);
    }

    #[tokio::test]
    async fn send_file_over_ceiling_emits_nothing() {
        let file = OutgoingFile {
            filename: "huge.iso".into(),
            mime: None,
            bytes: vec![0u8; MAX_FILE_SIZE + 1],
        };
        let mut sink = RecordingSink::new();
        let err = send_file(&file, "alice", 1024, &mut sink).await.unwrap_err();
        assert!(matches!(err, ChatError::TooLarge { .. }));
        assert!(sink.sent.is_empty());
    }

    #[tokio::test]
    async fn send_file_on_closed_sink_fails_without_emitting() {
        let file = OutgoingFile {
            filename: "a.txt".into(),
            mime: None,
            bytes: vec![1, 2, 3],
        };
        let mut sink = RecordingSink::new();
        sink.ready.store(false, Ordering::SeqCst);
        let err = send_file(&file, "alice", 2, &mut sink).await.unwrap_err();
        assert!(matches!(err, ChatError::NotReady));
        assert!(sink.sent.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn send_file_stops_when_transport_closes_mid_transfer() {
        let file = OutgoingFile {
            filename: "cut.bin".into(),
            mime: None,
            bytes: vec![0u8; 10 * 1024],
        };
        let mut sink = RecordingSink::new();
        sink.drop_ready_after = Some(2);
        let err = send_file(&file, "alice", 1024, &mut sink).await.unwrap_err();
        assert!(matches!(err, ChatError::NotReady));
        assert_eq!(sink.sent.len(), 2);
        // No terminal chunk was emitted.
        assert!(sink.sent.iter().all(|env| !chunk_fields(env).1));
    }

    #[test]
    fn reassembly_concatenates_in_order_and_removes_stream() {
        let mut streams = ChunkStreams::new();
        assert!(streams
            .accept("bob".into(), "f".into(), vec![1, 2], None, false)
            .is_none());
        assert!(streams.in_progress("f"));
        assert!(streams
            .accept("bob".into(), "f".into(), vec![3], None, false)
            .is_none());
        let file = streams
            .accept("bob".into(), "f".into(), vec![4, 5], Some("x/y".into()), true)
            .unwrap();

        assert_eq!(file.payload, vec![1, 2, 3, 4, 5]);
        assert_eq!(file.sender, "bob");
        // First chunk's metadata wins.
        assert_eq!(file.mime, None);
        assert!(!streams.in_progress("f"));
    }

    #[test]
    fn single_terminal_chunk_is_a_complete_file() {
        let mut streams = ChunkStreams::new();
        let file = streams
            .accept(
                "bob".into(),
                "one.txt".into(),
                b"all of it".to_vec(),
                Some("text/plain".into()),
                true,
            )
            .unwrap();
        assert_eq!(file.payload, b"all of it");
        assert_eq!(file.mime.as_deref(), Some("text/plain"));
        assert!(!streams.in_progress("one.txt"));
    }

    #[test]
    fn interleaved_filenames_accumulate_independently() {
        let mut streams = ChunkStreams::new();
        streams.accept("a".into(), "x".into(), vec![1], None, false);
        streams.accept("b".into(), "y".into(), vec![9], None, false);
        let x = streams.accept("a".into(), "x".into(), vec![2], None, true).unwrap();
        assert_eq!(x.payload, vec![1, 2]);
        assert!(streams.in_progress("y"));
        let y = streams.accept("b".into(), "y".into(), vec![8], None, true).unwrap();
        assert_eq!(y.payload, vec![9, 8]);
    }

    #[test]
    fn clear_discards_partial_streams() {
        let mut streams = ChunkStreams::new();
        streams.accept("a".into(), "x".into(), vec![1], None, false);
        streams.clear();
        assert!(!streams.in_progress("x"));
        // A fresh terminal chunk after clear starts from scratch.
        let file = streams.accept("a".into(), "x".into(), vec![7], None, true).unwrap();
        assert_eq!(file.payload, vec![7]);
    }
}
