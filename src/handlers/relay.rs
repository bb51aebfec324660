// src/handlers/relay.rs

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt, pin_mut};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use crate::key_pool::{KeyPool, safe_suffix};
use crate::models::{ChatCompletionChunk, SSE_DATA_PREFIX, SSE_DONE_PAYLOAD};

/// Budget for the first byte of any kind from the upstream.
pub const FIRST_CHUNK_TIMEOUT: Duration = Duration::from_secs(15);
/// Budget, from the first byte, for a chunk with actual chat content.
/// Non-empty lines (comments, heartbeats, empty deltas) reset it.
pub const MEANINGFUL_DATA_TIMEOUT: Duration = Duration::from_secs(30);

/// Why the relay closed.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    /// The upstream sent its own `data: [DONE]`.
    DoneSentinel,
    /// Upstream EOF after meaningful data; a `[DONE]` was synthesized if
    /// the upstream never sent one.
    UpstreamEof,
    /// Writing to the client failed or the client went away.
    ClientDisconnected,
    /// No byte at all arrived within the first-chunk budget.
    TimeoutFirst,
    /// Bytes arrived but no meaningful chunk within its budget.
    TimeoutMeaningful,
    /// The per-attempt deadline fired after meaningful data was flowing.
    TimeoutSubsequent,
    /// Upstream EOF before any meaningful chunk.
    PrematureEof,
    /// The upstream byte stream errored.
    ReadError(String),
}

/// Result of one relay run.
#[derive(Debug)]
pub struct RelayOutcome {
    pub close: CloseReason,
    /// Whether at least one meaningful chunk reached the client. Retrying
    /// is only allowed while this is false.
    pub meaningful: bool,
}

impl RelayOutcome {
    fn new(close: CloseReason, meaningful: bool) -> Self {
        Self { close, meaningful }
    }
}

/// Axum response body fed by the relay through a channel. Dropping the
/// response (client disconnect) closes the receiver, which the relay
/// observes as a failed send.
pub struct RelayBody {
    rx: mpsc::Receiver<Bytes>,
}

impl RelayBody {
    pub fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self { rx }
    }
}

impl Stream for RelayBody {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|opt| opt.map(Ok))
    }
}

/// Incremental newline splitter over arbitrary byte chunks. Completed lines
/// keep their trailing newline so the client sees the upstream byte stream
/// verbatim.
#[derive(Default)]
pub(crate) struct LineBuffer {
    buf: String,
}

impl LineBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            lines.push(line);
        }
        lines
    }

    /// Remaining partial line at EOF, if any.
    pub(crate) fn take_remainder(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }
}

enum LineSignal {
    /// Blank separator line; not a heartbeat.
    Empty,
    /// Non-empty line without chat content (comment, heartbeat, empty delta).
    Activity,
    /// `data:` event carrying non-empty `choices[0].delta.content`.
    Meaningful,
    /// `data: [DONE]`.
    Done,
}

fn line_signal(line: &str) -> LineSignal {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return LineSignal::Empty;
    }
    if let Some(data) = trimmed.strip_prefix(SSE_DATA_PREFIX) {
        let payload = data.trim();
        if payload == SSE_DONE_PAYLOAD {
            return LineSignal::Done;
        }
        if let Ok(chunk) = serde_json::from_str::<ChatCompletionChunk>(payload) {
            if chunk.has_meaningful_content() {
                return LineSignal::Meaningful;
            }
        }
        return LineSignal::Activity;
    }
    // Comment lines (`:`) and anything else non-empty count as activity.
    LineSignal::Activity
}

/// Relays an upstream SSE byte stream to the client line by line, running
/// the three-signal timeout state machine:
///
/// waiting for the first byte (`FIRST_CHUNK_TIMEOUT`), then waiting for a
/// meaningful chunk (`MEANINGFUL_DATA_TIMEOUT`, reset by any non-empty
/// line), then streaming freely under the per-attempt deadline only.
///
/// The key is marked successful in the pool the moment the first meaningful
/// chunk arrives.
pub async fn run_relay<S, E>(
    pool: &KeyPool,
    secret: &str,
    stream: S,
    tx: &mpsc::Sender<Bytes>,
    attempt_deadline: Instant,
) -> RelayOutcome
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    pin_mut!(stream);
    let mut lines = LineBuffer::new();
    let mut got_first_byte = false;
    let mut meaningful = false;
    let mut phase_deadline = Instant::now() + FIRST_CHUNK_TIMEOUT;

    loop {
        let deadline = if meaningful {
            attempt_deadline
        } else {
            phase_deadline.min(attempt_deadline)
        };

        let chunk = match timeout_at(deadline, stream.next()).await {
            Err(_) => {
                // A deadline fired; which one depends on the phase.
                let close = if meaningful {
                    warn!(key.suffix = %safe_suffix(secret), "Stream deadline hit after meaningful data, closing");
                    CloseReason::TimeoutSubsequent
                } else if got_first_byte {
                    warn!(key.suffix = %safe_suffix(secret), "No meaningful chat data within budget");
                    CloseReason::TimeoutMeaningful
                } else {
                    warn!(key.suffix = %safe_suffix(secret), "No initial data within budget");
                    CloseReason::TimeoutFirst
                };
                return RelayOutcome::new(close, meaningful);
            }
            Ok(next) => next,
        };

        match chunk {
            Some(Ok(bytes)) => {
                if !got_first_byte && !bytes.is_empty() {
                    got_first_byte = true;
                    phase_deadline = Instant::now() + MEANINGFUL_DATA_TIMEOUT;
                    debug!(key.suffix = %safe_suffix(secret), "First upstream bytes received");
                }

                for line in lines.push(&bytes) {
                    let signal = line_signal(&line);
                    if tx.send(Bytes::from(line)).await.is_err() {
                        debug!(key.suffix = %safe_suffix(secret), "Client went away during stream");
                        return RelayOutcome::new(CloseReason::ClientDisconnected, meaningful);
                    }
                    match signal {
                        LineSignal::Done => {
                            info!(key.suffix = %safe_suffix(secret), "Upstream sent [DONE]");
                            return RelayOutcome::new(CloseReason::DoneSentinel, meaningful);
                        }
                        LineSignal::Meaningful if !meaningful => {
                            meaningful = true;
                            info!(key.suffix = %safe_suffix(secret), "First meaningful chunk received");
                            if let Err(e) = pool.record_success(secret).await {
                                warn!(key.suffix = %safe_suffix(secret), error = %e, "Could not record key success");
                            }
                        }
                        LineSignal::Activity if !meaningful => {
                            // Heartbeat: a thinking upstream gets more time.
                            phase_deadline = Instant::now() + MEANINGFUL_DATA_TIMEOUT;
                        }
                        _ => {}
                    }
                }
            }
            Some(Err(e)) => {
                warn!(key.suffix = %safe_suffix(secret), error = %e, "Upstream stream read error");
                return RelayOutcome::new(CloseReason::ReadError(e.to_string()), meaningful);
            }
            None => {
                // Upstream EOF. Flush any unterminated final line first.
                let mut saw_done = false;
                if let Some(rest) = lines.take_remainder() {
                    let signal = line_signal(&rest);
                    if tx.send(Bytes::from(rest)).await.is_err() {
                        return RelayOutcome::new(CloseReason::ClientDisconnected, meaningful);
                    }
                    match signal {
                        LineSignal::Done => saw_done = true,
                        LineSignal::Meaningful if !meaningful => {
                            meaningful = true;
                            if let Err(e) = pool.record_success(secret).await {
                                warn!(key.suffix = %safe_suffix(secret), error = %e, "Could not record key success");
                            }
                        }
                        _ => {}
                    }
                }

                if saw_done {
                    return RelayOutcome::new(CloseReason::DoneSentinel, meaningful);
                }
                if meaningful {
                    // The client got real content but no terminator; close
                    // the stream cleanly for it.
                    debug!(key.suffix = %safe_suffix(secret), "EOF without [DONE], synthesizing terminator");
                    let done = format!("{SSE_DATA_PREFIX}{SSE_DONE_PAYLOAD}\n\n");
                    if tx.send(Bytes::from(done)).await.is_err() {
                        return RelayOutcome::new(CloseReason::ClientDisconnected, true);
                    }
                    return RelayOutcome::new(CloseReason::UpstreamEof, true);
                }
                warn!(key.suffix = %safe_suffix(secret), "Upstream closed before any meaningful data");
                return RelayOutcome::new(CloseReason::PrematureEof, false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKeyStore;
    use futures_util::stream;
    use std::sync::Arc;

    async fn test_pool(secret: &str) -> KeyPool {
        let store = Arc::new(MemoryKeyStore::new());
        let pool = KeyPool::new(store, Duration::from_secs(600), 3);
        pool.add_batch(secret).await;
        pool
    }

    fn ok_chunks(parts: &[&str]) -> impl Stream<Item = Result<Bytes, Infallible>> {
        let owned: Vec<Result<Bytes, Infallible>> = parts
            .iter()
            .map(|p| Ok(Bytes::from(p.to_string())))
            .collect();
        stream::iter(owned)
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(3600)
    }

    async fn drain(rx: &mut mpsc::Receiver<Bytes>) -> String {
        let mut out = String::new();
        while let Ok(b) = rx.try_recv() {
            out.push_str(&String::from_utf8_lossy(&b));
        }
        out
    }

    #[tokio::test]
    async fn forwards_lines_verbatim_and_sees_done() {
        let pool = test_pool("sk-a").await;
        let (tx, mut rx) = mpsc::channel(64);
        let upstream = ok_chunks(&[
            ": heartbeat\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"},\"index\":0}]}\n\n",
            "data: [DONE]\n\n",
        ]);

        let outcome = run_relay(&pool, "sk-a", upstream, &tx, far_deadline()).await;
        assert_eq!(outcome.close, CloseReason::DoneSentinel);
        assert!(outcome.meaningful);

        let sent = drain(&mut rx).await;
        assert!(sent.starts_with(": heartbeat\n"));
        assert!(sent.contains("\"content\":\"hi\""));
        assert!(sent.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn synthesizes_done_on_eof_after_meaningful_data() {
        let pool = test_pool("sk-a").await;
        let (tx, mut rx) = mpsc::channel(64);
        let upstream = ok_chunks(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"},\"index\":0}]}\n\n",
        ]);

        let outcome = run_relay(&pool, "sk-a", upstream, &tx, far_deadline()).await;
        assert_eq!(outcome.close, CloseReason::UpstreamEof);
        assert!(outcome.meaningful);
        let sent = drain(&mut rx).await;
        assert!(sent.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn eof_before_meaningful_data_is_premature() {
        let pool = test_pool("sk-a").await;
        let (tx, _rx) = mpsc::channel(64);
        let upstream = ok_chunks(&[": warming up\n\n"]);

        let outcome = run_relay(&pool, "sk-a", upstream, &tx, far_deadline()).await;
        assert_eq!(outcome.close, CloseReason::PrematureEof);
        assert!(!outcome.meaningful);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_upstream_hits_first_chunk_timeout() {
        let pool = test_pool("sk-a").await;
        let (tx, _rx) = mpsc::channel(64);
        let upstream = stream::pending::<Result<Bytes, Infallible>>();

        let outcome = run_relay(&pool, "sk-a", upstream, &tx, far_deadline()).await;
        assert_eq!(outcome.close, CloseReason::TimeoutFirst);
        assert!(!outcome.meaningful);
    }

    #[tokio::test(start_paused = true)]
    async fn headers_only_upstream_hits_meaningful_timeout() {
        let pool = test_pool("sk-a").await;
        let (tx, _rx) = mpsc::channel(64);
        // One comment line, then silence: the first-chunk phase is passed
        // but no meaningful chunk ever arrives.
        let upstream =
            ok_chunks(&[": hello\n\n"]).chain(stream::pending::<Result<Bytes, Infallible>>());

        let outcome = run_relay(&pool, "sk-a", upstream, &tx, far_deadline()).await;
        assert_eq!(outcome.close, CloseReason::TimeoutMeaningful);
        assert!(!outcome.meaningful);
    }

    #[tokio::test]
    async fn meaningful_chunk_marks_key_successful() {
        let pool = test_pool("sk-a").await;
        // Put the key into a failed state first.
        pool.record_failure("sk-a").await.unwrap();

        let (tx, _rx) = mpsc::channel(64);
        let upstream = ok_chunks(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"},\"index\":0}]}\n\n",
            "data: [DONE]\n\n",
        ]);
        let outcome = run_relay(&pool, "sk-a", upstream, &tx, far_deadline()).await;
        assert!(outcome.meaningful);

        let view = pool.paginated_safe_view(1, 10).await;
        assert!(view.keys[0].is_active);
        assert_eq!(view.keys[0].failure_count, 0);
    }

    #[tokio::test]
    async fn client_disconnect_stops_the_relay() {
        let pool = test_pool("sk-a").await;
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let upstream = ok_chunks(&["data: {\"choices\":[]}\n\n"]);

        let outcome = run_relay(&pool, "sk-a", upstream, &tx, far_deadline()).await;
        assert_eq!(outcome.close, CloseReason::ClientDisconnected);
    }

    #[test]
    fn line_buffer_reassembles_split_chunks() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"data: {\"par").is_empty());
        let lines = buf.push(b"tial\"}\n\ndata: next");
        assert_eq!(lines, vec!["data: {\"partial\"}\n".to_string(), "\n".to_string()]);
        assert_eq!(buf.take_remainder(), Some("data: next".to_string()));
        assert_eq!(buf.take_remainder(), None);
    }

    #[test]
    fn done_sentinel_line_is_recognized() {
        assert!(matches!(line_signal("data: [DONE]\n"), LineSignal::Done));
        assert!(matches!(line_signal("data:  [DONE]  \n"), LineSignal::Done));
        assert!(matches!(line_signal(": comment\n"), LineSignal::Activity));
        assert!(matches!(line_signal("\n"), LineSignal::Empty));
        assert!(matches!(
            line_signal("data: {\"choices\":[{\"delta\":{\"content\":\"\"},\"index\":0}]}\n"),
            LineSignal::Activity
        ));
    }
}
