//! Transport side of the event stream: SSE for HTTP, NDJSON for the CLI.

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::events::StreamEvent;

/// Interval between SSE keep-alive comments.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Encodes one event as an SSE frame (`data: <json>`).
pub fn to_sse_event(event: &StreamEvent) -> Event {
    Event::default()
        .json_data(event)
        .unwrap_or_else(|_| Event::default().data("{}"))
}

/// One NDJSON line, newline included.
pub fn ndjson_line(event: &StreamEvent) -> Result<String> {
    let mut line = serde_json::to_string(event)?;
    line.push('\n');
    Ok(line)
}

/// SSE frames for `events`. Dropping the stream, which axum does when the
/// client disconnects, cancels `cancel`.
pub fn sse_stream(
    events: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    let guard = cancel.drop_guard();
    stream::unfold((events, guard), |(mut rx, guard)| async move {
        let event = rx.recv().await?;
        Some((Ok(to_sse_event(&event)), (rx, guard)))
    })
}

/// Wraps [`sse_stream`] in an axum response with keep-alive comments.
pub fn sse_response(
    events: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    Sse::new(sse_stream(events, cancel)).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
}

/// Writes every event to `out` as NDJSON until the stream ends.
pub async fn write_ndjson<W>(mut events: mpsc::Receiver<StreamEvent>, mut out: W) -> Result<u64>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    let mut written = 0;
    while let Some(event) = events.recv().await {
        out.write_all(ndjson_line(&event)?.as_bytes()).await?;
        out.flush().await?;
        written += 1;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures::StreamExt;

    use crate::events::EventPayload;

    fn event(seq: u64) -> StreamEvent {
        StreamEvent {
            payload: EventPayload::AgentError {
                message: format!("line {}", seq),
            },
            timestamp: Utc::now(),
            request_id: "req-1".to_string(),
            seq,
        }
    }

    #[test]
    fn ndjson_is_one_line_per_event() {
        let line = ndjson_line(&event(4)).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["type"], "agent_error");
        assert_eq!(value["seq"], 4);
    }

    #[tokio::test]
    async fn dropping_the_stream_cancels_the_request() {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(4);
        tx.send(event(0)).await.unwrap();

        let mut stream = Box::pin(sse_stream(rx, cancel.clone()));
        assert!(stream.next().await.is_some());
        assert!(!cancel.is_cancelled());

        drop(stream);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn stream_ends_when_sender_closes() {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(4);
        tx.send(event(0)).await.unwrap();
        tx.send(event(1)).await.unwrap();
        drop(tx);

        let frames: Vec<_> = sse_stream(rx, cancel).collect().await;
        assert_eq!(frames.len(), 2);
    }

    #[tokio::test]
    async fn write_ndjson_flushes_every_event() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(event(0)).await.unwrap();
        tx.send(event(1)).await.unwrap();
        drop(tx);

        let mut out = Vec::new();
        let written = write_ndjson(rx, &mut out).await.unwrap();

        assert_eq!(written, 2);
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 2);
    }
}
