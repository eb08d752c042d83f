use crate::{ChatCompletionChunk, CompletionError};
use bytes::Bytes;
use futures_util::Stream;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::warn;

/// A single SSE event carrying both the raw bytes (for forwarding/archival)
/// and the parsed chunk (for driving the orchestrator).
#[derive(Debug, Clone)]
pub struct SSEEvent {
    pub raw_bytes: Bytes,
    pub chunk: ChatCompletionChunk,
}

/// Provider-specific SSE event parsing, kept separate from buffer management
/// so a new upstream wire format only needs a new impl of this trait.
pub trait SSEEventParser: Send + Unpin {
    type State: Send + Unpin + Default;

    /// Returns `Ok(Some(chunk))` on a parsed event, `Ok(None)` to skip a line
    /// (e.g. the `[DONE]` marker), `Err` on malformed input.
    fn parse_event(
        state: &mut Self::State,
        data: &str,
    ) -> Result<Option<ChatCompletionChunk>, CompletionError>;
}

/// Generic buffered SSE parser handling multi-event-per-packet and
/// split-across-packet framing uniformly for any `SSEEventParser`.
pub struct BufferedSSEParser<S, P: SSEEventParser> {
    inner: S,
    buffer: String,
    bytes_buffer: Vec<u8>,
    pending_results: VecDeque<Result<SSEEvent, CompletionError>>,
    state: P::State,
    _marker: PhantomData<P>,
}

impl<S, P> BufferedSSEParser<S, P>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
    P: SSEEventParser,
{
    pub fn new(stream: S) -> Self {
        Self {
            inner: stream,
            buffer: String::new(),
            bytes_buffer: Vec::new(),
            pending_results: VecDeque::new(),
            state: P::State::default(),
            _marker: PhantomData,
        }
    }

    fn process_buffer(&mut self) -> Vec<Result<SSEEvent, CompletionError>> {
        let mut results = Vec::new();

        while let Some(newline_pos) = self.buffer.find('\n') {
            let line_len = newline_pos + 1;

            let raw_bytes = Bytes::copy_from_slice(&self.bytes_buffer[..line_len]);
            self.bytes_buffer.drain(..line_len);

            let line = self.buffer.drain(..=newline_pos).collect::<String>();
            let line = line.trim();

            if line.is_empty() || line.starts_with(':') {
                continue;
            }

            if let Some(data) = line.strip_prefix("data: ") {
                match P::parse_event(&mut self.state, data) {
                    Ok(Some(chunk)) => results.push(Ok(SSEEvent { raw_bytes, chunk })),
                    Ok(None) => {}
                    Err(e) => results.push(Err(e)),
                }
            }
        }

        results
    }
}

impl<S, P> Stream for BufferedSSEParser<S, P>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
    P: SSEEventParser,
{
    type Item = Result<SSEEvent, CompletionError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(result) = this.pending_results.pop_front() {
            return Poll::Ready(Some(result));
        }

        let buffered_results = this.process_buffer();
        if !buffered_results.is_empty() {
            this.pending_results.extend(buffered_results);
            if let Some(result) = this.pending_results.pop_front() {
                return Poll::Ready(Some(result));
            }
        }

        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                this.bytes_buffer.extend_from_slice(&bytes);
                let text = String::from_utf8_lossy(&bytes);
                this.buffer.push_str(&text);

                let results = this.process_buffer();
                if !results.is_empty() {
                    this.pending_results.extend(results);
                    if let Some(result) = this.pending_results.pop_front() {
                        return Poll::Ready(Some(result));
                    }
                }
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Poll::Ready(Some(Err(e))) => {
                Poll::Ready(Some(Err(CompletionError::RequestFailed(e.to_string()))))
            }
            Poll::Ready(None) => {
                if !this.buffer.trim().is_empty() {
                    warn!("incomplete SSE data in buffer at stream end");
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

// ============================================================================
// OpenAI-compatible event parser, used by the LLM client
// ============================================================================

#[derive(Default)]
pub struct OpenAIParserState;

pub struct OpenAIEventParser;

impl SSEEventParser for OpenAIEventParser {
    type State = OpenAIParserState;

    fn parse_event(
        _state: &mut Self::State,
        data: &str,
    ) -> Result<Option<ChatCompletionChunk>, CompletionError> {
        if data == "[DONE]" {
            return Ok(None);
        }

        match serde_json::from_str::<ChatCompletionChunk>(data) {
            Ok(chunk) => Ok(Some(chunk)),
            Err(e) => {
                warn!(error = %e, "failed to parse chat completion chunk");
                Err(CompletionError::InvalidResponse(
                    "invalid response format".to_string(),
                ))
            }
        }
    }
}

pub type SSEParser<S> = BufferedSSEParser<S, OpenAIEventParser>;

pub fn new_sse_parser<S>(stream: S) -> SSEParser<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    BufferedSSEParser::new(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn multiple_events_in_single_packet_are_all_yielded() {
        let multi_event_packet = concat!(
            "data: {\"id\":\"1\",\"object\":\"chat.completion.chunk\",\"created\":1234567890,\"model\":\"test\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hello\"},\"finish_reason\":null}]}\n\n",
            "data: {\"id\":\"1\",\"object\":\"chat.completion.chunk\",\"created\":1234567890,\"model\":\"test\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\" World\"},\"finish_reason\":null}]}\n\n",
            "data: {\"id\":\"1\",\"object\":\"chat.completion.chunk\",\"created\":1234567890,\"model\":\"test\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"!\"},\"finish_reason\":\"stop\"}]}\n\n",
        );

        let bytes = bytes::Bytes::from(multi_event_packet);
        let mock_stream = futures_util::stream::iter(vec![Ok::<_, reqwest::Error>(bytes)]);

        let parser = new_sse_parser(mock_stream);
        let events: Vec<_> = parser.collect().await;

        assert_eq!(events.len(), 3);
        for event in &events {
            assert!(event.is_ok());
        }

        let contents: Vec<String> = events
            .into_iter()
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                e.chunk
                    .choices
                    .first()
                    .and_then(|c| c.delta.as_ref().and_then(|d| d.content.clone()))
            })
            .collect();

        assert_eq!(contents, vec!["Hello", " World", "!"]);
    }

    #[tokio::test]
    async fn events_split_across_packets_are_reassembled() {
        let packet1 = "data: {\"id\":\"1\",\"object\":\"chat.completion.chunk\",\"created\":1234567890,\"model\":\"test\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hello\"},\"finish_reason\":null}]}\n\n";
        let packet2 = "data: {\"id\":\"1\",\"object\":\"chat.completion.chunk\",\"created\":1234567890,\"model\":\"test\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\" World\"},\"finish_reason\":\"stop\"}]}\n\n";

        let mock_stream = futures_util::stream::iter(vec![
            Ok::<_, reqwest::Error>(bytes::Bytes::from(packet1)),
            Ok(bytes::Bytes::from(packet2)),
        ]);

        let parser = new_sse_parser(mock_stream);
        let events: Vec<_> = parser.collect().await;

        assert_eq!(events.len(), 2);
        for event in &events {
            assert!(event.is_ok());
        }
    }

    #[tokio::test]
    async fn done_marker_is_skipped() {
        let packet = concat!(
            "data: {\"id\":\"1\",\"object\":\"chat.completion.chunk\",\"created\":1234567890,\"model\":\"test\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"},\"finish_reason\":null}]}\n\n",
            "data: [DONE]\n\n",
        );

        let mock_stream =
            futures_util::stream::iter(vec![Ok::<_, reqwest::Error>(bytes::Bytes::from(packet))]);

        let parser = new_sse_parser(mock_stream);
        let events: Vec<_> = parser.collect().await;

        assert_eq!(events.len(), 1);
        assert!(events[0].is_ok());
    }

    #[tokio::test]
    async fn comments_and_empty_lines_are_skipped() {
        let packet = concat!(
            ": this is a comment\n",
            "\n",
            "data: {\"id\":\"1\",\"object\":\"chat.completion.chunk\",\"created\":1234567890,\"model\":\"test\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"},\"finish_reason\":null}]}\n\n",
            ": another comment\n",
        );

        let mock_stream =
            futures_util::stream::iter(vec![Ok::<_, reqwest::Error>(bytes::Bytes::from(packet))]);

        let parser = new_sse_parser(mock_stream);
        let events: Vec<_> = parser.collect().await;

        assert_eq!(events.len(), 1);
        assert!(events[0].is_ok());
    }

    #[tokio::test]
    async fn partial_lines_are_buffered_across_packets() {
        let packet1 = "data: {\"id\":\"1\",\"object\":\"chat.completion.chunk\",";
        let packet2 = "\"created\":1234567890,\"model\":\"test\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"},\"finish_reason\":null}]}\n\n";

        let mock_stream = futures_util::stream::iter(vec![
            Ok::<_, reqwest::Error>(bytes::Bytes::from(packet1)),
            Ok(bytes::Bytes::from(packet2)),
        ]);

        let parser = new_sse_parser(mock_stream);
        let events: Vec<_> = parser.collect().await;

        assert_eq!(events.len(), 1);
        assert!(events[0].is_ok());
    }
}
