//! Incremental decoding of line-delimited streaming responses.
//!
//! Both wire formats the adapters speak are line oriented: Server-Sent
//! Events (OpenAI, Anthropic) and newline-delimited JSON (Ollama). A
//! [`LineDecoder`] splits raw body chunks into complete lines, and
//! [`line_stream`] turns a `reqwest::Response` into a lazily polled
//! [`ChunkStream`] by running each line through a backend-specific parser.
//!
//! The body is read with `Response::chunk()` so a long response never hits a
//! single whole-body timeout; the orchestrator bounds each chunk wait instead.

use crate::api::provider::{ChunkStream, ProviderError, StreamEvent};
use crate::api::retry::classify_transport;
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Parses one complete, trimmed, non-empty line into zero or more events.
pub type LineParser = fn(&str) -> Result<Vec<StreamEvent>, ProviderError>;

/// Splits a byte stream into lines. Bytes are buffered until a newline so
/// multi-byte characters split across chunks decode correctly.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed (trimmed, empties
    /// dropped).
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    /// Flush an unterminated final line, if any.
    pub fn finish(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        (!line.is_empty()).then_some(line)
    }
}

/// Payload of an SSE `data:` line. Comments (`:`) and `event:` lines yield
/// `None`.
pub fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

struct LineStreamState {
    provider: String,
    response: reqwest::Response,
    decoder: LineDecoder,
    parse: LineParser,
    pending: VecDeque<Result<StreamEvent, ProviderError>>,
    eof: bool,
    finished: bool,
}

impl LineStreamState {
    fn feed(&mut self, line: &str) {
        trace!(provider = %self.provider, line, "stream line");
        match (self.parse)(line) {
            Ok(events) => self.pending.extend(events.into_iter().map(Ok)),
            Err(e) => self.pending.push_back(Err(e)),
        }
    }
}

/// Decode a successful streaming response into a [`ChunkStream`].
///
/// The stream ends after the first [`StreamEvent::Done`] or error. A body that
/// ends without an explicit terminator still yields a final `Done`.
pub fn line_stream(
    provider: impl Into<String>,
    response: reqwest::Response,
    parse: LineParser,
) -> ChunkStream {
    let state = LineStreamState {
        provider: provider.into(),
        response,
        decoder: LineDecoder::new(),
        parse,
        pending: VecDeque::new(),
        eof: false,
        finished: false,
    };

    Box::pin(futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                if matches!(item, Ok(StreamEvent::Done) | Err(_)) {
                    st.finished = true;
                    st.pending.clear();
                }
                return Some((item, st));
            }
            if st.finished {
                return None;
            }
            if st.eof {
                st.pending.push_back(Ok(StreamEvent::Done));
                continue;
            }

            match st.response.chunk().await {
                Ok(Some(bytes)) => {
                    for line in st.decoder.push(&bytes) {
                        st.feed(&line);
                    }
                }
                Ok(None) => {
                    debug!(provider = %st.provider, "stream body ended");
                    if let Some(line) = st.decoder.finish() {
                        st.feed(&line);
                    }
                    st.eof = true;
                }
                Err(e) => {
                    let err = classify_transport(&st.provider, &e);
                    st.pending.push_back(Err(err));
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_splits_lines_across_chunks() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(b"data: {\"a\"").is_empty());
        let lines = decoder.push(b":1}\n\ndata: [DONE]\n");
        assert_eq!(lines, vec!["data: {\"a\":1}", "data: [DONE]"]);
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn decoder_keeps_split_multibyte_chars() {
        let mut decoder = LineDecoder::new();
        let text = "flag{é}\n".as_bytes();
        // Split inside the two-byte 'é'.
        let split = text.iter().position(|b| *b == 0xC3).unwrap() + 1;
        assert!(decoder.push(&text[..split]).is_empty());
        assert_eq!(decoder.push(&text[split..]), vec!["flag{é}"]);
    }

    #[test]
    fn decoder_flushes_unterminated_tail() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(b"{\"done\":true}").is_empty());
        assert_eq!(decoder.finish().as_deref(), Some("{\"done\":true}"));
    }

    #[test]
    fn sse_data_prefix() {
        assert_eq!(sse_data("data: {\"x\":1}"), Some("{\"x\":1}"));
        assert_eq!(sse_data("data:[DONE]"), Some("[DONE]"));
        assert_eq!(sse_data("event: message_start"), None);
        assert_eq!(sse_data(": keep-alive"), None);
    }
}
