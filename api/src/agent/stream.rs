use std::collections::VecDeque;
use std::mem;
use std::pin::Pin;
use std::time::Duration;

use futures::stream::unfold;
use futures::{Stream, StreamExt};
use serde_json::Value;

use super::transport::{AgentReply, ByteStream, reply_from_value};
use super::client::StreamingInvocation;
use super::{AgentError, AgentResult, TextFragment, TransientKind};

pub type FragmentStream = Pin<Box<dyn Stream<Item = TextFragment> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum StreamLine {
    /// Payload of a `data:` line, or a bare line
    Data(String),
    /// `[DONE]` terminator
    Done,
}

/// Splits a byte stream into lines, holding partial lines (and partial UTF-8
/// sequences) until their newline arrives.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn feed(&mut self, bytes: &[u8]) -> Vec<StreamLine> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=newline).collect();
            if let Some(line) = parse_line(&String::from_utf8_lossy(&raw)) {
                lines.push(line);
            }
        }
        lines
    }

    fn flush(&mut self) -> Option<StreamLine> {
        let remaining = mem::take(&mut self.pending);
        parse_line(&String::from_utf8_lossy(&remaining))
    }
}

fn parse_line(raw: &str) -> Option<StreamLine> {
    let line = raw.trim_end_matches(['\n', '\r']);
    if line.trim().is_empty() || line.starts_with(':') {
        return None;
    }
    if ["event:", "id:", "retry:"]
        .iter()
        .any(|field| line.starts_with(field))
    {
        return None;
    }

    let data = match line.strip_prefix("data:") {
        Some(rest) => rest.strip_prefix(' ').unwrap_or(rest),
        None => line,
    };
    if data.trim() == "[DONE]" {
        return Some(StreamLine::Done);
    }
    if data.trim().is_empty() {
        return None;
    }
    Some(StreamLine::Data(data.to_string()))
}

/// Fragments carried by one line. JSON chunks are unwrapped the same way as
/// single-shot replies; anything else is text and keeps its line break.
fn fragments_for_line(data: &str) -> Vec<TextFragment> {
    let trimmed = data.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('"') {
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            if let Some(AgentReply { text, payload }) = reply_from_value(&value, 0) {
                let mut fragments = Vec::with_capacity(2);
                if !text.is_empty() {
                    fragments.push(TextFragment::Text(text));
                }
                if let Some(payload) = payload {
                    fragments.push(TextFragment::Payload(payload));
                }
                return fragments;
            }
        }
    }
    vec![TextFragment::Text(format!("{data}\n"))]
}

struct DecodeState {
    lines: LineBuffer,
    pending: VecDeque<TextFragment>,
    ended: bool,
}

/// Decode a streamed agent reply. Ends at `[DONE]`, at end of input, or after a
/// read error, which is yielded as a final [`TextFragment::Error`]. A read that
/// yields nothing within `idle_timeout` is a transient timeout error.
pub fn fragments_from_bytes(bytes: ByteStream, idle_timeout: Duration) -> FragmentStream {
    let state = DecodeState {
        lines: LineBuffer::default(),
        pending: VecDeque::new(),
        ended: false,
    };

    let stream = unfold((bytes, state), move |(mut bytes, mut state)| async move {
        loop {
            if let Some(fragment) = state.pending.pop_front() {
                return Some((fragment, (bytes, state)));
            }
            if state.ended {
                return None;
            }

            let next = match tokio::time::timeout(idle_timeout, bytes.next()).await {
                Ok(next) => next,
                Err(_) => {
                    let idle_ms = u64::try_from(idle_timeout.as_millis()).unwrap_or(u64::MAX);
                    tracing::warn!(idle_ms, "agent stream stalled");
                    state.ended = true;
                    state.pending.push_back(TextFragment::Error(AgentError::transient(
                        TransientKind::Timeout,
                        format!("no stream data within {idle_ms}ms"),
                    )));
                    continue;
                }
            };

            match next {
                Some(Ok(chunk)) => {
                    for line in state.lines.feed(&chunk) {
                        match line {
                            StreamLine::Data(data) => state.pending.extend(fragments_for_line(&data)),
                            StreamLine::Done => {
                                state.ended = true;
                                break;
                            }
                        }
                    }
                }
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "agent stream read failed");
                    state.ended = true;
                    state.pending.push_back(TextFragment::Error(err));
                }
                None => {
                    state.ended = true;
                    if let Some(StreamLine::Data(data)) = state.lines.flush() {
                        state.pending.extend(fragments_for_line(&data));
                    }
                }
            }
        }
    });

    Box::pin(stream)
}

/// Fold a streamed invocation into one result: text concatenated, last payload
/// kept, attempts as spent opening the stream.
pub async fn collect_stream(mut invocation: StreamingInvocation) -> Result<AgentResult, AgentError> {
    let mut text = String::new();
    let mut payload = None;

    while let Some(fragment) = invocation.fragments.next().await {
        match fragment {
            TextFragment::Text(chunk) => text.push_str(&chunk),
            TextFragment::Payload(value) => payload = Some(value),
            TextFragment::Error(err) => return Err(err),
        }
    }

    if text.trim().is_empty() && payload.is_none() {
        return Err(AgentError::InvalidResponse(
            "stream closed without content".to_string(),
        ));
    }

    let attempts = invocation.attempts();
    Ok(AgentResult {
        session_id: invocation.session_id,
        text,
        payload,
        attempts,
    })
}
