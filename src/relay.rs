//! Upstream SSE → caller event stream.
//!
//! The relay is lazy: nothing is read from upstream until the caller polls,
//! and dropping the returned stream drops the upstream response with it. It
//! never fails; problems become a single [`RelayEvent::Error`] that ends the
//! stream.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::Result;
use crate::utils::sse::{SseLine, sse_data_lines_from_response};

pub const DISPATCH_FAILED_MESSAGE: &str = "failed to reach the AI service";
pub const STREAM_FAILED_MESSAGE: &str = "failed to process the AI response";

const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayEvent {
    Text(String),
    Error(String),
    Done,
}

impl RelayEvent {
    /// `data: <json>\n\n`, or the literal `data: [DONE]\n\n` terminator.
    pub fn to_sse(&self) -> Bytes {
        let payload = match self {
            Self::Text(text) => serde_json::json!({ "text": text }),
            Self::Error(message) => serde_json::json!({ "error": message }),
            Self::Done => return Bytes::from_static(DONE_FRAME),
        };
        Bytes::from(format!("data: {payload}\n\n"))
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RelayLimits {
    /// Malformed data lines in a row before the stream is abandoned. `0`
    /// disables the cap.
    pub max_consecutive_malformed: usize,
    /// Longest silence tolerated between upstream lines.
    pub idle_timeout: Option<Duration>,
}

impl Default for RelayLimits {
    fn default() -> Self {
        Self {
            max_consecutive_malformed: 64,
            idle_timeout: Some(Duration::from_secs(120)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

/// Text parts of the first candidate, in order, empty ones included. Chunks
/// without candidates (usage-only, safety feedback) yield nothing.
pub fn text_fragments(payload: &str) -> std::result::Result<Vec<String>, serde_json::Error> {
    let chunk: StreamChunk = serde_json::from_str(payload)?;
    Ok(chunk
        .candidates
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|part| part.text)
                .collect()
        })
        .unwrap_or_default())
}

pub fn relay_response(
    response: reqwest::Response,
    limits: RelayLimits,
) -> BoxStream<'static, RelayEvent> {
    relay_lines(sse_data_lines_from_response(response), limits)
}

/// A stream holding one error event.
pub fn error_events(message: impl Into<String>) -> BoxStream<'static, RelayEvent> {
    stream::iter([RelayEvent::Error(message.into())]).boxed()
}

pub fn relay_lines(
    lines: BoxStream<'static, Result<SseLine>>,
    limits: RelayLimits,
) -> BoxStream<'static, RelayEvent> {
    Box::pin(stream::unfold(
        (lines, VecDeque::<RelayEvent>::new(), false, 0usize),
        move |(mut lines, mut buffer, mut done, mut malformed_run)| async move {
            loop {
                if let Some(event) = buffer.pop_front() {
                    return Some((event, (lines, buffer, done, malformed_run)));
                }
                if done {
                    return None;
                }

                let next = match limits.idle_timeout {
                    Some(idle) => match tokio::time::timeout(idle, lines.next()).await {
                        Ok(next) => next,
                        Err(_) => {
                            warn!(idle_ms = idle.as_millis() as u64, "upstream stream stalled");
                            done = true;
                            buffer.push_back(RelayEvent::Error(STREAM_FAILED_MESSAGE.to_string()));
                            continue;
                        }
                    },
                    None => lines.next().await,
                };

                let malformed = match next {
                    Some(Ok(SseLine::Data(payload))) => match text_fragments(&payload) {
                        Ok(fragments) => {
                            malformed_run = 0;
                            buffer.extend(fragments.into_iter().map(RelayEvent::Text));
                            false
                        }
                        Err(err) => {
                            debug!(error = %err, "skipping malformed upstream chunk");
                            true
                        }
                    },
                    Some(Ok(SseLine::Undecodable)) => {
                        debug!("skipping non-UTF-8 upstream chunk");
                        true
                    }
                    Some(Err(err)) => {
                        error!(error = %err, "failed to read upstream stream");
                        done = true;
                        buffer.push_back(RelayEvent::Error(STREAM_FAILED_MESSAGE.to_string()));
                        false
                    }
                    None => {
                        done = true;
                        buffer.push_back(RelayEvent::Done);
                        false
                    }
                };

                if malformed {
                    malformed_run += 1;
                    if limits.max_consecutive_malformed > 0
                        && malformed_run >= limits.max_consecutive_malformed
                    {
                        error!(malformed_run, "too many consecutive malformed upstream chunks");
                        done = true;
                        buffer.push_back(RelayEvent::Error(STREAM_FAILED_MESSAGE.to_string()));
                    }
                }
            }
        },
    ))
}
