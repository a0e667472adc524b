use futures_util::TryStreamExt;
use futures_util::stream::{self, BoxStream};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::io::StreamReader;

use crate::{RelayError, Result};

#[derive(Clone, Copy, Debug)]
pub struct SseLimits {
    pub max_line_bytes: usize,
}

impl Default for SseLimits {
    fn default() -> Self {
        Self {
            max_line_bytes: 256 * 1024,
        }
    }
}

/// One line of the upstream stream as seen by the relay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SseLine {
    /// Payload of a `data:` line with the prefix and leading spaces removed.
    Data(String),
    /// A `data:` line whose bytes are not UTF-8.
    Undecodable,
}

async fn read_next_line_bytes_limited<R>(
    reader: &mut R,
    out: &mut Vec<u8>,
    max_bytes: usize,
) -> Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    if max_bytes == 0 {
        return Err(RelayError::InvalidResponse(
            "max_line_bytes must be > 0".to_string(),
        ));
    }

    out.clear();

    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(!out.is_empty());
        }

        let newline_pos = buf.iter().position(|b| *b == b'\n');
        let take_len = newline_pos.map(|pos| pos + 1).unwrap_or(buf.len());

        if out.len().saturating_add(take_len) > max_bytes {
            return Err(RelayError::InvalidResponse(format!(
                "SSE line exceeds max_line_bytes={max_bytes}"
            )));
        }

        out.extend_from_slice(&buf[..take_len]);
        reader.consume(take_len);

        if newline_pos.is_some() {
            return Ok(true);
        }
    }
}

/// Reads until the next `data:` line. Every other line (blank separators,
/// `event:`, `id:`, comments) is skipped. `Ok(None)` at end of input or on a
/// `data: [DONE]` line.
async fn read_next_data_line<R>(
    reader: &mut R,
    line_bytes: &mut Vec<u8>,
    limits: SseLimits,
) -> Result<Option<SseLine>>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        if !read_next_line_bytes_limited(reader, line_bytes, limits.max_line_bytes).await? {
            return Ok(None);
        }

        let Some(rest) = line_bytes.strip_prefix(b"data:") else {
            continue;
        };
        let Ok(rest) = std::str::from_utf8(rest) else {
            return Ok(Some(SseLine::Undecodable));
        };
        let payload = rest.trim_end_matches(['\r', '\n']).trim_start();
        if payload == "[DONE]" {
            return Ok(None);
        }
        return Ok(Some(SseLine::Data(payload.to_string())));
    }
}

pub fn sse_data_lines_from_reader_with_limits<R>(
    reader: R,
    limits: SseLimits,
) -> BoxStream<'static, Result<SseLine>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    Box::pin(stream::try_unfold(
        (reader, Vec::<u8>::new(), limits),
        |(mut reader, mut line_bytes, limits)| async move {
            match read_next_data_line(&mut reader, &mut line_bytes, limits).await? {
                Some(line) => Ok(Some((line, (reader, line_bytes, limits)))),
                None => Ok(None),
            }
        },
    ))
}

pub fn sse_data_lines_from_reader<R>(reader: R) -> BoxStream<'static, Result<SseLine>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    sse_data_lines_from_reader_with_limits(reader, SseLimits::default())
}

pub fn sse_data_lines_from_response(
    response: reqwest::Response,
) -> BoxStream<'static, Result<SseLine>> {
    let byte_stream = response.bytes_stream().map_err(std::io::Error::other);
    let reader = StreamReader::new(byte_stream);
    sse_data_lines_from_reader(tokio::io::BufReader::new(reader))
}
