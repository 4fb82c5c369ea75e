//! Minimal server-sent events reader for the runtime log stream.
//!
//! Only `data:` fields matter here; each one carries a complete JSON object.
//! Comments, `event:`/`id:` fields and blank separator lines are skipped.
//! A read error is yielded once and ends the stream.

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};

use crate::error::{ClientError, ClientResult};

struct Reader<S> {
    inner: S,
    buffer: BytesMut,
    finished: bool,
}

/// Turn a chunked byte stream into the payloads of its `data:` lines.
pub fn data_lines<S, E>(byte_stream: S) -> impl Stream<Item = ClientResult<String>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let reader = Reader {
        inner: byte_stream,
        buffer: BytesMut::with_capacity(4096),
        finished: false,
    };

    futures::stream::unfold(reader, |mut reader| async move {
        if reader.finished {
            return None;
        }
        loop {
            if let Some(pos) = reader.buffer.iter().position(|&b| b == b'\n') {
                let line_bytes = reader.buffer.split_to(pos + 1);
                let Ok(line) = std::str::from_utf8(&line_bytes) else {
                    continue;
                };
                if let Some(data) = extract_data(line) {
                    return Some((Ok(data), reader));
                }
                continue;
            }

            match reader.inner.next().await {
                Some(Ok(chunk)) => reader.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    reader.finished = true;
                    return Some((Err(ClientError::Transport(e.to_string())), reader));
                }
                None => {
                    reader.finished = true;
                    let tail = std::str::from_utf8(&reader.buffer)
                        .ok()
                        .and_then(extract_data);
                    reader.buffer.clear();
                    return tail.map(|data| (Ok(data), reader));
                }
            }
        }
    })
}

fn extract_data(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(':') {
        return None;
    }
    let data = trimmed
        .strip_prefix("data:")
        .map(str::trim)
        .filter(|d| !d.is_empty())?;
    Some(data.to_string())
}
