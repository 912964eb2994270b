//! Shared SSE decoding for the HTTP adapters.
//!
//! Both adapters follow the same pattern: receive a `reqwest::Response`,
//! buffer chunks, split on `\n\n`, extract `data:` payloads, and feed each
//! payload to an adapter-specific parser.

use aegis_domain::{Error, Result};

use crate::traits::{BoxStream, StreamEvent};

/// Extract complete `data:` payloads from an SSE buffer.
///
/// Events are delimited by `\n\n`; only `data:` lines matter. The buffer
/// is drained in place, leaving any trailing partial event for the next
/// call.
pub(crate) fn drain_data_lines(buffer: &mut String) -> Vec<String> {
    let mut data_lines = Vec::new();

    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);

        for line in block.lines() {
            if let Some(data) = line.trim().strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() && data != "[DONE]" {
                    data_lines.push(data.to_string());
                }
            }
        }
    }

    data_lines
}

/// Build a [`BoxStream`] from an SSE response and an adapter-specific
/// parser closure. The parser is `FnMut` because some adapters carry
/// state across events.
pub(crate) fn sse_response_stream<F>(
    response: reqwest::Response,
    mut parse_data: F,
) -> BoxStream<'static, Result<StreamEvent>>
where
    F: FnMut(&str) -> Vec<Result<StreamEvent>> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut response = response;
        let mut buffer = String::new();
        let mut done_emitted = false;

        loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    for data in drain_data_lines(&mut buffer) {
                        for event in parse_data(&data) {
                            if matches!(&event, Ok(StreamEvent::Done { .. })) {
                                done_emitted = true;
                            }
                            yield event;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    yield Err(Error::Http(format!("stream read: {e}")));
                    return;
                }
            }
        }

        // Flush a trailing event without the final delimiter.
        if !buffer.trim().is_empty() {
            buffer.push_str("\n\n");
            for data in drain_data_lines(&mut buffer) {
                for event in parse_data(&data) {
                    if matches!(&event, Ok(StreamEvent::Done { .. })) {
                        done_emitted = true;
                    }
                    yield event;
                }
            }
        }

        if !done_emitted {
            yield Ok(StreamEvent::Done { usage: None, finish_reason: None });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_complete_events() {
        let mut buffer = String::from("data: one\n\ndata: two\n\ndata: par");
        let lines = drain_data_lines(&mut buffer);
        assert_eq!(lines, vec!["one", "two"]);
        assert_eq!(buffer, "data: par");
    }

    #[test]
    fn skips_done_sentinel_and_comments() {
        let mut buffer = String::from("event: delta\ndata: {\"x\":1}\n\ndata: [DONE]\n\n");
        let lines = drain_data_lines(&mut buffer);
        assert_eq!(lines, vec!["{\"x\":1}"]);
        assert!(buffer.is_empty());
    }
}
