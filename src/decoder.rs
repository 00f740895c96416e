//! incremental decoder for the `data: <json>` line stream.
//!
//! bytes are buffered until a full `\n`-terminated line is available, so the
//! placement of chunk boundaries never changes what is emitted. splitting on
//! bytes also keeps multi-byte utf-8 sequences intact across chunks.

use bevy::prelude::*;
use futures_lite::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::dispatch::{ByteChunks, DispatchError};
use crate::session::Source;

const DATA_PREFIX: &str = "data:";

/// one decoded event from the streaming endpoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamEvent {
    /// incremental text to append to the assistant draft.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<Source>>,
    pub done: bool,
}

/// a single streamed line that could not be decoded. never fatal.
#[derive(Debug, thiserror::Error)]
#[error("dropping malformed stream line {line:?}: {source}")]
pub struct DecodeWarning {
    pub line: String,
    pub source: serde_json::Error,
}

#[derive(Debug, Default)]
pub struct StreamEventDecoder {
    buf: Vec<u8>,
}

impl StreamEventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// append a chunk and decode every line it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buf.extend_from_slice(chunk);
        let Some(last_nl) = self.buf.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };
        let rest = self.buf.split_off(last_nl + 1);
        let complete = std::mem::replace(&mut self.buf, rest);
        complete
            .split(|b| *b == b'\n')
            .filter_map(decode_line)
            .collect()
    }

    /// decode whatever is left once the body has closed.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let tail = std::mem::take(&mut self.buf);
        if !tail.is_empty() {
            debug!(target: "bevy_rag_chat", "stream closed mid-line ({} bytes)", tail.len());
        }
        decode_line(&tail).into_iter().collect()
    }

    /// bytes held back waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

fn decode_line(raw: &[u8]) -> Option<StreamEvent> {
    let text = String::from_utf8_lossy(raw);
    let line = text.strip_suffix('\r').unwrap_or(text.as_ref());
    let payload = line.strip_prefix(DATA_PREFIX)?;
    let payload = payload.strip_prefix(' ').unwrap_or(payload);
    if payload.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<StreamEvent>(payload) {
        Ok(ev) => Some(ev),
        Err(source) => {
            let warning = DecodeWarning {
                line: line.to_string(),
                source,
            };
            warn!(target: "bevy_rag_chat", "{warning}");
            None
        }
    }
}

/// pull-based event stream over a response body.
///
/// ends after the body closes or right after an event with `done: true`,
/// whichever comes first. a transport error ends the stream with that error.
pub struct ChatEventStream {
    chunks: Option<ByteChunks>,
    decoder: StreamEventDecoder,
    ready: VecDeque<StreamEvent>,
}

impl ChatEventStream {
    pub fn new(chunks: ByteChunks) -> Self {
        Self {
            chunks: Some(chunks),
            decoder: StreamEventDecoder::new(),
            ready: VecDeque::new(),
        }
    }

    pub async fn next(&mut self) -> Option<Result<StreamEvent, DispatchError>> {
        loop {
            if let Some(ev) = self.ready.pop_front() {
                if ev.done {
                    self.close();
                }
                return Some(Ok(ev));
            }
            let chunks = self.chunks.as_mut()?;
            match chunks.next().await {
                Some(Ok(bytes)) => self.ready.extend(self.decoder.feed(&bytes)),
                Some(Err(err)) => {
                    self.close();
                    return Some(Err(err));
                }
                None => {
                    self.chunks = None;
                    self.ready.extend(self.decoder.finish());
                }
            }
        }
    }

    /// drop the body and anything still queued.
    fn close(&mut self) {
        self.chunks = None;
        self.ready.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const WIRE: &str = concat!(
        "data: {\"content\":\"A\"}\n",
        ": keep-alive\n",
        "\n",
        "event: message\n",
        "data: {\"content\":\"B\",\"sources\":[{\"title\":\"t\",\"url\":\"u\",\"score\":0.9}]}\r\n",
        "data: not json\n",
        "data: {\"content\":\"é✓\"}\n",
        "data: {\"done\":true}\n",
    );

    fn decode_split(bytes: &[u8], cuts: &[usize]) -> Vec<StreamEvent> {
        let mut decoder = StreamEventDecoder::new();
        let mut out = Vec::new();
        let mut start = 0;
        for &cut in cuts.iter().chain(std::iter::once(&bytes.len())) {
            out.extend(decoder.feed(&bytes[start..cut]));
            start = cut;
        }
        out.extend(decoder.finish());
        out
    }

    fn content(text: &str) -> StreamEvent {
        StreamEvent {
            content: Some(text.into()),
            ..Default::default()
        }
    }

    #[test]
    fn two_lines_split_three_ways() {
        let wire = b"data: {\"content\":\"A\"}\ndata: {\"content\":\"B\"}\n";
        // second cut lands inside the second line
        let events = decode_split(wire, &[7, 30]);
        assert_eq!(events, vec![content("A"), content("B")]);
    }

    #[test]
    fn chunk_boundaries_never_change_output() {
        let bytes = WIRE.as_bytes();
        let whole = decode_split(bytes, &[]);
        assert_eq!(whole.len(), 4);
        assert_eq!(whole[0], content("A"));
        assert_eq!(whole[2], content("é✓"));
        assert!(whole[3].done);

        // every single cut, including ones inside multi-byte chars
        for cut in 0..=bytes.len() {
            assert_eq!(decode_split(bytes, &[cut]), whole, "cut at {cut}");
        }
        // byte-at-a-time
        let cuts: Vec<usize> = (1..bytes.len()).collect();
        assert_eq!(decode_split(bytes, &cuts), whole);
        // a few irregular multi-cut layouts
        for stride in [2, 3, 5, 11, 17] {
            let cuts: Vec<usize> = (stride..bytes.len()).step_by(stride).collect();
            assert_eq!(decode_split(bytes, &cuts), whole, "stride {stride}");
        }
    }

    #[test]
    fn partial_line_waits_for_newline() {
        let mut decoder = StreamEventDecoder::new();
        assert!(decoder.feed(b"data: {\"content\":").is_empty());
        assert!(decoder.pending() > 0);
        assert_eq!(decoder.feed(b"\"x\"}\n"), vec![content("x")]);
        assert_eq!(decoder.pending(), 0);
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn unterminated_tail_is_decoded_at_close() {
        let mut decoder = StreamEventDecoder::new();
        assert!(decoder.feed(b"data: {\"content\":\"end\"}").is_empty());
        assert_eq!(decoder.finish(), vec![content("end")]);
    }

    #[test]
    fn malformed_lines_are_dropped() {
        let events = decode_split(b"data: {oops\ndata: {\"content\":\"ok\"}\n", &[]);
        assert_eq!(events, vec![content("ok")]);
    }

    fn chunks(parts: &[&str]) -> ByteChunks {
        let items: Vec<Result<Vec<u8>, DispatchError>> =
            parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        futures_lite::stream::iter(items).boxed()
    }

    fn collect(mut stream: ChatEventStream) -> Vec<Result<StreamEvent, DispatchError>> {
        pollster::block_on(async move {
            let mut out = Vec::new();
            while let Some(ev) = stream.next().await {
                out.push(ev);
            }
            out
        })
    }

    #[test]
    fn done_event_ends_stream_early() {
        let stream = ChatEventStream::new(chunks(&[
            "data: {\"content\":\"A\"}\ndata: {\"done\":true}\n",
            "data: {\"content\":\"late\"}\n",
        ]));
        let events: Vec<_> = collect(stream).into_iter().map(Result::unwrap).collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], content("A"));
        assert!(events[1].done);
    }

    #[test]
    fn transport_close_ends_stream() {
        let stream = ChatEventStream::new(chunks(&["data: {\"content\":\"A\"}\n", "data: {\"content\":\"B\"}"]));
        let events: Vec<_> = collect(stream).into_iter().map(Result::unwrap).collect();
        assert_eq!(events, vec![content("A"), content("B")]);
    }

    #[test]
    fn transport_error_ends_stream_with_error() {
        let items = vec![
            Ok(b"data: {\"content\":\"A\"}\n".to_vec()),
            Err(DispatchError::connection("reset by peer")),
            Ok(b"data: {\"content\":\"B\"}\n".to_vec()),
        ];
        let stream = ChatEventStream::new(futures_lite::stream::iter(items).boxed());
        let events = collect(stream);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], Ok(content("A")));
        assert_eq!(events[1], Err(DispatchError::connection("reset by peer")));
    }
}
