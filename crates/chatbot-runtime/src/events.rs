//! Chat wire events and their Server-Sent-Events framing.
//!
//! A reply is a sequence of `newToken` events carrying JSON string deltas,
//! followed by one `stats` event carrying `{"usage": {...}}`.

use std::fmt::Display;

use bytes::Bytes;
use chatbot_core::MessageUsage;
use eventsource_stream::Eventsource;
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const NEW_TOKEN_EVENT: &str = "newToken";
pub const STATS_EVENT: &str = "stats";

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// Incremental text delta.
    NewToken(String),
    /// Final usage of the reply.
    Stats(MessageUsage),
}

#[derive(Debug, Error)]
pub enum EventCodecError {
    #[error("malformed {event} event payload: {source}")]
    Payload {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("event stream failed: {0}")]
    Stream(String),
}

#[derive(Serialize, Deserialize)]
struct StatsPayload {
    usage: MessageUsage,
}

impl ChatEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ChatEvent::NewToken(_) => NEW_TOKEN_EVENT,
            ChatEvent::Stats(_) => STATS_EVENT,
        }
    }

    /// `event: <name>\ndata: <json>\n\n`
    pub fn to_sse(&self) -> Result<String, EventCodecError> {
        let event = self.name();
        let data = match self {
            ChatEvent::NewToken(text) => serde_json::to_string(text),
            ChatEvent::Stats(usage) => serde_json::to_string(&StatsPayload {
                usage: usage.clone(),
            }),
        }
        .map_err(|source| EventCodecError::Payload { event, source })?;

        Ok(format!("event: {event}\ndata: {data}\n\n"))
    }

    /// Parses one SSE event. Unknown event names yield `None`.
    pub fn from_sse(event: &str, data: &str) -> Result<Option<Self>, EventCodecError> {
        match event {
            NEW_TOKEN_EVENT => serde_json::from_str::<String>(data)
                .map(|text| Some(ChatEvent::NewToken(text)))
                .map_err(|source| EventCodecError::Payload {
                    event: NEW_TOKEN_EVENT,
                    source,
                }),
            STATS_EVENT => serde_json::from_str::<StatsPayload>(data)
                .map(|payload| Some(ChatEvent::Stats(payload.usage)))
                .map_err(|source| EventCodecError::Payload {
                    event: STATS_EVENT,
                    source,
                }),
            _ => Ok(None),
        }
    }
}

/// Decodes an SSE byte stream into chat events. Frames may be split
/// across chunks arbitrarily.
pub fn decode_event_stream<S, B, E>(
    bytes: S,
) -> impl Stream<Item = Result<ChatEvent, EventCodecError>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    bytes.eventsource().filter_map(|event| async move {
        match event {
            Ok(event) => ChatEvent::from_sse(&event.event, &event.data).transpose(),
            Err(err) => Some(Err(EventCodecError::Stream(err.to_string()))),
        }
    })
}

/// Encodes chat events as SSE frames. Upstream errors end up as
/// `EventCodecError::Stream`.
pub fn encode_event_stream<S, E>(events: S) -> impl Stream<Item = Result<Bytes, EventCodecError>>
where
    S: Stream<Item = Result<ChatEvent, E>>,
    E: Display,
{
    events.map(|event| match event {
        Ok(event) => event.to_sse().map(Bytes::from),
        Err(err) => Err(EventCodecError::Stream(err.to_string())),
    })
}

/// Incremental UTF-8 decoder for raw byte transports. Multi-byte
/// characters split across chunks are held back until complete; invalid
/// sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Flushes bytes still held back at end of stream.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use chatbot_core::TokenUsage;
    use futures::stream;
    use proptest::prelude::*;

    use super::*;

    fn sample_events() -> Vec<ChatEvent> {
        vec![
            ChatEvent::NewToken("Hel".to_string()),
            ChatEvent::NewToken("lo \"quoted\"\n".to_string()),
            ChatEvent::Stats(MessageUsage::new(TokenUsage::new(10, 3)).with_price(0.02)),
        ]
    }

    fn sse_text(events: &[ChatEvent]) -> String {
        events.iter().map(|event| event.to_sse().unwrap()).collect()
    }

    fn decode_chunks(chunks: Vec<Vec<u8>>) -> Vec<ChatEvent> {
        let source = stream::iter(chunks.into_iter().map(Ok::<_, Infallible>));
        futures::executor::block_on(
            decode_event_stream(source)
                .map(|event| event.unwrap())
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn new_token_frame_is_json_string() {
        let frame = ChatEvent::NewToken("Hi\n".to_string()).to_sse().unwrap();
        assert_eq!(frame, "event: newToken\ndata: \"Hi\\n\"\n\n");
    }

    #[test]
    fn stats_frame_wraps_usage() {
        let frame = ChatEvent::Stats(MessageUsage::new(TokenUsage::new(10, 3)))
            .to_sse()
            .unwrap();
        assert_eq!(
            frame,
            "event: stats\ndata: {\"usage\":{\"tokens\":{\"prompt\":10,\"completion\":3,\"total\":13}}}\n\n"
        );
    }

    #[test]
    fn decodes_whole_frames() {
        let events = sample_events();
        let decoded = decode_chunks(vec![sse_text(&events).into_bytes()]);
        assert_eq!(decoded, events);
    }

    #[test]
    fn unknown_events_are_ignored() {
        let text = format!(
            "event: ping\ndata: {{}}\n\n{}",
            ChatEvent::NewToken("x".to_string()).to_sse().unwrap()
        );
        let decoded = decode_chunks(vec![text.into_bytes()]);
        assert_eq!(decoded, vec![ChatEvent::NewToken("x".to_string())]);
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let source = stream::iter(vec![Ok::<_, Infallible>(
            b"event: newToken\ndata: not-json\n\n".to_vec(),
        )]);
        let results = futures::executor::block_on(decode_event_stream(source).collect::<Vec<_>>());
        assert!(matches!(
            results.as_slice(),
            [Err(EventCodecError::Payload {
                event: NEW_TOKEN_EVENT,
                ..
            })]
        ));
    }

    #[test]
    fn encoder_maps_upstream_errors() {
        let events = stream::iter(vec![
            Ok(ChatEvent::NewToken("a".to_string())),
            Err("boom"),
        ]);
        let frames = futures::executor::block_on(encode_event_stream(events).collect::<Vec<_>>());
        assert_eq!(frames[0].as_ref().unwrap(), &Bytes::from("event: newToken\ndata: \"a\"\n\n"));
        assert!(matches!(&frames[1], Err(EventCodecError::Stream(msg)) if msg == "boom"));
    }

    #[test]
    fn utf8_decoder_holds_back_split_characters() {
        let bytes = "héllo wörld".as_bytes();
        let mut decoder = Utf8Decoder::new();
        let mut text = String::new();
        for byte in bytes {
            text.push_str(&decoder.decode(std::slice::from_ref(byte)));
        }
        text.push_str(&decoder.finish());
        assert_eq!(text, "héllo wörld");
    }

    #[test]
    fn utf8_decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(&[b'a', 0xff, b'b']), "a\u{FFFD}b");
        assert_eq!(decoder.decode(&[0xe2, 0x82]), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    proptest! {
        #[test]
        fn decoding_survives_arbitrary_splits(cuts in prop::collection::vec(0usize..200, 0..12)) {
            let events = sample_events();
            let bytes = sse_text(&events).into_bytes();

            let mut cuts: Vec<usize> = cuts.into_iter().map(|cut| cut % (bytes.len() + 1)).collect();
            cuts.sort_unstable();
            cuts.dedup();

            let mut chunks = Vec::new();
            let mut start = 0;
            for cut in cuts {
                chunks.push(bytes[start..cut].to_vec());
                start = cut;
            }
            chunks.push(bytes[start..].to_vec());

            prop_assert_eq!(decode_chunks(chunks), events);
        }
    }
}
