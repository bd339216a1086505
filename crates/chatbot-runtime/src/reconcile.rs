//! Stream reconciler.
//!
//! Folds a streamed reply into a conversation snapshot. The first delta
//! appends an assistant message; later deltas replace its content with the
//! cumulative text, so every update shows at least as much text as the one
//! before. Events are applied by a single loop, one at a time.

use std::error::Error as StdError;
use std::pin::pin;

use chatbot_core::{Conversation, Message, MessageUsage};
use futures::stream::{self, Stream, StreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::events::{decode_event_stream, ChatEvent, Utf8Decoder};

type BoxError = Box<dyn StdError + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    AwaitingFirstChunk,
    Streaming,
    Done,
    Aborted,
}

impl StreamState {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamState::AwaitingFirstChunk => "awaiting_first_chunk",
            StreamState::Streaming => "streaming",
            StreamState::Done => "done",
            StreamState::Aborted => "aborted",
        }
    }
}

/// Outcome of a stream that finished or was cancelled.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub state: StreamState,
    pub conversation: Conversation,
}

impl Reconciled {
    pub fn is_aborted(&self) -> bool {
        self.state == StreamState::Aborted
    }
}

/// The transport failed. Carries the conversation as last updated.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("stream failed: {source}")]
    Stream {
        #[source]
        source: BoxError,
        conversation: Box<Conversation>,
    },
}

impl ReconcileError {
    pub fn partial(&self) -> &Conversation {
        match self {
            ReconcileError::Stream { conversation, .. } => conversation,
        }
    }

    pub fn into_partial(self) -> Conversation {
        match self {
            ReconcileError::Stream { conversation, .. } => *conversation,
        }
    }
}

#[derive(Debug)]
struct Accumulator {
    state: StreamState,
    text: String,
    usage: Option<MessageUsage>,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            state: StreamState::AwaitingFirstChunk,
            text: String::new(),
            usage: None,
        }
    }

    fn push_delta(&mut self, conversation: &mut Conversation, delta: &str) {
        self.text.push_str(delta);
        match self.state {
            StreamState::AwaitingFirstChunk => {
                let mut message = Message::assistant(self.text.clone());
                message.usage = self.usage.clone();
                conversation.push(message);
                self.state = StreamState::Streaming;
            }
            StreamState::Streaming => {
                if let Some(message) = conversation.trailing_assistant_mut() {
                    message.content.clone_from(&self.text);
                }
            }
            StreamState::Done | StreamState::Aborted => {}
        }
    }

    /// Last value wins. Content is left untouched.
    fn apply_stats(&mut self, conversation: &mut Conversation, usage: MessageUsage) {
        if self.state == StreamState::Streaming {
            if let Some(message) = conversation.trailing_assistant_mut() {
                message.usage = Some(usage.clone());
            }
        }
        self.usage = Some(usage);
    }

    fn finish(&mut self, conversation: &mut Conversation) {
        if self.state == StreamState::AwaitingFirstChunk {
            conversation.push(Message::assistant(String::new()));
        }
        if let Some(message) = conversation.trailing_assistant_mut() {
            message.content.clone_from(&self.text);
            if self.usage.is_some() {
                message.usage.clone_from(&self.usage);
            }
        }
        self.state = StreamState::Done;
    }
}

/// Applies chat events to `conversation` until the stream ends, fails or
/// `cancel` fires.
///
/// Cancellation is checked before every event and while waiting for the
/// next one. On cancellation the event stream is dropped, which aborts
/// the transport, and the partial conversation is returned as
/// [`StreamState::Aborted`]. Cancelling more than once has no further
/// effect.
pub async fn reconcile<S, E, F>(
    events: S,
    conversation: Conversation,
    cancel: &CancellationToken,
    mut on_update: F,
) -> Result<Reconciled, ReconcileError>
where
    S: Stream<Item = Result<ChatEvent, E>>,
    E: Into<BoxError>,
    F: FnMut(&Conversation),
{
    let mut events = pin!(events);
    let mut conversation = conversation;
    let mut acc = Accumulator::new();

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            next = events.next() => Some(next),
        };

        let Some(next) = next else {
            info!(
                conversation = %conversation.id,
                state = acc.state.as_str(),
                chars = acc.text.len(),
                "stream aborted"
            );
            return Ok(Reconciled {
                state: StreamState::Aborted,
                conversation,
            });
        };

        match next {
            Some(Ok(ChatEvent::NewToken(delta))) => {
                acc.push_delta(&mut conversation, &delta);
                on_update(&conversation);
            }
            Some(Ok(ChatEvent::Stats(usage))) => {
                debug!(conversation = %conversation.id, tokens = usage.tokens.total, "stats received");
                acc.apply_stats(&mut conversation, usage);
                on_update(&conversation);
            }
            Some(Err(err)) => {
                let source: BoxError = err.into();
                info!(
                    conversation = %conversation.id,
                    state = acc.state.as_str(),
                    error = %source,
                    "stream failed"
                );
                return Err(ReconcileError::Stream {
                    source,
                    conversation: Box::new(conversation),
                });
            }
            None => break,
        }
    }

    acc.finish(&mut conversation);
    on_update(&conversation);
    debug!(conversation = %conversation.id, chars = acc.text.len(), "stream done");

    Ok(Reconciled {
        state: StreamState::Done,
        conversation,
    })
}

/// Reconciles a raw byte stream. Each chunk is a text delta.
pub async fn consume_byte_stream<S, B, E, F>(
    bytes: S,
    conversation: Conversation,
    cancel: &CancellationToken,
    on_update: F,
) -> Result<Reconciled, ReconcileError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Into<BoxError>,
    F: FnMut(&Conversation),
{
    let deltas = stream::unfold(
        (Box::pin(bytes), Utf8Decoder::new(), false),
        |(mut bytes, mut decoder, finished)| async move {
            if finished {
                return None;
            }
            match bytes.next().await {
                Some(Ok(chunk)) => {
                    let text = decoder.decode(chunk.as_ref());
                    Some((Ok(ChatEvent::NewToken(text)), (bytes, decoder, false)))
                }
                Some(Err(err)) => Some((Err(err), (bytes, decoder, true))),
                None => {
                    let rest = decoder.finish();
                    if rest.is_empty() {
                        None
                    } else {
                        Some((Ok(ChatEvent::NewToken(rest)), (bytes, decoder, true)))
                    }
                }
            }
        },
    );

    reconcile(deltas, conversation, cancel, on_update).await
}

/// Reconciles an SSE byte stream of `newToken` and `stats` events.
pub async fn consume_event_stream<S, B, E, F>(
    bytes: S,
    conversation: Conversation,
    cancel: &CancellationToken,
    on_update: F,
) -> Result<Reconciled, ReconcileError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
    F: FnMut(&Conversation),
{
    reconcile(decode_event_stream(bytes), conversation, cancel, on_update).await
}
