//! End-to-end chat flow: provider, chat handler, SSE transport, stream
//! reconciler and usage ledger, all in process.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chatbot_core::{Conversation, Llm, Message, PriceRate, Role};
use chatbot_runtime::{
    consume_event_stream, encode_event_stream, reconcile, ChatError, ChatRequest, ChatService,
    InMemoryLedger, LlmApi, LlmApiAggregator, Meter, MockProvider, RuntimeConfig, StreamChunk,
    StreamState, UsageLedger, UsageMode,
};
use futures::{stream, StreamExt};
use tokio_util::sync::CancellationToken;

struct Stack {
    service: ChatService,
    provider: Arc<MockProvider>,
    ledger: Arc<InMemoryLedger>,
}

fn stack(default_limit_usd: f64) -> Stack {
    let provider = Arc::new(MockProvider::new().with_models(vec![
        Llm::known("gpt-3.5-turbo").unwrap(),
        Llm::known("gpt-4").unwrap(),
    ]));
    let ledger = Arc::new(InMemoryLedger::new());
    let aggregator = LlmApiAggregator::new(vec![Arc::clone(&provider) as Arc<dyn LlmApi>]);
    let meter = Meter::new(Arc::clone(&ledger) as Arc<dyn UsageLedger>, default_limit_usd);

    Stack {
        service: ChatService::new(Arc::new(aggregator), meter, RuntimeConfig::default()),
        provider,
        ledger,
    }
}

fn delta(text: &str) -> StreamChunk {
    StreamChunk::Delta {
        text: text.to_string(),
    }
}

fn conversation() -> Conversation {
    Conversation::new("gpt-3.5-turbo", "You are terse.")
        .with_message(Message::user("Say hello world"))
}

/// Re-splits an encoded SSE body into fixed-size chunks.
fn rechunk(frames: Vec<Bytes>, size: usize) -> Vec<Result<Vec<u8>, Infallible>> {
    let body: Vec<u8> = frames.into_iter().flat_map(|frame| frame.to_vec()).collect();
    body.chunks(size).map(|chunk| Ok(chunk.to_vec())).collect()
}

#[tokio::test]
async fn streamed_reply_reaches_conversation_over_sse() {
    let stack = stack(-1.0);
    stack
        .ledger
        .set_price_rate(
            "gpt-3.5-turbo",
            PriceRate {
                prompt_usd_per_1000: 0.0015,
                completion_usd_per_1000: 0.002,
                monthly_usage_limit_usd: 100.0,
            },
        )
        .await;
    stack.provider.enqueue_stream(Ok(vec![
        delta("Hel"),
        delta("lo"),
        delta(" world"),
        StreamChunk::Done,
    ]));

    let conversation = conversation();
    let events = stack
        .service
        .chat(ChatRequest::from_conversation("alice", &conversation), 1000)
        .await
        .unwrap();
    let frames: Vec<Bytes> = encode_event_stream(events)
        .map(|frame| frame.unwrap())
        .collect()
        .await;

    let mut snapshots = Vec::new();
    let result = consume_event_stream(
        stream::iter(rechunk(frames, 7)),
        conversation,
        &CancellationToken::new(),
        |snapshot| snapshots.push(snapshot.messages.last().unwrap().content.clone()),
    )
    .await
    .unwrap();

    assert_eq!(result.state, StreamState::Done);
    let reply = result.conversation.messages.last().unwrap();
    assert_eq!(reply.role, Role::Assistant);
    assert_eq!(reply.content, "Hello world");
    assert!(snapshots
        .windows(2)
        .all(|pair| pair[1].starts_with(pair[0].as_str())));

    let usage = reply.usage.as_ref().unwrap();
    let records = stack.ledger.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].user_id, "alice");
    assert_eq!(records[0].mode, UsageMode::Chat);
    assert_eq!(records[0].tokens, usage.tokens);
    assert_eq!(records[0].total_price_usd, usage.total_price_usd);
    assert!(usage.tokens.completion >= 2);
}

#[tokio::test]
async fn cancelling_mid_reply_keeps_partial_text_and_frees_resources() {
    let stack = stack(-1.0);
    stack.provider.enqueue_stalled_stream(vec![delta("Hello")]);

    let conversation = conversation();
    let events = stack
        .service
        .chat(ChatRequest::from_conversation("bob", &conversation), 1000)
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let result = reconcile(events, conversation, &cancel, |_| trigger.cancel())
        .await
        .unwrap();

    assert!(result.is_aborted());
    assert_eq!(result.conversation.messages.last().unwrap().content, "Hello");

    let tokenizers = stack.service.tokenizers().clone();
    for _ in 0..200 {
        if tokenizers.active_leases() == 0 && !stack.ledger.records().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(tokenizers.active_leases(), 0);
    assert_eq!(stack.ledger.records().await.len(), 1);
}

#[tokio::test]
async fn spend_exhausts_monthly_budget() {
    let stack = stack(0.000_001);
    stack
        .ledger
        .set_price_rate(
            "gpt-4",
            PriceRate {
                prompt_usd_per_1000: 30.0,
                completion_usd_per_1000: 60.0,
                monthly_usage_limit_usd: 100.0,
            },
        )
        .await;
    stack
        .provider
        .enqueue_stream(Ok(vec![delta("Sure."), StreamChunk::Done]));

    let request = ChatRequest::new("carol", "gpt-4", vec![Message::user("Hi")]);
    let first: Vec<_> = stack
        .service
        .chat(request.clone(), 1000)
        .await
        .unwrap()
        .collect()
        .await;
    assert!(first.iter().all(Result::is_ok));

    let err = stack.service.chat(request, 1000).await.err().unwrap();
    assert!(matches!(err, ChatError::BudgetExhausted));
    assert_eq!(stack.provider.requests().len(), 1);
}

#[tokio::test]
async fn provider_failure_surfaces_with_partial_reply() {
    let stack = stack(-1.0);
    stack.provider.enqueue_stream_items(vec![
        Ok(delta("Hel")),
        Err(chatbot_runtime::ProviderError::HttpStatus {
            status: 429,
            body: "Rate limit exceeded".to_string(),
        }),
    ]);

    let conversation = conversation();
    let events = stack
        .service
        .chat(ChatRequest::from_conversation("dave", &conversation), 1000)
        .await
        .unwrap();

    let err = reconcile(events, conversation, &CancellationToken::new(), |_| {})
        .await
        .unwrap_err();

    assert_eq!(err.partial().messages.last().unwrap().content, "Hel");
    assert!(err.to_string().contains("Rate limit exceeded"));
    assert!(stack.ledger.records().await.is_empty());
}
