use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chatbot_context::{text_tokens, ContextError, Tokenizers};
use chatbot_core::{Conversation, Llm, LlmTemperature, Message, MessageUsage, Role};
use chatbot_runtime::{
    reconcile, ChatError, ChatRequest, ChatService, ConfigError, ProviderError, Reconciled,
    ReconcileError, RuntimeConfig,
};
use clap::{Parser, Subcommand};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "chatbot-cli",
    version,
    about = "Chatbot command line client",
    long_about = "Chatbot command line client for listing models, counting tokens, and streaming chat replies"
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "CHATBOT_USER",
        default_value = "local",
        help = "User id used for budget checks and usage records"
    )]
    pub user: String,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    #[command(about = "List the models served by the configured providers")]
    Models,
    #[command(about = "Count the tokens of a text")]
    Count {
        #[arg(long, default_value = "gpt-3.5-turbo", help = "Model whose encoding is used")]
        model: String,
        #[arg(help = "Text to count")]
        text: String,
    },
    #[command(about = "Send a message and stream the reply")]
    Chat {
        #[arg(long, help = "Model id (defaults to the conversation's or DEFAULT_MODEL)")]
        model: Option<String>,
        #[arg(long, help = "System prompt")]
        system: Option<String>,
        #[arg(long, help = "Temperature preset: precise, neutral or creative")]
        temperature: Option<LlmTemperature>,
        #[arg(long, help = "Conversation JSON file to continue")]
        history: Option<PathBuf>,
        #[arg(long, help = "Write the resulting conversation to this file")]
        save: Option<PathBuf>,
        #[arg(long, help = "Tokens kept free for the reply (defaults to RESERVED_FOR_COMPLETION)")]
        reserved: Option<usize>,
        #[arg(help = "Message to send")]
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Chat(#[from] ChatError),
    #[error("{path}: {message}")]
    Io { path: PathBuf, message: String },
    #[error("{path}: invalid conversation file: {message}")]
    Decode { path: PathBuf, message: String },
    #[error("reply interrupted: {message}")]
    Stream {
        message: String,
        partial: Box<Conversation>,
    },
}

impl From<ReconcileError> for CliError {
    fn from(err: ReconcileError) -> Self {
        let message = err.to_string();
        CliError::Stream {
            message,
            partial: Box::new(err.into_partial()),
        }
    }
}

/// Token count of `text` under the encoding of `model_id`.
pub fn count_tokens(tokenizers: &Tokenizers, model_id: &str, text: &str) -> Result<usize, CliError> {
    let tokenizer = tokenizers.acquire(model_id)?;
    Ok(text_tokens(&tokenizer, text))
}

pub fn format_models(models: &[Llm]) -> String {
    if models.is_empty() {
        return "No models available.\n".to_string();
    }

    let width = models.iter().map(|model| model.id.len()).max().unwrap_or(0);
    let mut output = String::new();
    for model in models {
        output.push_str(&format!(
            "{:<width$}  {:<10}  {:>7} tokens  {}\n",
            model.id,
            format!("{:?}", model.kind).to_lowercase(),
            model.token_limit,
            model.name,
        ));
    }
    output
}

pub fn format_usage(usage: &MessageUsage) -> String {
    let tokens = &usage.tokens;
    let mut line = format!(
        "tokens: {} prompt + {} completion = {}",
        tokens.prompt, tokens.completion, tokens.total
    );
    if let Some(price) = usage.total_price_usd {
        line.push_str(&format!(", ${price:.6}"));
    }
    line
}

pub fn load_conversation(path: &Path) -> Result<Conversation, CliError> {
    let raw = fs::read_to_string(path).map_err(|err| CliError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    serde_json::from_str(&raw).map_err(|err| CliError::Decode {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

pub fn save_conversation(path: &Path, conversation: &Conversation) -> Result<(), CliError> {
    let json = serde_json::to_string_pretty(conversation).map_err(|err| CliError::Decode {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    fs::write(path, json).map_err(|err| CliError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

/// Settings given on the command line for one chat turn.
#[derive(Debug, Clone, Default)]
pub struct TurnOptions {
    pub model: Option<String>,
    pub system: Option<String>,
    pub temperature: Option<LlmTemperature>,
}

/// The conversation to send: `history` (or a fresh one) with command line
/// overrides applied and `message` appended as the new user turn.
pub fn prepare_conversation(
    history: Option<Conversation>,
    options: TurnOptions,
    message: &str,
    config: &RuntimeConfig,
) -> Result<Conversation, CliError> {
    if message.trim().is_empty() {
        return Err(CliError::InvalidArgument("message must not be empty".to_string()));
    }

    let mut conversation = history.unwrap_or_else(|| {
        Conversation::new(&config.default_model, &config.default_system_prompt)
    });
    if let Some(model) = options.model {
        conversation.model_id = model;
    }
    if let Some(system) = options.system {
        conversation.prompt = system;
    }
    if let Some(temperature) = options.temperature {
        conversation.temperature = temperature;
    }
    if conversation.name.is_empty() {
        conversation.name = message.chars().take(30).collect();
    }

    conversation.push(Message::user(message));
    Ok(conversation)
}

/// Writes the part of the streamed reply not yet printed.
pub struct ReplyPrinter<W> {
    out: W,
    printed: usize,
    failed: Option<io::Error>,
}

impl<W: Write> ReplyPrinter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            printed: 0,
            failed: None,
        }
    }

    /// Writes the part of the reply not printed yet. Stops writing after
    /// the first output error.
    pub fn update(&mut self, conversation: &Conversation) {
        if self.failed.is_some() {
            return;
        }
        let Some(reply) = conversation
            .last_message()
            .filter(|message| message.role == Role::Assistant)
        else {
            return;
        };

        if let Some(fresh) = reply.content.get(self.printed..) {
            if !fresh.is_empty() {
                let written = self
                    .out
                    .write_all(fresh.as_bytes())
                    .and_then(|()| self.out.flush());
                match written {
                    Ok(()) => self.printed = reply.content.len(),
                    Err(err) => self.failed = Some(err),
                }
            }
        }
    }

    pub fn error(&self) -> Option<&io::Error> {
        self.failed.as_ref()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Runs one chat turn and streams the reply into `out`. Cancelling
/// `cancel` stops the reply and keeps what arrived so far.
pub async fn run_chat<W: Write>(
    service: &ChatService,
    user_id: &str,
    conversation: Conversation,
    reserved_for_completion: usize,
    cancel: &CancellationToken,
    out: W,
) -> Result<Reconciled, CliError> {
    let request = ChatRequest::from_conversation(user_id, &conversation);
    let events = service.chat(request, reserved_for_completion).await?;

    let mut printer = ReplyPrinter::new(out);
    let reconciled = reconcile(events, conversation, cancel, |snapshot| printer.update(snapshot)).await?;
    if let Some(err) = printer.error() {
        return Err(CliError::Stream {
            message: format!("writing reply: {err}"),
            partial: Box::new(reconciled.conversation),
        });
    }
    Ok(reconciled)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chatbot_core::TokenUsage;
    use chatbot_runtime::{
        InMemoryLedger, LlmApi, LlmApiAggregator, Meter, MockProvider, StreamChunk, StreamState,
    };
    use clap::Parser;

    use super::*;

    fn service(provider: Arc<MockProvider>) -> ChatService {
        let aggregator = LlmApiAggregator::new(vec![provider as Arc<dyn LlmApi>]);
        let meter = Meter::new(Arc::new(InMemoryLedger::new()), -1.0);
        ChatService::new(Arc::new(aggregator), meter, RuntimeConfig::default())
    }

    fn provider() -> Arc<MockProvider> {
        Arc::new(MockProvider::new().with_models(vec![Llm::known("gpt-3.5-turbo").unwrap()]))
    }

    #[test]
    fn cli_parses_chat_command() {
        let cli = Cli::parse_from([
            "chatbot-cli",
            "--user",
            "alice",
            "chat",
            "--model",
            "gpt-4",
            "--temperature",
            "creative",
            "--save",
            "out.json",
            "hello there",
        ]);

        assert_eq!(cli.user, "alice");
        match cli.command {
            Commands::Chat {
                model,
                temperature,
                save,
                message,
                ..
            } => {
                assert_eq!(model.as_deref(), Some("gpt-4"));
                assert_eq!(temperature, Some(LlmTemperature::Creative));
                assert_eq!(save, Some(PathBuf::from("out.json")));
                assert_eq!(message, "hello there");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn cli_rejects_unknown_temperature() {
        let result = Cli::try_parse_from(["chatbot-cli", "chat", "--temperature", "hot", "hi"]);
        assert!(result.is_err());
    }

    #[test]
    fn cli_parses_count_command() {
        let cli = Cli::parse_from(["chatbot-cli", "count", "hello world"]);
        match cli.command {
            Commands::Count { model, text } => {
                assert_eq!(model, "gpt-3.5-turbo");
                assert_eq!(text, "hello world");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn count_uses_model_encoding() {
        let tokenizers = Tokenizers::new();
        assert_eq!(count_tokens(&tokenizers, "gpt-4", "hello world").unwrap(), 2);
        assert_eq!(
            count_tokens(&tokenizers, "gpt-4", "<|im_start|>user").unwrap(),
            2
        );
        assert_eq!(tokenizers.active_leases(), 0);
    }

    #[test]
    fn prepare_applies_overrides_and_appends_message() {
        let config = RuntimeConfig::default();
        let history = Conversation::new("gpt-3.5-turbo", "old prompt")
            .with_message(Message::user("first"))
            .with_message(Message::assistant("reply"));

        let conversation = prepare_conversation(
            Some(history),
            TurnOptions {
                model: Some("gpt-4".to_string()),
                system: None,
                temperature: Some(LlmTemperature::Precise),
            },
            "second",
            &config,
        )
        .unwrap();

        assert_eq!(conversation.model_id, "gpt-4");
        assert_eq!(conversation.prompt, "old prompt");
        assert_eq!(conversation.temperature, LlmTemperature::Precise);
        assert_eq!(conversation.messages.len(), 3);
        assert_eq!(conversation.messages[2], Message::user("second"));
    }

    #[test]
    fn prepare_starts_from_config_defaults() {
        let config = RuntimeConfig::default();
        let conversation =
            prepare_conversation(None, TurnOptions::default(), "hi", &config).unwrap();

        assert_eq!(conversation.model_id, config.default_model);
        assert_eq!(conversation.prompt, config.default_system_prompt);
        assert!(prepare_conversation(None, TurnOptions::default(), "  ", &config).is_err());
    }

    #[test]
    fn conversation_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversation.json");
        let conversation = Conversation::new("gpt-4", "be nice").with_message(Message::user("hi"));

        save_conversation(&path, &conversation).unwrap();
        assert_eq!(load_conversation(&path).unwrap(), conversation);

        fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_conversation(&path), Err(CliError::Decode { .. })));
        assert!(matches!(
            load_conversation(&dir.path().join("missing.json")),
            Err(CliError::Io { .. })
        ));
    }

    #[test]
    fn printer_writes_only_new_text() {
        let mut printer = ReplyPrinter::new(Vec::new());
        let mut conversation = Conversation::new("gpt-4", "").with_message(Message::user("hi"));
        printer.update(&conversation);

        conversation.push(Message::assistant("Hel"));
        printer.update(&conversation);
        conversation.trailing_assistant_mut().unwrap().content = "Hello".to_string();
        printer.update(&conversation);
        printer.update(&conversation);

        assert_eq!(String::from_utf8(printer.into_inner()).unwrap(), "Hello");
    }

    struct ClosedPipe {
        writes: usize,
    }

    impl Write for ClosedPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            self.writes += 1;
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn printer_stops_after_write_error() {
        let mut printer = ReplyPrinter::new(ClosedPipe { writes: 0 });
        let mut conversation = Conversation::new("gpt-4", "").with_message(Message::assistant("Hel"));
        printer.update(&conversation);
        conversation.trailing_assistant_mut().unwrap().content = "Hello".to_string();
        printer.update(&conversation);

        assert_eq!(printer.error().unwrap().kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(printer.into_inner().writes, 1);
    }

    #[test]
    fn usage_line_includes_price_when_known() {
        let usage = MessageUsage::new(TokenUsage::new(10, 5));
        assert_eq!(format_usage(&usage), "tokens: 10 prompt + 5 completion = 15");
        assert!(format_usage(&usage.with_price(0.0125)).ends_with(", $0.012500"));
    }

    #[test]
    fn model_table_lists_ids() {
        let table = format_models(&[Llm::known("gpt-4").unwrap()]);
        assert!(table.starts_with("gpt-4"));
        assert_eq!(format_models(&[]), "No models available.\n");
    }

    #[tokio::test]
    async fn run_chat_streams_reply_to_writer() {
        let provider = provider();
        provider.enqueue_stream(Ok(vec![
            StreamChunk::Delta {
                text: "Hi".to_string(),
            },
            StreamChunk::Delta {
                text: " there".to_string(),
            },
            StreamChunk::Done,
        ]));
        let service = service(provider);
        let conversation = Conversation::new("gpt-3.5-turbo", "").with_message(Message::user("hey"));

        let mut out = Vec::new();
        let result = run_chat(
            &service,
            "u1",
            conversation,
            500,
            &CancellationToken::new(),
            &mut out,
        )
        .await
        .unwrap();

        assert_eq!(result.state, StreamState::Done);
        assert_eq!(String::from_utf8(out).unwrap(), "Hi there");
        let reply = result.conversation.last_message().unwrap();
        assert_eq!(reply.content, "Hi there");
        assert!(reply.usage.is_some());
    }

    #[tokio::test]
    async fn run_chat_keeps_partial_reply_on_cancel() {
        let provider = provider();
        provider.enqueue_stalled_stream(vec![StreamChunk::Delta {
            text: "Par".to_string(),
        }]);
        let service = service(provider);
        let conversation = Conversation::new("gpt-3.5-turbo", "").with_message(Message::user("hey"));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = run_chat(&service, "u1", conversation, 500, &cancel, Vec::new())
            .await
            .unwrap();
        task.await.unwrap();

        assert!(result.is_aborted());
        assert_eq!(result.conversation.last_message().unwrap().content, "Par");
    }

    #[tokio::test]
    async fn run_chat_reports_unknown_model() {
        let service = service(provider());
        let conversation = Conversation::new("gpt-4", "").with_message(Message::user("hey"));

        let err = run_chat(
            &service,
            "u1",
            conversation,
            500,
            &CancellationToken::new(),
            Vec::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, CliError::Chat(ChatError::ModelNotFound(_))));
    }

    #[tokio::test]
    async fn run_chat_reports_output_failure_with_reply() {
        let provider = provider();
        provider.enqueue_stream(Ok(vec![
            StreamChunk::Delta {
                text: "Hi".to_string(),
            },
            StreamChunk::Done,
        ]));
        let service = service(provider);
        let conversation = Conversation::new("gpt-3.5-turbo", "").with_message(Message::user("hey"));

        let err = run_chat(
            &service,
            "u1",
            conversation,
            500,
            &CancellationToken::new(),
            ClosedPipe { writes: 0 },
        )
        .await
        .unwrap_err();

        match err {
            CliError::Stream { message, partial } => {
                assert!(message.contains("broken pipe"));
                assert_eq!(partial.last_message().unwrap().content, "Hi");
            }
            other => panic!("expected an output error, got {other:?}"),
        }
    }
}
