use std::io;
use std::sync::Arc;

use chatbot_cli::{
    count_tokens, format_models, format_usage, load_conversation, prepare_conversation, run_chat,
    save_conversation, Cli, CliError, Commands, TurnOptions,
};
use chatbot_context::Tokenizers;
use chatbot_runtime::{ChatService, InMemoryLedger, LlmApiAggregator, Meter, RuntimeConfig, StreamState};
use clap::Parser;
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "chatbot_cli=info,chatbot_runtime=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();
    let config = RuntimeConfig::from_env()?;

    match cli.command {
        Commands::Models => {
            let aggregator = LlmApiAggregator::from_config(&config);
            aggregator.init().await?;
            print!("{}", format_models(&aggregator.list_models()));
        }
        Commands::Count { model, text } => {
            println!("{}", count_tokens(&Tokenizers::new(), &model, &text)?);
        }
        Commands::Chat {
            model,
            system,
            temperature,
            history,
            save,
            reserved,
            message,
        } => {
            let history = history.as_deref().map(load_conversation).transpose()?;
            let conversation = prepare_conversation(
                history,
                TurnOptions {
                    model,
                    system,
                    temperature,
                },
                &message,
                &config,
            )?;
            let reserved = reserved.unwrap_or(config.reserved_for_completion);

            let aggregator = LlmApiAggregator::from_config(&config);
            aggregator.init().await?;
            let service = build_service(config, aggregator);

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupted, stopping reply");
                    on_interrupt.cancel();
                }
            });

            let outcome = run_chat(
                &service,
                &cli.user,
                conversation,
                reserved,
                &cancel,
                io::stdout(),
            )
            .await;

            let conversation = match outcome {
                Ok(reconciled) => {
                    println!();
                    if reconciled.state == StreamState::Aborted {
                        eprintln!("{}", "reply cancelled".yellow());
                    }
                    reconciled.conversation
                }
                Err(CliError::Stream { message, partial }) => {
                    println!();
                    eprintln!("{} {message}", "error:".red());
                    if let Some(path) = &save {
                        save_conversation(path, &partial)?;
                    }
                    anyhow::bail!("reply interrupted");
                }
                Err(err) => return Err(err.into()),
            };

            if let Some(usage) = conversation.last_message().and_then(|reply| reply.usage.as_ref()) {
                eprintln!("{}", format_usage(usage).dimmed());
            }
            if let Some(path) = &save {
                save_conversation(path, &conversation)?;
                eprintln!("{} {}", "saved".green(), path.display());
            }
        }
    }

    Ok(())
}

fn build_service(config: RuntimeConfig, aggregator: LlmApiAggregator) -> ChatService {
    let meter = Meter::new(
        Arc::new(InMemoryLedger::new()),
        config.default_user_limit_usd_monthly,
    );
    ChatService::new(Arc::new(aggregator), meter, config)
}
