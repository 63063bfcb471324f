/// Telegram bot module
///
/// This module sets up and runs the Telegram bot using the teloxide framework.
/// It connects all the pieces: configuration, RAG system, intake flows,
/// interaction logging, and conversation management.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use teloxide::{prelude::*, types::Me, utils::command::BotCommands};
use tokio::time::sleep;

use crate::config::Config;
use crate::handlers::{
    handle_cancel_command, handle_help_command, handle_message, handle_start_command,
    ConversationManager, SharedLog,
};
use crate::intake::IntakeManager;
use crate::rag::RagSystem;
use crate::sheets::{GoogleSheetsLog, NullLog};

/// Bot commands that users can use
#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Supported commands:")]
pub enum Command {
    #[command(description = "Start the bot and see the welcome message")]
    Start,
    #[command(description = "Show help information")]
    Help,
    #[command(description = "Abort the current request")]
    Cancel,
}

/// Pick the interaction log implementation for this deployment
///
/// A missing spreadsheet id or unreadable credentials file downgrades to the
/// no-op log with a warning; the bot itself keeps working.
pub fn build_interaction_log(config: &Config) -> SharedLog {
    match &config.spreadsheet_id {
        Some(spreadsheet_id) => {
            match GoogleSheetsLog::from_file(&config.sheets_credentials_file, spreadsheet_id.clone())
            {
                Ok(log) => {
                    log::info!("Google Sheets logging enabled");
                    Arc::new(log)
                }
                Err(e) => {
                    log::warn!("Google Sheets logging disabled: {:#}", e);
                    Arc::new(NullLog)
                }
            }
        }
        None => {
            log::warn!("Google Sheets logging disabled: GOOGLE_SHEETS_SPREADSHEET_ID not set");
            Arc::new(NullLog)
        }
    }
}

/// Initialize and run the Telegram bot with a pre-initialized RAG system
pub async fn run_bot_with_rag(config: Config, rag_system: Arc<RagSystem>) -> Result<()> {
    log::info!("Initializing bot...");

    let conversation_manager = Arc::new(ConversationManager::new(config.max_conversation_history));
    let intake_manager = Arc::new(IntakeManager::new());
    let interaction_log = build_interaction_log(&config);
    let config = Arc::new(config);

    // Extended timeouts; long polling holds connections open
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .connect_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .context("Failed to create HTTP client")?;

    let bot = Bot::with_client(&config.telegram_token, client);

    let me = retry_get_me(&bot)
        .await
        .context("Failed to connect to Telegram API after multiple retries")?;
    log::info!("Bot started: @{}", me.username());

    let handler = dptree::entry()
        // Handle commands
        .branch(
            Update::filter_message()
                .filter_command::<Command>()
                .endpoint(
                    |bot: Bot,
                     msg: Message,
                     cmd: Command,
                     rag_system: Arc<RagSystem>,
                     conversation_manager: Arc<ConversationManager>,
                     intake_manager: Arc<IntakeManager>,
                     interaction_log: SharedLog| async move {
                        match cmd {
                            Command::Start => {
                                handle_start_command(
                                    bot,
                                    msg,
                                    rag_system,
                                    conversation_manager,
                                    interaction_log,
                                )
                                .await
                            }
                            Command::Help => handle_help_command(bot, msg).await,
                            Command::Cancel => handle_cancel_command(bot, msg, intake_manager).await,
                        }
                    },
                ),
        )
        // Handle regular messages
        .branch(
            Update::filter_message().endpoint(
                |bot: Bot,
                 msg: Message,
                 rag_system: Arc<RagSystem>,
                 conversation_manager: Arc<ConversationManager>,
                 intake_manager: Arc<IntakeManager>,
                 interaction_log: SharedLog,
                 config: Arc<Config>| async move {
                    if let Err(e) = handle_message(
                        bot,
                        msg,
                        rag_system,
                        conversation_manager,
                        intake_manager,
                        interaction_log,
                        config,
                    )
                    .await
                    {
                        log::error!("Error handling message: {:?}", e);
                    }
                    Ok(())
                },
            ),
        );

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![
            rag_system,
            conversation_manager,
            intake_manager,
            interaction_log,
            config
        ])
        .enable_ctrlc_handler()
        .build();

    log::info!("Bot is running. Press Ctrl+C to stop.");

    // teloxide handles long-polling reconnects internally
    dispatcher.dispatch().await;

    Ok(())
}

/// Retry getting bot info with exponential backoff
async fn retry_get_me(bot: &Bot) -> Result<Me> {
    let max_retries = 5;
    let mut delay = Duration::from_secs(2);

    log::info!("Connecting to Telegram API...");

    for attempt in 1..=max_retries {
        match bot.get_me().await {
            Ok(me) => {
                log::info!("Connected to Telegram API on attempt {}", attempt);
                return Ok(me);
            }
            Err(e) if attempt < max_retries => {
                log::warn!(
                    "Failed to connect to Telegram API (attempt {}/{}): {}. Retrying in {:?}...",
                    attempt,
                    max_retries,
                    e,
                    delay
                );
                sleep(delay).await;
                delay *= 2;
            }
            Err(e) => {
                anyhow::bail!(
                    "Failed to connect to Telegram API after {} attempts: {}",
                    max_retries,
                    e
                );
            }
        }
    }

    unreachable!()
}

/// Initialize and run the Telegram bot (creates its own RAG system)
pub async fn run_bot(config: Config) -> Result<()> {
    let rag_system = Arc::new(RagSystem::new(config.clone()).await?);
    rag_system.initialize_schema().await?;

    run_bot_with_rag(config, rag_system).await
}
