/// Message handlers module
///
/// This module handles:
/// - Routing messages between the intake flows and the RAG answer path
/// - Managing conversation history per chat
/// - The persistent reply keyboard and the /start, /help, /cancel commands
/// - Forwarding completed requests to the managers' group and the
///   interaction log

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::{
    ChatAction, ChatId, KeyboardButton, KeyboardMarkup, KeyboardRemove, ParseMode,
};
use tokio::sync::RwLock;

use crate::config::Config;
use crate::intake::{CompletedRequest, IntakeManager, IntakeStep, RequestKind, UserProfile};
use crate::rag::{ConversationMessage, RagSystem};
use crate::sheets::{current_timestamp, DialogRow, InteractionLog};

/// Labels of the persistent keyboard buttons
pub const BUTTON_CONTACT_MANAGER: &str = "Contact a manager";
pub const BUTTON_MAKE_ORDER: &str = "Place an order";

const GENERATION_FAILED_REPLY: &str =
    "Sorry, something went wrong while processing your question. Please try again.";

const FALLBACK_GREETING: &str =
    "Hello! I am the shop assistant. Ask me anything about our products, \
    or use the buttons below to contact a manager or place an order.";

/// Shared handle to whatever records interactions
pub type SharedLog = Arc<dyn InteractionLog>;

/// Manages conversation history for multiple chats
pub struct ConversationManager {
    /// Maps chat_id to conversation history
    conversations: RwLock<HashMap<i64, Vec<ConversationMessage>>>,
    max_history: usize,
}

impl ConversationManager {
    pub fn new(max_history: usize) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            max_history,
        }
    }

    /// Add a user message to conversation history
    pub async fn add_user_message(&self, chat_id: i64, message: String) {
        self.push(chat_id, ConversationMessage::user(message)).await;
    }

    /// Add an assistant message to conversation history
    pub async fn add_assistant_message(&self, chat_id: i64, message: String) {
        self.push(chat_id, ConversationMessage::assistant(message)).await;
    }

    async fn push(&self, chat_id: i64, message: ConversationMessage) {
        let mut conversations = self.conversations.write().await;
        let history = conversations.entry(chat_id).or_insert_with(Vec::new);
        history.push(message);

        // Trim history if it exceeds max
        if history.len() > self.max_history {
            let start = history.len() - self.max_history;
            *history = history[start..].to_vec();
        }
    }

    /// Get conversation history for a chat
    pub async fn get_history(&self, chat_id: i64) -> Vec<ConversationMessage> {
        let conversations = self.conversations.read().await;
        conversations.get(&chat_id).cloned().unwrap_or_default()
    }

    /// Clear conversation history for a chat
    pub async fn clear_history(&self, chat_id: i64) {
        let mut conversations = self.conversations.write().await;
        conversations.remove(&chat_id);
    }
}

/// The persistent keyboard shown with every normal reply
pub fn main_keyboard() -> KeyboardMarkup {
    KeyboardMarkup::new(vec![vec![
        KeyboardButton::new(BUTTON_CONTACT_MANAGER),
        KeyboardButton::new(BUTTON_MAKE_ORDER),
    ]])
    .resize_keyboard(true)
    .input_field_placeholder("Ask a question or pick an action".to_string())
}

fn profile_from(user: &teloxide::types::User) -> UserProfile {
    UserProfile {
        user_id: user.id.0,
        username: user.username.clone(),
        first_name: Some(user.first_name.clone()),
        last_name: user.last_name.clone(),
    }
}

/// Main message handler
///
/// Keyboard buttons start an intake flow, an active intake session consumes
/// the message, everything else goes through catalog retrieval and the chat
/// model.
pub async fn handle_message(
    bot: Bot,
    msg: Message,
    rag: Arc<RagSystem>,
    conversations: Arc<ConversationManager>,
    intake: Arc<IntakeManager>,
    interaction_log: SharedLog,
    config: Arc<Config>,
) -> Result<()> {
    let text = match msg.text() {
        Some(t) => t.to_string(),
        None => return Ok(()), // Ignore non-text messages
    };
    let user = match msg.from() {
        Some(u) => u.clone(),
        None => return Ok(()),
    };

    log::debug!("Received message in chat {}: {}", msg.chat.id, text);

    if text == BUTTON_CONTACT_MANAGER {
        return begin_intake(bot, msg, RequestKind::Consultation, intake, interaction_log).await;
    }
    if text == BUTTON_MAKE_ORDER {
        return begin_intake(bot, msg, RequestKind::Order, intake, interaction_log).await;
    }

    if intake.is_active(user.id.0).await {
        return advance_intake(bot, msg, text, intake, interaction_log, config).await;
    }

    answer_with_rag(bot, msg, text, rag, conversations, interaction_log).await
}

/// Start collecting a consultation or order request
async fn begin_intake(
    bot: Bot,
    msg: Message,
    kind: RequestKind,
    intake: Arc<IntakeManager>,
    interaction_log: SharedLog,
) -> Result<()> {
    let user = match msg.from() {
        Some(u) => u.clone(),
        None => return Ok(()),
    };

    intake.begin(profile_from(&user), kind).await;

    let (button, note) = match kind {
        RequestKind::Consultation => (
            BUTTON_CONTACT_MANAGER,
            "Started collecting consultation details",
        ),
        RequestKind::Order => (BUTTON_MAKE_ORDER, "Started collecting order details"),
    };

    if let Err(e) = interaction_log
        .log_dialog(dialog_row(&user, button.to_string(), note.to_string()))
        .await
    {
        log::error!("Failed to log button press: {:#}", e);
    }

    let header = match kind {
        RequestKind::Consultation => "📞 *Contact a manager*",
        RequestKind::Order => "🛒 *Place an order*",
    };

    bot.send_message(msg.chat.id, format!("{}\n\nPlease enter your name:", header))
        .parse_mode(ParseMode::Markdown)
        .reply_markup(KeyboardRemove::new())
        .await?;

    Ok(())
}

/// Feed a message into the user's active intake session
async fn advance_intake(
    bot: Bot,
    msg: Message,
    text: String,
    intake: Arc<IntakeManager>,
    interaction_log: SharedLog,
    config: Arc<Config>,
) -> Result<()> {
    let user = match msg.from() {
        Some(u) => u.clone(),
        None => return Ok(()),
    };

    match intake.advance(user.id.0, &text).await {
        Some(IntakeStep::AskPhone) => {
            bot.send_message(msg.chat.id, "Thank you! Now enter your phone number:")
                .reply_markup(KeyboardRemove::new())
                .await?;
        }
        Some(IntakeStep::AskOrderDetails) => {
            bot.send_message(msg.chat.id, "Great! Now describe what you would like to order:")
                .reply_markup(KeyboardRemove::new())
                .await?;
        }
        Some(IntakeStep::Completed(request)) => {
            finish_request(bot, msg, request, interaction_log, config).await?;
        }
        None => {
            bot.send_message(
                msg.chat.id,
                "Something went wrong. Please start over using the keyboard button.",
            )
            .reply_markup(main_keyboard())
            .await?;
        }
    }

    Ok(())
}

/// Notify the managers' group and log the completed request
async fn finish_request(
    bot: Bot,
    msg: Message,
    request: CompletedRequest,
    interaction_log: SharedLog,
    config: Arc<Config>,
) -> Result<()> {
    if let Some(group_id) = config.manager_chat_id {
        let notification = request.group_message(&current_timestamp());
        if let Err(e) = bot
            .send_message(ChatId(group_id), notification)
            .parse_mode(ParseMode::Markdown)
            .await
        {
            log::error!("Failed to notify the managers' group: {:#}", e);
        }
    } else {
        log::warn!("MANAGER_CHAT_ID not set - request will not be forwarded to a group");
    }

    let log_result = match request.kind {
        RequestKind::Consultation => interaction_log.log_consultation(&request).await,
        RequestKind::Order => interaction_log.log_order(&request).await,
    };
    if let Err(e) = log_result {
        log::error!("Failed to log {} request: {:#}", request.kind.label(), e);
    }

    let summary = match request.kind {
        RequestKind::Consultation => format!(
            "Consultation request: name={}, phone={}",
            request.name, request.phone
        ),
        RequestKind::Order => format!("Order request: {}", request.order_info()),
    };
    let note = match request.kind {
        RequestKind::Consultation => "Consultation request accepted",
        RequestKind::Order => "Order request accepted",
    };

    let row = DialogRow {
        user_id: request.profile.user_id,
        username: request.profile.username.clone(),
        first_name: request.profile.first_name.clone(),
        last_name: request.profile.last_name.clone(),
        user_message: summary,
        bot_response: note.to_string(),
    };
    if let Err(e) = interaction_log.log_dialog(row).await {
        log::error!("Failed to log request dialog: {:#}", e);
    }

    let confirmation = match request.kind {
        RequestKind::Consultation => {
            "✅ *Thank you!*\n\n\
            Your consultation request has been received! Our manager will \
            contact you shortly.\n\n\
            You can also ask me questions about our products and I will help \
            you choose."
        }
        RequestKind::Order => {
            "✅ *Thank you!*\n\n\
            Your order request has been received! Our manager will contact \
            you to confirm the details.\n\n\
            If you have questions about our products, I am happy to help you \
            choose."
        }
    };

    bot.send_message(msg.chat.id, confirmation)
        .parse_mode(ParseMode::Markdown)
        .reply_markup(main_keyboard())
        .await?;

    Ok(())
}

/// Answer a free-form question through retrieval and the chat model
async fn answer_with_rag(
    bot: Bot,
    msg: Message,
    text: String,
    rag: Arc<RagSystem>,
    conversations: Arc<ConversationManager>,
    interaction_log: SharedLog,
) -> Result<()> {
    let user = match msg.from() {
        Some(u) => u.clone(),
        None => return Ok(()),
    };
    let chat_id = msg.chat.id;

    // Show "typing" while we search and generate
    bot.send_chat_action(chat_id, ChatAction::Typing).await?;

    // A failed search degrades to answering without catalog context
    let rag_context = match rag.search(&text).await {
        Ok(hits) => rag.build_context(&hits),
        Err(e) => {
            log::error!("Catalog search failed: {:#}", e);
            None
        }
    };

    let history = conversations.get_history(chat_id.0).await;

    let reply = match rag
        .generate_reply(&text, &history, rag_context.as_deref())
        .await
    {
        Ok(reply) => reply,
        Err(e) => {
            log::error!("Reply generation failed: {:#}", e);
            bot.send_message(chat_id, GENERATION_FAILED_REPLY)
                .reply_markup(main_keyboard())
                .await?;
            return Ok(());
        }
    };

    conversations.add_user_message(chat_id.0, text.clone()).await;
    conversations
        .add_assistant_message(chat_id.0, reply.clone())
        .await;

    if let Err(e) = interaction_log
        .log_dialog(dialog_row(&user, text, reply.clone()))
        .await
    {
        log::error!("Failed to log dialog: {:#}", e);
    }

    bot.send_message(chat_id, reply)
        .parse_mode(ParseMode::Markdown)
        .reply_markup(main_keyboard())
        .await?;

    Ok(())
}

fn dialog_row(user: &teloxide::types::User, user_message: String, bot_response: String) -> DialogRow {
    DialogRow {
        user_id: user.id.0,
        username: user.username.clone(),
        first_name: Some(user.first_name.clone()),
        last_name: user.last_name.clone(),
        user_message,
        bot_response,
    }
}

/// Handle the /start command: the greeting itself comes from the chat model
pub async fn handle_start_command(
    bot: Bot,
    msg: Message,
    rag: Arc<RagSystem>,
    conversations: Arc<ConversationManager>,
    interaction_log: SharedLog,
) -> Result<()> {
    let greeting = match rag.greeting().await {
        Ok(greeting) => greeting,
        Err(e) => {
            log::error!("Greeting generation failed: {:#}", e);
            FALLBACK_GREETING.to_string()
        }
    };

    let chat_id = msg.chat.id;
    conversations
        .add_user_message(chat_id.0, "/start".to_string())
        .await;
    conversations
        .add_assistant_message(chat_id.0, greeting.clone())
        .await;

    if let Some(user) = msg.from() {
        if let Err(e) = interaction_log
            .log_dialog(dialog_row(user, "/start".to_string(), greeting.clone()))
            .await
        {
            log::error!("Failed to log /start dialog: {:#}", e);
        }
    }

    bot.send_message(chat_id, greeting)
        .parse_mode(ParseMode::Markdown)
        .reply_markup(main_keyboard())
        .await?;

    Ok(())
}

/// Handle the /help command
pub async fn handle_help_command(bot: Bot, msg: Message) -> Result<()> {
    let help_message = format!(
        "ℹ️ Shop assistant help\n\n\
        Commands:\n\
        /start - Welcome message\n\
        /help - Show this help message\n\
        /cancel - Abort the current request\n\n\
        Just send me a question about our products and I will look it up in \
        the catalog.\n\n\
        Keyboard buttons:\n\
        • {} - leave your name and phone so a manager calls you back\n\
        • {} - describe what you want to buy and a manager will confirm the \
        order",
        BUTTON_CONTACT_MANAGER, BUTTON_MAKE_ORDER
    );

    bot.send_message(msg.chat.id, help_message)
        .reply_markup(main_keyboard())
        .await?;

    Ok(())
}

/// Handle the /cancel command to abort an intake flow
pub async fn handle_cancel_command(
    bot: Bot,
    msg: Message,
    intake: Arc<IntakeManager>,
) -> Result<()> {
    let cancelled = match msg.from() {
        Some(user) => intake.cancel(user.id.0).await,
        None => false,
    };

    let reply = if cancelled {
        "Operation cancelled."
    } else {
        "Nothing to cancel."
    };

    bot.send_message(msg.chat.id, reply)
        .reply_markup(main_keyboard())
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn history_is_trimmed_to_the_configured_maximum() {
        let manager = ConversationManager::new(4);

        for i in 0..6 {
            manager.add_user_message(1, format!("question {}", i)).await;
            manager
                .add_assistant_message(1, format!("answer {}", i))
                .await;
        }

        let history = manager.get_history(1).await;
        assert_eq!(history.len(), 4);
        // Oldest entries dropped, last two exchanges kept
        assert_eq!(history[0].content, "question 4");
        assert_eq!(history[3].content, "answer 5");

        // Other chats are unaffected
        assert!(manager.get_history(2).await.is_empty());
    }

    #[tokio::test]
    async fn clear_history_forgets_one_chat() {
        let manager = ConversationManager::new(10);
        manager.add_user_message(1, "hello".to_string()).await;
        manager.add_user_message(2, "hi".to_string()).await;

        manager.clear_history(1).await;
        assert!(manager.get_history(1).await.is_empty());
        assert_eq!(manager.get_history(2).await.len(), 1);
    }

    #[test]
    fn keyboard_has_both_action_buttons_in_one_row() {
        let keyboard = main_keyboard();
        assert_eq!(keyboard.keyboard.len(), 1);
        let labels: Vec<&str> = keyboard.keyboard[0]
            .iter()
            .map(|b| b.text.as_str())
            .collect();
        assert_eq!(labels, vec![BUTTON_CONTACT_MANAGER, BUTTON_MAKE_ORDER]);
    }
}
