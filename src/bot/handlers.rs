//! Telegram update handlers.
//!
//! Glue between teloxide and the registration/chat flows: pull the inputs
//! out of the message, run the flow, send the reply. Errors are logged and
//! turned into a short user-facing message.

use crate::bot::chat::{self, ChatError, PhotoRequest};
use crate::bot::messaging::{send_markdown_reply, send_text};
use crate::bot::registration::{
    self, ContactOutcome, SharedContact, StartOutcome, TelegramProfile,
};
use crate::llm::GenerativeModel;
use crate::storage::UserStore;
use crate::utils::retry_telegram_operation;
use anyhow::{anyhow, Result};
use std::sync::Arc;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{
    ButtonRequest, ChatAction, ChatId, KeyboardButton, KeyboardMarkup, KeyboardRemove, PhotoSize,
    ReplyMarkup,
};
use teloxide::utils::command::BotCommands;
use tracing::{error, info, warn};

/// Reply to a first `/start`
pub const MSG_WELCOME_NEW: &str = "Welcome! Please share your phone number to register:";
/// Reply to `/start` from a registered user
pub const MSG_WELCOME_BACK: &str = "Welcome back! You're fully registered and ready to chat!";
/// Reply to `/start` from a pending user
pub const MSG_REGISTRATION_INCOMPLETE: &str =
    "⚠️ Registration incomplete. Please share your contact:";
/// Reply to a verified contact
pub const MSG_REGISTERED: &str = "✅ Registration successful! Ask me anything:";
/// Reply when the contact changed nothing
pub const MSG_REGISTRATION_FAILED: &str = "⚠️ Registration failed. Please try /start";
/// Reply to a contact that is not the sender's own
pub const MSG_FOREIGN_CONTACT: &str =
    "⚠️ Please share your own contact using the button below.";
/// Reply to a contact without a usable phone number
pub const MSG_INVALID_PHONE: &str =
    "⚠️ This contact has no valid phone number. Please share your contact again:";
/// Reply to an unregistered user trying to chat
pub const MSG_REGISTER_FIRST: &str =
    "⚠️ Complete registration first!\nUse /start and share your contact.";
/// Reply when `/start` hits a storage error
pub const MSG_SERVICE_UNAVAILABLE: &str = "Service temporary unavailable. Please try again later.";
/// Reply when a contact hits a storage error
pub const MSG_REGISTRATION_ERROR: &str = "❌ Registration error. Please try again.";
/// Reply when a text answer fails
pub const MSG_TEXT_ERROR: &str = "❌ Error processing your message";
/// Reply when a photo analysis fails
pub const MSG_PHOTO_ERROR: &str = "❌ Failed to analyze image";
/// Reply to anything that is not text, a photo or a contact
pub const MSG_UNSUPPORTED: &str = "I can read text messages and photos. Please send one of those.";

/// Label of the contact request button
const SHARE_CONTACT_BUTTON: &str = "Share Contact";

/// Bot commands
#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "lowercase", description = "Supported commands:")]
pub enum Command {
    /// Register or check registration
    #[command(description = "start or check your registration.")]
    Start,
    /// List commands
    #[command(description = "show this help.")]
    Help,
    /// Liveness check
    #[command(description = "check that the bot is up.")]
    Healthcheck,
}

/// One-time keyboard with a single button that shares the user's contact
#[must_use]
pub fn contact_keyboard() -> KeyboardMarkup {
    let button = KeyboardButton::new(SHARE_CONTACT_BUTTON).request(ButtonRequest::Contact);
    KeyboardMarkup::new(vec![vec![button]])
        .resize_keyboard()
        .one_time_keyboard()
}

fn contact_markup() -> Option<ReplyMarkup> {
    Some(ReplyMarkup::Keyboard(contact_keyboard()))
}

fn remove_keyboard() -> Option<ReplyMarkup> {
    Some(ReplyMarkup::KeyboardRemove(KeyboardRemove::new()))
}

type Reply = (&'static str, Option<ReplyMarkup>);

/// Reply text and keyboard for a `/start` outcome
fn start_reply(outcome: StartOutcome) -> Reply {
    match outcome {
        StartOutcome::NewUser => (MSG_WELCOME_NEW, contact_markup()),
        StartOutcome::Incomplete => (MSG_REGISTRATION_INCOMPLETE, contact_markup()),
        StartOutcome::AlreadyRegistered => (MSG_WELCOME_BACK, remove_keyboard()),
    }
}

/// Reply text and keyboard for a shared-contact outcome
fn contact_reply(outcome: ContactOutcome) -> Reply {
    match outcome {
        ContactOutcome::Registered => (MSG_REGISTERED, remove_keyboard()),
        ContactOutcome::NotUpdated => (MSG_REGISTRATION_FAILED, remove_keyboard()),
        ContactOutcome::ForeignContact => (MSG_FOREIGN_CONTACT, contact_markup()),
        ContactOutcome::InvalidPhone => (MSG_INVALID_PHONE, contact_markup()),
    }
}

fn register_first_reply() -> Reply {
    (MSG_REGISTER_FIRST, remove_keyboard())
}

/// Sender profile of `msg`, keyed by its chat
#[must_use]
pub fn profile_from_message(msg: &Message) -> Option<TelegramProfile> {
    msg.from.as_ref().map(|user| TelegramProfile {
        chat_id: msg.chat.id.0,
        first_name: user.first_name.clone(),
        username: user.username.clone(),
    })
}

/// Handle `/start`
///
/// # Errors
///
/// Returns an error if the reply cannot be sent.
pub async fn start(bot: Bot, msg: Message, store: Arc<dyn UserStore>) -> Result<()> {
    let Some(profile) = profile_from_message(&msg) else {
        warn!("Ignoring /start without a sender");
        return Ok(());
    };

    let (text, markup) = match registration::start(store.as_ref(), &profile).await {
        Ok(outcome) => start_reply(outcome),
        Err(e) => {
            error!(chat_id = profile.chat_id, "Start failed: {e}");
            (MSG_SERVICE_UNAVAILABLE, remove_keyboard())
        }
    };

    send_text(&bot, msg.chat.id, text, markup).await
}

/// Handle `/help`
///
/// # Errors
///
/// Returns an error if the reply cannot be sent.
pub async fn help(bot: Bot, msg: Message) -> Result<()> {
    send_text(&bot, msg.chat.id, &Command::descriptions().to_string(), None).await
}

/// Handle `/healthcheck`
///
/// # Errors
///
/// Returns an error if the reply cannot be sent.
pub async fn healthcheck(bot: Bot, msg: Message, store: Arc<dyn UserStore>) -> Result<()> {
    let text = match store.check_connection().await {
        Ok(()) => "OK".to_string(),
        Err(e) => {
            warn!("Healthcheck: {e}");
            "⚠️ Database unavailable".to_string()
        }
    };
    send_text(&bot, msg.chat.id, &text, None).await
}

/// Handle a shared contact
///
/// # Errors
///
/// Returns an error if the reply cannot be sent.
pub async fn handle_contact(bot: Bot, msg: Message, store: Arc<dyn UserStore>) -> Result<()> {
    let Some(contact) = msg.contact() else {
        return Ok(());
    };
    let Some(sender_id) = msg.from.as_ref().map(|u| u.id.0.cast_signed()) else {
        warn!("Ignoring contact without a sender");
        return Ok(());
    };
    let chat_id = msg.chat.id.0;

    let shared = SharedContact {
        phone_number: contact.phone_number.clone(),
        user_id: contact.user_id.map(|id| id.0.cast_signed()),
    };

    let (text, markup) =
        match registration::register_contact(store.as_ref(), chat_id, sender_id, &shared).await {
            Ok(outcome) => contact_reply(outcome),
            Err(e) => {
                error!(chat_id, "Contact registration failed: {e}");
                (MSG_REGISTRATION_ERROR, None)
            }
        };

    send_text(&bot, msg.chat.id, text, markup).await
}

async fn send_typing(bot: &Bot, chat_id: ChatId) {
    if let Err(e) = bot.send_chat_action(chat_id, ChatAction::Typing).await {
        warn!("Failed to send typing action: {e}");
    }
}

/// Handle a plain text message
///
/// # Errors
///
/// Returns an error if the reply cannot be sent.
pub async fn handle_text(
    bot: Bot,
    msg: Message,
    store: Arc<dyn UserStore>,
    model: Arc<dyn GenerativeModel>,
) -> Result<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let chat_id = msg.chat.id;

    send_typing(&bot, chat_id).await;

    match chat::answer_text(model.as_ref(), store.as_ref(), chat_id.0, text).await {
        Ok(reply) => send_markdown_reply(&bot, chat_id, &reply).await,
        Err(ChatError::NotRegistered) => {
            let (text, markup) = register_first_reply();
            send_text(&bot, chat_id, text, markup).await
        }
        Err(e) => {
            error!(chat_id = chat_id.0, "Text relay failed: {e}");
            send_text(&bot, chat_id, MSG_TEXT_ERROR, None).await
        }
    }
}

fn largest_photo(sizes: &[PhotoSize]) -> Option<&PhotoSize> {
    sizes
        .iter()
        .max_by_key(|p| u64::from(p.width) * u64::from(p.height))
}

async fn download_photo(bot: &Bot, photo: &PhotoSize) -> Result<Vec<u8>> {
    retry_telegram_operation(|| async {
        let file = bot.get_file(photo.file.id.clone()).await?;
        let mut buffer = Vec::new();
        bot.download_file(&file.path, &mut buffer)
            .await
            .map_err(|e| anyhow!("Telegram download error: {e}"))?;
        Ok(buffer)
    })
    .await
}

/// Handle a photo message
///
/// # Errors
///
/// Returns an error if the reply cannot be sent.
pub async fn handle_photo(
    bot: Bot,
    msg: Message,
    store: Arc<dyn UserStore>,
    model: Arc<dyn GenerativeModel>,
) -> Result<()> {
    let Some(photo) = msg.photo().and_then(largest_photo) else {
        return Ok(());
    };
    let chat_id = msg.chat.id;

    // Skip the download for users who are not allowed to chat.
    match registration::ensure_registered(store.as_ref(), chat_id.0).await {
        Ok(true) => {}
        Ok(false) => {
            let (text, markup) = register_first_reply();
            return send_text(&bot, chat_id, text, markup).await;
        }
        Err(e) => {
            error!(chat_id = chat_id.0, "Registration check failed: {e}");
            return send_text(&bot, chat_id, MSG_PHOTO_ERROR, None).await;
        }
    }

    send_typing(&bot, chat_id).await;

    let image = match download_photo(&bot, photo).await {
        Ok(image) => image,
        Err(e) => {
            error!(chat_id = chat_id.0, "Photo download failed: {e}");
            return send_text(&bot, chat_id, MSG_PHOTO_ERROR, None).await;
        }
    };
    info!(chat_id = chat_id.0, bytes = image.len(), "Photo received");

    let request = PhotoRequest {
        chat_id: chat_id.0,
        file_id: photo.file.id.0.clone(),
        image,
        caption: msg.caption().map(str::to_string),
    };

    match chat::analyze_photo(model.as_ref(), store.as_ref(), request).await {
        Ok(analysis) => send_markdown_reply(&bot, chat_id, &analysis).await,
        Err(ChatError::NotRegistered) => {
            let (text, markup) = register_first_reply();
            send_text(&bot, chat_id, text, markup).await
        }
        Err(e) => {
            error!(chat_id = chat_id.0, "Photo analysis failed: {e}");
            send_text(&bot, chat_id, MSG_PHOTO_ERROR, None).await
        }
    }
}

/// Handle anything the bot does not understand
///
/// # Errors
///
/// Returns an error if the reply cannot be sent.
pub async fn handle_unsupported(bot: Bot, msg: Message) -> Result<()> {
    send_text(&bot, msg.chat.id, MSG_UNSUPPORTED, None).await
}
