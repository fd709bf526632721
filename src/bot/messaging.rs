//! Common messaging utilities for the Telegram bot.
//!
//! Model replies are Markdown; Telegram wants HTML in chunks of bounded size.

use crate::config::TELEGRAM_MESSAGE_LIMIT;
use crate::utils::{format_markdown_html, retry_telegram_request, split_long_message};
use anyhow::Result;
use std::future::IntoFuture;
use teloxide::prelude::*;
use teloxide::types::{ChatId, ParseMode, ReplyMarkup};
use teloxide::{ApiError, RequestError};
use tracing::warn;

/// Whether Telegram rejected the message markup
#[must_use]
pub fn is_markup_error(error: &RequestError) -> bool {
    match error {
        RequestError::Api(ApiError::CantParseEntities(_)) => true,
        RequestError::Api(ApiError::Unknown(message)) => {
            message.contains("can't parse entities")
        }
        _ => false,
    }
}

/// Sends a plain message with retry, optionally attaching a reply keyboard.
///
/// # Errors
///
/// Returns an error if the message could not be sent after retries.
pub async fn send_text(
    bot: &Bot,
    chat_id: ChatId,
    text: &str,
    markup: Option<ReplyMarkup>,
) -> Result<()> {
    retry_telegram_request(|| {
        let mut request = bot.send_message(chat_id, text);
        if let Some(markup) = markup.clone() {
            request = request.reply_markup(markup);
        }
        request.into_future()
    })
    .await?;
    Ok(())
}

/// Sends a Markdown reply, splitting it into parts Telegram accepts.
///
/// Each part is split from the raw Markdown first so code fences stay
/// balanced, then rendered to HTML. A part Telegram refuses to parse is
/// resent as plain text.
///
/// # Errors
///
/// Returns an error if any part fails to send after retries.
pub async fn send_markdown_reply(bot: &Bot, chat_id: ChatId, text: &str) -> Result<()> {
    for part in split_long_message(text, TELEGRAM_MESSAGE_LIMIT) {
        let html = format_markdown_html(&part);
        let sent = retry_telegram_request(|| {
            bot.send_message(chat_id, html.clone())
                .parse_mode(ParseMode::Html)
                .into_future()
        })
        .await;

        match sent {
            Ok(_) => {}
            Err(e) if is_markup_error(&e) => {
                warn!("Telegram rejected HTML reply, resending as plain text: {e}");
                send_text(bot, chat_id, &part, None).await?;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markup_errors_are_recognized() {
        assert!(is_markup_error(&RequestError::Api(
            ApiError::CantParseEntities(
                "Bad Request: can't parse entities: Unsupported start tag".into()
            )
        )));
        assert!(is_markup_error(&RequestError::Api(ApiError::Unknown(
            "Bad Request: can't parse entities: unexpected end tag".into()
        ))));
        assert!(!is_markup_error(&RequestError::Api(ApiError::BotBlocked)));
    }
}
