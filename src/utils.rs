//! Utility functions for reply formatting, message splitting and retries.
//!
//! Gemini answers in Markdown while Telegram renders a small HTML subset, so
//! replies are split on line boundaries first and each chunk is converted to
//! HTML afterwards. Regexes are compile-time checked via `lazy_regex!`.

#![allow(clippy::non_std_lazy_statics)]

use crate::config::{
    TELEGRAM_API_INITIAL_BACKOFF_MS, TELEGRAM_API_MAX_BACKOFF_MS, TELEGRAM_API_MAX_RETRIES,
};
use anyhow::Result;
use lazy_regex::lazy_regex;
use std::future::Future;
use std::time::Duration;
use teloxide::RequestError;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::{Retry, RetryIf};
use tracing::warn;
use unicode_segmentation::UnicodeSegmentation;

const FENCE: &str = "```";

/// Reopened code blocks carry the language tag only when it is this short
const MAX_FENCE_HEADER_CHARS: usize = 32;

/// Private-use sentinels delimiting code placeholders
const SENTINEL_OPEN: char = '\u{E000}';
const SENTINEL_CLOSE: char = '\u{E001}';

static RE_CODE_FENCE: lazy_regex::Lazy<regex::Regex> =
    lazy_regex!(r"```([\w+#.-]*)[^\S\n]*\n?([\s\S]*?)```");

static RE_INLINE_CODE: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"`([^`\n]+)`");

static RE_PLACEHOLDER: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"\x{E000}(\d+)\x{E001}");

static RE_HEADING: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"(?m)^#{1,6}[ \t]+(.+?)[ \t]*#*$");

static RE_BULLET: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"(?m)^([ \t]*)[*-][ \t]+");

static RE_BOLD: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"\*\*([^\n]+?)\*\*");

static RE_ITALIC: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"\*([^*\s][^*\n]*?)\*");

static RE_STRIKE: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"~~([^\n]+?)~~");

static RE_MULTI_NEWLINE: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"\n{3,}");

/// Exponential backoff parameters for a retried operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: usize,
    /// Delay before the first retry
    pub initial_backoff_ms: u64,
    /// Upper bound of any single delay
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// Policy for Telegram Bot API calls
    #[must_use]
    pub const fn telegram() -> Self {
        Self {
            max_retries: TELEGRAM_API_MAX_RETRIES,
            initial_backoff_ms: TELEGRAM_API_INITIAL_BACKOFF_MS,
            max_backoff_ms: TELEGRAM_API_MAX_BACKOFF_MS,
        }
    }

    /// Doubling delays starting at `initial_backoff_ms`, capped and jittered
    pub fn strategy(&self) -> impl Iterator<Item = Duration> {
        // base^n * factor: 2 * (initial / 2), 4 * (initial / 2), ...
        ExponentialBackoff::from_millis(2)
            .factor((self.initial_backoff_ms / 2).max(1))
            .max_delay(Duration::from_millis(self.max_backoff_ms))
            .map(jitter)
            .take(self.max_retries)
    }
}

/// Retry a Telegram API operation with exponential backoff.
///
/// Intended for file operations (`get_file` + `download_file`) where every
/// failure is worth another attempt.
///
/// # Errors
///
/// Returns the last error if all attempts fail.
///
/// # Examples
///
/// ```no_run
/// use gemini_relay_bot::utils::retry_telegram_operation;
/// use anyhow::Result;
///
/// async fn download_file() -> Result<Vec<u8>> {
///     Ok(vec![])
/// }
///
/// # async fn example() -> Result<()> {
/// let buffer = retry_telegram_operation(|| async { download_file().await }).await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_telegram_operation<F, Fut, T>(operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let policy = RetryPolicy::telegram();
    Retry::spawn(policy.strategy(), operation)
        .await
        .map_err(|e| {
            warn!(
                "Telegram API operation failed after {} retries: {}",
                policy.max_retries, e
            );
            e
        })
}

/// Whether a Bot API error is worth retrying
#[must_use]
pub fn is_transient_request_error(error: &RequestError) -> bool {
    matches!(
        error,
        RequestError::Network(_) | RequestError::RetryAfter(_) | RequestError::Io(_)
    )
}

/// Retry a Bot API request on network-level failures only.
///
/// API rejections (bad markup, blocked chat) are returned immediately.
///
/// # Errors
///
/// Returns the first non-transient error, or the last transient one.
pub async fn retry_telegram_request<F, Fut, T>(operation: F) -> Result<T, RequestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RequestError>>,
{
    RetryIf::spawn(
        RetryPolicy::telegram().strategy(),
        operation,
        is_transient_request_error,
    )
    .await
}

/// Safely truncates a string to a maximum character length (not bytes).
///
/// # Examples
///
/// ```
/// use gemini_relay_bot::utils::truncate_str;
/// assert_eq!(truncate_str("Привет, мир!", 6), "Привет");
/// ```
pub fn truncate_str(s: impl AsRef<str>, max_chars: usize) -> String {
    let s = s.as_ref();
    s.char_indices()
        .nth(max_chars)
        .map_or_else(|| s.to_string(), |(pos, _)| s[..pos].to_string())
}

/// Converts Gemini Markdown into Telegram-compatible HTML.
///
/// Supported: fenced code, inline code, `#` headings, `*`/`-` bullets,
/// `**bold**`, `*italic*` and `~~strike~~`. Everything else is HTML-escaped,
/// so model output can never inject markup.
///
/// # Examples
///
/// ```
/// use gemini_relay_bot::utils::format_markdown_html;
/// let html = format_markdown_html("**Bold** and *italic* with `a < b`");
/// assert_eq!(html, "<b>Bold</b> and <i>italic</i> with <code>a &lt; b</code>");
/// ```
#[must_use]
pub fn format_markdown_html(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .filter(|c| *c != SENTINEL_OPEN && *c != SENTINEL_CLOSE)
        .collect();

    let mut snippets: Vec<String> = Vec::new();
    let mut stash = |html: String| {
        snippets.push(html);
        format!("{SENTINEL_OPEN}{}{SENTINEL_CLOSE}", snippets.len() - 1)
    };

    let fenced = RE_CODE_FENCE.replace_all(&cleaned, |caps: &regex::Captures| {
        let lang = caps.get(1).map_or("", |m| m.as_str());
        let code = caps.get(2).map_or("", |m| m.as_str()).trim_end();
        let escaped = html_escape::encode_text(code);
        if lang.is_empty() {
            stash(format!("<pre>{escaped}</pre>"))
        } else {
            stash(format!(
                "<pre><code class=\"language-{lang}\">{escaped}</code></pre>"
            ))
        }
    });
    let inlined = RE_INLINE_CODE
        .replace_all(&fenced, |caps: &regex::Captures| {
            let code = caps.get(1).map_or("", |m| m.as_str());
            stash(format!("<code>{}</code>", html_escape::encode_text(code)))
        })
        .into_owned();

    let mut html = html_escape::encode_text(&inlined).into_owned();
    html = RE_HEADING.replace_all(&html, "<b>$1</b>").into_owned();
    html = RE_BULLET.replace_all(&html, "$1• ").into_owned();
    html = RE_BOLD.replace_all(&html, "<b>$1</b>").into_owned();
    html = RE_ITALIC.replace_all(&html, "<i>$1</i>").into_owned();
    html = RE_STRIKE.replace_all(&html, "<s>$1</s>").into_owned();
    html = RE_MULTI_NEWLINE.replace_all(&html, "\n\n").into_owned();

    let restored = RE_PLACEHOLDER.replace_all(&html, |caps: &regex::Captures| {
        caps[1]
            .parse::<usize>()
            .ok()
            .and_then(|i| snippets.get(i))
            .cloned()
            .unwrap_or_default()
    });
    restored.trim().to_string()
}

/// Splits a long Markdown message into parts of at most `max_chars` characters.
///
/// Splits happen on line boundaries. A code block cut by a split is closed at
/// the end of one part and reopened, with its language tag, at the start of the
/// next. Lines longer than a whole part are cut on grapheme boundaries.
///
/// # Examples
///
/// ```
/// use gemini_relay_bot::utils::split_long_message;
/// let long_msg = "A very long message...\n".repeat(300);
/// let parts = split_long_message(&long_msg, 4000);
/// assert!(parts.len() > 1);
/// assert!(parts.iter().all(|p| p.chars().count() <= 4000));
/// ```
#[must_use]
pub fn split_long_message(message: &str, max_chars: usize) -> Vec<String> {
    if message.trim().is_empty() {
        return Vec::new();
    }
    if message.chars().count() <= max_chars {
        return vec![message.trim_end().to_string()];
    }

    let mut splitter = Splitter::new(max_chars.max(FENCE.len() * 3 + 3));
    for line in message.lines() {
        splitter.push_line(line);
    }
    splitter.finish()
}

struct Splitter {
    max: usize,
    parts: Vec<String>,
    current: String,
    current_len: usize,
    has_body: bool,
    /// Header used to reopen the code block we are inside of
    fence: Option<String>,
    /// Byte offset of a fence opener that has no content after it yet
    dangling_opener: Option<usize>,
}

impl Splitter {
    fn new(max: usize) -> Self {
        Self {
            max,
            parts: Vec::new(),
            current: String::new(),
            current_len: 0,
            has_body: false,
            fence: None,
            dangling_opener: None,
        }
    }

    fn push_line(&mut self, line: &str) {
        let line_len = line.chars().count();
        let is_fence = line.trim_start().starts_with(FENCE) && line_len <= self.max / 2;
        let closes = is_fence && self.fence.is_some();
        let reserve = if !closes && (is_fence || self.fence.is_some()) {
            FENCE.len() + 1
        } else {
            0
        };

        if self.has_body && self.current_len + line_len + 1 + reserve > self.max {
            self.flush();
        }

        if self.current_len + line_len + 1 + reserve > self.max {
            let room = self
                .max
                .saturating_sub(self.current_len + 1 + reserve)
                .max(1);
            let mut chunk = String::new();
            let mut chunk_len = 0;
            for grapheme in line.graphemes(true) {
                let g_len = grapheme.chars().count();
                if chunk_len + g_len > room && chunk_len > 0 {
                    self.append(&chunk, chunk_len);
                    self.flush();
                    chunk.clear();
                    chunk_len = 0;
                }
                chunk.push_str(grapheme);
                chunk_len += g_len;
            }
            if chunk_len > 0 {
                self.append(&chunk, chunk_len);
            }
            return;
        }

        let opener_offset = self.current.len();
        self.append(line, line_len);
        if closes {
            self.fence = None;
            self.dangling_opener = None;
        } else if is_fence {
            let header = line.trim();
            self.fence = Some(if header.chars().count() <= MAX_FENCE_HEADER_CHARS {
                header.to_string()
            } else {
                FENCE.to_string()
            });
            self.dangling_opener = Some(opener_offset);
        } else {
            self.dangling_opener = None;
        }
    }

    fn append(&mut self, text: &str, len: usize) {
        self.current.push_str(text);
        self.current.push('\n');
        self.current_len += len + 1;
        self.has_body = true;
    }

    fn flush(&mut self) {
        if let Some(offset) = self.dangling_opener.take() {
            // The opener would end this part with an empty block; move it over.
            self.current.truncate(offset);
            self.push_part();
        } else {
            if self.fence.is_some() {
                self.current.push_str(FENCE);
            }
            self.push_part();
        }
        if let Some(header) = &self.fence {
            self.current.push_str(header);
            self.current.push('\n');
            self.current_len = header.chars().count() + 1;
        }
    }

    fn push_part(&mut self) {
        let part = self.current.trim_end();
        if !part.is_empty() {
            self.parts.push(part.to_string());
        }
        self.current.clear();
        self.current_len = 0;
        self.has_body = false;
    }

    fn finish(mut self) -> Vec<String> {
        if self.has_body {
            if self.fence.is_some() {
                self.current.push_str(FENCE);
            }
            self.push_part();
        }
        self.parts
    }
}
