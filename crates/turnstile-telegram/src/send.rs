//! Message sending/editing helpers for the Telegram adapter.
//!
//! Telegram's message limit is 4096 characters. We use 4090 for safety.
//! Tries MarkdownV2 first; falls back to plain text if Telegram rejects the parse mode.

use teloxide::prelude::*;
use teloxide::types::{MessageId, ParseMode};
use tracing::warn;

/// Maximum characters per Telegram message (limit is 4096; we use 4090 for safety).
const CHUNK_MAX: usize = 4090;

/// Code-fence-aware message splitter for Telegram.
///
/// When a split falls inside a fenced code block, the fence is closed before
/// the chunk boundary and re-opened at the start of the next chunk.
pub fn split_chunks_smart(text: &str) -> Vec<String> {
    if text.len() <= CHUNK_MAX {
        return vec![text.to_string()];
    }

    let lines: Vec<&str> = text.split('\n').collect();
    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut fence_lang: Option<String> = None;

    for line in &lines {
        let cost = if current.is_empty() {
            line.len()
        } else {
            1 + line.len()
        };

        if !current.is_empty() && current.len() + cost > CHUNK_MAX {
            if fence_lang.is_some() {
                current.push_str("\n```");
            }
            chunks.push(current);
            current = String::new();
            if let Some(ref lang) = fence_lang {
                if lang.is_empty() {
                    current.push_str("```\n");
                } else {
                    current.push_str("```");
                    current.push_str(lang);
                    current.push('\n');
                }
            }
        }

        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);

        let trimmed = line.trim_start();
        if let Some(after_fence) = trimmed.strip_prefix("```") {
            if fence_lang.is_some() {
                fence_lang = None;
            } else {
                fence_lang = Some(after_fence.trim().to_string());
            }
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    // Safety net: force-split any chunk that still exceeds CHUNK_MAX
    // (e.g. a single line longer than 4090 chars).
    let mut result = Vec::new();
    for chunk in chunks {
        if chunk.len() <= CHUNK_MAX {
            result.push(chunk);
        } else {
            let mut remaining = chunk.as_str();
            while remaining.len() > CHUNK_MAX {
                let split_at = remaining[..CHUNK_MAX]
                    .rfind('\n')
                    .or_else(|| remaining[..CHUNK_MAX].rfind(' '))
                    .unwrap_or(CHUNK_MAX);
                result.push(remaining[..split_at].to_string());
                remaining = remaining[split_at..].trim_start();
            }
            if !remaining.is_empty() {
                result.push(remaining.to_string());
            }
        }
    }

    result
}

/// Truncate `text` to a single placeholder-editable chunk, marking the cut
/// with an ellipsis. Streaming edits target one message id, so unlike
/// `split_chunks_smart` there is nowhere to put an overflow chunk.
pub fn truncate_for_edit(text: &str) -> &str {
    if text.len() <= CHUNK_MAX {
        return text;
    }
    let cut = text
        .char_indices()
        .take_while(|(i, _)| *i < CHUNK_MAX - 1)
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    &text[..cut]
}

/// Escape special characters for Telegram MarkdownV2.
///
/// MarkdownV2 requires escaping: `_ * [ ] ( ) ~ ` # + - = | { } . !`
pub fn escape_markdown_v2(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    for ch in text.chars() {
        match ch {
            '_' | '*' | '[' | ']' | '(' | ')' | '~' | '`' | '#' | '+' | '-' | '=' | '|'
            | '{' | '}' | '.' | '!' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}

/// Send `text` to `chat_id` in smart-chunked messages, returning the id of
/// the last chunk sent (usable as an `edit_of` target).
///
/// Tries MarkdownV2 first; if Telegram rejects the parse mode (e.g. bad escaping),
/// falls back to plain text for that chunk.
pub async fn send_response(bot: &Bot, chat_id: ChatId, text: &str) -> Option<MessageId> {
    let chunks = split_chunks_smart(text);
    let mut last_id = None;
    for chunk in &chunks {
        last_id = send_one(bot, chat_id, chunk).await;
    }
    last_id
}

/// Edit `message_id` in `chat_id` to `text`. Telegram rejects no-op edits
/// (identical content) and overlong bodies; both failures are logged and
/// swallowed — the user can always retry by sending a new turn.
pub async fn edit_response(bot: &Bot, chat_id: ChatId, message_id: MessageId, text: &str) {
    let body = truncate_for_edit(text);
    let escaped = escape_markdown_v2(body);
    let edited = bot
        .edit_message_text(chat_id, message_id, &escaped)
        .parse_mode(ParseMode::MarkdownV2)
        .await;

    if edited.is_err() {
        if let Err(e) = bot.edit_message_text(chat_id, message_id, body).await {
            warn!(error = %e, "Telegram: edit_message_text failed, swallowing");
        }
    }
}

async fn send_one(bot: &Bot, chat_id: ChatId, chunk: &str) -> Option<MessageId> {
    let escaped = escape_markdown_v2(chunk);
    match bot.send_message(chat_id, &escaped).parse_mode(ParseMode::MarkdownV2).await {
        Ok(sent) => Some(sent.id),
        Err(_) => match bot.send_message(chat_id, chunk).await {
            Ok(sent) => Some(sent.id),
            Err(e) => {
                warn!(error = %e, "Telegram: failed to send plain-text fallback");
                None
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_single_chunk() {
        let chunks = split_chunks_smart("Hello, world!");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], "Hello, world!");
    }

    #[test]
    fn exactly_chunk_max_is_single_chunk() {
        let text = "a".repeat(CHUNK_MAX);
        let chunks = split_chunks_smart(&text);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn over_limit_splits_on_newline() {
        let line = "a".repeat(2000);
        let text = format!("{line}\n{line}\n{line}");
        let chunks = split_chunks_smart(&text);
        assert!(chunks.len() >= 2);
        for c in &chunks {
            assert!(c.len() <= CHUNK_MAX, "chunk too large: {}", c.len());
        }
    }

    #[test]
    fn very_long_single_line_force_splits() {
        let text = "x".repeat(9000);
        let chunks = split_chunks_smart(&text);
        assert!(chunks.len() >= 2);
        for c in &chunks {
            assert!(c.len() <= CHUNK_MAX);
        }
    }

    #[test]
    fn code_fence_preserved_across_chunks() {
        let mut text = String::from("Intro.\n```rust\n");
        for i in 0..200 {
            text.push_str(&format!("let variable_name_{i:04} = {i:05}; // comment\n"));
        }
        text.push_str("```\nAfter fence.");

        let chunks = split_chunks_smart(&text);
        assert!(chunks.len() >= 2, "expected multiple chunks, got {}", chunks.len());
        for c in &chunks {
            assert!(c.len() <= CHUNK_MAX, "chunk too large: {}", c.len());
        }
    }

    #[test]
    fn escape_markdown_v2_escapes_specials() {
        let input = "Hello. World! (test) [link] ~strike~";
        let escaped = escape_markdown_v2(input);
        assert!(escaped.contains("\\."));
        assert!(escaped.contains("\\!"));
        assert!(escaped.contains("\\("));
        assert!(escaped.contains("\\)"));
        assert!(escaped.contains("\\["));
        assert!(escaped.contains("\\]"));
        assert!(escaped.contains("\\~"));
    }

    #[test]
    fn escape_markdown_v2_leaves_normal_chars() {
        let input = "Hello world 123 abc";
        assert_eq!(escape_markdown_v2(input), input);
    }

    #[test]
    fn truncate_for_edit_leaves_short_text_untouched() {
        let text = "short reply";
        assert_eq!(truncate_for_edit(text), text);
    }

    #[test]
    fn truncate_for_edit_cuts_overlong_text_at_a_char_boundary() {
        let text = "é".repeat(CHUNK_MAX);
        let truncated = truncate_for_edit(&text);
        assert!(truncated.len() < text.len());
        assert!(truncated.len() <= CHUNK_MAX);
    }
}
