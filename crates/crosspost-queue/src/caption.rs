//! Caption composition for channel posts.
//!
//! Captions are Telegram MarkdownV2. Requester text is escaped, the quote
//! marker expands to the source post's text as a block quote, and a link
//! back to the source is appended.

use std::sync::LazyLock;

use regex::Regex;

use crate::PublishPayload;

static URL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"https?://\S+").unwrap());

/// Characters MarkdownV2 treats as markup outside of code and links.
const MARKDOWN_V2_SPECIAL: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!', '\\',
];

/// How captions are assembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptionOptions {
    /// Placeholder in the requester text replaced by the quoted source text.
    pub quote_marker: String,
    /// Append a `src` link to the source post.
    pub source_link: bool,
}

impl Default for CaptionOptions {
    fn default() -> Self {
        Self {
            quote_marker: "%quote%".to_string(),
            source_link: true,
        }
    }
}

/// Escape text for a MarkdownV2 message.
pub fn escape_markdown_v2(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if MARKDOWN_V2_SPECIAL.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Build the caption for a publication.
pub fn compose_caption(
    payload: &PublishPayload,
    source_text: &str,
    options: &CaptionOptions,
) -> String {
    let user_text = payload.user_text.trim();
    let marker = options.quote_marker.as_str();

    let body = match user_text.split_once(marker) {
        Some((before, after)) if !marker.is_empty() => {
            let after = after.replace(marker, "");
            [
                escape_markdown_v2(before.trim()),
                quote_block(source_text),
                escape_markdown_v2(after.trim()),
            ]
            .into_iter()
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
        }
        _ => escape_markdown_v2(user_text),
    };

    if !options.source_link {
        return body;
    }

    let link = format!("[src]({})", escape_link_target(payload.post_url.trim()));
    if body.is_empty() {
        link
    } else {
        format!("{body}\n\n{link}")
    }
}

/// Source text as a MarkdownV2 block quote, without URLs.
fn quote_block(source_text: &str) -> String {
    source_text
        .lines()
        .map(|line| URL_RE.replace_all(line, ""))
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .map(|line| format!(">{}", escape_markdown_v2(&line)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Inside `(...)` of an inline link only `)` and `\` need escaping.
fn escape_link_target(url: &str) -> String {
    let mut escaped = String::with_capacity(url.len());
    for c in url.chars() {
        if c == ')' || c == '\\' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
