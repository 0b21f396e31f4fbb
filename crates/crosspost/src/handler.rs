//! Chat command handling.
//!
//! Requests are keyed by chat: the chat a command arrives in is the requester
//! that receives every notice about the jobs it queued.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use chrono::Duration;
use crosspost_queue::{Clock, PublishPayload, Scheduler};
use crosspost_telegram::{ChatId, Message, TelegramClient};
use crosspost_twitter::TweetRef;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

static POST_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)https?://(?:www\.)?(?:twitter|x)\.com/\S+").unwrap()
});

static ANY_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)https?://\S+").unwrap());

static DELAY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\s)(\+(\d{1,6})([smhSMH]))(?:\s|$)").unwrap()
});

const PROMPT: &str =
    "Send the post link, optionally followed by a delay like +10m and the caption text.";

/// A bot command, with any `@botname` suffix removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    /// `/post`, with everything after the command.
    Post(&'a str),
    Clear,
    Status,
    Help,
    Unknown(&'a str),
}

/// Parse a message starting with `/`. Anything else is not a command.
pub fn parse_command(text: &str) -> Option<Command<'_>> {
    let text = text.trim_start();
    let body = text.strip_prefix('/')?;
    let (head, args) = match body.find(char::is_whitespace) {
        Some(at) => (&body[..at], &body[at..]),
        None => (body, ""),
    };
    let name = head.split('@').next().unwrap_or(head);

    let command = if name.eq_ignore_ascii_case("post") {
        Command::Post(args.trim())
    } else if name.eq_ignore_ascii_case("clear") {
        Command::Clear
    } else if name.eq_ignore_ascii_case("status") {
        Command::Status
    } else if name.eq_ignore_ascii_case("start") || name.eq_ignore_ascii_case("help") {
        Command::Help
    } else {
        Command::Unknown(name)
    };
    Some(command)
}

/// A parsed publish request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostRequest {
    pub post_url: String,
    pub user_text: String,
    pub delay: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("no X/Twitter link found in the message")]
    MissingLink,

    #[error("not a link to an X/Twitter post: {0}")]
    InvalidLink(String),
}

/// Split `<link> [+<n>s|m|h] [text]` into its parts.
///
/// The first X/Twitter URL anywhere in the text is the post. The first
/// standalone delay token schedules it. What remains, trimmed, is the caption.
pub fn parse_post_request(text: &str) -> Result<PostRequest, RequestError> {
    let Some(link) = POST_LINK_RE.find(text) else {
        return Err(match ANY_LINK_RE.find(text) {
            Some(other) => RequestError::InvalidLink(other.as_str().to_string()),
            None => RequestError::MissingLink,
        });
    };

    let post_url = link.as_str().to_string();
    TweetRef::parse(&post_url).map_err(|_| RequestError::InvalidLink(post_url.clone()))?;

    let mut rest = format!("{}{}", &text[..link.start()], &text[link.end()..]);

    let mut delay = None;
    if let Some(caps) = DELAY_RE.captures(&rest)
        && let (Some(token), Some(amount), Some(unit)) = (caps.get(1), caps.get(2), caps.get(3))
        && let Ok(amount) = amount.as_str().parse::<i64>()
    {
        let seconds = match unit.as_str().to_ascii_lowercase().as_str() {
            "h" => amount * 3600,
            "m" => amount * 60,
            _ => amount,
        };
        delay = Some(Duration::seconds(seconds));
        let range = token.range();
        rest.replace_range(range, "");
    }

    Ok(PostRequest {
        post_url,
        user_text: rest.trim().to_string(),
        delay,
    })
}

/// Help text listing the commands.
pub fn usage_text(quote_marker: &str) -> String {
    format!(
        "I republish X/Twitter posts to the channel.\n\n\
         /post <link> [+10m] [text] - queue a post\n\
         /post - queue a post, sending the link next\n\
         /status - show the queue\n\
         /clear - remove every queued post\n\n\
         Delays take s, m or h. Put {quote_marker} in the text to quote the original post."
    )
}

/// Turns incoming messages into scheduler calls and replies.
pub struct CommandHandler {
    scheduler: Scheduler,
    telegram: Arc<TelegramClient>,
    clock: Arc<dyn Clock>,
    usage: String,
    /// `(chat, user)` pairs whose next message is a post request.
    awaiting_link: Mutex<HashSet<(i64, i64)>>,
}

impl CommandHandler {
    pub fn new(
        scheduler: Scheduler,
        telegram: Arc<TelegramClient>,
        clock: Arc<dyn Clock>,
        quote_marker: &str,
    ) -> Self {
        Self {
            scheduler,
            telegram,
            clock,
            usage: usage_text(quote_marker),
            awaiting_link: Mutex::new(HashSet::new()),
        }
    }

    fn awaiting(&self) -> std::sync::MutexGuard<'_, HashSet<(i64, i64)>> {
        self.awaiting_link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the next plain message from this user in this chat is a post request.
    pub fn is_awaiting_link(&self, chat: i64, user: i64) -> bool {
        self.awaiting().contains(&(chat, user))
    }

    pub async fn handle(&self, message: &Message) {
        let Some(text) = message.text.as_deref() else {
            return;
        };
        let chat = message.chat.id;
        let user = message.from.as_ref().map_or(chat, |u| u.id);
        let key = (chat, user);

        match parse_command(text) {
            Some(Command::Post("")) => {
                self.awaiting().insert(key);
                self.reply(message, PROMPT).await;
            }
            Some(Command::Post(args)) => self.post(key, message, args).await,
            Some(Command::Clear) => {
                if let Err(e) = self.scheduler.clear_queue(chat).await {
                    warn!(error = %e, chat, "clear failed");
                    self.reply(message, &format!("❌ Could not clear the queue: {e}"))
                        .await;
                }
            }
            Some(Command::Status) => {
                if let Err(e) = self.scheduler.queue_status(chat).await {
                    warn!(error = %e, chat, "status failed");
                    self.reply(message, &format!("❌ Could not read the queue: {e}"))
                        .await;
                }
            }
            Some(Command::Help) => self.reply(message, &self.usage).await,
            Some(Command::Unknown(name)) => debug!(command = name, chat, "unknown command"),
            None => {
                if self.is_awaiting_link(chat, user) {
                    self.post(key, message, text).await;
                }
            }
        }
    }

    async fn post(&self, key: (i64, i64), message: &Message, text: &str) {
        let request = match parse_post_request(text) {
            Ok(request) => request,
            Err(e) => {
                self.awaiting().insert(key);
                self.reply(message, &format!("❌ {e}. Send the link again."))
                    .await;
                return;
            }
        };
        self.awaiting().remove(&key);

        let (chat, _) = key;
        let available_at = request.delay.map(|delay| self.clock.now() + delay);
        let payload = PublishPayload::new(request.post_url, request.user_text);

        let pending = match self.scheduler.submit(chat, payload, available_at) {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, chat, "submit failed");
                self.reply(message, &format!("❌ Could not queue the post: {e}"))
                    .await;
                return;
            }
        };

        let job_id = pending.job_id();
        self.reply(message, &format!("⏳ Post #{job_id} queued")).await;

        let telegram = Arc::clone(&self.telegram);
        let message_id = message.message_id;
        tokio::spawn(async move {
            let text = match pending.wait().await {
                Ok(()) => {
                    info!(job_id, chat, "post published");
                    format!("✅ Post #{job_id} published to the channel")
                }
                Err(e) => format!("❌ Post #{job_id} failed: {e}"),
            };
            send_reply(&telegram, chat, message_id, &text).await;
        });
    }

    async fn reply(&self, message: &Message, text: &str) {
        send_reply(&self.telegram, message.chat.id, message.message_id, text).await;
    }
}

async fn send_reply(telegram: &TelegramClient, chat: i64, reply_to: i64, text: &str) {
    if let Err(e) = telegram
        .send_message(&ChatId::Id(chat), text, None, Some(reply_to))
        .await
    {
        warn!(error = %e, chat, "failed to send reply");
    }
}
