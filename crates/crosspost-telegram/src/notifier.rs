//! `UserNotifier` implementation sending direct messages.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use crosspost_queue::{
    JobError, JobId, NotifyError, RequesterId, StatusSummary, UserNotifier, VideoVariants,
};
use tracing::debug;

use crate::{ChatId, ParseMode, TelegramClient};

/// Messages requesters about their jobs, rendering times in a fixed offset.
pub struct TelegramUserNotifier {
    client: Arc<TelegramClient>,
    offset: FixedOffset,
}

impl TelegramUserNotifier {
    pub fn new(client: Arc<TelegramClient>, offset: FixedOffset) -> Self {
        Self { client, offset }
    }

    async fn send(&self, requester: RequesterId, text: String) -> Result<(), NotifyError> {
        self.send_as(requester, text, None).await
    }

    async fn send_as(
        &self,
        requester: RequesterId,
        text: String,
        parse_mode: Option<ParseMode>,
    ) -> Result<(), NotifyError> {
        if requester == 0 {
            debug!("no requester, notification skipped");
            return Ok(());
        }
        self.client
            .send_message(&ChatId::Id(requester), &text, parse_mode, None)
            .await
            .map(|_| ())
            .map_err(|e| NotifyError(e.to_string()))
    }
}

#[async_trait]
impl UserNotifier for TelegramUserNotifier {
    async fn notify_rate_limited(
        &self,
        requester: RequesterId,
        retry_at: DateTime<Utc>,
        message: &str,
    ) -> Result<(), NotifyError> {
        self.send(requester, rate_limited_text(retry_at, message, self.offset))
            .await
    }

    async fn notify_retry_scheduled(
        &self,
        requester: RequesterId,
        attempt: u32,
        max_attempts: u32,
        retry_at: DateTime<Utc>,
    ) -> Result<(), NotifyError> {
        self.send(
            requester,
            retry_text(attempt, max_attempts, retry_at, self.offset),
        )
        .await
    }

    async fn notify_video_variants(
        &self,
        requester: RequesterId,
        videos: &[VideoVariants],
    ) -> Result<(), NotifyError> {
        let Some(text) = video_variants_text(videos) else {
            return Ok(());
        };
        self.send_as(requester, text, Some(ParseMode::MarkdownV2))
            .await
    }

    async fn notify_queue_cleared(
        &self,
        requester: RequesterId,
        count: usize,
    ) -> Result<(), NotifyError> {
        self.send(requester, format!("🗑️ Queue cleared. Jobs removed: {count}"))
            .await
    }

    async fn notify_queue_status(
        &self,
        requester: RequesterId,
        summary: &[StatusSummary],
    ) -> Result<(), NotifyError> {
        self.send(requester, status_text(summary, self.offset)).await
    }

    async fn notify_published(
        &self,
        requester: RequesterId,
        job_id: JobId,
    ) -> Result<(), NotifyError> {
        self.send(
            requester,
            format!("✅ Queued post #{job_id} was published to the channel"),
        )
        .await
    }

    async fn notify_failed(
        &self,
        requester: RequesterId,
        job_id: JobId,
        error: &JobError,
    ) -> Result<(), NotifyError> {
        self.send(requester, format!("❌ Queued post #{job_id} failed: {error}"))
            .await
    }
}

fn format_time(at: DateTime<Utc>, offset: FixedOffset) -> String {
    format!(
        "{} (UTC{})",
        at.with_timezone(&offset).format("%Y-%m-%d %H:%M:%S"),
        offset
    )
}

fn rate_limited_text(retry_at: DateTime<Utc>, message: &str, offset: FixedOffset) -> String {
    [
        "⚠️ Request postponed by a rate limit.".to_string(),
        message.trim().to_string(),
        format!("Next attempt after {}.", format_time(retry_at, offset)),
    ]
    .into_iter()
    .filter(|line| !line.is_empty())
    .collect::<Vec<_>>()
    .join("\n")
}

fn retry_text(
    attempt: u32,
    max_attempts: u32,
    retry_at: DateTime<Utc>,
    offset: FixedOffset,
) -> String {
    format!(
        "🔄 Attempt {attempt}/{max_attempts} scheduled.\nNext attempt after {}.",
        format_time(retry_at, offset)
    )
}

/// A monospace block listing every encoding, or `None` without videos.
fn video_variants_text(videos: &[VideoVariants]) -> Option<String> {
    if videos.iter().all(|video| video.options.is_empty()) {
        return None;
    }

    let mut lines = vec!["🎞 Available video variants:".to_string()];
    for video in videos.iter().filter(|video| !video.options.is_empty()) {
        lines.push(format!("Video {}:", video.media_index));
        for option in &video.options {
            let mut parts = Vec::new();
            if let Some((width, height)) = option.resolution {
                parts.push(format!("{width}x{height}"));
            }
            if let Some(bit_rate) = option.bit_rate.filter(|rate| *rate > 0) {
                parts.push(format!("{} kbps", (bit_rate + 500) / 1000));
            }
            if parts.is_empty() {
                parts.push(option.content_type.clone());
            }
            lines.push(format!("• {}", parts.join(", ")));
            lines.push(option.url.clone());
        }
    }

    Some(format!("```\n{}\n```", escape_pre(&lines.join("\n"))))
}

/// Inside a MarkdownV2 code block only backticks and backslashes are special.
fn escape_pre(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if c == '`' || c == '\\' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn status_text(summary: &[StatusSummary], offset: FixedOffset) -> String {
    if summary.is_empty() {
        return "📊 Queue is empty".to_string();
    }

    let mut lines = vec!["📊 Queue status:".to_string()];
    for group in summary {
        lines.push(format!(
            "{}: {} jobs (max retries: {})",
            group.status, group.count, group.max_retry_count
        ));
        if let Some(next) = group.next_available_at {
            lines.push(format!("  next: {}", format_time(next, offset)));
        }
    }
    lines.join("\n")
}
