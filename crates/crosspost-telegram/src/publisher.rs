//! `ChannelPublisher` implementation posting to a Telegram channel.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use crosspost_queue::{ChannelPublisher, LocalMedia, MEDIA_BATCH_LIMIT, MediaKind, PublishOutcome};
use tracing::{debug, info, instrument, warn};

use crate::{ChatId, MediaUpload, ParseMode, TelegramClient, TelegramError};

/// Longest flood-control wait honoured as given. Longer waits are capped.
const MAX_FLOOD_WAIT_SECS: u64 = 24 * 60 * 60;

/// Publishes albums and text posts to one channel.
pub struct TelegramChannelPublisher {
    client: Arc<TelegramClient>,
    channel: ChatId,
}

impl TelegramChannelPublisher {
    pub fn new(client: Arc<TelegramClient>, channel: ChatId) -> Self {
        Self { client, channel }
    }

    async fn send(&self, media: &[LocalMedia], caption: Option<&str>) -> Result<(), TelegramError> {
        let parse_mode = caption.map(|_| ParseMode::MarkdownV2);

        if media.is_empty() {
            let Some(text) = caption else {
                return Err(TelegramError::InvalidResponse(
                    "nothing to publish: no media and no caption".to_string(),
                ));
            };
            self.client
                .send_message(&self.channel, text, parse_mode, None)
                .await?;
            return Ok(());
        }

        let uploads: Vec<MediaUpload> = media
            .iter()
            .map(|item| match item.kind {
                MediaKind::Photo => MediaUpload::Photo(item.path.clone()),
                MediaKind::Video => MediaUpload::Video(item.path.clone()),
            })
            .collect();

        let sent = self
            .client
            .send_media_group(&self.channel, &uploads, caption, parse_mode)
            .await?;
        debug!(messages = sent.len(), "media group sent");
        Ok(())
    }
}

#[async_trait]
impl ChannelPublisher for TelegramChannelPublisher {
    #[instrument(skip(self, media, caption), fields(channel = %self.channel, items = media.len()))]
    async fn publish(&self, media: &[LocalMedia], caption: Option<&str>) -> PublishOutcome {
        if media.len() > MEDIA_BATCH_LIMIT {
            return PublishOutcome::Failed {
                reason: format!(
                    "batch of {} exceeds the {MEDIA_BATCH_LIMIT} item album limit",
                    media.len()
                ),
            };
        }

        match self.send(media, caption).await {
            Ok(()) => {
                info!("published to channel");
                PublishOutcome::Published
            }
            Err(TelegramError::RateLimited { retry_after_secs }) => {
                let wait = retry_after_secs.min(MAX_FLOOD_WAIT_SECS) as i64;
                let retry_at = Utc::now() + chrono::Duration::seconds(wait);
                warn!(retry_after_secs, "channel rate limited");
                PublishOutcome::RateLimited { retry_at }
            }
            Err(e) => {
                warn!(error = %e, "channel publish failed");
                PublishOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }
}
