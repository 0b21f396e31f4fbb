//! Telegram Bot API client.

use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use crate::{ApiResponse, ChatId, InputMedia, MediaUpload, Message, ParseMode, TelegramError, Update, User};

/// Public Bot API endpoint.
pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Extra time past the long-poll timeout before a `getUpdates` request is abandoned.
const POLL_SLACK: Duration = Duration::from_secs(10);

/// Client for a single bot.
pub struct TelegramClient {
    http: Client,
    api_base: String,
    token: String,
}

impl TelegramClient {
    pub fn new(token: impl Into<String>) -> Result<Self, TelegramError> {
        Self::with_api_base(token, DEFAULT_API_BASE)
    }

    pub fn with_api_base(
        token: impl Into<String>,
        api_base: impl Into<String>,
    ) -> Result<Self, TelegramError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    async fn call<B: Serialize, T: DeserializeOwned>(
        &self,
        method: &str,
        body: &B,
    ) -> Result<T, TelegramError> {
        let response = self
            .http
            .post(self.method_url(method))
            .json(body)
            .send()
            .await?;
        decode(method, response).await
    }

    /// The bot's own account.
    pub async fn get_me(&self) -> Result<User, TelegramError> {
        self.call("getMe", &json!({})).await
    }

    /// Long-poll for updates after `offset`.
    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_secs: u64,
    ) -> Result<Vec<Update>, TelegramError> {
        #[derive(Serialize)]
        struct GetUpdates<'a> {
            #[serde(skip_serializing_if = "Option::is_none")]
            offset: Option<i64>,
            timeout: u64,
            allowed_updates: &'a [&'a str],
        }

        let response = self
            .http
            .post(self.method_url("getUpdates"))
            .timeout(Duration::from_secs(timeout_secs) + POLL_SLACK)
            .json(&GetUpdates {
                offset,
                timeout: timeout_secs,
                allowed_updates: &["message"],
            })
            .send()
            .await?;
        decode("getUpdates", response).await
    }

    /// Send a text message.
    pub async fn send_message(
        &self,
        chat: &ChatId,
        text: &str,
        parse_mode: Option<ParseMode>,
        reply_to: Option<i64>,
    ) -> Result<Message, TelegramError> {
        #[derive(Serialize)]
        struct SendMessage<'a> {
            chat_id: &'a ChatId,
            text: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            parse_mode: Option<ParseMode>,
            #[serde(skip_serializing_if = "Option::is_none")]
            reply_to_message_id: Option<i64>,
        }

        self.call(
            "sendMessage",
            &SendMessage {
                chat_id: chat,
                text,
                parse_mode,
                reply_to_message_id: reply_to,
            },
        )
        .await
    }

    /// Upload local files as one album. The caption goes on the first item.
    pub async fn send_media_group(
        &self,
        chat: &ChatId,
        uploads: &[MediaUpload],
        caption: Option<&str>,
        parse_mode: Option<ParseMode>,
    ) -> Result<Vec<Message>, TelegramError> {
        let mut media = Vec::with_capacity(uploads.len());
        let mut form = Form::new().text("chat_id", chat.to_string());

        for (index, upload) in uploads.iter().enumerate() {
            let name = format!("file{index}");
            let path = upload.path();
            let bytes = tokio::fs::read(path).await?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| name.clone());
            form = form.part(name.clone(), Part::bytes(bytes).file_name(file_name));

            let first = index == 0;
            media.push(InputMedia {
                kind: match upload {
                    MediaUpload::Photo(_) => "photo",
                    MediaUpload::Video(_) => "video",
                },
                media: format!("attach://{name}"),
                caption: caption.filter(|_| first).map(str::to_string),
                parse_mode: parse_mode.filter(|_| first && caption.is_some()),
                supports_streaming: matches!(upload, MediaUpload::Video(_)).then_some(true),
            });
        }

        form = form.text("media", serde_json::to_string(&media)?);
        debug!(chat = %chat, items = uploads.len(), "sending media group");

        let response = self
            .http
            .post(self.method_url("sendMediaGroup"))
            .multipart(form)
            .send()
            .await?;
        decode("sendMediaGroup", response).await
    }
}

/// Unwrap the Bot API envelope. Error bodies arrive with non-2xx statuses.
async fn decode<T: DeserializeOwned>(method: &str, response: Response) -> Result<T, TelegramError> {
    let status = response.status();
    let body = response.bytes().await?;

    let envelope: ApiResponse<T> = serde_json::from_slice(&body).map_err(|e| {
        TelegramError::InvalidResponse(format!(
            "{method} returned {status} with an unreadable body: {e}"
        ))
    })?;

    if envelope.ok {
        return envelope
            .result
            .ok_or_else(|| TelegramError::InvalidResponse(format!("{method} returned no result")));
    }

    let code = envelope.error_code.unwrap_or_else(|| i64::from(status.as_u16()));
    if code == 429 {
        let retry_after_secs = envelope
            .parameters
            .and_then(|p| p.retry_after)
            .unwrap_or(1);
        return Err(TelegramError::RateLimited { retry_after_secs });
    }

    Err(TelegramError::Api {
        code,
        description: envelope
            .description
            .unwrap_or_else(|| "no description".to_string()),
    })
}
