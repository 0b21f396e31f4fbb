//! Twitter/X media fetcher for crosspost.
//!
//! Resolves status links through the v2 API and downloads the attached
//! photos and videos. Rate limits are reported as deferrals rather than
//! failures so the queue does not spend retry budget on them.

mod client;
mod error;
mod fetcher;
mod link;
mod types;

pub use client::{DEFAULT_API_BASE, RATE_LIMIT_GRACE_SECS, TwitterClient, TwitterConfig};
pub use error::TwitterError;
pub use fetcher::{resolve_media, video_variants};
pub use link::TweetRef;
pub use types::{Attachments, Includes, Media, MediaVariant, Tweet, TweetLookup, TweetProblem};
