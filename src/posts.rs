//! Post models and composer validation.

use crate::gateway::FilePart;
use crate::timezone::{self, format_in_timezone};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Longest post body the backend accepts, in characters.
pub const MAX_CONTENT_CHARS: usize = 5000;

/// Lifecycle of a post on the backend.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostStatus {
    Draft,
    Scheduled,
    Publishing,
    Published,
    Failed,
}

impl PostStatus {
    /// Returns the wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Draft => "DRAFT",
            PostStatus::Scheduled => "SCHEDULED",
            PostStatus::Publishing => "PUBLISHING",
            PostStatus::Published => "PUBLISHED",
            PostStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for PostStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PostStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<PostStatus> {
        match s.to_ascii_uppercase().as_str() {
            "DRAFT" => Ok(PostStatus::Draft),
            "SCHEDULED" => Ok(PostStatus::Scheduled),
            "PUBLISHING" => Ok(PostStatus::Publishing),
            "PUBLISHED" => Ok(PostStatus::Published),
            "FAILED" => Ok(PostStatus::Failed),
            _ => Err(Error::Validation(format!("unknown post status `{s}`"))),
        }
    }
}

/// The author as embedded in a post.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PostAuthor {
    pub id: String,
    pub username: String,
    pub email: String,
}

/// A post as returned by the backend.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: String,
    pub content: String,
    pub image_url: Option<String>,
    pub image_path: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub timezone: String,
    pub status: PostStatus,
    #[serde(default)]
    pub attempts: u32,
    pub last_error: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub user_id: String,
    pub user: PostAuthor,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Post {
    /// Name shown for the author, preferring the username.
    pub fn author(&self) -> &str {
        if self.user.username.is_empty() {
            &self.user.email
        } else {
            &self.user.username
        }
    }

    /// `Scheduled for: <time>` in `tz`, or `Draft` for unscheduled posts.
    pub fn schedule_label(&self, tz: Tz) -> String {
        match &self.scheduled_at {
            Some(at) => format!("Scheduled for: {}", format_in_timezone(at, tz)),
            None => "Draft".to_owned(),
        }
    }
}

/// Keeps only posts with the given status. `None` keeps everything.
pub fn filter_by_status(posts: Vec<Post>, status: Option<PostStatus>) -> Vec<Post> {
    match status {
        Some(status) => posts.into_iter().filter(|post| post.status == status).collect(),
        None => posts,
    }
}

/// A new post as entered in the composer.
#[derive(Debug, Clone)]
pub struct PostDraft {
    pub content: String,
    /// Wall-clock time in `timezone`, e.g. `2026-10-20T14:30`. `None` saves a draft.
    pub scheduled_at: Option<String>,
    pub timezone: String,
    pub image: Option<FilePart>,
}

/// A validated [`PostDraft`], ready to be submitted.
#[derive(Debug, Clone)]
pub struct NewPost {
    pub content: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub timezone: Tz,
    pub status: PostStatus,
    pub image: Option<FilePart>,
}

impl PostDraft {
    pub fn new(content: impl Into<String>, timezone: impl Into<String>) -> PostDraft {
        PostDraft {
            content: content.into(),
            scheduled_at: None,
            timezone: timezone.into(),
            image: None,
        }
    }

    pub fn scheduled_at(mut self, at: impl Into<String>) -> PostDraft {
        self.scheduled_at = Some(at.into());
        self
    }

    pub fn image(mut self, image: FilePart) -> PostDraft {
        self.image = Some(image);
        self
    }

    /// Checks the draft and resolves its schedule to UTC. A schedule must lie after `now`.
    pub fn validate(self, now: DateTime<Utc>) -> Result<NewPost> {
        let content_chars = self.content.chars().count();
        if content_chars == 0 {
            return Err(Error::Validation("Content is required".into()));
        }
        if content_chars > MAX_CONTENT_CHARS {
            return Err(Error::Validation("Content too long".into()));
        }

        if self.timezone.trim().is_empty() {
            return Err(Error::Validation("Timezone is required".into()));
        }
        let timezone = timezone::parse_timezone(&self.timezone)?;

        let scheduled_at = match self.scheduled_at.as_deref().map(str::trim) {
            Some("") | None => None,
            Some(input) => {
                let at = timezone::local_to_utc(input, timezone)?;
                if at <= now {
                    return Err(Error::Validation(
                        "Scheduled time must be in the future".into(),
                    ));
                }
                Some(at)
            }
        };

        let status = if scheduled_at.is_some() {
            PostStatus::Scheduled
        } else {
            PostStatus::Draft
        };

        Ok(NewPost {
            content: self.content,
            scheduled_at,
            timezone,
            status,
            image: self.image,
        })
    }
}

/// Partial update of an existing post. Unset fields are left untouched.
#[derive(Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct PostUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// `Some(None)` unschedules the post.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<Option<DateTime<Utc>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<PostStatus>,
}
