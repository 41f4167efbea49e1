//! Typed access to the scheduling backend.

use crate::gateway::{ApiRequest, CredentialStore, FormData, Gateway};
use crate::posts::{filter_by_status, NewPost, Post, PostStatus, PostUpdate};
use crate::{calendar::PostSource, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The logged in user as reported by the backend.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub email: String,
    pub username: String,
    pub timezone: String,
}

/// Credentials for `POST /auth/login`.
#[derive(Serialize, Debug, Clone)]
pub struct LoginInput {
    pub email: String,
    pub password: String,
}

/// Account details for `POST /auth/register`.
#[derive(Serialize, Debug, Clone)]
pub struct RegisterInput {
    pub email: String,
    pub username: String,
    pub password: String,
    pub timezone: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// The `{ data: ... }` envelope every successful response is wrapped in.
#[derive(Deserialize, Debug)]
struct Envelope<T> {
    data: Option<T>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct AuthData {
    user: User,
    token: String,
    refresh_token: String,
}

#[derive(Deserialize, Debug, Default)]
struct PostsData {
    #[serde(default)]
    posts: Vec<Post>,
}

#[derive(Deserialize, Debug)]
struct PostData {
    post: Post,
}

/// Client for the scheduling backend. All calls go through the [`Gateway`].
#[derive(Clone)]
pub struct ApiClient {
    gateway: Gateway,
}

impl ApiClient {
    pub fn new(gateway: Gateway) -> ApiClient {
        ApiClient { gateway }
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    fn credentials(&self) -> &Arc<dyn CredentialStore> {
        self.gateway.credentials()
    }

    /// Logs in and stores the returned session.
    pub async fn login(&self, input: &LoginInput) -> Result<User> {
        self.authenticate(ApiRequest::post("/auth/login").json(input)?).await
    }

    /// Creates an account and stores the returned session.
    pub async fn register(&self, input: &RegisterInput) -> Result<User> {
        self.authenticate(ApiRequest::post("/auth/register").json(input)?).await
    }

    async fn authenticate(&self, request: ApiRequest) -> Result<User> {
        let path = request.path.clone();
        let response = self.gateway.send_anonymous(request).await?;
        let envelope: Envelope<AuthData> = response.json()?;
        let AuthData {
            user,
            token,
            refresh_token,
        } = envelope.data.ok_or_else(|| missing_data(&path))?;

        let credentials = self.credentials();
        credentials.set_all(&token, &refresh_token)?;
        credentials.set_user(&user)?;

        log::info!("logged in as {}", user.username);

        Ok(user)
    }

    /// Forgets the stored session.
    pub fn logout(&self) -> Result<()> {
        self.credentials().clear()?;
        Ok(())
    }

    /// The user of the stored session, if any.
    pub fn current_user(&self) -> Option<User> {
        let credentials = self.credentials();
        credentials.access_token().and_then(|_| credentials.user())
    }

    /// Lists the user's posts, optionally keeping only those with `status`.
    pub async fn list_posts(&self, status: Option<PostStatus>) -> Result<Vec<Post>> {
        let response = self.gateway.send(ApiRequest::get("/posts")).await?;
        let envelope: Envelope<PostsData> = response.json()?;
        let posts = envelope.data.unwrap_or_default().posts;

        log::debug!("fetched {} posts", posts.len());

        Ok(filter_by_status(posts, status))
    }

    /// Submits a validated post as a multipart form.
    pub async fn create_post(&self, post: &NewPost) -> Result<Post> {
        let request = ApiRequest::post("/posts").form(post_form(post));
        let response = self.gateway.send(request).await?;
        let envelope: Envelope<PostData> = response.json()?;

        Ok(envelope.data.ok_or_else(|| missing_data("/posts"))?.post)
    }

    /// Applies a partial update to a post.
    pub async fn update_post(&self, id: &str, update: &PostUpdate) -> Result<Post> {
        let path = format!("/posts/{id}");
        let request = ApiRequest::patch(path.as_str()).json(update)?;
        let response = self.gateway.send(request).await?;
        let envelope: Envelope<PostData> = response.json()?;

        Ok(envelope.data.ok_or_else(|| missing_data(&path))?.post)
    }
}

fn missing_data(path: &str) -> crate::Error {
    crate::GatewayError::Api {
        status: None,
        message: format!("response from {path} is missing `data`"),
    }
    .into()
}

/// Builds the composer form: content, timezone, schedule and status, plus the optional image.
fn post_form(post: &NewPost) -> FormData {
    let mut form = FormData::new()
        .text("content", post.content.as_str())
        .text("timezone", post.timezone.name());

    if let Some(at) = &post.scheduled_at {
        form = form.text(
            "scheduledAt",
            at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        );
    }

    form = form.text("status", post.status.as_str());

    if let Some(image) = &post.image {
        form = form.file("image", image.clone());
    }

    form
}

#[async_trait]
impl PostSource for ApiClient {
    async fn fetch_posts(&self) -> Result<Vec<Post>> {
        self.list_posts(None).await
    }
}
