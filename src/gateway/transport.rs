//! The HTTP seam underneath the gateway.

use async_trait::async_trait;
use http::Extensions;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::multipart::{Form, Part};
use reqwest::{Method, Request, Response, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, Middleware, Next};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// A file attached to a multipart form.
#[derive(Debug, Clone)]
pub struct FilePart {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// A multipart form that can be rebuilt for every attempt.
#[derive(Debug, Clone, Default)]
pub struct FormData {
    pub fields: Vec<(String, String)>,
    pub files: Vec<(String, FilePart)>,
}

impl FormData {
    pub fn new() -> FormData {
        FormData::default()
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> FormData {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn file(mut self, name: impl Into<String>, file: FilePart) -> FormData {
        self.files.push((name.into(), file));
        self
    }

    fn to_form(&self) -> Result<Form, TransportError> {
        let mut form = Form::new();

        for (name, value) in &self.fields {
            form = form.text(name.clone(), value.clone());
        }

        for (name, file) in &self.files {
            let part = Part::bytes(file.bytes.clone())
                .file_name(file.file_name.clone())
                .mime_str(&file.mime_type)
                .map_err(|err| TransportError::Request(err.to_string()))?;
            form = form.part(name.clone(), part);
        }

        Ok(form)
    }
}

/// Request payload.
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(serde_json::Value),
    Form(FormData),
}

/// An outbound API call, relative to the transport's base URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: RequestBody,
    pub headers: HeaderMap,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> ApiRequest {
        ApiRequest {
            method,
            path: path.into(),
            body: RequestBody::Empty,
            headers: HeaderMap::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> ApiRequest {
        ApiRequest::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> ApiRequest {
        ApiRequest::new(Method::POST, path)
    }

    pub fn patch(path: impl Into<String>) -> ApiRequest {
        ApiRequest::new(Method::PATCH, path)
    }

    /// Sets a JSON body.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<ApiRequest, serde_json::Error> {
        self.body = RequestBody::Json(serde_json::to_value(body)?);
        Ok(self)
    }

    /// Sets a multipart body.
    pub fn form(mut self, form: FormData) -> ApiRequest {
        self.body = RequestBody::Form(form);
        self
    }

    pub fn header(mut self, name: reqwest::header::HeaderName, value: HeaderValue) -> ApiRequest {
        self.headers.insert(name, value);
        self
    }
}

/// What came back from the backend, whatever the status.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> ApiResponse {
        ApiResponse {
            status,
            body: body.into(),
        }
    }

    /// Builds a response with a JSON body.
    pub fn json_body(status: StatusCode, body: &serde_json::Value) -> ApiResponse {
        ApiResponse::new(status, body.to_string())
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Decodes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// A failure below HTTP: no status code was received.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("{0}")]
    Request(String),
    #[error(transparent)]
    Middleware(#[from] reqwest_middleware::Error),
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
}

/// Performs HTTP calls for the gateway.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `request` and reports the status and body faithfully, including error statuses.
    async fn perform(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError>;
}

#[async_trait]
impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    async fn perform(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        (**self).perform(request).await
    }
}

#[async_trait]
impl<T> Transport for Box<T>
where
    T: Transport + ?Sized,
{
    async fn perform(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        (**self).perform(request).await
    }
}

/// Logs every request that goes over the wire.
struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(
        &self,
        req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        let method = req.method().clone();
        let path = req.url().path().to_owned();
        let started = Instant::now();

        let result = next.run(req, extensions).await;

        match &result {
            Ok(res) => log::debug!(
                "{method} {path} -> {} in {:?}",
                res.status().as_u16(),
                started.elapsed()
            ),
            Err(err) => log::debug!("{method} {path} failed after {:?}: {err}", started.elapsed()),
        }

        result
    }
}

/// `Transport` backed by a `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: ClientWithMiddleware,
    base_url: String,
}

impl ReqwestTransport {
    /// Creates a transport that resolves request paths against `base_url`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<ReqwestTransport, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("postpilot/", env!("CARGO_PKG_VERSION"))),
        );

        let client = ClientBuilder::new(
            reqwest::Client::builder()
                .default_headers(headers)
                .timeout(timeout)
                .build()?,
        )
        .with(LoggingMiddleware)
        .build();

        Ok(ReqwestTransport {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn perform(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let builder = self
            .client
            .request(request.method.clone(), self.url(&request.path))
            .headers(request.headers.clone());

        let builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            // reqwest sets the multipart content type including the boundary.
            RequestBody::Form(form) => builder.multipart(form.to_form()?),
        };

        let response = builder.send().await?;
        let status = response.status();
        let body = response.bytes().await?.to_vec();

        Ok(ApiResponse { status, body })
    }
}
