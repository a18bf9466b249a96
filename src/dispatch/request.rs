// src/dispatch/request.rs
use super::multipart::MultipartForm;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder};
use serde::Serialize;
use std::time::Duration;
use url::Url;

/// Replayable description of one outbound call. Each attempt rebuilds the
/// request from this value against the transport chosen for that attempt.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
    /// Takes the place of `body` when set.
    pub multipart: Option<MultipartForm>,
    pub timeout: Option<Duration>,
}

impl OutboundRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            multipart: None,
            timeout: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: Url) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn bearer_auth(self, token: &str) -> Result<Self, reqwest::header::InvalidHeaderValue> {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", token))?;
        value.set_sensitive(true);
        Ok(self.header(AUTHORIZATION, value))
    }

    pub fn json<T: Serialize + ?Sized>(self, value: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        Ok(self
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(body))
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn multipart(mut self, form: MultipartForm) -> Self {
        self.body = None;
        self.multipart = Some(form);
        self
    }

    /// Deadline for a single attempt.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn build(
        &self,
        client: &Client,
        default_timeout: Duration,
    ) -> Result<RequestBuilder, reqwest::Error> {
        let mut builder = client
            .request(self.method.clone(), self.url.clone())
            .headers(self.headers.clone())
            .timeout(self.timeout.unwrap_or(default_timeout));
        if let Some(form) = &self.multipart {
            builder = builder.multipart(form.to_form()?);
        } else if let Some(body) = &self.body {
            builder = builder.body(body.clone());
        }
        Ok(builder)
    }
}
