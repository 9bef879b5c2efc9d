//! HTTP backend.
//!
//! The actual HTTP client is abstracted via a trait so the core does not
//! pick a network stack. [`HttpBackend`] builds JSON requests against
//! `{base_url}/api/v2/{resource_type}` and maps responses to the
//! [`ApiResult`] model.

use crate::api::{ApiError, ApiErrorBody, ApiReply, ApiResponse, ApiResult};
use crate::backend::{ListPage, ResourceBackend};
use crate::client::ClientHandle;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        })
    }
}

/// An outgoing request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Method.
    pub method: Method,
    /// Absolute URL.
    pub url: String,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// JSON body.
    pub body: Option<Vec<u8>>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl HttpRequest {
    /// Returns the first header with the given name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// A received response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Raw body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response with a JSON body.
    pub fn json(status: u16, body: &Value) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: body.to_string().into_bytes(),
        }
    }

    /// Returns the first header with the given name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// HTTP client abstraction.
///
/// Implement this trait to plug in an HTTP library. An `Err` means no
/// response was received at all.
pub trait HttpClient: Send + Sync {
    /// Sends a request.
    fn send(&self, request: HttpRequest) -> Result<HttpResponse, String>;
}

const CORRELATION_HEADER: &str = "ININ-Correlation-Id";

/// JSON-over-HTTP resource backend.
pub struct HttpBackend<H: HttpClient> {
    http: H,
}

impl<H: HttpClient> HttpBackend<H> {
    /// Creates a backend sending requests through `http`.
    pub fn new(http: H) -> Self {
        Self { http }
    }

    /// Returns the underlying client.
    pub fn http(&self) -> &H {
        &self.http
    }

    fn url(client: &ClientHandle, resource_type: &str, id: Option<&str>) -> String {
        let base = client.base_url().trim_end_matches('/');
        match id {
            Some(id) => format!("{base}/api/v2/{resource_type}/{id}"),
            None => format!("{base}/api/v2/{resource_type}"),
        }
    }

    fn call(
        &self,
        client: &ClientHandle,
        method: Method,
        url: String,
        body: Option<&Value>,
    ) -> Result<(ApiResponse, Vec<u8>), ApiError> {
        let mut headers = vec![
            ("Authorization".to_string(), format!("Bearer {}", client.access_token())),
            ("User-Agent".to_string(), client.settings().user_agent.clone()),
            ("Accept".to_string(), "application/json".to_string()),
        ];
        if body.is_some() {
            headers.push(("Content-Type".to_string(), "application/json".to_string()));
        }

        let request = HttpRequest {
            method,
            url,
            headers,
            body: body.map(|b| b.to_string().into_bytes()),
            timeout: client.settings().request_timeout,
        };
        debug!(%method, url = %request.url, slot = client.slot(), "sending request");

        let response = self.http.send(request).map_err(ApiError::transport)?;
        let mut meta = ApiResponse::new(response.status);
        meta.correlation_id = response.header(CORRELATION_HEADER).map(str::to_string);

        if response.status >= 400 {
            let error: ApiErrorBody = serde_json::from_slice(&response.body).unwrap_or_default();
            let message = if error.message.is_empty() {
                format!("{method} failed with status {}", response.status)
            } else {
                error.message.clone()
            };
            meta.error = Some(error);
            return Err(ApiError::new(meta, message));
        }
        Ok((meta, response.body))
    }

    fn decode<T: DeserializeOwned>(meta: ApiResponse, body: &[u8]) -> ApiResult<T> {
        match serde_json::from_slice(body) {
            Ok(value) => Ok(ApiReply { value, response: meta }),
            Err(e) => {
                let message = format!("failed to decode response: {e}");
                Err(ApiError::new(meta, message))
            }
        }
    }
}

impl<H: HttpClient> ResourceBackend for HttpBackend<H> {
    fn get(&self, client: &ClientHandle, resource_type: &str, id: &str) -> ApiResult<Value> {
        let url = Self::url(client, resource_type, Some(id));
        let (meta, body) = self.call(client, Method::Get, url, None)?;
        Self::decode(meta, &body)
    }

    fn list_page(
        &self,
        client: &ClientHandle,
        resource_type: &str,
        page_number: u32,
        page_size: u32,
    ) -> ApiResult<ListPage> {
        let url = format!(
            "{}?pageSize={page_size}&pageNumber={page_number}",
            Self::url(client, resource_type, None)
        );
        let (meta, body) = self.call(client, Method::Get, url, None)?;
        Self::decode(meta, &body)
    }

    fn create(&self, client: &ClientHandle, resource_type: &str, body: &Value) -> ApiResult<Value> {
        let url = Self::url(client, resource_type, None);
        let (meta, bytes) = self.call(client, Method::Post, url, Some(body))?;
        Self::decode(meta, &bytes)
    }

    fn update(
        &self,
        client: &ClientHandle,
        resource_type: &str,
        id: &str,
        body: &Value,
    ) -> ApiResult<Value> {
        let url = Self::url(client, resource_type, Some(id));
        let (meta, bytes) = self.call(client, Method::Put, url, Some(body))?;
        Self::decode(meta, &bytes)
    }

    fn delete(&self, client: &ClientHandle, resource_type: &str, id: &str) -> ApiResult<()> {
        let url = Self::url(client, resource_type, Some(id));
        let (meta, _) = self.call(client, Method::Delete, url, None)?;
        Ok(ApiReply { value: (), response: meta })
    }
}
