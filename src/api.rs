use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{multipart, Client as HttpClient, RequestBuilder, Response, StatusCode, Url};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ApiConfig;
use crate::error::FetchError;
use crate::note::{Note, NoteId, NoteSummary};
use crate::reconciler::RemoteStatusSource;
use crate::session::{Credentials, SessionInvalidator, SessionStore};
use crate::snapshot;

const SESSION_EXPIRED: &str = "session expired, please log in again";

/// Account details from `/members/my-info`.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberInfo {
    pub member_id: String,
    pub email: String,
    /// Unset until the profile is completed after registration
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthStatus {
    pub is_healthy: bool,
    pub error: Option<String>,
}

/// HTTP client for the note service.
pub struct ApiClient {
    http_client: HttpClient,
    base_url: String,
    health_timeout: Duration,
    session: Arc<SessionStore>,
}

impl ApiClient {
    pub fn new(config: &ApiConfig, session: Arc<SessionStore>) -> Result<Self> {
        let http_client = HttpClient::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            health_timeout: Duration::from_millis(config.health_timeout_ms),
            session,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    /// Absolute URL for an image as stored on the server, or `None` when the
    /// note has no usable URL for it.
    pub fn image_url(&self, raw: &str) -> Option<String> {
        resolve_image_url(&self.base_url, raw)
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    fn note_url(&self, id: &NoteId) -> String {
        self.url(&format!("/notes/{}", urlencoding::encode(id.as_str())))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.session.access_token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn read_json(response: Response) -> Result<Value, FetchError> {
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::from_status(status.as_u16()));
        }

        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| FetchError::Malformed(e.to_string()))
    }

    /// Send an authenticated request. A 401 triggers one token refresh and a
    /// retry; if the server still refuses, the session is ended.
    async fn send(&self, build: impl Fn(&HttpClient) -> RequestBuilder) -> Result<Value, FetchError> {
        let mut response = self.authorize(build(&self.http_client)).send().await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            tracing::debug!("Got 401, attempting to refresh token");
            match self.refresh().await {
                Ok(()) => {
                    response = self.authorize(build(&self.http_client)).send().await?;
                }
                Err(e) => tracing::warn!("Token refresh failed: {:#}", e),
            }
        }

        let result = Self::read_json(response).await;
        if matches!(result, Err(ref e) if e.is_auth()) {
            self.session.invalidate(SESSION_EXPIRED);
        }
        result
    }

    // === Auth ===

    pub async fn login(&self, email: &str, password: &str) -> Result<Credentials> {
        let response = self
            .http_client
            .post(self.url("/auth/login"))
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await
            .context("Login request failed")?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() || body.get("isSuccess").and_then(Value::as_bool) == Some(false) {
            return Err(anyhow!("Login failed: {}", envelope_message(&body, status)));
        }

        let creds = credentials_from(&body)
            .ok_or_else(|| anyhow!("Login response did not contain tokens"))?;
        self.session.save(creds.clone())?;
        tracing::info!(member_id = %creds.member_id, "logged in");
        Ok(creds)
    }

    pub async fn register(&self, name: &str, email: &str, password: &str) -> Result<Value> {
        let response = self
            .http_client
            .post(self.url("/auth/register"))
            .json(&json!({ "name": name, "email": email, "password": password }))
            .send()
            .await
            .context("Registration request failed")?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(anyhow!("Registration failed: {}", envelope_message(&body, status)));
        }
        Ok(body)
    }

    /// Exchange the refresh token for a new access token.
    pub async fn refresh(&self) -> Result<()> {
        let refresh_token = self
            .session
            .refresh_token()
            .ok_or_else(|| anyhow!("No refresh token available"))?;

        let response = self
            .http_client
            .post(self.url("/auth/refresh"))
            .json(&json!({ "refreshToken": refresh_token }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow!("Failed to refresh token. Status: {}", response.status()));
        }

        let body: Value = response.json().await?;
        let access_token = body
            .get("result")
            .and_then(|r| r.get("accessToken"))
            .or_else(|| body.get("accessToken"))
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("Refresh response did not contain an access token"))?;

        self.session.update_access_token(access_token)?;
        tracing::debug!("access token refreshed");
        Ok(())
    }

    /// Tell the server we are leaving, then forget the tokens regardless.
    pub async fn logout(&self) -> Result<()> {
        if let Err(e) = self.send(|http| http.post(self.url("/auth/logout"))).await {
            tracing::warn!("Server-side logout failed: {}", e);
        }
        self.session.clear()
    }

    pub async fn my_info(&self) -> Result<MemberInfo, FetchError> {
        let body = self.send(|http| http.get(self.url("/members/my-info"))).await?;
        let payload = body.get("result").unwrap_or(&body);

        Ok(MemberInfo {
            member_id: payload
                .get("id")
                .or_else(|| payload.get("memberId"))
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default(),
            email: payload.get("email").and_then(Value::as_str).unwrap_or_default().to_string(),
            name: payload
                .get("name")
                .and_then(Value::as_str)
                .filter(|n| !n.trim().is_empty())
                .map(str::to_string),
        })
    }

    // === Notes ===

    pub async fn list_notes(&self) -> Result<Vec<NoteSummary>, FetchError> {
        let body = self.send(|http| http.get(self.url("/notes/my-notes"))).await?;
        let now = Utc::now();
        Ok(snapshot::extract_list(&body)
            .iter()
            .filter_map(|item| snapshot::build_summary(item, now))
            .collect())
    }

    pub async fn get_note(&self, id: &NoteId) -> Result<Note, FetchError> {
        let body = self.send(|http| http.get(self.note_url(id))).await?;
        Ok(snapshot::build_note(&body, id, Utc::now()))
    }

    pub async fn delete_note(&self, id: &NoteId) -> Result<(), FetchError> {
        self.send(|http| http.delete(self.note_url(id))).await?;
        tracing::info!(note_id = %id, "note deleted");
        Ok(())
    }

    /// Upload a note with its page photos. Returns the id the server assigned.
    pub async fn create_note(&self, title: &str, content: &str, images: &[PathBuf]) -> Result<NoteId> {
        let mut files = Vec::with_capacity(images.len());
        for path in images {
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read image {}", path.display()))?;
            files.push((file_name(path), mime_for(path), bytes));
        }

        let body = self
            .send(|http| {
                let mut form = multipart::Form::new()
                    .text("title", title.to_string())
                    .text("content", content.to_string());
                for (name, mime, bytes) in &files {
                    let part = multipart::Part::bytes(bytes.clone()).file_name(name.clone());
                    let part = match part.mime_str(mime) {
                        Ok(part) => part,
                        Err(_) => multipart::Part::bytes(bytes.clone()).file_name(name.clone()),
                    };
                    form = form.part("images", part);
                }
                http.post(self.url("/notes")).multipart(form)
            })
            .await?;

        let id = snapshot::extract_created_id(&body)
            .ok_or_else(|| anyhow!("Note was created but the response carried no id"))?;
        tracing::info!(note_id = %id, images = files.len(), "note uploaded");
        Ok(id)
    }

    // === Diagnostics ===

    pub async fn check_health(&self) -> HealthStatus {
        let result = self
            .http_client
            .get(self.url("/health"))
            .timeout(self.health_timeout)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => HealthStatus { is_healthy: true, error: None },
            Ok(resp) => HealthStatus {
                is_healthy: false,
                error: Some(format!("server responded with {}", resp.status())),
            },
            Err(e) if e.is_timeout() => HealthStatus {
                is_healthy: false,
                error: Some(format!(
                    "server did not respond within {}s",
                    self.health_timeout.as_secs()
                )),
            },
            Err(e) => HealthStatus {
                is_healthy: false,
                error: Some(format!("could not reach server: {}", e)),
            },
        }
    }
}

/// The poller's fetch: no refresh, no retry. It decides for itself what an
/// auth failure means.
#[async_trait]
impl RemoteStatusSource for ApiClient {
    async fn fetch_note(&self, id: &NoteId) -> Result<Value, FetchError> {
        let response = self
            .authorize(self.http_client.get(self.note_url(id)))
            .send()
            .await?;
        Self::read_json(response).await
    }
}

/// Images are served from the server root (`/noteImages/...`), not from
/// under the API prefix. Absolute URLs pass through; other values are
/// returned untouched.
fn resolve_image_url(base_url: &str, raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return Some(raw.to_string());
    }

    let path = if raw.starts_with("/noteImages/") {
        raw.to_string()
    } else if raw.starts_with("noteImages/") {
        format!("/{}", raw)
    } else {
        return Some(raw.to_string());
    };

    match Url::parse(base_url).and_then(|base| base.join(&path)) {
        Ok(url) => Some(url.to_string()),
        Err(e) => {
            tracing::debug!("Could not resolve image path {}: {}", raw, e);
            Some(path)
        }
    }
}

fn envelope_message(body: &Value, status: StatusCode) -> String {
    body.get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| status.to_string())
}

fn credentials_from(body: &Value) -> Option<Credentials> {
    let payload = body.get("result").unwrap_or(body);
    let field = |key: &str| payload.get(key).and_then(Value::as_str).map(str::to_string);

    Some(Credentials {
        access_token: field("accessToken")?,
        refresh_token: field("refreshToken").unwrap_or_default(),
        member_id: match payload.get("memberId") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        },
    })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string())
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    /// Serve one canned HTTP response per accepted connection, in order.
    /// Returns the base URL and a handle yielding the raw requests seen.
    pub async fn serve(responses: Vec<(u16, &'static str)>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let mut seen = Vec::new();
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                seen.push(read_request(&mut socket).await);

                let reply = format!(
                    "HTTP/1.1 {} Status\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                socket.write_all(reply.as_bytes()).await.unwrap();
                let _ = socket.shutdown().await;
            }
            seen
        });

        (format!("http://{}", addr), handle)
    }

    // Read the head and, if announced, the whole body so closing the socket
    // never resets a client that is still sending.
    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = vec![0u8; 16 * 1024];
        let mut request = Vec::new();
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
            if let Some(end) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&request[..end]).to_lowercase();
                let body_len = head
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if request.len() >= end + 4 + body_len {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&request).into_owned()
    }

    pub fn client(base_url: &str, dir: &Path, logged_in: bool) -> ApiClient {
        let session = Arc::new(SessionStore::open(dir.join("credentials.json")).unwrap());
        if logged_in {
            session
                .save(Credentials {
                    access_token: "token-1".to_string(),
                    refresh_token: "refresh-1".to_string(),
                    member_id: "7".to_string(),
                })
                .unwrap();
        }
        let config = ApiConfig {
            base_url: format!("{}/", base_url),
            ..ApiConfig::default()
        };
        ApiClient::new(&config, session).unwrap()
    }
}
