//! Google Cloud Storage backend.
//!
//! Talks to the GCS JSON API with `reqwest`:
//!   listing:   `GET  /storage/v1/b/{bucket}/o?matchGlob=...`
//!   reads:     `GET  /download/storage/v1/b/{bucket}/o/{object}?alt=media` + `Range`
//!   uploads:   `POST /upload/storage/v1/b/{bucket}/o?uploadType=resumable`, then
//!              `PUT {session}` with `Content-Range` per chunk
//!   compose:   `POST /storage/v1/b/{bucket}/o/{destination}/compose`
//!   delete:    `DELETE /storage/v1/b/{bucket}/o/{object}`
//!
//! Credentials are resolved in this order:
//!   - `GOOGLE_OAUTH_ACCESS_TOKEN` (a ready-made bearer token)
//!   - the configured credentials file (`GCP_TOKEN`), then
//!     `GOOGLE_APPLICATION_CREDENTIALS`: service account keys are exchanged
//!     with a signed JWT, user credentials with their refresh token
//!   - gcloud application-default credentials
//!   - the GCE metadata server

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use tracing::{debug, info};

use super::backend::{ObjectInfo, StorageBackend};
use crate::config::GcpStorageConfig;

/// OAuth2 scope needed for reads, uploads, compose and delete.
const DEVSTORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";

/// Default OAuth2 token endpoint.
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// GCS HTTP status for "resumable upload incomplete".
const RESUME_INCOMPLETE: u16 = 308;

// -- GCS JSON API types -------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GcsObject {
    name: Option<String>,
    /// The JSON API reports sizes as decimal strings.
    size: Option<String>,
    #[serde(rename = "md5Hash")]
    md5_hash: Option<String>,
}

impl GcsObject {
    fn into_info(self) -> anyhow::Result<Option<ObjectInfo>> {
        let Some(name) = self.name else {
            return Ok(None);
        };
        let size = match self.size {
            Some(s) => s
                .parse::<u64>()
                .map_err(|e| anyhow::anyhow!("GCS reported an invalid size {s:?} for {name}: {e}"))?,
            None => 0,
        };
        Ok(Some(ObjectInfo {
            name,
            size,
            md5_hash: self.md5_hash,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct GcsListResponse {
    items: Option<Vec<GcsObject>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct ComposeSourceObject {
    name: String,
}

#[derive(Debug, Serialize)]
struct ComposeDestination {
    #[serde(rename = "contentType")]
    content_type: String,
}

#[derive(Debug, Serialize)]
struct ComposeRequest {
    #[serde(rename = "sourceObjects")]
    source_objects: Vec<ComposeSourceObject>,
    destination: ComposeDestination,
}

#[derive(Debug, Deserialize)]
struct GcsErrorDetail {
    code: Option<u16>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GcsErrorResponse {
    error: Option<GcsErrorDetail>,
}

/// Claims of the JWT assertion for the service-account token exchange.
#[derive(Debug, Serialize)]
struct ServiceAccountClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

// -- Token management ---------------------------------------------------------

/// String field of a credentials document, empty when absent.
fn str_field<'a>(creds: &'a serde_json::Value, name: &str) -> &'a str {
    creds.get(name).and_then(|v| v.as_str()).unwrap_or("")
}

/// Cached access token with expiry.
struct CachedToken {
    access_token: String,
    expiry: std::time::Instant,
}

/// Backend that forwards every operation to Google Cloud Storage.
pub struct GcsBackend {
    client: reqwest::Client,
    /// API root, `https://storage.googleapis.com` unless pointed at an emulator.
    endpoint: String,
    /// Project billed for requester-pays buckets (`userProject`).
    user_project: Option<String>,
    /// Explicit credentials file, if configured.
    credentials_file: Option<String>,
    /// Skip authentication entirely (emulators).
    anonymous: bool,
    token_cache: Mutex<Option<CachedToken>>,
}

impl GcsBackend {
    /// Create a new GCS backend.
    ///
    /// Credentials are resolved lazily on the first API call.  An explicit
    /// credentials file must at least be readable now, so that a bad
    /// `GCP_TOKEN` fails the connection instead of the first read.
    pub fn new(config: &GcpStorageConfig) -> anyhow::Result<Self> {
        let credentials_file = if config.credentials_file.is_empty() {
            None
        } else {
            std::fs::metadata(&config.credentials_file).map_err(|e| {
                anyhow::anyhow!(
                    "Error initializing token from file {}: {e}",
                    config.credentials_file
                )
            })?;
            Some(config.credentials_file.clone())
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {e}"))?;

        info!(
            "GCS backend initialized: endpoint={} project='{}' anonymous={}",
            config.endpoint, config.project, config.anonymous
        );

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            user_project: (!config.project.is_empty()).then(|| config.project.clone()),
            credentials_file,
            anonymous: config.anonymous,
            token_cache: Mutex::new(None),
        })
    }

    /// Get an OAuth2 access token, cached until 60s before expiry.
    async fn get_access_token(&self) -> anyhow::Result<String> {
        {
            let cache = self.token_cache.lock().expect("token cache mutex poisoned");
            if let Some(ref cached) = *cache {
                if cached.expiry > std::time::Instant::now() {
                    return Ok(cached.access_token.clone());
                }
            }
        }

        let (token, expires_in) = self.fetch_access_token().await?;

        let expiry = std::time::Instant::now()
            + std::time::Duration::from_secs(expires_in.saturating_sub(60));

        {
            let mut cache = self.token_cache.lock().expect("token cache mutex poisoned");
            *cache = Some(CachedToken {
                access_token: token.clone(),
                expiry,
            });
        }

        Ok(token)
    }

    async fn fetch_access_token(&self) -> anyhow::Result<(String, u64)> {
        if let Ok(token) = std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN") {
            return Ok((token, 3600));
        }

        if let Some(ref path) = self.credentials_file {
            return self.token_from_credentials_file(path).await;
        }

        if let Ok(path) = std::env::var("GOOGLE_APPLICATION_CREDENTIALS") {
            return self.token_from_credentials_file(&path).await;
        }

        let adc_path = Self::application_default_credentials_path();
        if let Ok(true) = tokio::fs::try_exists(&adc_path).await {
            return self.token_from_credentials_file(&adc_path).await;
        }

        self.token_from_metadata_server().await
    }

    /// Path of the gcloud application-default credentials file.
    fn application_default_credentials_path() -> String {
        if let Ok(config_dir) = std::env::var("CLOUDSDK_CONFIG") {
            return format!("{config_dir}/application_default_credentials.json");
        }
        if let Ok(home) = std::env::var("HOME") {
            return format!("{home}/.config/gcloud/application_default_credentials.json");
        }
        ".config/gcloud/application_default_credentials.json".to_string()
    }

    /// Obtain a token from a service account key or authorized-user file.
    async fn token_from_credentials_file(&self, path: &str) -> anyhow::Result<(String, u64)> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read credentials file {path}: {e}"))?;

        let creds: serde_json::Value = serde_json::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse credentials file {path}: {e}"))?;

        match str_field(&creds, "type") {
            "service_account" => {
                let client_email = creds
                    .get("client_email")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow::anyhow!("Missing client_email in service account key"))?;
                let private_key = creds
                    .get("private_key")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow::anyhow!("Missing private_key in service account key"))?;
                let token_uri = creds
                    .get("token_uri")
                    .and_then(|v| v.as_str())
                    .unwrap_or(DEFAULT_TOKEN_URI);
                self.exchange_jwt_for_token(client_email, private_key, token_uri)
                    .await
            }
            "authorized_user" => {
                self.token_from_refresh(
                    str_field(&creds, "client_id"),
                    str_field(&creds, "client_secret"),
                    str_field(&creds, "refresh_token"),
                )
                .await
            }
            other => Err(anyhow::anyhow!(
                "Unsupported credential type in {path}: {other}"
            )),
        }
    }

    /// Exchange a refresh token for an access token.
    async fn token_from_refresh(
        &self,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> anyhow::Result<(String, u64)> {
        let resp = self
            .client
            .post(DEFAULT_TOKEN_URI)
            .form(&[
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Token refresh request failed: {e}"))?;

        Self::parse_token_response(resp, "Token refresh").await
    }

    /// Sign an RS256 JWT assertion and exchange it for an access token.
    async fn exchange_jwt_for_token(
        &self,
        client_email: &str,
        private_key_pem: &str,
        token_uri: &str,
    ) -> anyhow::Result<(String, u64)> {
        let iat = chrono::Utc::now().timestamp();
        let claims = ServiceAccountClaims {
            iss: client_email,
            scope: DEVSTORAGE_SCOPE,
            aud: token_uri,
            iat,
            exp: iat + 3600,
        };
        let key = jsonwebtoken::EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
            .map_err(|e| anyhow::anyhow!("Invalid service account private key: {e}"))?;
        let assertion = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
            &claims,
            &key,
        )
        .map_err(|e| anyhow::anyhow!("Failed to sign JWT assertion: {e}"))?;

        let resp = self
            .client
            .post(token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("JWT token exchange request failed: {e}"))?;

        Self::parse_token_response(resp, "JWT token exchange").await
    }

    /// Obtain an access token from the GCE metadata server.
    async fn token_from_metadata_server(&self) -> anyhow::Result<(String, u64)> {
        let resp = self
            .client
            .get("http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token")
            .header("Metadata-Flavor", "Google")
            .timeout(std::time::Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Metadata server request failed: {e}. \
                Set GCP_TOKEN or GOOGLE_APPLICATION_CREDENTIALS, run \
                'gcloud auth application-default login', or set GOOGLE_OAUTH_ACCESS_TOKEN."))?;

        Self::parse_token_response(resp, "Metadata server").await
    }

    async fn parse_token_response(
        resp: reqwest::Response,
        context: &str,
    ) -> anyhow::Result<(String, u64)> {
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("{context} failed ({status}): {body}"));
        }

        let token_resp: serde_json::Value = resp.json().await?;
        let access_token = token_resp
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("No access_token in {context} response"))?
            .to_string();
        let expires_in = token_resp
            .get("expires_in")
            .and_then(|v| v.as_u64())
            .unwrap_or(3600);

        Ok((access_token, expires_in))
    }

    /// Build authorization headers for GCS API calls.
    async fn auth_headers(&self) -> anyhow::Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if self.anonymous {
            return Ok(headers);
        }
        let token = self.get_access_token().await?;
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| anyhow::anyhow!("Invalid auth header value: {e}"))?,
        );
        Ok(headers)
    }

    /// URL-encode a bucket or object name for use in API paths.
    fn url_encode(name: &str) -> String {
        percent_encoding::utf8_percent_encode(name, percent_encoding::NON_ALPHANUMERIC).to_string()
    }

    fn object_url(&self, bucket: &str, object: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.endpoint,
            Self::url_encode(bucket),
            Self::url_encode(object)
        )
    }

    /// `userProject` query parameter, when a billing project is configured.
    fn project_query(&self) -> Vec<(&'static str, String)> {
        self.user_project
            .iter()
            .map(|p| ("userProject", p.clone()))
            .collect()
    }

    /// `Content-Range` header value for a resumable upload chunk.
    fn content_range(offset: u64, len: u64, finalize: bool) -> String {
        let total = if finalize {
            (offset + len).to_string()
        } else {
            "*".to_string()
        };
        if len == 0 {
            format!("bytes */{total}")
        } else {
            format!("bytes {}-{}/{total}", offset, offset + len - 1)
        }
    }

    /// Bytes persisted by a resumable upload, from the `Range` header of a
    /// 308 response (`bytes=0-N`).  No header means nothing was persisted.
    fn persisted_bytes(range: Option<&str>) -> anyhow::Result<u64> {
        let Some(range) = range else {
            return Ok(0);
        };
        let last = range
            .strip_prefix("bytes=0-")
            .and_then(|end| end.trim().parse::<u64>().ok())
            .ok_or_else(|| anyhow::anyhow!("GCS upload: unexpected Range header {range:?}"))?;
        Ok(last + 1)
    }

    /// Map a GCS HTTP error to an anyhow error with context.
    fn map_gcs_error(context: &str, status: StatusCode, body: &str) -> anyhow::Error {
        if let Ok(err_resp) = serde_json::from_str::<GcsErrorResponse>(body) {
            if let Some(err) = err_resp.error {
                return anyhow::anyhow!(
                    "GCS {}: {} (code {})",
                    context,
                    err.message.unwrap_or_default(),
                    err.code.unwrap_or(status.as_u16())
                );
            }
        }
        anyhow::anyhow!("GCS {context}: HTTP {status} - {body}")
    }

    async fn error_from(context: &str, resp: reqwest::Response) -> anyhow::Error {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Self::map_gcs_error(context, status, &body)
    }

    // -- GCS API operations ---------------------------------------------------

    async fn gcs_list(&self, bucket: &str, glob: &str) -> anyhow::Result<Vec<ObjectInfo>> {
        let auth = self.auth_headers().await?;
        let url = format!("{}/storage/v1/b/{}/o", self.endpoint, Self::url_encode(bucket));
        let mut objects: Vec<ObjectInfo> = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut req = self
                .client
                .get(&url)
                .headers(auth.clone())
                .query(&[
                    ("matchGlob", glob),
                    ("fields", "items(name,size,md5Hash),nextPageToken"),
                ])
                .query(&self.project_query());

            if let Some(ref token) = page_token {
                req = req.query(&[("pageToken", token.as_str())]);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("GCS list request failed: {e}"))?;

            if !resp.status().is_success() {
                return Err(Self::error_from("list", resp).await);
            }

            let list_resp: GcsListResponse = resp.json().await?;
            for item in list_resp.items.unwrap_or_default() {
                if let Some(info) = item.into_info()? {
                    objects.push(info);
                }
            }

            match list_resp.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(objects)
    }

    async fn gcs_read_range(
        &self,
        bucket: &str,
        object: &str,
        start: u64,
        end: u64,
    ) -> anyhow::Result<Bytes> {
        if start >= end {
            return Ok(Bytes::new());
        }

        let mut auth = self.auth_headers().await?;
        auth.insert(
            RANGE,
            HeaderValue::from_str(&format!("bytes={}-{}", start, end - 1))
                .map_err(|e| anyhow::anyhow!("Invalid range header: {e}"))?,
        );

        let url = format!(
            "{}/download/storage/v1/b/{}/o/{}",
            self.endpoint,
            Self::url_encode(bucket),
            Self::url_encode(object)
        );

        let resp = self
            .client
            .get(&url)
            .headers(auth)
            .query(&[("alt", "media")])
            .query(&self.project_query())
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("GCS download request failed: {e}"))?;

        let status = resp.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            // Range starts at or past the end of the object.
            return Ok(Bytes::new());
        }
        if !status.is_success() {
            return Err(Self::error_from("download", resp).await);
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| anyhow::anyhow!("GCS download body read failed: {e}"))?;

        if status == StatusCode::PARTIAL_CONTENT {
            return Ok(body);
        }

        // A 200 carries the whole object; cut the requested window out of it.
        let len = body.len() as u64;
        let from = start.min(len) as usize;
        let to = end.min(len) as usize;
        Ok(body.slice(from..to))
    }

    async fn gcs_start_upload(&self, bucket: &str, object: &str) -> anyhow::Result<String> {
        let auth = self.auth_headers().await?;
        let url = format!(
            "{}/upload/storage/v1/b/{}/o",
            self.endpoint,
            Self::url_encode(bucket)
        );

        let resp = self
            .client
            .post(&url)
            .headers(auth)
            .query(&[("uploadType", "resumable"), ("name", object)])
            .query(&self.project_query())
            .header(CONTENT_TYPE, "application/json; charset=UTF-8")
            .header("X-Upload-Content-Type", "application/octet-stream")
            .body("{}")
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("GCS resumable upload request failed: {e}"))?;

        if !resp.status().is_success() {
            return Err(Self::error_from("start upload", resp).await);
        }

        resp.headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("GCS start upload: no session URI in response"))
    }

    async fn gcs_upload_chunk(
        &self,
        session: &str,
        offset: u64,
        data: Bytes,
        finalize: bool,
    ) -> anyhow::Result<Option<ObjectInfo>> {
        if data.is_empty() && !finalize {
            return Ok(None);
        }

        let data_len = data.len() as u64;
        let mut auth = self.auth_headers().await?;
        let range = Self::content_range(offset, data_len, finalize);
        auth.insert(
            CONTENT_RANGE,
            HeaderValue::from_str(&range)
                .map_err(|e| anyhow::anyhow!("Invalid content range header: {e}"))?,
        );

        let resp = self
            .client
            .put(session)
            .headers(auth)
            .body(data)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("GCS upload chunk request failed: {e}"))?;

        let status = resp.status();
        if status.as_u16() == RESUME_INCOMPLETE {
            if finalize {
                anyhow::bail!("GCS upload: final chunk accepted but upload still incomplete");
            }
            let range = resp
                .headers()
                .get(RANGE)
                .and_then(|v| v.to_str().ok());
            let persisted = Self::persisted_bytes(range)?;
            let expected = offset + data_len;
            if persisted != expected {
                anyhow::bail!(
                    "GCS upload: server persisted {persisted} bytes, expected {expected}"
                );
            }
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Self::error_from("upload chunk", resp).await);
        }

        let object: GcsObject = match resp.json().await {
            Ok(object) => object,
            Err(e) => {
                debug!("GCS upload: unreadable object metadata: {}", e);
                return Ok(None);
            }
        };
        object.into_info()
    }

    async fn gcs_compose(
        &self,
        bucket: &str,
        sources: &[String],
        destination: &str,
    ) -> anyhow::Result<ObjectInfo> {
        let auth = self.auth_headers().await?;
        let url = format!("{}/compose", self.object_url(bucket, destination));

        let compose_req = ComposeRequest {
            source_objects: sources
                .iter()
                .map(|name| ComposeSourceObject { name: name.clone() })
                .collect(),
            destination: ComposeDestination {
                content_type: "application/octet-stream".to_string(),
            },
        };

        let resp = self
            .client
            .post(&url)
            .headers(auth)
            .query(&self.project_query())
            .json(&compose_req)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("GCS compose request failed: {e}"))?;

        if !resp.status().is_success() {
            return Err(Self::error_from("compose", resp).await);
        }

        let object: GcsObject = resp.json().await?;
        object
            .into_info()?
            .ok_or_else(|| anyhow::anyhow!("GCS compose: no object metadata in response"))
    }

    async fn gcs_delete(&self, bucket: &str, object: &str) -> anyhow::Result<bool> {
        let auth = self.auth_headers().await?;

        let resp = self
            .client
            .delete(self.object_url(bucket, object))
            .headers(auth)
            .query(&self.project_query())
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("GCS delete request failed: {e}"))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !resp.status().is_success() {
            return Err(Self::error_from("delete", resp).await);
        }
        Ok(true)
    }
}

impl StorageBackend for GcsBackend {
    fn list_objects(
        &self,
        bucket: &str,
        glob: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<ObjectInfo>>> + Send + '_>> {
        let bucket = bucket.to_string();
        let glob = glob.to_string();
        Box::pin(async move {
            debug!("GCS list: bucket={} glob={}", bucket, glob);
            self.gcs_list(&bucket, &glob).await
        })
    }

    fn read_range(
        &self,
        bucket: &str,
        object: &str,
        start: u64,
        end: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Bytes>> + Send + '_>> {
        let bucket = bucket.to_string();
        let object = object.to_string();
        Box::pin(async move {
            debug!("GCS read: bucket={} name={} range=[{}, {})", bucket, object, start, end);
            self.gcs_read_range(&bucket, &object, start, end).await
        })
    }

    fn start_upload(
        &self,
        bucket: &str,
        object: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let bucket = bucket.to_string();
        let object = object.to_string();
        Box::pin(async move {
            debug!("GCS start upload: bucket={} name={}", bucket, object);
            self.gcs_start_upload(&bucket, &object).await
        })
    }

    fn upload_chunk(
        &self,
        session: &str,
        offset: u64,
        data: Bytes,
        finalize: bool,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ObjectInfo>>> + Send + '_>> {
        let session = session.to_string();
        Box::pin(async move {
            debug!(
                "GCS upload chunk: offset={} len={} final={}",
                offset,
                data.len(),
                finalize
            );
            self.gcs_upload_chunk(&session, offset, data, finalize).await
        })
    }

    fn compose(
        &self,
        bucket: &str,
        sources: &[String],
        destination: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ObjectInfo>> + Send + '_>> {
        let bucket = bucket.to_string();
        let sources = sources.to_vec();
        let destination = destination.to_string();
        Box::pin(async move {
            debug!(
                "GCS compose: bucket={} sources={:?} destination={}",
                bucket, sources, destination
            );
            self.gcs_compose(&bucket, &sources, &destination).await
        })
    }

    fn delete(
        &self,
        bucket: &str,
        object: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let bucket = bucket.to_string();
        let object = object.to_string();
        Box::pin(async move {
            debug!("GCS delete: bucket={} name={}", bucket, object);
            self.gcs_delete(&bucket, &object).await
        })
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> GcpStorageConfig {
        GcpStorageConfig {
            endpoint: "http://localhost:4443/".to_string(),
            anonymous: true,
            ..GcpStorageConfig::default()
        }
    }

    #[test]
    fn test_new_trims_endpoint() {
        let backend = GcsBackend::new(&test_config()).unwrap();
        assert_eq!(
            backend.object_url("bkt", "a/b c.txt"),
            "http://localhost:4443/storage/v1/b/bkt/o/a%2Fb%20c%2Etxt"
        );
        assert!(backend.project_query().is_empty());
    }

    #[test]
    fn test_new_rejects_unreadable_credentials_file() {
        let config = GcpStorageConfig {
            credentials_file: "/definitely/not/here.json".to_string(),
            ..test_config()
        };
        let err = GcsBackend::new(&config).err().unwrap();
        assert!(err.to_string().contains("Error initializing token from file"));
    }

    #[test]
    fn test_project_query() {
        let config = GcpStorageConfig {
            project: "billing-project".to_string(),
            ..test_config()
        };
        let backend = GcsBackend::new(&config).unwrap();
        assert_eq!(
            backend.project_query(),
            vec![("userProject", "billing-project".to_string())]
        );
    }

    #[test]
    fn test_content_range() {
        assert_eq!(GcsBackend::content_range(0, 262144, false), "bytes 0-262143/*");
        assert_eq!(GcsBackend::content_range(262144, 10, true), "bytes 262144-262153/262154");
        assert_eq!(GcsBackend::content_range(100, 0, true), "bytes */100");
    }

    #[test]
    fn test_persisted_bytes() {
        assert_eq!(GcsBackend::persisted_bytes(None).unwrap(), 0);
        assert_eq!(GcsBackend::persisted_bytes(Some("bytes=0-262143")).unwrap(), 262144);
        assert!(GcsBackend::persisted_bytes(Some("bytes=5-9")).is_err());
        assert!(GcsBackend::persisted_bytes(Some("garbage")).is_err());
    }

    #[test]
    fn test_url_encode_simple_name() {
        assert_eq!(GcsBackend::url_encode("simple"), "simple");
        let encoded = GcsBackend::url_encode("path/to/my object.txt");
        assert!(encoded.contains("%2F"));
        assert!(encoded.contains("%20"));
    }

    #[test]
    fn test_object_size_parsing() {
        let json = r#"{"name":"part-0.csv","size":"1024","md5Hash":"1B2M2Y8AsgTpgAmY7PhCfg=="}"#;
        let object: GcsObject = serde_json::from_str(json).unwrap();
        let info = object.into_info().unwrap().unwrap();
        assert_eq!(info.name, "part-0.csv");
        assert_eq!(info.size, 1024);
        assert_eq!(info.md5_hash.as_deref(), Some("1B2M2Y8AsgTpgAmY7PhCfg=="));

        let bad: GcsObject = serde_json::from_str(r#"{"name":"x","size":"-3"}"#).unwrap();
        assert!(bad.into_info().is_err());

        let nameless: GcsObject = serde_json::from_str(r#"{"size":"3"}"#).unwrap();
        assert!(nameless.into_info().unwrap().is_none());
    }

    #[test]
    fn test_list_response_parsing() {
        let json = r#"{"items":[{"name":"a","size":"1"},{"name":"b","size":"2"}],"nextPageToken":"tok"}"#;
        let parsed: GcsListResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.items.unwrap().len(), 2);
        assert_eq!(parsed.next_page_token.as_deref(), Some("tok"));

        let empty: GcsListResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.items.is_none());
    }

    #[test]
    fn test_gcs_error_parsing() {
        let body = r#"{"error":{"code":404,"message":"No such object: bucket/key"}}"#;
        let err = GcsBackend::map_gcs_error("download", StatusCode::NOT_FOUND, body);
        assert_eq!(
            err.to_string(),
            "GCS download: No such object: bucket/key (code 404)"
        );

        let err = GcsBackend::map_gcs_error("list", StatusCode::BAD_GATEWAY, "upstream");
        assert!(err.to_string().contains("HTTP 502"));
    }

    #[test]
    fn test_compose_request_shape() {
        let req = ComposeRequest {
            source_objects: vec![
                ComposeSourceObject { name: "target".into() },
                ComposeSourceObject { name: "tmp".into() },
            ],
            destination: ComposeDestination {
                content_type: "application/octet-stream".into(),
            },
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["sourceObjects"][0]["name"], "target");
        assert_eq!(json["sourceObjects"][1]["name"], "tmp");
        assert_eq!(json["destination"]["contentType"], "application/octet-stream");
    }

    #[test]
    fn test_application_default_credentials_path() {
        let path = GcsBackend::application_default_credentials_path();
        assert!(path.ends_with("application_default_credentials.json"));
    }
}
