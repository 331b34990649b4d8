//! Google Cloud Storage backend
//!
//! Talks to the Cloud Storage JSON API directly over `reqwest`:
//! - service-account credentials file → signed JWT → OAuth2 access token
//! - media uploads of overlay files
//! - V4 (GOOG4-RSA-SHA256) signed `PUT` URLs for client-side volume uploads

use crate::config::StorageConfig;
use crate::error::{Result, SegmentError};
use crate::storage::{ObjectStore, PUBLIC_HOST};
use base64::Engine;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use once_cell::sync::OnceCell;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

const SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const SIGNING_ALGORITHM: &str = "GOOG4-RSA-SHA256";
const SIGNED_HOST: &str = "storage.googleapis.com";

/// Tokens are refreshed this long before Google says they expire.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// RFC 3986 unreserved characters pass through; everything else is escaped.
const URI_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// The fields of a service-account JSON key this service needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub project_id: Option<String>,
}

impl ServiceAccountKey {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SegmentError::Credentials(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            SegmentError::Credentials(format!("invalid service account file {}: {}", path.display(), e))
        })
    }
}

/// Parsed key plus the RSA signer derived from it.
pub struct Credentials {
    pub key: ServiceAccountKey,
    signer: EncodingKey,
}

impl Credentials {
    pub fn new(key: ServiceAccountKey) -> Result<Self> {
        let signer = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| SegmentError::Credentials(format!("invalid private key: {}", e)))?;
        Ok(Self { key, signer })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Self::new(ServiceAccountKey::from_file(path)?)
    }

    /// RSA-SHA256 signature of `message`, raw bytes.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let encoded = jsonwebtoken::crypto::sign(message, &self.signer, Algorithm::RS256)
            .map_err(|e| SegmentError::Credentials(format!("signing failed: {}", e)))?;
        base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| SegmentError::Credentials(format!("signing failed: {}", e)))
    }

    /// Self-signed assertion for the OAuth2 JWT bearer grant.
    pub fn token_assertion(&self, now: DateTime<Utc>) -> Result<String> {
        let iat = now.timestamp();
        let claims = AssertionClaims {
            iss: &self.key.client_email,
            scope: SCOPE,
            aud: &self.key.token_uri,
            iat,
            exp: iat + 3600,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.signer)
            .map_err(|e| SegmentError::Credentials(format!("failed to build token assertion: {}", e)))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    token: String,
    refresh_at: Instant,
}

fn encode_object_path(object: &str) -> String {
    object
        .split('/')
        .map(|segment| utf8_percent_encode(segment, URI_ESCAPE).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Components of a V4 signed request, kept separate so they can be checked.
#[derive(Debug, Clone)]
pub struct SignedRequestParts {
    pub canonical_request: String,
    pub string_to_sign: String,
    /// Path plus canonical query string, without the signature.
    pub unsigned_url: String,
}

/// Build the canonical request and string-to-sign for a `PUT` of `object`.
pub fn v4_put_request(
    client_email: &str,
    bucket: &str,
    object: &str,
    content_type: &str,
    expires: Duration,
    now: DateTime<Utc>,
) -> SignedRequestParts {
    let datetime = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    let scope = format!("{}/auto/storage/goog4_request", date);
    let credential = format!("{}/{}", client_email, scope);
    let signed_headers = "content-type;host";

    let canonical_uri = format!("/{}/{}", bucket, encode_object_path(object));

    // already in lexicographic order
    let query = [
        ("X-Goog-Algorithm", SIGNING_ALGORITHM.to_string()),
        ("X-Goog-Credential", credential),
        ("X-Goog-Date", datetime.clone()),
        ("X-Goog-Expires", expires.as_secs().to_string()),
        ("X-Goog-SignedHeaders", signed_headers.to_string()),
    ]
    .iter()
    .map(|(k, v)| format!("{}={}", k, utf8_percent_encode(v, URI_ESCAPE)))
    .collect::<Vec<_>>()
    .join("&");

    let canonical_headers = format!("content-type:{}\nhost:{}\n", content_type.trim(), SIGNED_HOST);
    let canonical_request = [
        "PUT",
        canonical_uri.as_str(),
        query.as_str(),
        canonical_headers.as_str(),
        signed_headers,
        "UNSIGNED-PAYLOAD",
    ]
    .join("\n");

    let digest = hex::encode(Sha256::digest(canonical_request.as_bytes()));
    let string_to_sign = [SIGNING_ALGORITHM, datetime.as_str(), scope.as_str(), digest.as_str()].join("\n");

    SignedRequestParts {
        canonical_request,
        string_to_sign,
        unsigned_url: format!("{}{}?{}", PUBLIC_HOST, canonical_uri, query),
    }
}

/// V4 signed URL for a single `PUT` of `object`.
pub fn sign_put_url(
    credentials: &Credentials,
    bucket: &str,
    object: &str,
    content_type: &str,
    expires: Duration,
    now: DateTime<Utc>,
) -> Result<String> {
    let parts = v4_put_request(&credentials.key.client_email, bucket, object, content_type, expires, now);
    let signature = credentials.sign(parts.string_to_sign.as_bytes())?;
    Ok(format!("{}&X-Goog-Signature={}", parts.unsigned_url, hex::encode(signature)))
}

/// Cloud Storage object store.
pub struct GcsStore {
    bucket: String,
    upload_endpoint: String,
    credentials_path: PathBuf,
    credentials: OnceCell<Credentials>,
    client: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

impl GcsStore {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.upload_timeout())
            .build()
            .map_err(|e| SegmentError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            bucket: config.bucket.clone(),
            upload_endpoint: config.upload_endpoint.trim_end_matches('/').to_string(),
            credentials_path: config.credentials_path.clone(),
            credentials: OnceCell::new(),
            client,
            token: Mutex::new(None),
        })
    }

    /// Credentials are read on first use and kept for the process lifetime.
    pub fn credentials(&self) -> Result<&Credentials> {
        self.credentials.get_or_try_init(|| {
            let creds = Credentials::from_file(&self.credentials_path)?;
            info!(
                client_email = %creds.key.client_email,
                path = %self.credentials_path.display(),
                "Loaded service account credentials"
            );
            Ok(creds)
        })
    }

    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.token.clone());
            }
        }

        let credentials = self.credentials()?;
        let assertion = credentials.token_assertion(Utc::now())?;
        let response = self
            .client
            .post(&credentials.key.token_uri)
            .form(&[("grant_type", JWT_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| SegmentError::Credentials(format!("token request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SegmentError::Credentials(format!(
                "token request rejected ({}): {}",
                status, body
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| SegmentError::Credentials(format!("malformed token response: {}", e)))?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        debug!(expires_in = token.expires_in, "Obtained storage access token");
        *cached = Some(CachedToken {
            token: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }
}

impl ObjectStore for GcsStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn put_file<'a>(
        &'a self,
        object: &'a str,
        path: &'a Path,
        content_type: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let bytes = tokio::fs::read(path).await.map_err(|e| {
                SegmentError::Upload(format!("failed to read {}: {}", path.display(), e))
            })?;
            let size = bytes.len();
            let token = self.access_token().await?;

            let url = format!(
                "{}/{}/o",
                self.upload_endpoint,
                utf8_percent_encode(&self.bucket, URI_ESCAPE)
            );
            let response = self
                .client
                .post(url)
                .query(&[("uploadType", "media"), ("name", object)])
                .bearer_auth(token)
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(bytes)
                .send()
                .await
                .map_err(|e| SegmentError::Upload(format!("{}: {}", object, e)))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(SegmentError::Upload(format!("{} rejected ({}): {}", object, status, body)));
            }

            debug!(object = %object, bytes = size, "Uploaded object");
            Ok(())
        })
    }

    fn signed_put_url<'a>(
        &'a self,
        bucket: &'a str,
        object: &'a str,
        content_type: &'a str,
        expires: Duration,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let credentials = self.credentials()?;
            sign_put_url(credentials, bucket, object, content_type, expires, Utc::now())
        })
    }
}
