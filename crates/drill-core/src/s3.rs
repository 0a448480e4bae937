//! S3 stores used by the DR operator.
//!
//! The DR operator keeps cluster metadata in S3 buckets described by S3
//! profiles. This module checks that each profile's bucket is reachable with
//! the profile's credentials, and gathers objects from the buckets for
//! diagnostics. Requests are signed with AWS signature version 4 and use
//! path style addressing, which works with both AWS and MinIO style stores.
//!
//! [`check_profiles`] and [`gather_profiles`] probe all profiles in parallel
//! and report exactly one [`S3Result`] per profile on the returned channel,
//! which closes after the last profile reports. A profile whose task panics
//! reports [`S3Error::Aborted`].

use crate::config::S3ProfileConfig;
use chrono::Utc;
use hmac::{Hmac, Mac};
use k8s_openapi::api::core::v1::Secret;
use regex::Regex;
use reqwest::{Method, StatusCode, Url};
use sha2::{Digest, Sha256};
use std::fmt;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Secret key holding the S3 access key id.
pub const ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";

/// Secret key holding the S3 secret access key.
pub const SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";

/// SHA256 of an empty payload.
const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

static KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<Key>([^<]*)</Key>").expect("valid regex"));
static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<NextContinuationToken>([^<]*)</NextContinuationToken>").expect("valid regex")
});

/// Errors talking to an S3 store.
#[derive(Debug, Error)]
pub enum S3Error {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("bucket {0:?} does not exist")]
    NoSuchBucket(String),

    #[error("object {0:?} does not exist")]
    NoSuchKey(String),

    #[error("{operation} failed with status {status}")]
    Status { operation: String, status: u16 },

    #[error("invalid endpoint {0:?}")]
    InvalidEndpoint(String),

    #[error("secret is missing {0:?}")]
    MissingCredentials(String),

    #[error("refusing to store object with unsafe key {0:?}")]
    UnsafeKey(String),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("failed to store object: {0}")]
    Io(#[from] std::io::Error),

    #[error("s3 task failed: {0}")]
    Aborted(String),
}

/// An S3 profile with resolved credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Profile {
    pub name: String,
    pub bucket: String,
    pub endpoint: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
}

impl fmt::Debug for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Profile")
            .field("name", &self.name)
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

impl Profile {
    /// Builds a profile from its configuration and the secret referenced by
    /// it.
    pub fn from_secret(config: &S3ProfileConfig, secret: &Secret) -> Result<Self, S3Error> {
        Ok(Self {
            name: config.name.clone(),
            bucket: config.bucket.clone(),
            endpoint: config.endpoint.clone(),
            region: config.region.clone(),
            access_key: secret_value(secret, ACCESS_KEY_ID)?,
            secret_key: secret_value(secret, SECRET_ACCESS_KEY)?,
        })
    }
}

fn secret_value(secret: &Secret, key: &str) -> Result<String, S3Error> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .and_then(|value| String::from_utf8(value.0.clone()).ok())
        .ok_or_else(|| S3Error::MissingCredentials(key.to_string()))
}

/// Outcome of probing one profile.
#[derive(Debug)]
pub struct S3Result {
    pub profile_name: String,
    /// Set if the probe failed.
    pub err: Option<S3Error>,
}

/// Checks that every profile's bucket is accessible.
///
/// Must be called from within a Tokio runtime.
pub fn check_profiles(profiles: &[Profile]) -> mpsc::Receiver<S3Result> {
    fan_out(profiles, |profile| async move {
        Client::new(&profile)?.head_bucket().await
    })
}

/// Downloads objects under `prefixes` from every profile's bucket into
/// `<output_dir>/<profile>/`.
///
/// Must be called from within a Tokio runtime.
pub fn gather_profiles(
    profiles: &[Profile],
    prefixes: &[String],
    output_dir: &Path,
) -> mpsc::Receiver<S3Result> {
    fan_out(profiles, |profile| {
        let prefixes = prefixes.to_vec();
        let dir = output_dir.join(&profile.name);
        async move {
            let client = Client::new(&profile)?;
            let mut count = 0;
            for prefix in &prefixes {
                count += client.download_prefix(prefix, &dir).await?;
            }
            info!("Gathered {} objects from s3 profile {:?}", count, profile.name);
            Ok::<(), S3Error>(())
        }
    })
}

fn fan_out<F, Fut>(profiles: &[Profile], probe: F) -> mpsc::Receiver<S3Result>
where
    F: Fn(Profile) -> Fut,
    Fut: Future<Output = Result<(), S3Error>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(profiles.len().max(1));
    for profile in profiles {
        let tx = tx.clone();
        let profile_name = profile.name.clone();
        let task = tokio::spawn(probe(profile.clone()));
        tokio::spawn(async move {
            let err = match task.await {
                Ok(result) => result.err(),
                Err(err) => Some(S3Error::Aborted(err.to_string())),
            };
            if let Some(err) = &err {
                error!(profile = %profile_name, "S3 probe failed: {}", err);
            }
            // One slot per profile, so this never waits.
            let _ = tx.send(S3Result { profile_name, err }).await;
        });
    }
    rx
}

/// Minimal S3 client for one profile.
pub struct Client {
    http: reqwest::Client,
    profile: Profile,
}

impl Client {
    pub fn new(profile: &Profile) -> Result<Self, S3Error> {
        Url::parse(&profile.endpoint)
            .map_err(|_| S3Error::InvalidEndpoint(profile.endpoint.clone()))?;
        Ok(Self {
            http: reqwest::Client::new(),
            profile: profile.clone(),
        })
    }

    /// Checks the bucket exists and the credentials can access it.
    pub async fn head_bucket(&self) -> Result<(), S3Error> {
        let response = self.send(Method::HEAD, None, &[]).await?;
        self.check_status("HeadBucket", None, response.status())
    }

    /// Lists keys under `prefix`.
    pub async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, S3Error> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("prefix".to_string(), prefix.to_string()),
            ];
            if let Some(token) = &token {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let response = self.send(Method::GET, None, &query).await?;
            self.check_status("ListObjectsV2", None, response.status())?;
            let body = response.text().await?;

            keys.extend(parse_keys(&body));
            token = parse_continuation_token(&body);
            if token.is_none() {
                break;
            }
        }
        Ok(keys)
    }

    /// Downloads one object.
    pub async fn get_object(&self, key: &str) -> Result<Vec<u8>, S3Error> {
        let response = self.send(Method::GET, Some(key), &[]).await?;
        self.check_status("GetObject", Some(key), response.status())?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn download_prefix(&self, prefix: &str, dir: &Path) -> Result<usize, S3Error> {
        let keys = self.list_objects(prefix).await?;
        for key in &keys {
            let path = object_path(dir, key)?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let data = self.get_object(key).await?;
            tokio::fs::write(&path, data).await?;
            debug!(profile = %self.profile.name, "Downloaded {:?}", key);
        }
        Ok(keys.len())
    }

    /// Maps a response status to an error. A missing `key` means the
    /// request addressed the bucket itself.
    fn check_status(
        &self,
        operation: &str,
        key: Option<&str>,
        status: StatusCode,
    ) -> Result<(), S3Error> {
        match status {
            s if s.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(S3Error::InvalidCredentials),
            StatusCode::NOT_FOUND => Err(match key {
                Some(key) => S3Error::NoSuchKey(key.to_string()),
                None => S3Error::NoSuchBucket(self.profile.bucket.clone()),
            }),
            s => Err(S3Error::Status {
                operation: operation.to_string(),
                status: s.as_u16(),
            }),
        }
    }

    async fn send(
        &self,
        method: Method,
        key: Option<&str>,
        query: &[(String, String)],
    ) -> Result<reqwest::Response, S3Error> {
        let mut path = format!("/{}", uri_encode(&self.profile.bucket, true));
        if let Some(key) = key {
            path.push('/');
            path.push_str(&uri_encode(key, false));
        }

        let mut pairs: Vec<(String, String)> = query
            .iter()
            .map(|(k, v)| (uri_encode(k, true), uri_encode(v, true)))
            .collect();
        pairs.sort();
        let canonical_query = pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");

        let mut url = format!("{}{}", self.profile.endpoint.trim_end_matches('/'), path);
        if !canonical_query.is_empty() {
            url.push('?');
            url.push_str(&canonical_query);
        }
        let url =
            Url::parse(&url).map_err(|_| S3Error::InvalidEndpoint(self.profile.endpoint.clone()))?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(S3Error::InvalidEndpoint(self.profile.endpoint.clone())),
        };

        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let authorization = SignedRequest {
            method: method.as_str(),
            path: &path,
            query: &canonical_query,
            host: &host,
            amz_date: &amz_date,
            date: &date,
        }
        .authorization(&self.profile);

        let response = self
            .http
            .request(method, url)
            .header("x-amz-date", amz_date)
            .header("x-amz-content-sha256", EMPTY_PAYLOAD_SHA256)
            .header("authorization", authorization)
            .send()
            .await?;
        Ok(response)
    }
}

/// The parts of a request covered by the signature.
struct SignedRequest<'a> {
    method: &'a str,
    path: &'a str,
    query: &'a str,
    host: &'a str,
    amz_date: &'a str,
    date: &'a str,
}

impl SignedRequest<'_> {
    const SIGNED_HEADERS: &'static str = "host;x-amz-content-sha256;x-amz-date";

    fn canonical_request(&self) -> String {
        format!(
            "{}\n{}\n{}\nhost:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n\n{}\n{}",
            self.method,
            self.path,
            self.query,
            self.host,
            EMPTY_PAYLOAD_SHA256,
            self.amz_date,
            Self::SIGNED_HEADERS,
            EMPTY_PAYLOAD_SHA256
        )
    }

    fn authorization(&self, profile: &Profile) -> String {
        let scope = format!("{}/{}/s3/aws4_request", self.date, profile.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            self.amz_date,
            scope,
            hex::encode(Sha256::digest(self.canonical_request().as_bytes()))
        );
        let key = signing_key(&profile.secret_key, self.date, &profile.region, "s3");
        let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes()));

        format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            profile.access_key,
            scope,
            Self::SIGNED_HEADERS,
            signature
        )
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length.
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).expect("hmac accepts any key");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn signing_key(secret_key: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// Percent-encodes everything except RFC 3986 unreserved characters. Slashes
/// are kept unless `encode_slash` is set.
fn uri_encode(value: &str, encode_slash: bool) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char);
            }
            b'/' if !encode_slash => encoded.push('/'),
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

fn xml_unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn parse_keys(body: &str) -> Vec<String> {
    KEY_RE
        .captures_iter(body)
        .map(|c| xml_unescape(&c[1]))
        .collect()
}

fn parse_continuation_token(body: &str) -> Option<String> {
    if !body.contains("<IsTruncated>true</IsTruncated>") {
        return None;
    }
    TOKEN_RE.captures(body).map(|c| xml_unescape(&c[1]))
}

/// Local path for an object key, rejecting keys escaping `dir`.
fn object_path(dir: &Path, key: &str) -> Result<PathBuf, S3Error> {
    let relative = Path::new(key);
    let safe = !key.is_empty()
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !safe {
        return Err(S3Error::UnsafeKey(key.to_string()));
    }
    Ok(dir.join(relative))
}
