//! S3-compatible destination.
//!
//! Path-style addressing (`<endpoint>/<bucket>/<key>`) so the first segment
//! of a destination path is the bucket. Uses reqwest with manual AWS
//! Signature V4 signing. Object bodies are streamed with an
//! `UNSIGNED-PAYLOAD` hash, so a blob is never held in memory whole.

use std::collections::BTreeMap;

use anyhow::{bail, Context};
use async_trait::async_trait;
use blobmigrator_common::store::{DestinationStore, ObjectStat, ObjectWriter, WriteOptions};
use bytes::Bytes;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, RequestBuilder};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
const PIPE_CAPACITY: usize = 256 * 1024;

#[derive(Clone)]
pub struct S3Config {
    pub region: String,
    pub endpoint: Option<String>, // Custom endpoint for MinIO or other S3-compatible APIs
    pub access_key_id: String,
    pub secret_access_key: String,
    pub storage_class: Option<String>,
}

pub struct S3Destination {
    config: S3Config,
    client: Client,
}

impl S3Destination {
    pub fn new(config: S3Config) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(3600))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        match &self.config.endpoint {
            Some(ep) => ep.trim_end_matches('/').to_string(),
            None => format!("https://s3.{}.amazonaws.com", self.config.region),
        }
    }

    /// Canonical URI and full URL for a destination path.
    fn locate(&self, path: &str) -> anyhow::Result<(String, String)> {
        let (bucket, key) = split_path(path)?;
        let canonical = format!("/{}/{}", bucket, encode_key(key));
        let url = format!("{}{}", self.endpoint(), canonical);
        Ok((canonical, url))
    }

    /// Build a signed request. `extra` headers are signed along with the
    /// standard ones.
    fn signed(
        &self,
        method: reqwest::Method,
        path: &str,
        payload_hash: &str,
        extra: BTreeMap<String, String>,
    ) -> anyhow::Result<RequestBuilder> {
        let (canonical, url) = self.locate(path)?;
        let now = Utc::now();
        let date_time = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let mut headers = extra;
        headers.insert("host".to_string(), url_host(&self.endpoint()));
        headers.insert("x-amz-content-sha256".to_string(), payload_hash.to_string());
        headers.insert("x-amz-date".to_string(), date_time.clone());

        let auth = sign(
            &self.config,
            method.as_str(),
            &canonical,
            "",
            &headers,
            payload_hash,
            &date_time,
            &date,
        )?;

        let mut req = self.client.request(method, &url).header("Authorization", auth);
        for (name, value) in &headers {
            // reqwest sets Host itself from the URL.
            if name != "host" {
                req = req.header(name.as_str(), value.as_str());
            }
        }
        Ok(req)
    }
}

/// Compute the AWS Signature V4 `Authorization` header value.
#[allow(clippy::too_many_arguments)]
fn sign(
    config: &S3Config,
    method: &str,
    canonical_path: &str,
    query: &str,
    headers: &BTreeMap<String, String>,
    payload_hash: &str,
    date_time: &str,
    date: &str,
) -> anyhow::Result<String> {
    // Canonical request
    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect();
    let signed_headers: String = headers.keys().cloned().collect::<Vec<_>>().join(";");

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method, canonical_path, query, canonical_headers, signed_headers, payload_hash
    );

    // String to sign
    let cr_hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));
    let credential_scope = format!("{}/{}/s3/aws4_request", date, config.region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        date_time, credential_scope, cr_hash
    );

    let signing_key = derive_signing_key(&config.secret_access_key, date, &config.region)?;
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

    Ok(format!(
        "AWS4-HMAC-SHA256 Credential={}/{},SignedHeaders={},Signature={}",
        config.access_key_id, credential_scope, signed_headers, signature
    ))
}

fn derive_signing_key(secret: &str, date: &str, region: &str) -> anyhow::Result<Vec<u8>> {
    let key = format!("AWS4{}", secret);
    let k_date = hmac_sha256(key.as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, b"s3")?;
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| anyhow::anyhow!("HMAC key: {}", e))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn empty_hash() -> String {
    hex::encode(Sha256::digest(b""))
}

/// `/bucket/some/key` → (`bucket`, `some/key`).
fn split_path(path: &str) -> anyhow::Result<(&str, &str)> {
    let trimmed = path.trim_start_matches('/');
    match trimmed.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => Ok((bucket, key)),
        _ => bail!("destination path {:?} has no bucket and key", path),
    }
}

/// URI-encode each key segment, keeping the separators.
fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Extract the host part from a URL for use in signing.
fn url_host(url: &str) -> String {
    // Strip scheme and path, return just host[:port]
    let without_scheme = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    without_scheme.split('/').next().unwrap_or(without_scheme).to_string()
}

/// A PUT in flight. Chunks are piped into the request body; the request
/// itself runs on its own task, which is aborted if the writer is dropped
/// without `close`.
struct S3Writer {
    key: String,
    pipe: DuplexStream,
    request: Option<JoinHandle<anyhow::Result<()>>>,
    written: u64,
}

impl Drop for S3Writer {
    fn drop(&mut self) {
        if let Some(request) = self.request.take() {
            request.abort();
        }
    }
}

#[async_trait]
impl ObjectWriter for S3Writer {
    async fn write(&mut self, chunk: Bytes) -> anyhow::Result<()> {
        self.pipe
            .write_all(&chunk)
            .await
            .context("S3 PUT body closed early")?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    fn written(&self) -> u64 {
        self.written
    }

    async fn close(self: Box<Self>) -> anyhow::Result<()> {
        let mut this = self;
        // Shutdown signals end of body to the request task.
        this.pipe.shutdown().await.context("Failed to finish S3 PUT body")?;
        let Some(request) = this.request.take() else {
            bail!("S3 PUT of {} already finished", this.key);
        };
        request.await.context("S3 PUT task failed")??;
        debug!(key = %this.key, bytes = this.written, "S3 upload complete");
        Ok(())
    }
}

#[async_trait]
impl DestinationStore for S3Destination {
    async fn open(&self, path: &str, options: &WriteOptions) -> anyhow::Result<Box<dyn ObjectWriter>> {
        let Some(length) = options.content_length else {
            bail!("S3 PUT of {} needs a content length", path);
        };

        let mut headers = BTreeMap::new();
        headers.insert("content-length".to_string(), length.to_string());
        if let Some(ref ct) = options.content_type {
            headers.insert("content-type".to_string(), ct.clone());
        }
        if let Some(ref cd) = options.content_disposition {
            headers.insert("content-disposition".to_string(), cd.clone());
        }
        if let Some(ref sc) = self.config.storage_class {
            headers.insert("x-amz-storage-class".to_string(), sc.clone());
        }

        let req = self.signed(reqwest::Method::PUT, path, UNSIGNED_PAYLOAD, headers)?;
        let (pipe, body) = tokio::io::duplex(PIPE_CAPACITY);
        let req = req.body(reqwest::Body::wrap_stream(ReaderStream::new(body)));

        let request = tokio::spawn(async move {
            let resp = req.send().await.context("S3 PUT request failed")?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                bail!("S3 PUT failed: HTTP {} - {}", status, body);
            }
            anyhow::Ok(())
        });

        Ok(Box::new(S3Writer {
            key: path.to_string(),
            pipe,
            request: Some(request),
            written: 0,
        }))
    }

    async fn delete(&self, path: &str) -> anyhow::Result<()> {
        let resp = self
            .signed(reqwest::Method::DELETE, path, &empty_hash(), BTreeMap::new())?
            .send()
            .await
            .context("S3 DELETE request failed")?;

        if !resp.status().is_success() && resp.status().as_u16() != 404 {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("S3 DELETE failed: HTTP {} - {}", status, body);
        }

        debug!(key = %path, "S3 delete complete");
        Ok(())
    }

    async fn stat(&self, path: &str) -> anyhow::Result<Option<ObjectStat>> {
        let resp = self
            .signed(reqwest::Method::HEAD, path, &empty_hash(), BTreeMap::new())?
            .send()
            .await
            .context("S3 HEAD request failed")?;

        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        if !resp.status().is_success() {
            bail!("S3 HEAD failed: HTTP {}", resp.status());
        }

        let header = |name: &str| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let size = header("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let content_type = header("content-type");

        let mut headers = BTreeMap::new();
        for (name, value) in resp.headers() {
            let name = name.as_str();
            if name == "content-disposition" || name.starts_with("x-amz-meta-") {
                if let Ok(v) = value.to_str() {
                    headers.insert(name.to_string(), v.to_string());
                }
            }
        }

        Ok(Some(ObjectStat { size, content_type, headers }))
    }
}
