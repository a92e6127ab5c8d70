//! [`Backend`] for S3 and S3-compatible stores (MinIO, LocalStack).
//!
//! Requests are signed with AWS Signature V4 by hand, using `hmac` and
//! `sha2`, so no AWS SDK is needed. Credentials come from the environment
//! on every request:
//!
//! | Variable | Required |
//! |----------|----------|
//! | `AWS_ACCESS_KEY_ID` | yes |
//! | `AWS_SECRET_ACCESS_KEY` | yes |
//! | `AWS_SESSION_TOKEN` | no |
//!
//! With no `endpoint_url`, virtual-hosted addressing is used
//! (`<bucket>.s3.<region>.amazonaws.com`). A custom endpoint is addressed
//! path-style (`<endpoint>/<bucket>/<key>`), which is what MinIO expects.
//!
//! Blob metadata travels as `Content-Type` plus `x-amz-meta-*` headers.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bitdex_core::store::{Backend, BlobMetadata, ObjectStat};
use bitdex_core::Checksum;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const META_FILENAME: &str = "x-amz-meta-filename";
const META_ENCODING: &str = "x-amz-meta-content-encoding";

pub struct S3Backend {
    name: String,
    bucket: String,
    prefix: String,
    region: String,
    endpoint_url: Option<String>,
    client: reqwest::Client,
}

struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

impl S3Backend {
    pub fn new(
        name: &str,
        bucket: &str,
        prefix: &str,
        region: &str,
        endpoint_url: Option<&str>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            name: name.to_string(),
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
            region: region.to_string(),
            endpoint_url: endpoint_url.map(str::to_string),
            client,
        })
    }

    fn key_for(&self, checksum: &Checksum) -> String {
        format!("{}{}", self.prefix, checksum.object_path())
    }

    /// `(scheme, host, path prefix)` for this bucket.
    fn endpoint(&self) -> (&'static str, String, String) {
        match &self.endpoint_url {
            Some(endpoint) => {
                let scheme = if endpoint.starts_with("http://") {
                    "http"
                } else {
                    "https"
                };
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .trim_end_matches('/')
                    .to_string();
                (scheme, host, format!("/{}", uri_encode(&self.bucket)))
            }
            None => (
                "https",
                format!("{}.s3.{}.amazonaws.com", self.bucket, self.region),
                String::new(),
            ),
        }
    }

    /// Send one signed request.
    ///
    /// `key` of `None` addresses the bucket itself (used for listing).
    async fn send(
        &self,
        method: Method,
        key: Option<&str>,
        query: &[(&str, String)],
        body: Option<&[u8]>,
        extra_headers: &[(&str, String)],
    ) -> Result<reqwest::Response> {
        let creds = AwsCredentials::from_env()?;
        let (scheme, host, base_path) = self.endpoint();

        let canonical_uri = match key {
            Some(k) => format!(
                "{}/{}",
                base_path,
                k.split('/').map(uri_encode).collect::<Vec<_>>().join("/")
            ),
            None => format!("{}/", base_path),
        };

        let mut sorted_query: Vec<(String, String)> = query
            .iter()
            .map(|(k, v)| (uri_encode(k), uri_encode(v)))
            .collect();
        sorted_query.sort();
        let canonical_query = sorted_query
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(body.unwrap_or_default());

        let mut headers = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_query,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );
        let signing_key =
            derive_signing_key(&creds.secret_access_key, &date_stamp, &self.region, "s3")?;
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            creds.access_key_id, credential_scope, signed_headers, signature
        );

        let url = if canonical_query.is_empty() {
            format!("{}://{}{}", scheme, host, canonical_uri)
        } else {
            format!("{}://{}{}?{}", scheme, host, canonical_uri, canonical_query)
        };

        let mut req = self
            .client
            .request(method.clone(), &url)
            .header("Authorization", &authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date);
        if let Some(ref token) = creds.session_token {
            req = req.header("x-amz-security-token", token);
        }
        for (name, value) in extra_headers {
            req = req.header(*name, value);
        }
        if let Some(bytes) = body {
            req = req.body(bytes.to_vec());
        }

        req.send().await.map_err(|e| {
            anyhow!(
                "S3 {} failed for s3://{}/{}: {}",
                method,
                self.bucket,
                key.unwrap_or(""),
                e
            )
        })
    }

    async fn head(&self, checksum: &Checksum) -> Result<Option<HeaderMap>> {
        let key = self.key_for(checksum);
        let resp = self.send(Method::HEAD, Some(&key), &[], None, &[]).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(resp.headers().clone())),
            s => bail!("S3 HeadObject failed (HTTP {}) for key '{}'", s, key),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[async_trait]
impl Backend for S3Backend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "s3"
    }

    async fn has(&self, checksum: &Checksum) -> Result<bool> {
        Ok(self.head(checksum).await?.is_some())
    }

    async fn stat(&self, checksum: &Checksum) -> Result<Option<ObjectStat>> {
        let Some(headers) = self.head(checksum).await? else {
            return Ok(None);
        };
        let size = header_str(&headers, "content-length")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        let stored_at = header_str(&headers, "last-modified")
            .and_then(|s| DateTime::parse_from_rfc2822(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let metadata = BlobMetadata {
            content_type: header_str(&headers, "content-type")
                .map(str::to_string)
                .unwrap_or_else(|| BlobMetadata::default().content_type),
            content_encoding: header_str(&headers, META_ENCODING).map(str::to_string),
            filename: header_str(&headers, META_FILENAME).map(str::to_string),
        };
        Ok(Some(ObjectStat {
            checksum: checksum.clone(),
            size,
            metadata,
            stored_at,
            backend: self.name.clone(),
        }))
    }

    async fn get(&self, checksum: &Checksum) -> Result<Option<Vec<u8>>> {
        let key = self.key_for(checksum);
        let resp = self.send(Method::GET, Some(&key), &[], None, &[]).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(resp.bytes().await?.to_vec())),
            s => bail!("S3 GetObject failed (HTTP {}) for key '{}'", s, key),
        }
    }

    async fn put(&self, checksum: &Checksum, data: &[u8], metadata: &BlobMetadata) -> Result<()> {
        let key = self.key_for(checksum);
        let mut headers = vec![("content-type", metadata.content_type.clone())];
        if let Some(ref enc) = metadata.content_encoding {
            headers.push((META_ENCODING, enc.clone()));
        }
        if let Some(ref filename) = metadata.filename {
            headers.push((META_FILENAME, uri_encode(filename)));
        }
        let resp = self
            .send(Method::PUT, Some(&key), &[], Some(data), &headers)
            .await?;
        if !resp.status().is_success() {
            bail!("S3 PutObject failed (HTTP {}) for key '{}'", resp.status(), key);
        }
        Ok(())
    }

    async fn delete(&self, checksum: &Checksum) -> Result<bool> {
        // S3 answers 204 whether or not the key existed.
        if !self.has(checksum).await? {
            return Ok(false);
        }
        let key = self.key_for(checksum);
        let resp = self.send(Method::DELETE, Some(&key), &[], None, &[]).await?;
        if !resp.status().is_success() {
            bail!("S3 DeleteObject failed (HTTP {}) for key '{}'", resp.status(), key);
        }
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<Checksum>> {
        let mut out = Vec::new();
        let mut continuation_token: Option<String> = None;
        loop {
            let mut query = vec![
                ("list-type", "2".to_string()),
                ("max-keys", "1000".to_string()),
            ];
            if !self.prefix.is_empty() {
                query.push(("prefix", self.prefix.clone()));
            }
            if let Some(ref token) = continuation_token {
                query.push(("continuation-token", token.clone()));
            }
            let resp = self.send(Method::GET, None, &query, None, &[]).await?;
            if !resp.status().is_success() {
                bail!(
                    "S3 ListObjectsV2 failed (HTTP {}) for bucket '{}'",
                    resp.status(),
                    self.bucket
                );
            }
            let xml = resp.text().await?;
            let (keys, truncated, next) = parse_list_keys(&xml);
            for key in keys {
                let rel = key.strip_prefix(&self.prefix).unwrap_or(&key);
                if let Ok(sum) = Checksum::from_object_path(rel) {
                    out.push(sum);
                }
            }
            if !truncated || next.is_none() {
                break;
            }
            continuation_token = next;
        }
        out.sort();
        Ok(out)
    }
}

// ============ AWS SigV4 ============

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| anyhow!("invalid HMAC key: {}", e))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(
    secret_key: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>> {
    let k_date = hmac_sha256(format!("AWS4{}", secret_key).as_bytes(), date_stamp.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding of everything but `A-Z a-z 0-9 - _ . ~`.
fn uri_encode(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => result.push_str(&format!("%{:02X}", byte)),
        }
    }
    result
}

/// Keys, truncation flag and continuation token of a `ListObjectsV2` page.
fn parse_list_keys(xml: &str) -> (Vec<String>, bool, Option<String>) {
    let truncated = extract_xml_value(xml, "IsTruncated")
        .map(|v| v == "true")
        .unwrap_or(false);
    let next = extract_xml_value(xml, "NextContinuationToken");

    let mut keys = Vec::new();
    let mut remaining = xml;
    while let Some(start) = remaining.find("<Contents>") {
        let block_start = start + "<Contents>".len();
        let Some(end) = remaining[block_start..].find("</Contents>") else {
            break;
        };
        if let Some(key) = extract_xml_value(&remaining[block_start..block_start + end], "Key") {
            keys.push(key);
        }
        remaining = &remaining[block_start + end + "</Contents>".len()..];
    }
    (keys, truncated, next)
}

fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(xml[start..start + end].to_string())
}
