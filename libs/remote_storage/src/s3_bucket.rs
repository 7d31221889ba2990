//! AWS S3 storage wrapper, signing its own requests.
//!
//! Respects `prefix_in_bucket` from [`S3Config`], allowing multiple api
//! users to independently work with the same S3 bucket. When a custom
//! `endpoint` is configured the bucket is addressed path-style
//! (`/<bucket>/<key>`); against AWS proper the virtual-hosted form
//! `<bucket>.s3.<region>.amazonaws.com` is used.

mod sign;

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::{Listing, RemotePath, RemoteStorage, StorageError};
use sign::{RequestDates, SigV4Signer, EMPTY_PAYLOAD_SHA256, UNSIGNED_PAYLOAD};

fn default_concurrency_limit() -> NonZeroUsize {
    NonZeroUsize::new(100).unwrap()
}

fn default_use_tls() -> bool {
    true
}

#[derive(Clone, Debug, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint host; set for S3-compatible stores. Switches the
    /// request style from virtual-hosted to path-style.
    pub endpoint: Option<String>,
    pub prefix_in_bucket: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Propagated as x-amz-storage-class on uploads to AWS proper.
    pub storage_class: Option<String>,
    pub port: Option<u16>,
    #[serde(default = "default_use_tls")]
    pub use_tls: bool,
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: NonZeroUsize,
}

/// AWS S3 storage.
pub struct S3Bucket {
    client: reqwest::Client,
    conf: S3Config,
    signer: SigV4Signer,
    concurrency_limiter: Arc<Semaphore>,
    // Per-request timeout. Accessible for tests.
    pub timeout: Duration,
}

impl S3Bucket {
    /// Creates the S3 storage, errors if incorrect AWS S3 configuration provided.
    pub fn new(conf: S3Config) -> anyhow::Result<Self> {
        tracing::debug!("Creating s3 remote storage for S3 bucket {}", conf.bucket);
        anyhow::ensure!(!conf.bucket.is_empty(), "S3 bucket name is empty");
        anyhow::ensure!(!conf.region.is_empty(), "S3 region is empty");
        let client = reqwest::Client::builder().build()?;
        let signer = SigV4Signer {
            access_key_id: conf.access_key_id.clone(),
            secret_access_key: conf.secret_access_key.clone(),
            region: conf.region.clone(),
            service: "s3".to_string(),
        };
        Ok(Self {
            client,
            concurrency_limiter: Arc::new(Semaphore::new(conf.concurrency_limit.get())),
            signer,
            conf,
            timeout: Duration::from_secs(120),
        })
    }

    fn path_style(&self) -> bool {
        self.conf.endpoint.is_some()
    }

    /// Host for both the URL and the signed `host` header.
    fn host(&self) -> String {
        let bare = match &self.conf.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!("{}.s3.{}.amazonaws.com", self.conf.bucket, self.conf.region),
        };
        match self.conf.port {
            Some(port) => format!("{bare}:{port}"),
            None => bare,
        }
    }

    fn scheme(&self) -> &'static str {
        if self.conf.use_tls {
            "https"
        } else {
            "http"
        }
    }

    /// Bucket-relative key for a remote path, prefix applied.
    fn key_for(&self, path: &RemotePath) -> String {
        match &self.conf.prefix_in_bucket {
            Some(prefix) => format!("{}/{}", prefix.trim_matches('/'), path),
            None => path.to_string(),
        }
    }

    /// Canonical URI for a key: each path segment URI-encoded, slashes kept.
    fn canonical_uri(&self, key: &str) -> String {
        let encoded = key
            .split('/')
            .map(|seg| urlencoding::encode(seg).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        if self.path_style() {
            format!("/{}/{}", self.conf.bucket, encoded)
        } else {
            format!("/{encoded}")
        }
    }

    fn url(&self, canonical_uri: &str, query: &str) -> String {
        if query.is_empty() {
            format!("{}://{}{}", self.scheme(), self.host(), canonical_uri)
        } else {
            format!("{}://{}{}?{}", self.scheme(), self.host(), canonical_uri, query)
        }
    }

    fn use_storage_class(&self) -> bool {
        matches!(&self.conf.storage_class, Some(c) if !c.is_empty()) && self.conf.endpoint.is_none()
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, StorageError> {
        let _permit = self
            .concurrency_limiter
            .acquire()
            .await
            .expect("semaphore is never closed");
        let fut = request.send();
        let response = tokio::select! {
            res = fut => res.map_err(|e| StorageError::Network(e.to_string()))?,
            _ = tokio::time::sleep(self.timeout) => {
                return Err(StorageError::Network("request timed out".to_string()))
            }
            _ = cancel.cancelled() => return Err(StorageError::Cancelled),
        };
        Ok(response)
    }

    /// Issue one signed request with an optional body and the given extra
    /// x-amz headers, already in ascending header-name order.
    #[allow(clippy::too_many_arguments)]
    async fn signed_request(
        &self,
        method: reqwest::Method,
        canonical_uri: &str,
        query: &str,
        payload_hash: &str,
        extra_headers: &[(&str, &str)],
        body: Option<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, StorageError> {
        let dates = RequestDates::now();
        let host = self.host();

        let mut headers: Vec<(&str, &str)> = Vec::with_capacity(3 + extra_headers.len());
        headers.push(("host", host.as_str()));
        headers.push(("x-amz-content-sha256", payload_hash));
        let mut after_date: Vec<(&str, &str)> = Vec::new();
        for &(name, value) in extra_headers {
            if name < "x-amz-date" {
                headers.push((name, value));
            } else {
                after_date.push((name, value));
            }
        }
        headers.push(("x-amz-date", dates.long.as_str()));
        headers.extend(after_date);

        let authorization = self.signer.authorization(
            &dates,
            method.as_str(),
            canonical_uri,
            query,
            &headers,
            payload_hash,
        );

        let mut request = self
            .client
            .request(method, self.url(canonical_uri, query))
            .header("Authorization", authorization);
        for (name, value) in &headers {
            if *name != "host" {
                request = request.header(*name, *value);
            }
        }
        if let Some(body) = body {
            request = request.body(body);
        }
        self.send(request, cancel).await
    }
}

impl RemoteStorage for S3Bucket {
    async fn list(
        &self,
        prefix: Option<&RemotePath>,
        cancel: &CancellationToken,
    ) -> Result<Listing, StorageError> {
        let mut result = Listing::default();
        let list_prefix = match prefix {
            Some(p) => self.key_for(p),
            None => self.conf.prefix_in_bucket.clone().unwrap_or_default(),
        };

        let mut continuation_token: Option<String> = None;
        loop {
            // Canonical query parameters must stay in ascending name order:
            // continuation-token < list-type < prefix.
            let mut query = String::new();
            if let Some(token) = &continuation_token {
                query.push_str("continuation-token=");
                query.push_str(&urlencoding::encode(token));
                query.push('&');
            }
            query.push_str("list-type=2&prefix=");
            query.push_str(&urlencoding::encode(&list_prefix));

            let canonical_uri = if self.path_style() {
                format!("/{}", self.conf.bucket)
            } else {
                "/".to_string()
            };

            let response = self
                .signed_request(
                    reqwest::Method::GET,
                    &canonical_uri,
                    &query,
                    UNSIGNED_PAYLOAD,
                    &[],
                    None,
                    cancel,
                )
                .await?;
            if !response.status().is_success() {
                return Err(StorageError::S3HttpStatus(response.status().as_u16()));
            }
            let xml = response
                .text()
                .await
                .map_err(|e| StorageError::Network(e.to_string()))?;

            for key in xml_tag_values(&xml, "Key") {
                let stripped = match &self.conf.prefix_in_bucket {
                    Some(prefix) => key
                        .strip_prefix(prefix.trim_matches('/'))
                        .map(|k| k.trim_start_matches('/'))
                        .unwrap_or(key),
                    None => key,
                };
                result
                    .keys
                    .push(RemotePath::from_string(stripped).map_err(StorageError::Other)?);
            }

            let truncated = xml_tag_values(&xml, "IsTruncated")
                .first()
                .map(|v| *v == "true")
                .unwrap_or(false);
            if !truncated {
                break;
            }
            continuation_token = xml_tag_values(&xml, "NextContinuationToken")
                .first()
                .map(|v| v.to_string());
            if continuation_token.is_none() {
                break;
            }
        }
        Ok(result)
    }

    async fn upload(
        &self,
        from: &Utf8Path,
        to: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        let body = tokio::fs::read(from).await?;
        let payload_hash = sign::sha256_hex(&body);
        let canonical_uri = self.canonical_uri(&self.key_for(to));

        let storage_class = self.conf.storage_class.clone().unwrap_or_default();
        let mut extra: Vec<(&str, &str)> = Vec::new();
        if self.use_storage_class() {
            extra.push(("x-amz-storage-class", storage_class.as_str()));
        }

        let response = self
            .signed_request(
                reqwest::Method::PUT,
                &canonical_uri,
                "",
                &payload_hash,
                &extra,
                Some(body),
                cancel,
            )
            .await?;
        if !response.status().is_success() {
            return Err(StorageError::S3HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }

    async fn download(
        &self,
        from: &RemotePath,
        to: &Utf8Path,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        let canonical_uri = self.canonical_uri(&self.key_for(from));
        let response = self
            .signed_request(
                reqwest::Method::GET,
                &canonical_uri,
                "",
                EMPTY_PAYLOAD_SHA256,
                &[],
                None,
                cancel,
            )
            .await?;
        if response.status().as_u16() == 404 {
            return Err(StorageError::FileMissing(from.to_string()));
        }
        if !response.status().is_success() {
            return Err(StorageError::S3HttpStatus(response.status().as_u16()));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| StorageError::Network(e.to_string()))?;
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(to, &body).await?;
        Ok(())
    }

    async fn delete(
        &self,
        path: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        let canonical_uri = self.canonical_uri(&self.key_for(path));
        let response = self
            .signed_request(
                reqwest::Method::DELETE,
                &canonical_uri,
                "",
                EMPTY_PAYLOAD_SHA256,
                &[],
                None,
                cancel,
            )
            .await?;
        if !response.status().is_success() {
            return Err(StorageError::S3HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }

    async fn link(
        &self,
        existing: &RemotePath,
        new: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        // Reuse the stored object via a server-side copy.
        let source = format!(
            "/{}/{}",
            self.conf.bucket,
            urlencoding::encode(&self.key_for(existing)).replace("%2F", "/")
        );
        let canonical_uri = self.canonical_uri(&self.key_for(new));
        let response = self
            .signed_request(
                reqwest::Method::PUT,
                &canonical_uri,
                "",
                EMPTY_PAYLOAD_SHA256,
                &[("x-amz-copy-source", source.as_str())],
                None,
                cancel,
            )
            .await?;
        if !response.status().is_success() {
            return Err(StorageError::S3HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Values of a repeated XML element. Nesting and entity decoding are not
/// needed for the conservative key alphabet backups use.
fn xml_tag_values<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut values = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        rest = &rest[start + open.len()..];
        if let Some(end) = rest.find(&close) {
            values.push(&rest[..end]);
            rest = &rest[end + close.len()..];
        } else {
            break;
        }
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conf(endpoint: Option<&str>) -> S3Config {
        S3Config {
            bucket: "bucket".to_string(),
            region: "eu-central-1".to_string(),
            endpoint: endpoint.map(str::to_string),
            prefix_in_bucket: Some("vault".to_string()),
            access_key_id: "key".to_string(),
            secret_access_key: "secret".to_string(),
            storage_class: None,
            port: None,
            use_tls: true,
            concurrency_limit: default_concurrency_limit(),
        }
    }

    #[test]
    fn endpoint_selects_path_style() {
        let vhost = S3Bucket::new(test_conf(None)).unwrap();
        assert_eq!(vhost.host(), "bucket.s3.eu-central-1.amazonaws.com");
        let path = RemotePath::from_string("srv/backup/x").unwrap();
        assert_eq!(vhost.canonical_uri(&vhost.key_for(&path)), "/vault/srv/backup/x");

        let custom = S3Bucket::new(test_conf(Some("minio.local"))).unwrap();
        assert_eq!(custom.host(), "minio.local");
        assert_eq!(
            custom.canonical_uri(&custom.key_for(&path)),
            "/bucket/vault/srv/backup/x"
        );
    }

    #[test]
    fn list_response_xml_scan() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult><IsTruncated>true</IsTruncated>
<Contents><Key>vault/srv/wal/000000010000000000000001</Key></Contents>
<Contents><Key>vault/srv/wal/000000010000000000000002</Key></Contents>
<NextContinuationToken>abc+def==</NextContinuationToken></ListBucketResult>"#;
        assert_eq!(
            xml_tag_values(xml, "Key"),
            vec![
                "vault/srv/wal/000000010000000000000001",
                "vault/srv/wal/000000010000000000000002"
            ]
        );
        assert_eq!(xml_tag_values(xml, "IsTruncated"), vec!["true"]);
        assert_eq!(xml_tag_values(xml, "NextContinuationToken"), vec!["abc+def=="]);
    }
}
