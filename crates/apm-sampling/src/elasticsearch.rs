//! Minimal Elasticsearch client for the sampled-traces datastream.
//!
//! Only the two operations the sampler needs: `_bulk` for publishing
//! decisions (gzip-compressed NDJSON) and `_search` for the subscriber's
//! long poll. Retries are owned by the callers; this client performs one
//! attempt per call.

use std::io::Write;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE};

use crate::error::EsError;

/// Connection settings for the sampler's Elasticsearch output.
#[derive(Debug, Clone)]
pub struct ElasticsearchConfig {
    pub base_url: String,
    /// Base64 `id:api_key` pair sent as an `ApiKey` authorization header.
    pub api_key: Option<String>,
    pub timeout: Duration,
    /// Gzip level for published decision payloads (0-9).
    pub compression_level: u32,
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        ElasticsearchConfig {
            base_url: "http://localhost:9200".to_owned(),
            api_key: None,
            timeout: Duration::from_secs(10),
            compression_level: 5,
        }
    }
}

/// A thin HTTP client bound to one Elasticsearch cluster.
pub struct ElasticsearchClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    compression: Compression,
}

impl ElasticsearchClient {
    pub fn new(config: &ElasticsearchConfig) -> Result<Self, EsError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(ElasticsearchClient {
            http,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            api_key: config.api_key.clone(),
            compression: Compression::new(config.compression_level.min(9)),
        })
    }

    fn gzip(&self, body: &[u8]) -> Result<Vec<u8>, EsError> {
        let mut encoder = GzEncoder::new(Vec::new(), self.compression);
        encoder.write_all(body).map_err(EsError::Compress)?;
        encoder.finish().map_err(EsError::Compress)
    }

    /// Sends an NDJSON `_bulk` request against the given index. Item-level
    /// failures (e.g. version conflicts for decisions another observer has
    /// already published) are not errors; only transport and HTTP-level
    /// failures are surfaced.
    pub async fn bulk(&self, index: &str, ndjson: &[u8]) -> Result<(), EsError> {
        let compressed = self.gzip(ndjson)?;
        let mut request = self
            .http
            .post(format!("{}/{}/_bulk", self.base_url, index))
            .header(CONTENT_TYPE, "application/x-ndjson")
            .header(CONTENT_ENCODING, "gzip")
            .body(compressed);
        if let Some(api_key) = &self.api_key {
            request = request.header(AUTHORIZATION, format!("ApiKey {api_key}"));
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(EsError::Status(response.status()));
        }
        Ok(())
    }

    /// Runs a `_search` against the given index and returns the raw
    /// response document.
    pub async fn search(
        &self,
        index: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, EsError> {
        let mut request = self
            .http
            .post(format!("{}/{}/_search", self.base_url, index))
            .json(body);
        if let Some(api_key) = &self.api_key {
            request = request.header(AUTHORIZATION, format!("ApiKey {api_key}"));
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(EsError::Status(response.status()));
        }
        Ok(response.json().await?)
    }
}
