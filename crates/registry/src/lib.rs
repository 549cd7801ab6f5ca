//! GoingElectric chargepoint registry client.
//!
//! Fetches live chargepoint metadata by `ge_id`. The API has two quirks this
//! client absorbs: requests must be spaced out (the key is rate limited), and
//! absent values are delivered as the JSON literal `false` rather than being
//! omitted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::debug;
use md5::{Digest, Md5};
use serde::Deserialize;
use tokio::sync::Mutex;

use chargev_sync_core::metadata::{ChargePointMetadata, Coordinates, FaultReport};
use chargev_sync_core::stores::MetadataRegistry;
use chargev_sync_core::{Result, SyncError};

pub const DEFAULT_API_URL: &str = "https://api.goingelectric.de/chargepoints/";

/// Minimum spacing between two API requests.
const REQUEST_SPACING: Duration = Duration::from_millis(150);

/// `false` stands in for an absent value in GoingElectric payloads.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FalseOr<T> {
    Value(T),
    Absent(bool),
}

impl<T> FalseOr<T> {
    fn into_option(self) -> Option<T> {
        match self {
            Self::Value(value) => Some(value),
            Self::Absent(_) => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChargepointsResponse {
    status: String,
    #[serde(default)]
    chargelocations: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireOperator {
    name: String,
}

#[derive(Debug, Deserialize)]
struct WireFaultReport {
    created: i64,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChargeLocation {
    ge_id: u64,
    name: String,
    coordinates: Coordinates,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    network: Option<FalseOr<String>>,
    #[serde(default)]
    operator: Option<FalseOr<WireOperator>>,
    #[serde(default)]
    fault_report: Option<FalseOr<WireFaultReport>>,
}

fn metadata_from_location(raw: &serde_json::Value) -> Result<ChargePointMetadata> {
    let fingerprint = format!("{:x}", Md5::digest(raw.to_string().as_bytes()));
    let location: ChargeLocation = serde_json::from_value(raw.clone())
        .map_err(|err| SyncError::metadata(format!("malformed chargelocation: {err}")))?;
    Ok(ChargePointMetadata {
        external_id: location.ge_id,
        name: location.name,
        coordinates: location.coordinates,
        url: location.url.unwrap_or_default(),
        operator: location
            .operator
            .and_then(FalseOr::into_option)
            .map(|operator| operator.name),
        network: location.network.and_then(FalseOr::into_option),
        fault_report: location
            .fault_report
            .and_then(FalseOr::into_option)
            .map(|report| FaultReport {
                created: report.created,
                description: report.description,
            }),
        fingerprint,
    })
}

/// Throttled client for the GoingElectric chargepoints API.
pub struct GoingElectricFetcher {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    requests: AtomicU64,
    last_request: Mutex<Option<Instant>>,
}

impl GoingElectricFetcher {
    pub fn new(api_key: impl Into<String>, base_url: Option<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(SyncError::configuration("GoingElectric API key is empty"));
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            api_key,
            requests: AtomicU64::new(0),
            last_request: Mutex::new(None),
        })
    }

    /// Total number of API requests issued so far.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    async fn throttle(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(instant) = *last {
            let elapsed = instant.elapsed();
            if elapsed < REQUEST_SPACING {
                tokio::time::sleep(REQUEST_SPACING - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[async_trait]
impl MetadataRegistry for GoingElectricFetcher {
    async fn fetch_metadata(&self, ids: &[u64]) -> Result<Vec<ChargePointMetadata>> {
        self.throttle().await;
        self.requests.fetch_add(1, Ordering::Relaxed);

        let ge_id = ids
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(",");
        debug!("fetching registry metadata for ge_id {ge_id}");

        let response = self
            .http
            .post(&self.base_url)
            .form(&[("key", self.api_key.as_str()), ("ge_id", &ge_id)])
            .send()
            .await
            .map_err(|err| SyncError::metadata(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::metadata(format!(
                "registry returned {status}"
            )));
        }
        let body: ChargepointsResponse = response
            .json()
            .await
            .map_err(|err| SyncError::metadata(err.to_string()))?;
        if body.status != "ok" {
            return Err(SyncError::metadata(format!(
                "registry reported status {:?}",
                body.status
            )));
        }

        body.chargelocations
            .iter()
            .map(metadata_from_location)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn location(ge_id: u64) -> serde_json::Value {
        json!({
            "ge_id": ge_id,
            "name": "Rastplatz S&uuml;d",
            "coordinates": { "lat": 48.1, "lng": 9.2 },
            "url": "//www.goingelectric.de/stromtankstellen/x/",
            "network": false,
            "operator": { "name": "EnBW" },
            "fault_report": { "created": 1755680400, "description": "defekt" }
        })
    }

    #[test]
    fn false_stands_for_an_absent_value() {
        let metadata = metadata_from_location(&location(42)).unwrap();
        assert_eq!(metadata.network, None);
        assert_eq!(metadata.operator.as_deref(), Some("EnBW"));
        let report = metadata.fault_report.unwrap();
        assert_eq!(report.created, 1755680400);
        assert_eq!(report.description, "defekt");
    }

    #[test]
    fn fingerprint_tracks_payload_content() {
        let a = metadata_from_location(&location(42)).unwrap();
        let same = metadata_from_location(&location(42)).unwrap();
        let other = metadata_from_location(&location(43)).unwrap();
        assert_eq!(a.fingerprint, same.fingerprint);
        assert_ne!(a.fingerprint, other.fingerprint);
        assert_eq!(a.fingerprint.len(), 32);
    }

    #[test]
    fn scheme_relative_urls_pass_through_untouched() {
        let metadata = metadata_from_location(&location(42)).unwrap();
        assert!(metadata.url.starts_with("//"));
    }

    async fn registry_server(bodies: Vec<&'static str>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for body in bodies {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 4096];
                let mut request = Vec::new();
                loop {
                    let n = stream.read(&mut buf).await.unwrap();
                    request.extend_from_slice(&buf[..n]);
                    let text = String::from_utf8_lossy(&request);
                    if let Some(header_end) = text.find("\r\n\r\n") {
                        let content_length = text.lines().find_map(|line| {
                            line.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|value| value.trim().parse::<usize>().unwrap())
                        });
                        if request.len() - (header_end + 4) >= content_length.unwrap_or(0) {
                            break;
                        }
                    }
                    if n == 0 {
                        break;
                    }
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                stream.write_all(response.as_bytes()).await.unwrap();
                stream.shutdown().await.ok();
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn error_status_in_the_body_fails_the_lookup() {
        let base = registry_server(vec![r#"{"status":"error","code":"key invalid"}"#]).await;
        let fetcher = GoingElectricFetcher::new("key", Some(base)).unwrap();
        let err = fetcher.fetch_metadata(&[42]).await.unwrap_err();
        assert!(matches!(err, SyncError::MetadataLookup(_)));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn consecutive_requests_are_spaced_out() {
        let body = r#"{"status":"ok","chargelocations":[]}"#;
        let base = registry_server(vec![body, body]).await;
        let fetcher = GoingElectricFetcher::new("key", Some(base)).unwrap();

        let started = Instant::now();
        fetcher.fetch_metadata(&[1]).await.unwrap();
        fetcher.fetch_metadata(&[2]).await.unwrap();
        assert!(started.elapsed() >= REQUEST_SPACING);
        assert_eq!(fetcher.request_count(), 2);
    }

    #[test]
    fn an_empty_api_key_is_a_configuration_error() {
        assert!(matches!(
            GoingElectricFetcher::new("", None),
            Err(SyncError::Configuration(_))
        ));
    }
}
