//! Bearer-authenticated REST client for the chargEV DB event log.
//!
//! Implements [`SourceStore`] over the event log's delta protocol:
//! `GET /events` pages through the delta scoped by a change token,
//! `POST /events` saves and deletes uploaded check-ins in one call, and
//! `DELETE /events` purges everything this connector ever wrote.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use chargev_sync_core::stores::{EventBatch, PostOutcome, SourceStore, UpstreamCheckIn};
use chargev_sync_core::{parse_event, ChargeEvent, EventSource, ReasonCode, Result, SyncError};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsResponse {
    events: Vec<serde_json::Value>,
    #[serde(default)]
    more_coming: bool,
    #[serde(default)]
    next_start_token: Option<u64>,
}

#[derive(Debug, Serialize)]
struct PostEventsRequest {
    save: Vec<CheckInEvent>,
    delete: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PostEventsResponse {
    #[serde(default)]
    saved: usize,
    #[serde(default)]
    deleted: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteResponse {
    #[serde(default)]
    deleted_count: u64,
}

/// Wire shape of a check-in event posted back into the event log.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckInEvent {
    #[serde(rename = "__t")]
    tag: &'static str,
    record_name: String,
    chargepoint: String,
    reason: ReasonCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    plug: Option<String>,
    timestamp: DateTime<Utc>,
    upstream_updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nickname: Option<String>,
    #[serde(rename = "userID", skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
    source: EventSource,
}

impl From<UpstreamCheckIn> for CheckInEvent {
    fn from(check_in: UpstreamCheckIn) -> Self {
        Self {
            tag: "CKCheckIn",
            record_name: check_in.record_name,
            chargepoint: check_in.chargepoint,
            reason: check_in.reason,
            comment: check_in.comment,
            plug: check_in.plug,
            timestamp: check_in.timestamp,
            upstream_updated_at: check_in.modified,
            nickname: check_in.nickname,
            user_id: check_in.user_record,
            source: EventSource::PlugFinder,
        }
    }
}

/// HTTP client for the chargEV DB API.
pub struct ChargevDbClient {
    http: reqwest::Client,
    base_url: String,
    jwt: String,
}

impl ChargevDbClient {
    pub fn new(base_url: impl Into<String>, jwt: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let jwt = jwt.into();
        if base_url.is_empty() {
            return Err(SyncError::configuration("chargEV DB API URL is empty"));
        }
        if jwt.is_empty() {
            return Err(SyncError::configuration("chargEV DB API JWT is empty"));
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            jwt,
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}/{path}", self.base_url))
            .bearer_auth(&self.jwt)
    }

    /// Deserialize a response body, surfacing API error bodies instead of a
    /// bare status code.
    async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Auth(if body.is_empty() {
                format!("chargEV DB rejected the JWT ({status})")
            } else {
                body
            }));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::store(
                status.as_u16(),
                if body.is_empty() {
                    status.to_string()
                } else {
                    body
                },
            ));
        }
        response.json::<T>().await.map_err(request_error)
    }
}

fn request_error(err: reqwest::Error) -> SyncError {
    SyncError::store(err.status().map(|status| status.as_u16()), err.to_string())
}

#[async_trait]
impl SourceStore for ChargevDbClient {
    async fn list_events(
        &self,
        change_token: Option<&str>,
        start_token: Option<u64>,
    ) -> Result<EventBatch> {
        let mut request = self.request(Method::GET, "events");
        if let Some(token) = change_token {
            request = request.query(&[("change-token", token)]);
        }
        if let Some(token) = start_token {
            request = request.query(&[("start-token", token.to_string())]);
        }
        let response = request.send().await.map_err(request_error)?;
        let body: EventsResponse = Self::parse_response(response).await?;
        debug!(
            "fetched {} event(s), more coming: {}",
            body.events.len(),
            body.more_coming
        );
        Ok(EventBatch {
            events: body.events,
            more_coming: body.more_coming,
            next_start_token: body.next_start_token,
        })
    }

    async fn latest_event(&self) -> Result<Option<ChargeEvent>> {
        let response = self
            .request(Method::GET, "events/latest")
            .send()
            .await
            .map_err(request_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let payload: Option<serde_json::Value> = Self::parse_response(response).await?;
        match payload {
            Some(value) if !value.is_null() => Ok(Some(parse_event(&value)?)),
            _ => Ok(None),
        }
    }

    async fn post_events(
        &self,
        to_save: Vec<UpstreamCheckIn>,
        to_delete: Vec<String>,
    ) -> Result<PostOutcome> {
        let body = PostEventsRequest {
            save: to_save.into_iter().map(CheckInEvent::from).collect(),
            delete: to_delete,
        };
        let response = self
            .request(Method::POST, "events")
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;
        let outcome: PostEventsResponse = Self::parse_response(response).await?;
        Ok(PostOutcome {
            saved: outcome.saved,
            deleted: outcome.deleted,
        })
    }

    async fn delete_all(&self) -> Result<u64> {
        let response = self
            .request(Method::DELETE, "events")
            .send()
            .await
            .map_err(request_error)?;
        let body: DeleteResponse = Self::parse_response(response).await?;
        Ok(body.deleted_count)
    }
}
