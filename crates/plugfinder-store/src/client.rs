//! HTTP client for the PlugFinder record store.
//!
//! The store exposes a CloudKit-style protocol: `POST records/query` with
//! continuation markers, `POST records/lookup` for batched fetches by record
//! name, and `POST records/modify` for atomic write batches guarded by
//! per-record change tags. Lookups and deletions that exceed the store's
//! request size limit are split in half and retried until they fit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use chargev_sync_core::stores::{CheckInPage, TargetStore};
use chargev_sync_core::{
    ChargePointRecord, ChargepointRef, CheckInRecord, EventSource, Result, StoredCheckIn,
    SyncError, UserRecord,
};

use crate::wire::{
    charge_point_from_wire, charge_point_record, check_in_record, stored_check_in, user_record,
    WireRecord, CHECK_IN_TYPE, USER_TYPE,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest {
    query: Query,
    #[serde(skip_serializing_if = "Option::is_none")]
    continuation_marker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    results_limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Query {
    record_type: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    filter_by: Vec<Filter>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    sort_by: Vec<Sort>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Filter {
    field_name: &'static str,
    comparator: &'static str,
    field_value: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Sort {
    field_name: &'static str,
    ascending: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    records: Vec<WireRecord>,
    #[serde(default)]
    continuation_marker: Option<String>,
    #[serde(default)]
    more_coming: bool,
}

#[derive(Debug, Serialize)]
struct LookupRequest {
    records: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    records: Vec<WireRecord>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyRequest {
    operations: Vec<Operation>,
    atomic: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Operation {
    operation_type: &'static str,
    record: WireRecord,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallerResponse {
    user_record_name: String,
}

/// Client for the PlugFinder record store.
pub struct PlugFinderClient {
    http: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

impl PlugFinderClient {
    pub fn new(base_url: impl Into<String>, api_token: Option<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(SyncError::configuration("PlugFinder store URL is empty"));
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            api_token,
        })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let mut request = self.http.post(format!("{}/{path}", self.base_url));
        if let Some(token) = &self.api_token {
            request = request.header("x-api-token", token);
        }
        request
    }

    /// Verify credentials and return the caller's user record name.
    pub async fn sign_in(&self) -> Result<String> {
        let mut request = self.http.get(format!("{}/users/caller", self.base_url));
        if let Some(token) = &self.api_token {
            request = request.header("x-api-token", token);
        }
        let response = request.send().await.map_err(request_error)?;
        let caller: CallerResponse = Self::parse_response(response).await?;
        Ok(caller.user_record_name)
    }

    async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Auth(if body.is_empty() {
                format!("record store rejected the API token ({status})")
            } else {
                body
            }));
        }
        if status == StatusCode::CONFLICT {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::WriteConflict(body));
        }
        if status == StatusCode::PAYLOAD_TOO_LARGE {
            return Err(SyncError::RequestTooLarge);
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

    async fn query(&self, request: QueryRequest) -> Result<QueryResponse> {
        let response = self
            .post("records/query")
            .json(&request)
            .send()
            .await
            .map_err(request_error)?;
        Self::parse_response(response).await
    }

    async fn modify(&self, operations: Vec<Operation>) -> Result<Vec<WireRecord>> {
        let response = self
            .post("records/modify")
            .json(&ModifyRequest {
                operations,
                atomic: true,
            })
            .send()
            .await
            .map_err(request_error)?;
        let body: LookupResponse = Self::parse_response(response).await?;
        Ok(body.records)
    }

    async fn lookup_chunk(&self, record_names: &[String]) -> Result<Vec<WireRecord>> {
        let request = LookupRequest {
            records: record_names
                .iter()
                .map(|name| json!({ "recordName": name }))
                .collect(),
        };
        let response = self
            .post("records/lookup")
            .json(&request)
            .send()
            .await
            .map_err(request_error)?;
        let body: LookupResponse = Self::parse_response(response).await?;
        // per-record misses come back as error stubs
        Ok(body
            .records
            .into_iter()
            .filter(|record| record.server_error_code.is_none())
            .collect())
    }

    /// Batched lookup by record name. Requests the store rejects as too
    /// large are bisected, preserving the input order.
    async fn lookup(&self, record_names: &[String]) -> Result<Vec<WireRecord>> {
        let mut pending = vec![record_names.to_vec()];
        let mut records = Vec::new();
        while let Some(chunk) = pending.pop() {
            if chunk.is_empty() {
                continue;
            }
            match self.lookup_chunk(&chunk).await {
                Ok(mut found) => records.append(&mut found),
                Err(SyncError::RequestTooLarge) if chunk.len() > 1 => {
                    debug!("lookup of {} records too large, bisecting", chunk.len());
                    let (first, second) = chunk.split_at(chunk.len() / 2);
                    pending.push(second.to_vec());
                    pending.push(first.to_vec());
                }
                Err(err) => return Err(err),
            }
        }
        Ok(records)
    }

    /// Batched deletion by record name, bisecting like [`Self::lookup`].
    async fn delete_records(&self, record_type: &'static str, names: Vec<String>) -> Result<u64> {
        let mut pending = vec![names];
        let mut deleted = 0;
        while let Some(chunk) = pending.pop() {
            if chunk.is_empty() {
                continue;
            }
            let operations = chunk
                .iter()
                .map(|name| Operation {
                    operation_type: "delete",
                    record: WireRecord::new(name, record_type),
                })
                .collect();
            match self.modify(operations).await {
                Ok(_) => deleted += chunk.len() as u64,
                Err(SyncError::RequestTooLarge) if chunk.len() > 1 => {
                    debug!("deletion of {} records too large, bisecting", chunk.len());
                    let (first, second) = chunk.split_at(chunk.len() / 2);
                    pending.push(second.to_vec());
                    pending.push(first.to_vec());
                }
                Err(err) => return Err(err),
            }
        }
        Ok(deleted)
    }

    fn source_filter(foreign_sources: &[EventSource]) -> Filter {
        let codes: Vec<u8> = foreign_sources.iter().copied().map(u8::from).collect();
        Filter {
            field_name: "source",
            comparator: "IN",
            field_value: json!({ "value": codes }),
        }
    }
}

fn request_error(err: reqwest::Error) -> SyncError {
    SyncError::store(err.status().map(|status| status.as_u16()), err.to_string())
}

#[async_trait]
impl TargetStore for PlugFinderClient {
    async fn last_check_in(&self, chargepoint: &ChargepointRef) -> Result<Option<StoredCheckIn>> {
        let response = self
            .query(QueryRequest {
                query: Query {
                    record_type: CHECK_IN_TYPE,
                    filter_by: vec![Filter {
                        field_name: "chargepoint",
                        comparator: "EQUALS",
                        field_value: json!({ "value": { "recordName": chargepoint.record_name() } }),
                    }],
                    sort_by: vec![Sort {
                        field_name: "timestamp",
                        ascending: false,
                    }],
                },
                continuation_marker: None,
                results_limit: Some(1),
            })
            .await?;
        response
            .records
            .first()
            .map(stored_check_in)
            .transpose()
    }

    async fn charge_point(
        &self,
        chargepoint: &ChargepointRef,
    ) -> Result<Option<ChargePointRecord>> {
        let records = self.lookup(&[chargepoint.record_name()]).await?;
        records.first().map(charge_point_from_wire).transpose()
    }

    async fn latest_synced_timestamp(
        &self,
        foreign_sources: &[EventSource],
    ) -> Result<Option<DateTime<Utc>>> {
        let response = self
            .query(QueryRequest {
                query: Query {
                    record_type: CHECK_IN_TYPE,
                    filter_by: vec![Self::source_filter(foreign_sources)],
                    sort_by: vec![Sort {
                        field_name: "timestamp",
                        ascending: false,
                    }],
                },
                continuation_marker: None,
                results_limit: Some(1),
            })
            .await?;
        Ok(response
            .records
            .first()
            .and_then(|record| record.timestamp_value("timestamp")))
    }

    async fn save_check_in(
        &self,
        check_in: CheckInRecord,
        charge_point: ChargePointRecord,
    ) -> Result<()> {
        let operations = vec![
            Operation {
                operation_type: "create",
                record: check_in_record(&check_in),
            },
            Operation {
                operation_type: "forceUpdate",
                record: charge_point_record(&charge_point),
            },
        ];
        self.modify(operations).await?;
        Ok(())
    }

    async fn purge_synced_check_ins(&self, foreign_sources: &[EventSource]) -> Result<u64> {
        let mut names = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let response = self
                .query(QueryRequest {
                    query: Query {
                        record_type: CHECK_IN_TYPE,
                        filter_by: vec![Self::source_filter(foreign_sources)],
                        sort_by: Vec::new(),
                    },
                    continuation_marker: continuation.take(),
                    results_limit: None,
                })
                .await?;
            names.extend(response.records.into_iter().map(|record| record.record_name));
            if !response.more_coming {
                break;
            }
            match response.continuation_marker {
                Some(marker) => continuation = Some(marker),
                None => break,
            }
        }
        self.delete_records(CHECK_IN_TYPE, names).await
    }

    async fn check_ins_page(
        &self,
        since: Option<DateTime<Utc>>,
        continuation: Option<&str>,
        limit: Option<usize>,
    ) -> Result<CheckInPage> {
        let filter_by = since
            .map(|threshold| {
                vec![Filter {
                    field_name: "modified",
                    comparator: "GREATER_THAN",
                    field_value: json!({ "value": threshold.timestamp_millis() }),
                }]
            })
            .unwrap_or_default();
        let response = self
            .query(QueryRequest {
                query: Query {
                    record_type: CHECK_IN_TYPE,
                    filter_by,
                    sort_by: vec![Sort {
                        field_name: "modified",
                        ascending: true,
                    }],
                },
                continuation_marker: continuation.map(str::to_string),
                results_limit: limit,
            })
            .await?;
        let records = response
            .records
            .iter()
            .map(stored_check_in)
            .collect::<Result<Vec<_>>>()?;
        Ok(CheckInPage {
            records,
            more_coming: response.more_coming,
            continuation: response.continuation_marker,
        })
    }

    async fn users_by_identity(&self, identities: &[String]) -> Result<Vec<UserRecord>> {
        let records = self.lookup(identities).await?;
        Ok(records
            .iter()
            .filter(|record| record.record_type == USER_TYPE)
            .map(user_record)
            .collect())
    }
}
