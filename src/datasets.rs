//! Dataset models and request builders shared by both clients

use crate::errors::Result;
use crate::transport::ApiRequest;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Dataset {
    pub id: String,
    pub name: String,
    pub description: String,
    pub who: String,
    pub created: String,
}

#[derive(Debug, Serialize)]
struct DatasetCreateRequest<'a> {
    name: &'a str,
    description: &'a str,
}

#[derive(Debug, Serialize)]
struct DatasetUpdateRequest<'a> {
    description: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TrimRequest {
    max_duration: String,
}

pub(crate) fn get(id: &str) -> ApiRequest {
    ApiRequest::get(format!("/v1/datasets/{}", id))
}

pub(crate) fn list() -> ApiRequest {
    ApiRequest::get("/v1/datasets")
}

pub(crate) fn create(name: &str, description: &str) -> Result<ApiRequest> {
    ApiRequest::post("/v1/datasets").with_json(&DatasetCreateRequest { name, description })
}

pub(crate) fn update(id: &str, description: &str) -> Result<ApiRequest> {
    ApiRequest::put(format!("/v1/datasets/{}", id)).with_json(&DatasetUpdateRequest { description })
}

pub(crate) fn delete(id: &str) -> ApiRequest {
    ApiRequest::delete(format!("/v1/datasets/{}", id))
}

/// Trim removes events older than `max_duration` from the dataset.
pub(crate) fn trim(id: &str, max_duration: Duration) -> Result<ApiRequest> {
    let max_duration = format!("{}s", max_duration.as_secs());
    ApiRequest::post(format!("/v1/datasets/{}/trim", id)).with_json(&TrimRequest { max_duration })
}
