//! APL query options and results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Header carrying the id of the saved query
pub const QUERY_ID_HEADER: &str = "x-axiom-history-query-id";

/// The result format of an APL query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AplResultFormat {
    #[default]
    Legacy,
    Tabular,
}

impl AplResultFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            AplResultFormat::Legacy => "legacy",
            AplResultFormat::Tabular => "tabular",
        }
    }
}

/// Optional parameters for an APL query.
#[derive(Clone, Debug, Default)]
pub struct AplOptions {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub format: AplResultFormat,
    /// Cursor returned with a previous partial result
    pub cursor: Option<String>,
    pub include_cursor: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AplRequest<'a> {
    pub apl: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<&'a str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub include_cursor: bool,
}

impl<'a> AplRequest<'a> {
    pub fn new(apl: &'a str, opts: Option<&'a AplOptions>) -> Self {
        let fmt = |ts: &DateTime<Utc>| crate::record::format_timestamp(ts);
        Self {
            apl,
            start_time: opts.and_then(|o| o.start_time.as_ref()).map(fmt),
            end_time: opts.and_then(|o| o.end_time.as_ref()).map(fmt),
            cursor: opts.and_then(|o| o.cursor.as_deref()),
            include_cursor: opts.is_some_and(|o| o.include_cursor),
        }
    }
}

/// Result of an APL query.
///
/// The shape of matches and tables depends on the query and the requested
/// format, so they are kept as raw JSON.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryResult {
    pub status: Value,
    pub matches: Vec<Value>,
    pub buckets: Value,
    pub tables: Vec<Value>,
    pub dataset_names: Vec<String>,
    #[serde(skip)]
    pub saved_query_id: Option<String>,
}
