/// Transport: the outbound seam to the row store.
///
/// A `Transport` sends exactly one `CallKind` and hands back the raw status
/// and body. It never retries and never interprets failures; classification
/// belongs to the retry controller, which must look at bodies as well as
/// status codes.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::StoreSettings;
use crate::descriptor::{CallKind, DimensionRequest, Row};
use crate::error::{Result, RowGateError};

/// Raw store reply. A 200 can still carry a quota error in its body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreResponse {
    pub status: u16,
    pub body: Bytes,
}

impl StoreResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn ok_json(value: &Value) -> Self {
        Self::new(200, value.to_string())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        if self.body.is_empty() {
            return Ok(serde_json::from_str("{}")?);
        }
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Failures where no HTTP response was obtained.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The request never left; resending cannot duplicate it.
    #[error("connection failed: {0}")]
    Connect(String),
    /// The request may or may not have reached the store.
    #[error("request failed in flight: {0}")]
    Io(String),
    #[error("attempt timed out")]
    TimedOut,
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::TimedOut
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Io(err.to_string())
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, call: &CallKind) -> std::result::Result<StoreResponse, TransportError>;
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

fn cell_to_string(cell: Value) -> String {
    match cell {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Rows out of a `values.get` reply. An empty range has no `values` key.
pub fn parse_values(response: &StoreResponse) -> Result<Vec<Row>> {
    let range: ValueRange = response.json()?;
    Ok(range
        .values
        .into_iter()
        .map(|row| row.into_iter().map(cell_to_string).collect())
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetInfo {
    pub sheet_id: u64,
    pub title: String,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Debug, Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    sheet_id: u64,
    title: String,
}

pub fn parse_sheets(response: &StoreResponse) -> Result<Vec<SheetInfo>> {
    let meta: SpreadsheetMeta = response.json()?;
    Ok(meta
        .sheets
        .into_iter()
        .map(|s| SheetInfo {
            sheet_id: s.properties.sheet_id,
            title: s.properties.title,
        })
        .collect())
}

/// JSON body of a `batchUpdate` call.
pub fn batch_update_body(requests: &[DimensionRequest]) -> Value {
    let requests: Vec<Value> = requests
        .iter()
        .map(|request| match request {
            DimensionRequest::DeleteRows {
                sheet_id,
                start_index,
                end_index,
            } => json!({
                "deleteDimension": {
                    "range": {
                        "sheetId": sheet_id,
                        "dimension": "ROWS",
                        "startIndex": start_index,
                        "endIndex": end_index,
                    }
                }
            }),
            DimensionRequest::InsertRows {
                sheet_id,
                start_index,
                end_index,
            } => json!({
                "insertDimension": {
                    "range": {
                        "sheetId": sheet_id,
                        "dimension": "ROWS",
                        "startIndex": start_index,
                        "endIndex": end_index,
                    },
                    "inheritFromBefore": false,
                }
            }),
        })
        .collect();
    json!({ "requests": requests })
}

/// Talks to a Sheets-style v4 REST API.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Url,
    spreadsheet_id: String,
    access_token: Option<String>,
}

impl HttpTransport {
    pub fn new(settings: &StoreSettings) -> Result<Self> {
        if settings.spreadsheet_id.is_empty() {
            return Err(RowGateError::Config("spreadsheet_id is required".into()));
        }
        let base_url = Url::parse(&settings.base_url)
            .map_err(|e| RowGateError::Config(format!("bad base_url {}: {}", settings.base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(RowGateError::Config(format!(
                "base_url {} cannot carry a path",
                settings.base_url
            )));
        }

        info!(
            "Initializing HttpTransport: base={}, spreadsheet={}",
            base_url, settings.spreadsheet_id
        );

        Ok(Self {
            client: reqwest::Client::builder().build()?,
            base_url,
            spreadsheet_id: settings.spreadsheet_id.clone(),
            access_token: settings.access_token.clone(),
        })
    }

    /// `{base}/v4/spreadsheets/{id}/{segments...}`, each segment percent-encoded.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty()
                .extend(["v4", "spreadsheets"])
                .extend(segments);
        }
        url
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.access_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, call: &CallKind) -> std::result::Result<StoreResponse, TransportError> {
        use reqwest::Method;

        let id = self.spreadsheet_id.as_str();
        let builder = match call {
            CallKind::GetValues { range } => {
                self.request(Method::GET, self.url(&[id, "values", range.as_str()]))
            }
            CallKind::UpdateValues { range, values } => self
                .request(Method::PUT, self.url(&[id, "values", range.as_str()]))
                .query(&[("valueInputOption", "RAW")])
                .json(&json!({ "range": range, "majorDimension": "ROWS", "values": values })),
            CallKind::AppendValues { range, values } => {
                let segment = format!("{}:append", range);
                self.request(Method::POST, self.url(&[id, "values", segment.as_str()]))
                    .query(&[
                        ("valueInputOption", "RAW"),
                        ("insertDataOption", "INSERT_ROWS"),
                    ])
                    .json(&json!({ "majorDimension": "ROWS", "values": values }))
            }
            CallKind::BatchUpdate { requests } => {
                let segment = format!("{}:batchUpdate", id);
                self.request(Method::POST, self.url(&[segment.as_str()]))
                    .json(&batch_update_body(requests))
            }
            CallKind::SheetMetadata => self
                .request(Method::GET, self.url(&[id]))
                .query(&[("fields", "sheets.properties(sheetId,title)")]),
        };

        debug!("HTTP {} -> {}", call.name(), id);
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        Ok(StoreResponse { status, body })
    }
}
