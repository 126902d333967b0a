//! Google Sheets v4 REST sink, authenticated as a service account.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{Client, Response, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    Cell, CellRef, CellStyle, Color, FormatRule, FormattingPlan, GridRange, Sink, SinkError,
    SurfaceHandle,
};

const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const TOKEN_LIFETIME_SECS: i64 = 3600;
const TOKEN_REFRESH_MARGIN_SECS: i64 = 300;

#[derive(Debug, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
struct AccessToken {
    value: String,
    expires_at: i64,
}

impl AccessToken {
    fn is_fresh(&self, now: i64) -> bool {
        now + TOKEN_REFRESH_MARGIN_SECS < self.expires_at
    }
}

/// Holds the current access token. Concurrent callers wait on one refresh
/// instead of each exchanging a new assertion.
#[derive(Debug, Default)]
struct TokenCache {
    current: Mutex<Option<AccessToken>>,
}

impl TokenCache {
    fn new(token: AccessToken) -> Self {
        Self {
            current: Mutex::new(Some(token)),
        }
    }

    async fn get_or_refresh<F, Fut>(&self, now: i64, refresh: F) -> Result<String, SinkError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AccessToken, SinkError>>,
    {
        let mut current = self.current.lock().await;
        if let Some(token) = current.as_ref().filter(|token| token.is_fresh(now)) {
            return Ok(token.value.clone());
        }
        let token = refresh().await?;
        debug!(expires_at = token.expires_at, "refreshed sheets access token");
        let value = token.value.clone();
        *current = Some(token);
        Ok(value)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    sheet_id: i64,
    title: String,
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

/// Tokens are refreshed shortly before they expire, so one sink can serve
/// long runs and every tick of a schedule.
pub struct SheetsSink {
    client: Client,
    key: ServiceAccountKey,
    tokens: TokenCache,
    base_url: String,
}

impl SheetsSink {
    pub async fn connect(credentials: &Path) -> Result<Self, SinkError> {
        let raw = tokio::fs::read_to_string(credentials).await?;
        let key: ServiceAccountKey = serde_json::from_str(&raw)
            .map_err(|e| SinkError::Auth(format!("invalid service account key: {e}")))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        let token = fetch_access_token(&client, &key).await?;
        debug!(account = %key.client_email, "authenticated against sheets api");

        Ok(Self {
            client,
            key,
            tokens: TokenCache::new(token),
            base_url: SHEETS_API_BASE.to_string(),
        })
    }

    async fn access_token(&self) -> Result<String, SinkError> {
        self.tokens
            .get_or_refresh(Utc::now().timestamp(), || {
                fetch_access_token(&self.client, &self.key)
            })
            .await
    }

    fn spreadsheet_url(&self, sheet_id: &str) -> Result<Url, SinkError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| SinkError::Malformed(format!("bad base url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| SinkError::Malformed("base url cannot hold a path".to_string()))?
            .push(sheet_id);
        Ok(url)
    }

    async fn sheet_properties(&self, sheet_id: &str) -> Result<Vec<SheetProperties>, SinkError> {
        let url = self.spreadsheet_url(sheet_id)?;
        let token = self.access_token().await?;
        let resp = self
            .client
            .get(url)
            .bearer_auth(&token)
            .query(&[("fields", "sheets.properties(sheetId,title)")])
            .send()
            .await?;
        let meta: SpreadsheetMeta = check(resp).await?.json().await?;
        Ok(meta.sheets.into_iter().map(|entry| entry.properties).collect())
    }

    async fn batch_update(&self, sheet_id: &str, requests: Vec<Value>) -> Result<Value, SinkError> {
        let url = format!("{}:batchUpdate", self.spreadsheet_url(sheet_id)?);
        let token = self.access_token().await?;
        let resp = self
            .client
            .post(url)
            .bearer_auth(&token)
            .json(&json!({ "requests": requests }))
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }
}

async fn fetch_access_token(
    client: &Client,
    key: &ServiceAccountKey,
) -> Result<AccessToken, SinkError> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        iss: &key.client_email,
        scope: SHEETS_SCOPE,
        aud: &key.token_uri,
        iat: now,
        exp: now + TOKEN_LIFETIME_SECS,
    };
    let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
        .map_err(|e| SinkError::Auth(format!("invalid private key: {e}")))?;
    let assertion = encode(&Header::new(Algorithm::RS256), &claims, &signing_key)
        .map_err(|e| SinkError::Auth(format!("failed to sign token request: {e}")))?;

    let resp = client
        .post(&key.token_uri)
        .form(&[
            ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
            ("assertion", assertion.as_str()),
        ])
        .send()
        .await?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(SinkError::Auth(format!("token endpoint returned {status}: {body}")));
    }
    let token: TokenResponse = resp.json().await?;
    Ok(AccessToken {
        value: token.access_token,
        expires_at: now + token.expires_in.unwrap_or(TOKEN_LIFETIME_SECS),
    })
}

async fn check(resp: Response) -> Result<Response, SinkError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    Err(SinkError::Api { status, body })
}

#[async_trait]
impl Sink for SheetsSink {
    async fn list_surfaces(&self, sheet_id: &str) -> Result<Vec<String>, SinkError> {
        Ok(self
            .sheet_properties(sheet_id)
            .await?
            .into_iter()
            .map(|props| props.title)
            .collect())
    }

    async fn delete_surface(&self, sheet_id: &str, name: &str) -> Result<(), SinkError> {
        let surface_id = self
            .sheet_properties(sheet_id)
            .await?
            .into_iter()
            .find(|props| props.title == name)
            .map(|props| props.sheet_id)
            .ok_or_else(|| SinkError::SurfaceNotFound(name.to_string()))?;

        self.batch_update(sheet_id, vec![json!({ "deleteSheet": { "sheetId": surface_id } })])
            .await?;
        Ok(())
    }

    async fn create_surface(
        &self,
        sheet_id: &str,
        name: &str,
        rows: usize,
        cols: usize,
    ) -> Result<SurfaceHandle, SinkError> {
        let reply = self
            .batch_update(
                sheet_id,
                vec![json!({
                    "addSheet": {
                        "properties": {
                            "title": name,
                            "gridProperties": { "rowCount": rows, "columnCount": cols }
                        }
                    }
                })],
            )
            .await?;

        let surface_id = reply["replies"][0]["addSheet"]["properties"]["sheetId"]
            .as_i64()
            .ok_or_else(|| SinkError::Malformed("addSheet reply without sheetId".to_string()))?;

        Ok(SurfaceHandle {
            sheet_id: sheet_id.to_string(),
            surface_id,
            name: name.to_string(),
        })
    }

    async fn write_range(
        &self,
        surface: &SurfaceHandle,
        top_left: CellRef,
        grid: &[Vec<Cell>],
    ) -> Result<(), SinkError> {
        let width = grid.iter().map(Vec::len).max().unwrap_or(0);
        if grid.is_empty() || width == 0 {
            return Ok(());
        }
        let range = a1_range(&surface.name, top_left, grid.len(), width);

        let mut url = self.spreadsheet_url(&surface.sheet_id)?;
        url.path_segments_mut()
            .map_err(|_| SinkError::Malformed("base url cannot hold a path".to_string()))?
            .push("values")
            .push(&range);

        let token = self.access_token().await?;
        let resp = self
            .client
            .put(url)
            .bearer_auth(&token)
            .query(&[("valueInputOption", "RAW")])
            .json(&json!({ "range": range, "majorDimension": "ROWS", "values": grid }))
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    async fn apply_formatting(
        &self,
        surface: &SurfaceHandle,
        plan: &FormattingPlan,
    ) -> Result<(), SinkError> {
        if plan.is_empty() {
            return Ok(());
        }
        let requests = plan
            .rules()
            .iter()
            .map(|rule| rule_request(surface.surface_id, rule))
            .collect();
        self.batch_update(&surface.sheet_id, requests).await?;
        Ok(())
    }

    async fn reorder_surfaces(
        &self,
        sheet_id: &str,
        ordered_names: &[String],
    ) -> Result<(), SinkError> {
        let existing = self.sheet_properties(sheet_id).await?;
        let requests: Vec<Value> = ordered_names
            .iter()
            .filter_map(|name| existing.iter().find(|props| &props.title == name))
            .enumerate()
            .map(|(index, props)| {
                json!({
                    "updateSheetProperties": {
                        "properties": { "sheetId": props.sheet_id, "index": index },
                        "fields": "index"
                    }
                })
            })
            .collect();

        if requests.is_empty() {
            return Ok(());
        }
        self.batch_update(sheet_id, requests).await?;
        Ok(())
    }
}

/// Zero-based column index to spreadsheet letters (0 -> A, 26 -> AA).
pub fn column_letters(col: usize) -> String {
    let mut n = col + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    letters.reverse();
    String::from_utf8_lossy(&letters).into_owned()
}

pub fn a1_range(surface: &str, top_left: CellRef, rows: usize, cols: usize) -> String {
    let quoted = surface.replace('\'', "''");
    format!(
        "'{}'!{}{}:{}{}",
        quoted,
        column_letters(top_left.col),
        top_left.row + 1,
        column_letters(top_left.col + cols - 1),
        top_left.row + rows
    )
}

fn grid_range(surface_id: i64, range: &GridRange) -> Value {
    json!({
        "sheetId": surface_id,
        "startRowIndex": range.start_row,
        "endRowIndex": range.end_row,
        "startColumnIndex": range.start_col,
        "endColumnIndex": range.end_col,
    })
}

fn color(c: &Color) -> Value {
    json!({ "red": c.red, "green": c.green, "blue": c.blue })
}

fn style_format(style: &CellStyle) -> (Value, String) {
    let mut format = serde_json::Map::new();
    let mut fields = Vec::new();

    if let Some(background) = &style.background {
        format.insert("backgroundColor".into(), color(background));
        fields.push("backgroundColor");
    }
    if style.bold || style.foreground.is_some() {
        let mut text = serde_json::Map::new();
        text.insert("bold".into(), Value::Bool(style.bold));
        if let Some(foreground) = &style.foreground {
            text.insert("foregroundColor".into(), color(foreground));
        }
        format.insert("textFormat".into(), Value::Object(text));
        fields.push("textFormat");
    }
    if style.centered {
        format.insert("horizontalAlignment".into(), json!("CENTER"));
        format.insert("verticalAlignment".into(), json!("MIDDLE"));
        fields.push("horizontalAlignment");
        fields.push("verticalAlignment");
    }

    (
        Value::Object(format),
        format!("userEnteredFormat({})", fields.join(",")),
    )
}

fn rule_request(surface_id: i64, rule: &FormatRule) -> Value {
    match rule {
        FormatRule::BasicFilter { range } => json!({
            "setBasicFilter": { "filter": { "range": grid_range(surface_id, range) } }
        }),
        FormatRule::Style { range, style } => {
            let (format, fields) = style_format(style);
            json!({
                "repeatCell": {
                    "range": grid_range(surface_id, range),
                    "cell": { "userEnteredFormat": format },
                    "fields": fields
                }
            })
        }
        FormatRule::ColumnWidth { col, pixels } => json!({
            "updateDimensionProperties": {
                "range": {
                    "sheetId": surface_id,
                    "dimension": "COLUMNS",
                    "startIndex": col,
                    "endIndex": col + 1
                },
                "properties": { "pixelSize": pixels },
                "fields": "pixelSize"
            }
        }),
        FormatRule::Banding { range, first, second } => json!({
            "addBanding": {
                "bandedRange": {
                    "range": grid_range(surface_id, range),
                    "rowProperties": {
                        "firstBandColor": color(first),
                        "secondBandColor": color(second)
                    }
                }
            }
        }),
        FormatRule::NumberFormat { range, pattern } => json!({
            "repeatCell": {
                "range": grid_range(surface_id, range),
                "cell": { "userEnteredFormat": { "numberFormat": { "type": "NUMBER", "pattern": pattern } } },
                "fields": "userEnteredFormat.numberFormat"
            }
        }),
        FormatRule::BelowThreshold { ranges, threshold, fill } => json!({
            "addConditionalFormatRule": {
                "rule": {
                    "ranges": ranges.iter().map(|r| grid_range(surface_id, r)).collect::<Vec<_>>(),
                    "booleanRule": {
                        "condition": {
                            "type": "NUMBER_LESS",
                            "values": [{ "userEnteredValue": Cell::Number(*threshold).to_string() }]
                        },
                        "format": { "backgroundColor": color(fill) }
                    }
                },
                "index": 0
            }
        }),
        FormatRule::Blank { ranges, fill } => json!({
            "addConditionalFormatRule": {
                "rule": {
                    "ranges": ranges.iter().map(|r| grid_range(surface_id, r)).collect::<Vec<_>>(),
                    "booleanRule": {
                        "condition": { "type": "BLANK" },
                        "format": { "backgroundColor": color(fill) }
                    }
                },
                "index": 0
            }
        }),
        FormatRule::Borders { range } => {
            let solid = json!({ "style": "SOLID" });
            json!({
                "updateBorders": {
                    "range": grid_range(surface_id, range),
                    "top": solid,
                    "bottom": solid,
                    "left": solid,
                    "right": solid,
                    "innerHorizontal": solid,
                    "innerVertical": solid
                }
            })
        }
        FormatRule::FreezeRows { count } => json!({
            "updateSheetProperties": {
                "properties": { "sheetId": surface_id, "gridProperties": { "frozenRowCount": count } },
                "fields": "gridProperties.frozenRowCount"
            }
        }),
    }
}
