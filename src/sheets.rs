/// Google Sheets logging module
///
/// Appends dialog exchanges, consultation requests, and order requests to a
/// spreadsheet over the Sheets REST API, authenticating with a service
/// account. Worksheets are created with their header row on first use. When
/// no spreadsheet is configured the bot runs with a no-op log instead, so
/// logging failures can never take the chat down.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::intake::CompletedRequest;

const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";
const SHEETS_API: &str = "https://sheets.googleapis.com/v4/spreadsheets";

/// Longest text stored in a single cell; longer messages are cut
const MAX_CELL_CHARS: usize = 5000;

const DIALOGS_SHEET: &str = "Dialogs";
const CONSULTATIONS_SHEET: &str = "Consultations";
const ORDERS_SHEET: &str = "Orders";

const DIALOG_HEADERS: [&str; 9] = [
    "Timestamp",
    "User id",
    "Username",
    "First name",
    "Last name",
    "User message",
    "Bot reply",
    "Message length",
    "Reply length",
];

const CONSULTATION_HEADERS: [&str; 6] =
    ["Timestamp", "User id", "Username", "Name", "Phone", "Status"];

const ORDER_HEADERS: [&str; 5] = ["Timestamp", "User id", "Username", "Order info", "Status"];

/// One dialog exchange to be appended to the Dialogs worksheet
#[derive(Debug, Clone)]
pub struct DialogRow {
    pub user_id: u64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub user_message: String,
    pub bot_response: String,
}

/// Seam between the chat handlers and whatever records interactions
#[async_trait]
pub trait InteractionLog: Send + Sync {
    async fn log_dialog(&self, row: DialogRow) -> Result<()>;
    async fn log_consultation(&self, request: &CompletedRequest) -> Result<()>;
    async fn log_order(&self, request: &CompletedRequest) -> Result<()>;
}

/// Used when no spreadsheet is configured
pub struct NullLog;

#[async_trait]
impl InteractionLog for NullLog {
    async fn log_dialog(&self, row: DialogRow) -> Result<()> {
        log::debug!("Sheets not configured - dialog for user {} not logged", row.user_id);
        Ok(())
    }

    async fn log_consultation(&self, request: &CompletedRequest) -> Result<()> {
        log::debug!(
            "Sheets not configured - consultation request from user {} not logged",
            request.profile.user_id
        );
        Ok(())
    }

    async fn log_order(&self, request: &CompletedRequest) -> Result<()> {
        log::debug!(
            "Sheets not configured - order request from user {} not logged",
            request.profile.user_id
        );
        Ok(())
    }
}

/// Service account credentials, as downloaded from the Google Cloud console
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
}

#[derive(Debug, Serialize)]
struct TokenClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

struct CachedToken {
    access_token: String,
    expires_at: i64,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetInfo {
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Debug, Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
struct SheetProperties {
    title: String,
}

/// Interaction log backed by a Google spreadsheet
pub struct GoogleSheetsLog {
    client: reqwest::Client,
    key: ServiceAccountKey,
    spreadsheet_id: String,
    token: Mutex<Option<CachedToken>>,
    ensured_sheets: Mutex<HashSet<String>>,
}

impl GoogleSheetsLog {
    /// Build the log from a credentials file and a spreadsheet id
    pub fn from_file(credentials_path: &str, spreadsheet_id: String) -> Result<Self> {
        let raw = fs::read_to_string(credentials_path)
            .with_context(|| format!("Failed to read credentials file {}", credentials_path))?;
        let key: ServiceAccountKey =
            serde_json::from_str(&raw).context("Failed to parse service account credentials")?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            key,
            spreadsheet_id,
            token: Mutex::new(None),
            ensured_sheets: Mutex::new(HashSet::new()),
        })
    }

    /// Get a cached access token, minting a new one when needed
    ///
    /// Tokens are refreshed a minute before they expire.
    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        let now = Utc::now().timestamp();

        if let Some(token) = cached.as_ref() {
            if token.expires_at - 60 > now {
                return Ok(token.access_token.clone());
            }
        }

        let claims = TokenClaims {
            iss: &self.key.client_email,
            scope: SHEETS_SCOPE,
            aud: TOKEN_URL,
            iat: now,
            exp: now + 3600,
        };

        let encoding_key = jsonwebtoken::EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .context("Invalid service account private key")?;
        let assertion = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
            &claims,
            &encoding_key,
        )
        .context("Failed to sign service account assertion")?;

        let response = self
            .client
            .post(TOKEN_URL)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .context("Failed to request access token")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            anyhow::bail!("Token endpoint error (status {}): {}", status, error_text);
        }

        let token: TokenResponse = response
            .json()
            .await
            .context("Failed to parse token response")?;

        let access_token = token.access_token.clone();
        *cached = Some(CachedToken {
            access_token: token.access_token,
            expires_at: now + token.expires_in,
        });

        Ok(access_token)
    }

    /// Create the worksheet with its header row unless it already exists
    async fn ensure_worksheet(&self, title: &str, headers: &[&str], rows: u32) -> Result<()> {
        {
            let ensured = self.ensured_sheets.lock().await;
            if ensured.contains(title) {
                return Ok(());
            }
        }

        let token = self.access_token().await?;

        let info_url = format!(
            "{}/{}?fields=sheets.properties.title",
            SHEETS_API, self.spreadsheet_id
        );
        let response = self
            .client
            .get(&info_url)
            .bearer_auth(&token)
            .send()
            .await
            .context("Failed to fetch spreadsheet info")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            anyhow::bail!("Sheets API error (status {}): {}", status, error_text);
        }

        let info: SpreadsheetInfo = response
            .json()
            .await
            .context("Failed to parse spreadsheet info")?;

        let exists = info.sheets.iter().any(|s| s.properties.title == title);

        if !exists {
            log::info!("Creating worksheet '{}'", title);

            let batch_url = format!("{}/{}:batchUpdate", SHEETS_API, self.spreadsheet_id);
            let body = serde_json::json!({
                "requests": [{
                    "addSheet": {
                        "properties": {
                            "title": title,
                            "gridProperties": { "rowCount": rows, "columnCount": 10 }
                        }
                    }
                }]
            });

            let response = self
                .client
                .post(&batch_url)
                .bearer_auth(&token)
                .json(&body)
                .send()
                .await
                .context("Failed to create worksheet")?;

            let status = response.status();
            if !status.is_success() {
                let error_text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unable to read error response".to_string());
                anyhow::bail!("Sheets API error (status {}): {}", status, error_text);
            }

            let header_row: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
            self.append_values(&token, title, header_row).await?;
        }

        self.ensured_sheets.lock().await.insert(title.to_string());
        Ok(())
    }

    async fn append_values(&self, token: &str, title: &str, values: Vec<String>) -> Result<()> {
        let url = format!(
            "{}/{}/values/{}!A1:append?valueInputOption=USER_ENTERED&insertDataOption=INSERT_ROWS",
            SHEETS_API, self.spreadsheet_id, title
        );

        let body = serde_json::json!({ "values": [values] });

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .context("Failed to append row")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            anyhow::bail!("Sheets append error (status {}): {}", status, error_text);
        }

        Ok(())
    }

    async fn append_row(
        &self,
        title: &str,
        headers: &[&str],
        rows: u32,
        values: Vec<String>,
    ) -> Result<()> {
        self.ensure_worksheet(title, headers, rows).await?;
        let token = self.access_token().await?;
        self.append_values(&token, title, values).await
    }
}

#[async_trait]
impl InteractionLog for GoogleSheetsLog {
    async fn log_dialog(&self, row: DialogRow) -> Result<()> {
        let values = dialog_values(&current_timestamp(), &row);
        self.append_row(DIALOGS_SHEET, &DIALOG_HEADERS, 10_000, values)
            .await?;
        log::info!("Dialog logged for user {}", row.user_id);
        Ok(())
    }

    async fn log_consultation(&self, request: &CompletedRequest) -> Result<()> {
        let values = consultation_values(&current_timestamp(), request);
        self.append_row(CONSULTATIONS_SHEET, &CONSULTATION_HEADERS, 1_000, values)
            .await?;
        log::info!(
            "Consultation request logged for user {}",
            request.profile.user_id
        );
        Ok(())
    }

    async fn log_order(&self, request: &CompletedRequest) -> Result<()> {
        let values = order_values(&current_timestamp(), request);
        self.append_row(ORDERS_SHEET, &ORDER_HEADERS, 1_000, values)
            .await?;
        log::info!("Order request logged for user {}", request.profile.user_id);
        Ok(())
    }
}

/// Local wall-clock timestamp in the spreadsheet format
pub fn current_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn truncate_cell(text: &str) -> String {
    if text.chars().count() > MAX_CELL_CHARS {
        text.chars().take(MAX_CELL_CHARS).collect()
    } else {
        text.to_string()
    }
}

fn dialog_values(timestamp: &str, row: &DialogRow) -> Vec<String> {
    vec![
        timestamp.to_string(),
        row.user_id.to_string(),
        row.username.clone().unwrap_or_default(),
        row.first_name.clone().unwrap_or_default(),
        row.last_name.clone().unwrap_or_default(),
        truncate_cell(&row.user_message),
        truncate_cell(&row.bot_response),
        row.user_message.chars().count().to_string(),
        row.bot_response.chars().count().to_string(),
    ]
}

fn consultation_values(timestamp: &str, request: &CompletedRequest) -> Vec<String> {
    vec![
        timestamp.to_string(),
        request.profile.user_id.to_string(),
        request.profile.username.clone().unwrap_or_default(),
        request.name.clone(),
        request.phone.clone(),
        "New".to_string(),
    ]
}

fn order_values(timestamp: &str, request: &CompletedRequest) -> Vec<String> {
    vec![
        timestamp.to_string(),
        request.profile.user_id.to_string(),
        request.profile.username.clone().unwrap_or_default(),
        request.order_info(),
        "New".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intake::{RequestKind, UserProfile};

    fn dialog_row() -> DialogRow {
        DialogRow {
            user_id: 42,
            username: Some("alice".to_string()),
            first_name: Some("Alice".to_string()),
            last_name: None,
            user_message: "Which cream for dry skin?".to_string(),
            bot_response: "Try the rich day cream.".to_string(),
        }
    }

    #[test]
    fn dialog_row_matches_header_layout() {
        let values = dialog_values("2026-08-07 12:00:00", &dialog_row());
        assert_eq!(values.len(), DIALOG_HEADERS.len());
        assert_eq!(values[0], "2026-08-07 12:00:00");
        assert_eq!(values[1], "42");
        assert_eq!(values[2], "alice");
        assert_eq!(values[4], ""); // missing last name stays empty
        assert_eq!(values[7], "25");
        assert_eq!(values[8], "23");
    }

    #[test]
    fn long_messages_are_truncated_but_lengths_keep_the_original() {
        let mut row = dialog_row();
        row.user_message = "д".repeat(6000);

        let values = dialog_values("2026-08-07 12:00:00", &row);
        assert_eq!(values[5].chars().count(), MAX_CELL_CHARS);
        assert_eq!(values[7], "6000");
    }

    fn request(kind: RequestKind) -> CompletedRequest {
        CompletedRequest {
            kind,
            profile: UserProfile {
                user_id: 7,
                username: Some("bob".to_string()),
                first_name: Some("Bob".to_string()),
                last_name: None,
            },
            name: "Bob".to_string(),
            phone: "+7999".to_string(),
            order_details: Some("Thermal tonic".to_string()),
        }
    }

    #[test]
    fn consultation_row_matches_header_layout() {
        let values = consultation_values("t", &request(RequestKind::Consultation));
        assert_eq!(values.len(), CONSULTATION_HEADERS.len());
        assert_eq!(values[3], "Bob");
        assert_eq!(values[4], "+7999");
        assert_eq!(values[5], "New");
    }

    #[test]
    fn order_row_collapses_the_request_into_one_cell() {
        let values = order_values("t", &request(RequestKind::Order));
        assert_eq!(values.len(), ORDER_HEADERS.len());
        assert_eq!(values[3], "Name: Bob, Phone: +7999, Order: Thermal tonic");
        assert_eq!(values[4], "New");
    }

    #[tokio::test]
    async fn null_log_accepts_everything() {
        let log = NullLog;
        assert!(log.log_dialog(dialog_row()).await.is_ok());
        assert!(log
            .log_consultation(&request(RequestKind::Consultation))
            .await
            .is_ok());
        assert!(log.log_order(&request(RequestKind::Order)).await.is_ok());
    }
}
