//! Google Calendar event sink
//!
//! The dispatch loop only sees the [`EventSink`] trait; the Google
//! implementation behind it owns the stored OAuth token and refreshes it
//! when it expires. Construction is an explicit [`GoogleCalendarSink::connect`]
//! step with a typed error, so credential problems surface at startup
//! instead of inside the tracker.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::Config;
use crate::tracker::CalendarEvent;

const CALENDAR_API_BASE: &str = "https://www.googleapis.com/calendar/v3";
const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

/// Label attached to event date-times. No conversion is performed; the
/// tracker's naive timestamps are presented in this zone as-is.
const EVENT_TIME_ZONE: &str = "America/Los_Angeles";

/// Refresh this long before the stored expiry.
fn expiry_margin() -> TimeDelta {
    TimeDelta::seconds(60)
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("calendar API error: {0}")]
    Api(String),
}

/// Persists qualifying sessions as calendar events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn create_event(&self, event: &CalendarEvent) -> Result<(), SinkError>;
}

/// Contents of the stored token file (`token.json`).
#[derive(Debug, Clone, Deserialize)]
struct StoredToken {
    access_token: String,
    refresh_token: Option<String>,
    client_id: String,
    client_secret: String,
    /// RFC 3339 expiry of the access token. Absent means the token cannot
    /// be trusted and is refreshed before first use.
    expiry: Option<DateTime<Utc>>,
}

struct TokenState {
    access_token: String,
    expires_at: Option<DateTime<Utc>>,
}

pub struct GoogleCalendarSink {
    http: Client,
    calendar_id: String,
    api_base: String,
    token_endpoint: String,
    client_id: String,
    client_secret: String,
    refresh_token: Option<String>,
    token: RwLock<TokenState>,
}

impl GoogleCalendarSink {
    /// Read the stored token file and build a ready-to-use sink.
    pub async fn connect(config: &Config) -> Result<Self, SinkError> {
        let stored = read_token_file(&config.token_path)?;
        info!(
            component = "calendar",
            event = "calendar.sink_connected",
            calendar_id = %config.calendar_id,
            has_refresh_token = stored.refresh_token.is_some(),
            "Calendar sink ready"
        );
        Ok(Self::with_endpoints(
            config.calendar_id.clone(),
            stored,
            CALENDAR_API_BASE.to_string(),
            TOKEN_ENDPOINT.to_string(),
        ))
    }

    fn with_endpoints(
        calendar_id: String,
        stored: StoredToken,
        api_base: String,
        token_endpoint: String,
    ) -> Self {
        Self {
            http: Client::new(),
            calendar_id,
            api_base,
            token_endpoint,
            client_id: stored.client_id,
            client_secret: stored.client_secret,
            refresh_token: stored.refresh_token,
            token: RwLock::new(TokenState {
                access_token: stored.access_token,
                expires_at: stored.expiry,
            }),
        }
    }

    /// Return a usable bearer token, refreshing it first when expired or
    /// within the expiry margin.
    async fn bearer_token(&self) -> Result<String, SinkError> {
        {
            let token = self.token.read().await;
            if let Some(expires_at) = token.expires_at {
                if Utc::now() + expiry_margin() < expires_at {
                    return Ok(token.access_token.clone());
                }
            }
        }
        self.refresh().await
    }

    async fn refresh(&self) -> Result<String, SinkError> {
        let refresh_token = self.refresh_token.as_deref().ok_or_else(|| {
            SinkError::Auth("access token expired and no refresh token is stored".to_string())
        })?;

        let response = self
            .http
            .post(&self.token_endpoint)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| SinkError::Auth(format!("token refresh request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(SinkError::Auth(format!(
                "token refresh failed ({status}): {body}"
            )));
        }

        let refreshed: TokenRefreshResponse = response
            .json()
            .await
            .map_err(|e| SinkError::Auth(format!("failed to parse token response: {e}")))?;

        let mut token = self.token.write().await;
        token.access_token = refreshed.access_token.clone();
        token.expires_at = Some(Utc::now() + TimeDelta::seconds(refreshed.expires_in));
        info!(
            component = "calendar",
            event = "calendar.token_refreshed",
            expires_in = refreshed.expires_in,
            "Access token refreshed"
        );

        Ok(refreshed.access_token)
    }
}

#[async_trait]
impl EventSink for GoogleCalendarSink {
    async fn create_event(&self, event: &CalendarEvent) -> Result<(), SinkError> {
        let access_token = self.bearer_token().await?;
        let url = format!("{}/calendars/{}/events", self.api_base, self.calendar_id);
        let body = InsertEventRequest {
            summary: event.summary.clone(),
            start: WireEventDateTime::local(event.start),
            end: WireEventDateTime::local(event.end),
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| SinkError::Api(format!("event insert request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(SinkError::Auth(format!(
                    "event insert rejected ({status}): {body}"
                )));
            }
            return Err(SinkError::Api(format!(
                "event insert failed ({status}): {body}"
            )));
        }

        debug!(
            component = "calendar",
            event = "calendar.event_created",
            summary = %event.summary,
            "Event added"
        );
        Ok(())
    }
}

fn read_token_file(path: &Path) -> Result<StoredToken, SinkError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| SinkError::Auth(format!("failed to read token file {path:?}: {e}")))?;
    serde_json::from_str(&raw)
        .map_err(|e| SinkError::Auth(format!("token file {path:?} is malformed: {e}")))
}

/// ISO-8601 local date-time, no offset.
fn format_event_time(time: NaiveDateTime) -> String {
    time.format("%Y-%m-%dT%H:%M:%S").to_string()
}

#[derive(Debug, Serialize)]
struct InsertEventRequest {
    summary: String,
    start: WireEventDateTime,
    end: WireEventDateTime,
}

#[derive(Debug, Serialize)]
struct WireEventDateTime {
    #[serde(rename = "dateTime")]
    date_time: String,
    #[serde(rename = "timeZone")]
    time_zone: String,
}

impl WireEventDateTime {
    fn local(time: NaiveDateTime) -> Self {
        Self {
            date_time: format_event_time(time),
            time_zone: EVENT_TIME_ZONE.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenRefreshResponse {
    access_token: String,
    expires_in: i64,
}
