use std::collections::HashMap;
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::NaiveDate;
use regex::{Captures, Regex};
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;

use super::shared_booking::{FetchResult, HiddenReservationMap, RawSlotRecord};
use super::SlotSource;
use crate::error::FetchError;
use crate::settings::Settings;

static CSRF_META: OnceLock<Regex> = OnceLock::new();
static CSRF_INPUT: OnceLock<Regex> = OnceLock::new();
static HIDDEN_DIV: OnceLock<Regex> = OnceLock::new();
static HTML_ENTITY: OnceLock<Regex> = OnceLock::new();

// Laravel answers 419 once the session token has expired
const CSRF_EXPIRED: u16 = 419;

#[derive(Debug, Clone, Deserialize)]
pub struct ThemeEntry {
    #[serde(rename = "PK")]
    pub pk: u64,
    #[serde(default)]
    pub title: String,
}

/// Body of `POST /reservation/theme`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ThemeListing {
    #[serde(default)]
    pub data: Vec<ThemeEntry>,
    #[serde(default)]
    pub times: HashMap<String, Vec<RawSlotRecord>>,
}

impl ThemeListing {
    pub fn find_theme(&self, name: &str) -> Option<u64> {
        self.data
            .iter()
            .find(|theme| theme.title.contains(name))
            .map(|theme| theme.pk)
    }

    pub fn records_for(&mut self, theme_id: u64) -> Vec<RawSlotRecord> {
        self.times.remove(&theme_id.to_string()).unwrap_or_default()
    }
}

/// HTTP client for the zerohongdae.com reservation pages.
pub struct ZeroworldClient {
    client: Client,
    base_url: String,
    theme_name: String,
    csrf_token: Mutex<Option<String>>,
}

impl ZeroworldClient {
    pub fn new(settings: &Settings) -> Result<Self, FetchError> {
        let base_url = settings.base_url.trim_end_matches('/').to_string();
        let reservation_url = format!("{}/reservation", base_url);

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
            ),
        );
        headers.insert(
            header::ACCEPT_LANGUAGE,
            header::HeaderValue::from_static("ko-KR,ko;q=0.9,en;q=0.8"),
        );
        if let Ok(origin) = header::HeaderValue::from_str(&base_url) {
            headers.insert(header::ORIGIN, origin);
        }
        if let Ok(referer) = header::HeaderValue::from_str(&reservation_url) {
            headers.insert(header::REFERER, referer);
        }

        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .default_headers(headers)
            .cookie_store(true)
            .timeout(settings.request_timeout())
            .build()?;

        Ok(Self {
            client,
            base_url,
            theme_name: settings.theme_name.clone(),
            csrf_token: Mutex::new(None),
        })
    }

    fn reservation_url(&self) -> String {
        format!("{}/reservation", self.base_url)
    }

    async fn get_page(&self, url: &str) -> Result<String, FetchError> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response.text().await?)
    }

    async fn bootstrap_session(&self) -> Result<String, FetchError> {
        let html = self.get_page(&self.reservation_url()).await?;
        let token = extract_csrf_token(&html).ok_or(FetchError::MissingCsrfToken)?;
        log::info!(
            "csrf token acquired ({}...)",
            token.chars().take(10).collect::<String>()
        );
        Ok(token)
    }

    async fn csrf_token(&self) -> Result<String, FetchError> {
        let mut cached = self.csrf_token.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }
        let token = self.bootstrap_session().await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    async fn forget_csrf_token(&self) {
        *self.csrf_token.lock().await = None;
    }

    async fn fetch_hidden(&self, date: &str) -> Result<HiddenReservationMap, FetchError> {
        let url = format!("{}?date={}", self.reservation_url(), date);
        let html = self.get_page(&url).await?;
        match extract_hidden_data(&html) {
            Some(hidden) => {
                if hidden.is_empty() {
                    log::debug!("no hidden reservations listed for {}", date);
                }
                Ok(hidden)
            }
            None => {
                log::warn!("no usable reservationHiddenData on the page for {}", date);
                Ok(HiddenReservationMap::new())
            }
        }
    }

    async fn post_listing(&self, date: &str, token: &str) -> Result<reqwest::Response, FetchError> {
        let url = format!("{}/theme", self.reservation_url());
        let form = [
            ("reservationDate", date),
            ("name", ""),
            ("phone", ""),
            ("paymentType", "1"),
        ];
        let response = self
            .client
            .post(&url)
            .header("X-Requested-With", "XMLHttpRequest")
            .header("X-CSRF-TOKEN", token)
            .header(
                header::ACCEPT,
                "application/json, text/javascript, */*; q=0.01",
            )
            .form(&form)
            .send()
            .await?;
        Ok(response)
    }

    async fn fetch_listing(&self, date: &str) -> Result<ThemeListing, FetchError> {
        let token = self.csrf_token().await?;
        let mut response = self.post_listing(date, &token).await?;

        if response.status().as_u16() == CSRF_EXPIRED {
            log::warn!("csrf token expired, re-initialising session");
            self.forget_csrf_token().await;
            let token = self.csrf_token().await?;
            response = self.post_listing(date, &token).await?;
        }

        let status = response.status();
        if status != StatusCode::OK {
            return Err(FetchError::Status {
                url: format!("{}/theme", self.reservation_url()),
                status: status.as_u16(),
            });
        }
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl SlotSource for ZeroworldClient {
    async fn fetch(&self, date: NaiveDate) -> Result<FetchResult, FetchError> {
        let date_str = date.format("%Y-%m-%d").to_string();

        let hidden = self.fetch_hidden(&date_str).await?;
        let mut listing = self.fetch_listing(&date_str).await?;

        let Some(theme_id) = listing.find_theme(&self.theme_name) else {
            log::warn!("theme '{}' not listed for {}", self.theme_name, date_str);
            return Ok(FetchResult {
                theme_id: None,
                records: Vec::new(),
                hidden,
            });
        };

        let records = listing.records_for(theme_id);
        log::debug!(
            "{}: theme {} has {} slots, hidden map covers {} themes",
            date_str,
            theme_id,
            records.len(),
            hidden.theme_count()
        );
        Ok(FetchResult {
            theme_id: Some(theme_id),
            records,
            hidden,
        })
    }

    async fn ping(&self) -> Result<(), FetchError> {
        let token = self.bootstrap_session().await?;
        *self.csrf_token.lock().await = Some(token);
        Ok(())
    }
}

pub fn extract_csrf_token(html: &str) -> Option<String> {
    let meta = CSRF_META.get_or_init(|| {
        Regex::new(r#"<meta[^>]*name=["']csrf-token["'][^>]*content=["']([^"']+)["']"#)
            .expect("valid csrf meta pattern")
    });
    let input = CSRF_INPUT.get_or_init(|| {
        Regex::new(r#"<input[^>]*name=["']_token["'][^>]*value=["']([^"']+)["']"#)
            .expect("valid csrf input pattern")
    });

    meta.captures(html)
        .or_else(|| input.captures(html))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Reads the `other` table out of `<div id="reservationHiddenData">`.
pub fn extract_hidden_data(html: &str) -> Option<HiddenReservationMap> {
    let div = HIDDEN_DIV.get_or_init(|| {
        Regex::new(r#"(?s)<div[^>]*id=["']reservationHiddenData["'][^>]*>(.*?)</div>"#)
            .expect("valid hidden data pattern")
    });
    let raw = div.captures(html)?.get(1)?.as_str();
    let text = unescape_html(raw.trim());

    let value: Value = match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(e) => {
            log::error!("hidden reservation data is not valid json: {}", e);
            return None;
        }
    };
    match value.get("other") {
        Some(other) => serde_json::from_value(other.clone())
            .map_err(|e| log::error!("unexpected hidden reservation layout: {}", e))
            .ok(),
        None => Some(HiddenReservationMap::new()),
    }
}

/// Decodes the named entities Blade escapes plus any numeric reference, in
/// one pass so `&amp;lt;` stays `&lt;`.
fn unescape_html(text: &str) -> String {
    let entity = HTML_ENTITY.get_or_init(|| {
        Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|quot|apos|lt|gt|amp);")
            .expect("valid entity pattern")
    });
    entity
        .replace_all(text, |caps: &Captures| {
            let name = &caps[1];
            let decoded = match name {
                "quot" => Some('"'),
                "apos" => Some('\''),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "amp" => Some('&'),
                _ => {
                    let code = match name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
                        Some(hex) => u32::from_str_radix(hex, 16).ok(),
                        None => name[1..].parse::<u32>().ok(),
                    };
                    code.and_then(char::from_u32)
                }
            };
            decoded
                .map(String::from)
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn finds_csrf_token_in_meta_or_input() {
        let meta = r#"<head><meta name="csrf-token" content="abc123XYZ"></head>"#;
        assert_eq!(extract_csrf_token(meta).as_deref(), Some("abc123XYZ"));

        let input = r#"<form><input type="hidden" name="_token" value="tok-9"></form>"#;
        assert_eq!(extract_csrf_token(input).as_deref(), Some("tok-9"));

        assert_eq!(extract_csrf_token("<html></html>"), None);
    }

    #[test]
    fn extracts_hidden_reservations() {
        let html = r#"
            <div class="x" id="reservationHiddenData" style="display:none">
                {&quot;other&quot;: {&quot;61&quot;: {&quot;1754128800&quot;: {&quot;n&quot;: 1}}}}
            </div>"#;
        let hidden = extract_hidden_data(html).unwrap();
        assert!(hidden.theme(61).unwrap().contains_key("1754128800"));
    }

    #[test]
    fn empty_theme_table_keeps_other_themes() {
        let html = r#"<div id="reservationHiddenData">{"other": {"61": {"1754128800": 1}, "62": []}}</div>"#;
        let hidden = extract_hidden_data(html).unwrap();
        assert_eq!(hidden.theme(61).unwrap()["1754128800"], json!(1));
        assert!(hidden.theme(62).unwrap().is_empty());
    }

    #[test]
    fn decodes_numeric_and_named_entities() {
        assert_eq!(
            unescape_html("&#123;&quot;a&quot;:&#x22;&lt;b&gt;&#34;&#125;"),
            r#"{"a":"<b>"}"#
        );
        assert_eq!(unescape_html("&amp;lt; &#039; &nbsp;"), "&lt; ' &nbsp;");
        assert_eq!(unescape_html("&#xD800;"), "&#xD800;");

        let html = r#"<div id="reservationHiddenData">&#123;&quot;other&quot;: &#123;&quot;61&quot;: &#123;&quot;1754128800&quot;: 1&#125;&#125;&#125;</div>"#;
        assert!(extract_hidden_data(html).unwrap().theme(61).is_some());
    }

    #[test]
    fn hidden_data_without_other_is_empty() {
        let html = r#"<div id="reservationHiddenData">{"mine": {}}</div>"#;
        assert!(extract_hidden_data(html).unwrap().is_empty());
        assert!(extract_hidden_data("<div id=\"reservationHiddenData\">nope</div>").is_none());
        assert!(extract_hidden_data("<p>no div</p>").is_none());
    }

    #[test]
    fn listing_selects_theme_by_title() {
        let mut listing: ThemeListing = serde_json::from_value(json!({
            "data": [
                {"PK": 12, "title": "NOX"},
                {"PK": 61, "title": "[홍대] 층간소음"}
            ],
            "times": {
                "61": [
                    {"time": "18:30:00", "reservation": true},
                    {"time": "20:00:00", "reservation": false}
                ]
            }
        }))
        .unwrap();
        assert_eq!(listing.find_theme("층간소음"), Some(61));
        assert_eq!(listing.find_theme("없음"), None);
        let records = listing.records_for(61);
        assert_eq!(records.len(), 2);
        assert!(records[0].reported_reserved);
        assert!(listing.records_for(12).is_empty());
    }
}
