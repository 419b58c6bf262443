use chrono::{FixedOffset, NaiveDate};
use dotenv::dotenv;
use serde::Deserialize;
use std::env;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::data::resolver::MatchTolerance;
use crate::error::SettingsError;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Substring of the theme title to monitor in the public listing
    #[serde(default = "default_theme_name")]
    pub theme_name: String,
    /// Fixed UTC offset of the venue, used to build hidden-map timestamps
    #[serde(default = "default_timezone_offset_hours")]
    pub timezone_offset_hours: i32,
    /// Last date to check; falls back to `days_ahead` from today
    #[serde(default)]
    pub date_end: Option<NaiveDate>,
    #[serde(default = "default_days_ahead")]
    pub days_ahead: u32,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default)]
    pub run_hours: RunHours,
    #[serde(default = "default_true")]
    pub exclude_past_slots: bool,
    /// 0 means the hidden timestamp must match exactly
    #[serde(default)]
    pub hidden_match_window_secs: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default)]
    pub notification: NotificationSettings,
    #[serde(default)]
    pub telegram: TelegramSettings,
    /// Consecutive failed cycles before an error alert is sent
    #[serde(default = "default_error_alert_threshold")]
    pub error_alert_threshold: u32,
    #[serde(default = "default_true")]
    pub status_report_hourly: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct RunHours {
    pub start: u32,
    pub end: u32,
}

impl Default for RunHours {
    fn default() -> Self {
        Self { start: 0, end: 24 }
    }
}

impl RunHours {
    pub fn contains(&self, hour: u32) -> bool {
        if self.start <= self.end {
            hour >= self.start && hour < self.end
        } else {
            hour >= self.start || hour < self.end
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotificationSettings {
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_max_slots")]
    pub max_slots: usize,
    #[serde(default = "default_slot_label")]
    pub slot_label: String,
    #[serde(default = "default_booking_url")]
    pub booking_url: String,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            max_slots: default_max_slots(),
            slot_label: default_slot_label(),
            booking_url: default_booking_url(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramSettings {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default = "default_telegram_api")]
    pub api_base: String,
    #[serde(default = "default_true")]
    pub listen_commands: bool,
}

impl Default for TelegramSettings {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            chat_id: String::new(),
            api_base: default_telegram_api(),
            listen_commands: true,
        }
    }
}

impl Settings {
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        dotenv().ok();

        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, SettingsError> {
        let mut settings: Settings = serde_yaml::from_str(contents)?;

        settings.telegram.bot_token = parse_env_var(&settings.telegram.bot_token)?;
        settings.telegram.chat_id = parse_env_var(&settings.telegram.chat_id)?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.timezone_offset().is_none() {
            return Err(SettingsError::Invalid {
                field: "timezone_offset_hours",
                reason: format!("{} is out of range", self.timezone_offset_hours),
            });
        }
        if self.check_interval_secs == 0 {
            return Err(SettingsError::Invalid {
                field: "check_interval_secs",
                reason: "must be positive".to_string(),
            });
        }
        if self.notification.max_slots == 0 {
            return Err(SettingsError::Invalid {
                field: "notification.max_slots",
                reason: "must be positive".to_string(),
            });
        }
        if self.run_hours.start > 24 || self.run_hours.end > 24 {
            return Err(SettingsError::Invalid {
                field: "run_hours",
                reason: format!("{}..{} is not within 0..24", self.run_hours.start, self.run_hours.end),
            });
        }
        Ok(())
    }

    pub fn timezone_offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.timezone_offset_hours.checked_mul(3600)?)
    }

    pub fn match_tolerance(&self) -> MatchTolerance {
        MatchTolerance::from_secs(self.hidden_match_window_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.notification.cooldown_secs)
    }
}

fn parse_env_var(value: &str) -> Result<String, SettingsError> {
    if value.starts_with("${") && value.ends_with("}") {
        let env_name = &value[2..value.len() - 1];
        match env::var(env_name) {
            Ok(val) => Ok(val),
            Err(_) => Err(SettingsError::MissingEnv(env_name.to_string())),
        }
    } else {
        Ok(value.to_string())
    }
}

fn default_base_url() -> String {
    "https://zerohongdae.com".to_string()
}

fn default_theme_name() -> String {
    "층간소음".to_string()
}

fn default_timezone_offset_hours() -> i32 {
    9
}

fn default_days_ahead() -> u32 {
    14
}

fn default_check_interval_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string()
}

fn default_state_file() -> PathBuf {
    PathBuf::from("state.json")
}

fn default_error_alert_threshold() -> u32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_cooldown_secs() -> u64 {
    300
}

fn default_max_slots() -> usize {
    10
}

fn default_slot_label() -> String {
    "예약가능확인! 층간소음".to_string()
}

fn default_booking_url() -> String {
    "https://zerohongdae.com/reservation".to_string()
}

fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let settings = Settings::from_yaml_str("{}").unwrap();
        assert_eq!(settings.base_url, "https://zerohongdae.com");
        assert_eq!(settings.notification.cooldown_secs, 300);
        assert_eq!(settings.notification.max_slots, 10);
        assert_eq!(settings.timezone_offset().unwrap().local_minus_utc(), 9 * 3600);
        assert_eq!(settings.match_tolerance(), MatchTolerance::Exact);
        assert_eq!(settings.run_hours, RunHours { start: 0, end: 24 });
        assert!(settings.date_end.is_none());
    }

    #[test]
    fn reads_nested_sections() {
        let yaml = r#"
theme_name: "NOX"
date_end: 2025-08-13
hidden_match_window_secs: 5
run_hours: { start: 9, end: 21 }
notification:
  cooldown_secs: 60
  max_slots: 3
telegram:
  bot_token: "123:abc"
  chat_id: "42"
  listen_commands: false
"#;
        let settings = Settings::from_yaml_str(yaml).unwrap();
        assert_eq!(settings.theme_name, "NOX");
        assert_eq!(settings.date_end, NaiveDate::from_ymd_opt(2025, 8, 13));
        assert_eq!(settings.match_tolerance(), MatchTolerance::Window(5));
        assert_eq!(settings.notification.max_slots, 3);
        assert_eq!(settings.notification.slot_label, "예약가능확인! 층간소음");
        assert_eq!(settings.telegram.chat_id, "42");
        assert!(!settings.telegram.listen_commands);
        assert!(settings.run_hours.contains(9));
        assert!(!settings.run_hours.contains(21));
    }

    #[test]
    fn substitutes_environment_variables() {
        env::set_var("SLOT_WATCH_TEST_TOKEN", "999:xyz");
        let yaml = "telegram:\n  bot_token: \"${SLOT_WATCH_TEST_TOKEN}\"\n";
        let settings = Settings::from_yaml_str(yaml).unwrap();
        assert_eq!(settings.telegram.bot_token, "999:xyz");

        let missing = "telegram:\n  chat_id: \"${SLOT_WATCH_DEFINITELY_UNSET}\"\n";
        assert!(matches!(
            Settings::from_yaml_str(missing),
            Err(SettingsError::MissingEnv(name)) if name == "SLOT_WATCH_DEFINITELY_UNSET"
        ));
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(Settings::from_yaml_str("check_interval_secs: 0").is_err());
        assert!(Settings::from_yaml_str("timezone_offset_hours: 30").is_err());
        assert!(Settings::from_yaml_str("notification: { max_slots: 0 }").is_err());
    }

    #[test]
    fn overnight_run_hours_wrap() {
        let hours = RunHours { start: 22, end: 2 };
        assert!(hours.contains(23));
        assert!(hours.contains(1));
        assert!(!hours.contains(12));
    }
}
