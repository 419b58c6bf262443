use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::watch;

use super::Notifier;
use crate::error::NotifyError;
use crate::monitor::{MonitorStats, StatusBoard};
use crate::settings::TelegramSettings;
use crate::utils::date::format_runtime;

const LONG_POLL_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotUser {
    pub id: i64,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub from: Option<BotUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

/// Bot API client bound to a single chat.
pub struct TelegramNotifier {
    client: Client,
    api_base: String,
    token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(settings: &TelegramSettings, timeout: Duration) -> Result<Self, NotifyError> {
        if settings.bot_token.trim().is_empty() {
            return Err(NotifyError::NotConfigured("telegram.bot_token is empty"));
        }
        if settings.chat_id.trim().is_empty() {
            return Err(NotifyError::NotConfigured("telegram.chat_id is empty"));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            token: settings.bot_token.trim().to_string(),
            chat_id: settings.chat_id.trim().to_string(),
        })
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &Value,
        timeout: Option<Duration>,
    ) -> Result<T, NotifyError> {
        let mut request = self.client.post(self.method_url(method)).json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response: ApiResponse<T> = request.send().await?.json().await?;
        match (response.ok, response.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(NotifyError::Api(
                response
                    .description
                    .unwrap_or_else(|| format!("{} failed", method)),
            )),
        }
    }

    pub async fn send_to(&self, chat_id: &str, text: &str) -> Result<(), NotifyError> {
        let body = json!({
            "chat_id": chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });
        self.call::<Value>("sendMessage", &body, None).await?;
        Ok(())
    }

    pub async fn get_me(&self) -> Result<BotUser, NotifyError> {
        self.call("getMe", &json!({}), None).await
    }

    pub async fn get_updates(&self, offset: Option<i64>) -> Result<Vec<Update>, NotifyError> {
        let mut body = json!({ "timeout": LONG_POLL_SECS, "allowed_updates": ["message"] });
        if let Some(offset) = offset {
            body["offset"] = json!(offset);
        }
        self.call(
            "getUpdates",
            &body,
            Some(Duration::from_secs(LONG_POLL_SECS + 10)),
        )
        .await
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, message: &str) -> Result<(), NotifyError> {
        self.send_to(&self.chat_id, message).await
    }

    async fn send_error(&self, message: &str) -> Result<(), NotifyError> {
        self.send_to(&self.chat_id, message).await
    }

    async fn test_connection(&self) -> Result<String, NotifyError> {
        let me = self.get_me().await?;
        let name = me
            .username
            .map(|u| format!("@{}", u))
            .unwrap_or_else(|| me.first_name.clone());
        log::info!("telegram bot reachable: {} ({})", name, me.id);
        self.send("🔧 예약 모니터링 시스템\n연결 테스트가 성공했습니다!")
            .await?;
        Ok(name)
    }
}

/// Static facts shown by `/start` and `/help`.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub theme_name: String,
    pub check_interval_secs: u64,
}

/// Answers chat commands from the configured chat with read-only views of
/// the monitor state.
pub struct CommandListener {
    bot: Arc<TelegramNotifier>,
    board: Arc<StatusBoard>,
    context: CommandContext,
}

impl CommandListener {
    pub fn new(bot: Arc<TelegramNotifier>, board: Arc<StatusBoard>, context: CommandContext) -> Self {
        Self { bot, board, context }
    }

    pub fn reply_for(&self, text: &str) -> Option<String> {
        let command = text.split_whitespace().next()?;
        let command = command.split('@').next().unwrap_or(command);
        match command {
            "/status" => Some(status_reply(&self.board.snapshot())),
            "/help" => Some(help_reply()),
            "/start" => Some(start_reply(&self.context)),
            _ => None,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        log::info!("listening for chat commands: /status, /help, /start");
        let mut offset: Option<i64> = None;

        loop {
            let updates = tokio::select! {
                updates = self.bot.get_updates(offset) => updates,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let updates = match updates {
                Ok(updates) => updates,
                Err(e) => {
                    log::warn!("getUpdates failed: {}", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            for update in updates {
                offset = Some(update.update_id + 1);
                let Some(message) = update.message else {
                    continue;
                };
                if message.chat.id.to_string() != self.bot.chat_id() {
                    log::debug!("ignoring message from chat {}", message.chat.id);
                    continue;
                }
                let Some(reply) = message.text.as_deref().and_then(|t| self.reply_for(t)) else {
                    continue;
                };
                let user = message
                    .from
                    .map(|u| u.first_name)
                    .unwrap_or_else(|| "unknown".to_string());
                log::info!("{} ran {:?}", user, message.text.unwrap_or_default());
                if let Err(e) = self.bot.send_to(self.bot.chat_id(), &reply).await {
                    log::warn!("failed to answer command: {}", e);
                }
            }
        }
        log::info!("command listener stopped");
    }
}

fn status_reply(stats: &MonitorStats) -> String {
    let now = Local::now();
    let runtime = stats
        .runtime(now)
        .map(format_runtime)
        .unwrap_or_else(|| "시작 시간 미설정".to_string());
    let last_success = stats
        .last_success_at
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "없음".to_string());
    format!(
        "🤖 예약 모니터링 상태\n\n⏰ 런타임: {}\n📊 총 체크 횟수: {}\n✅ 마지막 성공: {}\n❌ 에러 횟수: {}\n🔄 모니터링 상태: {}\n\n⏰ 현재 시간: {}",
        runtime,
        stats.check_count,
        last_success,
        stats.error_count,
        if stats.running { "실행 중" } else { "중지됨" },
        now.format("%Y-%m-%d %H:%M:%S")
    )
}

fn help_reply() -> String {
    [
        "🤖 예약 모니터링 봇 명령어",
        "",
        "📊 /status - 현재 모니터링 상태 확인",
        "❓ /help - 이 도움말 보기",
        "🚀 /start - 봇 시작 인사",
        "",
        "💡 자동 기능:",
        "• 예약 가능한 슬롯 발견 시 즉시 알림",
        "• 매 정각 상태 메시지 전송",
        "• 오류 발생 시 자동 알림",
    ]
    .join("\n")
}

fn start_reply(context: &CommandContext) -> String {
    format!(
        "🎉 예약 모니터링 봇에 오신 것을 환영합니다!\n\n🎯 현재 모니터링 중: {} 테마\n🔄 체크 간격: {}초마다\n\n📱 사용 가능한 명령어를 보려면 /help를 입력하세요.",
        context.theme_name, context.check_interval_secs
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener() -> CommandListener {
        let settings = TelegramSettings {
            bot_token: "123:abc".to_string(),
            chat_id: "42".to_string(),
            ..TelegramSettings::default()
        };
        let bot = TelegramNotifier::new(&settings, Duration::from_secs(5)).unwrap();
        CommandListener::new(
            Arc::new(bot),
            Arc::new(StatusBoard::new()),
            CommandContext {
                theme_name: "층간소음".to_string(),
                check_interval_secs: 60,
            },
        )
    }

    #[test]
    fn requires_token_and_chat() {
        let missing = TelegramSettings::default();
        assert!(matches!(
            TelegramNotifier::new(&missing, Duration::from_secs(5)),
            Err(NotifyError::NotConfigured(_))
        ));
    }

    #[test]
    fn builds_method_urls() {
        let listener = listener();
        assert_eq!(
            listener.bot.method_url("sendMessage"),
            "https://api.telegram.org/bot123:abc/sendMessage"
        );
    }

    #[test]
    fn answers_known_commands_only() {
        let listener = listener();
        listener.board.record_check();
        let status = listener.reply_for("/status").unwrap();
        assert!(status.contains("총 체크 횟수: 1"));
        assert!(status.contains("중지됨"));
        assert!(listener.reply_for("/status@slot_watch_bot").is_some());
        assert!(listener.reply_for("/help").unwrap().contains("/status"));
        assert!(listener.reply_for("/start").unwrap().contains("층간소음"));
        assert!(listener.reply_for("hello").is_none());
        assert!(listener.reply_for("").is_none());
    }

    #[test]
    fn parses_updates() {
        let raw = r#"{"ok": true, "result": [
            {"update_id": 7, "message": {"chat": {"id": 42}, "text": "/status", "from": {"id": 1, "first_name": "Kim"}}},
            {"update_id": 8}
        ]}"#;
        let response: ApiResponse<Vec<Update>> = serde_json::from_str(raw).unwrap();
        let updates = response.result.unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].message.as_ref().unwrap().chat.id, 42);
        assert!(updates[1].message.is_none());
    }
}
