pub mod telegram;

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};

use crate::data::shared_booking::SlotId;
use crate::error::NotifyError;
use crate::settings::NotificationSettings;
use crate::utils::date::korean_slot_label;

/// Outbound message channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &str) -> Result<(), NotifyError>;

    async fn send_error(&self, message: &str) -> Result<(), NotifyError>;

    /// Verifies the channel end to end, returning a short description of it.
    async fn test_connection(&self) -> Result<String, NotifyError> {
        self.send("🔧 예약 모니터링 시스템\n연결 테스트가 성공했습니다!")
            .await?;
        Ok("notifier".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmittedBatch {
    pub slots: Vec<SlotId>,
    /// Candidates cut by the per-message cap.
    pub overflow: usize,
}

impl AdmittedBatch {
    pub fn more_marker(&self) -> Option<String> {
        (self.overflow > 0).then(|| format!("+{} more", self.overflow))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Empty,
    Suppressed { remaining: Duration },
    Admitted(AdmittedBatch),
}

impl Admission {
    pub fn slots(&self) -> &[SlotId] {
        match self {
            Admission::Admitted(batch) => &batch.slots,
            _ => &[],
        }
    }
}

/// Cooldown and size cap in front of one notification channel.
pub struct NotificationGate {
    cooldown: Duration,
    max_slots: usize,
    last_sent_at: Mutex<Option<DateTime<Utc>>>,
}

impl NotificationGate {
    pub fn new(cooldown: Duration, max_slots: usize) -> Self {
        Self {
            cooldown,
            max_slots: max_slots.max(1),
            last_sent_at: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, Option<DateTime<Utc>>> {
        self.last_sent_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn last_sent_at(&self) -> Option<DateTime<Utc>> {
        *self.state()
    }

    /// Admitting a batch starts a new cooldown window; the window is not
    /// rolled back if the send later fails.
    pub fn admit(&self, mut candidates: Vec<SlotId>, now: DateTime<Utc>) -> Admission {
        if candidates.is_empty() {
            return Admission::Empty;
        }

        let mut last_sent_at = self.state();
        if let Some(last) = *last_sent_at {
            // a clock that stepped backwards counts as no time elapsed
            let elapsed = (now - last).to_std().unwrap_or_default();
            if elapsed < self.cooldown {
                let remaining = self.cooldown - elapsed;
                log::info!(
                    "notification cooldown active, {}s left; suppressing {} slots",
                    remaining.as_secs(),
                    candidates.len()
                );
                return Admission::Suppressed { remaining };
            }
        }

        let overflow = candidates.len().saturating_sub(self.max_slots);
        candidates.truncate(self.max_slots);
        *last_sent_at = Some(now);
        Admission::Admitted(AdmittedBatch {
            slots: candidates,
            overflow,
        })
    }
}

/// One line per slot, an optional overflow line, then the booking link.
pub fn format_slots_message(batch: &AdmittedBatch, settings: &NotificationSettings) -> String {
    let mut lines: Vec<String> = batch
        .slots
        .iter()
        .map(|slot| match korean_slot_label(slot) {
            Some(label) => format!("{} {}", settings.slot_label, label),
            None => format!("{} {}", settings.slot_label, slot),
        })
        .collect();

    if let Some(marker) = batch.more_marker() {
        lines.push(marker);
    }
    lines.push(settings.booking_url.clone());
    lines.join("\n")
}

pub fn format_error_message(error: &str, now: DateTime<Local>) -> String {
    format!(
        "⚠️ 예약 모니터링 오류\n\n{}\n\n⏰ {}",
        error,
        now.format("%Y-%m-%d %H:%M:%S")
    )
}
