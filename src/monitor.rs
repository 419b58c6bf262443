use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, Offset, TimeDelta, Timelike, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::data::change::detect;
use crate::data::resolver::{parse_slot_datetime, parse_slot_time, SlotStatusResolver};
use crate::data::shared_booking::{ResolvedStatus, SlotId, StatusSnapshot};
use crate::data::snapshot::SnapshotStore;
use crate::data::SlotSource;
use crate::error::CycleError;
use crate::notify::{format_error_message, format_slots_message, Admission, NotificationGate, Notifier};
use crate::settings::Settings;
use crate::utils::date::{date_range, format_runtime, until_next_hour};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorStats {
    pub started_at: Option<DateTime<Local>>,
    pub check_count: u64,
    pub last_success_at: Option<DateTime<Local>>,
    /// Failed cycles since the last successful one.
    pub error_count: u32,
    pub total_errors: u64,
    pub running: bool,
}

impl MonitorStats {
    pub fn runtime(&self, now: DateTime<Local>) -> Option<TimeDelta> {
        self.started_at.map(|started| now - started)
    }
}

/// Counters written by the cycle task and read by the command listener.
#[derive(Debug, Default)]
pub struct StatusBoard {
    inner: Mutex<MonitorStats>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn stats(&self) -> MutexGuard<'_, MonitorStats> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> MonitorStats {
        self.stats().clone()
    }

    pub fn mark_started(&self, now: DateTime<Local>) {
        let mut stats = self.stats();
        stats.started_at = Some(now);
        stats.running = true;
    }

    pub fn mark_stopped(&self) {
        self.stats().running = false;
    }

    pub fn record_check(&self) -> u64 {
        let mut stats = self.stats();
        stats.check_count += 1;
        stats.check_count
    }

    pub fn record_success(&self, now: DateTime<Local>) {
        let mut stats = self.stats();
        stats.error_count = 0;
        stats.last_success_at = Some(now);
    }

    /// Returns the number of consecutive failures including this one.
    pub fn record_failure(&self) -> u32 {
        let mut stats = self.stats();
        stats.error_count += 1;
        stats.total_errors += 1;
        stats.error_count
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub total_slots: usize,
    pub available_slots: usize,
    pub newly_available: Vec<SlotId>,
    pub admission: Admission,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    OutsideRunHours,
    /// Upstream returned no slots; nothing was compared or written.
    NoData,
    Checked(CycleReport),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfTestReport {
    pub notifier: String,
    pub slots: usize,
    pub available: usize,
}

/// Runs poll cycles: fetch, resolve, diff against the stored snapshot,
/// notify, persist.
pub struct Monitor {
    settings: Settings,
    source: Arc<dyn SlotSource>,
    notifier: Arc<dyn Notifier>,
    store: Arc<SnapshotStore>,
    resolver: SlotStatusResolver,
    gate: NotificationGate,
    board: Arc<StatusBoard>,
    cycle_running: AtomicBool,
}

struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Monitor {
    pub fn new(
        settings: Settings,
        source: Arc<dyn SlotSource>,
        notifier: Arc<dyn Notifier>,
        store: Arc<SnapshotStore>,
    ) -> Self {
        let offset = settings.timezone_offset().unwrap_or_else(|| Utc.fix());
        let resolver = SlotStatusResolver::new(offset, settings.match_tolerance());
        let gate = NotificationGate::new(settings.cooldown(), settings.notification.max_slots);
        Self {
            settings,
            source,
            notifier,
            store,
            resolver,
            gate,
            board: Arc::new(StatusBoard::new()),
            cycle_running: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn board(&self) -> Arc<StatusBoard> {
        Arc::clone(&self.board)
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn gate(&self) -> &NotificationGate {
        &self.gate
    }

    pub fn dates_to_check(&self, today: NaiveDate) -> Vec<NaiveDate> {
        let end = self.settings.date_end.unwrap_or_else(|| {
            today + TimeDelta::days(i64::from(self.settings.days_ahead.saturating_sub(1)))
        });
        date_range(today, end)
    }

    /// Fetches every configured date and resolves each slot. Any fetch
    /// failure fails the whole collection so no partial snapshot escapes.
    pub async fn collect_statuses(&self, local_now: NaiveDateTime) -> Result<StatusSnapshot, CycleError> {
        let mut snapshot = StatusSnapshot::new();
        let mut past = 0usize;

        for date in self.dates_to_check(local_now.date()) {
            let date_str = date.format("%Y-%m-%d").to_string();
            let fetched = self
                .source
                .fetch(date)
                .await
                .map_err(|source| CycleError::Fetch {
                    date: date_str.clone(),
                    source,
                })?;

            let Some(theme_id) = fetched.theme_id else {
                log::debug!("{}: theme not listed", date_str);
                continue;
            };
            log::debug!(
                "{}: {} slots, {} hidden themes",
                date_str,
                fetched.records.len(),
                fetched.hidden.theme_count()
            );

            for record in &fetched.records {
                if self.settings.exclude_past_slots {
                    if let Ok(start) = parse_slot_datetime(&date_str, &record.time) {
                        if start <= local_now {
                            past += 1;
                            continue;
                        }
                    }
                }

                let id = match parse_slot_time(&record.time) {
                    Ok(time) => SlotId::new(date, time),
                    Err(_) => SlotId::from_raw(&date_str, &record.time),
                };
                let status = self.resolver.resolve_or_reserved(
                    theme_id,
                    &record.time,
                    &date_str,
                    &fetched.hidden,
                    record.reported_reserved,
                );
                snapshot.insert(id, status);
            }
        }

        if past > 0 {
            log::debug!("skipped {} slots that already started", past);
        }
        Ok(snapshot)
    }

    pub async fn run_cycle(&self) -> Result<CycleOutcome, CycleError> {
        self.run_cycle_at(Utc::now()).await
    }

    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<CycleOutcome, CycleError> {
        let local_now = now.with_timezone(&self.resolver.offset()).naive_local();
        if !self.settings.run_hours.contains(local_now.hour()) {
            log::info!("outside run hours ({}h), skipping check", local_now.hour());
            return Ok(CycleOutcome::OutsideRunHours);
        }

        let mut current = self.collect_statuses(local_now).await?;
        if current.is_empty() {
            log::warn!("no slot information this cycle");
            return Ok(CycleOutcome::NoData);
        }
        log::info!(
            "collected {} slots: {} available, {} reserved",
            current.len(),
            current.available_count(),
            current.reserved_count()
        );

        let previous = self.store.load()?;
        let newly_available = detect(&current, &previous);
        log::info!("{} newly available slots", newly_available.len());
        for slot in &newly_available {
            log::info!("  - {}", slot);
        }

        let admission = self.gate.admit(newly_available.clone(), now);
        if let Admission::Admitted(batch) = &admission {
            let message = format_slots_message(batch, &self.settings.notification);
            if let Err(e) = self.notifier.send(&message).await {
                log::error!("failed to deliver availability notification: {}", e);
                return Err(e.into());
            }
            log::info!("notified {} slots", batch.slots.len());
        }

        current.touch();
        if let Err(e) = self.store.save(&current) {
            log::error!("keeping previous snapshot, write failed: {}", e);
            return Err(e.into());
        }

        Ok(CycleOutcome::Checked(CycleReport {
            total_slots: current.len(),
            available_slots: current.available_count(),
            newly_available,
            admission,
        }))
    }

    fn begin_cycle(&self) -> Option<CycleGuard<'_>> {
        self.cycle_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CycleGuard(&self.cycle_running))
    }

    /// Runs a cycle unless one is already in flight, in which case `None`.
    pub async fn try_run_cycle(&self) -> Option<Result<CycleOutcome, CycleError>> {
        let Some(_guard) = self.begin_cycle() else {
            log::warn!("previous check still running, skipping this tick");
            return None;
        };
        Some(self.run_cycle().await)
    }

    /// One scheduled check with bookkeeping and error escalation.
    pub async fn tick(&self) {
        let Some(_guard) = self.begin_cycle() else {
            log::warn!("previous check still running, skipping this tick");
            return;
        };
        let count = self.board.record_check();
        log::info!("=== slot check #{} ===", count);

        match self.run_cycle().await {
            Ok(_) => self.board.record_success(Local::now()),
            Err(e) => {
                let consecutive = self.board.record_failure();
                log::error!("check failed ({} in a row): {}", consecutive, e);
                let threshold = self.settings.error_alert_threshold;
                if threshold > 0 && consecutive % threshold == 0 {
                    let message = format_error_message(
                        &format!("연속 {}회 오류 발생: {}", consecutive, e),
                        Local::now(),
                    );
                    if let Err(notify_err) = self.notifier.send_error(&message).await {
                        log::error!("failed to send error alert: {}", notify_err);
                    }
                }
            }
        }
    }

    pub async fn send_status_report(&self) {
        let message = format_status_report(&self.board.snapshot(), Local::now());
        match self.notifier.send(&message).await {
            Ok(()) => log::info!("status report sent"),
            Err(e) => log::warn!("failed to send status report: {}", e),
        }
    }

    /// Checks the notifier and the source end to end without touching the
    /// stored snapshot.
    pub async fn self_test(&self) -> Result<SelfTestReport, CycleError> {
        let notifier = self.notifier.test_connection().await?;
        log::info!("notifier ok: {}", notifier);

        let local_now = Utc::now()
            .with_timezone(&self.resolver.offset())
            .naive_local();
        let today = local_now.date().format("%Y-%m-%d").to_string();
        self.source.ping().await.map_err(|source| CycleError::Fetch {
            date: today.clone(),
            source,
        })?;

        let fetched = self
            .source
            .fetch(local_now.date())
            .await
            .map_err(|source| CycleError::Fetch { date: today.clone(), source })?;
        let available = match fetched.theme_id {
            Some(theme_id) => fetched
                .records
                .iter()
                .map(|record| {
                    self.resolver.resolve_or_reserved(
                        theme_id,
                        &record.time,
                        &today,
                        &fetched.hidden,
                        record.reported_reserved,
                    )
                })
                .filter(|status| *status == ResolvedStatus::Available)
                .count(),
            None => 0,
        };
        log::info!("source ok: {} slots for {}", fetched.records.len(), today);

        Ok(SelfTestReport {
            notifier,
            slots: fetched.records.len(),
            available,
        })
    }

    /// Schedules checks until `shutdown` flips to true. The first check runs
    /// immediately; a tick that finds a check in flight is dropped.
    pub async fn run_forever(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        self.board.mark_started(Local::now());
        log::info!(
            "monitoring '{}' every {}s",
            self.settings.theme_name,
            self.settings.check_interval_secs
        );

        let mut interval = time::interval(self.settings.check_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let report_enabled = self.settings.status_report_hourly;
        let report_timer = time::sleep(until_next_hour(Local::now()));
        tokio::pin!(report_timer);

        let mut in_flight: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // the running check keeps its handle so shutdown can await it
                    if in_flight.as_ref().is_some_and(|handle| !handle.is_finished()) {
                        log::warn!("previous check still running, skipping this tick");
                        continue;
                    }
                    let monitor = Arc::clone(&self);
                    in_flight = Some(tokio::spawn(async move { monitor.tick().await }));
                }
                _ = &mut report_timer, if report_enabled => {
                    self.send_status_report().await;
                    report_timer
                        .as_mut()
                        .reset(Instant::now() + until_next_hour(Local::now()).max(Duration::from_secs(1)));
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Some(handle) = in_flight {
            log::info!("waiting for the running check to finish");
            if let Err(e) = handle.await {
                log::error!("check task failed: {}", e);
            }
        }
        self.board.mark_stopped();

        let stats = self.board.snapshot();
        log::info!(
            "stopped after {} checks; last success: {}; errors: {}",
            stats.check_count,
            stats
                .last_success_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "none".to_string()),
            stats.total_errors
        );
    }
}

pub fn format_status_report(stats: &MonitorStats, now: DateTime<Local>) -> String {
    let runtime = stats
        .runtime(now)
        .map(format_runtime)
        .unwrap_or_else(|| "시작 시간 미설정".to_string());
    let last_success = stats
        .last_success_at
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "없음".to_string());
    format!(
        "🤖 모니터링 정상 작동중\n⏰ 런타임: {}\n📊 총 체크 횟수: {}\n✅ 마지막 성공: {}\n❌ 에러 횟수: {}",
        runtime, stats.check_count, last_success, stats.error_count
    )
}
