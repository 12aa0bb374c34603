//! Station supervisor
//!
//! One loop per station: poll the schedule, stop captures whose session has
//! ended, start the capture for the session on air, sleep, repeat. Only the
//! sleeps and the schedule fetch observe cancellation; a start or stop in
//! progress always runs to completion, and captures left when the loop ends
//! are finalized before the task returns.

use super::capture::{start_capture, stop_capture, StartOutcome};
use super::context::{RecorderContext, RecorderEvent};
use crate::schedule::{parse_utc_offset, RecordingKey, ScheduleResolver, Station, WeeklySchedule};
use crate::utils::retry::exponential_delay;
use crate::utils::RecorderResult;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Why a station loop ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StationExit {
    /// Shutdown requested
    Cancelled,
    /// Station was deactivated or removed
    Inactive,
    /// Too many consecutive errors; needs an external restart
    Failed {
        consecutive_errors: u32,
        last_error: String,
    },
}

enum Tick {
    Idle,
    Capturing,
    Stopped,
    Inactive,
    Cancelled,
}

/// Supervises the captures of one station
pub struct StationSupervisor {
    ctx: RecorderContext,
    station_id: String,
    resolver: ScheduleResolver,
    token: CancellationToken,
    /// Keys already started (or failed to start) by this loop
    attempted: HashSet<RecordingKey>,
}

impl StationSupervisor {
    pub fn new(ctx: RecorderContext, station: &Station, token: CancellationToken) -> Self {
        let tz = match station.timezone.as_deref() {
            Some(tz) => parse_utc_offset(tz).unwrap_or_else(|e| {
                tracing::warn!(
                    "Station {} has an invalid timezone ({}), using {}",
                    station.id,
                    e,
                    ctx.settings.timezone
                );
                ctx.settings.timezone
            }),
            None => ctx.settings.timezone,
        };

        Self {
            station_id: station.id.clone(),
            resolver: ScheduleResolver::new(tz),
            ctx,
            token,
            attempted: HashSet::new(),
        }
    }

    pub fn station_id(&self) -> &str {
        &self.station_id
    }

    /// Run until cancelled, deactivated or failed
    pub async fn run(mut self) -> StationExit {
        tracing::info!(
            "Station supervisor started for {} ({})",
            self.station_id,
            self.resolver.timezone()
        );

        let settings = self.ctx.settings.clone();
        let mut consecutive_errors = 0u32;

        let exit = loop {
            let delay = match self.tick().await {
                Ok(Tick::Cancelled) => break StationExit::Cancelled,
                Ok(Tick::Inactive) => {
                    tracing::info!("Station {} is inactive or removed", self.station_id);
                    break StationExit::Inactive;
                }
                Ok(Tick::Stopped) => {
                    consecutive_errors = 0;
                    settings.post_stop_grace
                }
                Ok(Tick::Idle) | Ok(Tick::Capturing) => {
                    consecutive_errors = 0;
                    settings.check_interval
                }
                Err(err) => {
                    consecutive_errors += 1;
                    tracing::error!(
                        "Station {} loop error ({}/{}) [{}]: {}",
                        self.station_id,
                        consecutive_errors,
                        settings.max_consecutive_errors,
                        err.code(),
                        err
                    );

                    if consecutive_errors >= settings.max_consecutive_errors {
                        tracing::error!(
                            "Station {} hit {} consecutive errors, supervisor giving up",
                            self.station_id,
                            consecutive_errors
                        );
                        break StationExit::Failed {
                            consecutive_errors,
                            last_error: err.to_string(),
                        };
                    }

                    exponential_delay(settings.check_interval, consecutive_errors, settings.error_backoff_cap)
                }
            };

            if !self.pause(delay).await {
                break StationExit::Cancelled;
            }
        };

        self.drain().await;

        tracing::info!("Station supervisor for {} exited: {:?}", self.station_id, exit);
        self.ctx.emit(RecorderEvent::StationExited {
            station_id: self.station_id.clone(),
            exit: exit.clone(),
        });
        exit
    }

    async fn tick(&mut self) -> RecorderResult<Tick> {
        let fetched = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Ok(Tick::Cancelled),
            fetched = self.fetch() => fetched?,
        };
        let Some((station, schedule)) = fetched else {
            return Ok(Tick::Inactive);
        };

        let now = Utc::now();
        let mut stopped = false;

        for capture in self.ctx.registry.for_station(&self.station_id) {
            if capture.session.should_stop(now) {
                tracing::info!("Session for {} ended", capture.key);
                stopped |= stop_capture(&self.ctx, &capture.key).await.is_some();
            }
        }

        if self.token.is_cancelled() {
            return Ok(Tick::Cancelled);
        }

        if let Some(active) = self.resolver.current_session(&schedule, now) {
            let key = active.key(&self.station_id);
            if active.should_start(now)
                && self.ctx.registry.is_open()
                && !self.ctx.registry.contains(&key)
                && !self.attempted.contains(&key)
            {
                self.attempted.insert(key.clone());
                self.forget_old_attempts(now);

                if let StartOutcome::Failed { error, .. } = start_capture(&self.ctx, &station, &active).await? {
                    tracing::warn!("Not retrying {} this session: {}", key, error);
                }
            }
        }

        if stopped {
            Ok(Tick::Stopped)
        } else if self.ctx.registry.keys_for_station(&self.station_id).is_empty() {
            Ok(Tick::Idle)
        } else {
            Ok(Tick::Capturing)
        }
    }

    /// Current station and schedule, or `None` if the station should not be recorded
    async fn fetch(&self) -> RecorderResult<Option<(Station, WeeklySchedule)>> {
        let station = match self.ctx.stations.get_station(&self.station_id).await? {
            Some(station) if station.is_active => station,
            _ => return Ok(None),
        };
        let schedule = self
            .ctx
            .schedules
            .get_schedule(&self.station_id)
            .await?
            .unwrap_or_default();
        Ok(Some((station, schedule)))
    }

    /// Sleep for `duration`; false if cancelled first
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Finalize every capture this station still owns
    async fn drain(&self) {
        let keys = self.ctx.registry.keys_for_station(&self.station_id);
        if keys.is_empty() {
            return;
        }

        tracing::info!(
            "Station {} finalizing {} capture(s) before exit",
            self.station_id,
            keys.len()
        );
        for key in keys {
            stop_capture(&self.ctx, &key).await;
        }
    }

    fn forget_old_attempts(&mut self, now: chrono::DateTime<Utc>) {
        let cutoff = self.resolver.local_date(now) - ChronoDuration::days(2);
        self.attempted.retain(|key| key.session_date >= cutoff);
    }
}
