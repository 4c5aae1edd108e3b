//! Central-role scan sessions
//!
//! A session starts once the adapter is powered on, runs for a fixed duration
//! and stops exactly once. Duplicate suppression is left to the platform.

use super::adapter::StateError;
use super::types::{AdapterState, ScanResult};
use crate::platform::{BlePlatform, ScanOptions};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_SCAN_DURATION_SECS: u64 = 15;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScannerError {
    #[error("Invalid scan configuration: {0}")]
    InvalidScanConfig(String),
    #[error("A scan session is already active")]
    AlreadyActive,
    #[error("Scan session cut short: adapter is {0}")]
    Interrupted(AdapterState),
    #[error(transparent)]
    State(#[from] StateError),
}

/// What counts as a match. A result matches when either criterion hits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanFilter {
    pub service_uuid: Option<Uuid>,
    pub name_marker: Option<String>,
}

impl ScanFilter {
    pub fn matches(&self, result: &ScanResult) -> bool {
        let by_service = self
            .service_uuid
            .is_some_and(|uuid| result.advertised_service_uuids.contains(&uuid));
        let by_name = match (&self.name_marker, &result.local_name) {
            (Some(marker), Some(name)) => name.contains(marker.as_str()),
            _ => false,
        };
        by_service || by_name
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub duration_secs: u64,
    pub filter: ScanFilter,
    pub allow_duplicates: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            duration_secs: DEFAULT_SCAN_DURATION_SECS,
            filter: ScanFilter::default(),
            allow_duplicates: false,
        }
    }
}

impl ScanConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn validate(&self) -> Result<(), ScannerError> {
        if self.duration_secs == 0 {
            return Err(ScannerError::InvalidScanConfig(
                "duration must be at least one second".to_string(),
            ));
        }
        if self
            .filter
            .name_marker
            .as_deref()
            .is_some_and(|marker| marker.is_empty())
        {
            return Err(ScannerError::InvalidScanConfig(
                "name marker must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// One surfaced discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub session: u64,
    pub result: ScanResult,
    pub matched: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScannerState {
    Idle,
    /// Session requested while the adapter was still settling
    AwaitingPower,
    Scanning,
    Finished,
}

pub struct CentralScanner {
    state: ScannerState,
    config: ScanConfig,
    session: u64,
    deadline: Option<Instant>,
    reported: u64,
    matched: u64,
}

impl CentralScanner {
    pub fn new() -> Self {
        Self {
            state: ScannerState::Idle,
            config: ScanConfig::default(),
            session: 0,
            deadline: None,
            reported: 0,
            matched: 0,
        }
    }

    pub fn state(&self) -> ScannerState {
        self.state
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            ScannerState::AwaitingPower | ScannerState::Scanning
        )
    }

    pub fn is_finished(&self) -> bool {
        self.state == ScannerState::Finished
    }

    /// Results surfaced in the current session as (reported, matched)
    pub fn counts(&self) -> (u64, u64) {
        (self.reported, self.matched)
    }

    /// Expiry of the running session, keyed by session number
    pub fn deadline(&self) -> Option<(u64, Instant)> {
        self.deadline.map(|at| (self.session, at))
    }

    /// Begin a session.
    ///
    /// `Unknown` and `Resetting` defer the start until the adapter settles;
    /// any other state but `PoweredOn` fails with [`StateError`].
    pub fn start(
        &mut self,
        config: ScanConfig,
        adapter: AdapterState,
        platform: &mut dyn BlePlatform,
    ) -> Result<(), ScannerError> {
        if self.is_active() {
            return Err(ScannerError::AlreadyActive);
        }
        config.validate()?;

        self.config = config;
        self.session += 1;
        self.reported = 0;
        self.matched = 0;

        if adapter.is_powered_on() {
            self.begin(platform);
            Ok(())
        } else if adapter.is_transient() {
            debug!("Scan session {} waiting for adapter ({})", self.session, adapter);
            self.state = ScannerState::AwaitingPower;
            Ok(())
        } else {
            self.state = ScannerState::Finished;
            Err(StateError(adapter).into())
        }
    }

    /// Follow an adapter state change. Losing power mid-session finishes the
    /// session and reports [`ScannerError::Interrupted`].
    pub fn on_adapter_state(
        &mut self,
        adapter: AdapterState,
        platform: &mut dyn BlePlatform,
    ) -> Result<(), ScannerError> {
        match self.state {
            ScannerState::AwaitingPower if adapter.is_powered_on() => {
                self.begin(platform);
                Ok(())
            }
            ScannerState::AwaitingPower if adapter.is_transient() => Ok(()),
            ScannerState::AwaitingPower => {
                self.state = ScannerState::Finished;
                Err(StateError(adapter).into())
            }
            ScannerState::Scanning if !adapter.is_powered_on() => {
                warn!(
                    "Scan session {} ended early: adapter is {}",
                    self.session, adapter
                );
                self.finish();
                Err(ScannerError::Interrupted(adapter))
            }
            _ => Ok(()),
        }
    }

    /// Surface a discovery. Results outside a running session, or past its
    /// deadline, are dropped.
    pub fn on_discovered(&mut self, result: ScanResult) -> Option<ScanReport> {
        if self.state != ScannerState::Scanning {
            debug!("Ignoring discovery of {} ({:?})", result.peer_address, self.state);
            return None;
        }
        if self.deadline.is_some_and(|at| Instant::now() >= at) {
            debug!("Ignoring discovery of {} after deadline", result.peer_address);
            return None;
        }

        let matched = self.config.filter.matches(&result);
        info!(
            "found device: {} {} {}",
            result.peer_address,
            result.rssi,
            result.local_name.as_deref().unwrap_or("")
        );
        if matched {
            info!("{} matches the scan filter", result.peer_address);
            self.matched += 1;
        }
        self.reported += 1;

        Some(ScanReport {
            session: self.session,
            result,
            matched,
        })
    }

    /// Handle expiry of `session`. Returns true only for the first timeout of
    /// the running session.
    pub fn on_timeout(&mut self, session: u64, platform: &mut dyn BlePlatform) -> bool {
        if self.state != ScannerState::Scanning || session != self.session {
            debug!("Stale scan timeout for session {}", session);
            return false;
        }
        info!(
            "Scan session {} finished: {} result(s), {} match(es)",
            session, self.reported, self.matched
        );
        platform.stop_scan();
        self.finish();
        true
    }

    /// Cancel the current session
    pub fn stop(&mut self, platform: &mut dyn BlePlatform) -> bool {
        match self.state {
            ScannerState::Scanning => {
                info!("Stopping scan session {}", self.session);
                platform.stop_scan();
                self.finish();
                true
            }
            ScannerState::AwaitingPower => {
                self.finish();
                true
            }
            ScannerState::Idle | ScannerState::Finished => false,
        }
    }

    fn begin(&mut self, platform: &mut dyn BlePlatform) {
        info!(
            "Scanning for {}s (session {}, duplicates {})",
            self.config.duration_secs,
            self.session,
            if self.config.allow_duplicates { "allowed" } else { "suppressed" }
        );
        platform.start_scan(&ScanOptions {
            allow_duplicates: self.config.allow_duplicates,
        });
        self.deadline = Some(Instant::now() + self.config.duration());
        self.state = ScannerState::Scanning;
    }

    fn finish(&mut self) {
        self.deadline = None;
        self.state = ScannerState::Finished;
    }
}

impl Default for CentralScanner {
    fn default() -> Self {
        Self::new()
    }
}
