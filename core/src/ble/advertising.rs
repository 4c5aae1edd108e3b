//! Advertising lifecycle
//!
//! A start request is remembered as an explicit state until both preconditions
//! (adapter powered on, service registered) hold, then advertising starts once.

use crate::platform::{AdvertisementData, BlePlatform};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{debug, error, info};

/// Platform refused to start advertising after a successful registration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdvertiseError {
    #[error("Platform rejected advertising: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvertisingState {
    /// No start requested
    Idle,
    /// Start requested, adapter not powered on
    AwaitingPower,
    /// Start requested, powered on, service table not registered yet
    AwaitingRegistration,
    /// `start_advertising` issued to the platform
    Advertising,
    /// Explicitly stopped
    Stopped,
}

impl fmt::Display for AdvertisingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdvertisingState::Idle => write!(f, "Idle"),
            AdvertisingState::AwaitingPower => write!(f, "AwaitingPower"),
            AdvertisingState::AwaitingRegistration => write!(f, "AwaitingRegistration"),
            AdvertisingState::Advertising => write!(f, "Advertising"),
            AdvertisingState::Stopped => write!(f, "Stopped"),
        }
    }
}

pub struct AdvertisingController {
    state: AdvertisingState,
    payload: AdvertisementData,
    confirmed: bool,
    starts: u64,
}

impl AdvertisingController {
    pub fn new(payload: AdvertisementData) -> Self {
        Self {
            state: AdvertisingState::Idle,
            payload,
            confirmed: false,
            starts: 0,
        }
    }

    pub fn state(&self) -> AdvertisingState {
        self.state
    }

    pub fn payload(&self) -> &AdvertisementData {
        &self.payload
    }

    pub fn is_advertising(&self) -> bool {
        self.state == AdvertisingState::Advertising
    }

    /// Platform acknowledged the current advertising session
    pub fn is_confirmed(&self) -> bool {
        self.is_advertising() && self.confirmed
    }

    pub fn is_pending(&self) -> bool {
        matches!(
            self.state,
            AdvertisingState::AwaitingPower | AdvertisingState::AwaitingRegistration
        )
    }

    /// Number of times `start_advertising` was issued
    pub fn start_count(&self) -> u64 {
        self.starts
    }

    /// Ask for advertising. Safe to call at any time.
    pub fn request_start(&mut self, powered: bool, registered: bool, platform: &mut dyn BlePlatform) {
        match self.state {
            AdvertisingState::Idle | AdvertisingState::Stopped => {
                self.state = AdvertisingState::AwaitingPower;
                self.evaluate(powered, registered, platform);
            }
            other => debug!("Advertising start already requested ({})", other),
        }
    }

    /// Re-check preconditions after an adapter or registration change
    pub fn on_conditions_changed(
        &mut self,
        powered: bool,
        registered: bool,
        platform: &mut dyn BlePlatform,
    ) {
        match self.state {
            AdvertisingState::Advertising if !powered || !registered => {
                // The platform stops broadcasting on its own when it loses power
                // or its tables; keep the request so it resumes later.
                info!("Advertising suspended (powered: {}, registered: {})", powered, registered);
                self.confirmed = false;
                self.state = if powered {
                    AdvertisingState::AwaitingRegistration
                } else {
                    AdvertisingState::AwaitingPower
                };
            }
            AdvertisingState::AwaitingPower | AdvertisingState::AwaitingRegistration => {
                self.evaluate(powered, registered, platform);
            }
            _ => {}
        }
    }

    /// Handle the platform's answer to `start_advertising`
    pub fn on_started(&mut self, result: Result<(), String>) -> Result<(), AdvertiseError> {
        if self.state != AdvertisingState::Advertising {
            debug!("Ignoring advertising result while {}", self.state);
            return Ok(());
        }

        match result {
            Ok(()) => {
                info!(
                    "Advertising as '{}' with {} service UUID(s)",
                    self.payload.local_name,
                    self.payload.service_uuids.len()
                );
                self.confirmed = true;
                Ok(())
            }
            Err(reason) => {
                error!("Advertising failed to start: {}", reason);
                // No automatic retry; a new request is needed
                self.state = AdvertisingState::Idle;
                self.confirmed = false;
                Err(AdvertiseError::Rejected(reason))
            }
        }
    }

    /// Halt advertising and cancel any pending request. Returns whether
    /// anything changed; a second call is a no-op.
    pub fn stop(&mut self, platform: &mut dyn BlePlatform) -> bool {
        match self.state {
            AdvertisingState::Idle | AdvertisingState::Stopped => false,
            AdvertisingState::Advertising => {
                info!("Stopping advertising");
                platform.stop_advertising();
                self.confirmed = false;
                self.state = AdvertisingState::Stopped;
                true
            }
            AdvertisingState::AwaitingPower | AdvertisingState::AwaitingRegistration => {
                debug!("Cancelling pending advertising request");
                self.state = AdvertisingState::Stopped;
                true
            }
        }
    }

    fn evaluate(&mut self, powered: bool, registered: bool, platform: &mut dyn BlePlatform) {
        if !powered {
            self.state = AdvertisingState::AwaitingPower;
        } else if !registered {
            self.state = AdvertisingState::AwaitingRegistration;
        } else {
            platform.start_advertising(&self.payload);
            self.starts += 1;
            self.confirmed = false;
            self.state = AdvertisingState::Advertising;
        }
    }
}
