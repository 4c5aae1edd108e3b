//! GATT service table management
//!
//! Registration is remove-all then add, so the platform never holds a partial
//! or mixed table. Only one registration may be in flight at a time.
//! Every `add_service` carries a generation number and only the answer
//! echoing the current one settles the registration.

use super::adapter::StateError;
use super::types::{AdapterState, Service};
use crate::platform::BlePlatform;
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Errors raised while defining or registering the service table
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error("Registration of service {0} already in flight")]
    RegistrationInFlight(Uuid),
    #[error("Invalid UUID: {0}")]
    InvalidUuid(String),
    #[error("Duplicate attribute UUID {0}")]
    DuplicateAttribute(Uuid),
    #[error("Service {0} has no characteristics")]
    EmptyService(Uuid),
    #[error("Platform rejected service: {0}")]
    Rejected(String),
}

/// Registration progress of the current service table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    /// `add_service` issued, waiting for the `ServiceAdded` with this generation
    Registering { service: Uuid, generation: u64 },
    Registered,
    Failed(String),
}

/// Owns the service table and its registration with the platform
pub struct GattServiceManager {
    service: Option<Service>,
    state: RegistrationState,
    generation: u64,
}

impl GattServiceManager {
    pub fn new() -> Self {
        Self {
            service: None,
            state: RegistrationState::Unregistered,
            generation: 0,
        }
    }

    pub fn state(&self) -> &RegistrationState {
        &self.state
    }

    pub fn is_registered(&self) -> bool {
        self.state == RegistrationState::Registered
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self.state, RegistrationState::Registering { .. })
    }

    /// Generation of the `add_service` awaiting an answer
    pub fn pending_generation(&self) -> Option<u64> {
        match self.state {
            RegistrationState::Registering { generation, .. } => Some(generation),
            _ => None,
        }
    }

    /// Last table passed to [`configure`](Self::configure), registered or not
    pub fn service(&self) -> Option<&Service> {
        self.service.as_ref()
    }

    /// The table requests may be routed against; `None` until registration succeeds
    pub fn registered_service(&self) -> Option<&Service> {
        if self.is_registered() {
            self.service.as_ref()
        } else {
            None
        }
    }

    /// Replace the platform's service table with `service`.
    ///
    /// The outcome arrives later through [`on_service_added`](Self::on_service_added).
    pub fn configure(
        &mut self,
        service: Service,
        adapter: AdapterState,
        platform: &mut dyn BlePlatform,
    ) -> Result<(), ServiceError> {
        if let RegistrationState::Registering {
            service: pending, ..
        } = self.state
        {
            warn!(
                "Rejecting registration of {}: {} still in flight",
                service.uuid, pending
            );
            return Err(ServiceError::RegistrationInFlight(pending));
        }

        if !adapter.is_powered_on() {
            return Err(StateError(adapter).into());
        }

        validate_service(&service)?;

        self.generation += 1;
        info!(
            "Registering service {} ({} characteristics, generation {})",
            service.uuid,
            service.characteristics.len(),
            self.generation
        );

        platform.remove_all_services();
        platform.add_service(&service, self.generation);

        self.state = RegistrationState::Registering {
            service: service.uuid,
            generation: self.generation,
        };
        self.service = Some(service);
        Ok(())
    }

    /// Handle the platform's answer to `add_service`.
    ///
    /// Returns `None` when the answer does not belong to the in-flight
    /// registration, including late answers to a superseded generation.
    pub fn on_service_added(
        &mut self,
        uuid: Uuid,
        generation: u64,
        result: Result<(), String>,
        platform: &mut dyn BlePlatform,
    ) -> Option<Result<(), ServiceError>> {
        match &self.state {
            RegistrationState::Registering {
                service,
                generation: pending,
            } if *service == uuid && *pending == generation => {}
            other => {
                warn!(
                    "Ignoring ServiceAdded for {} (generation {}) while {:?}",
                    uuid, generation, other
                );
                if result.is_ok() && *other == RegistrationState::Unregistered {
                    // Table was cleared while the add was in flight
                    platform.remove_all_services();
                }
                return None;
            }
        }

        match result {
            Ok(()) => {
                info!("Service {} registered", uuid);
                self.state = RegistrationState::Registered;
                Some(Ok(()))
            }
            Err(reason) => {
                error!("Service {} registration failed: {}", uuid, reason);
                self.state = RegistrationState::Failed(reason.clone());
                Some(Err(ServiceError::Rejected(reason)))
            }
        }
    }

    /// The adapter dropped its tables; keep the definition for re-registration.
    /// An answer still in flight is stale from here on.
    pub fn on_power_lost(&mut self) {
        if self.state != RegistrationState::Unregistered {
            debug!("Service table dropped with adapter power");
            self.state = RegistrationState::Unregistered;
        }
    }

    /// Deregister everything; idempotent
    pub fn clear(&mut self, platform: &mut dyn BlePlatform) {
        if self.state == RegistrationState::Unregistered {
            return;
        }
        info!("Deregistering services");
        platform.remove_all_services();
        self.state = RegistrationState::Unregistered;
    }
}

impl Default for GattServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Reject tables the platform would refuse or that would make routing ambiguous
pub fn validate_service(service: &Service) -> Result<(), ServiceError> {
    if service.uuid.is_nil() {
        return Err(ServiceError::InvalidUuid(service.uuid.to_string()));
    }
    if service.characteristics.is_empty() {
        return Err(ServiceError::EmptyService(service.uuid));
    }

    let mut seen = HashSet::new();
    seen.insert(service.uuid);
    for characteristic in &service.characteristics {
        if characteristic.uuid.is_nil() {
            return Err(ServiceError::InvalidUuid(characteristic.uuid.to_string()));
        }
        if !seen.insert(characteristic.uuid) {
            return Err(ServiceError::DuplicateAttribute(characteristic.uuid));
        }
    }
    Ok(())
}
