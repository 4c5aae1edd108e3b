//! Adapter power-state machine
//!
//! The platform is authoritative: every reported state is applied and forwarded
//! to listeners, even when it repeats the current one or arrives as an
//! unexpected transition. Unexpected transitions are only logged.

use super::types::{AdapterState, Readiness};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Adapter is in a state incompatible with the requested operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Adapter is {0}")]
pub struct StateError(pub AdapterState);

impl StateError {
    pub fn is_fatal(&self) -> bool {
        self.0.is_fatal()
    }
}

/// Callback receiving every adapter state, in order
pub type StateListener = Box<dyn FnMut(AdapterState) + Send>;

/// A single applied state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub previous: AdapterState,
    pub current: AdapterState,
}

impl Transition {
    /// Radio went away; anything registered with the platform is gone
    pub fn lost_power(&self) -> bool {
        self.previous.is_powered_on() && !self.current.is_powered_on()
    }

    pub fn gained_power(&self) -> bool {
        !self.previous.is_powered_on() && self.current.is_powered_on()
    }

    pub fn readiness(&self) -> Readiness {
        self.current.readiness()
    }
}

/// Tracks the adapter state and fans out transitions
pub struct AdapterStateMachine {
    state: AdapterState,
    listeners: Vec<StateListener>,
    transitions: u64,
}

impl AdapterStateMachine {
    pub fn new() -> Self {
        Self {
            state: AdapterState::Unknown,
            listeners: Vec::new(),
            transitions: 0,
        }
    }

    pub fn state(&self) -> AdapterState {
        self.state
    }

    pub fn is_powered_on(&self) -> bool {
        self.state.is_powered_on()
    }

    /// Number of states applied since creation
    pub fn transition_count(&self) -> u64 {
        self.transitions
    }

    /// Register a listener. It is called immediately with the current state,
    /// then once per applied state.
    pub fn add_listener(&mut self, mut listener: StateListener) {
        listener(self.state);
        self.listeners.push(listener);
    }

    /// Fail with [`StateError`] unless the adapter is powered on
    pub fn require_powered_on(&self) -> Result<(), StateError> {
        if self.state.is_powered_on() {
            Ok(())
        } else {
            Err(StateError(self.state))
        }
    }

    /// Apply a state reported by the platform
    pub fn apply(&mut self, next: AdapterState) -> Transition {
        let previous = self.state;

        if !is_expected_transition(previous, next) {
            warn!("Unexpected adapter transition {} -> {}", previous, next);
        }

        self.state = next;
        self.transitions += 1;

        if previous == next {
            debug!("Adapter state repeated: {}", next);
        } else {
            info!("Adapter state {} -> {}", previous, next);
        }

        for listener in self.listeners.iter_mut() {
            listener(next);
        }

        Transition {
            previous,
            current: next,
        }
    }
}

impl Default for AdapterStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

fn is_expected_transition(from: AdapterState, to: AdapterState) -> bool {
    use AdapterState::*;

    match (from, to) {
        _ if from == to => true,
        (Unknown, _) => true,
        (PoweredOff, PoweredOn) | (PoweredOn, PoweredOff) => true,
        (Resetting, Unknown) => true,
        // A platform service restart can begin from any live state
        (PoweredOff | PoweredOn, Resetting) => true,
        _ => false,
    }
}
