//! Per-negotiation key state
//!
//! Each (re)negotiation runs on one of eight key-id slots and walks
//! `hardReset/softReset -> tls -> authenticating -> connected`. A key owns
//! its TLS engine and authenticator while negotiating and its data path
//! once connected; dropping the key scrubs all of it.

use std::time::{Duration, Instant};

use nimbusvpn_core::SessionConfig;
use nimbusvpn_protocol::{Authenticator, DataPath, KeyId, TlsLink};

/// Negotiation state of one key generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    /// Initial hard reset sent, waiting for the server's
    HardReset,
    /// Soft reset emitted, TLS not yet started
    SoftReset,
    /// TLS handshake in progress
    Tls,
    /// Key-material and credential exchange in progress
    Authenticating,
    /// Data keys derived; this generation can carry traffic
    Connected,
}

/// Control-channel sub-state within a negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    /// Before the auth blob has produced server randoms
    PreAuth,
    /// Server randoms seen; polling with PUSH_REQUEST
    PreIfConfig,
    /// Push reply applied
    Connected,
}

/// One generation of key material and negotiation state.
pub struct SessionKey {
    /// Key id (0-7); 0 is reserved for the initial hard reset
    pub id: KeyId,
    /// Negotiation state
    pub state: KeyState,
    /// Control-channel sub-state
    pub control_state: ControlState,
    /// When this negotiation started
    pub start_time: Instant,
    /// Whether this key was allocated by a soft reset
    pub is_soft: bool,
    /// TLS engine, alive from `tls` state onward
    pub tls: Option<TlsLink>,
    /// Authenticator, alive from `authenticating` onward
    pub auth: Option<Authenticator>,
    /// Data path, `None` until keys are derived
    pub data: Option<DataPath>,
}

impl SessionKey {
    /// Allocate a fresh negotiation key.
    pub fn new(id: KeyId, now: Instant, is_soft: bool) -> Self {
        Self {
            id,
            state: if is_soft {
                KeyState::SoftReset
            } else {
                KeyState::HardReset
            },
            control_state: ControlState::PreAuth,
            start_time: now,
            is_soft,
            tls: None,
            auth: None,
            data: None,
        }
    }

    /// Whether this key is still negotiating.
    pub fn is_negotiating(&self) -> bool {
        self.state != KeyState::Connected
    }

    /// Deadline for the current phase of this negotiation.
    ///
    /// The initial hard reset has its own (shorter) bound; soft resets use
    /// the configurable soft-negotiation bound.
    pub fn negotiation_deadline(&self, config: &SessionConfig) -> Duration {
        if self.is_soft {
            config.soft_negotiation_timeout
        } else if self.state == KeyState::HardReset {
            config.hard_reset_timeout
        } else {
            config.negotiation_timeout
        }
    }

    /// Whether the negotiation has exceeded its deadline.
    pub fn has_timed_out(&self, config: &SessionConfig, now: Instant) -> bool {
        self.is_negotiating()
            && now.duration_since(self.start_time) > self.negotiation_deadline(config)
    }
}
