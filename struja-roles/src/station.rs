//! Charge-point local state
//!
//! Tracks what a simulated charging station knows about itself:
//! - Registration lifecycle (BootNotification → registered)
//! - Heartbeat cadence adopted from the boot response
//! - Per-EVSE connector status and the active transaction
//! - Charging-profile stack and the resulting power limit
//! - Variable store for GetVariables/SetVariables
//! - Authorization cache

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::types::*;

/// Where the station is in its registration lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// No BootNotification answered yet
    Idle,
    /// Central system answered Pending, retry later
    Pending,
    /// Registered with the central system
    Registered,
    /// Registration rejected
    Rejected,
}

/// Active transaction on one EVSE
#[derive(Debug, Clone)]
pub struct ActiveTransaction {
    pub transaction_id: String,
    pub id_token: String,
    pub remote_start_id: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub seq_no: i32,
}

/// One EVSE with its connector
#[derive(Debug, Clone)]
pub struct EvseState {
    pub evse_id: i32,
    pub connector_id: i32,
    pub status: ConnectorStatus,
    pub transaction: Option<ActiveTransaction>,
    pub charging_profiles: Vec<ChargingProfile>,
}

impl EvseState {
    pub fn new(evse_id: i32, connector_id: i32) -> Self {
        Self {
            evse_id,
            connector_id,
            status: ConnectorStatus::Available,
            transaction: None,
            charging_profiles: Vec::new(),
        }
    }

    /// Active power limit from the highest stack-level profile, in kW.
    pub fn active_power_limit_kw(&self) -> Option<f64> {
        let profile = self.charging_profiles.iter().max_by_key(|p| p.stack_level)?;

        profile
            .charging_schedule
            .first()
            .and_then(|schedule| schedule.charging_schedule_period.first())
            .map(|period| match profile.charging_schedule[0].charging_rate_unit {
                ChargingRateUnit::W => period.limit / 1000.0,
                // 3-phase estimate at 230V
                ChargingRateUnit::A => period.limit * 230.0 * 3.0 / 1000.0,
            })
    }
}

/// The simulated station
#[derive(Debug)]
pub struct StationState {
    pub station_id: String,
    pub vendor: String,
    pub model: String,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,

    pub registration: RegistrationState,
    pub registered_at: Option<DateTime<Utc>>,
    pub heartbeat_interval: i32,
    pub last_heartbeat: Option<DateTime<Utc>>,

    pub evses: HashMap<i32, EvseState>,

    // (component, variable) -> value
    variables: HashMap<(String, String), String>,
    // Locally cached authorization tokens
    auth_cache: Vec<String>,
}

impl StationState {
    pub fn new(
        station_id: impl Into<String>,
        vendor: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            station_id: station_id.into(),
            vendor: vendor.into(),
            model: model.into(),
            serial_number: None,
            firmware_version: None,
            registration: RegistrationState::Idle,
            registered_at: None,
            heartbeat_interval: 300,
            last_heartbeat: None,
            evses: HashMap::new(),
            variables: HashMap::new(),
            auth_cache: Vec::new(),
        }
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = Some(serial.into());
        self
    }

    pub fn with_firmware(mut self, version: impl Into<String>) -> Self {
        self.firmware_version = Some(version.into());
        self
    }

    pub fn add_evse(&mut self, evse_id: i32, connector_id: i32) {
        self.evses
            .insert(evse_id, EvseState::new(evse_id, connector_id));
    }

    /// Station identity for a BootNotification request.
    pub fn charging_station_info(&self) -> ChargingStationInfo {
        ChargingStationInfo {
            model: self.model.clone(),
            vendor_name: self.vendor.clone(),
            serial_number: self.serial_number.clone(),
            firmware_version: self.firmware_version.clone(),
        }
    }

    /// Fold a BootNotification response into the lifecycle.
    pub fn apply_boot_response(&mut self, response: &BootNotificationResponse) {
        self.heartbeat_interval = response.interval;
        match response.status {
            RegistrationStatus::Accepted => {
                self.registration = RegistrationState::Registered;
                self.registered_at = Some(Utc::now());
                info!(
                    interval = response.interval,
                    "registered with central system"
                );
            }
            RegistrationStatus::Pending => {
                self.registration = RegistrationState::Pending;
                info!(interval = response.interval, "registration pending");
            }
            RegistrationStatus::Rejected => {
                self.registration = RegistrationState::Rejected;
                warn!("registration rejected by central system");
            }
        }
    }

    pub fn record_heartbeat(&mut self) {
        self.last_heartbeat = Some(Utc::now());
    }

    pub fn heartbeat_due(&self) -> bool {
        if self.registration != RegistrationState::Registered {
            return false;
        }
        match self.last_heartbeat {
            None => true,
            Some(last) => {
                let elapsed = Utc::now().signed_duration_since(last);
                elapsed.num_seconds() >= self.heartbeat_interval as i64
            }
        }
    }

    /// Remember a token the central system accepted.
    pub fn cache_token(&mut self, id_token: impl Into<String>) {
        let token = id_token.into();
        if !self.auth_cache.contains(&token) {
            self.auth_cache.push(token);
        }
    }

    pub fn cached_tokens(&self) -> &[String] {
        &self.auth_cache
    }

    /// ClearCache handler path.
    pub fn clear_auth_cache(&mut self) -> GenericStatus {
        debug!(cleared = self.auth_cache.len(), "clearing authorization cache");
        self.auth_cache.clear();
        GenericStatus::Accepted
    }

    /// RequestStartTransaction handler path.
    pub fn start_transaction(
        &mut self,
        evse_id: Option<i32>,
        id_token: String,
        remote_start_id: i32,
    ) -> (GenericStatus, Option<String>) {
        let evse_id = evse_id.or_else(|| {
            self.evses
                .iter()
                .find(|(_, e)| e.status == ConnectorStatus::Available && e.transaction.is_none())
                .map(|(id, _)| *id)
        });

        if let Some(evse_id) = evse_id {
            if let Some(evse) = self.evses.get_mut(&evse_id) {
                if evse.transaction.is_some() {
                    return (GenericStatus::Rejected, None);
                }

                let transaction_id = uuid::Uuid::new_v4().to_string()[..8].to_string();

                evse.transaction = Some(ActiveTransaction {
                    transaction_id: transaction_id.clone(),
                    id_token: id_token.clone(),
                    remote_start_id: Some(remote_start_id),
                    started_at: Utc::now(),
                    seq_no: 0,
                });
                evse.status = ConnectorStatus::Occupied;

                info!(
                    transaction_id = %transaction_id,
                    evse_id,
                    id_token = %id_token,
                    "transaction started"
                );

                return (GenericStatus::Accepted, Some(transaction_id));
            }
        }

        (GenericStatus::Rejected, None)
    }

    /// RequestStopTransaction handler path.
    pub fn stop_transaction(&mut self, transaction_id: &str) -> GenericStatus {
        for evse in self.evses.values_mut() {
            if let Some(ref tx) = evse.transaction {
                if tx.transaction_id == transaction_id {
                    info!(transaction_id, evse_id = evse.evse_id, "transaction stopped");
                    evse.transaction = None;
                    evse.status = ConnectorStatus::Available;
                    return GenericStatus::Accepted;
                }
            }
        }

        warn!(transaction_id, "transaction not found");
        GenericStatus::Rejected
    }

    /// Bump and return the TransactionEvent sequence number for `transaction_id`.
    pub fn next_seq_no(&mut self, transaction_id: &str) -> Option<i32> {
        for evse in self.evses.values_mut() {
            if let Some(ref mut tx) = evse.transaction {
                if tx.transaction_id == transaction_id {
                    tx.seq_no += 1;
                    return Some(tx.seq_no);
                }
            }
        }
        None
    }

    /// SetChargingProfile handler path. `evse_id` 0 applies everywhere.
    pub fn set_charging_profile(&mut self, evse_id: i32, profile: ChargingProfile) -> GenericStatus {
        if let Some(evse) = self.evses.get_mut(&evse_id) {
            evse.charging_profiles.retain(|p| p.id != profile.id);
            evse.charging_profiles.push(profile.clone());

            info!(
                profile_id = profile.id,
                evse_id,
                limit_kw = ?evse.active_power_limit_kw(),
                "charging profile set"
            );

            GenericStatus::Accepted
        } else if evse_id == 0 {
            for evse in self.evses.values_mut() {
                evse.charging_profiles.retain(|p| p.id != profile.id);
                evse.charging_profiles.push(profile.clone());
            }
            info!(profile_id = profile.id, "charging profile set on all EVSEs");
            GenericStatus::Accepted
        } else {
            warn!(evse_id, "unknown EVSE");
            GenericStatus::Rejected
        }
    }

    /// Reset handler path: drops transactions and starts over.
    pub fn reset(&mut self, reset_type: ResetType) -> ResetStatus {
        let busy = self.evses.values().any(|e| e.transaction.is_some());
        if busy && reset_type == ResetType::OnIdle {
            info!("reset scheduled for idle");
            return ResetStatus::Scheduled;
        }

        for evse in self.evses.values_mut() {
            evse.transaction = None;
            evse.charging_profiles.clear();
            evse.status = ConnectorStatus::Available;
        }
        self.registration = RegistrationState::Idle;
        self.registered_at = None;
        self.last_heartbeat = None;
        info!(?reset_type, "station reset");
        ResetStatus::Accepted
    }

    pub fn get_variable(&self, component: &str, variable: &str) -> Option<&String> {
        self.variables
            .get(&(component.to_string(), variable.to_string()))
    }

    pub fn set_variable(&mut self, component: &str, variable: &str, value: String) {
        debug!(component, variable, value = %value, "variable set");
        self.variables
            .insert((component.to_string(), variable.to_string()), value);
    }

    pub fn evse_statuses(&self) -> Vec<(i32, i32, ConnectorStatus)> {
        self.evses
            .values()
            .map(|e| (e.evse_id, e.connector_id, e.status))
            .collect()
    }
}
