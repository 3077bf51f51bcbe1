//! Central-system role
//!
//! The registry answers charge-point-initiated actions with the fixed
//! verdicts a simulated CSMS gives (configurable interval and
//! registration status), keeping a small ledger of what it has seen.
//! The [`CentralSystem`] wrapper issues CSMS-side requests as typed
//! calls.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info};

use struja_rpc::{ActionHandler, HandlerError, RoleRegistry, Session};

use crate::action::Action;
use crate::charge_point::VENDOR_ID;
use crate::types::*;
use crate::RoleError;

/// Verdicts the simulated CSMS hands out.
#[derive(Debug, Clone)]
pub struct CentralSystemConfig {
    /// Heartbeat interval returned in BootNotification responses.
    pub heartbeat_interval: i32,
    /// Registration verdict for booting stations.
    pub registration: RegistrationStatus,
    /// Authorization verdict for presented tokens.
    pub authorization: AuthorizationStatus,
}

impl Default for CentralSystemConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: 10,
            registration: RegistrationStatus::Accepted,
            authorization: AuthorizationStatus::Accepted,
        }
    }
}

/// What the CSMS has observed from its charge points.
#[derive(Debug, Default)]
pub struct CsmsLedger {
    pub boots: Vec<BootNotificationRequest>,
    pub heartbeats: u64,
    pub authorized_tokens: Vec<String>,
    pub connector_statuses: Vec<(i32, i32, ConnectorStatus)>,
    pub meter_values_received: u64,
    /// transaction id -> last seen event kind
    pub transactions: HashMap<String, TransactionEventType>,
}

pub type SharedLedger = Arc<RwLock<CsmsLedger>>;

// ============================================================================
// Registry
// ============================================================================

/// Handlers for the actions a central system answers.
pub struct CentralSystemRegistry {
    handlers: HashMap<Action, Box<dyn ActionHandler>>,
    ledger: SharedLedger,
}

impl CentralSystemRegistry {
    pub fn new(config: CentralSystemConfig) -> Self {
        let ledger: SharedLedger = Arc::new(RwLock::new(CsmsLedger::default()));
        let config = Arc::new(config);

        let mut handlers: HashMap<Action, Box<dyn ActionHandler>> = HashMap::new();
        handlers.insert(
            Action::BootNotification,
            Box::new(OnBoot {
                config: config.clone(),
                ledger: ledger.clone(),
            }),
        );
        handlers.insert(
            Action::Heartbeat,
            Box::new(OnHeartbeat {
                ledger: ledger.clone(),
            }),
        );
        handlers.insert(
            Action::Authorize,
            Box::new(OnAuthorize {
                config,
                ledger: ledger.clone(),
            }),
        );
        handlers.insert(
            Action::StatusNotification,
            Box::new(OnStatusNotification {
                ledger: ledger.clone(),
            }),
        );
        handlers.insert(
            Action::MeterValues,
            Box::new(OnMeterValues {
                ledger: ledger.clone(),
            }),
        );
        handlers.insert(
            Action::TransactionEvent,
            Box::new(OnTransactionEvent {
                ledger: ledger.clone(),
            }),
        );
        handlers.insert(
            Action::FirmwareStatusNotification,
            Box::new(OnFirmwareStatus),
        );
        handlers.insert(Action::DataTransfer, Box::new(OnDataTransfer));

        Self { handlers, ledger }
    }

    /// Everything this CSMS has seen so far.
    pub fn ledger(&self) -> SharedLedger {
        self.ledger.clone()
    }
}

impl Default for CentralSystemRegistry {
    fn default() -> Self {
        Self::new(CentralSystemConfig::default())
    }
}

#[async_trait]
impl RoleRegistry for CentralSystemRegistry {
    fn role(&self) -> &'static str {
        "central-system"
    }

    fn issues(&self, action: &str) -> bool {
        action
            .parse::<Action>()
            .map(|a| Action::CENTRAL_SYSTEM_ISSUED.contains(&a))
            .unwrap_or(false)
    }

    fn receives(&self, action: &str) -> bool {
        action
            .parse::<Action>()
            .map(|a| self.handlers.contains_key(&a))
            .unwrap_or(false)
    }

    async fn handle(&self, action: &str, payload: Value) -> Result<Value, HandlerError> {
        let action: Action = action
            .parse()
            .map_err(|e: crate::action::UnknownAction| HandlerError::Internal(e.to_string()))?;
        match self.handlers.get(&action) {
            Some(handler) => handler.invoke(payload).await,
            None => Err(HandlerError::Internal(format!(
                "no handler mapped for {}",
                action
            ))),
        }
    }
}

struct OnBoot {
    config: Arc<CentralSystemConfig>,
    ledger: SharedLedger,
}

#[async_trait]
impl ActionHandler for OnBoot {
    async fn invoke(&self, payload: Value) -> Result<Value, HandlerError> {
        let req: BootNotificationRequest = serde_json::from_value(payload)?;
        info!(
            vendor = %req.charging_station.vendor_name,
            model = %req.charging_station.model,
            reason = ?req.reason,
            "charge point booting"
        );
        self.ledger.write().boots.push(req);

        Ok(serde_json::to_value(BootNotificationResponse {
            current_time: Utc::now(),
            interval: self.config.heartbeat_interval,
            status: self.config.registration,
            status_info: None,
        })?)
    }
}

struct OnHeartbeat {
    ledger: SharedLedger,
}

#[async_trait]
impl ActionHandler for OnHeartbeat {
    async fn invoke(&self, payload: Value) -> Result<Value, HandlerError> {
        let _req: HeartbeatRequest = serde_json::from_value(payload)?;
        self.ledger.write().heartbeats += 1;
        Ok(serde_json::to_value(HeartbeatResponse {
            current_time: Utc::now(),
        })?)
    }
}

struct OnAuthorize {
    config: Arc<CentralSystemConfig>,
    ledger: SharedLedger,
}

#[async_trait]
impl ActionHandler for OnAuthorize {
    async fn invoke(&self, payload: Value) -> Result<Value, HandlerError> {
        let req: AuthorizeRequest = serde_json::from_value(payload)?;
        debug!(token = %req.id_token.id_token, "authorize request");
        if self.config.authorization == AuthorizationStatus::Accepted {
            self.ledger
                .write()
                .authorized_tokens
                .push(req.id_token.id_token);
        }
        Ok(serde_json::to_value(AuthorizeResponse {
            id_token_info: IdTokenInfo {
                status: self.config.authorization,
                cache_expiry_date_time: None,
            },
        })?)
    }
}

struct OnStatusNotification {
    ledger: SharedLedger,
}

#[async_trait]
impl ActionHandler for OnStatusNotification {
    async fn invoke(&self, payload: Value) -> Result<Value, HandlerError> {
        let req: StatusNotificationRequest = serde_json::from_value(payload)?;
        self.ledger.write().connector_statuses.push((
            req.evse_id,
            req.connector_id,
            req.connector_status,
        ));
        Ok(serde_json::to_value(StatusNotificationResponse {})?)
    }
}

struct OnMeterValues {
    ledger: SharedLedger,
}

#[async_trait]
impl ActionHandler for OnMeterValues {
    async fn invoke(&self, payload: Value) -> Result<Value, HandlerError> {
        let req: MeterValuesRequest = serde_json::from_value(payload)?;
        debug!(
            evse_id = req.evse_id,
            samples = req.meter_value.len(),
            "meter values"
        );
        self.ledger.write().meter_values_received += 1;
        Ok(serde_json::to_value(MeterValuesResponse {})?)
    }
}

struct OnTransactionEvent {
    ledger: SharedLedger,
}

#[async_trait]
impl ActionHandler for OnTransactionEvent {
    async fn invoke(&self, payload: Value) -> Result<Value, HandlerError> {
        let req: TransactionEventRequest = serde_json::from_value(payload)?;
        info!(
            transaction_id = %req.transaction_info.transaction_id,
            event = ?req.event_type,
            seq_no = req.seq_no,
            "transaction event"
        );
        self.ledger.write().transactions.insert(
            req.transaction_info.transaction_id.clone(),
            req.event_type,
        );

        // Echo an authorization verdict when a token is attached.
        let id_token_info = req.id_token.map(|_| IdTokenInfo {
            status: AuthorizationStatus::Accepted,
            cache_expiry_date_time: None,
        });
        Ok(serde_json::to_value(TransactionEventResponse {
            total_cost: None,
            id_token_info,
        })?)
    }
}

struct OnFirmwareStatus;

#[async_trait]
impl ActionHandler for OnFirmwareStatus {
    async fn invoke(&self, payload: Value) -> Result<Value, HandlerError> {
        let req: FirmwareStatusNotificationRequest = serde_json::from_value(payload)?;
        debug!(status = ?req.status, "firmware status");
        Ok(serde_json::to_value(FirmwareStatusNotificationResponse {})?)
    }
}

struct OnDataTransfer;

#[async_trait]
impl ActionHandler for OnDataTransfer {
    async fn invoke(&self, payload: Value) -> Result<Value, HandlerError> {
        let req: DataTransferRequest = serde_json::from_value(payload)?;
        let response = if req.vendor_id == VENDOR_ID {
            DataTransferResponse {
                status: DataTransferStatus::Accepted,
                data: req.data,
            }
        } else {
            DataTransferResponse {
                status: DataTransferStatus::UnknownVendorId,
                data: None,
            }
        };
        Ok(serde_json::to_value(response)?)
    }
}

// ============================================================================
// Issuing wrapper
// ============================================================================

/// Typed veneer over [`Session::call`] for the requests a central
/// system issues towards one connected charge point.
pub struct CentralSystem {
    session: Session,
}

impl CentralSystem {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    async fn call<Req, Resp>(&self, action: Action, request: Req) -> Result<Resp, RoleError>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        let payload = serde_json::to_value(request)?;
        let result = self.session.call(action.as_str(), payload).await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn request_start_transaction(
        &self,
        id_token: IdToken,
        remote_start_id: i32,
        evse_id: Option<i32>,
    ) -> Result<RequestStartTransactionResponse, RoleError> {
        self.call(
            Action::RequestStartTransaction,
            RequestStartTransactionRequest {
                id_token,
                remote_start_id,
                evse_id,
                charging_profile: None,
            },
        )
        .await
    }

    pub async fn request_stop_transaction(
        &self,
        transaction_id: impl Into<String>,
    ) -> Result<RequestStopTransactionResponse, RoleError> {
        self.call(
            Action::RequestStopTransaction,
            RequestStopTransactionRequest {
                transaction_id: transaction_id.into(),
            },
        )
        .await
    }

    pub async fn reset(&self, reset_type: ResetType) -> Result<ResetResponse, RoleError> {
        self.call(
            Action::Reset,
            ResetRequest {
                reset_type,
                evse_id: None,
            },
        )
        .await
    }

    pub async fn get_variables(
        &self,
        entries: Vec<GetVariableData>,
    ) -> Result<GetVariablesResponse, RoleError> {
        self.call(
            Action::GetVariables,
            GetVariablesRequest {
                get_variable_data: entries,
            },
        )
        .await
    }

    pub async fn set_variables(
        &self,
        entries: Vec<SetVariableData>,
    ) -> Result<SetVariablesResponse, RoleError> {
        self.call(
            Action::SetVariables,
            SetVariablesRequest {
                set_variable_data: entries,
            },
        )
        .await
    }

    pub async fn set_charging_profile(
        &self,
        evse_id: i32,
        charging_profile: ChargingProfile,
    ) -> Result<SetChargingProfileResponse, RoleError> {
        self.call(
            Action::SetChargingProfile,
            SetChargingProfileRequest {
                evse_id,
                charging_profile,
            },
        )
        .await
    }

    pub async fn clear_cache(&self) -> Result<ClearCacheResponse, RoleError> {
        self.call(Action::ClearCache, ClearCacheRequest {}).await
    }

    pub async fn data_transfer(
        &self,
        vendor_id: impl Into<String>,
        message_id: Option<String>,
        data: Option<Value>,
    ) -> Result<DataTransferResponse, RoleError> {
        self.call(
            Action::DataTransfer,
            DataTransferRequest {
                vendor_id: vendor_id.into(),
                message_id,
                data,
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_boot_notification_verdict() {
        let reg = CentralSystemRegistry::default();
        let payload = serde_json::json!({
            "chargingStation": {"model": "Wallbox XYZ", "vendorName": "anyone"},
            "reason": "PowerUp"
        });
        let out = reg.handle("BootNotification", payload).await.unwrap();
        let resp: BootNotificationResponse = serde_json::from_value(out).unwrap();
        assert_eq!(resp.status, RegistrationStatus::Accepted);
        assert_eq!(resp.interval, 10);
        assert_eq!(reg.ledger().read().boots.len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_returns_current_time() {
        let reg = CentralSystemRegistry::default();
        let before = Utc::now();
        let out = reg.handle("Heartbeat", serde_json::json!({})).await.unwrap();
        let resp: HeartbeatResponse = serde_json::from_value(out).unwrap();
        assert!(resp.current_time >= before);
        assert_eq!(reg.ledger().read().heartbeats, 1);
    }

    #[tokio::test]
    async fn test_authorize_accepts_and_records_token() {
        let reg = CentralSystemRegistry::default();
        let payload = serde_json::json!({
            "idToken": {"idToken": "CAFEBABE", "type": "Central"}
        });
        let out = reg.handle("Authorize", payload).await.unwrap();
        let resp: AuthorizeResponse = serde_json::from_value(out).unwrap();
        assert_eq!(resp.id_token_info.status, AuthorizationStatus::Accepted);
        assert_eq!(reg.ledger().read().authorized_tokens, vec!["CAFEBABE"]);
    }

    #[tokio::test]
    async fn test_rejecting_csms_config() {
        let reg = CentralSystemRegistry::new(CentralSystemConfig {
            heartbeat_interval: 300,
            registration: RegistrationStatus::Rejected,
            authorization: AuthorizationStatus::Blocked,
        });
        let payload = serde_json::json!({
            "chargingStation": {"model": "EK3-OCPP", "vendorName": "Elektrokombinacija"},
            "reason": "PowerUp"
        });
        let out = reg.handle("BootNotification", payload).await.unwrap();
        let resp: BootNotificationResponse = serde_json::from_value(out).unwrap();
        assert_eq!(resp.status, RegistrationStatus::Rejected);
        assert_eq!(resp.interval, 300);
    }

    #[tokio::test]
    async fn test_transaction_event_ledger() {
        let reg = CentralSystemRegistry::default();
        let payload = serde_json::json!({
            "eventType": "Started",
            "timestamp": "2026-08-07T10:00:00Z",
            "triggerReason": "RemoteStart",
            "seqNo": 0,
            "transactionInfo": {"transactionId": "tx-42"},
            "idToken": {"idToken": "CAFEBABE", "type": "Central"}
        });
        let out = reg.handle("TransactionEvent", payload).await.unwrap();
        let resp: TransactionEventResponse = serde_json::from_value(out).unwrap();
        assert_eq!(
            resp.id_token_info.unwrap().status,
            AuthorizationStatus::Accepted
        );
        assert_eq!(
            reg.ledger().read().transactions.get("tx-42"),
            Some(&TransactionEventType::Started)
        );
    }

    #[tokio::test]
    async fn test_direction_sets() {
        let reg = CentralSystemRegistry::default();
        assert!(reg.issues("RequestStartTransaction"));
        assert!(!reg.issues("BootNotification"));
        assert!(reg.receives("BootNotification"));
        assert!(!reg.receives("Reset"));
    }
}
