//! Charge-point role
//!
//! The registry answers central-system-initiated actions against the
//! shared station state; the [`ChargePoint`] wrapper issues the
//! station's own requests as typed calls and folds responses back into
//! that state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use struja_rpc::{ActionHandler, HandlerError, RoleRegistry, Session};

use crate::action::Action;
use crate::station::StationState;
use crate::types::*;
use crate::RoleError;

/// Station state shared between handlers and issuing code.
pub type SharedStation = Arc<RwLock<StationState>>;

/// Vendor id accepted by the DataTransfer handler.
pub const VENDOR_ID: &str = "com.elektrokombinacija";

// ============================================================================
// Registry
// ============================================================================

/// Handlers for the actions a charge point answers.
pub struct ChargePointRegistry {
    handlers: HashMap<Action, Box<dyn ActionHandler>>,
}

impl ChargePointRegistry {
    pub fn new(station: SharedStation) -> Self {
        let mut handlers: HashMap<Action, Box<dyn ActionHandler>> = HashMap::new();
        handlers.insert(
            Action::RequestStartTransaction,
            Box::new(RemoteStart {
                station: station.clone(),
            }),
        );
        handlers.insert(
            Action::RequestStopTransaction,
            Box::new(RemoteStop {
                station: station.clone(),
            }),
        );
        handlers.insert(
            Action::Reset,
            Box::new(DoReset {
                station: station.clone(),
            }),
        );
        handlers.insert(
            Action::GetVariables,
            Box::new(GetVars {
                station: station.clone(),
            }),
        );
        handlers.insert(
            Action::SetVariables,
            Box::new(SetVars {
                station: station.clone(),
            }),
        );
        handlers.insert(
            Action::SetChargingProfile,
            Box::new(SetProfile {
                station: station.clone(),
            }),
        );
        handlers.insert(Action::ClearCache, Box::new(DoClearCache { station }));
        handlers.insert(Action::DataTransfer, Box::new(VendorData));
        Self { handlers }
    }
}

#[async_trait]
impl RoleRegistry for ChargePointRegistry {
    fn role(&self) -> &'static str {
        "charge-point"
    }

    fn issues(&self, action: &str) -> bool {
        action
            .parse::<Action>()
            .map(|a| Action::CHARGE_POINT_ISSUED.contains(&a))
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

struct RemoteStart {
    station: SharedStation,
}

#[async_trait]
impl ActionHandler for RemoteStart {
    async fn invoke(&self, payload: Value) -> Result<Value, HandlerError> {
        let req: RequestStartTransactionRequest = serde_json::from_value(payload)?;
        let mut station = self.station.write();
        let (status, transaction_id) =
            station.start_transaction(req.evse_id, req.id_token.id_token, req.remote_start_id);
        if status == GenericStatus::Accepted {
            if let (Some(evse_id), Some(profile)) = (req.evse_id, req.charging_profile) {
                station.set_charging_profile(evse_id, profile);
            }
        }
        Ok(serde_json::to_value(RequestStartTransactionResponse {
            status,
            transaction_id,
            status_info: None,
        })?)
    }
}

struct RemoteStop {
    station: SharedStation,
}

#[async_trait]
impl ActionHandler for RemoteStop {
    async fn invoke(&self, payload: Value) -> Result<Value, HandlerError> {
        let req: RequestStopTransactionRequest = serde_json::from_value(payload)?;
        let status = self.station.write().stop_transaction(&req.transaction_id);
        Ok(serde_json::to_value(RequestStopTransactionResponse {
            status,
            status_info: None,
        })?)
    }
}

struct DoReset {
    station: SharedStation,
}

#[async_trait]
impl ActionHandler for DoReset {
    async fn invoke(&self, payload: Value) -> Result<Value, HandlerError> {
        let req: ResetRequest = serde_json::from_value(payload)?;
        let status = self.station.write().reset(req.reset_type);
        Ok(serde_json::to_value(ResetResponse {
            status,
            status_info: None,
        })?)
    }
}

struct GetVars {
    station: SharedStation,
}

#[async_trait]
impl ActionHandler for GetVars {
    async fn invoke(&self, payload: Value) -> Result<Value, HandlerError> {
        let req: GetVariablesRequest = serde_json::from_value(payload)?;
        let station = self.station.read();
        let results = req
            .get_variable_data
            .into_iter()
            .map(|entry| {
                let value = station
                    .get_variable(&entry.component.name, &entry.variable.name)
                    .cloned();
                GetVariableResult {
                    attribute_status: if value.is_some() {
                        VariableStatus::Accepted
                    } else {
                        VariableStatus::UnknownVariable
                    },
                    component: entry.component,
                    variable: entry.variable,
                    attribute_value: value,
                }
            })
            .collect();
        Ok(serde_json::to_value(GetVariablesResponse {
            get_variable_result: results,
        })?)
    }
}

struct SetVars {
    station: SharedStation,
}

#[async_trait]
impl ActionHandler for SetVars {
    async fn invoke(&self, payload: Value) -> Result<Value, HandlerError> {
        let req: SetVariablesRequest = serde_json::from_value(payload)?;
        let mut station = self.station.write();
        let results = req
            .set_variable_data
            .into_iter()
            .map(|entry| {
                station.set_variable(
                    &entry.component.name,
                    &entry.variable.name,
                    entry.attribute_value,
                );
                SetVariableResult {
                    attribute_status: VariableStatus::Accepted,
                    component: entry.component,
                    variable: entry.variable,
                }
            })
            .collect();
        Ok(serde_json::to_value(SetVariablesResponse {
            set_variable_result: results,
        })?)
    }
}

struct SetProfile {
    station: SharedStation,
}

#[async_trait]
impl ActionHandler for SetProfile {
    async fn invoke(&self, payload: Value) -> Result<Value, HandlerError> {
        let req: SetChargingProfileRequest = serde_json::from_value(payload)?;
        let status = self
            .station
            .write()
            .set_charging_profile(req.evse_id, req.charging_profile);
        Ok(serde_json::to_value(SetChargingProfileResponse {
            status,
            status_info: None,
        })?)
    }
}

struct DoClearCache {
    station: SharedStation,
}

#[async_trait]
impl ActionHandler for DoClearCache {
    async fn invoke(&self, payload: Value) -> Result<Value, HandlerError> {
        let _req: ClearCacheRequest = serde_json::from_value(payload)?;
        let status = self.station.write().clear_auth_cache();
        Ok(serde_json::to_value(ClearCacheResponse { status })?)
    }
}

struct VendorData;

#[async_trait]
impl ActionHandler for VendorData {
    async fn invoke(&self, payload: Value) -> Result<Value, HandlerError> {
        let req: DataTransferRequest = serde_json::from_value(payload)?;
        let response = if req.vendor_id == VENDOR_ID {
            DataTransferResponse {
                status: DataTransferStatus::Accepted,
                data: req.data,
            }
        } else {
            debug!(vendor_id = %req.vendor_id, "unknown vendor");
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

/// Typed veneer over [`Session::call`] for the requests a charge point
/// issues.
pub struct ChargePoint {
    session: Session,
    station: SharedStation,
}

impl ChargePoint {
    pub fn new(session: Session, station: SharedStation) -> Self {
        Self { session, station }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn station(&self) -> SharedStation {
        self.station.clone()
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

    /// Send BootNotification and fold the verdict into station state.
    pub async fn boot_notification(
        &self,
        reason: BootReason,
    ) -> Result<BootNotificationResponse, RoleError> {
        let request = BootNotificationRequest {
            charging_station: self.station.read().charging_station_info(),
            reason,
        };
        let response: BootNotificationResponse =
            self.call(Action::BootNotification, request).await?;
        self.station.write().apply_boot_response(&response);
        Ok(response)
    }

    pub async fn heartbeat(&self) -> Result<HeartbeatResponse, RoleError> {
        let response: HeartbeatResponse = self.call(Action::Heartbeat, HeartbeatRequest {}).await?;
        self.station.write().record_heartbeat();
        Ok(response)
    }

    /// Authorize a token; accepted tokens land in the local cache.
    pub async fn authorize(&self, id_token: IdToken) -> Result<AuthorizeResponse, RoleError> {
        let token = id_token.id_token.clone();
        let response: AuthorizeResponse = self
            .call(Action::Authorize, AuthorizeRequest { id_token })
            .await?;
        if response.id_token_info.status == AuthorizationStatus::Accepted {
            self.station.write().cache_token(token);
        }
        Ok(response)
    }

    /// Report the current status of every EVSE.
    pub async fn status_notification_all(&self) -> Result<(), RoleError> {
        let statuses = self.station.read().evse_statuses();
        for (evse_id, connector_id, status) in statuses {
            let request = StatusNotificationRequest {
                timestamp: Utc::now(),
                connector_status: status,
                evse_id,
                connector_id,
            };
            let _: StatusNotificationResponse =
                self.call(Action::StatusNotification, request).await?;
        }
        Ok(())
    }

    pub async fn meter_values(
        &self,
        evse_id: i32,
        meter_value: Vec<MeterValue>,
    ) -> Result<MeterValuesResponse, RoleError> {
        self.call(
            Action::MeterValues,
            MeterValuesRequest {
                evse_id,
                meter_value,
            },
        )
        .await
    }

    pub async fn transaction_event(
        &self,
        request: TransactionEventRequest,
    ) -> Result<TransactionEventResponse, RoleError> {
        self.call(Action::TransactionEvent, request).await
    }

    pub async fn firmware_status(
        &self,
        status: FirmwareStatus,
    ) -> Result<FirmwareStatusNotificationResponse, RoleError> {
        self.call(
            Action::FirmwareStatusNotification,
            FirmwareStatusNotificationRequest {
                status,
                request_id: None,
            },
        )
        .await
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

    fn registry() -> ChargePointRegistry {
        let mut station = StationState::new("EK3-001", "Elektrokombinacija", "EK3-OCPP");
        station.add_evse(1, 1);
        ChargePointRegistry::new(Arc::new(RwLock::new(station)))
    }

    #[test]
    fn test_direction_sets() {
        let reg = registry();
        assert!(reg.issues("BootNotification"));
        assert!(reg.issues("DataTransfer"));
        assert!(!reg.issues("RequestStartTransaction"));
        assert!(!reg.issues("NoSuchAction"));

        assert!(reg.receives("RequestStartTransaction"));
        assert!(reg.receives("ClearCache"));
        assert!(!reg.receives("BootNotification"));
        assert!(!reg.receives("NoSuchAction"));
    }

    #[tokio::test]
    async fn test_remote_start_then_stop() {
        let reg = registry();

        let payload = serde_json::json!({
            "idToken": {"idToken": "TOKEN1", "type": "Central"},
            "remoteStartId": 7
        });
        let out = reg.handle("RequestStartTransaction", payload).await.unwrap();
        let resp: RequestStartTransactionResponse = serde_json::from_value(out).unwrap();
        assert_eq!(resp.status, GenericStatus::Accepted);
        let tx_id = resp.transaction_id.unwrap();

        let out = reg
            .handle(
                "RequestStopTransaction",
                serde_json::json!({"transactionId": tx_id}),
            )
            .await
            .unwrap();
        let resp: RequestStopTransactionResponse = serde_json::from_value(out).unwrap();
        assert_eq!(resp.status, GenericStatus::Accepted);
    }

    #[tokio::test]
    async fn test_bad_payload_surfaces_as_payload_error() {
        let reg = registry();
        let err = reg
            .handle("RequestStopTransaction", serde_json::json!({"bogus": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Payload(_)));
    }

    #[tokio::test]
    async fn test_set_then_get_variables() {
        let reg = registry();

        let set = serde_json::json!({
            "setVariableData": [{
                "component": {"name": "OCPPCommCtrlr"},
                "variable": {"name": "HeartbeatInterval"},
                "attributeValue": "10"
            }]
        });
        let out = reg.handle("SetVariables", set).await.unwrap();
        let resp: SetVariablesResponse = serde_json::from_value(out).unwrap();
        assert_eq!(
            resp.set_variable_result[0].attribute_status,
            VariableStatus::Accepted
        );

        let get = serde_json::json!({
            "getVariableData": [
                {"component": {"name": "OCPPCommCtrlr"}, "variable": {"name": "HeartbeatInterval"}},
                {"component": {"name": "OCPPCommCtrlr"}, "variable": {"name": "Missing"}}
            ]
        });
        let out = reg.handle("GetVariables", get).await.unwrap();
        let resp: GetVariablesResponse = serde_json::from_value(out).unwrap();
        assert_eq!(resp.get_variable_result[0].attribute_value.as_deref(), Some("10"));
        assert_eq!(
            resp.get_variable_result[1].attribute_status,
            VariableStatus::UnknownVariable
        );
    }

    #[tokio::test]
    async fn test_data_transfer_vendor_gate() {
        let reg = registry();

        let out = reg
            .handle(
                "DataTransfer",
                serde_json::json!({"vendorId": VENDOR_ID, "data": {"k": "v"}}),
            )
            .await
            .unwrap();
        let resp: DataTransferResponse = serde_json::from_value(out).unwrap();
        assert_eq!(resp.status, DataTransferStatus::Accepted);
        assert_eq!(resp.data.unwrap()["k"], "v");

        let out = reg
            .handle("DataTransfer", serde_json::json!({"vendorId": "acme.example"}))
            .await
            .unwrap();
        let resp: DataTransferResponse = serde_json::from_value(out).unwrap();
        assert_eq!(resp.status, DataTransferStatus::UnknownVendorId);
    }
}
