//! OCPP action names
//!
//! The simulator's action vocabulary, fixed at compile time. Charge
//! point and central system each issue a distinct subset; DataTransfer
//! goes both ways.

use thiserror::Error;

/// Actions this simulator speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    // CP -> CSMS
    BootNotification,
    Heartbeat,
    Authorize,
    StatusNotification,
    MeterValues,
    TransactionEvent,
    FirmwareStatusNotification,

    // CSMS -> CP
    RequestStartTransaction,
    RequestStopTransaction,
    Reset,
    GetVariables,
    SetVariables,
    SetChargingProfile,
    ClearCache,

    // Bidirectional
    DataTransfer,
}

impl Action {
    /// Actions a charge point may issue.
    pub const CHARGE_POINT_ISSUED: &'static [Action] = &[
        Action::BootNotification,
        Action::Heartbeat,
        Action::Authorize,
        Action::StatusNotification,
        Action::MeterValues,
        Action::TransactionEvent,
        Action::FirmwareStatusNotification,
        Action::DataTransfer,
    ];

    /// Actions a central system may issue.
    pub const CENTRAL_SYSTEM_ISSUED: &'static [Action] = &[
        Action::RequestStartTransaction,
        Action::RequestStopTransaction,
        Action::Reset,
        Action::GetVariables,
        Action::SetVariables,
        Action::SetChargingProfile,
        Action::ClearCache,
        Action::DataTransfer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::BootNotification => "BootNotification",
            Action::Heartbeat => "Heartbeat",
            Action::Authorize => "Authorize",
            Action::StatusNotification => "StatusNotification",
            Action::MeterValues => "MeterValues",
            Action::TransactionEvent => "TransactionEvent",
            Action::FirmwareStatusNotification => "FirmwareStatusNotification",
            Action::RequestStartTransaction => "RequestStartTransaction",
            Action::RequestStopTransaction => "RequestStopTransaction",
            Action::Reset => "Reset",
            Action::GetVariables => "GetVariables",
            Action::SetVariables => "SetVariables",
            Action::SetChargingProfile => "SetChargingProfile",
            Action::ClearCache => "ClearCache",
            Action::DataTransfer => "DataTransfer",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown action: {0}")]
pub struct UnknownAction(pub String);

impl std::str::FromStr for Action {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BootNotification" => Ok(Action::BootNotification),
            "Heartbeat" => Ok(Action::Heartbeat),
            "Authorize" => Ok(Action::Authorize),
            "StatusNotification" => Ok(Action::StatusNotification),
            "MeterValues" => Ok(Action::MeterValues),
            "TransactionEvent" => Ok(Action::TransactionEvent),
            "FirmwareStatusNotification" => Ok(Action::FirmwareStatusNotification),
            "RequestStartTransaction" => Ok(Action::RequestStartTransaction),
            "RequestStopTransaction" => Ok(Action::RequestStopTransaction),
            "Reset" => Ok(Action::Reset),
            "GetVariables" => Ok(Action::GetVariables),
            "SetVariables" => Ok(Action::SetVariables),
            "SetChargingProfile" => Ok(Action::SetChargingProfile),
            "ClearCache" => Ok(Action::ClearCache),
            "DataTransfer" => Ok(Action::DataTransfer),
            _ => Err(UnknownAction(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_roundtrip_all_actions() {
        for action in Action::CHARGE_POINT_ISSUED
            .iter()
            .chain(Action::CENTRAL_SYSTEM_ISSUED)
        {
            assert_eq!(Action::from_str(action.as_str()).unwrap(), *action);
        }
    }

    #[test]
    fn test_unknown_action() {
        assert!(Action::from_str("ClearDisplay").is_err());
    }

    #[test]
    fn test_data_transfer_is_bidirectional() {
        assert!(Action::CHARGE_POINT_ISSUED.contains(&Action::DataTransfer));
        assert!(Action::CENTRAL_SYSTEM_ISSUED.contains(&Action::DataTransfer));
    }
}
