//! # Struja Roles
//!
//! The two OCPP 2.0.1 roles built on the `struja-rpc` engine: a charge
//! point that issues station-side requests and answers remote commands,
//! and a central system that accepts connections and hands out verdicts.
//!
//! Each role declares which actions it issues and which it receives,
//! and maps every received action to a handler at construction time.
//! Payloads are typed records (`types`); the engine below only ever
//! sees opaque JSON.

use thiserror::Error;

pub mod action;
pub mod central_system;
pub mod charge_point;
pub mod station;
pub mod types;

pub use action::{Action, UnknownAction};
pub use central_system::{
    CentralSystem, CentralSystemConfig, CentralSystemRegistry, CsmsLedger, SharedLedger,
};
pub use charge_point::{ChargePoint, ChargePointRegistry, SharedStation, VENDOR_ID};
pub use station::{ActiveTransaction, EvseState, RegistrationState, StationState};

/// Errors surfaced by the typed issuing wrappers.
#[derive(Debug, Error)]
pub enum RoleError {
    #[error(transparent)]
    Rpc(#[from] struja_rpc::RpcError),

    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),
}
