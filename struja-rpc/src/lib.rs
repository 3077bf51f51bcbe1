//! Struja RPC Engine
//!
//! OCPP-J request/response plumbing for charge points and central systems.
//! Turns a raw duplex text stream into matched request/response pairs,
//! multiplexed by unique identifiers, with per-action routing, timeout
//! handling and structured error signaling.
//!
//! ## Architecture
//!
//! ```text
//!  issuing code                       peer
//!      │ call(action, payload)          ▲
//!      ▼                                │ WebSocket text frames
//! ┌──────────────────────────────────────────────┐
//! │                 Session                      │
//! │  ┌─────────┐ ┌──────────────┐ ┌───────────┐  │
//! │  │  frame  │ │   pending    │ │  router   │  │
//! │  │  codec  │ │  call table  │ │ (by role) │  │
//! │  └─────────┘ └──────────────┘ └───────────┘  │
//! └───────────────────┬──────────────────────────┘
//!                     │ MessageTransport
//!                     ▼
//!          WebSocket client / server / loopback
//! ```
//!
//! The engine never inspects action payload schemas; payloads travel as
//! `serde_json::Value` and are given meaning by the role registries built
//! on top (see the `struja-roles` crate).

pub mod frame;
pub mod pending;
pub mod router;
pub mod session;
pub mod transport;

pub use frame::{Envelope, ErrorCode, ProtocolError, WireError};
pub use pending::{CallOutcome, DuplicateId, PendingTable};
pub use router::{ActionHandler, HandlerError, RoleRegistry, Router};
pub use session::{RpcError, Session, SessionConfig, SessionState};
pub use transport::{MessageTransport, TransportError, WsTransport, OCPP_SUBPROTOCOL};
