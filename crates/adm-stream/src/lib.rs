//! Client side of the gateway event stream: a self-healing WebSocket
//! session feeding a bounded event store and the pending-approval queue.

pub mod config;
pub mod dispatch;
pub mod plan_view;
pub mod session;
pub mod store;
pub mod transport;

pub use config::{ConfigError, StreamConfig};
pub use dispatch::{dispatch, dispatch_with_limit, DispatchOutcome};
pub use plan_view::{PlanSelection, PlanView};
pub use session::{Session, SessionSnapshot, SessionUpdate};
pub use store::{ApprovalQueue, EventStore, Stores};
pub use transport::{Frame, Link, Transport, TransportError, WsTransport};
