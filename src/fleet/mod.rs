//! Managed mode
//!
//! The gateway checks in with the control plane, decodes the returned
//! actions and hands them to the dispatcher. Handlers apply them and ack
//! through a lazy, state-persisting acker chain:
//!
//! ```text
//! checkin -> ActionDispatcher -> handler -> StateStoreActionAcker -> LazyAcker -> FleetAcker
//! ```

pub mod acker;
pub mod action;
pub mod backoff;
pub mod client;
pub mod dispatcher;
pub mod gateway;
pub mod handlers;
pub mod reporter;
pub mod scheduler;
pub mod store;

pub use acker::{Acker, BatchAcker, FleetAcker, LazyAcker, NoopAcker, StateStoreActionAcker};
pub use action::{Action, ActionKind, AppAction, RawAction};
pub use client::{
    AckClient, CheckinClient, CheckinRequest, CheckinResponse, HostList, HostProbe, HttpFleetClient,
};
pub use dispatcher::{ActionDispatcher, ActionHandler};
pub use gateway::{FleetGateway, GatewayState};
pub use handlers::{
    AppActionHandler, DefaultHandler, FleetHostsReconciler, HostsReconciler, PolicyChangeHandler,
    PolicyReassignHandler, StagedUpgrader, UnenrollHandler, UpgradeHandler, Upgrader,
};
pub use reporter::{ReportedEvent, Reporter};
pub use store::{AgentState, DiskStore, SharedStateStore, StateStore, Storage};
