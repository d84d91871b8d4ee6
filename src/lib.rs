//! Offline-first synchronization engine for a point-of-sale client.
//!
//! The local SQLite store is the read source for the UI. Mutations are
//! written there first and queued in a durable outbox; a sync cycle
//! (drain → pull → reconcile) brings the store and the backend together.

pub mod backend;
pub mod commit;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod ffi;
pub mod merge;
pub mod model;
pub mod outbox;
pub mod pull;
pub mod reconcile;
pub mod store;
pub mod sync;
pub mod validator;

pub use backend::{AppliedAction, Backend, BackendError, FetchRequest};
pub use commit::{ConfirmEffect, ProvisionalOrder, ProvisionalWriter};
pub use config::{EngineConfig, OutboxConfig, PullConfig};
pub use connectivity::{Connectivity, ConnectivityMonitor, Transition};
pub use error::{ErrorKind, Failure, SyncError};
pub use model::{
    CanonicalRow, Customer, Entity, LocalRecord, LoyaltyCard, LoyaltyTransaction, MenuItem, Order,
    OrderItem, OrderStatus, RecordKey, Table, TimeWindow, UserConfirmed,
};
pub use outbox::{
    Action, ActionPayload, ActionStatus, ActionType, DrainReport, Outbox, OutboxAction, QueueStats,
};
pub use pull::{InitialLoadReport, PullOutcome, PullService};
pub use reconcile::{ReconciliationResult, Reconciler};
pub use store::{LocalStore, Query, Snapshot};
pub use sync::{PullStep, Step, SyncCycleReport, SyncEngine};
pub use validator::{ValidationResult, Validator};
