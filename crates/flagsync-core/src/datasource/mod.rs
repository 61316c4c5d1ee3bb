//! Data-source health and the one-shot polling requestor.

pub mod requestor;
pub mod status;
pub mod status_manager;

pub use requestor::make_requestor;
pub use status::{DataSourceState, DataSourceStatus, StatusErrorInfo};
pub use status_manager::{
    DataSourceStatusManager, ListenerId, StatusListener, TRANSITION_GUARDS, TimeStamper,
    TransitionGuard, resolve_transition,
};
