// ── Data-source status value types ──
//
// Immutable snapshots handed to observers. The status manager owns the
// mutable state; everything here is plain data.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

use crate::error::ErrorKind;

/// Overall health of the data source. Exactly one is current at any instant.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DataSourceState {
    /// No data received yet since the source started.
    #[default]
    Initializing,
    /// Data is flowing.
    Valid,
    /// Previously valid, now failing; recovery is being attempted.
    Interrupted,
    /// Switched offline on purpose by the application.
    SetOffline,
    /// Gave up permanently. Construct a new source to resume.
    Shutdown,
    NetworkUnavailable,
    /// Streaming turned off while the application is in the background.
    BackgroundDisabled,
}

/// Record of one failure. Superseded, never mutated, by later errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    pub status_code: Option<u16>,
    /// Epoch millis.
    pub time: i64,
}

/// Read-only snapshot of the data source's health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceStatus {
    pub state: DataSourceState,
    /// Epoch millis of the last change of `state`.
    ///
    /// For `Initializing` it is when the source started; for `Valid` when
    /// data last started flowing after a non-valid state; for `Interrupted`
    /// and `Shutdown` when the failure began; for the offline/background
    /// states when the source was switched off.
    pub state_since: i64,
    pub last_error: Option<StatusErrorInfo>,
}
