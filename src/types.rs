//! Shared types for the install pipeline: lifecycle steps, opaque handles,
//! stream payloads, configuration and errors.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// MIME type of an extension package archive.
pub const PACKAGE_ARCHIVE_MIME: &str = "application/vnd.android.package-archive";

/// Lifecycle phase of one tracked install.
///
/// `Installed` and `Error` are terminal; once either is delivered on a
/// request stream, no further step follows for that request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallStep {
    /// Queued by the download facility, no bytes fetched yet.
    Pending,
    /// The download facility is fetching the archive.
    Downloading,
    /// Download finished, archive resolved, waiting for the install hand-off.
    Loading,
    /// An installer session is open for this download.
    Installing,
    /// The package was installed.
    Installed,
    /// The request failed or was cancelled.
    Error,
}

impl InstallStep {
    /// True iff this step ends the install lifecycle.
    pub fn is_completed(self) -> bool {
        matches!(self, InstallStep::Installed | InstallStep::Error)
    }
}

impl std::fmt::Display for InstallStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstallStep::Pending => write!(f, "pending"),
            InstallStep::Downloading => write!(f, "downloading"),
            InstallStep::Loading => write!(f, "loading"),
            InstallStep::Installing => write!(f, "installing"),
            InstallStep::Installed => write!(f, "installed"),
            InstallStep::Error => write!(f, "error"),
        }
    }
}

/// One install or update request. The package name is the dedup key: at most
/// one request per package is tracked at any time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallRequest {
    /// Unique identifier of the extension package.
    pub pkg_name: String,
    /// Human-readable label for the download entry.
    pub name: String,
}

impl InstallRequest {
    pub fn new(pkg_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            pkg_name: pkg_name.into(),
            name: name.into(),
        }
    }
}

/// Handle assigned by the download facility to one fetch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DownloadId(pub i64);

/// Handle of one in-progress installer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub i32);

/// Progress sample of an open installer session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    /// Install progress in the `0.0..=1.0` range.
    pub progress: f32,
}

/// Item type of the observation stream returned for one install request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedStep {
    pub download_id: DownloadId,
    pub step: InstallStep,
    /// Present while an installer session is associated with the download.
    pub session: Option<SessionSnapshot>,
}

impl TrackedStep {
    pub fn new(download_id: DownloadId, step: InstallStep, session: Option<SessionSnapshot>) -> Self {
        Self {
            download_id,
            step,
            session,
        }
    }
}

/// Timing configuration for one coordinator instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Download status sampling period (milliseconds).
    pub download_poll_interval_ms: u64,
    /// Installer session sampling period (milliseconds).
    pub install_poll_interval_ms: u64,
    /// Ceiling after which a request is forced to `Error` (milliseconds).
    pub deadline_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            download_poll_interval_ms: 1_000,
            install_poll_interval_ms: 250,
            deadline_ms: 180_000,
        }
    }
}

impl CoordinatorConfig {
    pub fn download_poll_interval(&self) -> Duration {
        Duration::from_millis(self.download_poll_interval_ms)
    }

    pub fn install_poll_interval(&self) -> Duration {
        Duration::from_millis(self.install_poll_interval_ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

/// Failure reported by a host facility shim.
#[derive(Error, Debug)]
pub enum FacilityError {
    #[error("download enqueue failed: {0}")]
    Enqueue(String),

    #[error("download status query failed: {0}")]
    Query(String),

    #[error("installer session query failed: {0}")]
    Session(String),
}

/// Failure of a coordinator operation itself.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// The coordinator task has shut down.
    #[error("install coordinator is no longer running")]
    Closed,

    #[error(transparent)]
    Facility(#[from] FacilityError),
}
