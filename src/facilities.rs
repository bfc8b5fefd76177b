//! Host collaborator seams.
//!
//! The actual download and package-install mechanics live in the host
//! platform. The coordinator only talks to these traits, so tests can drive
//! it against deterministic fakes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use url::Url;

use crate::types::{DownloadId, FacilityError, SessionId, SessionSnapshot};

/// Status reported by the download facility for one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    /// Queued, not started.
    Pending,
    /// Bytes are being fetched.
    Running,
    /// The archive is fully fetched.
    Succeeded,
    /// The fetch failed and will not complete.
    Failed,
}

/// Download manager shim.
#[async_trait]
pub trait DownloadFacility: Send + Sync {
    /// Submits a fetch and returns the handle assigned to it.
    async fn enqueue(
        &self,
        url: &Url,
        title: &str,
        file_name: &str,
    ) -> Result<DownloadId, FacilityError>;

    /// Samples the current status of a fetch.
    async fn query_status(&self, id: DownloadId) -> Result<DownloadStatus, FacilityError>;

    /// Cancels the fetch and discards any partially fetched data.
    async fn remove(&self, id: DownloadId);

    /// Location of the fetched archive once the download has finished, if it
    /// can still be found.
    async fn resolve_local_file(&self, id: DownloadId) -> Option<PathBuf>;

    /// Push notifications announcing finished downloads.
    fn completions(&self) -> broadcast::Receiver<DownloadId>;
}

/// Package installer shim.
#[async_trait]
pub trait PackageInstallerFacility: Send + Sync {
    /// Progress sample of an open session, `None` once the session is gone.
    async fn session_progress(&self, session: SessionId) -> Option<SessionSnapshot>;

    /// Abandons an open session, discarding its staged data.
    async fn abandon_session(&self, session: SessionId);
}

/// Host navigation shim. Both operations are fire-and-forget: the host shows
/// a confirmation flow and reports the outcome back through the coordinator.
pub trait HostNavigator: Send + Sync {
    /// Opens the host's install confirmation flow for a fetched archive.
    fn confirm_install(&self, download: DownloadId, archive: &Path, mime: &str);

    /// Opens the host's uninstall confirmation flow.
    fn confirm_uninstall(&self, pkg_name: &str);
}

/// Bundle of the three host facilities a coordinator runs against.
#[derive(Clone)]
pub struct Facilities {
    pub downloads: Arc<dyn DownloadFacility>,
    pub installer: Arc<dyn PackageInstallerFacility>,
    pub navigator: Arc<dyn HostNavigator>,
}

impl Facilities {
    pub fn new(
        downloads: Arc<dyn DownloadFacility>,
        installer: Arc<dyn PackageInstallerFacility>,
        navigator: Arc<dyn HostNavigator>,
    ) -> Self {
        Self {
            downloads,
            installer,
            navigator,
        }
    }
}
