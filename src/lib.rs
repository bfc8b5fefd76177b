//! Fetch-and-install coordination for reader extensions.
//!
//! The host platform owns the actual download and package-install mechanics;
//! this crate wraps them behind the [`facilities`] traits and tracks one
//! install lifecycle per package, exposed as a stream of [`TrackedStep`]
//! values:
//!
//! `Pending → Downloading → Loading → Installing → {Installed | Error}`
//!
//! The stream for a request ends after the first terminal step, and dropping
//! it cancels the request and releases its resources. A new request for a
//! package supersedes any request still active for it.

pub mod coordinator;
pub mod facilities;
pub mod types;

pub use coordinator::InstallCoordinator;
pub use facilities::{
    DownloadFacility, DownloadStatus, Facilities, HostNavigator, PackageInstallerFacility,
};
pub use types::{
    CoordinatorConfig, CoordinatorError, DownloadId, FacilityError, InstallRequest, InstallStep,
    SessionId, SessionSnapshot, TrackedStep, PACKAGE_ARCHIVE_MIME,
};
