//! Deterministic fakes for the three host facilities.
//!
//! Downloads hand out sequential ids starting at 1. Status and progress
//! queries pop from per-handle scripts; the last scripted value repeats.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;
use url::Url;

use extension_installer::{
    DownloadFacility, DownloadId, DownloadStatus, FacilityError, Facilities, HostNavigator,
    PackageInstallerFacility, SessionId, SessionSnapshot,
};

pub struct FakeDownloads {
    next_id: AtomicI64,
    /// Scripts waiting to be claimed by the next enqueue, in order.
    pending_scripts: Mutex<VecDeque<VecDeque<DownloadStatus>>>,
    statuses: Mutex<HashMap<DownloadId, VecDeque<DownloadStatus>>>,
    files: Mutex<HashMap<DownloadId, PathBuf>>,
    pub removed: Mutex<Vec<DownloadId>>,
    pub enqueued: Mutex<Vec<(Url, String, String)>>,
    completions: broadcast::Sender<DownloadId>,
}

impl FakeDownloads {
    pub fn new() -> Self {
        let (completions, _) = broadcast::channel(16);
        Self {
            next_id: AtomicI64::new(1),
            pending_scripts: Mutex::new(VecDeque::new()),
            statuses: Mutex::new(HashMap::new()),
            files: Mutex::new(HashMap::new()),
            removed: Mutex::new(Vec::new()),
            enqueued: Mutex::new(Vec::new()),
            completions,
        }
    }

    /// Queues the status script the next enqueued download will report.
    pub fn queue_script(&self, statuses: impl IntoIterator<Item = DownloadStatus>) {
        self.pending_scripts
            .lock()
            .unwrap()
            .push_back(statuses.into_iter().collect());
    }

    /// Marks a download finished: records its archive location (if any),
    /// pins its status to `Succeeded` and fires the completion event.
    pub fn finish(&self, id: DownloadId, archive: Option<PathBuf>) {
        if let Some(archive) = archive {
            self.files.lock().unwrap().insert(id, archive);
        }
        self.statuses
            .lock()
            .unwrap()
            .insert(id, VecDeque::from([DownloadStatus::Succeeded]));
        let _ = self.completions.send(id);
    }

    /// Number of live completion-event subscriptions.
    pub fn listener_count(&self) -> usize {
        self.completions.receiver_count()
    }

    pub fn removed_ids(&self) -> Vec<DownloadId> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl DownloadFacility for FakeDownloads {
    async fn enqueue(
        &self,
        url: &Url,
        title: &str,
        file_name: &str,
    ) -> Result<DownloadId, FacilityError> {
        let id = DownloadId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let script = self
            .pending_scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| VecDeque::from([DownloadStatus::Pending, DownloadStatus::Running]));
        self.statuses.lock().unwrap().insert(id, script);
        self.enqueued
            .lock()
            .unwrap()
            .push((url.clone(), title.to_string(), file_name.to_string()));
        Ok(id)
    }

    async fn query_status(&self, id: DownloadId) -> Result<DownloadStatus, FacilityError> {
        let mut statuses = self.statuses.lock().unwrap();
        let script = statuses
            .get_mut(&id)
            .ok_or_else(|| FacilityError::Query(format!("unknown download {:?}", id)))?;
        if script.len() > 1 {
            Ok(script.pop_front().unwrap())
        } else {
            Ok(*script.front().unwrap_or(&DownloadStatus::Pending))
        }
    }

    async fn remove(&self, id: DownloadId) {
        self.removed.lock().unwrap().push(id);
        self.statuses.lock().unwrap().remove(&id);
        self.files.lock().unwrap().remove(&id);
    }

    async fn resolve_local_file(&self, id: DownloadId) -> Option<PathBuf> {
        self.files.lock().unwrap().get(&id).cloned()
    }

    fn completions(&self) -> broadcast::Receiver<DownloadId> {
        self.completions.subscribe()
    }
}

pub struct FakeInstaller {
    progress: Mutex<HashMap<SessionId, VecDeque<f32>>>,
    pub abandoned: Mutex<Vec<SessionId>>,
}

impl FakeInstaller {
    pub fn new() -> Self {
        Self {
            progress: Mutex::new(HashMap::new()),
            abandoned: Mutex::new(Vec::new()),
        }
    }

    /// Scripts the progress values a session will report, in order.
    pub fn script_progress(&self, session: SessionId, values: impl IntoIterator<Item = f32>) {
        self.progress
            .lock()
            .unwrap()
            .insert(session, values.into_iter().collect());
    }
}

#[async_trait]
impl PackageInstallerFacility for FakeInstaller {
    async fn session_progress(&self, session: SessionId) -> Option<SessionSnapshot> {
        let mut progress = self.progress.lock().unwrap();
        let script = progress.get_mut(&session)?;
        let value = if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            *script.front()?
        };
        Some(SessionSnapshot {
            session_id: session,
            progress: value,
        })
    }

    async fn abandon_session(&self, session: SessionId) {
        self.abandoned.lock().unwrap().push(session);
        self.progress.lock().unwrap().remove(&session);
    }
}

#[derive(Default)]
pub struct RecordingNavigator {
    pub installs: Mutex<Vec<(DownloadId, PathBuf, String)>>,
    pub uninstalls: Mutex<Vec<String>>,
}

impl HostNavigator for RecordingNavigator {
    fn confirm_install(&self, download: DownloadId, archive: &Path, mime: &str) {
        self.installs
            .lock()
            .unwrap()
            .push((download, archive.to_path_buf(), mime.to_string()));
    }

    fn confirm_uninstall(&self, pkg_name: &str) {
        self.uninstalls.lock().unwrap().push(pkg_name.to_string());
    }
}

pub struct TestHost {
    pub downloads: Arc<FakeDownloads>,
    pub installer: Arc<FakeInstaller>,
    pub navigator: Arc<RecordingNavigator>,
}

impl TestHost {
    pub fn new() -> Self {
        Self {
            downloads: Arc::new(FakeDownloads::new()),
            installer: Arc::new(FakeInstaller::new()),
            navigator: Arc::new(RecordingNavigator::default()),
        }
    }

    pub fn facilities(&self) -> Facilities {
        Facilities::new(
            self.downloads.clone(),
            self.installer.clone(),
            self.navigator.clone(),
        )
    }
}

/// Lets the coordinator task and listener drain their queues.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
