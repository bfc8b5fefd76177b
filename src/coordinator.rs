//! The install coordinator.
//!
//! A cloneable handle over a single owner task. The task owns all request
//! bookkeeping (active downloads per package, installer session per
//! download) and serializes every mutation; the handle and the per-request
//! streams talk to it through messages. Each call to
//! [`InstallCoordinator::install`] yields a stream of [`TrackedStep`] values
//! merged from four sources: the shared step relay, a download status poll,
//! an installer session poll and a hard deadline. The stream ends after the
//! first terminal step, and dropping it triggers the same cleanup path.

use std::collections::HashMap;

use async_stream::stream;
use futures::Stream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::facilities::{DownloadStatus, Facilities};
use crate::types::{
    CoordinatorConfig, CoordinatorError, DownloadId, FacilityError, InstallRequest, InstallStep,
    SessionId, TrackedStep, PACKAGE_ARCHIVE_MIME,
};

/// Step relay capacity. Steps are small and consumers drain quickly; a
/// lagging receiver only misses intermediate samples and is warned about.
const RELAY_CAPACITY: usize = 64;

type StepEvent = (DownloadId, InstallStep);

enum Command {
    Install {
        url: Url,
        request: InstallRequest,
        reply: oneshot::Sender<Result<Ticket, FacilityError>>,
    },
    BeginSession {
        download: DownloadId,
        session: SessionId,
    },
    CancelSession {
        session: SessionId,
    },
    InstallResult {
        download: DownloadId,
        succeeded: bool,
    },
    SessionFor {
        download: DownloadId,
        reply: oneshot::Sender<Option<SessionId>>,
    },
    Release {
        pkg_name: String,
        download: DownloadId,
    },
}

struct Ticket {
    download: DownloadId,
    events: broadcast::Receiver<StepEvent>,
}

/// Coordinates fetch-and-install of extension packages.
#[derive(Clone)]
pub struct InstallCoordinator {
    commands: mpsc::UnboundedSender<Command>,
    facilities: Facilities,
    config: CoordinatorConfig,
}

impl InstallCoordinator {
    pub fn new(facilities: Facilities) -> Self {
        Self::with_config(facilities, CoordinatorConfig::default())
    }

    pub fn with_config(facilities: Facilities, config: CoordinatorConfig) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let task = CoordinatorTask::new(facilities.clone(), command_rx);
        tokio::spawn(task.run());

        Self {
            commands,
            facilities,
            config,
        }
    }

    /// Requests fetch-and-install of a package and returns the step stream
    /// tracking it.
    ///
    /// Any request already active for the same package is cancelled first.
    /// The stream ends after the first terminal step; dropping it early
    /// releases the download entry and, when it was the last one, the
    /// completion listener.
    pub async fn install(
        &self,
        url: Url,
        request: InstallRequest,
    ) -> Result<impl Stream<Item = TrackedStep>, CoordinatorError> {
        let pkg_name = request.pkg_name.clone();
        let (reply, ticket) = oneshot::channel();
        self.commands
            .send(Command::Install {
                url,
                request,
                reply,
            })
            .map_err(|_| CoordinatorError::Closed)?;
        let ticket = ticket.await.map_err(|_| CoordinatorError::Closed)??;

        Ok(self.track(pkg_name, ticket))
    }

    /// Associates an installer session with a download and reports
    /// `Installing` immediately.
    pub fn begin_session(
        &self,
        download: DownloadId,
        session: SessionId,
    ) -> Result<(), CoordinatorError> {
        self.send(Command::BeginSession { download, session })
    }

    /// Cancels the install tracked for this session, if any: its stream ends
    /// with `Error` and the session is abandoned. No-op for unknown sessions.
    pub fn cancel_session(&self, session: SessionId) -> Result<(), CoordinatorError> {
        self.send(Command::CancelSession { session })
    }

    /// Reports the final outcome of an installer session. This is the only
    /// path to the `Installed` terminal step.
    pub fn report_result(
        &self,
        download: DownloadId,
        succeeded: bool,
    ) -> Result<(), CoordinatorError> {
        self.send(Command::InstallResult {
            download,
            succeeded,
        })
    }

    /// Opens the host uninstall confirmation flow. Fire-and-forget; not part
    /// of any tracked sequence.
    pub fn uninstall(&self, pkg_name: &str) {
        self.facilities.navigator.confirm_uninstall(pkg_name);
    }

    fn send(&self, command: Command) -> Result<(), CoordinatorError> {
        self.commands
            .send(command)
            .map_err(|_| CoordinatorError::Closed)
    }

    /// Builds the merged observation stream for one enqueued request.
    fn track(&self, pkg_name: String, ticket: Ticket) -> impl Stream<Item = TrackedStep> {
        let id = ticket.download;
        let mut events = ticket.events;
        let facilities = self.facilities.clone();
        let commands = self.commands.clone();
        let config = self.config.clone();
        let guard = ReleaseGuard {
            commands: commands.clone(),
            pkg_name,
            download: id,
        };

        stream! {
            // Dropped when the stream ends or its consumer detaches; either
            // way the owner task releases this request's bookkeeping.
            let _guard = guard;

            let mut download_poll = tokio::time::interval(config.download_poll_interval());
            download_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut install_poll = tokio::time::interval(config.install_poll_interval());
            install_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let deadline = tokio::time::sleep(config.deadline());
            tokio::pin!(deadline);

            let mut last_polled: Option<InstallStep> = None;
            let mut download_settled = false;

            loop {
                let emit: Option<TrackedStep> = tokio::select! {
                    _ = &mut deadline => {
                        warn!(?id, "install deadline exceeded");
                        Some(TrackedStep::new(id, InstallStep::Error, None))
                    }
                    event = events.recv() => match event {
                        Ok((event_id, step)) if event_id == id => {
                            let session = match session_for(&commands, id).await {
                                Some(session) => {
                                    facilities.installer.session_progress(session).await
                                }
                                None => None,
                            };
                            Some(TrackedStep::new(id, step, session))
                        }
                        Ok(_) => None,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(?id, missed, "step relay lagged");
                            None
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = download_poll.tick(), if !download_settled => {
                        match facilities.downloads.query_status(id).await {
                            Ok(status) => {
                                let step = match status {
                                    DownloadStatus::Pending => Some(InstallStep::Pending),
                                    DownloadStatus::Running => Some(InstallStep::Downloading),
                                    DownloadStatus::Succeeded => {
                                        download_settled = true;
                                        None
                                    }
                                    DownloadStatus::Failed => {
                                        // A failed download never produces a
                                        // completion event; fail the request
                                        // now rather than at the deadline.
                                        download_settled = true;
                                        Some(InstallStep::Error)
                                    }
                                };
                                match step {
                                    // Consecutive duplicate samples are noise.
                                    Some(step) if last_polled != Some(step) => {
                                        last_polled = Some(step);
                                        Some(TrackedStep::new(id, step, None))
                                    }
                                    _ => None,
                                }
                            }
                            Err(err) => {
                                warn!(?id, %err, "download status query failed");
                                None
                            }
                        }
                    }
                    _ = install_poll.tick() => {
                        match session_for(&commands, id).await {
                            Some(session) => {
                                let snapshot =
                                    facilities.installer.session_progress(session).await;
                                Some(TrackedStep::new(id, InstallStep::Installing, snapshot))
                            }
                            None => None,
                        }
                    }
                };

                if let Some(tracked) = emit {
                    let terminal = tracked.step.is_completed();
                    yield tracked;
                    if terminal {
                        break;
                    }
                }
            }
        }
    }
}

/// Looks up the installer session currently mapped to a download.
async fn session_for(
    commands: &mpsc::UnboundedSender<Command>,
    download: DownloadId,
) -> Option<SessionId> {
    let (reply, response) = oneshot::channel();
    commands.send(Command::SessionFor { download, reply }).ok()?;
    response.await.ok().flatten()
}

/// Messages the owner task when a request stream goes away.
struct ReleaseGuard {
    commands: mpsc::UnboundedSender<Command>,
    pkg_name: String,
    download: DownloadId,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Release {
            pkg_name: std::mem::take(&mut self.pkg_name),
            download: self.download,
        });
    }
}

/// Owner task: the only place the bookkeeping maps are touched.
struct CoordinatorTask {
    facilities: Facilities,
    commands: mpsc::UnboundedReceiver<Command>,
    completions: mpsc::UnboundedReceiver<DownloadId>,
    completions_tx: mpsc::UnboundedSender<DownloadId>,
    relay: broadcast::Sender<StepEvent>,
    /// Package name -> its single in-flight download.
    active: HashMap<String, DownloadId>,
    /// Download -> installer session opened for it.
    sessions: HashMap<DownloadId, SessionId>,
    /// Running while any download is active; forwards facility completion
    /// events into this task.
    listener: Option<JoinHandle<()>>,
}

impl CoordinatorTask {
    fn new(facilities: Facilities, commands: mpsc::UnboundedReceiver<Command>) -> Self {
        let (completions_tx, completions) = mpsc::unbounded_channel();
        let (relay, _) = broadcast::channel(RELAY_CAPACITY);

        Self {
            facilities,
            commands,
            completions,
            completions_tx,
            relay,
            active: HashMap::new(),
            sessions: HashMap::new(),
            listener: None,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                Some(download) = self.completions.recv() => {
                    self.on_download_complete(download).await;
                }
            }
        }
        self.deactivate_listener();
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Install {
                url,
                request,
                reply,
            } => {
                let result = self.start_install(&url, &request).await;
                if let Ok(Ticket { download, .. }) = &result {
                    let download = *download;
                    if reply.send(result).is_err() {
                        // Caller gave up before the download was registered.
                        self.release(&request.pkg_name, download).await;
                    }
                } else {
                    let _ = reply.send(result);
                }
            }
            Command::BeginSession { download, session } => {
                debug!(?download, ?session, "installer session opened");
                let _ = self.relay.send((download, InstallStep::Installing));
                self.sessions.insert(download, session);
            }
            Command::CancelSession { session } => {
                let download = self
                    .sessions
                    .iter()
                    .find(|(_, &mapped)| mapped == session)
                    .map(|(&download, _)| download);
                // Unknown sessions have already completed or been removed.
                if let Some(download) = download {
                    info!(?download, ?session, "install cancelled");
                    self.sessions.remove(&download);
                    let _ = self.relay.send((download, InstallStep::Error));
                    self.facilities.installer.abandon_session(session).await;
                }
            }
            Command::InstallResult {
                download,
                succeeded,
            } => {
                self.sessions.remove(&download);
                let step = if succeeded {
                    InstallStep::Installed
                } else {
                    InstallStep::Error
                };
                info!(?download, %step, "install finished");
                let _ = self.relay.send((download, step));
            }
            Command::SessionFor { download, reply } => {
                let _ = reply.send(self.sessions.get(&download).copied());
            }
            Command::Release { pkg_name, download } => {
                self.release(&pkg_name, download).await;
            }
        }
    }

    async fn start_install(
        &mut self,
        url: &Url,
        request: &InstallRequest,
    ) -> Result<Ticket, FacilityError> {
        let pkg_name = &request.pkg_name;

        // At most one outstanding request per package. Ending the old stream
        // with a terminal step frees its consumer instead of leaving it
        // polling a removed download.
        if let Some(old) = self.active.remove(pkg_name) {
            info!(%pkg_name, ?old, "superseding active download");
            self.facilities.downloads.remove(old).await;
            self.sessions.remove(&old);
            let _ = self.relay.send((old, InstallStep::Error));
        }

        self.activate_listener();

        let file_name = archive_file_name(url, pkg_name);
        let download = match self
            .facilities
            .downloads
            .enqueue(url, &request.name, &file_name)
            .await
        {
            Ok(download) => download,
            Err(err) => {
                if self.active.is_empty() {
                    self.deactivate_listener();
                }
                return Err(err);
            }
        };

        info!(%pkg_name, ?download, "download enqueued");
        self.active.insert(pkg_name.clone(), download);

        Ok(Ticket {
            download,
            events: self.relay.subscribe(),
        })
    }

    async fn on_download_complete(&mut self, download: DownloadId) {
        // Ignore completion events for downloads we did not request.
        if !self.active.values().any(|&active| active == download) {
            return;
        }

        match self.facilities.downloads.resolve_local_file(download).await {
            Some(archive) => {
                debug!(?download, archive = %archive.display(), "download complete");
                let _ = self.relay.send((download, InstallStep::Loading));
                self.facilities
                    .navigator
                    .confirm_install(download, &archive, PACKAGE_ARCHIVE_MIME);
            }
            None => {
                error!(?download, "could not locate downloaded archive");
                let _ = self.relay.send((download, InstallStep::Error));
            }
        }
    }

    async fn release(&mut self, pkg_name: &str, download: DownloadId) {
        // A newer request may have replaced this entry; only drop it if the
        // handle still matches.
        if self.active.get(pkg_name) == Some(&download) {
            self.active.remove(pkg_name);
            self.facilities.downloads.remove(download).await;
        }
        self.sessions.remove(&download);

        if self.active.is_empty() {
            self.deactivate_listener();
        }
    }

    /// Starts the completion listener if it is not already running.
    fn activate_listener(&mut self) {
        if self.listener.is_some() {
            return;
        }

        let mut events = self.facilities.downloads.completions();
        let forward = self.completions_tx.clone();
        self.listener = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(download) => {
                        if forward.send(download).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "completion listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    /// Stops the completion listener if it is running.
    fn deactivate_listener(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

/// File name hint for the download entry, taken from the last path segment
/// of the source url.
fn archive_file_name(url: &Url, pkg_name: &str) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .unwrap_or(pkg_name)
        .to_string()
}
