//! ViewerController facade — public API consumed by the application.
//!
//! Owns at most one viewer session at a time. A session is the spawned
//! process, its command channel and, once the startup handshake has
//! answered, its polling tasks and exit watcher. It is stored as soon as the
//! process is spawned and removed by teardown.
//!
//! Teardown runs with the session lock held, whether triggered by `close`,
//! a re-entrant `open`, or the process exiting on its own. A generation
//! number keeps a stale exit watcher or a superseded `open` from touching a
//! newer session.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tempfile::TempPath;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::channel::CommandChannel;
use crate::error::{Result, ViewerError};
use crate::events::EventForwarder;
use crate::process::{self, ProcessSpec, ProcessStatus, ViewerProcess};
use crate::protocol;
use crate::scheduler::PollingScheduler;
use crate::types::{SignalQuery, SignalValue, ViewerConfig, ViewerState};

struct Session {
    generation: u64,
    process: ViewerProcess,
    channel: Arc<CommandChannel>,
    /// Empty until the handshake completes.
    scheduler: PollingScheduler,
    /// `None` while the startup handshake is in flight.
    exit_watch: Option<JoinHandle<()>>,
    /// Bundled setup script; removed when the session ends.
    _setup_script: Option<TempPath>,
}

impl Session {
    fn handshake_done(&self) -> bool {
        self.exit_watch.is_some()
    }

    fn stop_exit_watch(&self) {
        if let Some(watch) = &self.exit_watch {
            watch.abort();
        }
    }
}

struct Shared {
    config: ViewerConfig,
    events: Arc<EventForwarder>,
    /// Gates the selection poll; read live by the running task.
    follow: Arc<AtomicBool>,
    setup_done: AtomicBool,
    state: watch::Sender<ViewerState>,
    enabled: watch::Sender<bool>,
    can_follow: watch::Sender<bool>,
    time_cursor: watch::Sender<Option<String>>,
    session: Mutex<Option<Session>>,
    generation: AtomicU64,
}

/// Drives one external waveform viewer.
///
/// Cheap to clone; clones share the same session and observers. Dropping the
/// last clone kills a still-running viewer.
#[derive(Clone)]
pub struct ViewerController {
    shared: Arc<Shared>,
}

impl ViewerController {
    /// Fails with [`ViewerError::NotConfigured`] when no executable is set.
    pub fn new(config: ViewerConfig) -> Result<Self> {
        if config.executable().is_none() {
            return Err(ViewerError::NotConfigured);
        }

        let shared = Shared {
            events: Arc::new(EventForwarder::new(config.verbose)),
            follow: Arc::new(AtomicBool::new(false)),
            setup_done: AtomicBool::new(false),
            state: watch::Sender::new(ViewerState::Closed),
            enabled: watch::Sender::new(false),
            can_follow: watch::Sender::new(false),
            time_cursor: watch::Sender::new(None),
            session: Mutex::new(None),
            generation: AtomicU64::new(0),
            config,
        };
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// Launch the viewer on `wavefile`.
    ///
    /// A viewer that is already running is closed first. On failure the
    /// controller is left `Closed`. The session lock is not held during the
    /// startup handshake, so `close` can reap a viewer that never answers;
    /// the pending `open` then fails. Dropping the future mid-handshake
    /// leaves the controller `Opening` until `close`.
    pub async fn open(&self, wavefile: impl AsRef<Path>) -> Result<()> {
        let wavefile = wavefile.as_ref();
        let (generation, channel, handshake) = {
            let mut session = self.shared.session.lock().await;
            if let Some(previous) = session.take() {
                tracing::info!("Closing running viewer before opening {}", wavefile.display());
                previous.stop_exit_watch();
                self.shared.teardown(previous).await;
            }

            self.shared.set_up_capabilities();
            self.shared.state.send_replace(ViewerState::Opening);

            let (starting, handshake) = match self.shared.spawn_session(wavefile) {
                Ok(spawned) => spawned,
                Err(e) => {
                    tracing::warn!("Failed to open waveform viewer: {e}");
                    self.shared.state.send_replace(ViewerState::Closed);
                    return Err(e);
                }
            };
            let pending = (starting.generation, Arc::clone(&starting.channel), handshake);
            *session = Some(starting);
            pending
        };

        let reply = channel.exchange(&handshake).await;

        let mut session = self.shared.session.lock().await;
        let Some(mut starting) = session.take_if(|s| s.generation == generation) else {
            tracing::debug!("Viewer closed during startup");
            return Err(match reply {
                Ok(_) => ViewerError::NotRunning,
                Err(e) => ViewerError::Handshake(Box::new(e)),
            });
        };

        match reply {
            Ok(reply) => {
                tracing::debug!(reply = reply.trim(), "Viewer handshake complete");
                self.shared.start_running(&mut starting);
                tracing::info!(
                    pid = ?starting.process.pid(),
                    file = %wavefile.display(),
                    "Waveform viewer running"
                );
                *session = Some(starting);
                self.shared.state.send_replace(ViewerState::Running);
                self.shared.enabled.send_replace(true);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Failed to open waveform viewer: handshake failed: {e}");
                self.shared.teardown(starting).await;
                Err(ViewerError::Handshake(Box::new(e)))
            }
        }
    }

    /// Ask the viewer to exit, killing it after the shutdown grace period.
    /// A viewer still in its startup handshake is killed at once. Does
    /// nothing when no viewer is running.
    pub async fn close(&self) {
        let mut session = self.shared.session.lock().await;
        let Some(current) = session.take() else {
            return;
        };
        current.stop_exit_watch();
        self.shared.teardown(current).await;
    }

    /// Append `paths` to the viewer's displayed traces.
    pub async fn add_signals<I, S>(&self, paths: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let query = SignalQuery::new(paths)?;
        let channel = self.channel().await?;
        if query.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = query.paths().len(), "Adding signals to viewer");
        channel
            .send_all(&protocol::add_signals_commands(&query))
            .await
    }

    /// Values of `paths` at the viewer's time cursor, in the viewer's order.
    pub async fn get_signal_values<I, S>(&self, paths: I) -> Result<Vec<SignalValue>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let query = SignalQuery::new(paths)?;
        let channel = self.channel().await?;
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let (prelude, command) = protocol::signal_values_commands(&query);
        let reply = channel.exchange_after(&[prelude], &command).await?;
        let parsed = serde_json::from_str(reply.trim());
        parsed.map_err(|source| ViewerError::MalformedReply {
            payload: reply,
            source,
        })
    }

    /// Make the viewer reload the waveform file from disk.
    pub async fn refresh(&self) -> Result<()> {
        tracing::debug!("Reloading waveform");
        self.channel().await?.send(protocol::RELOAD).await
    }

    /// Toggle forwarding of the viewer's selection. Ignored by viewers that
    /// cannot report their selection.
    pub async fn set_follow_enabled(&self, enabled: bool) -> Result<()> {
        self.channel().await?;
        if protocol::CAN_FOLLOW_SELECTION {
            self.shared.follow.store(enabled, Ordering::SeqCst);
            tracing::debug!(enabled, "Follow selection toggled");
        }
        Ok(())
    }

    #[must_use]
    pub fn follow_enabled(&self) -> bool {
        self.shared.follow.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn state(&self) -> ViewerState {
        *self.shared.state.borrow()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == ViewerState::Running
    }

    /// Process id of the running viewer.
    pub async fn pid(&self) -> Option<u32> {
        let session = self.shared.session.lock().await;
        session.as_ref().and_then(|s| s.process.pid())
    }

    #[must_use]
    pub fn supported_extensions(&self) -> &[String] {
        &self.shared.config.extensions
    }

    /// Whether `path` has one of the supported extensions (case-insensitive).
    #[must_use]
    pub fn supports_file(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        self.supported_extensions()
            .iter()
            .any(|supported| supported.trim_start_matches('.').eq_ignore_ascii_case(ext))
    }

    /// Call `handler` with the arguments of every `name` event the viewer
    /// emits. Replaces a previous handler for the same name.
    pub fn on_event<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&[serde_json::Value]) + Send + Sync + 'static,
    {
        self.shared.events.register(name, handler);
    }

    pub fn remove_event_handler(&self, name: &str) -> bool {
        self.shared.events.unregister(name)
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ViewerState> {
        self.shared.state.subscribe()
    }

    /// "Viewer enabled": true exactly while a session is running.
    pub fn subscribe_enabled(&self) -> watch::Receiver<bool> {
        self.shared.enabled.subscribe()
    }

    /// "Can follow selection": set once the viewer's capabilities are known.
    pub fn subscribe_can_follow(&self) -> watch::Receiver<bool> {
        self.shared.can_follow.subscribe()
    }

    /// Last time-cursor position reported by the viewer. Changes whenever the
    /// user moves the cursor; reset to `None` on close.
    pub fn subscribe_time_cursor(&self) -> watch::Receiver<Option<String>> {
        self.shared.time_cursor.subscribe()
    }

    async fn channel(&self) -> Result<Arc<CommandChannel>> {
        let session = self.shared.session.lock().await;
        match session.as_ref() {
            Some(s) if s.handshake_done() && !s.channel.is_closed() => Ok(Arc::clone(&s.channel)),
            _ => Err(ViewerError::NotRunning),
        }
    }
}

impl std::fmt::Debug for ViewerController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewerController")
            .field("executable", &self.shared.config.executable())
            .field("state", &self.state())
            .field("follow", &self.follow_enabled())
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn set_up_capabilities(&self) {
        if self.setup_done.swap(true, Ordering::SeqCst) {
            return;
        }
        let capable = protocol::CAN_FOLLOW_SELECTION;
        self.follow
            .store(capable && self.config.follow, Ordering::SeqCst);
        self.can_follow.send_replace(capable);
        tracing::info!(can_follow = capable, "Viewer capabilities set up");
    }

    /// Spawn the viewer and wire up its channel. Returns the session and the
    /// handshake command to run against it.
    fn spawn_session(self: &Arc<Self>, wavefile: &Path) -> Result<(Session, String)> {
        let config = &self.config;
        let executable = config.executable().ok_or(ViewerError::NotConfigured)?;
        let (script, setup_script) = match &config.setup_script {
            Some(path) => (path.clone(), None),
            None => {
                let bundled = protocol::materialize_setup_script(config.sentinel)?;
                (bundled.to_path_buf(), Some(bundled))
            }
        };

        let (process, stdin, stdout) = ViewerProcess::start(ProcessSpec {
            executable,
            args: protocol::launch_args(&config.options, wavefile),
            env: &config.env,
            env_remove: &protocol::SCRUBBED_ENV,
            verbose: config.verbose,
        })?;
        let channel = Arc::new(CommandChannel::new(
            stdout,
            stdin,
            config.sentinel,
            Arc::clone(&self.events),
            config.exchange_timeout(),
        ));

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let session = Session {
            generation,
            process,
            channel,
            scheduler: PollingScheduler::new(),
            exit_watch: None,
            _setup_script: setup_script,
        };
        Ok((session, protocol::handshake_command(&script)))
    }

    /// Start polling and watching for exit once the handshake has answered.
    fn start_running(self: &Arc<Self>, session: &mut Session) {
        session.scheduler = self.start_polls(&session.channel);
        session.exit_watch = Some(tokio::spawn(watch_exit(
            Arc::downgrade(self),
            session.process.status_watch(),
            session.generation,
        )));
    }

    fn start_polls(self: &Arc<Self>, channel: &Arc<CommandChannel>) -> PollingScheduler {
        let mut scheduler = PollingScheduler::new();
        let period = self.config.poll_interval();

        let shared = Arc::downgrade(self);
        let time_channel = Arc::clone(channel);
        scheduler.add_task("time-cursor", period, move || {
            let shared = shared.clone();
            let channel = Arc::clone(&time_channel);
            async move {
                let reply = match channel.exchange(protocol::TELL_TIME_UPDATED).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        tracing::debug!("Time cursor poll failed: {e}");
                        return;
                    }
                };
                let time = reply.trim();
                if time.is_empty() {
                    return;
                }
                if let Some(shared) = shared.upgrade() {
                    shared.time_cursor.send_if_modified(|current| {
                        if current.as_deref() == Some(time) {
                            return false;
                        }
                        *current = Some(time.to_string());
                        true
                    });
                }
            }
        });

        let follow = Arc::clone(&self.follow);
        let events = Arc::clone(&self.events);
        let selection_channel = Arc::clone(channel);
        scheduler.add_task("selection", period, move || {
            let follow = Arc::clone(&follow);
            let events = Arc::clone(&events);
            let channel = Arc::clone(&selection_channel);
            async move {
                if !follow.load(Ordering::SeqCst) {
                    return;
                }
                match channel.exchange(protocol::TELL_SELECTED).await {
                    Ok(reply) => {
                        let reply = reply.trim();
                        if !reply.is_empty() {
                            events.try_dispatch(reply);
                        }
                    }
                    Err(e) => tracing::debug!("Selection poll failed: {e}"),
                }
            }
        });

        tracing::debug!(tasks = scheduler.len(), ?period, "Viewer polling started");
        scheduler
    }

    /// Stop polling, let the viewer exit (or kill it), and reset observers.
    async fn teardown(&self, mut session: Session) {
        self.state.send_replace(ViewerState::Closing);
        if !session.scheduler.is_empty() {
            session.scheduler.cancel_all().await;
        }

        // A pending handshake holds the writer; only a kill releases it.
        if session.handshake_done() && session.process.is_running() {
            let grace = self.config.shutdown_grace();
            let graceful = tokio::time::timeout(grace, async {
                session.channel.send(protocol::EXIT).await?;
                Ok::<_, ViewerError>(session.process.wait_exit().await)
            })
            .await;
            match graceful {
                Ok(Ok(code)) => tracing::debug!(code = ?code, "Viewer exited on request"),
                Ok(Err(e)) => tracing::debug!("Exit request not delivered: {e}"),
                Err(_) => tracing::debug!(?grace, "Viewer did not exit in time"),
            }
        }
        if session.process.is_running() {
            tracing::info!(pid = ?session.process.pid(), "Force closing waveform viewer");
            session.process.kill().await;
        }

        session.channel.shutdown().await;
        self.enabled.send_replace(false);
        self.time_cursor.send_replace(None);
        self.state.send_replace(ViewerState::Closed);
        tracing::info!(code = ?session.process.exit_code(), "Waveform viewer closed");
    }
}

/// Tear down session `generation` if its process exits on its own.
async fn watch_exit(
    shared: Weak<Shared>,
    status: watch::Receiver<ProcessStatus>,
    generation: u64,
) {
    let code = process::wait_for_exit(status).await;
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let mut session = shared.session.lock().await;
    if session.as_ref().is_some_and(|s| s.generation == generation)
        && let Some(ended) = session.take()
    {
        tracing::warn!(code = ?code, "Waveform viewer exited unexpectedly");
        shared.teardown(ended).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> ViewerController {
        ViewerController::new(ViewerConfig {
            path: Some("gtkwave".to_string()),
            ..ViewerConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_new_requires_executable() {
        assert!(matches!(
            ViewerController::new(ViewerConfig::default()),
            Err(ViewerError::NotConfigured)
        ));
    }

    #[test]
    fn test_supports_file_by_extension() {
        let viewer = controller();
        assert!(viewer.supports_file(Path::new("build/design.vcd")));
        assert!(viewer.supports_file(Path::new("DESIGN.FST")));
        assert!(!viewer.supports_file(Path::new("design.sv")));
        assert!(!viewer.supports_file(Path::new("vcd")));
    }

    #[tokio::test]
    async fn test_operations_before_open_are_not_running() {
        let viewer = controller();
        assert_eq!(viewer.state(), ViewerState::Closed);
        assert!(!viewer.is_running());
        assert!(matches!(
            viewer.add_signals(["top.clk"]).await,
            Err(ViewerError::NotRunning)
        ));
        assert!(matches!(
            viewer.get_signal_values(["top.clk"]).await,
            Err(ViewerError::NotRunning)
        ));
        assert!(matches!(viewer.refresh().await, Err(ViewerError::NotRunning)));
        assert!(matches!(
            viewer.set_follow_enabled(true).await,
            Err(ViewerError::NotRunning)
        ));
        assert_eq!(viewer.pid().await, None);
    }

    #[tokio::test]
    async fn test_invalid_paths_are_rejected_before_io() {
        let viewer = controller();
        assert!(matches!(
            viewer.add_signals(["top.{clk}"]).await,
            Err(ViewerError::InvalidSignalPath(_))
        ));
    }

    #[tokio::test]
    async fn test_close_without_open_is_a_no_op() {
        let viewer = controller();
        let mut enabled = viewer.subscribe_enabled();
        viewer.close().await;
        viewer.close().await;
        assert_eq!(viewer.state(), ViewerState::Closed);
        assert!(!*enabled.borrow_and_update());
        assert!(!enabled.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_open_missing_executable_stays_closed() {
        let viewer = ViewerController::new(ViewerConfig {
            path: Some("wavelink-no-such-viewer".to_string()),
            ..ViewerConfig::default()
        })
        .unwrap();
        let result = viewer.open("design.vcd").await;
        assert!(matches!(result, Err(ViewerError::ExecutableNotFound { .. })));
        assert_eq!(viewer.state(), ViewerState::Closed);
        assert!(!*viewer.subscribe_enabled().borrow());
        // Capabilities are known even though the launch failed.
        assert!(*viewer.subscribe_can_follow().borrow());
        assert!(viewer.follow_enabled());
    }
}
