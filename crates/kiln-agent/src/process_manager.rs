use std::{
    collections::HashMap,
    path::Path,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use kiln_process::{DASHBOARD_CHANNEL, ObserverId, ServerEvent, ServerState};
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::{
    config::SupervisorConfig,
    error::{Result, SupervisorError},
    hub::{EventSender, ObserverHub},
    instance_config::{self, InstallPlan, LaunchPlan, Resolution},
    log_buffer::LogBuffer,
    pty::{ConsoleIo, ConsoleProcess, Launcher},
};

const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

const NOTICE_ALREADY_RUNNING: &str = "Server is already running.\r\n";
const NOTICE_STOPPING: &str = "\r\nSending stop command...\r\n";
const NOTICE_RESTART_SCHEDULED: &str =
    "\r\n[System] Server restart scheduled. Waiting for players to disconnect...\r\n";
const NOTICE_RESTART_CANCELLED: &str = "\r\n[System] Scheduled restart cancelled.\r\n";
const NOTICE_IDLE_RESTART: &str = "\r\n[Auto-Restart] Server is empty. Restarting now...\r\n";
const NOTICE_RELAUNCHING: &str = "[Auto-Restart] Server restarting...\r\n";

struct InstanceEntry {
    state: ServerState,
    /// Generation of the current console; exit callbacks from older runs are ignored.
    run_id: u64,
    console: Option<Box<dyn ConsoleIo>>,
    pid: Option<u32>,
    logs: LogBuffer,
    restart_scheduled: bool,
    restart_pending: bool,
    last_occupancy: Option<u32>,
}

impl InstanceEntry {
    fn new(max_chunks: usize) -> Self {
        Self {
            state: ServerState::Offline,
            run_id: 0,
            console: None,
            pid: None,
            logs: LogBuffer::new(max_chunks),
            restart_scheduled: false,
            restart_pending: false,
            last_occupancy: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSnapshot {
    pub name: String,
    pub state: ServerState,
    pub pid: Option<u32>,
    pub running: bool,
    pub restart_scheduled: bool,
    pub last_occupancy: Option<u32>,
}

struct Shared {
    cfg: Arc<SupervisorConfig>,
    launcher: Arc<dyn Launcher>,
    hub: ObserverHub,
    instances: Mutex<HashMap<String, InstanceEntry>>,
    relaunch_tx: mpsc::UnboundedSender<String>,
    next_run_id: AtomicU64,
}

/// Registry of supervised instances, keyed by instance name.
///
/// Every state change and every output chunk is published while the registry lock is held,
/// so a `join` (which snapshots under the same lock) never races a live event.
#[derive(Clone)]
pub struct ProcessManager {
    inner: Arc<Shared>,
}

impl ProcessManager {
    pub fn new(cfg: Arc<SupervisorConfig>, launcher: Arc<dyn Launcher>, hub: ObserverHub) -> Self {
        let (relaunch_tx, relaunch_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Shared {
            cfg,
            launcher,
            hub,
            instances: Mutex::new(HashMap::new()),
            relaunch_tx,
            next_run_id: AtomicU64::new(1),
        });
        tokio::spawn(relaunch_loop(Arc::downgrade(&inner), relaunch_rx));
        Self { inner }
    }

    pub fn hub(&self) -> &ObserverHub {
        &self.inner.hub
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.cfg
    }

    async fn publish(&self, name: &str, event: ServerEvent) {
        self.inner.hub.publish(name, event).await;
    }

    /// Live-only informational line; not kept in the history buffer.
    async fn notice(&self, name: &str, text: impl Into<String>) {
        self.publish(
            name,
            ServerEvent::Output {
                instance: name.to_string(),
                data: text.into(),
            },
        )
        .await;
    }

    async fn publish_status(&self, name: &str, state: ServerState, exit_code: Option<i32>) {
        self.publish(
            name,
            ServerEvent::Status {
                instance: name.to_string(),
                state,
                exit_code,
            },
        )
        .await;
    }

    async fn publish_restart_flag(&self, name: &str, scheduled: bool) {
        self.publish(
            name,
            ServerEvent::RestartFlag {
                instance: name.to_string(),
                scheduled,
            },
        )
        .await;
    }

    pub async fn state(&self, name: &str) -> ServerState {
        self.inner
            .instances
            .lock()
            .await
            .get(name)
            .map(|e| e.state)
            .unwrap_or(ServerState::Offline)
    }

    pub async fn is_running(&self, name: &str) -> bool {
        self.inner
            .instances
            .lock()
            .await
            .get(name)
            .is_some_and(|e| e.console.is_some())
    }

    pub async fn snapshot(&self) -> Vec<InstanceSnapshot> {
        let map = self.inner.instances.lock().await;
        let mut out: Vec<_> = map
            .iter()
            .map(|(name, e)| InstanceSnapshot {
                name: name.clone(),
                state: e.state,
                pid: e.pid,
                running: e.console.is_some(),
                restart_scheduled: e.restart_scheduled,
                last_occupancy: e.last_occupancy,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Names of instances that are currently Online (recovery checkpoint contents).
    pub async fn online_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .instances
            .lock()
            .await
            .iter()
            .filter(|(_, e)| e.console.is_some() && e.state == ServerState::Online)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Start an instance. A start while Installing/Starting/Online/Stopping is a no-op that only
    /// emits an informational line.
    pub async fn start(&self, name: &str) -> Result<StartOutcome> {
        let dir = instance_config::instance_dir(&self.inner.cfg.servers_dir(), name)?;

        if self.state(name).await.is_active() {
            self.notice(name, NOTICE_ALREADY_RUNNING).await;
            return Ok(StartOutcome::AlreadyRunning);
        }

        let resolution = match instance_config::resolve_launch(&self.inner.cfg.java, &dir, false)
            .await
        {
            Ok(v) => v,
            Err(e) => return Err(self.fail_start(name, e, false).await),
        };

        let plan = match resolution {
            Resolution::Ready(plan) => {
                if !self.reserve(name, ServerState::Starting).await {
                    return Ok(StartOutcome::AlreadyRunning);
                }
                plan
            }
            Resolution::NeedsInstall(install) => {
                if !self.reserve(name, ServerState::Installing).await {
                    return Ok(StartOutcome::AlreadyRunning);
                }
                match self.install_then_resolve(name, &install, &dir).await {
                    Ok(plan) => {
                        self.transition(name, ServerState::Starting).await;
                        plan
                    }
                    Err(e) => return Err(self.fail_start(name, e, true).await),
                }
            }
        };

        self.launch(name, plan).await
    }

    /// Check-and-set: claim the instance for a new run unless it is already active.
    async fn reserve(&self, name: &str, state: ServerState) -> bool {
        let mut map = self.inner.instances.lock().await;
        let e = map
            .entry(name.to_string())
            .or_insert_with(|| InstanceEntry::new(self.inner.cfg.log_max_chunks));
        if e.state.is_active() {
            self.notice(name, NOTICE_ALREADY_RUNNING).await;
            return false;
        }
        e.state = state;
        e.last_occupancy = None;
        self.publish_status(name, state, None).await;
        tracing::info!(instance = name, state = ?state, "server starting");
        true
    }

    async fn transition(&self, name: &str, state: ServerState) {
        let mut map = self.inner.instances.lock().await;
        let Some(e) = map.get_mut(name) else {
            return;
        };
        e.state = state;
        self.publish_status(name, state, None).await;
    }

    async fn fail_start(&self, name: &str, err: SupervisorError, reset: bool) -> SupervisorError {
        tracing::warn!(instance = name, code = err.code(), error = %err, "server start failed");
        self.notice(name, format!("Error: {err}\r\n")).await;
        if reset {
            let mut map = self.inner.instances.lock().await;
            if let Some(e) = map.get_mut(name)
                && e.console.is_none()
            {
                e.state = ServerState::Offline;
                self.publish_status(name, ServerState::Offline, None).await;
            }
        }
        err
    }

    async fn install_then_resolve(
        &self,
        name: &str,
        install: &InstallPlan,
        dir: &Path,
    ) -> Result<LaunchPlan> {
        self.notice(
            name,
            "Forge installer found. Installing server, this may take a while...\r\n",
        )
        .await;
        tracing::info!(instance = name, args = ?install.args, "running installer");

        let mut proc = self.inner.launcher.spawn_installer(install)?;
        while let Some(chunk) = proc.output.recv().await {
            self.record_output(name, None, chunk).await;
        }
        let code = proc.exit.await.ok().flatten();
        if code != Some(0) {
            return Err(SupervisorError::InstallerFailed { code });
        }
        self.notice(name, "Installation complete.\r\n").await;

        match instance_config::resolve_launch(&self.inner.cfg.java, dir, true).await? {
            Resolution::Ready(plan) => Ok(plan),
            Resolution::NeedsInstall(_) => Err(SupervisorError::MissingArtifact(
                "Installer did not produce a launchable server.".to_string(),
            )),
        }
    }

    async fn launch(&self, name: &str, plan: LaunchPlan) -> Result<StartOutcome> {
        if let Some(line) = plan.method_notice() {
            self.notice(name, format!("{line}\r\n")).await;
        }
        self.notice(name, format!("Executing: {}\r\n", plan.describe()))
            .await;

        let cfg = &self.inner.cfg;
        let ConsoleProcess {
            pid,
            io,
            output,
            exit,
        } = match self
            .inner
            .launcher
            .spawn_console(&plan, cfg.term_cols, cfg.term_rows)
        {
            Ok(p) => p,
            Err(e) => return Err(self.fail_start(name, e, true).await),
        };

        let run_id = self.inner.next_run_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut map = self.inner.instances.lock().await;
            let e = map
                .entry(name.to_string())
                .or_insert_with(|| InstanceEntry::new(cfg.log_max_chunks));
            e.run_id = run_id;
            e.console = Some(io);
            e.pid = pid;
            e.state = ServerState::Online;
            self.publish_status(name, ServerState::Online, None).await;
        }
        tracing::info!(instance = name, pid = ?pid, run_id, "server process spawned");

        tokio::spawn(
            self.clone()
                .watch_console(name.to_string(), run_id, output, exit),
        );
        Ok(StartOutcome::Started)
    }

    async fn watch_console(
        self,
        name: String,
        run_id: u64,
        mut output: mpsc::Receiver<String>,
        mut exit: oneshot::Receiver<Option<i32>>,
    ) {
        let code = loop {
            tokio::select! {
                biased;
                chunk = output.recv() => match chunk {
                    Some(chunk) => self.record_output(&name, Some(run_id), chunk).await,
                    None => break (&mut exit).await.ok().flatten(),
                },
                code = &mut exit => {
                    // The exit can overtake the last reads from the terminal.
                    while let Ok(Some(chunk)) =
                        tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, output.recv()).await
                    {
                        self.record_output(&name, Some(run_id), chunk).await;
                    }
                    break code.ok().flatten();
                }
            }
        };
        self.handle_exit(&name, run_id, code).await;
    }

    async fn record_output(&self, name: &str, run_id: Option<u64>, chunk: String) {
        let mut map = self.inner.instances.lock().await;
        let Some(e) = map.get_mut(name) else {
            return;
        };
        if let Some(run_id) = run_id
            && e.run_id != run_id
        {
            return;
        }
        e.logs.append(chunk.clone());
        self.publish(
            name,
            ServerEvent::Output {
                instance: name.to_string(),
                data: chunk,
            },
        )
        .await;
    }

    async fn handle_exit(&self, name: &str, run_id: u64, code: Option<i32>) {
        let mut map = self.inner.instances.lock().await;
        let Some(e) = map.get_mut(name) else {
            return;
        };
        if e.run_id != run_id || e.console.is_none() {
            return;
        }

        e.console = None;
        e.pid = None;
        e.last_occupancy = None;
        let crashed =
            matches!(e.state, ServerState::Starting | ServerState::Online) && code != Some(0);
        e.state = ServerState::Offline;
        let was_scheduled = std::mem::take(&mut e.restart_scheduled);
        let relaunch = std::mem::take(&mut e.restart_pending);

        let code_text = code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        self.notice(
            name,
            format!("\r\nServer stopped with exit code: {code_text}\r\n"),
        )
        .await;

        if crashed {
            tracing::warn!(instance = name, exit_code = ?code, "server exited unexpectedly");
            self.publish_status(name, ServerState::Crashed, code).await;
        } else {
            tracing::info!(instance = name, exit_code = ?code, "server stopped");
            self.publish_status(name, ServerState::Offline, code).await;
        }
        if was_scheduled {
            self.publish_restart_flag(name, false).await;
        }

        if relaunch {
            tracing::info!(
                instance = name,
                delay_ms = self.inner.cfg.restart_delay.as_millis() as u64,
                "auto-restart: relaunch queued"
            );
            self.notice(name, NOTICE_RELAUNCHING).await;
            let _ = self.inner.relaunch_tx.send(name.to_string());
        }
    }

    /// Graceful stop. Clears any scheduled or pending auto-restart.
    pub async fn stop(&self, name: &str) -> Result<()> {
        instance_config::validate_name(name)?;
        let mut map = self.inner.instances.lock().await;
        let Some(e) = map.get_mut(name) else {
            return Err(SupervisorError::NotRunning);
        };
        e.restart_pending = false;
        if std::mem::take(&mut e.restart_scheduled) {
            self.publish_restart_flag(name, false).await;
        }
        self.stop_locked(name, e).await
    }

    async fn stop_locked(&self, name: &str, e: &mut InstanceEntry) -> Result<()> {
        let Some(console) = e.console.as_mut() else {
            return Err(SupervisorError::NotRunning);
        };
        self.notice(name, NOTICE_STOPPING).await;
        console.write(self.inner.cfg.stop_command.as_bytes())?;

        e.state = ServerState::Stopping;
        self.publish_status(name, ServerState::Stopping, None).await;
        tracing::info!(instance = name, "stop command sent");
        Ok(())
    }

    /// Send the stop command to every running instance. Returns how many were asked to stop.
    pub async fn stop_all(&self) -> usize {
        let mut map = self.inner.instances.lock().await;
        let mut stopped = 0;
        for (name, e) in map.iter_mut() {
            if e.console.is_none() {
                continue;
            }
            e.restart_scheduled = false;
            e.restart_pending = false;
            match self.stop_locked(name, e).await {
                Ok(()) => stopped += 1,
                Err(err) => {
                    tracing::warn!(instance = %name, error = %err, "failed to send stop command")
                }
            }
        }
        stopped
    }

    /// Raw console input. Dropped when the instance has no running process.
    pub async fn send_input(&self, name: &str, data: &str) -> bool {
        let mut map = self.inner.instances.lock().await;
        let Some(console) = map.get_mut(name).and_then(|e| e.console.as_mut()) else {
            return false;
        };
        match console.write(data.as_bytes()) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(instance = name, error = %e, "console write failed");
                false
            }
        }
    }

    pub async fn resize(&self, name: &str, cols: u16, rows: u16) -> bool {
        let mut map = self.inner.instances.lock().await;
        let Some(console) = map.get_mut(name).and_then(|e| e.console.as_mut()) else {
            return false;
        };
        match console.resize(cols.max(1), rows.max(1)) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(instance = name, error = %e, "console resize failed");
                false
            }
        }
    }

    /// Subscribe an observer to an instance channel.
    ///
    /// Current status, the restart flag and the buffered history are queued to `tx` before the
    /// observer is registered, all under the registry lock.
    pub async fn join(&self, name: &str, observer: ObserverId, tx: EventSender) -> Result<()> {
        instance_config::validate_name(name)?;
        let map = self.inner.instances.lock().await;
        let (state, scheduled, history) = match map.get(name) {
            Some(e) => (e.state, e.restart_scheduled, e.logs.snapshot()),
            None => (ServerState::Offline, false, String::new()),
        };

        let _ = tx.send(ServerEvent::Status {
            instance: name.to_string(),
            state,
            exit_code: None,
        });
        let _ = tx.send(ServerEvent::RestartFlag {
            instance: name.to_string(),
            scheduled,
        });
        let _ = tx.send(ServerEvent::History {
            instance: name.to_string(),
            data: history,
        });
        self.inner.hub.subscribe(name, observer, tx).await;
        drop(map);
        Ok(())
    }

    pub async fn join_dashboard(&self, observer: ObserverId, tx: EventSender) {
        self.inner
            .hub
            .subscribe(DASHBOARD_CHANNEL, observer, tx)
            .await;
    }

    pub async fn leave(&self, observer: &ObserverId) {
        self.inner.hub.remove_observer(observer).await;
    }

    /// Flag the instance for restart once it is empty. Only valid while Online.
    pub async fn schedule_restart(&self, name: &str) -> Result<()> {
        instance_config::validate_name(name)?;
        let mut map = self.inner.instances.lock().await;
        let Some(e) = map
            .get_mut(name)
            .filter(|e| e.console.is_some() && e.state == ServerState::Online)
        else {
            return Err(SupervisorError::NotRunning);
        };
        if !e.restart_scheduled {
            e.restart_scheduled = true;
            tracing::info!(instance = name, "restart when idle scheduled");
            self.notice(name, NOTICE_RESTART_SCHEDULED).await;
        }
        self.publish_restart_flag(name, true).await;
        Ok(())
    }

    pub async fn cancel_restart(&self, name: &str) -> Result<()> {
        instance_config::validate_name(name)?;
        let mut map = self.inner.instances.lock().await;
        if let Some(e) = map.get_mut(name)
            && std::mem::take(&mut e.restart_scheduled)
        {
            tracing::info!(instance = name, "scheduled restart cancelled");
            self.notice(name, NOTICE_RESTART_CANCELLED).await;
        }
        self.publish_restart_flag(name, false).await;
        Ok(())
    }

    /// Feed one probe result. `None` means the query failed and is not treated as empty.
    ///
    /// Returns true when this reading triggered a restart-when-idle stop.
    pub async fn record_occupancy(&self, name: &str, players: Option<u32>) -> bool {
        let Some(players) = players else {
            return false;
        };
        let mut map = self.inner.instances.lock().await;
        let Some(e) = map.get_mut(name) else {
            return false;
        };
        e.last_occupancy = Some(players);

        if !(e.restart_scheduled
            && players == 0
            && e.console.is_some()
            && e.state == ServerState::Online)
        {
            return false;
        }

        e.restart_scheduled = false;
        e.restart_pending = true;
        self.publish_restart_flag(name, false).await;
        self.notice(name, NOTICE_IDLE_RESTART).await;
        tracing::info!(instance = name, "auto-restart: server is empty, stopping");

        if let Err(err) = self.stop_locked(name, e).await {
            tracing::warn!(instance = name, error = %err, "auto-restart stop failed");
            e.restart_pending = false;
            return false;
        }
        true
    }
}

async fn relaunch_loop(shared: Weak<Shared>, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(name) = rx.recv().await {
        let Some(inner) = shared.upgrade() else {
            break;
        };
        let delay = inner.cfg.restart_delay;
        let manager = ProcessManager { inner };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match manager.start(&name).await {
                Ok(outcome) => {
                    tracing::info!(instance = %name, outcome = ?outcome, "auto-restart: relaunched")
                }
                Err(e) => {
                    tracing::warn!(instance = %name, error = %e, "auto-restart: relaunch failed")
                }
            }
        });
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    async fn observe(pm: &ProcessManager, name: &str) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        pm.join(name, ObserverId::new(), tx).await.unwrap();
        rx
    }

    fn output_contains(ev: &ServerEvent, needle: &str) -> bool {
        matches!(ev, ServerEvent::Output { data, .. } if data.contains(needle))
    }

    #[tokio::test]
    async fn start_command_stop_end_to_end() {
        let (pm, _launcher, root) = manager_with_alpha("e2e");
        let mut rx = observe(&pm, "alpha").await;

        let initial = wait_for(&mut rx, |ev| matches!(ev, ServerEvent::History { .. })).await;
        assert!(is_status(&initial[0], ServerState::Offline));

        assert_eq!(pm.start("alpha").await.unwrap(), StartOutcome::Started);
        let seen = wait_for(&mut rx, |ev| is_status(ev, ServerState::Online)).await;
        assert!(seen.iter().any(|ev| is_status(ev, ServerState::Starting)));
        assert!(pm.is_running("alpha").await);

        assert!(pm.send_input("alpha", "say hi\n").await);
        wait_for(&mut rx, |ev| output_contains(ev, "hi")).await;

        pm.stop("alpha").await.unwrap();
        let seen = wait_for(&mut rx, |ev| is_status(ev, ServerState::Offline)).await;
        assert!(seen.iter().any(|ev| is_status(ev, ServerState::Stopping)));
        assert!(matches!(
            seen.last(),
            Some(ServerEvent::Status {
                exit_code: Some(0),
                ..
            })
        ));
        assert!(!seen.iter().any(|ev| is_status(ev, ServerState::Crashed)));
        assert!(!pm.is_running("alpha").await);

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn concurrent_starts_spawn_exactly_one_process() {
        let (pm, launcher, root) = manager_with_alpha("race");

        let starts = (0..8).map(|_| {
            let pm = pm.clone();
            async move { pm.start("alpha").await.unwrap() }
        });
        let outcomes = futures_util::future::join_all(starts).await;

        let started = outcomes
            .iter()
            .filter(|o| **o == StartOutcome::Started)
            .count();
        assert_eq!(started, 1);
        assert_eq!(launcher.spawned.load(Ordering::SeqCst), 1);

        pm.stop("alpha").await.unwrap();
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn late_join_gets_history_before_live_output() {
        let (pm, _launcher, root) = manager_with_alpha("replay");
        let mut first = observe(&pm, "alpha").await;
        pm.start("alpha").await.unwrap();

        pm.send_input("alpha", "one\r").await;
        pm.send_input("alpha", "two\r").await;
        wait_for(&mut first, |ev| output_contains(ev, "two")).await;

        let mut late = observe(&pm, "alpha").await;
        pm.send_input("alpha", "three\r").await;

        let seen = wait_for(&mut late, |ev| output_contains(ev, "three")).await;
        assert!(is_status(&seen[0], ServerState::Online));
        assert!(matches!(seen[1], ServerEvent::RestartFlag { scheduled: false, .. }));
        let ServerEvent::History { data, .. } = &seen[2] else {
            panic!("expected history third, got {:?}", seen[2]);
        };
        assert!(data.contains("one\r") && data.contains("two\r"));
        assert!(!data.contains("three"));
        // Nothing but live output after the replay.
        assert!(
            seen[3..]
                .iter()
                .all(|ev| matches!(ev, ServerEvent::Output { .. }))
        );

        pm.stop("alpha").await.unwrap();
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn manual_stop_overrides_scheduled_restart() {
        let (pm, launcher, root) = manager_with_alpha("manual-stop");
        let mut rx = observe(&pm, "alpha").await;
        pm.start("alpha").await.unwrap();
        wait_for(&mut rx, |ev| is_status(ev, ServerState::Online)).await;

        pm.schedule_restart("alpha").await.unwrap();
        assert!(!pm.record_occupancy("alpha", Some(3)).await);

        pm.stop("alpha").await.unwrap();
        wait_for(&mut rx, |ev| is_status(ev, ServerState::Offline)).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(launcher.spawned.load(Ordering::SeqCst), 1);
        assert_eq!(pm.state("alpha").await, ServerState::Offline);
        let snap = pm.snapshot().await;
        assert!(!snap[0].restart_scheduled);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn idle_restart_fires_once_and_relaunches() {
        let (pm, launcher, root) = manager_with_alpha("idle");
        let mut rx = observe(&pm, "alpha").await;
        pm.start("alpha").await.unwrap();
        wait_for(&mut rx, |ev| is_status(ev, ServerState::Online)).await;
        pm.schedule_restart("alpha").await.unwrap();

        let mut fired = Vec::new();
        for players in [2, 1, 0, 0] {
            fired.push(pm.record_occupancy("alpha", Some(players)).await);
        }
        assert_eq!(fired, vec![false, false, true, false]);

        wait_for(&mut rx, |ev| is_status(ev, ServerState::Offline)).await;
        wait_for(&mut rx, |ev| is_status(ev, ServerState::Online)).await;
        assert_eq!(launcher.spawned.load(Ordering::SeqCst), 2);

        pm.stop("alpha").await.unwrap();
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn failed_probe_is_not_treated_as_empty() {
        let (pm, _launcher, root) = manager_with_alpha("probe-fail");
        pm.start("alpha").await.unwrap();
        pm.schedule_restart("alpha").await.unwrap();

        assert!(!pm.record_occupancy("alpha", None).await);
        let snap = pm.snapshot().await;
        assert!(snap[0].restart_scheduled);
        assert_eq!(snap[0].last_occupancy, None);

        pm.stop("alpha").await.unwrap();
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn restart_flag_requires_running_server_and_cancel_is_idempotent() {
        let (pm, _launcher, root) = manager_with_alpha("flags");

        let err = pm.schedule_restart("alpha").await.unwrap_err();
        assert_eq!(err.code(), "not_running");

        pm.cancel_restart("alpha").await.unwrap();
        pm.cancel_restart("alpha").await.unwrap();
        assert!(pm.snapshot().await.is_empty());

        let err = pm.stop("alpha").await.unwrap_err();
        assert_eq!(err.code(), "not_running");
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn crash_is_reported_once_and_not_relaunched() {
        let (pm, launcher, root) = manager_with_alpha("crash");
        let mut rx = observe(&pm, "alpha").await;
        pm.start("alpha").await.unwrap();
        wait_for(&mut rx, |ev| is_status(ev, ServerState::Online)).await;

        pm.send_input("alpha", "crash\r").await;
        let seen = wait_for(&mut rx, |ev| is_status(ev, ServerState::Crashed)).await;
        assert!(matches!(
            seen.last(),
            Some(ServerEvent::Status {
                exit_code: Some(1),
                ..
            })
        ));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(pm.state("alpha").await, ServerState::Offline);
        assert_eq!(launcher.spawned.load(Ordering::SeqCst), 1);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn forge_installer_runs_before_launch() {
        let (pm, launcher, root) = manager_with_alpha("forge");
        add_forge_instance(&root);

        let mut rx = observe(&pm, "beta").await;
        pm.start("beta").await.unwrap();
        let seen = wait_for(&mut rx, |ev| is_status(ev, ServerState::Online)).await;

        let order: Vec<ServerState> = seen
            .iter()
            .filter_map(|ev| match ev {
                ServerEvent::Status { state, .. } => Some(*state),
                _ => None,
            })
            .collect();
        assert_eq!(
            order,
            vec![
                ServerState::Offline,
                ServerState::Installing,
                ServerState::Starting,
                ServerState::Online
            ]
        );
        assert_eq!(launcher.installs.load(Ordering::SeqCst), 1);

        let mut late = observe(&pm, "beta").await;
        let replay = wait_for(&mut late, |ev| matches!(ev, ServerEvent::History { .. })).await;
        assert!(matches!(
            replay.last(),
            Some(ServerEvent::History { data, .. }) if data.contains("[Installer] Successfully installed")
        ));

        pm.stop("beta").await.unwrap();
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn configuration_errors_leave_instance_offline() {
        let (pm, launcher, root) = manager_with_alpha("config-err");
        std::fs::create_dir_all(root.join("servers").join("empty")).unwrap();

        let err = pm.start("empty").await.unwrap_err();
        assert_eq!(err.code(), "missing_artifact");
        assert_eq!(pm.state("empty").await, ServerState::Offline);

        let err = pm.start("../etc").await.unwrap_err();
        assert_eq!(err.code(), "invalid_name");

        let err = pm.start("ghost").await.unwrap_err();
        assert_eq!(err.code(), "not_found");
        assert_eq!(launcher.spawned.load(Ordering::SeqCst), 0);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn input_to_stopped_instance_is_dropped() {
        let (pm, _launcher, root) = manager_with_alpha("drop-input");
        assert!(!pm.send_input("alpha", "say hi\n").await);
        assert!(!pm.resize("alpha", 120, 40).await);
        let _ = std::fs::remove_dir_all(root);
    }

    fn statuses(events: &[ServerEvent]) -> Vec<ServerState> {
        events
            .iter()
            .filter_map(|ev| match ev {
                ServerEvent::Status { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn installer_failure_returns_to_offline_without_retry() {
        let (pm, launcher, root) = manager_with_launcher(
            "installer-fail",
            EchoLauncher {
                installer_exit: 1,
                ..EchoLauncher::default()
            },
        );
        add_forge_instance(&root);
        let mut rx = observe(&pm, "beta").await;
        wait_for(&mut rx, |ev| matches!(ev, ServerEvent::History { .. })).await;

        let err = pm.start("beta").await.unwrap_err();
        assert_eq!(err.code(), "installer_failed");

        let seen = wait_for(&mut rx, |ev| is_status(ev, ServerState::Offline)).await;
        assert_eq!(
            statuses(&seen),
            vec![ServerState::Installing, ServerState::Offline]
        );
        assert!(seen.iter().any(|ev| output_contains(ev, "[Installer Error]")));
        assert!(seen.iter().any(|ev| output_contains(ev, "Error:")));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(launcher.installs.load(Ordering::SeqCst), 1);
        assert_eq!(launcher.spawned.load(Ordering::SeqCst), 0);
        assert_eq!(pm.state("beta").await, ServerState::Offline);
        assert!(!pm.is_running("beta").await);
        assert!(rx.try_recv().is_err());
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_and_instance_stays_offline() {
        let (pm, launcher, root) = manager_with_launcher(
            "spawn-fail",
            EchoLauncher {
                fail_spawn: true,
                ..EchoLauncher::default()
            },
        );
        let mut rx = observe(&pm, "alpha").await;
        wait_for(&mut rx, |ev| matches!(ev, ServerEvent::History { .. })).await;

        let err = pm.start("alpha").await.unwrap_err();
        assert_eq!(err.code(), "spawn_failed");

        let seen = wait_for(&mut rx, |ev| is_status(ev, ServerState::Offline)).await;
        assert_eq!(
            statuses(&seen),
            vec![ServerState::Starting, ServerState::Offline]
        );
        assert!(seen.iter().any(|ev| output_contains(ev, "Error:")));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(launcher.spawned.load(Ordering::SeqCst), 0);
        assert_eq!(pm.state("alpha").await, ServerState::Offline);
        assert!(!pm.is_running("alpha").await);
        assert!(rx.try_recv().is_err());
        let _ = std::fs::remove_dir_all(root);
    }
}
