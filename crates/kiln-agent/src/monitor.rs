use std::{collections::BTreeMap, sync::Arc, time::Duration};

use kiln_process::{DASHBOARD_CHANNEL, DashboardEntry, ProbeStatus, ServerEvent, ServerState};

use crate::{
    instance_config,
    process_manager::ProcessManager,
    status_query::{ServerStatus, StatusProbe},
};

/// Periodic occupancy prober. Drives restart-when-idle and the fleet dashboard.
pub struct Monitor<P> {
    manager: ProcessManager,
    probe: Arc<P>,
    interval: Duration,
}

impl<P: StatusProbe> Monitor<P> {
    pub fn new(manager: ProcessManager, probe: P) -> Self {
        let interval = manager.config().probe_interval;
        Self {
            manager,
            probe: Arc::new(probe),
            interval,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.interval).await;
                self.tick().await;
            }
        })
    }

    /// One probe cycle. Returns the dashboard map it published.
    pub async fn tick(&self) -> BTreeMap<String, DashboardEntry> {
        let running: Vec<_> = self
            .manager
            .snapshot()
            .await
            .into_iter()
            .filter(|s| s.running)
            .collect();

        let servers_dir = self.manager.config().servers_dir();
        let probes = running
            .iter()
            .filter(|s| s.state == ServerState::Online)
            .map(|s| {
                let dir = servers_dir.join(&s.name);
                let probe = self.probe.clone();
                let name = s.name.clone();
                async move {
                    let addr = instance_config::network_endpoint(&dir).await;
                    let res = probe.query(addr).await;
                    (name, res)
                }
            });
        // Queries run concurrently; each is bounded by the probe's own timeout.
        let results = futures_util::future::join_all(probes).await;

        let mut statuses = BTreeMap::<String, ServerStatus>::new();
        for (name, res) in results {
            match res {
                Ok(status) => {
                    self.manager
                        .record_occupancy(&name, Some(status.online))
                        .await;
                    statuses.insert(name, status);
                }
                Err(e) => {
                    tracing::debug!(instance = %name, error = %e, "status query failed");
                    self.manager.record_occupancy(&name, None).await;
                }
            }
        }

        let scheduled: BTreeMap<String, bool> = self
            .manager
            .snapshot()
            .await
            .into_iter()
            .map(|s| (s.name, s.restart_scheduled))
            .collect();

        let mut servers = BTreeMap::new();
        for s in running {
            let restart_scheduled = scheduled.get(&s.name).copied().unwrap_or(false);
            let entry = match statuses.remove(&s.name) {
                Some(st) => DashboardEntry {
                    status: ProbeStatus::Online,
                    players: st.online,
                    max_players: st.max,
                    version: st.version,
                    restart_scheduled,
                },
                None => DashboardEntry {
                    status: ProbeStatus::Starting,
                    players: 0,
                    max_players: 0,
                    version: None,
                    restart_scheduled,
                },
            };
            servers.insert(s.name, entry);
        }

        self.manager
            .hub()
            .publish(
                DASHBOARD_CHANNEL,
                ServerEvent::Dashboard {
                    servers: servers.clone(),
                },
            )
            .await;
        servers
    }
}
