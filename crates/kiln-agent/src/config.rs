use std::{net::SocketAddr, path::PathBuf, time::Duration};

const DEFAULT_LOG_MAX_CHUNKS: usize = 2000;
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_STOP_COMMAND: &str = "stop\r";

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_millis(name: &str, default_ms: u64, min: u64, max: u64) -> Duration {
    Duration::from_millis(
        env_u64(name)
            .map(|v| v.clamp(min, max))
            .unwrap_or(default_ms),
    )
}

/// Resolve a possibly-relative data root against the working directory.
pub fn absolutize(raw: &str) -> PathBuf {
    let p = PathBuf::from(raw);
    let abs = if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    };

    // Best-effort canonicalization: don't fail if the directory doesn't exist yet.
    std::fs::canonicalize(&abs).unwrap_or(abs)
}

/// Supervisor settings, read once at startup.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub data_root: PathBuf,
    pub listen_addr: SocketAddr,
    pub java: String,
    pub log_max_chunks: usize,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub restart_delay: Duration,
    pub recovery_delay: Duration,
    pub exit_grace: Duration,
    pub stop_command: String,
    pub term_cols: u16,
    pub term_rows: u16,
    pub log_dir: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            data_root: absolutize("./data"),
            listen_addr: DEFAULT_LISTEN_ADDR
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 3000))),
            java: "java".to_string(),
            log_max_chunks: DEFAULT_LOG_MAX_CHUNKS,
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            restart_delay: Duration::from_secs(3),
            recovery_delay: Duration::from_secs(5),
            exit_grace: Duration::from_secs(2),
            stop_command: DEFAULT_STOP_COMMAND.to_string(),
            term_cols: 80,
            term_rows: 30,
            log_dir: None,
        }
    }
}

impl SupervisorConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let listen_addr = match env_string("KILN_LISTEN_ADDR") {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid KILN_LISTEN_ADDR {raw:?}: {e}"))?,
            None => defaults.listen_addr,
        };

        // The stop command is written verbatim; allow "\r" / "\n" escapes from env.
        let stop_command = env_string("KILN_STOP_COMMAND")
            .map(|s| s.replace("\\r", "\r").replace("\\n", "\n"))
            .unwrap_or(defaults.stop_command);

        Ok(Self {
            data_root: env_string("KILN_DATA_ROOT")
                .map(|v| absolutize(&v))
                .unwrap_or(defaults.data_root),
            listen_addr,
            java: env_string("KILN_JAVA").unwrap_or(defaults.java),
            log_max_chunks: env_usize("KILN_LOG_MAX_CHUNKS")
                .map(|v| v.clamp(100, 50_000))
                .unwrap_or(DEFAULT_LOG_MAX_CHUNKS),
            probe_interval: env_millis("KILN_PROBE_INTERVAL_MS", 5000, 1000, 10 * 60 * 1000),
            probe_timeout: env_millis("KILN_PROBE_TIMEOUT_MS", 2000, 100, 2000),
            restart_delay: env_millis("KILN_RESTART_DELAY_MS", 3000, 0, 10 * 60 * 1000),
            recovery_delay: env_millis("KILN_RECOVERY_DELAY_MS", 5000, 0, 10 * 60 * 1000),
            exit_grace: env_millis("KILN_EXIT_GRACE_MS", 2000, 0, 60_000),
            stop_command,
            term_cols: env_u64("KILN_TERM_COLS")
                .map(|v| v.clamp(10, 1000) as u16)
                .unwrap_or(defaults.term_cols),
            term_rows: env_u64("KILN_TERM_ROWS")
                .map(|v| v.clamp(10, 1000) as u16)
                .unwrap_or(defaults.term_rows),
            log_dir: env_string("KILN_LOG_DIR").map(|v| absolutize(&v)),
        })
    }

    pub fn servers_dir(&self) -> PathBuf {
        self.data_root.join("servers")
    }

    pub fn recovery_file(&self) -> PathBuf {
        self.data_root.join("restart-recovery.json")
    }
}
