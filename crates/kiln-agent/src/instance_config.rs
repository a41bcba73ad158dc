use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
};

use crate::error::{Result, SupervisorError};

pub const SETTINGS_FILE: &str = "mcmanager.json";
pub const PROPERTIES_FILE: &str = "server.properties";
pub const JVM_ARGS_FILE: &str = "user_jvm_args.txt";
pub const DEFAULT_GAME_PORT: u16 = 25565;

const MAX_NAME_LEN: usize = 64;
const DEFAULT_JAVA_ARGS: &str = "-Xmx2G -Xms1G";

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_')
}

/// Map a user-supplied display name onto the restricted instance-name alphabet.
pub fn sanitize_name(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| if is_name_char(c) { c } else { '_' })
        .collect()
}

/// Instance names double as directory names and channel keys.
pub fn validate_name(name: &str) -> Result<&str> {
    if name.is_empty() || name.len() > MAX_NAME_LEN || !name.chars().all(is_name_char) {
        return Err(SupervisorError::InvalidName(name.to_string()));
    }
    Ok(name)
}

pub fn instance_dir(servers_dir: &Path, name: &str) -> Result<PathBuf> {
    Ok(servers_dir.join(validate_name(name)?))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Fabric,
    Vanilla,
    Forge,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct PersistedSettings {
    #[serde(default, rename = "type")]
    kind: Option<ServerKind>,
    #[serde(default, rename = "javaArgs")]
    java_args: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSettings {
    pub kind: ServerKind,
    pub java_args: Vec<String>,
}

impl Default for InstanceSettings {
    fn default() -> Self {
        Self {
            kind: ServerKind::Fabric,
            java_args: split_args(DEFAULT_JAVA_ARGS),
        }
    }
}

fn split_args(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

/// Read `mcmanager.json`. A missing or unreadable file falls back to defaults.
pub async fn load_settings(dir: &Path) -> InstanceSettings {
    let path = dir.join(SETTINGS_FILE);
    let raw = match tokio::fs::read(&path).await {
        Ok(v) => v,
        Err(_) => return InstanceSettings::default(),
    };
    match serde_json::from_slice::<PersistedSettings>(&raw) {
        Ok(p) => {
            let defaults = InstanceSettings::default();
            let java_args = p
                .java_args
                .map(|s| split_args(&s))
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.java_args);
            InstanceSettings {
                kind: p.kind.unwrap_or(defaults.kind),
                java_args,
            }
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to parse instance settings; using defaults");
            InstanceSettings::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchMethod {
    Jar(String),
    ForgeShim(String),
    LegacyForge(String),
    RunScript(String),
}

/// Fully resolved command line for the console process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub method: LaunchMethod,
}

impl LaunchPlan {
    pub fn describe(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }

    /// Human-readable line announcing which launch method was picked.
    pub fn method_notice(&self) -> Option<String> {
        match &self.method {
            LaunchMethod::Jar(_) => None,
            LaunchMethod::ForgeShim(jar) => Some(format!("Using Forge shim: {jar}")),
            LaunchMethod::LegacyForge(jar) => Some(format!("Using legacy Forge jar: {jar}")),
            LaunchMethod::RunScript(script) => Some(format!("Using {script} script")),
        }
    }
}

/// Pre-launch installer invocation (Forge `--installServer`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Ready(LaunchPlan),
    NeedsInstall(InstallPlan),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct ForgeArtifacts {
    installer: Option<String>,
    shim: Option<String>,
    legacy: Option<String>,
    run_bat: bool,
    run_sh: bool,
}

fn detect_forge(files: &[String]) -> ForgeArtifacts {
    let is_shim = |f: &str| f.contains("-shim.jar");
    let is_installer = |f: &str| f.ends_with("installer.jar");

    ForgeArtifacts {
        installer: files.iter().find(|f| is_installer(f)).cloned(),
        shim: files.iter().find(|f| is_shim(f)).cloned(),
        legacy: files
            .iter()
            .find(|f| {
                f.starts_with("forge-")
                    && (f.ends_with("universal.jar") || f.ends_with("server.jar"))
                    && !is_installer(f)
                    && !is_shim(f)
            })
            .cloned(),
        run_bat: files.iter().any(|f| f == "run.bat"),
        run_sh: files.iter().any(|f| f == "run.sh"),
    }
}

impl ForgeArtifacts {
    fn needs_install(&self) -> bool {
        self.installer.is_some()
            && self.shim.is_none()
            && self.legacy.is_none()
            && !self.run_bat
            && !self.run_sh
    }
}

async fn list_files(dir: &Path) -> Result<Vec<String>> {
    let mut rd = match tokio::fs::read_dir(dir).await {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SupervisorError::NotFound(dir.display().to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    while let Some(entry) = rd.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            out.push(name.to_string());
        }
    }
    // Deterministic pick when several jars are present.
    out.sort();
    Ok(out)
}

/// Resolve the launch plan for an instance directory.
///
/// With `installed == false` a Forge instance that still needs its installer yields
/// `NeedsInstall`; after the installer ran the caller resolves again with `installed == true`.
pub async fn resolve_launch(java: &str, dir: &Path, installed: bool) -> Result<Resolution> {
    let files = list_files(dir).await?;
    let Some(first_jar) = files.iter().find(|f| f.ends_with(".jar")).cloned() else {
        return Err(SupervisorError::MissingArtifact(
            "No server JAR file found.".to_string(),
        ));
    };

    let settings = load_settings(dir).await;
    let jar_args = |jar: &str| {
        let mut args = settings.java_args.clone();
        args.extend(["-jar".to_string(), jar.to_string(), "nogui".to_string()]);
        args
    };

    if settings.kind != ServerKind::Forge {
        return Ok(Resolution::Ready(LaunchPlan {
            program: java.to_string(),
            args: jar_args(&first_jar),
            cwd: dir.to_path_buf(),
            method: LaunchMethod::Jar(first_jar),
        }));
    }

    let forge = detect_forge(&files);
    if !installed
        && forge.needs_install()
        && let Some(installer) = &forge.installer
    {
        return Ok(Resolution::NeedsInstall(InstallPlan {
            program: java.to_string(),
            args: vec![
                "-jar".to_string(),
                installer.clone(),
                "--installServer".to_string(),
            ],
            cwd: dir.to_path_buf(),
        }));
    }

    if let Some(shim) = forge.shim {
        return Ok(Resolution::Ready(LaunchPlan {
            program: java.to_string(),
            args: jar_args(&shim),
            cwd: dir.to_path_buf(),
            method: LaunchMethod::ForgeShim(shim),
        }));
    }
    if let Some(legacy) = forge.legacy {
        return Ok(Resolution::Ready(LaunchPlan {
            program: java.to_string(),
            args: jar_args(&legacy),
            cwd: dir.to_path_buf(),
            method: LaunchMethod::LegacyForge(legacy),
        }));
    }

    let (program, args, script) = if cfg!(windows) && forge.run_bat {
        (
            "cmd.exe".to_string(),
            vec!["/c".to_string(), "run.bat".to_string()],
            "run.bat",
        )
    } else if forge.run_sh {
        ("bash".to_string(), vec!["run.sh".to_string()], "run.sh")
    } else {
        return Err(SupervisorError::MissingArtifact(
            "Could not detect Forge startup method (No jar/script found). Did install fail?"
                .to_string(),
        ));
    };

    // The generated run scripts read memory flags from user_jvm_args.txt; ours always win.
    let jvm_args = dir.join(JVM_ARGS_FILE);
    if let Err(e) = tokio::fs::write(&jvm_args, settings.java_args.join("\n")).await {
        tracing::warn!(path = %jvm_args.display(), error = %e, "failed to write jvm args file");
    }

    Ok(Resolution::Ready(LaunchPlan {
        program,
        args,
        cwd: dir.to_path_buf(),
        method: LaunchMethod::RunScript(script.to_string()),
    }))
}

pub fn parse_server_port(properties: &str) -> Option<u16> {
    properties
        .lines()
        .map(str::trim)
        .find_map(|l| l.strip_prefix("server-port="))
        .and_then(|v| v.trim().parse::<u16>().ok())
        .filter(|p| *p != 0)
}

/// Status-query endpoint declared in `server.properties`; defaults to the game's standard port.
pub async fn network_endpoint(dir: &Path) -> SocketAddr {
    let port = tokio::fs::read_to_string(dir.join(PROPERTIES_FILE))
        .await
        .ok()
        .and_then(|s| parse_server_port(&s))
        .unwrap_or(DEFAULT_GAME_PORT);
    SocketAddr::from(([127, 0, 0, 1], port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir_for(test_name: &str) -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let mut dir = std::env::temp_dir();
        dir.push(format!(
            "kiln-agent-instance-{test_name}-{}-{n}-{ts}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"").unwrap();
    }

    #[test]
    fn sanitize_replaces_disallowed_characters() {
        assert_eq!(sanitize_name("My Server!"), "My_Server_");
        assert_eq!(sanitize_name("../etc"), "___etc");
        assert_eq!(sanitize_name("alpha-1_b"), "alpha-1_b");
    }

    #[test]
    fn validate_rejects_traversal_and_empty() {
        assert!(validate_name("alpha").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("../alpha").is_err());
        assert!(validate_name("a b").is_err());
        assert!(validate_name(&"x".repeat(65)).is_err());
    }

    #[test]
    fn forge_install_needed_only_without_launch_artifacts() {
        let files = vec!["forge-installer.jar".to_string()];
        assert!(detect_forge(&files).needs_install());

        let files = vec![
            "forge-installer.jar".to_string(),
            "forge-1.20.1-47.2.0-shim.jar".to_string(),
        ];
        assert!(!detect_forge(&files).needs_install());

        let files = vec!["forge-installer.jar".to_string(), "run.sh".to_string()];
        assert!(!detect_forge(&files).needs_install());
    }

    #[test]
    fn legacy_forge_jar_excludes_installer_and_shim() {
        let files = vec![
            "forge-1.12.2-installer.jar".to_string(),
            "forge-1.12.2-universal.jar".to_string(),
        ];
        let f = detect_forge(&files);
        assert_eq!(f.legacy.as_deref(), Some("forge-1.12.2-universal.jar"));
    }

    #[test]
    fn parse_server_port_reads_trimmed_value() {
        let props = "motd=hi\n  server-port= 25570 \nmax-players=20\n";
        assert_eq!(parse_server_port(props), Some(25570));
        assert_eq!(parse_server_port("server-port=abc"), None);
        assert_eq!(parse_server_port("motd=x"), None);
    }

    #[tokio::test]
    async fn missing_directory_is_not_found() {
        let dir = temp_dir_for("missing").join("nope");
        let err = resolve_launch("java", &dir, false).await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn directory_without_jar_is_missing_artifact() {
        let dir = temp_dir_for("nojar");
        touch(&dir, "server.properties");
        let err = resolve_launch("java", &dir, false).await.unwrap_err();
        assert_eq!(err.code(), "missing_artifact");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn fabric_uses_configured_java_args() {
        let dir = temp_dir_for("fabric");
        touch(&dir, "fabric-server-launch.jar");
        std::fs::write(
            dir.join(SETTINGS_FILE),
            br#"{"type":"fabric","javaArgs":"-Xmx4G -Xms2G"}"#,
        )
        .unwrap();

        let Resolution::Ready(plan) = resolve_launch("java", &dir, false).await.unwrap() else {
            panic!("expected ready plan");
        };
        assert_eq!(plan.program, "java");
        assert_eq!(
            plan.args,
            vec!["-Xmx4G", "-Xms2G", "-jar", "fabric-server-launch.jar", "nogui"]
        );
        assert_eq!(plan.method_notice(), None);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn forge_installer_then_shim() {
        let dir = temp_dir_for("forge");
        touch(&dir, "forge-installer.jar");
        std::fs::write(dir.join(SETTINGS_FILE), br#"{"type":"forge"}"#).unwrap();

        let res = resolve_launch("java", &dir, false).await.unwrap();
        let Resolution::NeedsInstall(install) = res else {
            panic!("expected installer step");
        };
        assert_eq!(
            install.args,
            vec!["-jar", "forge-installer.jar", "--installServer"]
        );

        // Simulate the installer output.
        touch(&dir, "forge-1.20.1-47.2.0-shim.jar");
        let Resolution::Ready(plan) = resolve_launch("java", &dir, true).await.unwrap() else {
            panic!("expected ready plan");
        };
        assert_eq!(
            plan.method,
            LaunchMethod::ForgeShim("forge-1.20.1-47.2.0-shim.jar".to_string())
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn forge_install_that_produced_nothing_is_an_error() {
        let dir = temp_dir_for("forge-empty");
        touch(&dir, "forge-installer.jar");
        std::fs::write(dir.join(SETTINGS_FILE), br#"{"type":"forge"}"#).unwrap();

        let err = resolve_launch("java", &dir, true).await.unwrap_err();
        assert_eq!(err.code(), "missing_artifact");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn forge_run_script_writes_jvm_args() {
        let dir = temp_dir_for("forge-script");
        touch(&dir, "forge-installer.jar");
        touch(&dir, "run.sh");
        std::fs::write(
            dir.join(SETTINGS_FILE),
            br#"{"type":"forge","javaArgs":"-Xmx3G -Xms1G"}"#,
        )
        .unwrap();

        let Resolution::Ready(plan) = resolve_launch("java", &dir, false).await.unwrap() else {
            panic!("expected ready plan");
        };
        assert_eq!(plan.program, "bash");
        assert_eq!(plan.args, vec!["run.sh"]);
        let jvm = std::fs::read_to_string(dir.join(JVM_ARGS_FILE)).unwrap();
        assert_eq!(jvm, "-Xmx3G\n-Xms1G");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn endpoint_defaults_without_properties() {
        let dir = temp_dir_for("endpoint");
        assert_eq!(network_endpoint(&dir).await.port(), DEFAULT_GAME_PORT);
        std::fs::write(dir.join(PROPERTIES_FILE), "server-port=25599\n").unwrap();
        assert_eq!(network_endpoint(&dir).await.port(), 25599);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
