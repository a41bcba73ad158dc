use std::io::{ErrorKind, Read, Write};
use std::process::Stdio;
use std::sync::Mutex;

use portable_pty::{CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Result, SupervisorError};
use crate::instance_config::{InstallPlan, LaunchPlan};

const READ_BUF_BYTES: usize = 8192;
const OUTPUT_QUEUE: usize = 1024;

/// Input side of a running console process.
pub trait ConsoleIo: Send + Sync {
    fn write(&mut self, data: &[u8]) -> std::io::Result<()>;
    fn resize(&mut self, cols: u16, rows: u16) -> std::io::Result<()>;
}

/// A spawned console process: its input handle plus output and exit notifications.
///
/// `output` closes once the process side of the terminal is gone; `exit` resolves with the
/// exit code (`None` when it could not be determined).
pub struct ConsoleProcess {
    pub pid: Option<u32>,
    pub io: Box<dyn ConsoleIo>,
    pub output: mpsc::Receiver<String>,
    pub exit: oneshot::Receiver<Option<i32>>,
}

/// A one-shot installer run. Output chunks are already tagged by stream.
pub struct InstallerProcess {
    pub output: mpsc::Receiver<String>,
    pub exit: oneshot::Receiver<Option<i32>>,
}

/// Process-spawn primitive used by the registry.
pub trait Launcher: Send + Sync + 'static {
    fn spawn_console(&self, plan: &LaunchPlan, cols: u16, rows: u16) -> Result<ConsoleProcess>;
    fn spawn_installer(&self, plan: &InstallPlan) -> Result<InstallerProcess>;
}

/// Decodes a byte stream into text, carrying split multi-byte sequences to the next chunk.
#[derive(Debug, Default)]
pub struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(std::str::from_utf8(&self.pending[..valid]).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            // Incomplete sequence at the end; wait for more bytes.
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    pub fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}

struct PtyConsole {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
}

fn poisoned<T>(_: T) -> std::io::Error {
    std::io::Error::other("pty handle lock poisoned")
}

impl ConsoleIo for PtyConsole {
    fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        let writer = self.writer.get_mut().map_err(poisoned)?;
        writer.write_all(data)?;
        writer.flush()
    }

    fn resize(&mut self, cols: u16, rows: u16) -> std::io::Result<()> {
        self.master
            .get_mut()
            .map_err(poisoned)?
            .resize(pty_size(cols, rows))
            .map_err(|e| std::io::Error::other(e.to_string()))
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn spawn_err(e: impl std::fmt::Display) -> SupervisorError {
    SupervisorError::Spawn(e.to_string())
}

/// Launches consoles on a native pseudo-terminal and installers as plain piped children.
#[derive(Debug, Default, Clone)]
pub struct PtyLauncher;

impl Launcher for PtyLauncher {
    fn spawn_console(&self, plan: &LaunchPlan, cols: u16, rows: u16) -> Result<ConsoleProcess> {
        let pair = native_pty_system()
            .openpty(pty_size(cols, rows))
            .map_err(spawn_err)?;

        let mut cmd = CommandBuilder::new(&plan.program);
        for arg in &plan.args {
            cmd.arg(arg);
        }
        cmd.cwd(&plan.cwd);
        cmd.env("TERM", "xterm-color");

        let mut child = pair.slave.spawn_command(cmd).map_err(spawn_err)?;
        // The child holds its own copy; keeping ours would stop the reader from seeing EOF.
        drop(pair.slave);

        let pid = child.process_id();
        let mut reader = pair.master.try_clone_reader().map_err(spawn_err)?;
        let writer = pair.master.take_writer().map_err(spawn_err)?;

        let (out_tx, out_rx) = mpsc::channel::<String>(OUTPUT_QUEUE);
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_BUF_BYTES];
            let mut utf8 = Utf8Carry::default();
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let text = utf8.decode(&buf[..n]);
                        if !text.is_empty() && out_tx.blocking_send(text).is_err() {
                            return;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            let rest = utf8.finish();
            if !rest.is_empty() {
                let _ = out_tx.blocking_send(rest);
            }
        });

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::task::spawn_blocking(move || {
            let code = match child.wait() {
                Ok(status) => Some(status.exit_code() as i32),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to wait for console process");
                    None
                }
            };
            let _ = exit_tx.send(code);
        });

        Ok(ConsoleProcess {
            pid,
            io: Box::new(PtyConsole {
                master: Mutex::new(pair.master),
                writer: Mutex::new(writer),
            }),
            output: out_rx,
            exit: exit_rx,
        })
    }

    fn spawn_installer(&self, plan: &InstallPlan) -> Result<InstallerProcess> {
        let mut child = tokio::process::Command::new(&plan.program)
            .args(&plan.args)
            .current_dir(&plan.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_err)?;

        let (out_tx, out_rx) = mpsc::channel::<String>(OUTPUT_QUEUE);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_tagged(stdout, "[Installer] ", out_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_tagged(stderr, "[Installer Error] ", out_tx.clone()));
        }
        drop(out_tx);

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to wait for installer");
                    None
                }
            };
            let _ = exit_tx.send(code);
        });

        Ok(InstallerProcess {
            output: out_rx,
            exit: exit_rx,
        })
    }
}

async fn forward_tagged<R>(stream: R, tag: &'static str, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(format!("{tag}{line}\r\n")).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_carry_joins_split_sequences() {
        let bytes = "héllo".as_bytes();
        // "é" is two bytes starting at index 1.
        let mut d = Utf8Carry::default();
        assert_eq!(d.decode(&bytes[..2]), "h");
        assert_eq!(d.decode(&bytes[2..]), "éllo");
        assert_eq!(d.finish(), "");
    }

    #[test]
    fn utf8_carry_replaces_invalid_bytes() {
        let mut d = Utf8Carry::default();
        assert_eq!(d.decode(b"a\xffb"), "a\u{FFFD}b");
    }

    #[test]
    fn utf8_carry_finish_flushes_truncated_tail() {
        let mut d = Utf8Carry::default();
        assert_eq!(d.decode(&[b'x', 0xE2, 0x82]), "x");
        assert_eq!(d.finish(), "\u{FFFD}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pty_console_reports_output_and_exit_code() {
        let plan = LaunchPlan {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "echo kiln-pty-ok; exit 7".to_string()],
            cwd: std::env::temp_dir(),
            method: crate::instance_config::LaunchMethod::Jar("none".to_string()),
        };
        let mut proc = PtyLauncher.spawn_console(&plan, 80, 30).unwrap();

        let mut seen = String::new();
        while let Ok(Some(chunk)) =
            tokio::time::timeout(std::time::Duration::from_secs(5), proc.output.recv()).await
        {
            seen.push_str(&chunk);
            if seen.contains("kiln-pty-ok") {
                break;
            }
        }
        assert!(seen.contains("kiln-pty-ok"), "output was {seen:?}");

        let code = tokio::time::timeout(std::time::Duration::from_secs(5), proc.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, Some(7));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn installer_output_is_tagged_by_stream() {
        let plan = InstallPlan {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "echo unpacking; echo broken 1>&2; exit 3".to_string(),
            ],
            cwd: std::env::temp_dir(),
        };
        let mut proc = PtyLauncher.spawn_installer(&plan).unwrap();

        let mut lines = Vec::new();
        while let Some(chunk) = proc.output.recv().await {
            lines.push(chunk);
        }
        assert!(lines.contains(&"[Installer] unpacking\r\n".to_string()));
        assert!(lines.contains(&"[Installer Error] broken\r\n".to_string()));
        assert_eq!(proc.exit.await.unwrap(), Some(3));
    }
}
