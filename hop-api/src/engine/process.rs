//! Engine that runs the tunnel as a child process
//!
//! The profile configuration is written to the runtime directory and handed
//! to the tunnel program. Its state is read back from the tunnel's own
//! control socket (`{"type":"status"}` request, one JSON line per reply).

use std::io;
use std::os::fd::BorrowedFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::{EngineHandle, StateListener};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::profile::Profile;
use crate::status::{level_for_engine_state, ConnectionLevel};

/// Reply of the tunnel control socket; only the state is used
#[derive(Debug, Deserialize)]
struct TunnelStatus {
    state: String,
}

/// Tunnel process currently under control
struct Running {
    pid: Pid,
    paused: Arc<AtomicBool>,
}

/// Runs one tunnel process at a time
pub struct ProcessEngine {
    config: EngineConfig,
    listener: Arc<dyn StateListener>,
    running: Mutex<Option<Running>>,
    /// Bumped for every start; monitors of older processes stay silent
    generation: Arc<AtomicU64>,
}

impl ProcessEngine {
    pub fn new(config: EngineConfig, listener: Arc<dyn StateListener>) -> Self {
        Self {
            config,
            listener,
            running: Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Write the profile configuration, pointing the tunnel at our control socket
    fn write_profile(&self, profile: &Profile) -> Result<PathBuf> {
        let mut table: toml::Table = profile
            .source
            .parse()
            .map_err(|e: toml::de::Error| Error::Import(e.message().to_string()))?;

        let common = table
            .entry("common")
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        if let toml::Value::Table(common) = common {
            common.insert(
                "control_socket".into(),
                toml::Value::String(self.config.control_socket.to_string_lossy().into_owned()),
            );
        }

        let content = toml::to_string(&table)
            .map_err(|e| Error::Config(format!("failed to write profile: {}", e)))?;

        std::fs::create_dir_all(&self.config.runtime_dir)?;
        let path = self.config.runtime_dir.join(format!("{}.toml", profile.uuid));
        std::fs::write(&path, content)?;

        // The file holds the pre-shared key
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(path)
    }

    fn signal(running: &Running, signal: Signal) {
        if let Err(e) = kill(running.pid, signal) {
            log::debug!("Failed to send {} to tunnel {}: {}", signal, running.pid, e);
        }
    }

    fn terminate(running: &Running) {
        if running.paused.load(Ordering::Relaxed) {
            Self::signal(running, Signal::SIGCONT);
        }
        Self::signal(running, Signal::SIGTERM);
    }
}

#[async_trait::async_trait]
impl EngineHandle for ProcessEngine {
    async fn start(&self, profile: &Profile) -> Result<()> {
        let mut running = self.running.lock().await;

        // A failed start leaves the previous tunnel and its monitor untouched
        let config_path = self.write_profile(profile)?;
        let spawned = Command::new(&self.config.command)
            .args(self.config.args_for(&config_path))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(Error::from)
            .and_then(|child| {
                let pid = child.id().ok_or_else(|| {
                    Error::Io(io::Error::other("tunnel process exited immediately"))
                })?;
                Ok((child, pid))
            });
        let (child, pid) = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                let _ = std::fs::remove_file(&config_path);
                return Err(e);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(previous) = running.take() {
            log::info!("Replacing running tunnel {}", previous.pid);
            Self::terminate(&previous);
        }

        log::info!(
            "Started tunnel for profile '{}' ({}), pid {}",
            profile.name,
            profile.uuid,
            pid
        );

        let paused = Arc::new(AtomicBool::new(false));
        self.listener.on_state(
            "CONNECTING",
            "Starting tunnel",
            ConnectionLevel::ConnectingNoReply,
        );

        let monitor = Monitor {
            generation,
            current: self.generation.clone(),
            listener: self.listener.clone(),
            control_socket: self.config.control_socket.clone(),
            poll_interval: self.config.poll_interval(),
            paused: paused.clone(),
            config_path,
        };
        tokio::spawn(monitor.run(child));

        *running = Some(Running {
            pid: Pid::from_raw(pid as i32),
            paused,
        });
        Ok(())
    }

    async fn stop(&self) {
        if let Some(running) = self.running.lock().await.take() {
            log::info!("Stopping tunnel {}", running.pid);
            Self::terminate(&running);
        }
    }

    async fn pause(&self) {
        let running = self.running.lock().await;
        if let Some(running) = running.as_ref() {
            if !running.paused.swap(true, Ordering::Relaxed) {
                Self::signal(running, Signal::SIGSTOP);
                self.listener
                    .on_state("USERPAUSE", "Paused by user", ConnectionLevel::VpnPaused);
            }
        }
    }

    async fn resume(&self) {
        let running = self.running.lock().await;
        if let Some(running) = running.as_ref() {
            if running.paused.swap(false, Ordering::Relaxed) {
                Self::signal(running, Signal::SIGCONT);
                self.listener.on_state(
                    "CONNECTING",
                    "Resumed by user",
                    ConnectionLevel::ConnectingNoReply,
                );
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn protect(&self, fd: BorrowedFd<'_>) -> Result<bool> {
        use nix::sys::socket::{setsockopt, sockopt};

        setsockopt(&fd, sockopt::Mark, &self.config.fwmark).map_err(io::Error::from)?;
        Ok(true)
    }

    #[cfg(not(target_os = "linux"))]
    fn protect(&self, _fd: BorrowedFd<'_>) -> Result<bool> {
        Ok(false)
    }
}

/// Watches one tunnel process and reports its state
struct Monitor {
    generation: u64,
    current: Arc<AtomicU64>,
    listener: Arc<dyn StateListener>,
    control_socket: PathBuf,
    poll_interval: Duration,
    paused: Arc<AtomicBool>,
    config_path: PathBuf,
}

impl Monitor {
    fn emit(&self, state: &str, message: &str, level: ConnectionLevel) {
        if self.current.load(Ordering::SeqCst) == self.generation {
            self.listener.on_state(state, message, level);
        }
    }

    async fn run(self, mut child: Child) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        let mut last_state: Option<String> = None;

        loop {
            tokio::select! {
                status = child.wait() => {
                    let message = match status {
                        Ok(status) => format!("Tunnel process exited ({})", status),
                        Err(e) => format!("Lost tunnel process: {}", e),
                    };
                    log::info!("{}", message);
                    self.emit("NOPROCESS", &message, ConnectionLevel::NotConnected);
                    let _ = std::fs::remove_file(&self.config_path);
                    break;
                }
                _ = ticker.tick() => {
                    if self.paused.load(Ordering::Relaxed) {
                        last_state = None;
                        continue;
                    }
                    match query_tunnel_state(&self.control_socket).await {
                        Ok(state) if last_state.as_deref() != Some(state.as_str()) => {
                            let (tag, level) = level_for_engine_state(&state);
                            self.emit(tag, &format!("Tunnel is {}", state), level);
                            last_state = Some(state);
                        }
                        Ok(_) => {}
                        Err(e) => log::debug!("Tunnel status unavailable: {}", e),
                    }
                }
            }
        }
    }
}

async fn query_tunnel_state(socket_path: &Path) -> io::Result<String> {
    let stream = UnixStream::connect(socket_path).await?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    writer.write_all(b"{\"type\":\"status\"}\n").await?;

    let mut line = String::new();
    tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut line))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no reply from tunnel"))??;

    let status: TunnelStatus = serde_json::from_str(line.trim())?;
    Ok(status.state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{ConfigImporter, TomlConfigImporter};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder(StdMutex<Vec<(String, ConnectionLevel)>>);

    impl StateListener for Recorder {
        fn on_state(&self, state: &str, _message: &str, level: ConnectionLevel) {
            self.0.lock().unwrap().push((state.to_string(), level));
        }
    }

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("hop-api-engine-{}", uuid::Uuid::new_v4()))
    }

    fn engine_config(dir: &Path, command: &str, args: &[&str]) -> EngineConfig {
        EngineConfig {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            runtime_dir: dir.to_path_buf(),
            control_socket: dir.join("tunnel.sock"),
            poll_interval_ms: 50,
            ..EngineConfig::default()
        }
    }

    fn profile() -> Profile {
        TomlConfigImporter
            .import("[common]\nkey = \"k\"\n\n[client]\nserver = \"127.0.0.1\"\n")
            .unwrap()
    }

    #[test]
    fn test_profile_file_points_at_control_socket() {
        let dir = temp_dir();
        let engine = ProcessEngine::new(
            engine_config(&dir, "true", &["{config}"]),
            Arc::new(Recorder::default()),
        );

        let profile = profile();
        let path = engine.write_profile(&profile).unwrap();
        let written: toml::Table = std::fs::read_to_string(&path).unwrap().parse().unwrap();
        let common = written["common"].as_table().unwrap();
        assert_eq!(
            common["control_socket"].as_str().unwrap(),
            dir.join("tunnel.sock").to_string_lossy()
        );
        assert_eq!(common["key"].as_str().unwrap(), "k");

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_process_exit_reports_not_connected() {
        let dir = temp_dir();
        let recorder = Arc::new(Recorder::default());
        let engine =
            ProcessEngine::new(engine_config(&dir, "true", &["{config}"]), recorder.clone());

        engine.start(&profile()).await.unwrap();

        let mut reported = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if recorder
                .0
                .lock()
                .unwrap()
                .iter()
                .any(|(_, level)| *level == ConnectionLevel::NotConnected)
            {
                reported = true;
                break;
            }
        }
        assert!(reported);

        let states = recorder.0.lock().unwrap().clone();
        assert_eq!(states[0], ("CONNECTING".to_string(), ConnectionLevel::ConnectingNoReply));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_failed_restart_keeps_reporting_previous_tunnel() {
        let dir = temp_dir();
        let recorder = Arc::new(Recorder::default());
        let engine = ProcessEngine::new(
            engine_config(&dir, "sh", &["-c", "sleep 0.3", "{config}"]),
            recorder.clone(),
        );

        engine.start(&profile()).await.unwrap();

        let mut broken = profile();
        broken.source = "not toml [".to_string();
        assert!(matches!(engine.start(&broken).await, Err(Error::Import(_))));
        assert!(!dir.join(format!("{}.toml", broken.uuid)).exists());

        let mut reported = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let last = recorder.0.lock().unwrap().last().map(|(_, level)| *level);
            if last == Some(ConnectionLevel::NotConnected) {
                reported = true;
                break;
            }
        }
        assert!(reported);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_pause_and_resume_report_levels() {
        let dir = temp_dir();
        let recorder = Arc::new(Recorder::default());
        let engine = ProcessEngine::new(
            engine_config(&dir, "sh", &["-c", "sleep 5", "{config}"]),
            recorder.clone(),
        );

        engine.start(&profile()).await.unwrap();
        engine.pause().await;
        engine.pause().await;
        engine.resume().await;
        engine.stop().await;

        let states = recorder.0.lock().unwrap().clone();
        let levels: Vec<_> = states.iter().map(|(_, level)| *level).collect();
        assert_eq!(
            &levels[..3],
            &[
                ConnectionLevel::ConnectingNoReply,
                ConnectionLevel::VpnPaused,
                ConnectionLevel::ConnectingNoReply,
            ]
        );

        let _ = std::fs::remove_dir_all(dir);
    }
}
