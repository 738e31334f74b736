/// Waits for Ctrl-C, forwarding visibility and sync requests to the scheduler
/// in the meantime: SIGUSR1 enters foreground mode, SIGUSR2 background mode,
/// SIGHUP asks for an immediate sync.
#[cfg(unix)]
async fn forward_signals(handle: &SchedulerHandle) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut foreground = signal(SignalKind::user_defined1())?;
    let mut background = signal(SignalKind::user_defined2())?;
    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for ctrl-c")?;
                return Ok(());
            }
            _ = foreground.recv() => {
                info!("switching to foreground schedule");
                handle.send(SchedulerCommand::Foreground);
            }
            _ = background.recv() => {
                info!("switching to background schedule");
                handle.send(SchedulerCommand::Background);
            }
            _ = hangup.recv() => {
                handle.send(SchedulerCommand::SyncNow(None));
            }
        }
    }
}

#[cfg(not(unix))]
async fn forward_signals(_handle: &SchedulerHandle) -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_data_root(home: &Path) -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| home.join(".local").join("share"))
        .join(APP_DIR_NAME)
}

fn default_temp_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR_NAME)
        .join("tmp")
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}
