use std::path::PathBuf;

use bmsyncd::daemon::{DaemonConfig, DaemonRuntime};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Run,
    Once,
    Status,
    LinkFolder(PathBuf),
    Unlink(i64),
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    let mut args = args.into_iter().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--once" => mode = CliMode::Once,
            "--status" => mode = CliMode::Status,
            "--link-folder" => {
                let Some(dir) = args.next() else {
                    anyhow::bail!("--link-folder needs a directory");
                };
                mode = CliMode::LinkFolder(PathBuf::from(dir));
            }
            "--unlink" => {
                let Some(id) = args.next() else {
                    anyhow::bail!("--unlink needs an account id");
                };
                let id = id
                    .parse::<i64>()
                    .map_err(|_| anyhow::anyhow!("invalid account id: {id}"))?;
                mode = CliMode::Unlink(id);
            }
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: bmsyncd [--once | --status | --link-folder <dir> | --unlink <id>]");
        println!("  --once                Sync every account once and exit");
        println!("  --status              Print account sync status as JSON");
        println!("  --link-folder <dir>   Link a directory as a cloud account");
        println!("  --unlink <id>         Unlink an account and drop its sync state");
        return Ok(());
    }

    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    match mode {
        CliMode::Run => daemon.run().await,
        CliMode::Once => {
            let mut failed = false;
            for (account, result) in daemon.sync_once().await? {
                match result {
                    Ok(outcome) => println!("account {account}: {outcome:?}"),
                    Err(err) => {
                        failed = true;
                        println!("account {account}: failed: {err}");
                    }
                }
            }
            if failed {
                anyhow::bail!("some accounts failed to sync");
            }
            Ok(())
        }
        CliMode::Status => {
            let status = daemon.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        CliMode::LinkFolder(dir) => {
            let account = daemon.link_folder(&dir).await?;
            println!("linked account {} -> {}", account.id, account.auth_state);
            Ok(())
        }
        CliMode::Unlink(id) => {
            daemon.unlink(id).await?;
            println!("unlinked account {id}");
            Ok(())
        }
        CliMode::Help => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("bmsyncd")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parse_cli_mode_defaults_to_run() {
        assert_eq!(parse_cli_mode(args(&[])).unwrap(), CliMode::Run);
    }

    #[test]
    fn parse_cli_mode_supports_once_and_status() {
        assert_eq!(parse_cli_mode(args(&["--once"])).unwrap(), CliMode::Once);
        assert_eq!(parse_cli_mode(args(&["--status"])).unwrap(), CliMode::Status);
    }

    #[test]
    fn parse_cli_mode_reads_link_folder_dir() {
        assert_eq!(
            parse_cli_mode(args(&["--link-folder", "/mnt/share"])).unwrap(),
            CliMode::LinkFolder(PathBuf::from("/mnt/share"))
        );
        assert!(parse_cli_mode(args(&["--link-folder"])).is_err());
    }

    #[test]
    fn parse_cli_mode_reads_unlink_id() {
        assert_eq!(parse_cli_mode(args(&["--unlink", "3"])).unwrap(), CliMode::Unlink(3));
        assert!(parse_cli_mode(args(&["--unlink", "three"])).is_err());
    }

    #[test]
    fn parse_cli_mode_supports_help() {
        assert_eq!(parse_cli_mode(args(&["--help"])).unwrap(), CliMode::Help);
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_flags() {
        assert!(parse_cli_mode(args(&["--logout"])).is_err());
    }
}
