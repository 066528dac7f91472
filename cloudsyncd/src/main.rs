use cloudsyncd::config::SyncConfig;
use cloudsyncd::daemon::DaemonRuntime;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Once,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--once" => mode = CliMode::Once,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: cloudsyncd [--once]");
        println!("  --once   Run a single sync and exit");
        return Ok(());
    }

    let config = SyncConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    if mode == CliMode::Once {
        let summary = daemon.run_once().await?;
        if summary.failed > 0 {
            anyhow::bail!("{} item(s) failed to sync", summary.failed);
        }
        return Ok(());
    }
    daemon.run().await
}
