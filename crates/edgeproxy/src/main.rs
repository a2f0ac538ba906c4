mod edgeproxy;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "edgeproxy",
    version,
    about = "edgeproxy - tunnel TCP through a WebSocket edge"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses EDGEPROXY_CONFIG; then auto-detects edgeproxy.toml > edgeproxy.yaml > edgeproxy.yml from CWD; then falls back to the OS default path (Linux: /etc/edgeproxy/edgeproxy.toml; others: user config dir).
    #[arg(long, env = "EDGEPROXY_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    edgeproxy::run(cli.config).await
}
