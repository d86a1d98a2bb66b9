mod subway;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "subway",
    version,
    about = "subway - self-hosted reverse tunnel server and client"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses SUBWAY_CONFIG; then auto-detects subway.toml > subway.yaml > subway.yml from CWD; then falls back to the OS default path (Linux: /etc/subway/subway.toml; others: user config dir).
    #[arg(long, env = "SUBWAY_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    subway::run(cli.config).await
}
