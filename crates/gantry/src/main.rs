use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "gantry",
    version,
    about = "Gantry - reverse tunneling gateway (expose loopback services through a public server)"
)]
struct Cli {
    /// Path to gantry config file (.toml/.yaml/.yml). If omitted, uses GANTRY_CONFIG; then auto-detects gantry.toml > gantry.yaml > gantry.yml from CWD; then falls back to the per-user config dir.
    #[arg(long, env = "GANTRY_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Override the server session port from the config file.
    #[arg(long)]
    port: Option<u16>,

    /// Override the client's server address (host:port) from the config file.
    #[arg(long)]
    server: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    gantry::run(cli.config, cli.port, cli.server).await
}
