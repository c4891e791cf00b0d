pub mod app;
pub mod config;
pub mod logging;
pub mod net;
pub mod tunnel;

pub async fn run(
    config_path: Option<std::path::PathBuf>,
    port_override: Option<u16>,
    server_override: Option<String>,
) -> anyhow::Result<()> {
    app::run(config_path, port_override, server_override).await
}
