pub mod admin;
pub mod app;
pub mod config;
pub mod logging;
pub mod net;
pub mod socks;
pub mod telemetry;
pub mod tunnel;

pub async fn run(
    config_path: Option<std::path::PathBuf>,
    role: app::Role,
) -> anyhow::Result<()> {
    app::run(config_path, role).await
}
