use std::env;
use std::path::PathBuf;

use anyhow::Context;
use camlink_lib::config::Settings;

/// `camlink <path>` or `camlink --config <path>`; defaults apply without one
fn parse_config_path() -> Option<PathBuf> {
    let args: Vec<String> = env::args().collect();

    for i in 1..args.len() {
        if (args[i] == "--config" || args[i] == "-c") && i + 1 < args.len() {
            return Some(PathBuf::from(&args[i + 1]));
        }
    }

    args.get(1).filter(|arg| !arg.starts_with('-')).map(PathBuf::from)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = match parse_config_path() {
        Some(path) => Settings::load(&path).with_context(|| format!("loading {}", path.display()))?,
        None => Settings::default(),
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(settings.log_level.as_str())).init();
    log::info!("camlink {} starting", env!("CARGO_PKG_VERSION"));

    camlink_lib::run(settings).await
}
