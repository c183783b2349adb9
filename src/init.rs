use anyhow::Result;
use tokio::fs;

use crate::config::Config;
use crate::logi;

/// Create the output layout up front so later phases can assume it exists.
pub async fn ensure_directories(config: &Config, scenario_stem: &str) -> Result<()> {
    for dir in [
        config.elements_dir(),
        config.shots_dir(scenario_stem),
    ] {
        if !dir.exists() {
            fs::create_dir_all(&dir).await?;
            logi(format!("Created directory: {}", dir.display()));
        }
    }
    Ok(())
}
