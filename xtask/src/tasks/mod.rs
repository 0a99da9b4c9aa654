pub mod check;
pub mod classify;
pub mod records;
pub mod train;

use std::path::Path;

use anyhow::{Context, Result};

/// Creates `artifact_dir`, optionally clearing what a previous run left.
pub fn create_artifact_dir(artifact_dir: &Path, clean: bool) -> Result<()> {
    if clean {
        std::fs::remove_dir_all(artifact_dir).ok();
    }
    std::fs::create_dir_all(artifact_dir)
        .with_context(|| format!("creating artifact directory {}", artifact_dir.display()))
}

/// Timestamp used in saved model names, `hour_minute_day_month_year`.
pub fn timestamp() -> String {
    chrono::Local::now().format("%H_%M_%d_%m_%Y").to_string()
}
