use anyhow::Result;
use chrono::Utc;

use crate::api::RemoteBackend;
use crate::config::Config;
use crate::status::StatusStore;
use crate::{logi, logok, logw};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub uploaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Push every locally completed reference image to remote storage so video
/// tasks can reference it by URL. Items whose recorded URL is still inside
/// the storage TTL are skipped unless `force` is set; upload failures are
/// recorded per item and do not stop the sweep.
pub async fn upload_elements(
    backend: &dyn RemoteBackend,
    config: &Config,
    force: bool,
) -> Result<UploadSummary> {
    let mut store = StatusStore::load(config.elements_status_path())?;
    let mut summary = UploadSummary::default();
    let now = Utc::now();
    let ttl = config.url_ttl();

    let keys: Vec<String> = store.all().map(|(key, _)| key.clone()).collect();
    for key in keys {
        let Some(item) = store.get(&key).cloned() else {
            continue;
        };
        if !item.is_completed() {
            logw(format!("{key}: not completed yet, nothing to upload"));
            continue;
        }
        if !force && item.fresh_url(ttl, now).is_some() {
            summary.skipped += 1;
            continue;
        }
        let Some(path) = item.output_path.clone().filter(|p| p.exists()) else {
            logw(format!("{key}: completed but local file is missing"));
            summary.failed += 1;
            continue;
        };

        let bytes = tokio::fs::read(&path).await?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.png", key.replace('/', "_")));
        match backend.upload(bytes, &filename).await {
            Ok(url) => {
                let mut updated = item;
                updated.record_url(url);
                store.upsert(updated)?;
                summary.uploaded += 1;
            }
            Err(err) => {
                logw(format!("{key}: upload failed: {err}"));
                summary.failed += 1;
            }
        }
    }

    if summary.uploaded > 0 {
        logok(format!("Uploaded {} reference images", summary.uploaded));
    }
    if summary.skipped > 0 {
        logi(format!(
            "{} reference images already have fresh URLs",
            summary.skipped
        ));
    }
    Ok(summary)
}
