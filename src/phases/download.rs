use anyhow::Result;
use std::path::PathBuf;

use crate::api::RemoteBackend;
use crate::config::Config;
use crate::materialize::materialize;
use crate::status::StatusStore;
use crate::{logi, logw};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct DownloadSummary {
    pub downloaded: usize,
    pub present: usize,
    pub failed: usize,
}

/// Re-fetch completed artifacts whose local file has gone missing, across
/// both the shared element store and the scenario's shot store. Remote URLs
/// may have expired, so individual failures are reported and skipped.
pub async fn download_missing(
    backend: &dyn RemoteBackend,
    config: &Config,
    stem: &str,
) -> Result<DownloadSummary> {
    let mut summary = DownloadSummary::default();
    for path in [
        config.elements_status_path(),
        config.scenario_status_path(stem),
    ] {
        sweep_store(backend, path, &mut summary).await?;
    }
    logi(format!(
        "Download sweep: {} fetched, {} already present, {} failed",
        summary.downloaded, summary.present, summary.failed
    ));
    Ok(summary)
}

async fn sweep_store(
    backend: &dyn RemoteBackend,
    store_path: PathBuf,
    summary: &mut DownloadSummary,
) -> Result<()> {
    let store = StatusStore::load(store_path)?;
    for (key, item) in store.all() {
        if !item.is_completed() {
            continue;
        }
        let Some(dest) = item.output_path.as_deref() else {
            continue;
        };
        if dest.exists() {
            summary.present += 1;
            continue;
        }
        let Some(url) = item.url.as_deref() else {
            logw(format!("{key}: file missing and no URL on record"));
            summary.failed += 1;
            continue;
        };
        match materialize(backend, url, dest).await {
            Ok(_) => summary.downloaded += 1,
            Err(err) => {
                logw(format!("{key}: re-download failed: {err}"));
                summary.failed += 1;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::TaskStatus;
    use crate::error::Result as PipelineResult;
    use crate::status::{Phase, WorkItem, WorkStatus};
    use async_trait::async_trait;
    use serde_json::json;

    struct CdnBackend;

    #[async_trait]
    impl RemoteBackend for CdnBackend {
        async fn submit(&self, _request: &serde_json::Value) -> PipelineResult<String> {
            unimplemented!("not used here")
        }
        async fn poll(&self, _task_id: &str) -> PipelineResult<TaskStatus> {
            unimplemented!("not used here")
        }
        async fn fetch(&self, url: &str) -> PipelineResult<Vec<u8>> {
            Ok(url.as_bytes().to_vec())
        }
        async fn upload(&self, _bytes: Vec<u8>, _filename: &str) -> PipelineResult<String> {
            unimplemented!("not used here")
        }
    }

    fn config_in(dir: &std::path::Path) -> Config {
        serde_json::from_str(&format!(
            r#"{{"api": {{"api_key": "k"}}, "output": {{"base_dir": {:?}}}}}"#,
            dir.join("output")
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn refetches_only_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());

        let present_path = dir.path().join("output/intro/shots/scene_1.mp4");
        std::fs::create_dir_all(present_path.parent().unwrap()).unwrap();
        std::fs::write(&present_path, b"already here").unwrap();
        let missing_path = dir.path().join("output/intro/shots/scene_2.mp4");

        let mut store = StatusStore::load(config.scenario_status_path("intro")).unwrap();
        for (key, path, url) in [
            ("1", &present_path, "https://cdn.example/1.mp4"),
            ("2", &missing_path, "https://cdn.example/2.mp4"),
        ] {
            let mut item = WorkItem::new(key, Phase::Shots, json!({}));
            item.status = WorkStatus::Completed;
            item.output_path = Some(path.clone());
            item.record_url(url);
            store.upsert(item).unwrap();
        }
        drop(store);

        let summary = download_missing(&CdnBackend, &config, "intro").await.unwrap();
        assert_eq!(summary.downloaded, 1);
        assert_eq!(summary.present, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(
            std::fs::read(&missing_path).unwrap(),
            b"https://cdn.example/2.mp4"
        );
        // The file that was already on disk is left alone.
        assert_eq!(std::fs::read(&present_path).unwrap(), b"already here");
    }

    #[tokio::test]
    async fn missing_url_counts_as_failure_without_stopping() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());

        let mut store = StatusStore::load(config.scenario_status_path("intro")).unwrap();
        let mut no_url = WorkItem::new("1", Phase::Shots, json!({}));
        no_url.status = WorkStatus::Completed;
        no_url.output_path = Some(dir.path().join("output/intro/shots/scene_1.mp4"));
        store.upsert(no_url).unwrap();

        let fetch_path = dir.path().join("output/intro/shots/scene_2.mp4");
        let mut ok = WorkItem::new("2", Phase::Shots, json!({}));
        ok.status = WorkStatus::Completed;
        ok.output_path = Some(fetch_path.clone());
        ok.record_url("https://cdn.example/2.mp4");
        store.upsert(ok).unwrap();
        drop(store);

        let summary = download_missing(&CdnBackend, &config, "intro").await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.downloaded, 1);
        assert!(fetch_path.exists());
    }
}
