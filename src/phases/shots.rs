use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::api::RemoteBackend;
use crate::api::kie::{ElementRef, ShotPrompt, multi_shot_task_body};
use crate::config::Config;
use crate::driver::{PhaseSummary, WorkPlan, run_phase};
use crate::scenario::{Scenario, Scene};
use crate::status::{Phase, StatusStore, WorkItem, WorkStatus};
use crate::{logi, logw};

/// Upstream limits on one multi-shot video task.
const MAX_SHOTS_PER_TASK: usize = 6;
const MAX_SECONDS_PER_TASK: u32 = 15;

/// A scene slice small enough for one video task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneChunk {
    /// `{scene_id}` when the scene fits in one task, `{scene_id}_part{n}`
    /// otherwise. Doubles as the status key and the clip filename stem.
    pub key: String,
    pub shot_indices: Vec<usize>,
}

/// Split a scene into task-sized chunks: at most six shots and fifteen
/// seconds per chunk, preserving shot order. A single shot over the duration
/// cap still gets its own chunk; the API clamps it server-side.
pub fn chunk_scene(scene: &Scene) -> Vec<SceneChunk> {
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut current_secs = 0u32;

    for (index, shot) in scene.shots.iter().enumerate() {
        let over_count = current.len() >= MAX_SHOTS_PER_TASK;
        let over_secs = !current.is_empty() && current_secs + shot.duration > MAX_SECONDS_PER_TASK;
        if over_count || over_secs {
            groups.push(std::mem::take(&mut current));
            current_secs = 0;
        }
        current.push(index);
        current_secs += shot.duration;
    }
    if !current.is_empty() {
        groups.push(current);
    }

    let single = groups.len() == 1;
    groups
        .into_iter()
        .enumerate()
        .map(|(part, shot_indices)| SceneChunk {
            key: if single {
                scene.id.clone()
            } else {
                format!("{}_part{part}", scene.id)
            },
            shot_indices,
        })
        .collect()
}

/// Resolve usable reference URLs for the named elements, re-uploading from
/// local files where the recorded URL has aged past the storage TTL. Returns
/// `None` when some element ended up with no usable reference at all.
async fn element_refs(
    backend: &dyn RemoteBackend,
    config: &Config,
    scenario: &Scenario,
    names: &[String],
) -> Result<Option<Vec<ElementRef>>> {
    let mut store = StatusStore::load(config.elements_status_path())?;
    let now = Utc::now();
    let ttl = config.url_ttl();
    let mut refs = Vec::new();

    for name in names {
        let description = scenario
            .element(name)
            .map(|e| e.description.clone())
            .unwrap_or_default();
        let prefix = format!("{name}/view_");
        let keys: Vec<String> = store
            .all()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| key.clone())
            .collect();

        let mut image_urls = Vec::new();
        for key in keys {
            let Some(item) = store.get(&key).cloned() else {
                continue;
            };
            if !item.is_completed() {
                continue;
            }
            if let Some(url) = item.fresh_url(ttl, now) {
                image_urls.push(url.to_string());
                continue;
            }
            // Expired or never uploaded; refresh from the local copy.
            let Some(path) = item.output_path.clone().filter(|p| p.exists()) else {
                logw(format!("{key}: no fresh URL and no local file to re-upload"));
                continue;
            };
            let bytes = tokio::fs::read(&path).await?;
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("{name}.png"));
            let url = backend
                .upload(bytes, &filename)
                .await
                .with_context(|| format!("re-uploading reference image for {key}"))?;
            let mut updated = item;
            updated.record_url(url.clone());
            store.upsert(updated)?;
            image_urls.push(url);
        }

        if image_urls.is_empty() {
            logw(format!("element '{name}' has no usable reference images"));
            return Ok(None);
        }
        refs.push(ElementRef {
            name: name.clone(),
            description,
            image_urls,
        });
    }
    Ok(Some(refs))
}

/// Plan and run the video tasks for a scenario's scenes. `scene_filter`
/// narrows the run to the named scene ids.
pub async fn generate_shots(
    backend: Arc<dyn RemoteBackend>,
    config: &Config,
    scenario: &Scenario,
    stem: &str,
    scene_filter: Option<&[String]>,
    force: bool,
) -> Result<PhaseSummary> {
    let mut plans = Vec::new();
    // Scenes whose references cannot be resolved fail on their own; the
    // remaining scenes still get planned and submitted.
    let mut planning_failures: Vec<(String, String)> = Vec::new();
    let mut repaired = false;
    for scene in &scenario.scenes {
        if let Some(filter) = scene_filter {
            if !filter.iter().any(|id| id == &scene.id) {
                continue;
            }
        }
        let refs = match resolve_scene_refs(&backend, config, scenario, scene, &mut repaired).await
        {
            Ok(refs) => refs,
            Err(err) => {
                let cause = format!("reference resolution failed: {err:#}");
                logw(format!("scene {}: {cause}", scene.id));
                for chunk in chunk_scene(scene) {
                    planning_failures.push((chunk.key, cause.clone()));
                }
                continue;
            }
        };
        let negative = scenario.scene_negative(scene);

        for chunk in chunk_scene(scene) {
            let shots: Vec<ShotPrompt> = chunk
                .shot_indices
                .iter()
                .map(|&i| {
                    let shot = &scene.shots[i];
                    ShotPrompt {
                        prompt: scenario.shot_prompt(scene, shot),
                        duration: shot.duration,
                    }
                })
                .collect();
            plans.push(WorkPlan {
                key: chunk.key.clone(),
                phase: Phase::Shots,
                request: multi_shot_task_body(
                    &shots,
                    &refs,
                    &negative,
                    &config.generation.mode,
                    &config.generation.aspect_ratio,
                    config.generation.cfg_scale,
                ),
                output_path: config
                    .shots_dir(stem)
                    .join(format!("scene_{}.mp4", chunk.key)),
            });
        }
    }

    logi(format!("Generating {} scene clips for {stem}", plans.len()));
    let mut store = StatusStore::load(config.scenario_status_path(stem))?;
    for (key, cause) in &planning_failures {
        let mut item = store
            .get(key)
            .cloned()
            .unwrap_or_else(|| WorkItem::new(key.clone(), Phase::Shots, serde_json::Value::Null));
        item.status = WorkStatus::Failed;
        item.error = Some(cause.clone());
        store.upsert(item)?;
    }
    let store = Arc::new(Mutex::new(store));
    let mut summary =
        run_phase(backend, store, plans, super::driver_options(config, force)).await?;
    summary.failed += planning_failures.len();
    summary.failures.extend(planning_failures);
    Ok(summary)
}

/// Resolve references for one scene, with a single shared repair attempt:
/// when a reference is missing, rerun the element phase for unfinished items
/// and push the images up before giving up on the scene.
async fn resolve_scene_refs(
    backend: &Arc<dyn RemoteBackend>,
    config: &Config,
    scenario: &Scenario,
    scene: &Scene,
    repaired: &mut bool,
) -> Result<Vec<ElementRef>> {
    loop {
        match element_refs(backend.as_ref(), config, scenario, &scene.elements).await? {
            Some(refs) => return Ok(refs),
            None if !*repaired => {
                logw("regenerating missing element references");
                super::elements::generate_elements(backend.clone(), config, scenario, false)
                    .await?;
                super::upload::upload_elements(backend.as_ref(), config, false).await?;
                *repaired = true;
            }
            None => anyhow::bail!(
                "scene {}: element references still unavailable after regeneration",
                scene.id
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::Shot;

    fn scene(id: &str, durations: &[u32]) -> Scene {
        Scene {
            id: id.to_string(),
            background: String::new(),
            lighting: String::new(),
            elements: vec![],
            shots: durations
                .iter()
                .map(|&duration| Shot {
                    prompt: format!("shot-{duration}"),
                    duration,
                    negative_prompt: String::new(),
                })
                .collect(),
        }
    }

    #[test]
    fn short_scene_is_one_chunk_keyed_by_id() {
        let chunks = chunk_scene(&scene("3", &[5, 5, 5]));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].key, "3");
        assert_eq!(chunks[0].shot_indices, vec![0, 1, 2]);
    }

    #[test]
    fn duration_cap_splits_into_parts() {
        let chunks = chunk_scene(&scene("1", &[5, 5, 5, 5]));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].key, "1_part0");
        assert_eq!(chunks[1].key, "1_part1");
        assert_eq!(chunks[0].shot_indices, vec![0, 1, 2]);
        assert_eq!(chunks[1].shot_indices, vec![3]);
    }

    #[test]
    fn shot_count_cap_splits_even_short_shots() {
        let chunks = chunk_scene(&scene("2", &[2, 2, 2, 2, 2, 2, 2]));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].shot_indices.len(), 6);
        assert_eq!(chunks[1].shot_indices, vec![6]);
    }

    #[test]
    fn oversized_single_shot_still_gets_a_chunk() {
        let chunks = chunk_scene(&scene("4", &[20]));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].key, "4");
    }

    #[test]
    fn empty_scene_has_no_chunks() {
        assert!(chunk_scene(&scene("5", &[])).is_empty());
    }

    use crate::api::{TaskState, TaskStatus};
    use crate::error::{PipelineError, Result as PipelineResult};
    use async_trait::async_trait;
    use serde_json::json;

    /// Completes any submitted task but refuses uploads, so reference
    /// refresh fails while plain generation keeps working.
    struct OfflineStorageBackend;

    #[async_trait]
    impl RemoteBackend for OfflineStorageBackend {
        async fn submit(&self, _request: &serde_json::Value) -> PipelineResult<String> {
            Ok("task-1".to_string())
        }
        async fn poll(&self, task_id: &str) -> PipelineResult<TaskStatus> {
            Ok(TaskStatus {
                task_id: task_id.to_string(),
                state: TaskState::Completed,
                result_url: Some("https://cdn.example/clip.mp4".into()),
                error: None,
            })
        }
        async fn fetch(&self, _url: &str) -> PipelineResult<Vec<u8>> {
            Ok(b"clip".to_vec())
        }
        async fn upload(&self, _bytes: Vec<u8>, _filename: &str) -> PipelineResult<String> {
            Err(PipelineError::BadResponse("storage offline".into()))
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
    async fn reference_failure_fails_only_that_scenes_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());

        // Element A finished generating, but its URL expired and the
        // re-upload path is down.
        let png = dir.path().join("A1.png");
        std::fs::write(&png, b"png").unwrap();
        let mut store = StatusStore::load(config.elements_status_path()).unwrap();
        let mut item = WorkItem::new("A/view_0", Phase::Elements, json!({}));
        item.status = WorkStatus::Completed;
        item.output_path = Some(png.clone());
        item.url = Some("https://files.example/A1.png".into());
        item.url_recorded_at = Some(chrono::Utc::now() - chrono::Duration::hours(100));
        store.upsert(item).unwrap();
        drop(store);

        let scenario: Scenario = serde_json::from_str(
            r#"{
                "elements": [{"name": "A", "description": "a thing"}],
                "scenes": [
                    {"id": "1", "elements": ["A"], "shots": [{"prompt": "uses A"}]},
                    {"id": "2", "shots": [{"prompt": "standalone"}]}
                ]
            }"#,
        )
        .unwrap();

        let backend: Arc<dyn RemoteBackend> = Arc::new(OfflineStorageBackend);
        let summary = generate_shots(backend, &config, &scenario, "intro", None, false)
            .await
            .unwrap();

        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures[0].0, "1");
        assert!(summary.failures[0].1.contains("storage offline"));

        let store = StatusStore::load(config.scenario_status_path("intro")).unwrap();
        assert_eq!(store.get("1").unwrap().status, WorkStatus::Failed);
        assert_eq!(store.get("2").unwrap().status, WorkStatus::Completed);
    }
}
