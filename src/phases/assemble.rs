use anyhow::Result;
use std::path::PathBuf;

use crate::config::Config;
use crate::ffmpeg;
use crate::status::StatusStore;
use crate::{logok, logw};

/// Numeric ordering for scene clip keys like `"2"`, `"2_part1"`, `"10"`.
/// Keys that do not follow the pattern sort after all recognized ones so a
/// stray record cannot land in the middle of the cut.
fn scene_sort_key(key: &str) -> (u64, u64) {
    // A bare scene id sorts before its parts.
    let (scene, part) = match key.split_once("_part") {
        Some((scene, part)) => match part.parse::<u64>() {
            Ok(part) => (scene, part + 1),
            Err(_) => return (u64::MAX, 0),
        },
        None => (key, 0),
    };
    match scene.parse::<u64>() {
        Ok(scene) => (scene, part),
        Err(_) => (u64::MAX, 0),
    }
}

/// Concatenate all completed scene clips for a scenario into one video, in
/// scene order. Scenes without a local clip are reported and left out.
pub async fn assemble(config: &Config, stem: &str) -> Result<PathBuf> {
    let store = StatusStore::load(config.scenario_status_path(stem))?;
    if store.is_empty() {
        anyhow::bail!("no scene clips recorded for {stem}; run generate-shots first");
    }

    let mut clips: Vec<(String, PathBuf)> = Vec::new();
    for (key, item) in store.all() {
        let local = item
            .output_path
            .as_ref()
            .filter(|p| item.is_completed() && p.exists());
        match local {
            Some(path) => clips.push((key.clone(), path.clone())),
            None => logw(format!("scene {key} has no finished clip, skipping")),
        }
    }
    if clips.is_empty() {
        anyhow::bail!("no finished scene clips for {stem}");
    }
    clips.sort_by_key(|(key, _)| scene_sort_key(key));

    let paths: Vec<PathBuf> = clips.into_iter().map(|(_, path)| path).collect();
    let out = config.final_video_path(stem);
    ffmpeg::concat_videos(&paths, &out).await?;

    let duration = ffmpeg::ffprobe_duration_seconds(&out).await?;
    logok(format!(
        "Assembled {} clips into {} ({duration:.1}s)",
        paths.len(),
        out.display()
    ));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_sort_numerically_with_parts_in_order() {
        let mut keys = vec!["10", "2_part1", "1", "2_part0", "2", "extra"];
        keys.sort_by_key(|k| scene_sort_key(k));
        assert_eq!(keys, vec!["1", "2", "2_part0", "2_part1", "10", "extra"]);
    }

    #[test]
    fn unrecognized_keys_sort_last() {
        assert_eq!(scene_sort_key("finale"), (u64::MAX, 0));
        assert!(scene_sort_key("3") < scene_sort_key("finale"));
    }
}
