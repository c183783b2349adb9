use anyhow::{Context, Result};
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

pub async fn check_ffmpeg() -> bool {
    match Command::new("ffmpeg").arg("-version").output().await {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}

pub async fn ffprobe_duration_seconds(path: &Path) -> Result<f64> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path)
        .output()
        .await
        .context("ffprobe execution failed")?;

    if !output.status.success() {
        return Err(anyhow::anyhow!("ffprobe failed for {}", path.display()));
    }

    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let duration = text.parse::<f64>().unwrap_or(-1.0);
    if duration <= 0.1 {
        return Err(anyhow::anyhow!("Invalid duration for {}", path.display()));
    }
    Ok(duration)
}

/// Concatenate clips in order with the concat demuxer. All inputs come from
/// the same generation settings, so stream copy is safe and fast.
pub async fn concat_videos(clips: &[std::path::PathBuf], out_mp4: &Path) -> Result<()> {
    if clips.is_empty() {
        anyhow::bail!("nothing to concatenate");
    }
    if let Some(parent) = out_mp4.parent() {
        fs::create_dir_all(parent).await?;
    }

    let list_path = out_mp4.with_extension("concat.txt");
    let mut list = fs::File::create(&list_path)
        .await
        .with_context(|| format!("create concat list: {}", list_path.display()))?;
    for clip in clips {
        let absolute = std::path::absolute(clip)
            .with_context(|| format!("resolve path: {}", clip.display()))?;
        list.write_all(format!("file '{}'\n", absolute.display()).as_bytes())
            .await?;
    }
    list.flush().await?;

    let status = Command::new("ffmpeg")
        .args(["-y", "-f", "concat", "-safe", "0", "-i"])
        .arg(&list_path)
        .args(["-c", "copy"])
        .arg(out_mp4)
        .status()
        .await
        .context("ffmpeg execution failed")?;

    let _ = fs::remove_file(&list_path).await;

    if !status.success() {
        anyhow::bail!("ffmpeg concat failed for {}", out_mp4.display());
    }
    Ok(())
}
