use std::path::{Path, PathBuf};

use crate::api::RemoteBackend;
use crate::error::{PipelineError, Result};
use crate::logi;

/// Fetch a completed task's artifact and write it to `dest`, creating parent
/// directories as needed. An empty body or a local write failure is a
/// `Materialize` error; the remote task itself succeeded in that case, so the
/// cause is kept distinct from remote-side failures.
pub async fn materialize(
    backend: &dyn RemoteBackend,
    url: &str,
    dest: &Path,
) -> Result<PathBuf> {
    let bytes = backend.fetch(url).await?;
    if bytes.is_empty() {
        return Err(PipelineError::Materialize {
            path: dest.to_path_buf(),
            reason: format!("downloaded artifact from {url} is empty"),
        });
    }

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| PipelineError::Materialize {
                path: dest.to_path_buf(),
                reason: format!("cannot create parent directory: {err}"),
            })?;
    }
    tokio::fs::write(dest, &bytes)
        .await
        .map_err(|err| PipelineError::Materialize {
            path: dest.to_path_buf(),
            reason: format!("write failed: {err}"),
        })?;

    logi(format!(
        "Downloaded {} ({:.1} KB)",
        dest.display(),
        bytes.len() as f64 / 1024.0
    ));
    Ok(dest.to_path_buf())
}
