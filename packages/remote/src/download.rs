//! Streaming file download.

use std::path::Path;

use futures::StreamExt as _;
use tokio::io::AsyncWriteExt as _;

use crate::{RemoteError, retry};

const PROGRESS_STEP_BYTES: u64 = 100 * 1_048_576;

/// Downloads `url` to `dest`, streaming the body to disk with progress
/// logging every 100 MB.
///
/// The body is written to `dest.part` first and renamed into place once
/// complete, so an interrupted download never leaves a truncated file
/// under the final name.
///
/// # Errors
///
/// Returns [`RemoteError`] if the request fails after retries or the local
/// file cannot be written.
#[allow(clippy::future_not_send)]
pub async fn download_file(
    http: &reqwest::Client,
    url: &str,
    dest: &Path,
) -> Result<u64, RemoteError> {
    log::info!("Downloading {}", dest.file_name().map_or_else(
        || dest.display().to_string(),
        |n| n.to_string_lossy().into_owned(),
    ));
    log::debug!("  -> {}", dest.display());

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| RemoteError::io(parent, e))?;
    }

    let response = retry::send(|| http.get(url)).await?;

    let total_size = response.content_length();
    if let Some(size) = total_size {
        #[allow(clippy::cast_precision_loss)]
        let mb = size as f64 / 1_048_576.0;
        log::info!("  file size: {mb:.1} MB");
    }

    let part = partial_path(dest);
    let mut file = tokio::fs::File::create(&part)
        .await
        .map_err(|e| RemoteError::io(&part, e))?;

    let mut stream = response.bytes_stream();
    let mut downloaded: u64 = 0;
    let mut last_step: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk)
            .await
            .map_err(|e| RemoteError::io(&part, e))?;
        downloaded += chunk.len() as u64;

        let step = downloaded / PROGRESS_STEP_BYTES;
        if step > last_step {
            last_step = step;
            #[allow(clippy::cast_precision_loss)]
            let mb = downloaded as f64 / 1_048_576.0;
            if let Some(total) = total_size {
                #[allow(clippy::cast_precision_loss)]
                let pct = (downloaded as f64 / total as f64) * 100.0;
                log::info!("  downloaded {mb:.0} MB ({pct:.0}%)");
            } else {
                log::info!("  downloaded {mb:.0} MB");
            }
        }
    }

    file.flush().await.map_err(|e| RemoteError::io(&part, e))?;
    drop(file);

    tokio::fs::rename(&part, dest)
        .await
        .map_err(|e| RemoteError::io(dest, e))?;

    #[allow(clippy::cast_precision_loss)]
    let mb = downloaded as f64 / 1_048_576.0;
    log::info!("  download complete: {mb:.1} MB");

    Ok(downloaded)
}

fn partial_path(dest: &Path) -> std::path::PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    name.into()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn partial_path_appends_suffix() {
        assert_eq!(
            partial_path(Path::new("downloads/delta.zip")),
            PathBuf::from("downloads/delta.zip.part")
        );
    }
}
