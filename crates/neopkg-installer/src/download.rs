use std::path::Path;

use anyhow::{Context, Result};
use neopkg_core::PkgError;
use tokio::io::AsyncWriteExt;
use tracing::info;

/// Streams `url` into `destination`, overwriting any previous file. The body
/// lands in a sibling `.part` file first so an interrupted download never
/// leaves a truncated archive under the final name.
pub async fn download_archive(
    client: &reqwest::Client,
    url: &str,
    destination: &Path,
) -> Result<u64> {
    let mut response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("failed to download {url}"))?;
    let status = response.status();
    if !status.is_success() {
        return Err(PkgError::Upstream {
            status: status.as_u16(),
            url: url.to_string(),
        }
        .into());
    }

    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let partial = destination.with_extension("part");
    let written = async {
        let mut file = tokio::fs::File::create(&partial)
            .await
            .with_context(|| format!("failed to create {}", partial.display()))?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .with_context(|| format!("failed reading body of {url}"))?
        {
            file.write_all(&chunk)
                .await
                .with_context(|| format!("failed to write {}", partial.display()))?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        tokio::fs::rename(&partial, destination)
            .await
            .with_context(|| format!("failed to move download into {}", destination.display()))?;
        Ok::<_, anyhow::Error>(written)
    }
    .await;

    match written {
        Ok(bytes) => {
            info!(%url, path = %destination.display(), bytes, "archive downloaded");
            Ok(bytes)
        }
        Err(err) => {
            let _ = tokio::fs::remove_file(&partial).await;
            Err(err)
        }
    }
}
