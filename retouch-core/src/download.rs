use std::path::{Path, PathBuf};

use anyhow::Context;
use futures::{StreamExt, TryStreamExt, stream};
use tokio::io::AsyncWriteExt;
use tracing::Instrument;

use crate::hf_hub::{self, Reporter};
use crate::progress::{Emitter, progress_bar};
use crate::range;

const RANGE_CHUNK_SIZE_BYTES: u64 = 16 * 1024 * 1024;
const MAX_CONCURRENT_RANGES: usize = 8;

/// Fetches `filename` from a Hugging Face model repository, returning the
/// cached path when it has been downloaded before.
pub async fn model(repo: &str, filename: &str) -> anyhow::Result<PathBuf> {
    let hf_repo = hf_hub::repo(repo);

    if let Some(path) = hf_hub::cache().repo(hf_repo.clone()).get(filename) {
        return Ok(path);
    }

    let path = hf_hub::api()
        .repo(hf_repo)
        .download_with_progress(filename, Reporter::new(filename))
        .instrument(tracing::info_span!("hf_download", repo, filename))
        .await
        .with_context(|| format!("failed to download {filename} from {repo}"))?;

    Ok(path)
}

/// Downloads a checkpoint published at a plain URL into
/// `{cache_dir}/{subdir}/`, reusing the file when it already exists.
pub async fn checkpoint(url: &str, subdir: &str) -> anyhow::Result<PathBuf> {
    checkpoint_to(url, &hf_hub::cache_dir().join(subdir)).await
}

pub async fn checkpoint_to(url: &str, dir: &Path) -> anyhow::Result<PathBuf> {
    let path = dir.join(file_name(url));
    if tokio::fs::try_exists(&path).await? {
        return Ok(path);
    }

    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create {}", dir.display()))?;

    tracing::info!(%url, dest = %path.display(), "downloading checkpoint");
    let partial = path.with_extension("part");
    if let Err(err) = stream_to_file(url, &partial).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(err);
    }
    tokio::fs::rename(&partial, &path).await?;

    Ok(path)
}

/// Writes `url` to `dest` as it arrives. With range support, chunks are
/// fetched in parallel but written in order, so at most
/// `MAX_CONCURRENT_RANGES` chunks are held in memory.
#[tracing::instrument(level = "info", skip(dest))]
async fn stream_to_file(url: &str, dest: &Path) -> anyhow::Result<()> {
    let remote = range::probe(url).await?;
    anyhow::ensure!(
        remote.content_length > 0,
        "resource reports zero Content-Length"
    );
    let total_len = remote.content_length;

    let filename = file_name(url).to_string();
    let pb = progress_bar(&filename);
    let mut emitter = Emitter::new(&filename);
    pb.set_length(total_len);
    emitter.begin(total_len);

    let mut file = tokio::fs::File::create(dest)
        .await
        .with_context(|| format!("failed to create {}", dest.display()))?;
    let mut written = 0u64;

    if remote.supports_ranges {
        let chunk_size = total_len.clamp(1, RANGE_CHUNK_SIZE_BYTES);
        let segments = total_len.div_ceil(chunk_size);
        tracing::debug!(total_len, segments, "downloading via HTTP range requests");

        let mut chunks = stream::iter((0..segments).map(|index| {
            let start = index * chunk_size;
            let end = ((index + 1) * chunk_size).min(total_len) - 1;
            range::fetch_range(url, start, end)
        }))
        .buffered(MAX_CONCURRENT_RANGES);

        while let Some(chunk) = chunks.try_next().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            pb.inc(chunk.len() as u64);
            emitter.advance(chunk.len() as u64);
        }
    } else {
        tracing::debug!("server does not advertise byte ranges, using a single request");
        let mut body = std::pin::pin!(range::get_whole(url).await?.bytes_stream());
        while let Some(chunk) = body.try_next().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            pb.inc(chunk.len() as u64);
            emitter.advance(chunk.len() as u64);
        }
    }

    file.flush().await?;
    file.sync_all().await?;
    pb.finish_and_clear();
    emitter.complete();

    anyhow::ensure!(
        written == total_len,
        "download size mismatch: expected {total_len} bytes, got {written}"
    );
    Ok(())
}

fn file_name(url: &str) -> &str {
    url.rsplit('/').find(|s| !s.is_empty()).unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::{checkpoint_to, file_name};
    use crate::range::tests::serve;

    #[test]
    fn file_name_is_last_path_segment() {
        assert_eq!(
            file_name("https://dl.fbaipublicfiles.com/segment_anything/sam_vit_b_01ec64.pth"),
            "sam_vit_b_01ec64.pth"
        );
        assert_eq!(file_name("http://host/dir/"), "dir");
    }

    #[tokio::test]
    async fn checkpoint_is_streamed_with_and_without_ranges() -> anyhow::Result<()> {
        let payload = (0..=255u8).cycle().take(4096).collect::<Vec<_>>();

        for ranges in [true, false] {
            let dir = tempfile::tempdir()?;
            let (url, shutdown) = serve("blob.bin", payload.clone(), ranges).await;
            let path = checkpoint_to(&url, dir.path()).await?;
            assert_eq!(std::fs::read(&path)?, payload, "ranges: {ranges}");
            assert!(!path.with_extension("part").exists());
            let _ = shutdown.send(());
        }
        Ok(())
    }

    #[tokio::test]
    async fn checkpoint_is_downloaded_once() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (url, shutdown) = serve("weights.pth", b"checkpoint".to_vec(), true).await;

        let path = checkpoint_to(&url, &dir.path().join("sam_models")).await?;
        assert_eq!(path.file_name().and_then(|n| n.to_str()), Some("weights.pth"));
        assert_eq!(std::fs::read(&path)?, b"checkpoint");

        let _ = shutdown.send(());

        // served from disk now that the server is gone
        let again = checkpoint_to(&url, &dir.path().join("sam_models")).await?;
        assert_eq!(again, path);

        Ok(())
    }
}
