//! Secure deletion of temporary key material (spec §4.1.3).
//!
//! Best-effort: a failed overwrite (e.g. read-only filesystem) falls back to
//! plain unlink rather than leaving the file behind.

use std::path::Path;

use rand::RngCore;
use tracing::warn;

/// Overwrite `path` with random bytes of the same length, flush, then
/// unlink. Never fails the caller's flow — overwrite failures are logged and
/// followed by a plain unlink attempt.
pub async fn secure_delete(path: &Path) {
    match overwrite_with_random(path).await {
        Ok(()) => {}
        Err(e) => {
            warn!(path = %path.display(), error = %e, "secure overwrite failed, falling back to unlink");
        }
    }
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to unlink after secure delete");
        }
    }
}

async fn overwrite_with_random(path: &Path) -> std::io::Result<()> {
    let len = tokio::fs::metadata(path).await?.len() as usize;
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);

    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    file.write_all(&buf).await?;
    file.flush().await?;
    file.sync_all().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deletes_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.bin");
        tokio::fs::write(&path, b"sensitive material").await.unwrap();

        secure_delete(&path).await;

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn missing_file_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never_existed.bin");
        secure_delete(&path).await;
    }
}
