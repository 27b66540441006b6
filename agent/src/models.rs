//! Model resolution: local storage first, then a copy from the configured
//! network share. Share paths are validated against the share root so a
//! crafted model name cannot escape it.

use std::path::{Component, Path, PathBuf};

use crate::error::AgentError;

/// Rejects absolute paths and any `..` traversal in a model reference.
fn sanitize_relative(name: &str) -> Result<PathBuf, AgentError> {
    let path = Path::new(name);
    if path.is_absolute() {
        return Err(AgentError::Model(format!("absolute model path {name:?}")));
    }
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            other => {
                return Err(AgentError::Model(format!(
                    "model path {name:?} contains {other:?}"
                )))
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(AgentError::Model("empty model path".into()));
    }
    Ok(clean)
}

/// Verifies that `candidate` stays inside `root` after canonicalization.
fn ensure_inside(root: &Path, candidate: &Path) -> Result<PathBuf, AgentError> {
    let root = root
        .canonicalize()
        .map_err(|e| AgentError::Model(format!("share root {root:?}: {e}")))?;
    let resolved = candidate
        .canonicalize()
        .map_err(|e| AgentError::Model(format!("model {candidate:?}: {e}")))?;
    if !resolved.starts_with(&root) {
        return Err(AgentError::Model(format!(
            "resolved path {resolved:?} escapes share root {root:?}"
        )));
    }
    Ok(resolved)
}

/// Resolves a model reference to a local path.
///
/// Order: already-cached copy under `storage_dir`, then a copy from
/// `share_mount`. Returns `None` when the reference is not present in either
/// place (the engine container will fetch it itself, e.g. a repo or tag).
pub async fn resolve(
    storage_dir: &Path,
    share_mount: Option<&Path>,
    model: &str,
) -> Result<Option<PathBuf>, AgentError> {
    let relative = match sanitize_relative(model) {
        Ok(r) => r,
        // Repo names like `org/model:tag` sanitize fine; anything that does
        // not is handed to the engine untouched rather than copied.
        Err(_) => return Ok(None),
    };

    let local = storage_dir.join(&relative);
    if local.exists() {
        return Ok(Some(local));
    }

    let Some(share) = share_mount else {
        return Ok(None);
    };
    let shared = share.join(&relative);
    if !shared.exists() {
        return Ok(None);
    }
    let shared = ensure_inside(share, &shared)?;

    if let Some(parent) = local.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tracing::info!(from = ?shared, to = ?local, "copying model from share");
    copy_recursive(&shared, &local).await?;
    Ok(Some(local))
}

async fn copy_recursive(from: &Path, to: &Path) -> Result<(), AgentError> {
    if from.is_file() {
        tokio::fs::copy(from, to).await?;
        return Ok(());
    }
    tokio::fs::create_dir_all(to).await?;
    let mut entries = tokio::fs::read_dir(from).await?;
    while let Some(entry) = entries.next_entry().await? {
        let target = to.join(entry.file_name());
        let path = entry.path();
        if path.is_dir() {
            Box::pin(copy_recursive(&path, &target)).await?;
        } else {
            tokio::fs::copy(&path, &target).await?;
        }
    }
    Ok(())
}

/// Deletes cached models under the storage root (`cleanup_storage` command).
pub async fn cleanup(storage_dir: &Path) -> Result<u64, AgentError> {
    if !storage_dir.exists() {
        return Ok(0);
    }
    let mut removed = 0u64;
    let mut entries = tokio::fs::read_dir(storage_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
        removed += 1;
    }
    tracing::info!(root = ?storage_dir, removed, "cleaned model storage");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_copy_wins_over_share() {
        let storage = tempfile::tempdir().unwrap();
        let share = tempfile::tempdir().unwrap();
        std::fs::write(storage.path().join("m.gguf"), b"local").unwrap();
        std::fs::write(share.path().join("m.gguf"), b"shared").unwrap();
        let resolved = resolve(storage.path(), Some(share.path()), "m.gguf")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(std::fs::read(resolved).unwrap(), b"local");
    }

    #[tokio::test]
    async fn copies_from_share_when_missing_locally() {
        let storage = tempfile::tempdir().unwrap();
        let share = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(share.path().join("llama")).unwrap();
        std::fs::write(share.path().join("llama/weights.gguf"), b"w").unwrap();
        let resolved = resolve(storage.path(), Some(share.path()), "llama/weights.gguf")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved, storage.path().join("llama/weights.gguf"));
        assert_eq!(std::fs::read(resolved).unwrap(), b"w");
    }

    #[tokio::test]
    async fn traversal_is_not_copied() {
        let storage = tempfile::tempdir().unwrap();
        let share = tempfile::tempdir().unwrap();
        let secret_dir = tempfile::tempdir().unwrap();
        std::fs::write(secret_dir.path().join("secret"), b"s").unwrap();
        let sneaky = format!("../{}", secret_dir.path().join("secret").display());
        let resolved = resolve(storage.path(), Some(share.path()), &sneaky)
            .await
            .unwrap();
        // Traversal names fall through to "let the engine fetch it" and no
        // file is copied out of the share.
        assert!(resolved.is_none());
        assert!(!storage.path().join("secret").exists());
    }

    #[tokio::test]
    async fn symlink_escape_is_rejected() {
        let storage = tempfile::tempdir().unwrap();
        let share = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("weights"), b"x").unwrap();
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(
                outside.path().join("weights"),
                share.path().join("link.gguf"),
            )
            .unwrap();
            let err = resolve(storage.path(), Some(share.path()), "link.gguf")
                .await
                .unwrap_err();
            assert!(matches!(err, AgentError::Model(_)));
        }
    }

    #[tokio::test]
    async fn cleanup_empties_storage_root() {
        let storage = tempfile::tempdir().unwrap();
        std::fs::write(storage.path().join("a.gguf"), b"a").unwrap();
        std::fs::create_dir_all(storage.path().join("nested")).unwrap();
        std::fs::write(storage.path().join("nested/b.gguf"), b"b").unwrap();
        let removed = cleanup(storage.path()).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(std::fs::read_dir(storage.path()).unwrap().count(), 0);
    }
}
