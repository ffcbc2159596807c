//! On-disk layout for cache storage.
//!
//! One JSON file per generation, named after the (percent-encoded)
//! generation id. Files are replaced atomically via a temporary sibling.

use std::path::{Path, PathBuf};

use podkit_common::ResultExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{Cache, CacheEntry};
use crate::Result;

const EXTENSION: &str = "json";

#[derive(Serialize, Deserialize)]
struct GenerationFile {
    generation: String,
    /// Creation order; restores `CacheStorage::keys` ordering on reload.
    #[serde(default)]
    sequence: u64,
    entries: Vec<CacheEntry>,
}

fn generation_path(dir: &Path, generation: &str) -> PathBuf {
    dir.join(format!("{}.{EXTENSION}", urlencoding::encode(generation)))
}

/// Write a generation, replacing any previous file.
pub(crate) async fn write_generation(dir: &Path, cache: &Cache) -> Result<()> {
    let file = GenerationFile {
        generation: cache.name.clone(),
        sequence: cache.sequence,
        entries: cache.clone().into_entries(),
    };
    let json = serde_json::to_vec(&file).internal_context("serializing cache generation")?;

    let path = generation_path(dir, &cache.name);
    let tmp = path.with_extension("tmp");
    tokio::fs::create_dir_all(dir)
        .await
        .storage_context("creating cache directory")?;
    tokio::fs::write(&tmp, json)
        .await
        .storage_context("writing cache generation")?;
    tokio::fs::rename(&tmp, &path)
        .await
        .storage_context("replacing cache generation")?;

    debug!(generation = %cache.name, path = %path.display(), "Persisted cache generation");
    Ok(())
}

/// Remove a generation's file. A missing file is not an error.
pub(crate) async fn remove_generation(dir: &Path, generation: &str) -> Result<()> {
    match tokio::fs::remove_file(generation_path(dir, generation)).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => Ok(other.storage_context("removing cache generation")?),
    }
}

/// Load every generation in `dir` in creation order. Unreadable files are
/// skipped with a warning.
pub(crate) async fn load_generations(dir: &Path) -> Result<Vec<Cache>> {
    tokio::fs::create_dir_all(dir)
        .await
        .storage_context("creating cache directory")?;

    let mut caches = Vec::new();
    let mut listing = tokio::fs::read_dir(dir)
        .await
        .storage_context("listing cache directory")?;

    while let Some(item) = listing
        .next_entry()
        .await
        .storage_context("listing cache directory")?
    {
        let path = item.path();
        if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
            continue;
        }

        let parsed = tokio::fs::read(&path)
            .await
            .map_err(|e| e.to_string())
            .and_then(|bytes| {
                serde_json::from_slice::<GenerationFile>(&bytes).map_err(|e| e.to_string())
            });

        match parsed {
            Ok(file) => caches.push(Cache::from_entries(
                &file.generation,
                file.sequence,
                file.entries,
            )),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable cache file"),
        }
    }

    caches.sort_by(|a, b| a.sequence.cmp(&b.sequence).then_with(|| a.name.cmp(&b.name)));
    Ok(caches)
}

/// Serde adapter storing bodies as base64 strings.
pub(crate) mod base64_body {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
