use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;

use crate::config::path_segment;

/// Durable set of restaurant names already processed, namespaced by city key.
///
/// Implementations report failures as plain errors; callers classify them as
/// [`crate::error::HarvestError::StoreUnavailable`].
#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn is_member(&self, city_key: &str, name: &str) -> anyhow::Result<bool>;

    /// Idempotent: adding an existing name is a no-op.
    async fn add(&self, city_key: &str, name: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CityMarks {
    city: String,
    restaurants: BTreeSet<String>,
}

/// One JSON file per city under `base_dir`, rewritten atomically on every new mark.
#[derive(Debug)]
pub struct LocalFsDedupStore {
    base_dir: PathBuf,
    cache: Mutex<HashMap<String, CityMarks>>,
}

impl LocalFsDedupStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn city_path(&self, city_key: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", path_segment(city_key)))
    }

    async fn load(&self, city_key: &str) -> anyhow::Result<CityMarks> {
        let path = self.city_path(city_key);
        let marks = read_json::<CityMarks>(&path)
            .await
            .with_context(|| format!("read dedup marks: {}", path.display()))?;
        Ok(marks.unwrap_or_else(|| CityMarks {
            city: city_key.to_owned(),
            restaurants: BTreeSet::new(),
        }))
    }
}

#[async_trait]
impl DedupStore for LocalFsDedupStore {
    async fn is_member(&self, city_key: &str, name: &str) -> anyhow::Result<bool> {
        let mut cache = self.cache.lock().await;
        if !cache.contains_key(city_key) {
            let marks = self.load(city_key).await?;
            cache.insert(city_key.to_owned(), marks);
        }
        Ok(cache
            .get(city_key)
            .is_some_and(|marks| marks.restaurants.contains(name)))
    }

    async fn add(&self, city_key: &str, name: &str) -> anyhow::Result<()> {
        let mut cache = self.cache.lock().await;
        if !cache.contains_key(city_key) {
            let marks = self.load(city_key).await?;
            cache.insert(city_key.to_owned(), marks);
        }
        let Some(marks) = cache.get_mut(city_key) else {
            anyhow::bail!("dedup marks missing after load: {city_key}");
        };
        if !marks.restaurants.insert(name.to_owned()) {
            return Ok(());
        }

        let path = self.city_path(city_key);
        if let Err(err) = write_json_atomic(&path, marks).await {
            marks.restaurants.remove(name);
            return Err(err).with_context(|| format!("write dedup marks: {}", path.display()));
        }
        Ok(())
    }
}

/// Non-durable store for tests and throwaway runs.
#[derive(Debug, Default)]
pub struct InMemoryDedupStore {
    marks: std::sync::Mutex<HashMap<String, HashSet<String>>>,
}

impl InMemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn len(&self, city_key: &str) -> usize {
        self.marks
            .lock()
            .map(|marks| marks.get(city_key).map_or(0, HashSet::len))
            .unwrap_or(0)
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn is_member(&self, city_key: &str, name: &str) -> anyhow::Result<bool> {
        let marks = self
            .marks
            .lock()
            .map_err(|_| anyhow::anyhow!("in-memory dedup store is poisoned"))?;
        Ok(marks
            .get(city_key)
            .is_some_and(|names| names.contains(name)))
    }

    async fn add(&self, city_key: &str, name: &str) -> anyhow::Result<()> {
        let mut marks = self
            .marks
            .lock()
            .map_err(|_| anyhow::anyhow!("in-memory dedup store is poisoned"))?;
        marks
            .entry(city_key.to_owned())
            .or_default()
            .insert(name.to_owned());
        Ok(())
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let value = serde_json::from_slice(&bytes).context("parse json")?;
    Ok(Some(value))
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create parent dir: {}", parent.display()))?;

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let data = serde_json::to_vec_pretty(value).context("serialize json")?;
    fs::write(&tmp_path, &data)
        .await
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}
