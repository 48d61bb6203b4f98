use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use sage_protocol::{KernelError, KernelResult, PersonalityTraits, ProfileStore};
use tokio::fs;

#[derive(Debug, Default)]
pub struct InMemoryProfileStore {
    profile: Mutex<Option<PersonalityTraits>>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(traits: PersonalityTraits) -> Self {
        Self {
            profile: Mutex::new(Some(traits)),
        }
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn load(&self) -> KernelResult<Option<PersonalityTraits>> {
        Ok(*self.profile.lock())
    }

    async fn save(&self, traits: &PersonalityTraits) -> KernelResult<()> {
        *self.profile.lock() = Some(*traits);
        Ok(())
    }
}

/// Profile kept as a single pretty-printed JSON document.
#[derive(Debug, Clone)]
pub struct FileProfileStore {
    path: PathBuf,
}

impl FileProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read(&self) -> Result<Option<PersonalityTraits>> {
        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed reading profile {:?}", self.path))?;
        let traits = serde_json::from_str(&raw)
            .with_context(|| format!("failed parsing profile {:?}", self.path))?;
        Ok(Some(traits))
    }

    async fn write(&self, traits: &PersonalityTraits) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create profile dir {parent:?}"))?;
        }
        let payload = serde_json::to_string_pretty(traits)?;
        fs::write(&self.path, payload)
            .await
            .with_context(|| format!("failed writing profile {:?}", self.path))?;
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for FileProfileStore {
    async fn load(&self) -> KernelResult<Option<PersonalityTraits>> {
        self.read()
            .await
            .map_err(|error| KernelError::Storage(format!("{error:#}")))
    }

    async fn save(&self, traits: &PersonalityTraits) -> KernelResult<()> {
        self.write(traits)
            .await
            .map_err(|error| KernelError::Storage(format!("{error:#}")))
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use sage_protocol::TraitName;

    use super::*;

    #[tokio::test]
    async fn file_profile_survives_reload() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let root = std::env::temp_dir().join(format!("sage-profile-{nanos}"));
        let store = FileProfileStore::new(root.join("profile.json"));
        assert!(store.load().await.unwrap().is_none());

        let mut traits = PersonalityTraits::default();
        traits.set(TraitName::Humor, 0.9);
        store.save(&traits).await.unwrap();

        let reloaded = FileProfileStore::new(root.join("profile.json"))
            .load()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.get(TraitName::Humor), 0.9);
        let _ = fs::remove_dir_all(root).await;
    }
}
