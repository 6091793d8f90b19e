//! Avatar rows and the per-process read-through cache.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::db::Database;
use crate::error::Result;

/// The asset a generation pipeline found missing on an avatar row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvatarAsset {
    Image,
    Voice,
}

impl fmt::Display for AvatarAsset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image => write!(f, "image"),
            Self::Voice => write!(f, "voice sample"),
        }
    }
}

/// One avatar identity: the image the video service animates, the voice
/// sample the voice service clones, and the persona prompt fed to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Avatar {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub voice_sample_url: Option<String>,
    #[serde(default)]
    pub persona: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub is_public: bool,
}

impl Avatar {
    /// Persona prompt with a serviceable default for avatars created
    /// before the persona field existed.
    pub fn persona_prompt(&self) -> String {
        match self.persona.as_deref().map(str::trim) {
            Some(persona) if !persona.is_empty() => persona.to_string(),
            _ => format!(
                "You are {}, a friendly virtual avatar. Reply with concise spoken-friendly \
                 language. Avoid markdown.",
                self.name
            ),
        }
    }
}

/// Read-through avatar cache keyed by id.
///
/// Unbounded and never invalidated for the process lifetime: avatar rows
/// are effectively append-only while sessions run, and a restart flushes.
pub struct AvatarCache {
    db: Arc<dyn Database>,
    cache: RwLock<HashMap<String, Avatar>>,
}

impl AvatarCache {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, avatar_id: &str) -> Result<Option<Avatar>> {
        if let Some(avatar) = self.cache.read().await.get(avatar_id) {
            return Ok(Some(avatar.clone()));
        }

        let Some(avatar) = self.db.fetch_avatar(avatar_id).await? else {
            return Ok(None);
        };

        self.cache
            .write()
            .await
            .insert(avatar_id.to_string(), avatar.clone());
        Ok(Some(avatar))
    }

    #[cfg(test)]
    pub(crate) async fn cached_len(&self) -> usize {
        self.cache.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryDatabase;

    fn avatar(id: &str) -> Avatar {
        Avatar {
            id: id.to_string(),
            owner_id: "user-1".to_string(),
            name: "Maya".to_string(),
            image_url: Some("https://cdn.example/maya.png".to_string()),
            voice_sample_url: Some("https://cdn.example/maya.wav".to_string()),
            persona: None,
            language: Some("en".to_string()),
            is_public: false,
        }
    }

    #[tokio::test]
    async fn cache_reads_through_once() {
        let db = Arc::new(MemoryDatabase::default());
        db.seed_avatar(avatar("a1")).await;

        let cache = AvatarCache::new(db.clone());
        assert!(cache.get("a1").await.unwrap().is_some());
        assert_eq!(cache.cached_len().await, 1);

        // A second read is served from memory even if the row disappears.
        db.remove_avatar("a1").await;
        assert!(cache.get("a1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn missing_avatar_is_not_cached() {
        let cache = AvatarCache::new(Arc::new(MemoryDatabase::default()));
        assert!(cache.get("ghost").await.unwrap().is_none());
        assert_eq!(cache.cached_len().await, 0);
    }

    #[test]
    fn persona_prompt_falls_back_to_name() {
        let mut a = avatar("a1");
        a.persona = Some("  ".to_string());
        assert!(a.persona_prompt().contains("Maya"));

        a.persona = Some("You are a pirate.".to_string());
        assert_eq!(a.persona_prompt(), "You are a pirate.");
    }
}
