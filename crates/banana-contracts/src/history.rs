use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One successful generation as seen by the caller. Never mutated after
/// creation; removed only by [`History::remove`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub id: Uuid,
    #[serde(skip)]
    pub image_bytes: Vec<u8>,
    pub prompt: String,
    #[serde(skip)]
    pub source_input_image: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
}

impl GeneratedImage {
    pub fn new(
        image_bytes: Vec<u8>,
        prompt: impl Into<String>,
        source_input_image: Option<Vec<u8>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            image_bytes,
            prompt: prompt.into(),
            source_input_image,
            created_at: Utc::now(),
        }
    }
}

/// Generated images, most recent first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    entries: Vec<GeneratedImage>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, image: GeneratedImage) -> Uuid {
        let id = image.id;
        self.entries.insert(0, image);
        id
    }

    pub fn remove(&mut self, id: Uuid) -> Option<GeneratedImage> {
        let idx = self.entries.iter().position(|entry| entry.id == id)?;
        Some(self.entries.remove(idx))
    }

    pub fn get(&self, id: Uuid) -> Option<&GeneratedImage> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    pub fn entries(&self) -> &[GeneratedImage] {
        &self.entries
    }

    pub fn latest(&self) -> Option<&GeneratedImage> {
        self.entries.first()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Progress of a running batch: `completed` items out of `total`, counting
/// skipped items as completed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub completed: usize,
    pub total: usize,
}

impl BatchProgress {
    pub fn new(total: usize) -> Self {
        Self {
            completed: 0,
            total,
        }
    }

    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.completed.min(self.total) as f64) / (self.total as f64)
    }

    pub fn is_finished(&self) -> bool {
        self.completed >= self.total
    }
}
