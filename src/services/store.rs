use crate::core::io::Storage;
use crate::core::state::{CharacterStates, Progress, StoryBible};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{info, warn};
use regex::Regex;
use std::path::Path;
use std::sync::Arc;

const BIBLE_FILE: &str = "bible.json";
const PROGRESS_FILE: &str = "progress.json";

/// What happened to each artifact of one chapter save. The two writes are
/// independent, so one may fail while the other lands.
#[derive(Debug)]
pub struct SaveOutcome {
    pub scenes: Result<String>,
    /// `None` when there were no character states to persist.
    pub states: Option<Result<String>>,
}

impl SaveOutcome {
    pub fn is_complete(&self) -> bool {
        self.scenes.is_ok() && self.states.as_ref().map_or(true, |s| s.is_ok())
    }
}

/// Durable checkpoints of a run. Chapter numbers are 1-based.
#[async_trait]
pub trait ChapterStore: Send + Sync {
    async fn save_chapter(
        &self,
        number: usize,
        scenes: &[String],
        states: Option<&CharacterStates>,
    ) -> SaveOutcome;

    /// `Ok(None)` when the chapter has no persisted state.
    async fn load_chapter_state(&self, number: usize) -> Result<Option<CharacterStates>>;

    async fn load_chapter_scenes(&self, number: usize) -> Result<Option<Vec<String>>>;

    /// Numbers of chapters with saved scenes, ascending.
    async fn list_generated_chapters(&self) -> Result<Vec<usize>>;

    async fn save_bible(&self, bible: &StoryBible) -> Result<()>;

    async fn load_bible(&self) -> Result<Option<StoryBible>>;

    /// Completed chapters; empty when nothing was recorded yet.
    async fn load_progress(&self) -> Result<Progress>;

    async fn save_progress(&self, progress: &Progress) -> Result<()>;
}

/// Writes `chapter_{n}_scenes.json`, `chapter_{n}_state.json`, `bible.json`
/// and `progress.json` as pretty JSON under one output folder.
pub struct StorageChapterStore {
    storage: Arc<dyn Storage>,
    output_folder: String,
}

impl StorageChapterStore {
    pub fn new(storage: Arc<dyn Storage>, output_folder: impl Into<String>) -> Self {
        Self {
            storage,
            output_folder: output_folder.into(),
        }
    }

    fn path(&self, file: &str) -> String {
        Path::new(&self.output_folder)
            .join(file)
            .to_string_lossy()
            .to_string()
    }

    fn scenes_path(&self, number: usize) -> String {
        self.path(&format!("chapter_{}_scenes.json", number))
    }

    fn state_path(&self, number: usize) -> String {
        self.path(&format!("chapter_{}_state.json", number))
    }

    async fn write_json<T: serde::Serialize + ?Sized>(&self, path: &str, value: &T) -> Result<String> {
        let content = serde_json::to_string_pretty(value)?;
        self.storage.write(path, content.as_bytes()).await?;
        Ok(path.to_string())
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        if !self.storage.exists(path).await? {
            return Ok(None);
        }
        let content = self.storage.read_to_string(path).await?;
        let value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path))?;
        Ok(Some(value))
    }
}

#[async_trait]
impl ChapterStore for StorageChapterStore {
    async fn save_chapter(
        &self,
        number: usize,
        scenes: &[String],
        states: Option<&CharacterStates>,
    ) -> SaveOutcome {
        let scene_count = scenes.len();
        let scenes_path = self.scenes_path(number);
        let scenes = self.write_json(&scenes_path, scenes).await;
        match &scenes {
            Ok(path) => info!("Saved {} scene(s) to {}", scene_count, path),
            Err(e) => warn!("Failed to save scenes for chapter {}: {:#}", number, e),
        }

        let states = match states {
            Some(states) => {
                let state_path = self.state_path(number);
                let result = self.write_json(&state_path, states).await;
                match &result {
                    Ok(path) => info!("Saved character state to {}", path),
                    Err(e) => warn!("Failed to save character state for chapter {}: {:#}", number, e),
                }
                Some(result)
            }
            None => {
                warn!("No character state to save for chapter {}", number);
                None
            }
        };

        SaveOutcome { scenes, states }
    }

    async fn load_chapter_state(&self, number: usize) -> Result<Option<CharacterStates>> {
        self.read_json(&self.state_path(number)).await
    }

    async fn load_chapter_scenes(&self, number: usize) -> Result<Option<Vec<String>>> {
        self.read_json(&self.scenes_path(number)).await
    }

    async fn list_generated_chapters(&self) -> Result<Vec<usize>> {
        let re = Regex::new(r"^chapter_(\d+)_scenes\.json$")?;
        let entries = self.storage.list(&self.output_folder).await?;
        let mut numbers: Vec<usize> = entries
            .iter()
            .filter_map(|entry| Path::new(entry).file_name())
            .filter_map(|name| {
                re.captures(&name.to_string_lossy())
                    .and_then(|caps| caps[1].parse().ok())
            })
            .collect();
        numbers.sort_unstable();
        numbers.dedup();
        Ok(numbers)
    }

    async fn save_bible(&self, bible: &StoryBible) -> Result<()> {
        let path = self.path(BIBLE_FILE);
        self.write_json(&path, bible)
            .await
            .with_context(|| format!("Failed to save story bible to {}", path))?;
        Ok(())
    }

    async fn load_bible(&self) -> Result<Option<StoryBible>> {
        self.read_json(&self.path(BIBLE_FILE)).await
    }

    async fn load_progress(&self) -> Result<Progress> {
        Ok(self
            .read_json::<Progress>(&self.path(PROGRESS_FILE))
            .await?
            .unwrap_or_default())
    }

    async fn save_progress(&self, progress: &Progress) -> Result<()> {
        let path = self.path(PROGRESS_FILE);
        self.write_json(&path, progress)
            .await
            .with_context(|| format!("Failed to save progress to {}", path))?;
        Ok(())
    }
}
