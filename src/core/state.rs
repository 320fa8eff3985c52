use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const DEFAULT_MOOD: &str = "neutral";
pub const DEFAULT_LOCATION: &str = "Unknown";

/// Free-form attributes per character, e.g. `mood` and `location`.
pub type CharacterDynamicState = BTreeMap<String, String>;
/// Character name -> dynamic attributes.
pub type CharacterStates = BTreeMap<String, CharacterDynamicState>;

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
pub struct Location {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
pub struct WorldDetails {
    #[serde(rename = "overall_tone", alias = "tone", default)]
    pub tone: Option<String>,
    #[serde(rename = "key_locations", alias = "locations", default)]
    pub locations: Vec<Location>,
    #[serde(rename = "core_rules", alias = "rules", default)]
    pub rules: Vec<String>,
    #[serde(rename = "history_snippet", alias = "history", default)]
    pub history: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CharacterProfile {
    pub name: String,
    pub description: String,
    pub backstory: String,
    pub core_motivation: String,
    #[serde(default)]
    pub fears: Option<Vec<String>>,
}

impl CharacterProfile {
    /// The dynamic state every run starts from.
    pub fn initial_states(&self) -> CharacterStates {
        let mut attrs = CharacterDynamicState::new();
        attrs.insert("mood".to_string(), DEFAULT_MOOD.to_string());
        attrs.insert("location".to_string(), DEFAULT_LOCATION.to_string());
        let mut states = CharacterStates::new();
        states.insert(self.name.clone(), attrs);
        states
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChapterOutline {
    #[serde(default)]
    pub title: Option<String>,
    pub summary: String,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
pub struct SceneItem {
    #[serde(rename = "scene_title", default)]
    pub title: Option<String>,
    #[serde(rename = "scene_summary", default)]
    pub summary: Option<String>,
    #[serde(rename = "scene_setting", default)]
    pub setting: Option<String>,
    #[serde(default)]
    pub characters: Option<Vec<String>>,
    #[serde(default)]
    pub plot_points: Option<Vec<String>>,
}

/// Classifies a failure recorded in [`RunState::error`].
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// A required upstream field is missing.
    Input,
    /// Model output did not have the expected shape.
    Schema,
    /// The completion call itself failed or returned nothing usable.
    Generation,
    /// A scene goal could not be derived; scoped to the current chapter.
    Derivation,
    /// A traversal ran out of its node budget.
    StepLimit,
}

impl FailureKind {
    /// Whether the failure should stop the whole run rather than one chapter.
    pub fn is_fatal(self) -> bool {
        !matches!(self, FailureKind::Derivation)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StepFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StepFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} error: {}", self.kind, self.message)
    }
}

/// The record threaded through every step of a run.
///
/// Steps never mutate a snapshot in place; they build the next one with
/// [`RunState::merge`].
#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
pub struct RunState {
    pub world_concept: Option<String>,
    pub character_concept: Option<String>,
    pub story_premise: Option<String>,

    pub world_details: Option<WorldDetails>,
    pub character_profile: Option<CharacterProfile>,
    pub plot_outline: Option<Vec<ChapterOutline>>,

    pub current_chapter_index: usize,
    pub current_chapter_summary: Option<String>,
    pub chapter_scene_outline: Option<Vec<SceneItem>>,
    pub current_scene_index: usize,
    pub current_scene_goal: Option<String>,
    pub current_scene_prose: Option<String>,
    pub completed_chapter_prose: Vec<String>,
    pub character_states: Option<CharacterStates>,
    pub consistency_notes: Option<Vec<String>>,

    pub error: Option<StepFailure>,
    pub debug_output: Option<String>,
}

impl RunState {
    pub fn from_concepts(
        world_concept: impl Into<String>,
        character_concept: impl Into<String>,
        story_premise: impl Into<String>,
    ) -> Self {
        Self {
            world_concept: Some(world_concept.into()),
            character_concept: Some(character_concept.into()),
            story_premise: Some(story_premise.into()),
            ..Default::default()
        }
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Number of chapters in the outline, zero when no outline exists yet.
    pub fn chapter_count(&self) -> usize {
        self.plot_outline.as_ref().map_or(0, Vec::len)
    }

    /// Whether the scene loop still has an item to process.
    pub fn has_pending_scene(&self) -> bool {
        self.chapter_scene_outline
            .as_ref()
            .is_some_and(|outline| self.current_scene_index < outline.len())
    }

    /// Mood and location for `name`, falling back to the defaults.
    pub fn mood_and_location(&self, name: &str) -> (String, String) {
        let attrs = self
            .character_states
            .as_ref()
            .and_then(|states| states.get(name));
        let read = |key: &str, default: &str| {
            attrs
                .and_then(|a| a.get(key))
                .cloned()
                .unwrap_or_else(|| default.to_string())
        };
        (read("mood", DEFAULT_MOOD), read("location", DEFAULT_LOCATION))
    }

    /// Builds the next snapshot from `self` plus a partial update.
    pub fn merge(&self, update: StateUpdate) -> RunState {
        let mut next = self.clone();
        update.world_concept.apply_opt(&mut next.world_concept);
        update.character_concept.apply_opt(&mut next.character_concept);
        update.story_premise.apply_opt(&mut next.story_premise);
        update.world_details.apply_opt(&mut next.world_details);
        update.character_profile.apply_opt(&mut next.character_profile);
        update.plot_outline.apply_opt(&mut next.plot_outline);
        update.current_chapter_index.apply(&mut next.current_chapter_index);
        update
            .current_chapter_summary
            .apply_opt(&mut next.current_chapter_summary);
        update
            .chapter_scene_outline
            .apply_opt(&mut next.chapter_scene_outline);
        update.current_scene_index.apply(&mut next.current_scene_index);
        update.current_scene_goal.apply_opt(&mut next.current_scene_goal);
        update.current_scene_prose.apply_opt(&mut next.current_scene_prose);
        update
            .completed_chapter_prose
            .apply(&mut next.completed_chapter_prose);
        update.character_states.apply_opt(&mut next.character_states);
        update.consistency_notes.apply_opt(&mut next.consistency_notes);
        update.error.apply_opt(&mut next.error);
        update.debug_output.apply_opt(&mut next.debug_output);
        next
    }
}

/// One field of a [`StateUpdate`].
#[derive(Clone, Debug, PartialEq)]
pub enum Field<T> {
    Keep,
    Set(T),
    /// Resets the field to its empty value.
    Clear,
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Field::Keep
    }
}

impl<T> Field<T> {
    fn apply_opt(self, slot: &mut Option<T>) {
        match self {
            Field::Keep => {}
            Field::Set(value) => *slot = Some(value),
            Field::Clear => *slot = None,
        }
    }
}

impl<T: Default> Field<T> {
    fn apply(self, slot: &mut T) {
        match self {
            Field::Keep => {}
            Field::Set(value) => *slot = value,
            Field::Clear => *slot = T::default(),
        }
    }
}

/// Partial update consumed by [`RunState::merge`]. Unmentioned fields are kept.
#[derive(Clone, Debug, Default)]
pub struct StateUpdate {
    pub world_concept: Field<String>,
    pub character_concept: Field<String>,
    pub story_premise: Field<String>,
    pub world_details: Field<WorldDetails>,
    pub character_profile: Field<CharacterProfile>,
    pub plot_outline: Field<Vec<ChapterOutline>>,
    pub current_chapter_index: Field<usize>,
    pub current_chapter_summary: Field<String>,
    pub chapter_scene_outline: Field<Vec<SceneItem>>,
    pub current_scene_index: Field<usize>,
    pub current_scene_goal: Field<String>,
    pub current_scene_prose: Field<String>,
    pub completed_chapter_prose: Field<Vec<String>>,
    pub character_states: Field<CharacterStates>,
    pub consistency_notes: Field<Vec<String>>,
    pub error: Field<StepFailure>,
    pub debug_output: Field<String>,
}

impl StateUpdate {
    /// An update that records `failure` and leaves everything else alone.
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            error: Field::Set(StepFailure::new(kind, message)),
            ..Default::default()
        }
    }

    pub fn with_debug(mut self, debug: Option<String>) -> Self {
        if let Some(debug) = debug {
            self.debug_output = Field::Set(debug);
        }
        self
    }
}

/// Chapters that finished without a failure, persisted between runs.
#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
pub struct Progress {
    pub completed_chapters: Vec<usize>,
}

impl Progress {
    pub fn is_completed(&self, number: usize) -> bool {
        self.completed_chapters.contains(&number)
    }

    pub fn mark_completed(&mut self, number: usize) {
        if !self.is_completed(number) {
            self.completed_chapters.push(number);
            self.completed_chapters.sort_unstable();
        }
    }

    /// 0-based index of the first chapter not yet completed, or `total` when
    /// every chapter is done.
    pub fn first_pending(&self, total: usize) -> usize {
        (0..total)
            .find(|index| !self.is_completed(index + 1))
            .unwrap_or(total)
    }
}

/// The Phase 1 products that stay fixed for the whole story.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StoryBible {
    pub world_concept: Option<String>,
    pub character_concept: Option<String>,
    pub story_premise: Option<String>,
    pub world_details: WorldDetails,
    pub character_profile: CharacterProfile,
    pub plot_outline: Vec<ChapterOutline>,
    pub initial_states: CharacterStates,
}

impl StoryBible {
    /// Extracts the bible from a state that completed Phase 1.
    pub fn from_state(state: &RunState) -> Option<Self> {
        let world_details = state.world_details.clone()?;
        let character_profile = state.character_profile.clone()?;
        let plot_outline = state.plot_outline.clone().filter(|o| !o.is_empty())?;
        let initial_states = character_profile.initial_states();
        Some(Self {
            world_concept: state.world_concept.clone(),
            character_concept: state.character_concept.clone(),
            story_premise: state.story_premise.clone(),
            world_details,
            character_profile,
            plot_outline,
            initial_states,
        })
    }

    /// A fresh state for traversing `chapter_index` with `states` carried over.
    pub fn chapter_state(&self, chapter_index: usize, states: CharacterStates) -> RunState {
        RunState {
            world_concept: self.world_concept.clone(),
            character_concept: self.character_concept.clone(),
            story_premise: self.story_premise.clone(),
            world_details: Some(self.world_details.clone()),
            character_profile: Some(self.character_profile.clone()),
            plot_outline: Some(self.plot_outline.clone()),
            current_chapter_index: chapter_index,
            character_states: Some(states),
            ..Default::default()
        }
    }
}
