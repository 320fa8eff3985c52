//! One function per generation step.
//!
//! Every step takes the current snapshot and returns the next one. Failures
//! are recorded in [`RunState::error`]; a step never returns `Err`.

use crate::core::state::{FailureKind, Field, RunState, StateUpdate};
use crate::services::llm::LlmClient;
use crate::services::normalize::{
    derive_scene_goal, normalize_chapter_outline, normalize_scene_outline,
    parse_character_profile, parse_world_details,
};
use crate::services::prompts::{self, SceneContext};
use crate::services::store::ChapterStore;
use log::{debug, error, info, warn};
use serde::Serialize;

const CONTRADICTION_MARKER: &str = "placeholder contradiction";

fn missing(what: &str) -> StateUpdate {
    StateUpdate::failure(FailureKind::Input, format!("Missing {}", what))
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

/// Validates the user concepts and resets the cursors for a fresh run.
pub fn user_input(state: &RunState) -> RunState {
    let absent: Vec<&str> = [
        ("world concept", &state.world_concept),
        ("character concept", &state.character_concept),
        ("story premise", &state.story_premise),
    ]
    .iter()
    .filter(|(_, value)| present(value).is_none())
    .map(|(name, _)| *name)
    .collect();

    if !absent.is_empty() {
        error!("User input incomplete: {}", absent.join(", "));
        return state.merge(missing(&format!("user input: {}", absent.join(", "))));
    }

    info!("Starting a new novel");
    state.merge(StateUpdate {
        current_chapter_index: Field::Set(0),
        current_scene_index: Field::Set(0),
        completed_chapter_prose: Field::Clear,
        error: Field::Clear,
        debug_output: Field::Clear,
        ..Default::default()
    })
}

pub async fn world_bible(state: &RunState, llm: &dyn LlmClient) -> RunState {
    if state.world_details.is_some() {
        info!("World details already exist, skipping generation");
        return state.clone();
    }
    let Some(concept) = present(&state.world_concept) else {
        return state.merge(missing("world concept"));
    };

    info!("Generating world details");
    let prompt = prompts::world_bible(concept);
    let raw = match llm.chat_json(&prompt.system, &prompt.user).await {
        Ok(raw) => raw,
        Err(e) => {
            error!("World generation failed: {:#}", e);
            return state.merge(StateUpdate {
                world_details: Field::Clear,
                ..StateUpdate::failure(FailureKind::Generation, format!("World generation failed: {:#}", e))
            });
        }
    };

    match parse_world_details(&raw) {
        Ok(world) => {
            info!("World details generated ({} locations)", world.locations.len());
            state.merge(StateUpdate {
                world_details: Field::Set(world),
                error: Field::Clear,
                debug_output: Field::Clear,
                ..Default::default()
            })
        }
        Err(e) => {
            error!("World details rejected: {}", e);
            state.merge(
                StateUpdate {
                    world_details: Field::Clear,
                    ..StateUpdate::failure(FailureKind::Schema, format!("World details invalid: {}", e))
                }
                .with_debug(Some(raw)),
            )
        }
    }
}

pub async fn character_bible(state: &RunState, llm: &dyn LlmClient) -> RunState {
    if state.character_profile.is_some() {
        info!("Character profile already exists, skipping generation");
        return state.clone();
    }
    let Some(concept) = present(&state.character_concept) else {
        return state.merge(missing("character concept"));
    };

    info!("Generating character profile");
    let prompt = prompts::character_bible(concept, state.world_details.as_ref());
    let cleared = |failure: StateUpdate| StateUpdate {
        character_profile: Field::Clear,
        character_states: Field::Clear,
        ..failure
    };

    let raw = match llm.chat(&prompt.system, &prompt.user).await {
        Ok(raw) => raw,
        Err(e) => {
            error!("Character generation failed: {:#}", e);
            return state.merge(cleared(StateUpdate::failure(
                FailureKind::Generation,
                format!("Character generation failed: {:#}", e),
            )));
        }
    };

    match parse_character_profile(&raw) {
        Ok(profile) => {
            info!("Character profile created for {}", profile.name);
            let states = profile.initial_states();
            state.merge(StateUpdate {
                character_profile: Field::Set(profile),
                character_states: Field::Set(states),
                error: Field::Clear,
                debug_output: Field::Clear,
                ..Default::default()
            })
        }
        Err(e) => {
            error!("Character profile rejected: {}", e);
            state.merge(
                cleared(StateUpdate::failure(
                    FailureKind::Schema,
                    format!("Character profile invalid: {}", e),
                ))
                .with_debug(Some(raw)),
            )
        }
    }
}

pub async fn overall_plot(state: &RunState, llm: &dyn LlmClient) -> RunState {
    if state.chapter_count() > 0 {
        info!("Plot outline already exists, skipping generation");
        return state.clone();
    }
    let (Some(premise), Some(world), Some(profile)) = (
        present(&state.story_premise),
        state.world_details.as_ref(),
        state.character_profile.as_ref(),
    ) else {
        return state.merge(missing("premise, world details or character profile for plotting"));
    };

    info!("Generating plot outline");
    let prompt = prompts::overall_plot(premise, &to_json(world), &to_json(profile));
    let raw = match llm.chat_json(&prompt.system, &prompt.user).await {
        Ok(raw) => raw,
        Err(e) => {
            error!("Plot outline generation failed: {:#}", e);
            return state.merge(StateUpdate {
                plot_outline: Field::Clear,
                ..StateUpdate::failure(FailureKind::Generation, format!("Plot outline generation failed: {:#}", e))
            });
        }
    };

    match normalize_chapter_outline(&raw) {
        Ok(outline) => {
            info!("Plot outline generated with {} chapters", outline.len());
            state.merge(StateUpdate {
                plot_outline: Field::Set(outline),
                error: Field::Clear,
                debug_output: Field::Clear,
                ..Default::default()
            })
        }
        Err(e) => {
            error!("Plot outline rejected: {}", e);
            state.merge(
                StateUpdate {
                    plot_outline: Field::Clear,
                    ..StateUpdate::failure(FailureKind::Schema, format!("Plot outline invalid: {}", e))
                }
                .with_debug(Some(raw)),
            )
        }
    }
}

/// Selects the chapter at the cursor and resets every per-chapter field.
pub fn prepare_chapter(state: &RunState) -> RunState {
    let index = state.current_chapter_index;
    let Some(outline) = state.plot_outline.as_ref() else {
        return state.merge(missing("plot outline"));
    };
    let Some(chapter) = outline.get(index) else {
        return state.merge(StateUpdate::failure(
            FailureKind::Input,
            format!(
                "Chapter index {} is out of range for an outline of {} chapters",
                index,
                outline.len()
            ),
        ));
    };
    let summary = chapter.summary.trim();
    if summary.is_empty() {
        return state.merge(StateUpdate::failure(
            FailureKind::Input,
            format!("Chapter {} has an empty summary", index + 1),
        ));
    }

    info!(
        "Preparing chapter {}/{}: {}",
        index + 1,
        outline.len(),
        chapter.title.as_deref().unwrap_or(summary)
    );
    state.merge(StateUpdate {
        current_chapter_summary: Field::Set(summary.to_string()),
        chapter_scene_outline: Field::Clear,
        current_scene_index: Field::Set(0),
        current_scene_goal: Field::Clear,
        current_scene_prose: Field::Clear,
        completed_chapter_prose: Field::Clear,
        consistency_notes: Field::Clear,
        error: Field::Clear,
        debug_output: Field::Clear,
        ..Default::default()
    })
}

pub async fn chapter_planner(state: &RunState, llm: &dyn LlmClient) -> RunState {
    if state
        .chapter_scene_outline
        .as_ref()
        .is_some_and(|outline| !outline.is_empty())
    {
        info!("Scene outline already exists, skipping planning");
        return state.clone();
    }
    let (Some(summary), Some(world), Some(profile)) = (
        present(&state.current_chapter_summary),
        state.world_details.as_ref(),
        state.character_profile.as_ref(),
    ) else {
        return state.merge(missing("chapter summary, world details or character profile for planning"));
    };

    info!("Planning scenes for chapter {}", state.current_chapter_index + 1);
    let prompt = prompts::chapter_planner(summary, &to_json(world), &to_json(profile));
    let raw = match llm.chat_json(&prompt.system, &prompt.user).await {
        Ok(raw) => raw,
        Err(e) => {
            error!("Scene planning failed: {:#}", e);
            return state.merge(StateUpdate {
                chapter_scene_outline: Field::Clear,
                ..StateUpdate::failure(FailureKind::Generation, format!("Scene planning failed: {:#}", e))
            });
        }
    };

    match normalize_scene_outline(&raw) {
        Ok(scenes) => {
            info!("Chapter {} planned with {} scenes", state.current_chapter_index + 1, scenes.len());
            state.merge(StateUpdate {
                chapter_scene_outline: Field::Set(scenes),
                ..Default::default()
            })
        }
        Err(e) => {
            error!("Scene outline rejected: {}", e);
            state.merge(
                StateUpdate {
                    chapter_scene_outline: Field::Clear,
                    ..StateUpdate::failure(FailureKind::Schema, format!("Scene outline invalid: {}", e))
                }
                .with_debug(Some(raw)),
            )
        }
    }
}

pub fn prepare_scene(state: &RunState) -> RunState {
    let index = state.current_scene_index;
    let Some(item) = state
        .chapter_scene_outline
        .as_ref()
        .and_then(|outline| outline.get(index))
    else {
        return state.merge(StateUpdate::failure(
            FailureKind::Input,
            format!("No scene {} in the current outline", index + 1),
        ));
    };

    match derive_scene_goal(item) {
        Ok(goal) => {
            info!("Scene {} goal: {}", index + 1, goal);
            state.merge(StateUpdate {
                current_scene_goal: Field::Set(goal),
                current_scene_prose: Field::Clear,
                consistency_notes: Field::Clear,
                ..Default::default()
            })
        }
        Err(e) => {
            warn!("Scene {} of chapter {}: {}", index + 1, state.current_chapter_index + 1, e);
            state.merge(StateUpdate {
                current_scene_goal: Field::Clear,
                ..StateUpdate::failure(FailureKind::Derivation, format!("Scene {}: {}", index + 1, e))
            })
        }
    }
}

pub async fn scene_generator(state: &RunState, llm: &dyn LlmClient) -> RunState {
    let (Some(goal), Some(world), Some(profile), Some(_)) = (
        present(&state.current_scene_goal),
        state.world_details.as_ref(),
        state.character_profile.as_ref(),
        state.character_states.as_ref(),
    ) else {
        return state.merge(missing(
            "scene goal, world details, character profile or character state for scene writing",
        ));
    };

    let (mood, location) = state.mood_and_location(&profile.name);
    let ctx = SceneContext {
        scene_goal: goal,
        chapter_summary: present(&state.current_chapter_summary),
        previous_scene: state.completed_chapter_prose.last().map(String::as_str),
        mood: &mood,
        location: &location,
    };
    let prompt = prompts::scene_prose(world, profile, &ctx);

    info!("Writing scene {}", state.current_scene_index + 1);
    let failed = |message: String| {
        error!("{}", message);
        state.merge(
            StateUpdate {
                current_scene_prose: Field::Clear,
                ..StateUpdate::failure(FailureKind::Generation, message)
            }
            .with_debug(Some(prompt.system.clone())),
        )
    };

    match llm.chat(&prompt.system, &prompt.user).await {
        Ok(prose) => {
            let prose = prose.trim();
            if prose.is_empty() {
                return failed(format!("Scene {} came back empty", state.current_scene_index + 1));
            }
            debug!("Scene prose: {} chars", prose.chars().count());
            state.merge(StateUpdate {
                current_scene_prose: Field::Set(prose.to_string()),
                ..Default::default()
            })
        }
        Err(e) => failed(format!(
            "Scene {} generation failed: {:#}",
            state.current_scene_index + 1,
            e
        )),
    }
}

/// Flags suspicious prose. Findings are notes, never errors.
pub fn consistency_checker(state: &RunState) -> RunState {
    let Some(prose) = present(&state.current_scene_prose) else {
        warn!("No prose to check for consistency");
        return state.merge(StateUpdate {
            consistency_notes: Field::Set(Vec::new()),
            ..Default::default()
        });
    };

    let mut notes = Vec::new();
    if prose.to_lowercase().contains(CONTRADICTION_MARKER) {
        notes.push(format!(
            "Placeholder contradiction noted in Scene {}.",
            state.current_scene_index + 1
        ));
    }
    if notes.is_empty() {
        debug!("Consistency check passed");
    } else {
        warn!("Consistency notes: {:?}", notes);
    }
    state.merge(StateUpdate {
        consistency_notes: Field::Set(notes),
        ..Default::default()
    })
}

/// Carries the dynamic character state forward unchanged.
pub fn state_updater(state: &RunState) -> RunState {
    if present(&state.current_scene_prose).is_none()
        || state.character_profile.is_none()
        || state.character_states.is_none()
    {
        warn!("Skipping state update: prose, profile or character state missing");
        return state.clone();
    }
    debug!("Character state carried over unchanged");
    state.clone()
}

pub fn accumulate_scene(state: &RunState) -> RunState {
    let mut completed = state.completed_chapter_prose.clone();
    match present(&state.current_scene_prose) {
        Some(prose) => completed.push(prose.to_string()),
        None => warn!(
            "Scene {} produced no prose, nothing to accumulate",
            state.current_scene_index + 1
        ),
    }
    let next_index = state.current_scene_index + 1;
    info!(
        "Scene {} complete ({} scenes in chapter so far)",
        state.current_scene_index + 1,
        completed.len()
    );
    state.merge(StateUpdate {
        completed_chapter_prose: Field::Set(completed),
        current_scene_index: Field::Set(next_index),
        current_scene_prose: Field::Clear,
        ..Default::default()
    })
}

/// Persists whatever prose the chapter has, including a partial chapter.
/// Store failures are logged and never reach the state.
pub async fn save_chapter_output(state: &RunState, store: &dyn ChapterStore) -> RunState {
    let number = state.current_chapter_index + 1;
    if state.completed_chapter_prose.is_empty() {
        warn!("Chapter {} has no completed scenes", number);
    }
    let outcome = store
        .save_chapter(
            number,
            &state.completed_chapter_prose,
            state.character_states.as_ref(),
        )
        .await;
    if !outcome.is_complete() {
        warn!("Chapter {} was only partially saved", number);
    }
    state.clone()
}

pub fn final_output(state: &RunState) -> RunState {
    match &state.error {
        Some(failure) => {
            error!("Workflow stopped: {}", failure);
            if let Some(debug) = &state.debug_output {
                error!("Debug output:\n{}", debug);
            }
        }
        None => info!("Workflow finished without errors"),
    }
    state.clone()
}
