//! Prompt assembly for each generation step.

use crate::core::state::{CharacterProfile, WorldDetails};
use crate::utils::text::{preview, trailing_sentences};

pub struct Prompt {
    pub system: String,
    pub user: String,
}

pub fn world_bible(world_concept: &str) -> Prompt {
    Prompt {
        system: "You are a world-building assistant. Expand the user's concept into a world bible. \
                 Return a single JSON object with the fields: \
                 \"overall_tone\" (string), \
                 \"key_locations\" (list of {\"name\", \"description\"}), \
                 \"core_rules\" (list of strings), \
                 \"history_snippet\" (string). \
                 Fill in every field. Return only the JSON object."
            .to_string(),
        user: format!(
            "User World Concept: {}\n\nGenerate the World Details JSON object.",
            world_concept
        ),
    }
}

pub fn character_bible(character_concept: &str, world: Option<&WorldDetails>) -> Prompt {
    let world_context = world
        .map(world_summary)
        .unwrap_or_else(|| "No world context available.".to_string());
    Prompt {
        system: format!(
            "You are a character creation assistant. Create the main character of the story. \
             Provide the information using these labels EXACTLY, one per line:\n\
             Name:\nDescription:\nBackstory:\nMotivation:\nFears: (separate with ';', or 'None')\n\n\
             World Context: {}",
            world_context
        ),
        user: format!(
            "User Character Concept:\n```\n{}\n```\n\nGenerate the profile using labels.",
            character_concept
        ),
    }
}

pub fn overall_plot(premise: &str, world_json: &str, character_json: &str) -> Prompt {
    Prompt {
        system: "You are a master storyteller outlining a novel. Split the story into chapters. \
                 Return a JSON list where each chapter object has a \"title\" and a \"description\" \
                 summarizing its main events. Return only the JSON list."
            .to_string(),
        user: format!(
            "Story Premise:\n```\n{}\n```\nCharacter Profile:\n```json\n{}\n```\nWorld Details:\n```json\n{}\n```\nGenerate the JSON list of chapter outline objects.",
            premise, character_json, world_json
        ),
    }
}

pub fn chapter_planner(chapter_summary: &str, world_json: &str, character_json: &str) -> Prompt {
    Prompt {
        system: "You are a detailed novel plotter. Break the given chapter summary down into a series of \
                 distinct scenes. For each scene, provide a \"scene_title\", a \"scene_summary\" with its \
                 specific goal, \"characters\", a \"setting\" and key \"plot_points\". \
                 Output a JSON list of scene objects."
            .to_string(),
        user: format!(
            "Overall Chapter Goal/Summary:\n```\n{}\n```\nCharacter Profile:\n```json\n{}\n```\nWorld Details:\n```json\n{}\n```\nGenerate the JSON list of scene outline objects.",
            chapter_summary, character_json, world_json
        ),
    }
}

/// Everything the scene prompt needs beyond the bible.
pub struct SceneContext<'a> {
    pub scene_goal: &'a str,
    pub chapter_summary: Option<&'a str>,
    pub previous_scene: Option<&'a str>,
    pub mood: &'a str,
    pub location: &'a str,
}

pub fn scene_prose(
    world: &WorldDetails,
    character: &CharacterProfile,
    ctx: &SceneContext<'_>,
) -> Prompt {
    let tone = world.tone.as_deref().unwrap_or("neutral");
    let mut rules = if world.rules.is_empty() {
        "Standard world rules apply.".to_string()
    } else {
        world.rules.iter().take(2).cloned().collect::<Vec<_>>().join("; ")
    };
    if world.rules.len() > 2 {
        rules.push_str("...");
    }
    let previous = ctx
        .previous_scene
        .map(|prose| trailing_sentences(prose, 3))
        .filter(|tail| !tail.is_empty())
        .unwrap_or_else(|| "This is the first scene of the chapter.".to_string());

    let system = format!(
        "You are a skilled novelist writing one scene of a novel.\n\n\
         **Overall World Context:**\n- Tone: {tone}\n- Key Rules: {rules}\n\n\
         **Character Profile ({name}):**\n- Description: {description}\n- Core Motivation: {motivation}\n\
         - Current State: Mood is {mood}, Location is {location}.\n\n\
         **Chapter Context:**\n- Overall Goal: {chapter}\n\n\
         **Scene Context:**\n- Previous Scene Ending: {previous}\n- **This Scene's Goal:** {goal}\n\n\
         **Your Task:** Write the narrative prose for this specific scene in 3-5 substantial paragraphs. \
         Fulfil the scene goal, reflect the character's mood, location and motivation, keep the world's tone \
         and continue smoothly from the previous scene. Output ONLY the raw prose, with no labels, \
         summaries or markdown.",
        tone = tone,
        rules = rules,
        name = character.name,
        description = preview(&character.description, 150),
        motivation = character.core_motivation,
        mood = ctx.mood,
        location = ctx.location,
        chapter = ctx.chapter_summary.unwrap_or("N/A"),
        previous = previous,
        goal = ctx.scene_goal,
    );

    Prompt {
        system,
        user: "Write the scene based on the provided goal and context.".to_string(),
    }
}

/// One-line text summary of the world, used where JSON would be too heavy.
pub fn world_summary(world: &WorldDetails) -> String {
    let or_na = |s: String| if s.is_empty() { "N/A".to_string() } else { s };
    let locations = world
        .locations
        .iter()
        .map(|l| l.name.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "Tone: {}. Key Locations: {}. Core Rules: {}. History Snippet: {}",
        world.tone.as_deref().unwrap_or("N/A"),
        or_na(locations),
        or_na(world.rules.join("; ")),
        or_na(world.history.clone()),
    )
}
