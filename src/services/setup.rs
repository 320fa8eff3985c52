use crate::core::config::{Config, StoryConcepts};
use crate::core::state::StoryBible;
use crate::services::workflow::{ChapterGate, RunInputs};
use anyhow::{bail, Result};
use inquire::validator::ValueRequiredValidator;
use inquire::{Confirm, Text};

const PROMPTS: [(&str, &str); 3] = [
    ("world", "Describe the world of your story:"),
    ("character", "Describe the main character:"),
    ("premise", "What is the story premise?"),
];

fn configured(story: Option<&StoryConcepts>) -> [Option<String>; 3] {
    let pick = |value: Option<&String>| {
        value
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    match story {
        Some(story) => [
            pick(story.world.as_ref()),
            pick(story.character.as_ref()),
            pick(story.premise.as_ref()),
        ],
        None => [None, None, None],
    }
}

/// Concepts from `config.yml`, asking for any that are missing. Answers are
/// saved back to the config. Unattended runs cannot ask and fail instead.
pub fn collect_concepts(config: &mut Config) -> Result<RunInputs> {
    let mut values = configured(config.story.as_ref());

    let missing: Vec<&str> = PROMPTS
        .iter()
        .zip(values.iter())
        .filter(|(_, value)| value.is_none())
        .map(|((key, _), _)| *key)
        .collect();
    if !missing.is_empty() && config.unattended {
        bail!(
            "Unattended run is missing story concepts in {}: {}",
            crate::core::config::CONFIG_FILE,
            missing.join(", ")
        );
    }

    for ((_, prompt), value) in PROMPTS.iter().zip(values.iter_mut()) {
        if value.is_none() {
            let answer = Text::new(prompt)
                .with_validator(ValueRequiredValidator::default())
                .prompt()?;
            *value = Some(answer.trim().to_string());
        }
    }

    let [world, character, premise] = values;
    if !missing.is_empty() {
        config.story = Some(StoryConcepts {
            world: world.clone(),
            character: character.clone(),
            premise: premise.clone(),
        });
        config.save()?;
        println!("Story concepts saved to {}.", crate::core::config::CONFIG_FILE);
    }
    Ok(RunInputs {
        world: world.unwrap_or_default(),
        character: character.unwrap_or_default(),
        premise: premise.unwrap_or_default(),
    })
}

/// Whether to continue a story found in the output folder. Unattended runs
/// always resume.
pub fn confirm_resume(config: &Config, bible: &StoryBible, next_chapter: usize) -> Result<bool> {
    if config.unattended {
        return Ok(true);
    }
    let total = bible.plot_outline.len();
    let message = if next_chapter > total {
        format!("Found a finished story with {} chapters. Start a new one?", total)
    } else {
        format!(
            "Found a story in progress. Continue with chapter {}/{}?",
            next_chapter, total
        )
    };
    let answer = Confirm::new(&message).with_default(true).prompt()?;
    // For a finished story "yes" means starting over.
    Ok(if next_chapter > total { !answer } else { answer })
}

/// Asks on the terminal before every further chapter.
pub struct ConfirmGate;

impl ChapterGate for ConfirmGate {
    fn should_continue(&self, finished: usize, total: usize) -> bool {
        let ans = Confirm::new(&format!(
            "Chapter {}/{} done. Continue to next chapter?",
            finished, total
        ))
        .with_default(true)
        .prompt();

        match ans {
            Ok(answer) => answer,
            Err(_) => {
                println!("Error reading input, stopping.");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(story: Option<StoryConcepts>, unattended: bool) -> Config {
        let mut config = Config::parse("llm:\n  provider: ollama\n").unwrap();
        config.story = story;
        config.unattended = unattended;
        config
    }

    #[test]
    fn test_concepts_from_config() {
        let story = StoryConcepts {
            world: Some(" A drowned city ".to_string()),
            character: Some("A smuggler".to_string()),
            premise: Some("A heist".to_string()),
        };
        let inputs = collect_concepts(&mut config(Some(story), true)).unwrap();
        assert_eq!(inputs.world, "A drowned city");
        assert_eq!(inputs.premise, "A heist");
    }

    #[test]
    fn test_unattended_run_rejects_missing_concepts() {
        let story = StoryConcepts {
            world: Some("A drowned city".to_string()),
            character: Some("   ".to_string()),
            premise: None,
        };
        let err = collect_concepts(&mut config(Some(story), true)).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("character, premise"));
    }

    #[test]
    fn test_unattended_always_resumes() {
        let bible: StoryBible = serde_json::from_str(
            r#"{
                "world_concept": "w", "character_concept": "c", "story_premise": "p",
                "world_details": {},
                "character_profile": {"name": "Mara", "description": "d", "backstory": "b", "core_motivation": "m"},
                "plot_outline": [{"summary": "s"}],
                "initial_states": {}
            }"#,
        )
        .unwrap();
        assert!(confirm_resume(&config(None, true), &bible, 2).unwrap());
    }
}
