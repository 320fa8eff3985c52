//! Recovery of structured data from raw model output.
//!
//! Models rarely honour the requested shape exactly: JSON arrives wrapped in
//! commentary or code fences and field names drift between calls. Every
//! target type has an alias table that is resolved before validation.

use crate::core::state::{ChapterOutline, CharacterProfile, SceneItem, WorldDetails};
use log::{info, warn};
use regex::Regex;
use serde_json::{Map, Value};

/// Alias precedence for a chapter's summary text.
const CHAPTER_SUMMARY_KEYS: &[&str] = &["summary", "description"];
const CHAPTER_TITLE_KEYS: &[&str] = &["title", "chapter_title"];

/// Alias precedence for a scene's summary text.
const SCENE_SUMMARY_KEYS: &[&str] = &["scene_summary", "summary", "scene_goal", "description"];
const SCENE_TITLE_KEYS: &[&str] = &["scene_title", "title"];
const SCENE_SETTING_KEYS: &[&str] = &["scene_setting", "setting", "location"];

const PROFILE_LABELS: &[&str] = &["Name", "Description", "Backstory", "Motivation", "Fears"];

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, derive_more::Error)]
pub enum SchemaError {
    #[display("Could not find JSON list structure (`[...]`) in LLM output")]
    NoArrayFound,
    #[display("Could not find JSON object structure (`{{...}}`) in LLM output")]
    NoObjectFound,
    #[display("Malformed JSON: {}", message)]
    MalformedJson { message: String },
    #[display("Empty or invalid list: {}", reason)]
    EmptyOrInvalidList { reason: String },
    #[display("Required field '{}' is missing or empty", field)]
    MissingField { field: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, derive_more::Error)]
#[display("Cannot determine scene goal: no summary, plot points, title or setting")]
pub struct SceneGoalUndetermined;

pub fn normalize_chapter_outline(raw: &str) -> Result<Vec<ChapterOutline>, SchemaError> {
    let items = extract_array(raw)?;
    if items.is_empty() {
        return Err(SchemaError::EmptyOrInvalidList {
            reason: "outline contains no chapters".to_string(),
        });
    }

    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            repair_chapter(item).ok_or_else(|| SchemaError::EmptyOrInvalidList {
                reason: format!("chapter {} has no usable summary", i + 1),
            })
        })
        .collect()
}

fn repair_chapter(item: &Value) -> Option<ChapterOutline> {
    let obj = item.as_object()?;
    let summary = match first_text(obj, CHAPTER_SUMMARY_KEYS) {
        Some(summary) => summary,
        None => {
            let joined = joined_plot_points(obj)?;
            info!("Synthesized chapter summary from plot_points");
            joined
        }
    };
    Some(ChapterOutline {
        title: first_text(obj, CHAPTER_TITLE_KEYS),
        summary,
    })
}

/// Scene items with no usable field are kept here; they fail later, when a
/// goal is derived for them.
pub fn normalize_scene_outline(raw: &str) -> Result<Vec<SceneItem>, SchemaError> {
    let items = extract_array(raw)?;
    if items.is_empty() {
        return Err(SchemaError::EmptyOrInvalidList {
            reason: "scene outline contains no scenes".to_string(),
        });
    }

    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            repair_scene(item).ok_or_else(|| SchemaError::EmptyOrInvalidList {
                reason: format!("scene {} is not an object", i + 1),
            })
        })
        .collect()
}

fn repair_scene(item: &Value) -> Option<SceneItem> {
    let obj = item.as_object()?;
    let summary = first_text(obj, SCENE_SUMMARY_KEYS).or_else(|| {
        let joined = joined_plot_points(obj);
        if joined.is_some() {
            info!("Synthesized scene_summary from plot_points");
        }
        joined
    });
    Some(SceneItem {
        title: first_text(obj, SCENE_TITLE_KEYS),
        summary,
        setting: first_text(obj, SCENE_SETTING_KEYS),
        characters: text_list(obj, "characters"),
        plot_points: text_list(obj, "plot_points"),
    })
}

/// Resolves a scene item to the single instruction that drives prose
/// generation.
pub fn derive_scene_goal(item: &SceneItem) -> Result<String, SceneGoalUndetermined> {
    if let Some(summary) = non_empty(&item.summary) {
        return Ok(summary.to_string());
    }

    if let Some(points) = item.plot_points.as_ref().filter(|p| !p.is_empty()) {
        let mut parts = Vec::with_capacity(points.len() + 1);
        if let Some(title) = non_empty(&item.title) {
            parts.push(format!("{}:", title));
        }
        parts.extend(points.iter().cloned());
        return Ok(parts.join(" "));
    }

    if let Some(title) = non_empty(&item.title) {
        return Ok(title.to_string());
    }

    if let Some(setting) = non_empty(&item.setting) {
        return Ok(format!("Scene set in: {}", setting));
    }

    Err(SceneGoalUndetermined)
}

pub fn parse_world_details(raw: &str) -> Result<WorldDetails, SchemaError> {
    let raw = strip_code_blocks(raw);
    let slice = slice_between(&raw, '{', '}').ok_or(SchemaError::NoObjectFound)?;
    serde_json::from_str(slice).map_err(|e| SchemaError::MalformedJson {
        message: e.to_string(),
    })
}

/// Reads a label-formatted profile (`Name: ...`, `**Backstory:** ...`).
///
/// A missing label only yields an empty field; the record is rejected when a
/// required field ends up empty.
pub fn parse_character_profile(raw: &str) -> Result<CharacterProfile, SchemaError> {
    let mut fields: Vec<Option<String>> = Vec::with_capacity(PROFILE_LABELS.len());
    for label in PROFILE_LABELS {
        let value = find_label(raw, label);
        if value.is_none() {
            warn!("Label '{}:' not found in character profile", label);
        }
        fields.push(value);
    }

    let mut fields = fields.into_iter();
    let mut take = |field: &'static str| {
        fields
            .next()
            .flatten()
            .filter(|v| !v.is_empty())
            .ok_or(SchemaError::MissingField { field })
    };

    let name = take("name")?;
    let description = take("description")?;
    let backstory = take("backstory")?;
    let core_motivation = take("motivation")?;
    let fears = fields.next().flatten().and_then(|v| parse_fears(&v));

    Ok(CharacterProfile {
        name,
        description,
        backstory,
        core_motivation,
        fears,
    })
}

fn find_label(raw: &str, label: &str) -> Option<String> {
    let pattern = format!(
        r"(?im)^\s*(?:\*\*)?{}(?:\*\*)?\s*:(?:\*\*)?[ \t]*(.*)$",
        regex::escape(label)
    );
    let re = Regex::new(&pattern).ok()?;
    re.captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}

fn parse_fears(value: &str) -> Option<Vec<String>> {
    if value.trim().eq_ignore_ascii_case("none") {
        return None;
    }
    Some(
        value
            .split(';')
            .map(str::trim)
            .filter(|fear| !fear.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

/// Removes a surrounding markdown code fence, with or without a `json` tag.
pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if s.starts_with("```json") {
        s.trim_start_matches("```json").trim_end_matches("```").trim().to_string()
    } else if s.starts_with("```") {
        s.trim_start_matches("```").trim_end_matches("```").trim().to_string()
    } else {
        s.to_string()
    }
}

fn extract_array(raw: &str) -> Result<Vec<Value>, SchemaError> {
    let raw = strip_code_blocks(raw);
    let slice = slice_between(&raw, '[', ']').ok_or(SchemaError::NoArrayFound)?;
    let value: Value = serde_json::from_str(slice).map_err(|e| SchemaError::MalformedJson {
        message: e.to_string(),
    })?;
    match value {
        Value::Array(items) => Ok(items),
        _ => Err(SchemaError::NoArrayFound),
    }
}

/// The text from the first `open` to the last `close`, inclusive.
fn slice_between(raw: &str, open: char, close: char) -> Option<&str> {
    let start = raw.find(open)?;
    let end = raw.rfind(close)?;
    (end > start).then(|| &raw[start..=end])
}

fn first_text(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| obj.get(*key))
        .filter(|value| !value.is_null())
        .map(value_text)
        .map(|text| text.trim().to_string())
        .find(|text| !text.is_empty())
}

fn joined_plot_points(obj: &Map<String, Value>) -> Option<String> {
    let points = obj.get("plot_points")?.as_array()?;
    let joined = points.iter().map(value_text).collect::<Vec<_>>().join(" ");
    (!joined.trim().is_empty()).then_some(joined)
}

fn text_list(obj: &Map<String, Value>, key: &str) -> Option<Vec<String>> {
    match obj.get(key)? {
        Value::Array(items) => Some(items.iter().map(value_text).collect()),
        Value::Null => None,
        other => Some(vec![value_text(other)]),
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chapter_summary_synthesized_from_plot_points() {
        let outline = normalize_chapter_outline(r#"[{"plot_points": ["p1", "p2"]}]"#).unwrap();
        assert_eq!(outline.len(), 1);
        assert_eq!(outline[0].summary, "p1 p2");
        assert!(outline[0].title.is_none());
    }

    #[test]
    fn test_chapter_description_alias_and_commentary() {
        let raw = "Sure! Here is the outline:\n```json\n[\n  {\"title\": \"Arrival\", \"description\": \"She lands.\"},\n  {\"summary\": \"She leaves.\", \"plot_points\": [\"x\"]}\n]\n```\nEnjoy.";
        let outline = normalize_chapter_outline(raw).unwrap();
        assert_eq!(outline[0].title.as_deref(), Some("Arrival"));
        assert_eq!(outline[0].summary, "She lands.");
        // An explicit summary wins over plot points.
        assert_eq!(outline[1].summary, "She leaves.");
    }

    #[test]
    fn test_chapter_outline_failures() {
        assert_eq!(
            normalize_chapter_outline("no json here"),
            Err(SchemaError::NoArrayFound)
        );
        assert!(matches!(
            normalize_chapter_outline("[{\"summary\": }]"),
            Err(SchemaError::MalformedJson { .. })
        ));
        assert!(matches!(
            normalize_chapter_outline("[]"),
            Err(SchemaError::EmptyOrInvalidList { .. })
        ));
        // One unusable item rejects the whole batch.
        assert!(matches!(
            normalize_chapter_outline(r#"[{"summary": "ok"}, {"title": "only a title"}]"#),
            Err(SchemaError::EmptyOrInvalidList { .. })
        ));
        assert!(matches!(
            normalize_chapter_outline(r#"["just a string"]"#),
            Err(SchemaError::EmptyOrInvalidList { .. })
        ));
    }

    #[test]
    fn test_scene_summary_alias_precedence() {
        let raw = r#"[
            {"scene_summary": "A", "scene_goal": "B", "description": "C"},
            {"scene_goal": "B", "description": "C"},
            {"description": "C", "plot_points": ["p"]},
            {"plot_points": ["p1", 2]},
            {"title": "Only title"}
        ]"#;
        let scenes = normalize_scene_outline(raw).unwrap();
        let summaries: Vec<Option<&str>> =
            scenes.iter().map(|s| s.summary.as_deref()).collect();
        assert_eq!(
            summaries,
            vec![Some("A"), Some("B"), Some("C"), Some("p1 2"), None]
        );
        assert_eq!(scenes[3].plot_points, Some(vec!["p1".to_string(), "2".to_string()]));
        assert_eq!(scenes[4].title.as_deref(), Some("Only title"));
    }

    #[test]
    fn test_scene_title_and_setting_aliases() {
        let raw = r#"[
            {"scene_title": "T1", "title": "ignored", "location": "Harbor", "characters": ["Mara", "Ivo"]},
            {"title": "T2", "setting": "Tower"}
        ]"#;
        let scenes = normalize_scene_outline(raw).unwrap();
        assert_eq!(scenes[0].title.as_deref(), Some("T1"));
        assert_eq!(scenes[0].setting.as_deref(), Some("Harbor"));
        assert_eq!(scenes[0].characters.as_ref().map(Vec::len), Some(2));
        assert_eq!(scenes[1].title.as_deref(), Some("T2"));
        assert_eq!(scenes[1].setting.as_deref(), Some("Tower"));
    }

    #[test]
    fn test_scene_item_without_fields_is_deferred() {
        let scenes = normalize_scene_outline(r#"[{"mood": "tense"}]"#).unwrap();
        assert_eq!(scenes.len(), 1);
        assert_eq!(derive_scene_goal(&scenes[0]), Err(SceneGoalUndetermined));
    }

    #[test]
    fn test_scene_outline_rejects_empty_and_non_objects() {
        assert!(matches!(
            normalize_scene_outline("Scenes: []"),
            Err(SchemaError::EmptyOrInvalidList { .. })
        ));
        assert!(matches!(
            normalize_scene_outline("[1, 2]"),
            Err(SchemaError::EmptyOrInvalidList { .. })
        ));
    }

    #[test]
    fn test_goal_title_with_plot_points() {
        let item = SceneItem {
            title: Some("Confrontation".to_string()),
            plot_points: Some(vec![
                "A meets B".to_string(),
                "B reveals secret".to_string(),
            ]),
            ..Default::default()
        };
        assert_eq!(
            derive_scene_goal(&item).unwrap(),
            "Confrontation: A meets B B reveals secret"
        );
    }

    #[test]
    fn test_goal_summary_wins() {
        let item = SceneItem {
            summary: Some("X".to_string()),
            plot_points: Some(vec!["A meets B".to_string()]),
            ..Default::default()
        };
        assert_eq!(derive_scene_goal(&item).unwrap(), "X");
    }

    #[test]
    fn test_goal_fallbacks() {
        let points_only = SceneItem {
            plot_points: Some(vec!["A".to_string(), "B".to_string()]),
            ..Default::default()
        };
        assert_eq!(derive_scene_goal(&points_only).unwrap(), "A B");

        let title_only = SceneItem {
            title: Some("Dawn".to_string()),
            plot_points: Some(vec![]),
            ..Default::default()
        };
        assert_eq!(derive_scene_goal(&title_only).unwrap(), "Dawn");

        let setting_only = SceneItem {
            summary: Some("   ".to_string()),
            setting: Some("the old mill".to_string()),
            ..Default::default()
        };
        assert_eq!(
            derive_scene_goal(&setting_only).unwrap(),
            "Scene set in: the old mill"
        );
    }

    #[test]
    fn test_profile_without_fears_line() {
        let raw = "Name: Mara Venn\nDescription: Wiry, sharp-eyed\nBackstory: Raised on the docks\nMotivation: Clear her father's name";
        let profile = parse_character_profile(raw).unwrap();
        assert_eq!(profile.name, "Mara Venn");
        assert_eq!(profile.core_motivation, "Clear her father's name");
        assert_eq!(profile.fears, None);
    }

    #[test]
    fn test_profile_bold_labels_and_fears() {
        let raw = "Here is the profile.\n**Name:** Ivo\n**description**: Quiet\n  BACKSTORY: Exiled scholar\n**Motivation:** Return home\nFears: drowning; being forgotten ; ";
        let profile = parse_character_profile(raw).unwrap();
        assert_eq!(profile.name, "Ivo");
        assert_eq!(profile.description, "Quiet");
        assert_eq!(profile.backstory, "Exiled scholar");
        assert_eq!(
            profile.fears,
            Some(vec!["drowning".to_string(), "being forgotten".to_string()])
        );
    }

    #[test]
    fn test_profile_fears_none_maps_to_no_fears() {
        let raw = "Name: A\nDescription: B\nBackstory: C\nMotivation: D\nFears: None";
        assert_eq!(parse_character_profile(raw).unwrap().fears, None);
    }

    #[test]
    fn test_profile_missing_name_is_rejected() {
        let raw = "Description: B\nBackstory: C\nMotivation: D";
        assert_eq!(
            parse_character_profile(raw),
            Err(SchemaError::MissingField { field: "name" })
        );
    }

    #[test]
    fn test_world_details_from_wrapped_object() {
        let raw = "```json\n{\"overall_tone\": \"bleak\", \"key_locations\": [{\"name\": \"Spire\", \"description\": \"tall\"}], \"core_rules\": [\"No magic at night\"]}\n```";
        let world = parse_world_details(raw).unwrap();
        assert_eq!(world.tone.as_deref(), Some("bleak"));
        assert_eq!(world.locations[0].name, "Spire");
        assert_eq!(world.history, "");
        assert_eq!(parse_world_details("nothing"), Err(SchemaError::NoObjectFound));
    }

    #[test]
    fn test_strip_code_blocks() {
        assert_eq!(strip_code_blocks("json"), "json");
        assert_eq!(strip_code_blocks("```json\n[]\n```"), "[]");
        assert_eq!(strip_code_blocks("  ```\n{}\n```  "), "{}");
    }
}
