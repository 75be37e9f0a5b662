use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use similar::TextDiff;
use uuid::Uuid;

pub const MANIFEST_SCHEMA_VERSION: u64 = 1;

/// One committed story: the guidelines that produced it, the narrative, and
/// a unified diff against the previous story in the session (None for the
/// first).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryRecord {
    pub story_id: String,
    pub mode: String,
    pub guidelines: String,
    pub narrative: String,
    pub narrative_diff: Option<Vec<String>>,
    pub created_at: String,
}

/// Session bookkeeping persisted as `session.json` inside the session
/// directory. Load tolerates a missing or malformed file by starting fresh.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionManifest {
    pub path: PathBuf,
    pub schema_version: u64,
    pub session_id: String,
    pub created_at: String,
    pub stories: Vec<StoryRecord>,
}

impl SessionManifest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            schema_version: MANIFEST_SCHEMA_VERSION,
            session_id: Uuid::new_v4().to_string(),
            created_at: now_utc_iso(),
            stories: Vec::new(),
        }
    }

    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut manifest = Self::new(path.clone());
        let payload = read_json(&path).unwrap_or(Value::Object(Map::new()));
        let Some(obj) = payload.as_object() else {
            return manifest;
        };

        manifest.schema_version = obj
            .get("schema_version")
            .and_then(Value::as_u64)
            .unwrap_or(manifest.schema_version);
        manifest.session_id = obj
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(manifest.session_id);
        manifest.created_at = obj
            .get("created_at")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(manifest.created_at);

        if let Some(stories) = obj.get("stories").and_then(Value::as_array) {
            for item in stories {
                if let Ok(parsed) = serde_json::from_value::<StoryRecord>(item.clone()) {
                    manifest.stories.push(parsed);
                }
            }
        }
        manifest
    }

    pub fn add_story(
        &mut self,
        mode: impl Into<String>,
        guidelines: impl Into<String>,
        narrative: impl Into<String>,
    ) -> StoryRecord {
        let narrative = narrative.into();
        let previous = self.stories.last().map(|entry| entry.narrative.as_str());
        let record = StoryRecord {
            story_id: format!("story-{}", self.stories.len() + 1),
            mode: mode.into(),
            guidelines: guidelines.into(),
            narrative_diff: narrative_diff(previous, &narrative),
            narrative,
            created_at: now_utc_iso(),
        };
        self.stories.push(record.clone());
        record
    }

    pub fn get_story(&self, index: usize) -> Option<&StoryRecord> {
        self.stories.get(index)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let mut payload = Map::new();
        payload.insert(
            "schema_version".to_string(),
            Value::Number(self.schema_version.into()),
        );
        payload.insert(
            "session_id".to_string(),
            Value::String(self.session_id.clone()),
        );
        payload.insert(
            "created_at".to_string(),
            Value::String(self.created_at.clone()),
        );
        payload.insert(
            "stories".to_string(),
            Value::Array(
                self.stories
                    .iter()
                    .map(|entry| serde_json::to_value(entry).unwrap_or(Value::Null))
                    .collect(),
            ),
        );

        write_json(&self.path, Value::Object(payload))
    }
}

fn narrative_diff(prev: Option<&str>, curr: &str) -> Option<Vec<String>> {
    let prev = prev?;
    let diff = TextDiff::from_lines(prev, curr);
    let rendered = diff.unified_diff().header("prev", "curr").to_string();
    let lines = rendered
        .lines()
        .map(str::to_string)
        .collect::<Vec<String>>();
    Some(lines)
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

fn read_json(path: &Path) -> anyhow::Result<Value> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_json(path: &Path, payload: Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&payload)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::SessionManifest;

    #[test]
    fn stories_roundtrip_through_save_and_load() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("session.json");
        let mut manifest = SessionManifest::new(&path);

        let first = manifest.add_story("generate", "a dragon story", "Once upon a time...");
        assert!(first.narrative_diff.is_none());

        let second = manifest.add_story("tweak", "make it darker", "In the dead of night...");
        assert!(second.narrative_diff.is_some());
        manifest.save()?;

        let loaded = SessionManifest::load(&path);
        assert_eq!(loaded.session_id, manifest.session_id);
        assert_eq!(loaded.stories.len(), 2);
        assert_eq!(loaded.stories[0].story_id, "story-1");
        assert_eq!(loaded.stories[1].mode, "tweak");
        assert_eq!(loaded.stories[1].narrative, "In the dead of night...");
        assert!(loaded.stories[1]
            .narrative_diff
            .as_ref()
            .is_some_and(|lines| lines.iter().any(|line| line.starts_with('+'))));
        Ok(())
    }

    #[test]
    fn load_of_missing_file_starts_fresh() {
        let manifest = SessionManifest::load("/nonexistent/session.json");
        assert!(manifest.stories.is_empty());
        assert!(!manifest.session_id.is_empty());
    }
}
