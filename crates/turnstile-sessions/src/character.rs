use std::path::PathBuf;
use std::sync::Arc;

use turnstile_core::{Character, CharacterExtensions, CharacterRepo};

/// Resolves a role card: system of record, then a bundled
/// `characters/<role_id>.json` file, then a hardcoded default.
pub struct CharacterLoader {
    repo: Arc<dyn CharacterRepo>,
    characters_dir: PathBuf,
    default_role_id: String,
}

impl CharacterLoader {
    pub fn new(repo: Arc<dyn CharacterRepo>, characters_dir: PathBuf, default_role_id: String) -> Self {
        Self {
            repo,
            characters_dir,
            default_role_id,
        }
    }

    pub async fn load(&self, role_id: &str) -> Character {
        if let Ok(Some(character)) = self.repo.get_character(role_id).await {
            return character;
        }

        if let Some(character) = self.read_bundled_file(role_id) {
            return character;
        }

        if role_id != self.default_role_id {
            if let Ok(Some(character)) = self.repo.get_character(&self.default_role_id).await {
                return character;
            }
            if let Some(character) = self.read_bundled_file(&self.default_role_id) {
                return character;
            }
        }

        builtin_default(&self.default_role_id)
    }

    fn read_bundled_file(&self, role_id: &str) -> Option<Character> {
        let path = self.characters_dir.join(format!("{role_id}.json"));
        let raw = std::fs::read_to_string(path).ok()?;
        let value: serde_json::Value = serde_json::from_str(&raw).ok()?;
        let data = unwrap_v2_envelope(value);
        serde_json::from_value(data).ok()
    }
}

/// Unwraps a `{spec: 'chara_card_v2', data: {...}}` envelope to its inner
/// object, passing through anything else unchanged.
fn unwrap_v2_envelope(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(mut map) if map.get("spec").and_then(|v| v.as_str()) == Some("chara_card_v2") => {
            map.remove("data").unwrap_or(serde_json::Value::Null)
        }
        other => other,
    }
}

fn builtin_default(role_id: &str) -> Character {
    Character {
        role_id: role_id.to_string(),
        name: "Assistant".to_string(),
        system_prompt: "You are a helpful assistant.".to_string(),
        first_mes: "Hello! How can I help you today?".to_string(),
        extensions: CharacterExtensions::default(),
    }
}
