//! Durable participant identity.
//!
//! The participant id is generated once and stored as JSON so a restarted
//! process rejoins a session under the same name.

use rally_common::{ConfigError, ParticipantId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdentityFile {
    participant_id: ParticipantId,
}

/// Platform default identity path: `<data_dir>/rally/identity.json`.
pub fn default_identity_path() -> Result<PathBuf, ConfigError> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| ConfigError::IdentityError("could not determine data directory".into()))?;
    Ok(data_dir.join("rally").join("identity.json"))
}

/// Read the stored participant id, or generate and persist a new one.
pub fn load_or_create_participant_id(path: &Path) -> Result<ParticipantId, ConfigError> {
    if path.exists() {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::IdentityError(format!("failed to read {}: {e}", path.display()))
        })?;
        let file: IdentityFile = serde_json::from_str(&content).map_err(|e| {
            ConfigError::IdentityError(format!("malformed identity file {}: {e}", path.display()))
        })?;
        if file.participant_id.as_str().is_empty() {
            return Err(ConfigError::IdentityError(format!(
                "empty participant id in {}",
                path.display()
            )));
        }
        return Ok(file.participant_id);
    }

    let participant_id = ParticipantId::generate();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            ConfigError::IdentityError(format!("failed to create {}: {e}", parent.display()))
        })?;
    }
    let content = serde_json::to_string_pretty(&IdentityFile {
        participant_id: participant_id.clone(),
    })
    .map_err(|e| ConfigError::IdentityError(e.to_string()))?;
    std::fs::write(path, content).map_err(|e| {
        ConfigError::IdentityError(format!("failed to write {}: {e}", path.display()))
    })?;

    info!(participant_id = %participant_id, "created participant identity");
    Ok(participant_id)
}
