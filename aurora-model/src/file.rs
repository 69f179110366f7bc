//! Uploaded blob metadata (SSH keys, binaries, generated configs).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Text,
    Image,
    Video,
    Secret,
    Executable,
}

impl FileKind {
    /// On-disk mode policy: secrets are operator-eyes-only, executables
    /// need the execute bits, everything else is world-readable.
    pub fn mode(&self) -> u32 {
        match self {
            FileKind::Secret => 0o600,
            FileKind::Executable => 0o766,
            _ => 0o644,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Text => "text",
            FileKind::Image => "image",
            FileKind::Video => "video",
            FileKind::Secret => "secret",
            FileKind::Executable => "executable",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text" => Some(FileKind::Text),
            "image" => Some(FileKind::Image),
            "video" => Some(FileKind::Video),
            "secret" => Some(FileKind::Secret),
            "executable" => Some(FileKind::Executable),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct File {
    pub id: i64,
    pub name: String,
    pub kind: FileKind,
    pub size: i64,
    pub storage_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_policy() {
        assert_eq!(FileKind::Secret.mode(), 0o600);
        assert_eq!(FileKind::Executable.mode(), 0o766);
        assert_eq!(FileKind::Text.mode(), 0o644);
        assert_eq!(FileKind::Image.mode(), 0o644);
    }
}
