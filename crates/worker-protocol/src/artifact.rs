//! Result artifact and preview payload types.

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Ownership flag attached to a detected item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnershipStatus {
    Owned,
    NotOwned,
}

/// A single recognised item in a frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameItem {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owned: Option<OwnershipStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equipped: Option<bool>,
}

impl FrameItem {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owned: None,
            equipped: None,
        }
    }

    pub fn with_owned(mut self, owned: OwnershipStatus) -> Self {
        self.owned = Some(owned);
        self
    }

    pub fn with_equipped(mut self, equipped: bool) -> Self {
        self.equipped = Some(equipped);
        self
    }

    /// An item counts as owned only when the flag is present and says so.
    ///
    /// A missing flag means the worker could not tell, which is never treated as
    /// ownership.
    pub fn is_owned(&self) -> bool {
        self.owned == Some(OwnershipStatus::Owned)
    }
}

/// All items recognised in one frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameItems {
    /// 1-based index of the frame within the decimated frame set.
    pub frame_index: u64,
    #[serde(default)]
    pub items: Vec<FrameItem>,
}

/// Live snapshot emitted with `PREVIEW:` lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FramePreview {
    pub frame_index: u64,
    #[serde(default)]
    pub items: Vec<FrameItem>,
    /// Seconds since the worker started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,
    /// Position of the frame in the source video, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_time: Option<f64>,
}

/// Decode the JSON array a worker writes at its output path.
pub fn parse_result_artifact(json: &str) -> Result<Vec<FrameItems>, ProtocolError> {
    serde_json::from_str(json).map_err(ProtocolError::InvalidArtifact)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ownership_requires_explicit_flag() {
        assert!(FrameItem::new("a").with_owned(OwnershipStatus::Owned).is_owned());
        assert!(!FrameItem::new("b").with_owned(OwnershipStatus::NotOwned).is_owned());
        assert!(!FrameItem::new("c").is_owned());
        assert!(!FrameItem::new("d").with_equipped(true).is_owned());
    }

    #[test]
    fn parses_worker_artifact() {
        let json = r#"[
            {"frameIndex": 3, "items": [
                {"name": "Neon Rider", "owned": "owned", "equipped": false},
                {"name": "Fade"}
            ]},
            {"frameIndex": 9, "items": [{"name": "Asiimov", "owned": "not_owned"}]}
        ]"#;

        let frames = parse_result_artifact(json).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].frame_index, 3);
        assert_eq!(frames[0].items[1], FrameItem::new("Fade"));
        assert_eq!(frames[1].items[0].owned, Some(OwnershipStatus::NotOwned));
    }

    #[test]
    fn empty_artifact_is_valid() {
        assert!(parse_result_artifact("[]").unwrap().is_empty());
    }

    #[test]
    fn rejects_non_array_artifact() {
        assert!(matches!(
            parse_result_artifact(r#"{"frames": []}"#),
            Err(ProtocolError::InvalidArtifact(_))
        ));
    }

    #[test]
    fn absent_flags_are_not_serialized() {
        let json = serde_json::to_string(&FrameItem::new("Howl")).unwrap();
        assert_eq!(json, r#"{"name":"Howl"}"#);
    }
}
