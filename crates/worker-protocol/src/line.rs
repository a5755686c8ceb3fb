//! Decoding of individual worker output lines.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::ProtocolError;
use crate::artifact::FramePreview;

/// Detection sub-stage reported by the worker.
///
/// `Ai` is object detection over every frame, `Ocr` is text recognition over the
/// frames that detection kept.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DetectionStage {
    Ai,
    Ocr,
}

/// One decoded line of worker output.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerLine {
    /// Units processed so far in the active stage.
    Progress(u64),
    /// The worker moved to another stage.
    Stage(DetectionStage),
    /// Snapshot of the most recently processed frame.
    Preview(FramePreview),
    /// Free-form diagnostic text.
    Debug(String),
}

impl WorkerLine {
    /// Decode a single line.
    ///
    /// Returns `Ok(None)` for lines outside the protocol, which callers ignore.
    /// A recognised tag with a malformed payload is an error so it can be logged.
    pub fn parse(line: &str) -> Result<Option<Self>, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let Some((tag, payload)) = line.split_once(':') else {
            return Ok(None);
        };

        let parsed = match tag {
            "PROGRESS" => {
                let value = payload.trim();
                let units = value
                    .parse::<u64>()
                    .map_err(|_| ProtocolError::InvalidProgress(value.to_string()))?;
                WorkerLine::Progress(units)
            }
            "STAGE" => {
                let value = payload.trim();
                let stage = value
                    .parse::<DetectionStage>()
                    .map_err(|_| ProtocolError::UnknownStage(value.to_string()))?;
                WorkerLine::Stage(stage)
            }
            "PREVIEW" => {
                let preview =
                    serde_json::from_str(payload).map_err(ProtocolError::InvalidPreview)?;
                WorkerLine::Preview(preview)
            }
            "DEBUG" => WorkerLine::Debug(payload.trim().to_string()),
            _ => return Ok(None),
        };

        Ok(Some(parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::OwnershipStatus;
    use rstest::rstest;

    #[rstest]
    #[case("PROGRESS:12", WorkerLine::Progress(12))]
    #[case("PROGRESS: 7\r\n", WorkerLine::Progress(7))]
    #[case("STAGE:ai", WorkerLine::Stage(DetectionStage::Ai))]
    #[case("STAGE:ocr", WorkerLine::Stage(DetectionStage::Ocr))]
    #[case(
        "DEBUG: Detected class \"name\" with confidence 0.91",
        WorkerLine::Debug("Detected class \"name\" with confidence 0.91".to_string())
    )]
    fn parses_protocol_lines(#[case] input: &str, #[case] expected: WorkerLine) {
        assert_eq!(WorkerLine::parse(input).unwrap(), Some(expected));
    }

    #[rstest]
    #[case("")]
    #[case("Loading model weights...")]
    #[case("progress:3")]
    #[case("WARNING: something")]
    fn ignores_foreign_lines(#[case] input: &str) {
        assert_eq!(WorkerLine::parse(input).unwrap(), None);
    }

    #[test]
    fn malformed_payloads_are_errors() {
        assert!(matches!(
            WorkerLine::parse("PROGRESS:abc"),
            Err(ProtocolError::InvalidProgress(v)) if v == "abc"
        ));
        assert!(matches!(
            WorkerLine::parse("PROGRESS:-4"),
            Err(ProtocolError::InvalidProgress(_))
        ));
        assert!(matches!(
            WorkerLine::parse("STAGE:render"),
            Err(ProtocolError::UnknownStage(v)) if v == "render"
        ));
        assert!(matches!(
            WorkerLine::parse("PREVIEW:{not json"),
            Err(ProtocolError::InvalidPreview(_))
        ));
    }

    #[test]
    fn preview_payload_keeps_colons_in_json() {
        let line = r#"PREVIEW:{"frameIndex":5,"items":[{"name":"Dragon: Lore","owned":"owned","equipped":true}],"processingTime":1.5,"videoTime":0.57}"#;
        let Some(WorkerLine::Preview(preview)) = WorkerLine::parse(line).unwrap() else {
            panic!("expected preview");
        };

        assert_eq!(preview.frame_index, 5);
        assert_eq!(preview.items[0].name, "Dragon: Lore");
        assert_eq!(preview.items[0].owned, Some(OwnershipStatus::Owned));
        assert_eq!(preview.items[0].equipped, Some(true));
        assert_eq!(preview.processing_time, Some(1.5));
    }

    #[test]
    fn stage_display_matches_wire_form() {
        assert_eq!(DetectionStage::Ai.to_string(), "ai");
        assert_eq!(DetectionStage::Ocr.as_ref(), "ocr");
    }
}
