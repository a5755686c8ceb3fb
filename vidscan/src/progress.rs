//! Weighted stage progress.
//!
//! Job-level progress runs from 0 to 100 and is split into three consecutive
//! bands, one per pipeline stage. Stage-local completion is mapped into the
//! active band and the result only ever moves forward.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, IntoEnumIterator};
use worker_protocol::DetectionStage;

use crate::{Error, Result};

/// Pipeline stages in the order they occupy the progress scale.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Extraction,
    Detection,
    Recognition,
}

impl Stage {
    /// Human-readable descriptor stored as the job's current stage.
    pub fn label(self) -> &'static str {
        match self {
            Stage::Extraction => "splitting frames",
            Stage::Detection => "working with ai",
            Stage::Recognition => "getting ocr results",
        }
    }
}

impl From<DetectionStage> for Stage {
    fn from(stage: DetectionStage) -> Self {
        match stage {
            DetectionStage::Ai => Stage::Detection,
            DetectionStage::Ocr => Stage::Recognition,
        }
    }
}

/// Share of the 0..=100 scale given to each stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageWeights {
    pub extraction: f64,
    pub detection: f64,
    pub recognition: f64,
}

impl Default for StageWeights {
    fn default() -> Self {
        Self {
            extraction: 20.0,
            detection: 30.0,
            recognition: 50.0,
        }
    }
}

impl StageWeights {
    pub fn weight(&self, stage: Stage) -> f64 {
        match stage {
            Stage::Extraction => self.extraction,
            Stage::Detection => self.detection,
            Stage::Recognition => self.recognition,
        }
    }

    /// Start of `stage`'s band: the summed weight of every earlier stage.
    pub fn offset(&self, stage: Stage) -> f64 {
        Stage::iter()
            .take_while(|s| *s < stage)
            .map(|s| self.weight(s))
            .sum()
    }

    pub fn validate(&self) -> Result<()> {
        let all = [self.extraction, self.detection, self.recognition];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(Error::config(format!(
                "stage weights must be non-negative, got {self:?}"
            )));
        }
        let total: f64 = all.iter().sum();
        if (total - 100.0).abs() > 1e-6 {
            return Err(Error::config(format!(
                "stage weights must sum to 100, got {total}"
            )));
        }
        Ok(())
    }
}

impl FromStr for StageWeights {
    type Err = Error;

    /// Parses `"extraction,detection,recognition"`, e.g. `"20,30,50"`.
    fn from_str(s: &str) -> Result<Self> {
        let parts = s
            .split(',')
            .map(|p| {
                p.trim()
                    .parse::<f64>()
                    .map_err(|e| Error::config(format!("invalid stage weight {p:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let [extraction, detection, recognition] = parts[..] else {
            return Err(Error::config(format!(
                "expected three comma-separated stage weights, got {s:?}"
            )));
        };

        let weights = Self {
            extraction,
            detection,
            recognition,
        };
        weights.validate()?;
        Ok(weights)
    }
}

/// Progress ratchet for one job run.
#[derive(Debug, Clone)]
pub struct StageProgress {
    weights: StageWeights,
    active: Stage,
    value: f64,
}

impl StageProgress {
    pub fn new(weights: StageWeights) -> Self {
        Self {
            weights,
            active: Stage::Extraction,
            value: 0.0,
        }
    }

    pub fn active_stage(&self) -> Stage {
        self.active
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    /// Make `stage` the active band.
    ///
    /// Entering a later stage lifts progress to the start of its band. An
    /// earlier stage is ignored and `false` is returned.
    pub fn enter(&mut self, stage: Stage) -> bool {
        if stage < self.active {
            return false;
        }
        if stage > self.active {
            self.active = stage;
            self.raise(self.weights.offset(stage));
        }
        true
    }

    /// Record stage-local completion `fraction` (0..=1) and return the job-level value.
    ///
    /// Events for a stage earlier than the active one leave progress untouched.
    pub fn report(&mut self, stage: Stage, fraction: f64) -> f64 {
        if !self.enter(stage) {
            return self.value;
        }

        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let offset = self.weights.offset(stage);
        let weight = self.weights.weight(stage);
        let computed = (offset + fraction * weight).clamp(offset, offset + weight);
        self.raise(computed);
        self.value
    }

    /// Like [`report`](Self::report) with completion given as `done` of `total` units.
    pub fn report_units(&mut self, stage: Stage, done: u64, total: u64) -> f64 {
        let fraction = if total == 0 {
            0.0
        } else {
            done.min(total) as f64 / total as f64
        };
        self.report(stage, fraction)
    }

    fn raise(&mut self, candidate: f64) {
        self.value = round2(self.value.max(candidate)).min(100.0);
    }
}

/// Round to two decimals.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
