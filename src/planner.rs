//! Maps a processing mode to the billable operations it performs.
//!
//! The same plan is used to size a quota reservation, to log a success, and
//! to log a failure, so [`OperationPlan::for_mode`] must stay a pure function
//! of its inputs.

use serde::{Deserialize, Serialize};

use crate::types::{ProcessingMode, TargetSize};

/// A single billable operation performed by the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    BgRemoval,
    Resize,
    HeadCrop,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::BgRemoval => "bg_removal",
            OperationKind::Resize => "resize",
            OperationKind::HeadCrop => "head_crop",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered operations for one image, plus their count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationPlan {
    operations: Vec<OperationKind>,
}

impl OperationPlan {
    /// Build the plan for `mode`. `None` (missing or unrecognized mode) falls
    /// back to background removal only.
    pub fn for_mode(mode: Option<ProcessingMode>, target: Option<TargetSize>) -> Self {
        use OperationKind::*;

        let operations = match mode {
            Some(ProcessingMode::Ai) | None => vec![BgRemoval],
            Some(ProcessingMode::Resize) => vec![Resize],
            Some(ProcessingMode::Both) => vec![BgRemoval, Resize],
            Some(ProcessingMode::CropHead) if target.is_some() => vec![HeadCrop, Resize],
            Some(ProcessingMode::CropHead) => vec![HeadCrop],
            Some(ProcessingMode::CropHeadAi) => vec![HeadCrop, BgRemoval],
            Some(ProcessingMode::All) => vec![HeadCrop, Resize, BgRemoval],
        };

        Self { operations }
    }

    /// Same as [`for_mode`](Self::for_mode) but from the wire representation.
    pub fn for_mode_str(mode: &str, target: Option<TargetSize>) -> Self {
        Self::for_mode(mode.parse().ok(), target)
    }

    pub fn operations(&self) -> &[OperationKind] {
        &self.operations
    }

    /// Number of billable units; always equal to `operations().len()`.
    pub fn count(&self) -> u32 {
        self.operations.len() as u32
    }

    pub fn contains(&self, kind: OperationKind) -> bool {
        self.operations.contains(&kind)
    }
}
