use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One timed sub-unit of a presentation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub subtitle: String,
    /// Empty, or a URL whose surface form decides which media backend is mounted.
    #[serde(default)]
    pub media_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_link: Option<String>,
}

impl Segment {
    /// The related link, if the authoring side filled one in.
    pub fn related_link(&self) -> Option<&str> {
        self.related_link
            .as_deref()
            .map(str::trim)
            .filter(|link| !link.is_empty())
    }
}

/// A presentation plan as exported by the planner. Immutable for the duration of a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub total_duration_minutes: f64,
    #[serde(default)]
    pub segments: Vec<Segment>,
}

impl Plan {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("plan is not valid JSON")
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan from {}", path.display()))?;
        Self::from_json_str(&contents)
            .with_context(|| format!("Failed to parse plan {}", path.display()))
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Session budget in seconds; non-finite or negative budgets count as zero.
    pub fn total_duration_secs(&self) -> f64 {
        let minutes = self.total_duration_minutes;
        if minutes.is_finite() && minutes > 0.0 {
            minutes * 60.0
        } else {
            0.0
        }
    }

    /// Every segment gets an equal share of the budget.
    pub fn segment_duration_secs(&self) -> f64 {
        if self.segments.is_empty() {
            0.0
        } else {
            self.total_duration_secs() / self.segments.len() as f64
        }
    }
}
