//! Mergeable per-feature statistical summaries.
//!
//! A [`Profile`] accumulates observations for one window. Each feature keeps simple
//! counts by value type, numeric extremes and sum, and a bounded set of distinct text
//! values. Values the summary cannot describe (arrays, objects, binary) are counted
//! under the [`UNSUPPORTED_SENTINEL`] marker instead of being stored.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

/// Marker recorded in place of values that cannot be summarised.
pub const UNSUPPORTED_SENTINEL: &str = "<unsupported>";

/// Maximum distinct text values tracked per feature before the set stops growing.
pub const MAX_DISTINCT_VALUES: usize = 1024;

/// Errors raised when recording an observation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProfileError {
    #[error("feature name must not be empty")]
    EmptyFeatureName,

    #[error("non-finite number for feature {feature}")]
    NonFiniteNumber { feature: String },
}

/// A single observed value, classified by type.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureValue {
    Bool(bool),
    Number(f64),
    Text(String),
    Null,
    /// Arrays, nested objects and raw binary.
    Unsupported,
}

impl FeatureValue {
    /// Classifies a JSON value.
    pub fn from_json(value: serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => n.as_f64().map_or(Self::Unsupported, Self::Number),
            Value::String(s) => Self::Text(s),
            Value::Array(_) | Value::Object(_) => Self::Unsupported,
        }
    }

    pub const fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported)
    }
}

/// Renders the value as recorded; unsupported values show as the sentinel.
impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
            Self::Null => f.write_str("null"),
            Self::Unsupported => f.write_str(UNSUPPORTED_SENTINEL),
        }
    }
}

/// Summary statistics for one feature.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureSummary {
    count: u64,
    null_count: u64,
    bool_count: u64,
    true_count: u64,
    number_count: u64,
    min: Option<f64>,
    max: Option<f64>,
    sum: f64,
    text_count: u64,
    unsupported_count: u64,
    distinct: BTreeSet<String>,
    distinct_overflow: bool,
}

impl FeatureSummary {
    fn record(&mut self, value: &FeatureValue) {
        self.count += 1;
        match value {
            FeatureValue::Null => self.null_count += 1,
            FeatureValue::Bool(b) => {
                self.bool_count += 1;
                if *b {
                    self.true_count += 1;
                }
            }
            FeatureValue::Number(n) => {
                self.number_count += 1;
                self.sum += n;
                self.min = Some(self.min.map_or(*n, |m| m.min(*n)));
                self.max = Some(self.max.map_or(*n, |m| m.max(*n)));
            }
            FeatureValue::Text(s) => {
                self.text_count += 1;
                self.insert_distinct(s);
            }
            FeatureValue::Unsupported => self.unsupported_count += 1,
        }
    }

    fn insert_distinct(&mut self, value: &str) {
        if self.distinct.contains(value) {
            return;
        }
        if self.distinct.len() >= MAX_DISTINCT_VALUES {
            self.distinct_overflow = true;
            return;
        }
        self.distinct.insert(value.to_owned());
    }

    fn merge(&mut self, other: &Self) {
        self.count += other.count;
        self.null_count += other.null_count;
        self.bool_count += other.bool_count;
        self.true_count += other.true_count;
        self.number_count += other.number_count;
        self.sum += other.sum;
        self.min = match (self.min, other.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.text_count += other.text_count;
        self.unsupported_count += other.unsupported_count;
        self.distinct_overflow |= other.distinct_overflow;
        for value in &other.distinct {
            self.insert_distinct(value);
        }
    }

    /// Number of observations recorded for this feature.
    pub const fn count(&self) -> u64 {
        self.count
    }

    fn snapshot(&self) -> FeatureSnapshot {
        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let mean = (self.number_count > 0).then(|| self.sum / self.number_count as f64);

        FeatureSnapshot {
            count: self.count,
            null_count: self.null_count,
            bool_count: self.bool_count,
            true_count: self.true_count,
            number_count: self.number_count,
            min: self.min,
            max: self.max,
            mean,
            text_count: self.text_count,
            unsupported_count: self.unsupported_count,
            distinct_count: self.distinct.len(),
            distinct_overflow: self.distinct_overflow,
        }
    }
}

/// The in-progress accumulator for one window of one key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Profile {
    features: BTreeMap<String, FeatureSummary>,
    observations: u64,
}

impl Profile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one observation of `feature`.
    pub fn record(&mut self, feature: &str, value: &FeatureValue) -> Result<(), ProfileError> {
        if feature.is_empty() {
            return Err(ProfileError::EmptyFeatureName);
        }
        if let FeatureValue::Number(n) = value {
            if !n.is_finite() {
                return Err(ProfileError::NonFiniteNumber {
                    feature: feature.to_owned(),
                });
            }
        }

        match self.features.get_mut(feature) {
            Some(summary) => summary.record(value),
            None => {
                let mut summary = FeatureSummary::default();
                summary.record(value);
                self.features.insert(feature.to_owned(), summary);
            }
        }
        self.observations += 1;
        Ok(())
    }

    /// Folds another profile into this one.
    pub fn merge(&mut self, other: &Self) {
        for (name, summary) in &other.features {
            self.features
                .entry(name.clone())
                .or_default()
                .merge(summary);
        }
        self.observations += other.observations;
    }

    pub fn is_empty(&self) -> bool {
        self.observations == 0
    }

    /// Total observations across all features.
    pub const fn observation_count(&self) -> u64 {
        self.observations
    }

    pub fn feature(&self, name: &str) -> Option<&FeatureSummary> {
        self.features.get(name)
    }

    /// Produces the immutable export of this profile.
    pub fn snapshot(&self) -> ProfileSnapshot {
        ProfileSnapshot {
            observations: self.observations,
            features: self
                .features
                .iter()
                .map(|(name, summary)| (name.clone(), summary.snapshot()))
                .collect(),
        }
    }
}

/// Exported statistics for one feature.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureSnapshot {
    pub count: u64,
    pub null_count: u64,
    pub bool_count: u64,
    pub true_count: u64,
    pub number_count: u64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    pub text_count: u64,
    pub unsupported_count: u64,
    pub distinct_count: usize,
    pub distinct_overflow: bool,
}

/// Immutable export of a finished profile, ready for upload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSnapshot {
    pub observations: u64,
    pub features: BTreeMap<String, FeatureSnapshot>,
}

impl ProfileSnapshot {
    pub fn feature(&self, name: &str) -> Option<&FeatureSnapshot> {
        self.features.get(name)
    }
}
