//! Log request body and its conversion into observations.

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use crate::key::WindowKey;
use crate::profile::FeatureValue;
use crate::ProfiledError;

/// A decoded `POST /logs` body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRequest {
    #[serde(default)]
    pub dataset_id: Option<String>,
    #[serde(default)]
    pub tags: Option<RawTags>,
    #[serde(default)]
    pub single: Option<Map<String, Value>>,
    #[serde(default)]
    pub multiple: Option<Columnar>,
}

/// Columnar payload: one row per observation set.
#[derive(Debug, Deserialize)]
pub struct Columnar {
    pub columns: Vec<String>,
    pub data: Vec<Vec<Value>>,
}

/// Tag entries in the order they appear in the body, duplicates included.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RawTags(pub Vec<(String, Value)>);

impl<'de> Deserialize<'de> for RawTags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TagsVisitor;

        impl<'de> Visitor<'de> for TagsVisitor {
            type Value = RawTags;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of tag names to values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<RawTags, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((name, value)) = map.next_entry::<String, Value>()? {
                    entries.push((name, value));
                }
                Ok(RawTags(entries))
            }
        }

        deserializer.deserialize_map(TagsVisitor)
    }
}

impl LogRequest {
    /// Decodes a request body.
    pub fn from_slice(body: &[u8]) -> Result<Self, ProfiledError> {
        serde_json::from_slice(body).map_err(|source| ProfiledError::JsonDecode { source })
    }

    /// Builds the key this request accumulates into.
    ///
    /// Only string-valued tags are kept. Names get `tag_prefix` prepended and the
    /// first occurrence of a name wins.
    pub fn window_key(&self, org_id: &str, default_dataset_id: &str, tag_prefix: &str) -> WindowKey {
        let dataset_id = self.dataset_id.as_deref().unwrap_or(default_dataset_id);
        let mut builder = WindowKey::builder(org_id, dataset_id);
        if let Some(RawTags(tags)) = &self.tags {
            for (name, value) in tags {
                if let Value::String(value) = value {
                    builder = builder.tag(format!("{tag_prefix}{name}"), value.as_str());
                }
            }
        }
        builder.build()
    }

    /// Flattens the payload into `(feature, value)` pairs.
    ///
    /// Fails without side effects if neither or both payload shapes are present, a
    /// row does not match the column count, or a feature name is empty.
    pub fn into_observations(self) -> Result<Vec<(String, FeatureValue)>, ProfiledError> {
        let observations = match (self.single, self.multiple) {
            (None, None) => {
                return Err(ProfiledError::InvalidRequest(
                    "request must contain `single` or `multiple`".into(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(ProfiledError::InvalidRequest(
                    "request must not contain both `single` and `multiple`".into(),
                ))
            }
            (Some(single), None) => single
                .into_iter()
                .map(|(name, value)| (name, FeatureValue::from_json(value)))
                .collect::<Vec<_>>(),
            (None, Some(columnar)) => columnar.into_observations()?,
        };

        if observations.iter().any(|(name, _)| name.is_empty()) {
            return Err(ProfiledError::InvalidRequest(
                "feature names must not be empty".into(),
            ));
        }
        Ok(observations)
    }
}

impl Columnar {
    fn into_observations(self) -> Result<Vec<(String, FeatureValue)>, ProfiledError> {
        let Self { columns, data } = self;
        if let Some((index, row)) = data
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != columns.len())
        {
            return Err(ProfiledError::InvalidRequest(format!(
                "row {index} has {} values but there are {} columns",
                row.len(),
                columns.len()
            )));
        }

        let mut observations = Vec::with_capacity(columns.len() * data.len());
        for row in data {
            for (column, value) in columns.iter().zip(row) {
                observations.push((column.clone(), FeatureValue::from_json(value)));
            }
        }
        Ok(observations)
    }
}
