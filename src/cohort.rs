//! Deterministic cohort assignment.
//!
//! A record's cohort is a pure function of its partition key and the seed:
//! the key is hashed to a value in `[0, 1)` and the value is split into one of
//! [`CohortLabel::A`], [`CohortLabel::Neutral`] or [`CohortLabel::B`]. Records
//! without a partition key, or before the cutoff year, are never assigned.
//!
//! Hash and split functions are pluggable only through [`CohortStrategies`],
//! a registry of named functions, plus a restricted threshold form for splits.

use std::collections::BTreeMap;
use std::fmt;

use chrono::Datelike;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::dataset::DatasetRecord;
use crate::error::FlowError;

pub const DEFAULT_HASH: &str = "sha256";
pub const DEFAULT_SPLIT: &str = "thirds";

const A_UPPER: f64 = 0.33;
const NEUTRAL_UPPER: f64 = 0.66;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CohortLabel {
    A,
    Neutral,
    B,
}

impl fmt::Display for CohortLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CohortLabel::A => "A",
            CohortLabel::Neutral => "Neutral",
            CohortLabel::B => "B",
        };
        f.write_str(label)
    }
}

pub type HashFn = fn(&str, u64) -> f64;
pub type SplitFn = fn(f64, u64) -> CohortLabel;

/// SHA-256 of `"{seed}_{key}"`, read as a big-endian integer, reduced mod 1000
/// and scaled to `[0, 1)` in steps of 0.001.
pub fn sha256_millesimal(key: &str, seed: u64) -> f64 {
    let digest = Sha256::digest(format!("{seed}_{key}").as_bytes());
    let remainder = digest
        .iter()
        .fold(0u32, |acc, byte| (acc * 256 + u32::from(*byte)) % 1000);
    f64::from(remainder) / 1000.0
}

/// Same digest as [`sha256_millesimal`] but keeps 53 bits of the leading bytes.
pub fn sha256_fine(key: &str, seed: u64) -> f64 {
    let digest = Sha256::digest(format!("{seed}_{key}").as_bytes());
    let mut leading = [0u8; 8];
    leading.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(leading) >> 11) as f64 / (1u64 << 53) as f64
}

pub fn split_thirds(h: f64, _seed: u64) -> CohortLabel {
    if h < A_UPPER {
        CohortLabel::A
    } else if h < NEUTRAL_UPPER {
        CohortLabel::Neutral
    } else {
        CohortLabel::B
    }
}

pub fn split_halves(h: f64, _seed: u64) -> CohortLabel {
    if h < 0.5 { CohortLabel::A } else { CohortLabel::B }
}

/// Registry of the hash and split functions a run may select by name.
#[derive(Clone)]
pub struct CohortStrategies {
    hashes: BTreeMap<String, HashFn>,
    splits: BTreeMap<String, SplitFn>,
}

impl Default for CohortStrategies {
    fn default() -> Self {
        let mut strategies = Self::empty();
        strategies.register_hash(DEFAULT_HASH, sha256_millesimal);
        strategies.register_hash("sha256-fine", sha256_fine);
        strategies.register_split(DEFAULT_SPLIT, split_thirds);
        strategies.register_split("halves", split_halves);
        strategies
    }
}

impl CohortStrategies {
    pub fn empty() -> Self {
        Self {
            hashes: BTreeMap::new(),
            splits: BTreeMap::new(),
        }
    }

    pub fn register_hash(&mut self, name: impl Into<String>, hash: HashFn) {
        self.hashes.insert(name.into(), hash);
    }

    pub fn register_split(&mut self, name: impl Into<String>, split: SplitFn) {
        self.splits.insert(name.into(), split);
    }

    pub fn known_hashes(&self) -> Vec<&str> {
        self.hashes.keys().map(String::as_str).collect()
    }

    pub fn known_splits(&self) -> Vec<&str> {
        self.splits.keys().map(String::as_str).collect()
    }

    fn hash(&self, name: &str) -> Result<HashFn, FlowError> {
        self.hashes.get(name).copied().ok_or_else(|| {
            FlowError::Validation(format!(
                "Unknown hash strategy '{}'. Available: {}",
                name,
                self.known_hashes().join(", ")
            ))
        })
    }

    fn split(&self, name: &str) -> Result<SplitFn, FlowError> {
        self.splits.get(name).copied().ok_or_else(|| {
            FlowError::Validation(format!(
                "Unknown split strategy '{}'. Available: {}",
                name,
                self.known_splits().join(", ")
            ))
        })
    }
}

/// Serialized form of a split selection inside run parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SplitSpec {
    Named(String),
    Thresholds { a_below: f64, b_from: f64 },
}

#[derive(Clone)]
enum Splitter {
    Named(String, SplitFn),
    Thresholds { a_below: f64, b_from: f64 },
}

#[derive(Clone)]
pub struct CohortPolicy {
    hash_name: String,
    hash: HashFn,
    splitter: Splitter,
}

impl fmt::Debug for CohortPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CohortPolicy")
            .field("description", &self.describe())
            .finish()
    }
}

impl Default for CohortPolicy {
    fn default() -> Self {
        Self {
            hash_name: DEFAULT_HASH.to_string(),
            hash: sha256_millesimal,
            splitter: Splitter::Named(DEFAULT_SPLIT.to_string(), split_thirds),
        }
    }
}

impl CohortPolicy {
    /// Builds a policy from the raw `hash_strategy` / `split_strategy` run
    /// parameters. Absent or null values select the defaults.
    pub fn from_params(
        strategies: &CohortStrategies,
        hash: Option<&Value>,
        split: Option<&Value>,
    ) -> Result<Self, FlowError> {
        let mut policy = Self::default();

        match hash {
            None | Some(Value::Null) => {}
            Some(Value::String(name)) => {
                policy.hash = strategies.hash(name)?;
                policy.hash_name = name.clone();
            }
            Some(other) => {
                return Err(FlowError::Validation(format!(
                    "hash_strategy must be a strategy name, got {other}"
                )));
            }
        }

        match split {
            None | Some(Value::Null) => {}
            Some(value) => {
                let spec: SplitSpec = serde_json::from_value(value.clone()).map_err(|err| {
                    FlowError::Validation(format!(
                        "split_strategy must be a strategy name or {{\"a_below\", \"b_from\"}}: {err}"
                    ))
                })?;
                policy.splitter = match spec {
                    SplitSpec::Named(name) => {
                        let split = strategies.split(&name)?;
                        Splitter::Named(name, split)
                    }
                    SplitSpec::Thresholds { a_below, b_from } => {
                        if !(0.0..=1.0).contains(&a_below)
                            || !(0.0..=1.0).contains(&b_from)
                            || a_below > b_from
                        {
                            return Err(FlowError::Validation(format!(
                                "split thresholds must satisfy 0 <= a_below <= b_from <= 1, got {a_below} and {b_from}"
                            )));
                        }
                        Splitter::Thresholds { a_below, b_from }
                    }
                };
            }
        }

        Ok(policy)
    }

    pub fn hash(&self, key: &str, seed: u64) -> f64 {
        (self.hash)(key, seed)
    }

    pub fn split(&self, h: f64, seed: u64) -> CohortLabel {
        match &self.splitter {
            Splitter::Named(_, split) => split(h, seed),
            Splitter::Thresholds { a_below, b_from } => {
                if h < *a_below {
                    CohortLabel::A
                } else if h < *b_from {
                    CohortLabel::Neutral
                } else {
                    CohortLabel::B
                }
            }
        }
    }

    pub fn describe(&self) -> Value {
        let split = match &self.splitter {
            Splitter::Named(name, _) => json!(name),
            Splitter::Thresholds { a_below, b_from } => {
                json!({ "a_below": a_below, "b_from": b_from })
            }
        };
        json!({ "hash": self.hash_name, "split": split })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Assignment {
    pub record_id: usize,
    pub hash: f64,
    pub cohort: CohortLabel,
}

/// Projection of a record set onto cohorts. Borrowed records are untouched.
#[derive(Debug, Default)]
pub struct CohortAssignment<'a> {
    pub a: Vec<&'a DatasetRecord>,
    pub neutral: Vec<&'a DatasetRecord>,
    pub b: Vec<&'a DatasetRecord>,
    pub mapping: Vec<Assignment>,
    pub filtered_out: usize,
}

impl<'a> CohortAssignment<'a> {
    pub fn cohort(&self, label: CohortLabel) -> &[&'a DatasetRecord] {
        match label {
            CohortLabel::A => &self.a,
            CohortLabel::Neutral => &self.neutral,
            CohortLabel::B => &self.b,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CohortAssigner {
    policy: CohortPolicy,
    seed: u64,
    cutoff_year: i32,
}

impl CohortAssigner {
    pub fn new(policy: CohortPolicy, seed: u64, cutoff_year: i32) -> Self {
        Self {
            policy,
            seed,
            cutoff_year,
        }
    }

    pub fn policy(&self) -> &CohortPolicy {
        &self.policy
    }

    pub fn assign<'a>(&self, records: &'a [DatasetRecord]) -> CohortAssignment<'a> {
        let mut assignment = CohortAssignment::default();
        for record in records {
            let Some(date) = record.partition_key else {
                assignment.filtered_out += 1;
                continue;
            };
            if date.year() < self.cutoff_year {
                assignment.filtered_out += 1;
                continue;
            }
            let hash = self.policy.hash(&record.partition_repr(), self.seed);
            let cohort = self.policy.split(hash, self.seed);
            assignment.mapping.push(Assignment {
                record_id: record.record_id,
                hash,
                cohort,
            });
            match cohort {
                CohortLabel::A => assignment.a.push(record),
                CohortLabel::Neutral => assignment.neutral.push(record),
                CohortLabel::B => assignment.b.push(record),
            }
        }
        tracing::debug!(
            seed = self.seed,
            cutoff_year = self.cutoff_year,
            a = assignment.a.len(),
            neutral = assignment.neutral.len(),
            b = assignment.b.len(),
            filtered_out = assignment.filtered_out,
            "Cohorts assigned"
        );
        assignment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millesimal_hash_matches_reference_reduction() {
        // hex digest read as one big number, reduced mod 1000
        let digest = Sha256::digest(b"42_2021-01-01 00:00:00");
        let hex = format!("{digest:x}");
        let remainder = hex.chars().fold(0u64, |acc, c| {
            (acc * 16 + u64::from(c.to_digit(16).unwrap())) % 1000
        });
        assert_eq!(
            sha256_millesimal("2021-01-01 00:00:00", 42),
            remainder as f64 / 1000.0
        );
    }

    #[test]
    fn thirds_split_boundaries() {
        assert_eq!(split_thirds(0.0, 0), CohortLabel::A);
        assert_eq!(split_thirds(0.329, 0), CohortLabel::A);
        assert_eq!(split_thirds(0.33, 0), CohortLabel::Neutral);
        assert_eq!(split_thirds(0.659, 0), CohortLabel::Neutral);
        assert_eq!(split_thirds(0.66, 0), CohortLabel::B);
        assert_eq!(split_thirds(0.999, 0), CohortLabel::B);
    }

    #[test]
    fn unknown_strategy_is_a_validation_error() {
        let err = CohortPolicy::from_params(
            &CohortStrategies::default(),
            Some(&json!("md5")),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, FlowError::Validation(_)));
    }

    #[test]
    fn threshold_form_is_checked() {
        let strategies = CohortStrategies::default();
        let bad = json!({ "a_below": 0.8, "b_from": 0.2 });
        assert!(CohortPolicy::from_params(&strategies, None, Some(&bad)).is_err());

        let good = json!({ "a_below": 0.5, "b_from": 0.5 });
        let policy = CohortPolicy::from_params(&strategies, None, Some(&good)).unwrap();
        assert_eq!(policy.split(0.49, 0), CohortLabel::A);
        assert_eq!(policy.split(0.5, 0), CohortLabel::B);
    }
}
