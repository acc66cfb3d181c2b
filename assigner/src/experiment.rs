//! Experiment definitions: validated test names and weighted variant maps.
//!
//! Both types validate on construction and on deserialization, so an
//! `Experiment` built from configuration can always be bucketed.

use crate::bucketing;
use crate::errors::AssignError;
use crate::record::{AssignmentRecord, canonical_def};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of one experiment, restricted to `[a-z0-9_-]+`.
///
/// Also used as the hashing namespace, so one visitor gets independent
/// assignments across experiments.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TestName(String);

impl TestName {
    pub fn new(name: impl Into<String>) -> Result<Self, AssignError> {
        let name = name.into();
        let valid = !name.is_empty()
            && name
                .bytes()
                .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-'));

        if !valid {
            return Err(AssignError::InvalidArgument(format!(
                "invalid test name {name:?}, use only a-z, 0-9, _ and -"
            )));
        }
        Ok(TestName(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TestName {
    type Error = AssignError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        TestName::new(value)
    }
}

impl From<TestName> for String {
    fn from(name: TestName) -> Self {
        name.0
    }
}

impl Borrow<str> for TestName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TestName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Weighted variant map, kept in lexicographic order of variant names.
///
/// The order is part of the bucketing contract: variant `i` owns the
/// contiguous integer range `(upper_bounds[i - 1], upper_bounds[i]]` of the
/// `[1, total]` partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, u64>", into = "BTreeMap<String, u64>")]
pub struct Variants {
    entries: Vec<(String, u64)>,
    upper_bounds: Vec<u64>,
    def: String,
}

impl Variants {
    pub fn new(weights: BTreeMap<String, u64>) -> Result<Self, AssignError> {
        if weights.is_empty() {
            return Err(AssignError::InvalidConfiguration(
                "variant map is empty".to_string(),
            ));
        }

        let mut upper_bounds = Vec::with_capacity(weights.len());
        let mut total: u64 = 0;
        for (name, &weight) in &weights {
            if weight == 0 {
                return Err(AssignError::InvalidConfiguration(format!(
                    "variant {name:?} has weight 0, weights must be positive"
                )));
            }
            total = total.checked_add(weight).ok_or_else(|| {
                AssignError::InvalidConfiguration("sum of variant weights overflows".to_string())
            })?;
            upper_bounds.push(total);
        }

        let def = canonical_def(&weights)?;

        Ok(Variants {
            entries: weights.into_iter().collect(),
            upper_bounds,
            def,
        })
    }

    /// Builds a variant map from `(name, weight)` pairs. Names must be unique.
    pub fn from_pairs<I, K>(pairs: I) -> Result<Self, AssignError>
    where
        I: IntoIterator<Item = (K, u64)>,
        K: Into<String>,
    {
        let mut weights = BTreeMap::new();
        for (name, weight) in pairs {
            let name = name.into();
            if weights.contains_key(&name) {
                return Err(AssignError::InvalidConfiguration(format!(
                    "duplicate variant {name:?}"
                )));
            }
            weights.insert(name, weight);
        }
        Variants::new(weights)
    }

    /// Sum of all weights, never zero.
    pub fn total(&self) -> u64 {
        self.upper_bounds.last().copied().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Canonical compact JSON of the map, as stored in assignment records.
    pub fn def(&self) -> &str {
        &self.def
    }

    /// Returns the first variant in name order whose cumulative weight is
    /// at least `mapped`, for `mapped` in `[1, total]`.
    pub fn select(&self, mapped: u64) -> &str {
        let index = self.upper_bounds.partition_point(|&bound| bound < mapped);
        // mapped <= total, the last bound
        let index = index.min(self.entries.len() - 1);
        &self.entries[index].0
    }
}

impl TryFrom<BTreeMap<String, u64>> for Variants {
    type Error = AssignError;

    fn try_from(weights: BTreeMap<String, u64>) -> Result<Self, Self::Error> {
        Variants::new(weights)
    }
}

impl From<Variants> for BTreeMap<String, u64> {
    fn from(variants: Variants) -> Self {
        variants.entries.into_iter().collect()
    }
}

/// A validated experiment, ready to bucket identities.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Experiment {
    name: TestName,
    variants: Variants,
}

impl Experiment {
    pub fn new(name: TestName, variants: Variants) -> Self {
        Experiment { name, variants }
    }

    pub fn name(&self) -> &TestName {
        &self.name
    }

    pub fn variants(&self) -> &Variants {
        &self.variants
    }

    pub fn assign(&self, identity_hash: &str) -> AssignmentRecord {
        let mapped =
            bucketing::mapped_value(identity_hash, self.name.as_str(), self.variants.total());
        let variant = self.variants.select(mapped);

        AssignmentRecord {
            name: self.name.to_string(),
            variant: variant.to_string(),
            def: self.variants.def.clone(),
        }
    }
}
