use super::record::{canonical_field, HousingRecord};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Turns records into sale price predictions, one per record in input order.
pub trait Scorer: Send + Sync {
    fn score(&self, records: &[HousingRecord]) -> Result<Vec<f64>>;
}

/// Linear sale price model exported as JSON. Unknown categorical levels add nothing.
///
/// ```json
/// {
///   "intercept": 125000.0,
///   "numeric": {"GROSS SQUARE FEET": 310.5, "YEAR BUILT": 42.0},
///   "categorical": {"NEIGHBORHOOD": {"ALPHABET CITY": 90000.0}}
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LinearModel {
    pub intercept: f64,
    #[serde(default)]
    pub numeric: BTreeMap<String, f64>,
    #[serde(default)]
    pub categorical: BTreeMap<String, BTreeMap<String, f64>>,
}

impl LinearModel {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read model from {}", path.display()))?;
        let model: LinearModel = serde_json::from_str(&raw)
            .with_context(|| format!("parse model in {}", path.display()))?;
        model
            .normalized()
            .with_context(|| format!("invalid model in {}", path.display()))
    }

    /// Canonicalize field names and reject fields no record carries.
    fn normalized(self) -> Result<Self> {
        let sample = HousingRecord {
            borough: 0,
            neighborhood: String::new(),
            building_class_category: String::new(),
            commercial_units: 0,
            total_units: 0,
            land_square_feet: 0,
            gross_square_feet: 0,
            year_built: 0,
            building_class_at_sale: String::new(),
        };
        let numeric_names: Vec<_> = sample.numeric_fields().iter().map(|(n, _)| *n).collect();
        let categorical_names: Vec<_> =
            sample.categorical_fields().iter().map(|(n, _)| *n).collect();

        let mut numeric = BTreeMap::new();
        for (name, weight) in self.numeric {
            let field = canonical_field(&name);
            if !numeric_names.contains(&field.as_str()) {
                bail!("'{name}' is not a numeric field");
            }
            numeric.insert(field, weight);
        }
        let mut categorical = BTreeMap::new();
        for (name, levels) in self.categorical {
            let field = canonical_field(&name);
            if !categorical_names.contains(&field.as_str()) {
                bail!("'{name}' is not a categorical field");
            }
            categorical.insert(field, levels);
        }
        Ok(Self {
            intercept: self.intercept,
            numeric,
            categorical,
        })
    }

    fn score_one(&self, record: &HousingRecord) -> f64 {
        let numeric: f64 = record
            .numeric_fields()
            .iter()
            .filter_map(|(name, v)| self.numeric.get(*name).map(|w| w * *v as f64))
            .sum();
        let categorical: f64 = record
            .categorical_fields()
            .iter()
            .filter_map(|(name, level)| self.categorical.get(*name)?.get(level.trim()))
            .sum();
        self.intercept + numeric + categorical
    }
}

impl Scorer for LinearModel {
    fn score(&self, records: &[HousingRecord]) -> Result<Vec<f64>> {
        records
            .iter()
            .enumerate()
            .map(|(i, r)| {
                let s = self.score_one(r);
                if !s.is_finite() {
                    bail!("record {i} scored to a non-finite value");
                }
                Ok(s)
            })
            .collect()
    }
}
