use anyhow::{bail, Context, Result};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const BOROUGH: &str = "BOROUGH";
pub const NEIGHBORHOOD: &str = "NEIGHBORHOOD";
pub const BUILDING_CLASS_CATEGORY: &str = "BUILDING CLASS CATEGORY";
pub const COMMERCIAL_UNITS: &str = "COMMERCIAL UNITS";
pub const TOTAL_UNITS: &str = "TOTAL UNITS";
pub const LAND_SQUARE_FEET: &str = "LAND SQUARE FEET";
pub const GROSS_SQUARE_FEET: &str = "GROSS SQUARE FEET";
pub const YEAR_BUILT: &str = "YEAR BUILT";
pub const BUILDING_CLASS_AT_SALE: &str = "BUILDING CLASS AT TIME OF SALE";
pub const SALE_PRICE: &str = "SALE PRICE";

/// One property sale to be priced. Field names are accepted with spaces or underscores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HousingRecord {
    #[serde(rename = "BOROUGH", deserialize_with = "flexible_int")]
    pub borough: i64,
    #[serde(rename = "NEIGHBORHOOD")]
    pub neighborhood: String,
    #[serde(rename = "BUILDING CLASS CATEGORY", alias = "BUILDING_CLASS_CATEGORY")]
    pub building_class_category: String,
    #[serde(
        rename = "COMMERCIAL UNITS",
        alias = "COMMERCIAL_UNITS",
        deserialize_with = "flexible_int"
    )]
    pub commercial_units: i64,
    #[serde(rename = "TOTAL UNITS", alias = "TOTAL_UNITS", deserialize_with = "flexible_int")]
    pub total_units: i64,
    #[serde(
        rename = "LAND SQUARE FEET",
        alias = "LAND_SQUARE_FEET",
        deserialize_with = "flexible_int"
    )]
    pub land_square_feet: i64,
    #[serde(
        rename = "GROSS SQUARE FEET",
        alias = "GROSS_SQUARE_FEET",
        deserialize_with = "flexible_int"
    )]
    pub gross_square_feet: i64,
    #[serde(rename = "YEAR BUILT", alias = "YEAR_BUILT", deserialize_with = "flexible_int")]
    pub year_built: i64,
    #[serde(
        rename = "BUILDING CLASS AT TIME OF SALE",
        alias = "BUILDING_CLASS_AT_TIME_OF_SALE"
    )]
    pub building_class_at_sale: String,
}

impl HousingRecord {
    pub fn numeric_fields(&self) -> [(&'static str, i64); 6] {
        [
            (BOROUGH, self.borough),
            (COMMERCIAL_UNITS, self.commercial_units),
            (TOTAL_UNITS, self.total_units),
            (LAND_SQUARE_FEET, self.land_square_feet),
            (GROSS_SQUARE_FEET, self.gross_square_feet),
            (YEAR_BUILT, self.year_built),
        ]
    }

    pub fn categorical_fields(&self) -> [(&'static str, &str); 3] {
        [
            (NEIGHBORHOOD, self.neighborhood.as_str()),
            (BUILDING_CLASS_CATEGORY, self.building_class_category.as_str()),
            (BUILDING_CLASS_AT_SALE, self.building_class_at_sale.as_str()),
        ]
    }
}

/// Canonical spelling of a field name: underscores read as spaces, upper case.
pub fn canonical_field(name: &str) -> String {
    name.trim().replace('_', " ").to_uppercase()
}

/// Parse a `/score` body: one record or an array of records.
pub fn parse_payload(body: &[u8]) -> Result<Vec<HousingRecord>> {
    let value: Value = serde_json::from_slice(body).context("request body is not valid JSON")?;
    match value {
        Value::Array(items) => {
            if items.is_empty() {
                bail!("no records to score");
            }
            items
                .into_iter()
                .enumerate()
                .map(|(i, item)| {
                    serde_json::from_value(item).with_context(|| format!("record {i} is invalid"))
                })
                .collect()
        }
        Value::Object(_) => Ok(vec![
            serde_json::from_value(value).context("record is invalid")?
        ]),
        _ => bail!("expected a record object or an array of records"),
    }
}

/// Integers arrive as numbers, numeric strings, or `-` for "none".
fn flexible_int<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .ok_or_else(|| de::Error::custom(format!("expected an integer, got {n}"))),
        Value::String(s) => {
            let s = s.trim();
            if s == "-" {
                return Ok(0);
            }
            s.parse::<i64>()
                .map_err(|_| de::Error::custom(format!("expected an integer, got \"{s}\"")))
        }
        other => Err(de::Error::custom(format!("expected an integer, got {other}"))),
    }
}
