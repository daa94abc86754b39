use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use serde::{Deserialize, Serialize};

const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%b %d, %Y"];
const DATETIME_FORMATS: [&str; 3] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetSchema {
    pub partition_column: String,
    pub label_column: String,
    pub feature_columns: Vec<String>,
}

impl Default for DatasetSchema {
    fn default() -> Self {
        Self {
            partition_column: "release_date".to_string(),
            label_column: "estimated_owners".to_string(),
            feature_columns: [
                "price",
                "positive_reviews",
                "negative_reviews",
                "metacritic_score",
                "peak_ccu",
                "recommendations",
                "required_age",
                "on_linux",
                "on_mac",
                "on_windows",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

/// Raw column names of the Steam games export mapped to the schema names.
pub fn default_renames() -> BTreeMap<String, String> {
    [
        ("Release date", "release_date"),
        ("Estimated owners", "estimated_owners"),
        ("Price", "price"),
        ("Positive", "positive_reviews"),
        ("Negative", "negative_reviews"),
        ("Metacritic score", "metacritic_score"),
        ("Peak CCU", "peak_ccu"),
        ("Recommendations", "recommendations"),
        ("Required age", "required_age"),
        ("Windows", "on_windows"),
        ("Linux", "on_linux"),
        ("Mac", "on_mac"),
    ]
    .into_iter()
    .map(|(from, to)| (from.to_string(), to.to_string()))
    .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetRecord {
    pub record_id: usize,
    pub partition_key: Option<NaiveDate>,
    pub label: String,
    pub features: Vec<Option<f64>>,
}

impl DatasetRecord {
    pub fn year(&self) -> Option<i32> {
        self.partition_key.map(|date| date.year())
    }

    /// Timestamp rendering of the partition key used as hash input.
    pub fn partition_repr(&self) -> String {
        match self.partition_key {
            Some(date) => format!("{} 00:00:00", date.format("%Y-%m-%d")),
            None => "NaT".to_string(),
        }
    }

    /// Features with missing cells imputed as zero.
    pub fn feature_vector(&self) -> Vec<f64> {
        self.features.iter().map(|f| f.unwrap_or(0.0)).collect()
    }
}

#[derive(Debug, Clone)]
pub struct Dataset {
    schema: DatasetSchema,
    records: Vec<DatasetRecord>,
}

impl Dataset {
    pub fn new(schema: DatasetSchema, records: Vec<DatasetRecord>) -> Self {
        Self { schema, records }
    }

    pub fn load(path: &Path, schema: &DatasetSchema) -> Result<Self> {
        Self::load_with_renames(path, schema, &BTreeMap::new())
    }

    pub fn load_with_renames(
        path: &Path,
        schema: &DatasetSchema,
        renames: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open dataset: {}", path.display()))?;
        Self::from_reader(file, schema, renames)
            .with_context(|| format!("Failed to load dataset: {}", path.display()))
    }

    pub fn from_reader<R: Read>(
        reader: R,
        schema: &DatasetSchema,
        renames: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let mut reader = ReaderBuilder::new().flexible(true).from_reader(reader);
        let headers: Vec<String> = reader
            .headers()
            .context("Dataset has no header row")?
            .iter()
            .map(|name| {
                let name = name.trim();
                renames.get(name).cloned().unwrap_or_else(|| name.to_string())
            })
            .collect();

        let column = |name: &str| {
            headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| anyhow!("Dataset is missing required column '{name}'"))
        };
        let partition_idx = column(&schema.partition_column)?;
        let label_idx = column(&schema.label_column)?;
        let feature_idx = schema
            .feature_columns
            .iter()
            .map(|name| column(name))
            .collect::<Result<Vec<_>>>()?;

        let mut records = Vec::new();
        for (record_id, row) in reader.records().enumerate() {
            let row = row.with_context(|| format!("Malformed dataset row {}", record_id + 1))?;
            records.push(DatasetRecord {
                record_id,
                partition_key: cell(&row, partition_idx).and_then(parse_partition_date),
                label: cell(&row, label_idx).unwrap_or_default().to_string(),
                features: feature_idx
                    .iter()
                    .map(|idx| cell(&row, *idx).and_then(parse_feature))
                    .collect(),
            });
        }

        Ok(Self {
            schema: schema.clone(),
            records,
        })
    }

    pub fn schema(&self) -> &DatasetSchema {
        &self.schema
    }

    pub fn records(&self) -> &[DatasetRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn before_year(&self, cutoff_year: i32) -> Vec<&DatasetRecord> {
        self.records
            .iter()
            .filter(|r| r.year().is_some_and(|year| year < cutoff_year))
            .collect()
    }

    pub fn from_year(&self, cutoff_year: i32) -> Vec<&DatasetRecord> {
        self.records
            .iter()
            .filter(|r| r.year().is_some_and(|year| year >= cutoff_year))
            .collect()
    }

    pub fn feature_index(&self, column: &str) -> Option<usize> {
        self.schema.feature_columns.iter().position(|c| c == column)
    }

    /// Missing-cell count per schema column.
    pub fn missing_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        counts.insert(
            self.schema.partition_column.clone(),
            self.records.iter().filter(|r| r.partition_key.is_none()).count(),
        );
        counts.insert(
            self.schema.label_column.clone(),
            self.records.iter().filter(|r| r.label.is_empty()).count(),
        );
        for (idx, name) in self.schema.feature_columns.iter().enumerate() {
            counts.insert(
                name.clone(),
                self.records
                    .iter()
                    .filter(|r| r.features.get(idx).copied().flatten().is_none())
                    .count(),
            );
        }
        counts
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let mut writer = WriterBuilder::new()
            .from_path(path)
            .with_context(|| format!("Failed to create dataset file: {}", path.display()))?;

        let mut header = vec![
            self.schema.partition_column.clone(),
            self.schema.label_column.clone(),
        ];
        header.extend(self.schema.feature_columns.iter().cloned());
        writer.write_record(&header)?;

        for record in &self.records {
            let mut row = vec![
                record
                    .partition_key
                    .map(|d| d.format("%Y-%m-%d").to_string())
                    .unwrap_or_default(),
                record.label.clone(),
            ];
            row.extend(
                record
                    .features
                    .iter()
                    .map(|f| f.map(|v| v.to_string()).unwrap_or_default()),
            );
            writer.write_record(&row)?;
        }
        writer
            .flush()
            .with_context(|| format!("Failed to write dataset file: {}", path.display()))?;
        Ok(())
    }
}

fn cell(row: &StringRecord, idx: usize) -> Option<&str> {
    row.get(idx).map(str::trim).filter(|v| !v.is_empty())
}

pub fn parse_partition_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
                .map(|dt| dt.date())
        })
}

fn parse_feature(raw: &str) -> Option<f64> {
    match raw {
        "True" | "true" | "TRUE" => Some(1.0),
        "False" | "false" | "FALSE" => Some(0.0),
        other => other.parse::<f64>().ok().filter(|v| v.is_finite()),
    }
}
