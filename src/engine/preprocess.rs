/// Dataset preprocessing for training
///
/// Turns a parsed table into a dense feature matrix and label vector.
/// The encoding plan is deterministic for a given input (sorted
/// vocabularies, stored means and deviations) and travels with the model,
/// so prediction re-applies exactly the same transformation.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::files::analysis::{analyze, parse_table, sniff_type, Table};
use crate::files::DataFormat;
use crate::state::data::{DatasetAnalysis, ProblemType};

/// A numeric target with more distinct values than this is a regression target
pub const REGRESSION_MIN_DISTINCT: usize = 10;

/// String columns with at most this many categories are one-hot encoded
pub const MAX_ONE_HOT: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureEncoding {
    /// z-score with the training mean and deviation
    Numeric { mean: f64, std: f64 },
    /// One indicator per category; unknown values encode as all zeros
    OneHot { categories: Vec<String> },
    /// Position in the sorted vocabulary scaled to [0, 1]; unknown values encode as -1
    Ordinal { categories: Vec<String> },
}

impl FeatureEncoding {
    pub fn width(&self) -> usize {
        match self {
            Self::OneHot { categories } => categories.len(),
            _ => 1,
        }
    }

    fn encode_into(&self, cell: Option<&str>, out: &mut Vec<f64>) {
        match self {
            Self::Numeric { mean, std } => {
                let value = cell.and_then(|c| c.parse::<f64>().ok()).unwrap_or(*mean);
                out.push((value - mean) / std);
            }
            Self::OneHot { categories } => {
                let hit = cell.and_then(|c| categories.iter().position(|k| k == c));
                out.extend((0..categories.len()).map(|i| if Some(i) == hit { 1.0 } else { 0.0 }));
            }
            Self::Ordinal { categories } => {
                let scale = (categories.len().max(2) - 1) as f64;
                let value = cell
                    .and_then(|c| categories.iter().position(|k| k == c))
                    .map(|i| i as f64 / scale)
                    .unwrap_or(-1.0);
                out.push(value);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub encoding: FeatureEncoding,
}

/// Everything needed to turn a raw row into model inputs and back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodingPlan {
    pub target: String,
    pub problem_type: ProblemType,
    pub features: Vec<FeatureColumn>,
    /// Sorted class labels (classification only)
    pub classes: Vec<String>,
    /// Target standardization (regression only)
    pub target_mean: f64,
    pub target_std: f64,
}

impl EncodingPlan {
    /// Number of encoded input values per row
    pub fn width(&self) -> usize {
        self.features.iter().map(|f| f.encoding.width()).sum()
    }

    /// Encode one row; `cell` looks up a raw value by column name
    pub fn encode<'a>(&self, cell: impl Fn(&str) -> Option<&'a str>) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.width());
        for feature in &self.features {
            feature.encoding.encode_into(cell(&feature.name), &mut out);
        }
        out
    }

    pub fn encode_map(&self, row: &HashMap<String, String>) -> Vec<f64> {
        self.encode(|name| {
            row.get(name)
                .map(String::as_str)
                .filter(|v| !crate::files::analysis::is_null(v))
        })
    }

    /// Output dimension of the model
    pub fn outputs(&self) -> usize {
        match self.problem_type {
            ProblemType::Classification => self.classes.len(),
            ProblemType::Regression => 1,
        }
    }
}

/// A dataset ready for fitting
#[derive(Debug, Clone)]
pub struct PreparedDataset {
    pub analysis: DatasetAnalysis,
    /// Row-major, one `plan.width()`-long vector per usable row
    pub features: Vec<Vec<f64>>,
    /// Class index for classification, standardized value for regression
    pub labels: Vec<f64>,
    pub problem_type: ProblemType,
    pub plan: EncodingPlan,
}

impl PreparedDataset {
    pub fn rows(&self) -> usize {
        self.features.len()
    }
}

fn invalid(msg: impl Into<String>) -> EngineError {
    EngineError::DatasetInvalid(msg.into())
}

/// Order labels numerically when they all parse, lexically otherwise
fn sort_labels(labels: BTreeSet<String>) -> Vec<String> {
    let mut labels: Vec<String> = labels.into_iter().collect();
    if labels.iter().all(|l| l.parse::<f64>().is_ok()) {
        labels.sort_by(|a, b| {
            let (x, y) = (a.parse::<f64>().unwrap_or(0.0), b.parse::<f64>().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        });
    }
    labels
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    let n = values.len().max(1) as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let std = var.sqrt();
    (mean, if std > 1e-12 { std } else { 1.0 })
}

/// Parse, validate and encode a dataset for `target_column`
pub fn preprocess(raw: &[u8], format: DataFormat, target_column: &str) -> Result<PreparedDataset, EngineError> {
    let table = parse_table(raw, format).map_err(|e| invalid(e.to_string()))?;
    let analysis = analyze(&table);
    prepare(&table, analysis, target_column)
}

fn prepare(table: &Table, analysis: DatasetAnalysis, target_column: &str) -> Result<PreparedDataset, EngineError> {
    let target_idx = table
        .column_index(target_column)
        .ok_or_else(|| invalid(format!("target column '{}' not found", target_column)))?;

    if table.rows.is_empty() {
        return Err(invalid("dataset has no usable rows"));
    }

    // Columns with no values at all carry nothing to learn from
    let feature_idx: Vec<usize> = (0..table.headers.len())
        .filter(|&i| i != target_idx)
        .filter(|&i| table.column(i).any(|c| c.is_some()))
        .collect();

    if feature_idx.is_empty() {
        return Err(invalid("dataset has no feature columns besides the target"));
    }

    // Keep rows with every used cell present
    let usable: Vec<&Vec<Option<String>>> = table
        .rows
        .iter()
        .filter(|row| row[target_idx].is_some() && feature_idx.iter().all(|&i| row[i].is_some()))
        .collect();

    if usable.is_empty() {
        return Err(invalid("dataset has no usable rows"));
    }

    let cell = |row: &Vec<Option<String>>, i: usize| row[i].as_deref().unwrap_or_default().to_string();

    // Problem type from the target's value distribution
    let target_values: Vec<String> = usable.iter().map(|&row| cell(row, target_idx)).collect();
    let distinct: BTreeSet<String> = target_values.iter().cloned().collect();
    let target_numeric = sniff_type(target_values.iter().map(String::as_str)).is_numeric();

    let problem_type = if target_numeric && distinct.len() > REGRESSION_MIN_DISTINCT {
        ProblemType::Regression
    } else {
        ProblemType::Classification
    };

    if problem_type == ProblemType::Classification && distinct.len() < 2 {
        return Err(invalid(format!(
            "target column '{}' needs at least two distinct values",
            target_column
        )));
    }

    // Per-column encodings
    let mut features = Vec::with_capacity(feature_idx.len());
    for &i in &feature_idx {
        let values: Vec<String> = usable.iter().map(|&row| cell(row, i)).collect();
        let encoding = if sniff_type(values.iter().map(String::as_str)).is_numeric() {
            let nums: Vec<f64> = values.iter().filter_map(|v| v.parse::<f64>().ok()).collect();
            let (mean, std) = mean_std(&nums);
            FeatureEncoding::Numeric { mean, std }
        } else {
            let categories: Vec<String> = values.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
            if categories.len() <= MAX_ONE_HOT {
                FeatureEncoding::OneHot { categories }
            } else {
                FeatureEncoding::Ordinal { categories }
            }
        };
        features.push(FeatureColumn {
            name: table.headers[i].clone(),
            encoding,
        });
    }

    let (classes, target_mean, target_std) = match problem_type {
        ProblemType::Classification => (sort_labels(distinct), 0.0, 1.0),
        ProblemType::Regression => {
            let nums: Vec<f64> = target_values.iter().filter_map(|v| v.parse::<f64>().ok()).collect();
            let (mean, std) = mean_std(&nums);
            (Vec::new(), mean, std)
        }
    };

    let plan = EncodingPlan {
        target: target_column.to_string(),
        problem_type,
        features,
        classes,
        target_mean,
        target_std,
    };

    let headers = &table.headers;
    let matrix: Vec<Vec<f64>> = usable
        .iter()
        .map(|row| {
            plan.encode(|name| {
                headers
                    .iter()
                    .position(|h| h == name)
                    .and_then(|i| row[i].as_deref())
            })
        })
        .collect();

    let labels: Vec<f64> = target_values
        .iter()
        .map(|v| match problem_type {
            ProblemType::Classification => plan
                .classes
                .iter()
                .position(|c| c == v)
                .map(|i| i as f64)
                .unwrap_or(0.0),
            ProblemType::Regression => (v.parse::<f64>().unwrap_or(target_mean) - target_mean) / target_std,
        })
        .collect();

    tracing::debug!(
        "Prepared {} of {} rows, {} inputs, {}",
        matrix.len(),
        table.rows.len(),
        plan.width(),
        problem_type.as_str()
    );

    Ok(PreparedDataset {
        analysis,
        features: matrix,
        labels,
        problem_type,
        plan,
    })
}
