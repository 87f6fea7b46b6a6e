//! Grade scale validation.
//!
//! A grade scale is an ordered list of labelled, inclusive score ranges. Before
//! an exam is created or edited its scale goes through [`validate_grade_scale`],
//! which is pure and reports only the first violation it finds.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cmp::Ordering;
use std::collections::HashSet;
use thiserror::Error;

pub const PERCENTAGE_MAX: f64 = 100.0;

/// The scale a band's bounds are expressed in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GradingDomain {
    Percentage,
    RawMarks { max_marks: f64 },
}

impl GradingDomain {
    pub fn parse(kind: &str, max_marks: f64) -> Option<Self> {
        match kind.trim().to_ascii_lowercase().as_str() {
            "percentage" => Some(Self::Percentage),
            "raw_marks" | "raw" => Some(Self::RawMarks { max_marks }),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Percentage => "percentage",
            Self::RawMarks { .. } => "raw_marks",
        }
    }

    pub fn bounds(self) -> (f64, f64) {
        match self {
            Self::Percentage => (0.0, PERCENTAGE_MAX),
            Self::RawMarks { max_marks } => (0.0, max_marks),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeBand {
    pub label: String,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GradeScaleError {
    #[error("grade scale must contain at least one band")]
    Empty,

    #[error("band {index} has an empty label")]
    EmptyLabel { index: usize },

    #[error("band '{label}' has a non-numeric bound")]
    NonFiniteBound { label: String },

    #[error("band '{label}': min {min} is greater than max {max}")]
    Inverted { label: String, min: f64, max: f64 },

    #[error("band '{label}' [{min}, {max}] lies outside the {domain} range [{lower}, {upper}]")]
    OutOfDomain {
        label: String,
        min: f64,
        max: f64,
        domain: &'static str,
        lower: f64,
        upper: f64,
    },

    #[error("grade label '{label}' is used more than once")]
    DuplicateLabel { label: String },

    #[error("bands '{upper}' and '{lower}' overlap")]
    Overlap { upper: String, lower: String },
}

impl GradeScaleError {
    pub fn code(&self) -> &'static str {
        "invalid_grade_scale"
    }

    pub fn details(&self) -> serde_json::Value {
        match self {
            Self::Empty => json!({ "rule": "empty" }),
            Self::EmptyLabel { index } => json!({ "rule": "empty_label", "index": index }),
            Self::NonFiniteBound { label } => json!({ "rule": "non_finite", "band": label }),
            Self::Inverted { label, .. } => json!({ "rule": "min_gt_max", "band": label }),
            Self::OutOfDomain { label, domain, .. } => {
                json!({ "rule": "out_of_domain", "band": label, "domain": domain })
            }
            Self::DuplicateLabel { label } => json!({ "rule": "duplicate_label", "band": label }),
            Self::Overlap { upper, lower } => {
                json!({ "rule": "overlap", "bands": [upper, lower] })
            }
        }
    }
}

pub fn validate_grade_scale(
    bands: &[GradeBand],
    domain: GradingDomain,
) -> Result<(), GradeScaleError> {
    if bands.is_empty() {
        return Err(GradeScaleError::Empty);
    }

    let (lower, upper) = domain.bounds();
    for (index, band) in bands.iter().enumerate() {
        let label = band.label.trim();
        if label.is_empty() {
            return Err(GradeScaleError::EmptyLabel { index });
        }
        if !band.min.is_finite() || !band.max.is_finite() {
            return Err(GradeScaleError::NonFiniteBound {
                label: label.to_string(),
            });
        }
        if band.min > band.max {
            return Err(GradeScaleError::Inverted {
                label: label.to_string(),
                min: band.min,
                max: band.max,
            });
        }
        if band.min < lower || band.max > upper {
            return Err(GradeScaleError::OutOfDomain {
                label: label.to_string(),
                min: band.min,
                max: band.max,
                domain: domain.as_str(),
                lower,
                upper,
            });
        }
    }

    let mut seen: HashSet<String> = HashSet::new();
    for band in bands {
        let key = band.label.trim().to_ascii_lowercase();
        if !seen.insert(key) {
            return Err(GradeScaleError::DuplicateLabel {
                label: band.label.trim().to_string(),
            });
        }
    }

    let mut sorted: Vec<&GradeBand> = bands.iter().collect();
    sorted.sort_by(|a, b| {
        b.max
            .partial_cmp(&a.max)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.min.partial_cmp(&a.min).unwrap_or(Ordering::Equal))
    });
    for pair in sorted.windows(2) {
        let (upper_band, lower_band) = (pair[0], pair[1]);
        if lower_band.max >= upper_band.min {
            return Err(GradeScaleError::Overlap {
                upper: upper_band.label.trim().to_string(),
                lower: lower_band.label.trim().to_string(),
            });
        }
    }

    Ok(())
}

/// Label of the band containing `score`, or `None` when it falls in a gap.
pub fn grade_for(bands: &[GradeBand], score: f64) -> Option<&str> {
    bands
        .iter()
        .find(|b| b.min <= score && score <= b.max)
        .map(|b| b.label.trim())
}
