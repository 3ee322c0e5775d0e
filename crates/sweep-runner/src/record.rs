use serde::{Deserialize, Serialize};
use std::fmt;

use crate::matrix::JobDescriptor;

/// How a job concluded. Harness-generated tags are upper-case; anything else
/// is the job's own domain result, passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Outcome {
    Domain(String),
    Error,
    Timeout,
    NoResult,
    BadResult,
    Exception(String),
}

impl Outcome {
    pub fn tag(&self) -> String {
        match self {
            Outcome::Domain(label) => label.clone(),
            Outcome::Error => "ERROR".to_string(),
            Outcome::Timeout => "TIMEOUT".to_string(),
            Outcome::NoResult => "NO_RESULT".to_string(),
            Outcome::BadResult => "BAD_RESULT".to_string(),
            Outcome::Exception(detail) => format!("EXCEPTION:{}", detail),
        }
    }

    pub fn is_harness_failure(&self) -> bool {
        !matches!(self, Outcome::Domain(_))
    }
}

impl From<String> for Outcome {
    fn from(value: String) -> Self {
        match value.as_str() {
            "ERROR" => Outcome::Error,
            "TIMEOUT" => Outcome::Timeout,
            "NO_RESULT" => Outcome::NoResult,
            "BAD_RESULT" => Outcome::BadResult,
            _ => match value.strip_prefix("EXCEPTION:") {
                Some(detail) => Outcome::Exception(detail.to_string()),
                None => Outcome::Domain(value),
            },
        }
    }
}

impl From<Outcome> for String {
    fn from(value: Outcome) -> Self {
        value.tag()
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

/// The fixed five-field row produced for every attempted job.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResultRecord {
    pub work_variant: String,
    pub opposing_side: String,
    pub difficulty: String,
    pub environment: String,
    pub outcome: Outcome,
}

impl ResultRecord {
    /// Builds a record whose descriptor fields come from the job, never from
    /// whatever the job itself reported.
    pub fn for_job(job: &JobDescriptor, outcome: Outcome) -> Self {
        Self {
            work_variant: job.work_variant.clone(),
            opposing_side: job.opposing_side.clone(),
            difficulty: job.difficulty.clone(),
            environment: job.environment.clone(),
            outcome,
        }
    }

    pub fn describes(&self, job: &JobDescriptor) -> bool {
        self.work_variant == job.work_variant
            && self.opposing_side == job.opposing_side
            && self.difficulty == job.difficulty
            && self.environment == job.environment
    }

    pub fn fields(&self) -> [String; 5] {
        [
            self.work_variant.clone(),
            self.opposing_side.clone(),
            self.difficulty.clone(),
            self.environment.clone(),
            self.outcome.tag(),
        ]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnSchema {
    #[default]
    Standard,
    Legacy,
}

impl ColumnSchema {
    pub fn header(&self) -> [&'static str; 5] {
        match self {
            ColumnSchema::Standard => [
                "work_variant",
                "opposing_side",
                "difficulty",
                "environment",
                "outcome",
            ],
            ColumnSchema::Legacy => ["bot_strategy", "opponent_race", "difficulty", "map", "result"],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnSchema::Standard => "standard",
            ColumnSchema::Legacy => "legacy",
        }
    }
}
