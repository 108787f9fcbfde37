//! Error taxonomy shared by planning and evaluation.
use crate::store::UnitId;
use thiserror::Error;

/// Coarse classification used by callers to decide whether a failure aborts
/// the evaluation or merely invalidates the current parameter point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Structural,
    Numerical,
    Configuration,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    // --- Structural ---
    #[error("cycle detected: '{dataset}' row {row} joins against itself")]
    CycleDetected { dataset: String, row: usize },
    #[error("{model}: observed variables present but no mean structure is declared")]
    MissingMeans { model: String },
    #[error("{model}: matrix '{matrix}' is {actual:?} but {expected:?} is required")]
    DimensionMismatch { model: String, matrix: String, expected: (usize, usize), actual: (usize, usize) },
    #[error("{model}: nonzero diagonal entry in A matrix at {index}")]
    NonzeroDiagonal { model: String, index: usize },
    #[error("cannot find key {key} in '{dataset}'")]
    KeyNotFound { dataset: String, key: i64 },
    #[error("cannot find row {row} of '{dataset}' in the flattened layout")]
    RowNotPlaced { dataset: String, row: usize },
    #[error("{unit} is evaluated before its parent {parent}; layout is not in topological order")]
    NotTopological { unit: UnitId, parent: UnitId },
    #[error("{unit} already assigned to an independent group")]
    UnitAlreadyPlaced { unit: UnitId },
    #[error("unknown {what} id {id}")]
    UnknownId { what: &'static str, id: usize },

    // --- Numerical ---
    #[error("{model}: covariance in group {group} is non-positive definite")]
    NonPositiveDefinite { model: String, group: usize },
    #[error("{model}: I - A is singular in group {group}")]
    SingularPathMatrix { model: String, group: usize },

    // --- Configuration ---
    #[error("{model}: join column '{column}' is not a key column of '{dataset}'")]
    NonKeyJoinColumn { model: String, dataset: String, column: String },
    #[error("{model}: join target '{dataset}' does not declare a primary key")]
    MissingPrimaryKey { model: String, dataset: String },
    #[error("{model}: row frequencies or weights provided in '{dataset}' are not compatible with joins")]
    WeightsWithJoins { model: String, dataset: String },
    #[error("'{dataset}': primary key {key} appears more than once")]
    DuplicatePrimaryKey { dataset: String, key: i64 },
    #[error("'{dataset}': primary key column '{column}' is missing or not a key column")]
    InvalidPrimaryKey { dataset: String, column: String },
    #[error("'{dataset}': column '{column}' has {actual} rows, expected {expected}")]
    RaggedColumn { dataset: String, column: String, expected: usize, actual: usize },
    #[error("'{dataset}': no column named '{column}'")]
    UnknownColumn { dataset: String, column: String },
    #[error("model name '{model}' is already registered")]
    DuplicateModelName { model: String },
    #[error("invalid engine options: {0}")]
    InvalidOptions(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        use EngineError::*;
        match self {
            CycleDetected { .. }
            | MissingMeans { .. }
            | DimensionMismatch { .. }
            | NonzeroDiagonal { .. }
            | KeyNotFound { .. }
            | RowNotPlaced { .. }
            | NotTopological { .. }
            | UnitAlreadyPlaced { .. }
            | UnknownId { .. } => ErrorKind::Structural,
            NonPositiveDefinite { .. } | SingularPathMatrix { .. } => ErrorKind::Numerical,
            NonKeyJoinColumn { .. }
            | MissingPrimaryKey { .. }
            | WeightsWithJoins { .. }
            | DuplicatePrimaryKey { .. }
            | InvalidPrimaryKey { .. }
            | RaggedColumn { .. }
            | UnknownColumn { .. }
            | DuplicateModelName { .. }
            | InvalidOptions(_) => ErrorKind::Configuration,
        }
    }

    pub fn is_numerical(&self) -> bool {
        self.kind() == ErrorKind::Numerical
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
