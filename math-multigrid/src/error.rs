//! Error types for the multigrid core.
//!
//! Every fallible operation returns [`Result`]. Failures unwind the current
//! call stack through `?`; there is no local retry. The only recovered
//! failure is the singular last pivot of the direct LU smoother, which never
//! surfaces here.

use crate::dense::LuError;
use crate::descriptor::GeomType;
use thiserror::Error;

/// Errors that can occur in the descriptor layer, the smoothers, the cycle
/// or the consistency protocol.
#[derive(Debug, Error)]
pub enum MgError {
    /// Two vector descriptors disagree on the components of a type.
    #[error(
        "descriptor mismatch: {dest} defines {found} components of type {gtype}, {src} defines {expected}"
    )]
    DescriptorMismatch {
        /// Descriptor that was checked against the source
        dest: String,
        /// Source descriptor
        src: String,
        /// Geometric type where the counts differ
        gtype: GeomType,
        /// Component count in the source
        expected: usize,
        /// Component count in the destination (0 when undefined)
        found: usize,
    },

    /// A matrix block does not fit the vector descriptors around it.
    #[error(
        "matrix descriptor {matrix}: block ({row_type}, {col_type}) is {rows}x{cols}, vectors need {expected_rows}x{expected_cols}"
    )]
    MatrixShapeMismatch {
        /// Matrix descriptor name
        matrix: String,
        /// Row type of the block
        row_type: GeomType,
        /// Column type of the block
        col_type: GeomType,
        /// Declared rows
        rows: usize,
        /// Declared columns
        cols: usize,
        /// Rows required by the row vector
        expected_rows: usize,
        /// Columns required by the column vector
        expected_cols: usize,
    },

    /// A matrix block exceeds the compiled maximum block size.
    #[error("matrix descriptor {matrix}: block dimension {size} exceeds the maximum {max}")]
    BlockTooLarge {
        /// Matrix descriptor name
        matrix: String,
        /// Offending block dimension
        size: usize,
        /// Compiled bound
        max: usize,
    },

    /// A temporary vector, matrix or factorization could not be allocated.
    #[error("cannot allocate {what}: requested {requested}, capacity {capacity}")]
    Allocation {
        /// What was being allocated
        what: String,
        /// Requested size
        requested: usize,
        /// Available capacity
        capacity: usize,
    },

    /// A factorization hit a singular pivot block.
    #[error("{procedure}: factorization failed on level {level} at vector {index}")]
    Factorization {
        /// Procedure that factorized
        procedure: String,
        /// Grid level
        level: usize,
        /// Index of the vector whose pivot failed
        index: usize,
    },

    /// A symmetric factorization was handed a non-symmetric matrix.
    #[error("matrix on level {level} is not symmetric at vectors ({row}, {col})")]
    NotSymmetric {
        /// Grid level
        level: usize,
        /// Row vector
        row: usize,
        /// Column vector
        col: usize,
    },

    /// The communication layer failed during an exchange.
    #[error("exchange over {interface} failed: {reason}")]
    Exchange {
        /// Interface or collective name
        interface: String,
        /// Reason reported by the communicator
        reason: String,
    },

    /// Iterate or PostProcess was called on a level without PreProcess.
    #[error("{procedure}: level {level} was not preprocessed")]
    NotPreprocessed {
        /// Procedure name
        procedure: String,
        /// Grid level
        level: usize,
    },

    /// PreProcess was called twice on the same level.
    #[error("{procedure}: level {level} is already preprocessed")]
    AlreadyPreprocessed {
        /// Procedure name
        procedure: String,
        /// Grid level
        level: usize,
    },

    /// The procedure has not been configured completely.
    #[error("{procedure} is not executable: {reason}")]
    NotExecutable {
        /// Procedure name
        procedure: String,
        /// What is missing
        reason: String,
    },

    /// A block partition does not exhaust its component range.
    #[error("invalid block partition: {0}")]
    InvalidPartition(String),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The requested grid level does not exist.
    #[error("level {level} does not exist (top level is {top})")]
    NoSuchLevel {
        /// Requested level
        level: usize,
        /// Top level of the hierarchy
        top: usize,
    },

    /// A vector or connection index is out of range.
    #[error("vector index {index} out of range on level {level} ({len} vectors)")]
    NoSuchVector {
        /// Grid level
        level: usize,
        /// Requested index
        index: usize,
        /// Number of vectors on the level
        len: usize,
    },

    /// A dense factorization failed.
    #[error(transparent)]
    Lu(#[from] LuError),

    /// Reading a configuration file failed.
    #[error("failed to read configuration: {0}")]
    ConfigIo(#[from] std::io::Error),

    /// Parsing a configuration failed.
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

/// A specialized `Result` type for multigrid operations.
pub type Result<T> = std::result::Result<T, MgError>;

impl MgError {
    /// Returns `true` for descriptor compatibility errors.
    ///
    /// This includes `DescriptorMismatch`, `MatrixShapeMismatch` and
    /// `BlockTooLarge`.
    pub fn is_descriptor_error(&self) -> bool {
        matches!(
            self,
            MgError::DescriptorMismatch { .. }
                | MgError::MatrixShapeMismatch { .. }
                | MgError::BlockTooLarge { .. }
        )
    }

    /// Returns `true` for errors caused by calling the lifecycle out of order.
    pub fn is_lifecycle_error(&self) -> bool {
        matches!(
            self,
            MgError::NotPreprocessed { .. }
                | MgError::AlreadyPreprocessed { .. }
                | MgError::NotExecutable { .. }
        )
    }

    /// Returns `true` for numerical failures of a factorization.
    pub fn is_factorization_error(&self) -> bool {
        matches!(
            self,
            MgError::Factorization { .. } | MgError::NotSymmetric { .. } | MgError::Lu(_)
        )
    }

    /// Returns `true` when the error leaves a level without usable state:
    /// failed factorizations, allocations and exchanges.
    ///
    /// Lifecycle, configuration and lookup errors are caller mistakes and
    /// leave existing state untouched.
    pub fn is_fatal(&self) -> bool {
        self.is_factorization_error()
            || matches!(self, MgError::Allocation { .. } | MgError::Exchange { .. })
    }

    pub(crate) fn not_executable(procedure: &str, reason: impl Into<String>) -> Self {
        MgError::NotExecutable {
            procedure: procedure.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn exchange(interface: &str, reason: impl Into<String>) -> Self {
        MgError::Exchange {
            interface: interface.to_string(),
            reason: reason.into(),
        }
    }
}
