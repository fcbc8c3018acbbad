//! Configuration of smoothers, cycles and base solvers
//!
//! Every procedure is configured from a plain serde structure. Defaults mirror
//! the usual multigrid settings (damping 1, one pre- and post-smoothing step,
//! V-cycle with gamma 1). A complete solver setup can be read from JSON with
//! [`SolverConfig::from_json_str`] or [`SolverConfig::from_file`].

use crate::error::{MgError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// How a smoother makes its correction consistent in distributed mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyMode {
    /// Sum all replicas
    #[default]
    Sum,
    /// Replicas take the master value
    Overwrite,
}

/// Settings shared by the simple relaxation family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmootherConfig {
    /// Damping factor per component (a single value applies to all)
    pub damp: Vec<f64>,
    /// Consistency rule for the correction
    pub consistency: ConsistencyMode,
}

impl Default for SmootherConfig {
    fn default() -> Self {
        Self {
            damp: vec![1.0],
            consistency: ConsistencyMode::Sum,
        }
    }
}

impl SmootherConfig {
    /// Validate the damping list.
    pub fn validate(&self) -> Result<()> {
        validate_list("damp", &self.damp)
    }

    /// Damping factors for `n` components.
    pub fn damp_factors(&self, n: usize) -> Result<Vec<f64>> {
        expand_components("damp", &self.damp, n)
    }
}

/// Successive over-relaxation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SorConfig {
    /// Shared smoother settings
    pub smoother: SmootherConfig,
    /// Relaxation parameter per component
    pub omega: Vec<f64>,
}

impl Default for SorConfig {
    fn default() -> Self {
        Self {
            smoother: SmootherConfig::default(),
            omega: vec![1.0],
        }
    }
}

/// Incomplete LU flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IluVariant {
    /// ILU(0), dropped fill added to the diagonal scaled by `beta`
    #[default]
    Plain,
    /// ILU(0) restricted to vectors created on the level itself
    Fine,
    /// ILU with fill-in above `threshold` times the diagonal
    Threshold,
    /// ILU(0) with the diagonal shifted by `shift` times its own magnitude
    Spectral,
}

/// Incomplete LU settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IluConfig {
    /// Shared smoother settings
    pub smoother: SmootherConfig,
    /// Variant
    pub variant: IluVariant,
    /// Modification parameter per component
    pub beta: Vec<f64>,
    /// Diagonal shift per component (relative for the spectral variant)
    pub shift: Vec<f64>,
    /// Fill threshold per component (threshold variant)
    pub threshold: Vec<f64>,
}

impl Default for IluConfig {
    fn default() -> Self {
        Self {
            smoother: SmootherConfig::default(),
            variant: IluVariant::Plain,
            beta: vec![0.0],
            shift: vec![0.0],
            threshold: vec![0.0],
        }
    }
}

/// Incomplete Cholesky settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IcConfig {
    /// Shared smoother settings
    pub smoother: SmootherConfig,
    /// Diagonal shift per component
    pub shift: Vec<f64>,
    /// Relative tolerance of the symmetry check
    pub symmetry_tolerance: f64,
}

impl Default for IcConfig {
    fn default() -> Self {
        Self {
            smoother: SmootherConfig::default(),
            shift: vec![0.0],
            symmetry_tolerance: 1e-12,
        }
    }
}

/// Direct LU settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LuConfig {
    /// Shared smoother settings
    pub smoother: SmootherConfig,
    /// Regularize a singular last pivot instead of failing
    pub regularize: bool,
    /// Largest number of scalar unknowns factorized densely
    pub max_unknowns: usize,
}

impl Default for LuConfig {
    fn default() -> Self {
        Self {
            smoother: SmootherConfig::default(),
            regularize: true,
            max_unknowns: 4096,
        }
    }
}

/// Half-open component range `start..end` of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    /// First component
    pub start: usize,
    /// One past the last component
    pub end: usize,
}

impl BlockRange {
    /// Create a block range
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

/// Block Gauss-Seidel settings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockGsConfig {
    /// Contiguous partition of the component range
    pub blocks: Vec<BlockRange>,
    /// Visiting order (empty means natural order)
    pub order: Vec<usize>,
}

/// Whether frequency filtering acts as a smoother or as a solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TffMode {
    /// One decomposition for the prescribed relative wavenumber
    #[default]
    Smoother,
    /// All power-of-two wavenumbers up to the Nyquist limit
    Solver,
}

/// Tangential frequency filtering settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TffConfig {
    /// Shared smoother settings
    pub smoother: SmootherConfig,
    /// Smoother or solver
    pub mode: TffMode,
    /// Relative wavenumber in (0, 1] for smoother mode
    pub wavenumber: f64,
    /// Log residual norm and convergence ratio per wavenumber
    pub display: bool,
}

impl Default for TffConfig {
    fn default() -> Self {
        Self {
            smoother: SmootherConfig::default(),
            mode: TffMode::Smoother,
            wavenumber: 0.5,
            display: false,
        }
    }
}

/// V-cycle parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VCycleConfig {
    /// Coarse-grid recursions per level (1 = V-cycle, 2 = W-cycle)
    pub gamma: usize,
    /// Pre-smoothing steps
    pub nu1: usize,
    /// Post-smoothing steps
    pub nu2: usize,
    /// Level handled by the base solver
    pub base_level: usize,
}

impl Default for VCycleConfig {
    fn default() -> Self {
        Self {
            gamma: 1,
            nu1: 1,
            nu2: 1,
            base_level: 0,
        }
    }
}

/// Iterative base solver parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearSolverConfig {
    /// Maximum number of iterations
    pub max_iterations: usize,
    /// Required defect reduction
    pub reduction: f64,
    /// Absolute defect limit
    pub abs_limit: f64,
    /// Log progress every N iterations (0 = no output)
    pub print_interval: usize,
}

impl Default for LinearSolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            reduction: 1e-10,
            abs_limit: 1e-14,
            print_interval: 0,
        }
    }
}

/// Grid transfer parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Damping of the interpolated correction per component
    pub damp: Vec<f64>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self { damp: vec![1.0] }
    }
}

/// Outer multigrid iteration parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultigridSolveConfig {
    /// Maximum number of cycles
    pub max_iterations: usize,
    /// Required defect reduction
    pub reduction: f64,
    /// Absolute defect limit
    pub abs_limit: f64,
    /// Log progress every N cycles (0 = no output)
    pub print_interval: usize,
}

impl Default for MultigridSolveConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            reduction: 1e-8,
            abs_limit: 1e-14,
            print_interval: 0,
        }
    }
}

/// Smoother selection as read from a configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SmootherSpec {
    /// Damped Jacobi
    Jacobi(SmootherConfig),
    /// Gauss-Seidel
    GaussSeidel(SmootherConfig),
    /// Symmetric Gauss-Seidel
    SymmetricGaussSeidel(SmootherConfig),
    /// Successive over-relaxation
    Sor(SorConfig),
    /// Incomplete LU family
    Ilu(IluConfig),
    /// Incomplete Cholesky
    Ic(IcConfig),
    /// Direct LU
    Lu(LuConfig),
    /// Tangential frequency filtering
    Tff(TffConfig),
    /// Block Gauss-Seidel with one nested smoother per block
    BlockGaussSeidel {
        /// Partition and visiting order
        #[serde(flatten)]
        layout: BlockGsConfig,
        /// Nested smoothers, one per block
        nested: Vec<SmootherSpec>,
    },
}

impl Default for SmootherSpec {
    fn default() -> Self {
        SmootherSpec::Jacobi(SmootherConfig::default())
    }
}

/// Complete multigrid solver setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Pre-smoother (also post-smoother unless `post_smoother` is set)
    pub smoother: SmootherSpec,
    /// Separate post-smoother
    pub post_smoother: Option<SmootherSpec>,
    /// Cycle parameters
    pub cycle: VCycleConfig,
    /// Transfer parameters
    pub transfer: TransferConfig,
    /// Iteration used by the base solver
    pub base_smoother: SmootherSpec,
    /// Base solver parameters
    pub base: LinearSolverConfig,
    /// Outer iteration parameters
    pub solve: MultigridSolveConfig,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            smoother: SmootherSpec::default(),
            post_smoother: None,
            cycle: VCycleConfig::default(),
            transfer: TransferConfig::default(),
            base_smoother: SmootherSpec::Lu(LuConfig::default()),
            base: LinearSolverConfig::default(),
            solve: MultigridSolveConfig::default(),
        }
    }
}

impl SolverConfig {
    /// Parse a configuration from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

pub(crate) fn validate_list(what: &str, values: &[f64]) -> Result<()> {
    if values.is_empty() {
        return Err(MgError::InvalidConfig(format!("{} must not be empty", what)));
    }
    if let Some(v) = values.iter().find(|v| !v.is_finite()) {
        return Err(MgError::InvalidConfig(format!(
            "{} contains a non-finite value {}",
            what, v
        )));
    }
    Ok(())
}

/// Per-component values for `n` components: a single entry is broadcast,
/// longer lists are cut to `n`.
pub(crate) fn expand_components(what: &str, values: &[f64], n: usize) -> Result<Vec<f64>> {
    match values.len() {
        1 => Ok(vec![values[0]; n]),
        len if len >= n => Ok(values[..n].to_vec()),
        len => Err(MgError::InvalidConfig(format!(
            "{} has {} entries, {} components need one each",
            what, len, n
        ))),
    }
}
