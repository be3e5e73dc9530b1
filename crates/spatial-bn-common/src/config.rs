//! Operator arguments and environment-driven policy

use crate::{Result, SpatialBnError};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;

/// Environment variable that forces every spatial BN operator onto the
/// generic fallback path.
pub const FORCE_FALLBACK_ENV: &str = "SPATIAL_BN_FORCE_FALLBACK";

/// Memory layout of a spatial tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StorageOrder {
    /// Channel-second: `[N, C, spatial...]`.
    #[default]
    #[serde(rename = "NCHW")]
    Nchw,
    /// Channel-last: `[N, spatial..., C]`.
    #[serde(rename = "NHWC")]
    Nhwc,
}

impl StorageOrder {
    /// Index of the channel axis for a tensor of rank `ndim`.
    pub fn channel_axis(self, ndim: usize) -> usize {
        match self {
            Self::Nchw => 1,
            Self::Nhwc => ndim.saturating_sub(1),
        }
    }
}

impl fmt::Display for StorageOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nchw => f.write_str("NCHW"),
            Self::Nhwc => f.write_str("NHWC"),
        }
    }
}

impl FromStr for StorageOrder {
    type Err = SpatialBnError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "NCHW" => Ok(Self::Nchw),
            "NHWC" => Ok(Self::Nhwc),
            other => Err(SpatialBnError::Config(format!("unknown storage order: {other}"))),
        }
    }
}

/// Arguments recognised by the `SpatialBN` and `SpatialBNGradient` operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpatialBnArgs {
    /// Added to the variance before taking the square root.
    pub epsilon: f32,
    /// Decay of the running statistics: `r = momentum * r + (1 - momentum) * batch`.
    pub momentum: f32,
    /// Evaluation mode when true, training mode otherwise.
    pub is_test: bool,
    /// Number of batches the statistics were aggregated over.
    pub num_batches: usize,
    pub order: StorageOrder,
    /// Scaling of the freshly computed result when blending into the output.
    pub alpha: f32,
    /// Scaling of the prior output contents when blending.
    pub beta: f32,
}

impl Default for SpatialBnArgs {
    fn default() -> Self {
        Self {
            epsilon: 1e-5,
            momentum: 0.9,
            is_test: false,
            num_batches: 1,
            order: StorageOrder::Nchw,
            alpha: 1.0,
            beta: 0.0,
        }
    }
}

impl SpatialBnArgs {
    /// Parse arguments from a JSON object; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let args: Self = serde_json::from_str(json)
            .map_err(|e| SpatialBnError::Config(format!("invalid spatial BN arguments: {e}")))?;
        args.validate()?;
        Ok(args)
    }

    #[must_use]
    pub fn with_epsilon(mut self, epsilon: f32) -> Self {
        self.epsilon = epsilon;
        self
    }

    #[must_use]
    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    #[must_use]
    pub fn with_is_test(mut self, is_test: bool) -> Self {
        self.is_test = is_test;
        self
    }

    #[must_use]
    pub fn with_num_batches(mut self, num_batches: usize) -> Self {
        self.num_batches = num_batches;
        self
    }

    #[must_use]
    pub fn with_order(mut self, order: StorageOrder) -> Self {
        self.order = order;
        self
    }

    #[must_use]
    pub fn with_alpha_beta(mut self, alpha: f32, beta: f32) -> Self {
        self.alpha = alpha;
        self.beta = beta;
        self
    }

    /// Reject argument combinations no implementation can honour.
    ///
    /// Epsilon is not checked; the vendor path clamps it.
    pub fn validate(&self) -> Result<()> {
        if self.num_batches == 0 {
            return Err(SpatialBnError::Config("num_batches must be >= 1".into()));
        }
        if !self.momentum.is_finite() || !(0.0..=1.0).contains(&self.momentum) {
            return Err(SpatialBnError::Config(format!(
                "momentum must be in [0, 1], got {}",
                self.momentum
            )));
        }
        if !self.alpha.is_finite() || !self.beta.is_finite() {
            return Err(SpatialBnError::Config(format!(
                "alpha/beta must be finite, got alpha={} beta={}",
                self.alpha, self.beta
            )));
        }
        Ok(())
    }

    /// Moving-average factor handed to the vendor library.
    pub fn exp_avg_factor(&self) -> f64 {
        1.0 - f64::from(self.momentum)
    }
}

/// Whether the generic fallback is forced regardless of the inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FallbackPolicy {
    pub force_fallback: bool,
}

impl FallbackPolicy {
    /// Read the policy from [`FORCE_FALLBACK_ENV`].
    pub fn from_env() -> Self {
        let force_fallback = env::var(FORCE_FALLBACK_ENV)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        Self { force_fallback }
    }
}
