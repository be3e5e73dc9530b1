//! Operator registration keyed by operator type and engine.

use crate::{MiopenSpatialBnGradientOp, MiopenSpatialBnOp};
use spatial_bn_common::{Result, SpatialBnArgs, SpatialBnError};
use spatial_bn_miopen::MiopenApi;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Engine name of the MIOpen-backed operators.
pub const ENGINE_MIOPEN: &str = "MIOPEN";

/// An instantiated spatial BN operator.
#[derive(Debug)]
pub enum SpatialBnOperator {
    Forward(MiopenSpatialBnOp),
    Gradient(MiopenSpatialBnGradientOp),
}

impl SpatialBnOperator {
    pub fn op_type(&self) -> &'static str {
        match self {
            Self::Forward(_) => MiopenSpatialBnOp::NAME,
            Self::Gradient(_) => MiopenSpatialBnGradientOp::NAME,
        }
    }

    pub fn as_forward_mut(&mut self) -> Option<&mut MiopenSpatialBnOp> {
        match self {
            Self::Forward(op) => Some(op),
            Self::Gradient(_) => None,
        }
    }

    pub fn as_gradient_mut(&mut self) -> Option<&mut MiopenSpatialBnGradientOp> {
        match self {
            Self::Gradient(op) => Some(op),
            Self::Forward(_) => None,
        }
    }
}

/// Builds an operator from its arguments and a vendor backend.
pub type OperatorFactory = fn(SpatialBnArgs, Arc<dyn MiopenApi>) -> Result<SpatialBnOperator>;

fn create_forward(args: SpatialBnArgs, api: Arc<dyn MiopenApi>) -> Result<SpatialBnOperator> {
    MiopenSpatialBnOp::new(args, api).map(SpatialBnOperator::Forward)
}

fn create_gradient(args: SpatialBnArgs, api: Arc<dyn MiopenApi>) -> Result<SpatialBnOperator> {
    MiopenSpatialBnGradientOp::new(args, api).map(SpatialBnOperator::Gradient)
}

/// Factories keyed by `(operator type, engine)`.
#[derive(Default)]
pub struct OperatorRegistry {
    factories: BTreeMap<(String, String), OperatorFactory>,
}

impl OperatorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding `SpatialBN` and `SpatialBNGradient` under the MIOpen engine.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(MiopenSpatialBnOp::NAME, ENGINE_MIOPEN, create_forward);
        registry.register(MiopenSpatialBnGradientOp::NAME, ENGINE_MIOPEN, create_gradient);
        registry
    }

    /// Register `factory`, returning the one it replaces.
    pub fn register(
        &mut self,
        op_type: &str,
        engine: &str,
        factory: OperatorFactory,
    ) -> Option<OperatorFactory> {
        self.factories.insert((op_type.to_string(), engine.to_string()), factory)
    }

    pub fn contains(&self, op_type: &str, engine: &str) -> bool {
        self.factories.contains_key(&(op_type.to_string(), engine.to_string()))
    }

    /// Registered `(operator type, engine)` pairs in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = (&str, &str)> {
        self.factories.keys().map(|(op, engine)| (op.as_str(), engine.as_str()))
    }

    pub fn create(
        &self,
        op_type: &str,
        engine: &str,
        args: SpatialBnArgs,
        api: Arc<dyn MiopenApi>,
    ) -> Result<SpatialBnOperator> {
        let factory = self
            .factories
            .get(&(op_type.to_string(), engine.to_string()))
            .ok_or_else(|| {
                SpatialBnError::Config(format!("no operator {op_type} registered for engine {engine}"))
            })?;
        debug!(op_type, engine, backend = api.name(), "creating operator");
        factory(args, api)
    }
}

impl std::fmt::Debug for OperatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.keys()).finish()
    }
}
