//! Shared helpers for the spatial BN operator tests

#![allow(dead_code)]

pub mod env_guard;

#[allow(unused_imports)]
pub use env_guard::EnvVarGuard;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use spatial_bn_common::Tensor;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Route `tracing` output through the test harness.
pub fn setup_test_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new("debug"))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// f32 tensor with uniform values in `[lo, hi)`.
pub fn uniform(dims: &[usize], lo: f32, hi: f32, rng: &mut StdRng) -> Tensor {
    let numel: usize = dims.iter().product();
    let data = (0..numel).map(|_| rng.gen_range(lo..hi)).collect();
    Tensor::from_f32(dims, data).expect("element count matches dims")
}

pub fn filled(dims: &[usize], value: f32) -> Tensor {
    let numel: usize = dims.iter().product();
    Tensor::from_f32(dims, vec![value; numel]).expect("element count matches dims")
}

pub fn assert_close(actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() <= tol, "index {i}: {a} vs {e} (tol {tol})");
    }
}

/// Running and saved statistics for a training call.
pub struct TrainingStats {
    pub running_mean: Tensor,
    pub running_var: Tensor,
    pub saved_mean: Tensor,
    pub saved_inv_std: Tensor,
}

impl TrainingStats {
    pub fn empty() -> Self {
        Self {
            running_mean: Tensor::empty(),
            running_var: Tensor::empty(),
            saved_mean: Tensor::empty(),
            saved_inv_std: Tensor::empty(),
        }
    }

    pub fn io<'a>(
        &'a mut self,
        aggregates: Option<spatial_bn_common::BatchAggregates<'a>>,
    ) -> spatial_bn_common::StatsIo<'a> {
        spatial_bn_common::StatsIo::Training {
            running_mean: &mut self.running_mean,
            running_var: &mut self.running_var,
            saved_mean: &mut self.saved_mean,
            saved_inv_std: &mut self.saved_inv_std,
            aggregates,
        }
    }
}
