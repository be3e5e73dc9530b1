//! Helpers shared by the forward and gradient operators.

use spatial_bn_common::{FallbackPolicy, SpatialBnArgs, StorageOrder, warn_once};
use spatial_bn_miopen::MIOPEN_BN_MIN_EPSILON;

/// NCHW extents for the vendor descriptor. Rank 3 gets `W = 1`; axes past
/// the fourth are folded into `W`.
pub(crate) fn nchw_extents(dims: &[usize]) -> [usize; 4] {
    debug_assert!(dims.len() >= 3);
    let w = dims[3..].iter().product();
    [dims[0], dims[1], dims[2], w]
}

/// Epsilon handed to the vendor library, never below its minimum.
pub(crate) fn vendor_epsilon(operator: &'static str, epsilon: f32) -> f64 {
    if epsilon >= MIOPEN_BN_MIN_EPSILON as f32 {
        return f64::from(epsilon).max(MIOPEN_BN_MIN_EPSILON);
    }
    warn_once!(
        &format!("{operator}.epsilon:{epsilon:e}"),
        "{operator}: epsilon {epsilon:e} is below the MIOpen minimum, using {MIOPEN_BN_MIN_EPSILON:e}"
    );
    MIOPEN_BN_MIN_EPSILON
}

/// Arguments for the generic path, carrying the same clamped epsilon the
/// vendor library would see.
pub(crate) fn fallback_args(operator: &'static str, args: &SpatialBnArgs) -> SpatialBnArgs {
    SpatialBnArgs { epsilon: vendor_epsilon(operator, args.epsilon) as f32, ..args.clone() }
}

/// Why a request bypasses the vendor library, if it does.
pub(crate) fn fallback_reason(
    args: &SpatialBnArgs,
    policy: FallbackPolicy,
) -> Option<&'static str> {
    if policy.force_fallback {
        Some("forced by environment")
    } else if args.order == StorageOrder::Nhwc {
        Some("NHWC order")
    } else if args.num_batches > 1 {
        Some("num_batches > 1")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_three_has_unit_width() {
        assert_eq!(nchw_extents(&[2, 3, 5]), [2, 3, 5, 1]);
    }

    #[test]
    fn trailing_axes_fold_into_width() {
        assert_eq!(nchw_extents(&[2, 3, 4, 5]), [2, 3, 4, 5]);
        assert_eq!(nchw_extents(&[2, 3, 4, 5, 6]), [2, 3, 4, 30]);
    }

    #[test]
    fn small_epsilon_is_raised() {
        assert_eq!(vendor_epsilon("SpatialBN", 0.0), MIOPEN_BN_MIN_EPSILON);
        assert_eq!(vendor_epsilon("SpatialBN", -1.0), MIOPEN_BN_MIN_EPSILON);
        assert_eq!(vendor_epsilon("SpatialBN", f32::NAN), MIOPEN_BN_MIN_EPSILON);
        assert_eq!(vendor_epsilon("SpatialBN", 1e-6), MIOPEN_BN_MIN_EPSILON);
        assert_eq!(vendor_epsilon("SpatialBN", 0.5), 0.5);
    }

    #[test]
    fn fallback_args_floor_epsilon() {
        let args = SpatialBnArgs::default().with_epsilon(-1e-3).with_momentum(0.5);
        let clamped = fallback_args("SpatialBN", &args);
        assert_eq!(clamped.epsilon, MIOPEN_BN_MIN_EPSILON as f32);
        assert_eq!(clamped.momentum, 0.5);

        let args = SpatialBnArgs::default().with_epsilon(1e-3);
        assert_eq!(fallback_args("SpatialBN", &args), args);
    }

    #[test]
    fn fallback_conditions() {
        let args = SpatialBnArgs::default();
        let off = FallbackPolicy::default();
        assert_eq!(fallback_reason(&args, off), None);
        assert!(fallback_reason(&args.clone().with_order(StorageOrder::Nhwc), off).is_some());
        assert!(fallback_reason(&args.clone().with_num_batches(2), off).is_some());
        assert!(fallback_reason(&args, FallbackPolicy { force_fallback: true }).is_some());
    }
}
