//! Forward operator behaviour on the host MIOpen backend.

mod support;

use proptest::prelude::*;
use spatial_bn_common::{FallbackPolicy, TensorData};
use spatial_bn_miopen::{MIOPEN_BN_MIN_EPSILON, MiopenCall, MiopenStatus};
use spatial_bn_ops::{
    CpuFallback, ForwardIo, HostMiopen, MiopenSpatialBnOp, SpatialBnArgs, SpatialBnError,
    SpatialBnFallback, StatsIo, Tensor,
};
use std::sync::Arc;
use support::{TrainingStats, assert_close, filled, rng, uniform};

fn vendor_op(args: SpatialBnArgs) -> (Arc<HostMiopen>, MiopenSpatialBnOp) {
    let host = Arc::new(HostMiopen::recording());
    let op = MiopenSpatialBnOp::new(args, host.clone())
        .unwrap()
        .with_policy(FallbackPolicy::default());
    (host, op)
}

fn run_inference(
    op: &mut MiopenSpatialBnOp,
    x: &Tensor,
    mean: &Tensor,
    var: &Tensor,
) -> spatial_bn_ops::Result<Tensor> {
    let c = x.dim(1);
    let (scale, bias) = (filled(&[c], 1.5), filled(&[c], -0.5));
    let mut y = Tensor::empty();
    op.run(ForwardIo {
        x,
        scale: &scale,
        bias: &bias,
        y: &mut y,
        stats: StatsIo::Inference { est_mean: mean, est_var: var },
    })?;
    Ok(y)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_eval_preserves_shape_and_statistics(
        n in 1usize..4,
        c in 1usize..5,
        h in 1usize..4,
        w in 1usize..4,
        seed in any::<u64>(),
    ) {
        let mut rng = rng(seed);
        let (_, mut op) = vendor_op(SpatialBnArgs::default().with_is_test(true));
        let x = uniform(&[n, c, h, w], -2.0, 2.0, &mut rng);
        let mean = uniform(&[c], -1.0, 1.0, &mut rng);
        let var = uniform(&[c], 0.5, 2.0, &mut rng);
        let (mean_before, var_before) = (mean.clone(), var.clone());

        let y = run_inference(&mut op, &x, &mean, &var).unwrap();

        prop_assert_eq!(y.dims(), x.dims());
        prop_assert_eq!(&mean, &mean_before);
        prop_assert_eq!(&var, &var_before);
    }

    #[test]
    fn prop_training_preserves_shape(
        n in 1usize..4,
        c in 1usize..5,
        h in 1usize..4,
        w in 1usize..4,
        seed in any::<u64>(),
    ) {
        let mut rng = rng(seed);
        let (_, mut op) = vendor_op(SpatialBnArgs::default());
        let x = uniform(&[n, c, h, w], -2.0, 2.0, &mut rng);
        let (scale, bias) = (filled(&[c], 1.0), filled(&[c], 0.0));
        let mut y = Tensor::empty();
        let mut stats = TrainingStats::empty();

        op.run(ForwardIo { x: &x, scale: &scale, bias: &bias, y: &mut y, stats: stats.io(None) })
            .unwrap();

        prop_assert_eq!(y.dims(), x.dims());
        prop_assert_eq!(stats.running_mean.dims(), &[c]);
        prop_assert_eq!(stats.saved_inv_std.dims(), &[c]);
    }
}

#[test]
fn first_training_call_starts_from_zero() {
    let (_, mut op) = vendor_op(SpatialBnArgs::default().with_momentum(0.9));
    let x = Tensor::from_f32(&[2, 2, 1, 2], vec![1.0, 3.0, 10.0, 10.0, 5.0, 7.0, 20.0, 20.0])
        .unwrap();
    let (scale, bias) = (filled(&[2], 1.0), filled(&[2], 0.0));
    let mut y = Tensor::empty();
    let mut stats = TrainingStats::empty();

    op.run(ForwardIo { x: &x, scale: &scale, bias: &bias, y: &mut y, stats: stats.io(None) })
        .unwrap();

    // channel 0 = {1, 3, 5, 7}: mean 4, unbiased var 20/3
    // channel 1 = {10, 10, 20, 20}: mean 15, unbiased var 100/3
    assert_close(stats.running_mean.as_f32().unwrap(), &[0.4, 1.5], 1e-5);
    assert_close(stats.running_var.as_f32().unwrap(), &[2.0 / 3.0, 10.0 / 3.0], 1e-5);
    assert_close(stats.saved_mean.as_f32().unwrap(), &[4.0, 15.0], 1e-6);
}

#[test]
fn existing_running_stats_are_updated_in_place() {
    let (_, mut op) = vendor_op(SpatialBnArgs::default().with_momentum(0.5));
    let x = Tensor::from_f32(&[2, 1, 1, 1], vec![2.0, 4.0]).unwrap();
    let (scale, bias) = (filled(&[1], 1.0), filled(&[1], 0.0));
    let mut y = Tensor::empty();
    let mut stats = TrainingStats::empty();
    stats.running_mean = filled(&[1], 1.0);
    stats.running_var = filled(&[1], 1.0);

    op.run(ForwardIo { x: &x, scale: &scale, bias: &bias, y: &mut y, stats: stats.io(None) })
        .unwrap();

    // mean 3, unbiased var 2
    assert_close(stats.running_mean.as_f32().unwrap(), &[2.0], 1e-6);
    assert_close(stats.running_var.as_f32().unwrap(), &[1.5], 1e-6);
}

#[test]
fn empty_batch_training_skips_vendor() {
    let (host, mut op) = vendor_op(SpatialBnArgs::default());
    let x = Tensor::zeros(&[0, 4, 3, 3]);
    let (scale, bias) = (filled(&[4], 1.0), filled(&[4], 0.0));
    let mut y = filled(&[2], 9.0);
    let mut stats = TrainingStats::empty();
    stats.saved_mean = filled(&[4], 7.0);
    stats.running_mean = filled(&[4], 3.0);
    stats.running_var = filled(&[4], 3.0);

    op.run(ForwardIo { x: &x, scale: &scale, bias: &bias, y: &mut y, stats: stats.io(None) })
        .unwrap();

    assert_eq!(y.dims(), &[0, 4, 3, 3]);
    assert_eq!(stats.saved_mean.as_f32().unwrap(), &[0.0; 4]);
    assert_eq!(stats.saved_inv_std.as_f32().unwrap(), &[0.0; 4]);
    assert_eq!(stats.running_mean.as_f32().unwrap(), &[3.0; 4]);
    assert_eq!(host.compute_calls(), 0);
}

#[test]
fn empty_batch_eval_skips_vendor() {
    let (host, mut op) = vendor_op(SpatialBnArgs::default().with_is_test(true));
    let x = Tensor::zeros(&[0, 2, 5, 5]);
    let stat = filled(&[2], 1.0);
    let y = run_inference(&mut op, &x, &stat, &stat).unwrap();
    assert_eq!(y.dims(), &[0, 2, 5, 5]);
    assert_eq!(host.compute_calls(), 0);
}

#[test]
fn non_positive_epsilon_reaches_vendor_as_minimum() {
    for epsilon in [0.0, -1e-3, 1e-9] {
        let (host, mut op) =
            vendor_op(SpatialBnArgs::default().with_is_test(true).with_epsilon(epsilon));
        let x = filled(&[1, 1, 2, 2], 1.0);
        let stat = filled(&[1], 1.0);
        run_inference(&mut op, &x, &stat, &stat).unwrap();

        let eps: Vec<f64> = host.calls().iter().filter_map(MiopenCall::epsilon).collect();
        assert_eq!(eps, vec![MIOPEN_BN_MIN_EPSILON], "epsilon {epsilon}");
    }
}

#[test]
fn host_vendor_path_matches_fallback() {
    let mut rng = rng(11);
    let x = uniform(&[3, 4, 2, 5], -3.0, 3.0, &mut rng);
    let scale = uniform(&[4], 0.5, 1.5, &mut rng);
    let bias = uniform(&[4], -1.0, 1.0, &mut rng);
    let args = SpatialBnArgs::default().with_momentum(0.8);

    let (host, mut op) = vendor_op(args.clone());
    let mut y_vendor = Tensor::empty();
    let mut vendor = TrainingStats::empty();
    op.run(ForwardIo {
        x: &x,
        scale: &scale,
        bias: &bias,
        y: &mut y_vendor,
        stats: vendor.io(None),
    })
    .unwrap();
    assert_eq!(host.compute_calls(), 1);

    let mut y_cpu = Tensor::empty();
    let mut cpu = TrainingStats::empty();
    CpuFallback
        .forward(
            &args,
            ForwardIo { x: &x, scale: &scale, bias: &bias, y: &mut y_cpu, stats: cpu.io(None) },
        )
        .unwrap();

    assert_close(y_vendor.as_f32().unwrap(), y_cpu.as_f32().unwrap(), 1e-5);
    assert_close(vendor.running_mean.as_f32().unwrap(), cpu.running_mean.as_f32().unwrap(), 1e-6);
    assert_close(vendor.running_var.as_f32().unwrap(), cpu.running_var.as_f32().unwrap(), 1e-5);
    assert_close(vendor.saved_inv_std.as_f32().unwrap(), cpu.saved_inv_std.as_f32().unwrap(), 1e-5);
}

#[test]
fn beta_blends_prior_output() {
    let args = SpatialBnArgs::default().with_is_test(true).with_alpha_beta(1.0, 1.0);
    let (_, mut op) = vendor_op(args);
    let x = filled(&[1, 1, 1, 2], 0.0);
    let stat0 = filled(&[1], 0.0);
    let stat1 = filled(&[1], 1.0);
    let (scale, bias) = (filled(&[1], 1.0), filled(&[1], 2.0));
    let mut y = filled(&[1, 1, 1, 2], 10.0);
    op.run(ForwardIo {
        x: &x,
        scale: &scale,
        bias: &bias,
        y: &mut y,
        stats: StatsIo::Inference { est_mean: &stat0, est_var: &stat1 },
    })
    .unwrap();
    assert_close(y.as_f32().unwrap(), &[12.0, 12.0], 1e-4);
}

#[test]
fn vendor_failure_carries_status_code() {
    let (host, mut op) = vendor_op(SpatialBnArgs::default().with_is_test(true));
    host.fail_next_compute(MiopenStatus::AllocFailed);
    let x = filled(&[1, 1, 1, 1], 1.0);
    let stat = filled(&[1], 1.0);
    let err = run_inference(&mut op, &x, &stat, &stat).unwrap_err();
    assert_eq!(err.vendor_code(), Some(MiopenStatus::AllocFailed.code()));
    assert!(matches!(
        err,
        SpatialBnError::Vendor { call: "miopenBatchNormalizationForwardInference", .. }
    ));
}

#[test]
fn half_precision_input_is_unsupported() {
    let (host, mut op) = vendor_op(SpatialBnArgs::default().with_is_test(true));
    let x = Tensor::from_f16(&[1, 1, 1, 1], vec![half::f16::ONE]).unwrap();
    let stat = filled(&[1], 1.0);
    let err = run_inference(&mut op, &x, &stat, &stat).unwrap_err();
    assert!(matches!(err, SpatialBnError::UnsupportedDataType { operator: "SpatialBN", .. }));
    assert_eq!(host.compute_calls(), 0);
}

#[test]
fn mismatched_scale_length_is_rejected() {
    let (host, mut op) = vendor_op(SpatialBnArgs::default().with_is_test(true));
    let x = filled(&[1, 3, 1, 1], 1.0);
    let stat = filled(&[3], 1.0);
    let bad_scale = filled(&[2], 1.0);
    let bias = filled(&[3], 0.0);
    let mut y = Tensor::empty();
    let err = op
        .run(ForwardIo {
            x: &x,
            scale: &bad_scale,
            bias: &bias,
            y: &mut y,
            stats: StatsIo::Inference { est_mean: &stat, est_var: &stat },
        })
        .unwrap_err();
    assert!(matches!(err, SpatialBnError::Validation(_)));
    assert_eq!(host.compute_calls(), 0);
    assert!(matches!(y.data(), TensorData::F32(v) if v.is_empty()));
}
