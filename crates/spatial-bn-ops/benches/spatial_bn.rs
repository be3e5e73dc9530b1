//! Criterion benchmarks for the spatial BN operators
//!
//! Compares the vendor path on the host backend with the generic fallback
//! for the same shapes.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use spatial_bn_common::FallbackPolicy;
use spatial_bn_ops::{
    BackwardIo, ForwardIo, HostMiopen, MiopenSpatialBnGradientOp, MiopenSpatialBnOp,
    SpatialBnArgs, StatsIo, Tensor,
};
use std::hint::black_box;
use std::sync::Arc;

const SHAPES: [[usize; 4]; 3] = [[8, 16, 16, 16], [16, 32, 28, 28], [4, 64, 56, 56]];

fn input(dims: &[usize]) -> Tensor {
    let numel: usize = dims.iter().product();
    let data = (0..numel).map(|i| ((i % 97) as f32 / 97.0) * 4.0 - 2.0).collect();
    Tensor::from_f32(dims, data).expect("element count matches dims")
}

fn vector(c: usize, value: f32) -> Tensor {
    Tensor::from_f32(&[c], vec![value; c]).expect("element count matches dims")
}

fn policies() -> [(&'static str, FallbackPolicy); 2] {
    [
        ("vendor", FallbackPolicy { force_fallback: false }),
        ("fallback", FallbackPolicy { force_fallback: true }),
    ]
}

fn bench_forward_training(c: &mut Criterion) {
    let mut group = c.benchmark_group("spatial_bn_forward_training");
    for dims in SHAPES {
        let x = input(&dims);
        let (scale, bias) = (vector(dims[1], 1.0), vector(dims[1], 0.0));
        group.throughput(Throughput::Elements(x.numel() as u64));

        for (label, policy) in policies() {
            let host = Arc::new(HostMiopen::new());
            let mut op = MiopenSpatialBnOp::new(SpatialBnArgs::default(), host)
                .expect("valid arguments")
                .with_policy(policy);
            let mut y = Tensor::empty();
            let (mut rm, mut rv) = (Tensor::empty(), Tensor::empty());
            let (mut sm, mut si) = (Tensor::empty(), Tensor::empty());

            group.bench_with_input(BenchmarkId::new(label, format!("{dims:?}")), &x, |b, x| {
                b.iter(|| {
                    op.run(ForwardIo {
                        x: black_box(x),
                        scale: &scale,
                        bias: &bias,
                        y: &mut y,
                        stats: StatsIo::Training {
                            running_mean: &mut rm,
                            running_var: &mut rv,
                            saved_mean: &mut sm,
                            saved_inv_std: &mut si,
                            aggregates: None,
                        },
                    })
                    .expect("forward succeeds");
                });
            });
        }
    }
    group.finish();
}

fn bench_backward(c: &mut Criterion) {
    let mut group = c.benchmark_group("spatial_bn_backward");
    for dims in SHAPES {
        let x = input(&dims);
        let dy = input(&dims);
        let ch = dims[1];
        let (scale, mean, inv_std) = (vector(ch, 1.0), vector(ch, 0.0), vector(ch, 0.8));
        group.throughput(Throughput::Elements(x.numel() as u64));

        for (label, policy) in policies() {
            let host = Arc::new(HostMiopen::new());
            let mut op = MiopenSpatialBnGradientOp::new(SpatialBnArgs::default(), host)
                .expect("valid arguments")
                .with_policy(policy);
            let (mut dx, mut dscale, mut dbias) =
                (Tensor::empty(), Tensor::empty(), Tensor::empty());

            group.bench_with_input(BenchmarkId::new(label, format!("{dims:?}")), &x, |b, x| {
                b.iter(|| {
                    op.run(BackwardIo {
                        x: black_box(x),
                        scale: &scale,
                        dy: &dy,
                        saved_mean: &mean,
                        saved_inv_std: &inv_std,
                        aggregates: None,
                        dx: &mut dx,
                        dscale: &mut dscale,
                        dbias: &mut dbias,
                    })
                    .expect("backward succeeds");
                });
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_forward_training, bench_backward);
criterion_main!(benches);
