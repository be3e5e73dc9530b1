//! CPU spatial batch normalization kernel.
//!
//! Statistics are per channel, reduced over the batch axis and every spatial
//! axis. Inputs are contiguous `f32` slices in either NCHW or NHWC order; any
//! number of spatial axes is accepted since they are folded into one extent.
//! Accumulation happens in `f64`.

use spatial_bn_common::{KernelError, Result, SpatialBnError, StorageOrder};

fn invalid_args(reason: impl Into<String>) -> SpatialBnError {
    SpatialBnError::Kernel(KernelError::InvalidArguments { reason: reason.into() })
}

// ── Layout ─────────────────────────────────────────────────────────

/// A spatial tensor seen as `(N, C, S)` where `S` is the product of all
/// spatial extents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpatialLayout {
    pub n: usize,
    pub c: usize,
    pub spatial: usize,
    pub order: StorageOrder,
}

impl SpatialLayout {
    /// Fold `dims` into `(N, C, S)`. Requires rank ≥ 2.
    pub fn from_dims(dims: &[usize], order: StorageOrder) -> Result<Self> {
        if dims.len() < 2 {
            return Err(invalid_args(format!(
                "spatial batch norm needs rank >= 2, got dims {dims:?}"
            )));
        }
        let axis = order.channel_axis(dims.len());
        let spatial = dims
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != 0 && i != axis)
            .map(|(_, &d)| d)
            .product();
        Ok(Self { n: dims[0], c: dims[axis], spatial, order })
    }

    pub fn numel(&self) -> usize {
        self.n * self.c * self.spatial
    }

    /// Elements contributing to one channel's statistics.
    pub fn reduce_size(&self) -> usize {
        self.n * self.spatial
    }

    #[inline]
    fn index(&self, b: usize, ch: usize, s: usize) -> usize {
        match self.order {
            StorageOrder::Nchw => (b * self.c + ch) * self.spatial + s,
            StorageOrder::Nhwc => (b * self.spatial + s) * self.c + ch,
        }
    }

    /// Flat offsets of every element of channel `ch`.
    fn channel(&self, ch: usize) -> impl Iterator<Item = usize> + '_ {
        (0..self.n).flat_map(move |b| (0..self.spatial).map(move |s| self.index(b, ch, s)))
    }
}

// ── Parameters ─────────────────────────────────────────────────────

/// Per-channel affine parameters.
#[derive(Debug, Clone, Copy)]
pub struct Affine<'a> {
    pub scale: &'a [f32],
    pub bias: &'a [f32],
}

/// Training hyper-parameters.
#[derive(Debug, Clone, Copy)]
pub struct TrainingConfig {
    pub eps: f32,
    /// Running statistics keep `momentum` of their previous value.
    pub momentum: f32,
    pub num_batches: usize,
}

/// Per-channel sums gathered across `num_batches` batches.
#[derive(Debug, Clone, Copy)]
pub struct MomentSums<'a> {
    pub sum: &'a [f32],
    pub sum_sq: &'a [f32],
}

/// Outputs of a training forward pass.
pub struct TrainingOutputs<'a> {
    pub y: &'a mut [f32],
    pub running_mean: &'a mut [f32],
    pub running_var: &'a mut [f32],
    pub saved_mean: &'a mut [f32],
    pub saved_inv_std: &'a mut [f32],
}

/// Outputs of a backward pass.
pub struct GradientOutputs<'a> {
    pub dx: &'a mut [f32],
    pub dscale: &'a mut [f32],
    pub dbias: &'a mut [f32],
}

// ── Forward ────────────────────────────────────────────────────────

/// Normalise with fixed statistics: `y = scale·(x − mean)/sqrt(var + eps) + bias`.
pub fn spatial_bn_inference(
    x: &[f32],
    layout: &SpatialLayout,
    affine: Affine<'_>,
    mean: &[f32],
    var: &[f32],
    eps: f32,
    y: &mut [f32],
) -> Result<()> {
    validate_input(x, layout)?;
    validate_eps(eps)?;
    validate_len(y, layout.numel(), "y")?;
    validate_affine(affine, layout.c)?;
    validate_len(mean, layout.c, "mean")?;
    validate_len(var, layout.c, "var")?;

    for ch in 0..layout.c {
        let inv_std = 1.0 / (f64::from(var[ch]) + f64::from(eps)).sqrt();
        normalize_channel(x, layout, ch, affine, f64::from(mean[ch]), inv_std, y);
    }
    Ok(())
}

/// Normalise with batch statistics and update running statistics.
///
/// With `num_batches == 1` the moments come from `x`. Otherwise `sums` must
/// hold `Σx` and `Σx²` over all batches, and the moments are taken over
/// `num_batches · N · S` elements. Running statistics follow
/// `r ← momentum·r + (1 − momentum)·stat` with the unbiased variance; a single
/// reduced element leaves only the decayed variance.
pub fn spatial_bn_training(
    x: &[f32],
    layout: &SpatialLayout,
    affine: Affine<'_>,
    config: &TrainingConfig,
    sums: Option<MomentSums<'_>>,
    out: TrainingOutputs<'_>,
) -> Result<()> {
    let c = layout.c;
    validate_input(x, layout)?;
    validate_eps(config.eps)?;
    validate_momentum(config.momentum)?;
    validate_affine(affine, c)?;
    validate_len(out.y, layout.numel(), "y")?;
    validate_len(out.running_mean, c, "running_mean")?;
    validate_len(out.running_var, c, "running_var")?;
    validate_len(out.saved_mean, c, "saved_mean")?;
    validate_len(out.saved_inv_std, c, "saved_inv_std")?;
    if config.num_batches == 0 {
        return Err(invalid_args("num_batches must be > 0"));
    }

    let (mean, var) = match (config.num_batches, sums) {
        (1, _) => compute_batch_stats(x, layout)?,
        (batches, Some(sums)) => {
            validate_len(sums.sum, c, "sums")?;
            validate_len(sums.sum_sq, c, "sums_sq")?;
            moments_from_sums(sums, (batches * layout.reduce_size()) as f64)
        }
        (batches, None) => {
            return Err(invalid_args(format!(
                "num_batches = {batches} requires aggregated sums"
            )));
        }
    };

    let reduce_size = config.num_batches * layout.reduce_size();
    let keep = f64::from(config.momentum);
    let take = 1.0 - keep;
    for ch in 0..c {
        let inv_std = 1.0 / (var[ch] + f64::from(config.eps)).sqrt();
        normalize_channel(x, layout, ch, affine, mean[ch], inv_std, out.y);

        let rm = f64::from(out.running_mean[ch]);
        let rv = f64::from(out.running_var[ch]);
        out.running_mean[ch] = (take * mean[ch] + keep * rm) as f32;
        out.running_var[ch] = if reduce_size > 1 {
            let unbiased = var[ch] * reduce_size as f64 / (reduce_size - 1) as f64;
            (take * unbiased + keep * rv) as f32
        } else {
            (keep * rv) as f32
        };
        out.saved_mean[ch] = mean[ch] as f32;
        out.saved_inv_std[ch] = inv_std as f32;
    }
    Ok(())
}

// ── Backward ───────────────────────────────────────────────────────

/// Gradients of spatial batch norm with respect to `x`, scale and bias.
///
/// `dbias = Σdy`, `dscale = Σdy·x̂` and
/// `dx = scale·rstd·(dy − (x̂·dscale + dbias)/(N·S))`. With `num_batches > 1`
/// the scale and bias gradients are `aggregated / num_batches` instead of the
/// local sums, and those are what `out.dscale` / `out.dbias` receive.
#[allow(clippy::too_many_arguments)]
pub fn spatial_bn_backward(
    x: &[f32],
    dy: &[f32],
    layout: &SpatialLayout,
    scale: &[f32],
    saved_mean: &[f32],
    saved_inv_std: &[f32],
    num_batches: usize,
    aggregated: Option<(&[f32], &[f32])>,
    out: GradientOutputs<'_>,
) -> Result<()> {
    let c = layout.c;
    validate_input(x, layout)?;
    if dy.len() != x.len() {
        return Err(invalid_args(format!(
            "dy length {} != x length {}",
            dy.len(),
            x.len()
        )));
    }
    validate_len(scale, c, "scale")?;
    validate_len(saved_mean, c, "saved_mean")?;
    validate_len(saved_inv_std, c, "saved_inv_std")?;
    validate_len(out.dx, x.len(), "dx")?;
    validate_len(out.dscale, c, "dscale")?;
    validate_len(out.dbias, c, "dbias")?;

    let aggregated = match (num_batches, aggregated) {
        (0, _) => return Err(invalid_args("num_batches must be > 0")),
        (1, _) => None,
        (_, Some((dscale, dbias))) => {
            validate_len(dscale, c, "aggregated dscale")?;
            validate_len(dbias, c, "aggregated dbias")?;
            Some((dscale, dbias))
        }
        (batches, None) => {
            return Err(invalid_args(format!(
                "num_batches = {batches} requires aggregated scale and bias gradients"
            )));
        }
    };

    let m = layout.reduce_size() as f64;
    for ch in 0..c {
        let mean = f64::from(saved_mean[ch]);
        let rstd = f64::from(saved_inv_std[ch]);

        let (dscale, dbias) = match aggregated {
            Some((agg_dscale, agg_dbias)) => (
                f64::from(agg_dscale[ch]) / num_batches as f64,
                f64::from(agg_dbias[ch]) / num_batches as f64,
            ),
            None => layout.channel(ch).fold((0.0, 0.0), |(ds, db), i| {
                let g = f64::from(dy[i]);
                (ds + g * (f64::from(x[i]) - mean) * rstd, db + g)
            }),
        };

        let k = f64::from(scale[ch]) * rstd;
        for i in layout.channel(ch) {
            let x_hat = (f64::from(x[i]) - mean) * rstd;
            out.dx[i] = (k * (f64::from(dy[i]) - (x_hat * dscale + dbias) / m)) as f32;
        }
        out.dscale[ch] = dscale as f32;
        out.dbias[ch] = dbias as f32;
    }
    Ok(())
}

// ── Batch statistics ───────────────────────────────────────────────

/// Per-channel biased mean and variance of `x`.
pub fn compute_batch_stats(x: &[f32], layout: &SpatialLayout) -> Result<(Vec<f64>, Vec<f64>)> {
    validate_input(x, layout)?;
    let count = layout.reduce_size() as f64;
    let mut mean = vec![0.0f64; layout.c];
    let mut var = vec![0.0f64; layout.c];
    for ch in 0..layout.c {
        let m = layout.channel(ch).map(|i| f64::from(x[i])).sum::<f64>() / count;
        let v = layout
            .channel(ch)
            .map(|i| {
                let d = f64::from(x[i]) - m;
                d * d
            })
            .sum::<f64>()
            / count;
        mean[ch] = m;
        var[ch] = v;
    }
    Ok((mean, var))
}

/// Per-channel `(Σx, Σx²)` of one batch, the unit that callers sum across
/// batches before a `num_batches > 1` training call.
pub fn channel_sums(x: &[f32], layout: &SpatialLayout) -> Result<(Vec<f32>, Vec<f32>)> {
    validate_input(x, layout)?;
    let mut sum = vec![0.0f32; layout.c];
    let mut sum_sq = vec![0.0f32; layout.c];
    for ch in 0..layout.c {
        let (s, sq) = layout.channel(ch).fold((0.0f64, 0.0f64), |(s, sq), i| {
            let v = f64::from(x[i]);
            (s + v, sq + v * v)
        });
        sum[ch] = s as f32;
        sum_sq[ch] = sq as f32;
    }
    Ok((sum, sum_sq))
}

fn moments_from_sums(sums: MomentSums<'_>, count: f64) -> (Vec<f64>, Vec<f64>) {
    sums.sum
        .iter()
        .zip(sums.sum_sq)
        .map(|(&s, &sq)| {
            let mean = f64::from(s) / count;
            let var = (f64::from(sq) / count - mean * mean).max(0.0);
            (mean, var)
        })
        .unzip()
}

// ── Internal helpers ───────────────────────────────────────────────

fn normalize_channel(
    x: &[f32],
    layout: &SpatialLayout,
    ch: usize,
    affine: Affine<'_>,
    mean: f64,
    inv_std: f64,
    y: &mut [f32],
) {
    let scale = f64::from(affine.scale[ch]);
    let bias = f64::from(affine.bias[ch]);
    for i in layout.channel(ch) {
        y[i] = (scale * (f64::from(x[i]) - mean) * inv_std + bias) as f32;
    }
}

fn validate_input(x: &[f32], layout: &SpatialLayout) -> Result<()> {
    if layout.c == 0 {
        return Err(invalid_args("channel count must be > 0"));
    }
    if layout.reduce_size() == 0 {
        return Err(invalid_args("input has no elements per channel"));
    }
    validate_len(x, layout.numel(), "x")
}

fn validate_eps(eps: f32) -> Result<()> {
    if !eps.is_finite() || eps < 0.0 {
        return Err(invalid_args("eps must be non-negative and finite"));
    }
    Ok(())
}

fn validate_momentum(momentum: f32) -> Result<()> {
    if !momentum.is_finite() || !(0.0..=1.0).contains(&momentum) {
        return Err(invalid_args("momentum must be in [0, 1] and finite"));
    }
    Ok(())
}

fn validate_affine(affine: Affine<'_>, c: usize) -> Result<()> {
    validate_len(affine.scale, c, "scale")?;
    validate_len(affine.bias, c, "bias")
}

fn validate_len(buf: &[f32], expected: usize, name: &str) -> Result<()> {
    if buf.len() != expected {
        return Err(invalid_args(format!("{name} length {} != expected {expected}", buf.len())));
    }
    Ok(())
}

// ── Tests ──────────────────────────────────────────────────────────
