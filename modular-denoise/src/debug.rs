//! Tensor debugging utilities.
//!
//! Statistics are logged at `debug` level under the `modular_denoise::debug` target, so they can
//! be enabled with `RUST_LOG=modular_denoise::debug=debug`.

use candle::{DType, Tensor};

use crate::{Error, Result};

/// `(mean, std, min, max)` of a tensor.
pub fn tensor_stats(t: &Tensor) -> Result<(f32, f32, f32, f32)> {
    let t_f32 = t.to_dtype(DType::F32)?.flatten_all()?;
    let mean = t_f32.mean_all()?;
    let diff = t_f32.broadcast_sub(&mean)?;
    let var = diff.sqr()?.mean_all()?.to_scalar::<f32>()?;
    let min = t_f32.min(0)?.to_scalar::<f32>()?;
    let max = t_f32.max(0)?.to_scalar::<f32>()?;
    Ok((mean.to_scalar::<f32>()?, var.sqrt(), min, max))
}

/// Log tensor statistics when debug logging is enabled for this module.
pub fn debug_tensor(name: &str, t: &Tensor) {
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return;
    }
    match tensor_stats(t) {
        Ok((mean, std, min, max)) => tracing::debug!(
            "{name}: shape={:?}, mean={mean:.6}, std={std:.6}, min={min:.6}, max={max:.6}",
            t.dims()
        ),
        Err(e) => tracing::debug!("{name}: shape={:?}, stats error: {e}", t.dims()),
    }
}

/// Fail if the tensor holds a NaN or an infinity.
pub fn ensure_finite(name: &str, t: &Tensor) -> Result<()> {
    let (mean, std, min, max) = tensor_stats(t)?;
    if [mean, std, min, max].iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(Error::NonFinite {
            name: name.to_string(),
            summary: format!("min={min}, max={max}, mean={mean}"),
        })
    }
}
