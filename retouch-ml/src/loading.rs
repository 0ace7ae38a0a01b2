use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::VarBuilder;

/// F16 on accelerators only; CPU kernels stay in f32.
pub fn dtype_for(device: &Device, use_f16: bool) -> DType {
    if use_f16 && !device.is_cpu() {
        DType::F16
    } else {
        DType::F32
    }
}

pub fn mmaped_safetensors(
    weights: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    for path in weights {
        anyhow::ensure!(path.exists(), "missing weights at {}", path.display());
    }
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(weights, dtype, device)? };
    Ok(vb)
}

pub fn pth(weights: &Path, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
    VarBuilder::from_pth(weights, dtype, device)
        .with_context(|| format!("failed to read checkpoint {}", weights.display()))
}

pub fn tokenizer(path: &Path) -> Result<tokenizers::Tokenizer> {
    tokenizers::Tokenizer::from_file(path)
        .map_err(|err| anyhow::anyhow!("failed to load tokenizer {}: {err}", path.display()))
}
