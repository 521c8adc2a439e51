//! Named latent storage.

use std::cell::Cell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Tensor name used inside latent safetensors files.
pub const LATENTS_TENSOR_NAME: &str = "latents";

/// Reference to a stored latent, as carried in module kwargs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatentsField {
    pub latents_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl LatentsField {
    pub fn new(latents_name: impl Into<String>) -> Self {
        Self {
            latents_name: latents_name.into(),
            seed: None,
        }
    }
}

/// Host storage the pipeline reads named latents from.
pub trait LatentStore {
    fn load(&self, name: &str) -> Result<Tensor>;
}

/// In-memory store counting its loads.
#[derive(Debug, Default)]
pub struct MemoryLatentStore {
    tensors: HashMap<String, Tensor>,
    loads: Cell<usize>,
}

impl MemoryLatentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    /// Number of successful loads so far.
    pub fn loads(&self) -> usize {
        self.loads.get()
    }
}

impl LatentStore for MemoryLatentStore {
    fn load(&self, name: &str) -> Result<Tensor> {
        let tensor = self
            .tensors
            .get(name)
            .cloned()
            .ok_or_else(|| Error::MissingInput(format!("latents '{name}' not found")))?;
        self.loads.set(self.loads.get() + 1);
        Ok(tensor)
    }
}

/// A directory of `<name>.safetensors` files, each holding a `latents` tensor.
#[derive(Debug, Clone)]
pub struct SafetensorsLatentStore {
    dir: PathBuf,
    device: Device,
}

impl SafetensorsLatentStore {
    pub fn new(dir: impl Into<PathBuf>, device: &Device) -> Self {
        Self {
            dir: dir.into(),
            device: device.clone(),
        }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.safetensors"))
    }

    pub fn save(&self, name: &str, tensor: &Tensor) -> Result<PathBuf> {
        let path = self.path_for(name);
        save_latents(tensor, &path)?;
        Ok(path)
    }
}

impl LatentStore for SafetensorsLatentStore {
    fn load(&self, name: &str) -> Result<Tensor> {
        let path = self.path_for(name);
        if !path.exists() {
            return Err(Error::MissingInput(format!("latents file {} not found", path.display())));
        }
        tracing::debug!(path = %path.display(), "loading latents");
        load_latents(&path, &self.device)
    }
}

/// Write a single latent tensor to a safetensors file.
pub fn save_latents(tensor: &Tensor, path: &Path) -> Result<()> {
    let tensors = HashMap::from([(LATENTS_TENSOR_NAME.to_string(), tensor.clone())]);
    candle::safetensors::save(&tensors, path)?;
    Ok(())
}

/// Read the latent tensor of a safetensors file.
pub fn load_latents(path: &Path, device: &Device) -> Result<Tensor> {
    let mut tensors = candle::safetensors::load(path, device)?;
    if let Some(tensor) = tensors.remove(LATENTS_TENSOR_NAME) {
        return Ok(tensor);
    }
    if tensors.len() == 1 {
        if let Some((_, tensor)) = tensors.into_iter().next() {
            return Ok(tensor);
        }
    }
    Err(Error::MissingInput(format!(
        "{} has no '{LATENTS_TENSOR_NAME}' tensor",
        path.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::DType;

    #[test]
    fn test_memory_store() -> Result<()> {
        let mut store = MemoryLatentStore::new();
        store.insert("a", Tensor::zeros((1, 4, 2, 2), DType::F32, &Device::Cpu)?);
        assert_eq!(store.load("a")?.dims(), &[1, 4, 2, 2]);
        assert!(matches!(store.load("b"), Err(Error::MissingInput(_))));
        assert_eq!(store.loads(), 1);
        Ok(())
    }

    #[test]
    fn test_safetensors_store_roundtrip() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("modular-denoise-store-{}", std::process::id()));
        std::fs::create_dir_all(&dir).map_err(|e| Error::config(e.to_string()))?;
        let store = SafetensorsLatentStore::new(&dir, &Device::Cpu);

        let latents = Tensor::arange(0f32, 16., &Device::Cpu)?.reshape((1, 4, 2, 2))?;
        store.save("init", &latents)?;
        let loaded = store.load("init")?;
        assert_eq!(loaded.dims(), latents.dims());
        assert_eq!(
            loaded.flatten_all()?.to_vec1::<f32>()?,
            latents.flatten_all()?.to_vec1::<f32>()?
        );
        assert!(store.load("missing").is_err());

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn test_latents_field_serde() -> Result<()> {
        let field: LatentsField = serde_json::from_str(r#"{"latents_name": "noise-1"}"#)?;
        assert_eq!(field, LatentsField::new("noise-1"));
        Ok(())
    }
}
