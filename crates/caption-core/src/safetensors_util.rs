use anyhow::{Context, Result};
use memmap2::MmapOptions;
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use std::fs::File;
use std::path::Path;
use tch::{nn, Device, Kind, Tensor};

/// Copies every tensor found in `path` into the matching variable of `vs`.
/// Returns the number of variables that were loaded.
pub fn load_safetensors<P: AsRef<Path>>(vs: &mut nn::VarStore, path: P) -> Result<usize> {
    load_safetensors_with_prefix(vs, path, "")
}

/// Like [`load_safetensors`], restricted to tensors whose name starts with `prefix`.
pub fn load_safetensors_with_prefix<P: AsRef<Path>>(vs: &mut nn::VarStore, path: P, prefix: &str) -> Result<usize> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("Failed to open weights {:?}", path))?;
    let buffer = unsafe { MmapOptions::new().map(&file)? };
    let tensors = SafeTensors::deserialize(&buffer)?;

    let mut variables = vs.variables();
    let device = vs.device();
    let mut loaded = 0;

    for (name, view) in tensors.tensors() {
        if !name.starts_with(prefix) {
            log::debug!("Skipping tensor {} outside {:?}", name, prefix);
            continue;
        }
        if let Some(var) = variables.get_mut(&name) {
            let shape: Vec<i64> = view.shape().iter().map(|&x| x as i64).collect();
            let kind = match view.dtype() {
                Dtype::F32 => Kind::Float,
                Dtype::F16 => Kind::Half,
                Dtype::BF16 => Kind::BFloat16,
                Dtype::I64 => Kind::Int64,
                _ => return Err(anyhow::anyhow!("Unsupported dtype: {:?}", view.dtype())),
            };

            let data = view.data();
            let tch_tensor = Tensor::from_data_size(data, &shape, kind).to_device(device);

            tch::no_grad(|| {
                var.copy_(&tch_tensor);
            });
            log::debug!("Loaded tensor: {}", name);
            loaded += 1;
        } else {
            log::warn!("Tensor {} found in safetensors but not in model", name);
        }
    }

    Ok(loaded)
}

/// Writes every variable of `vs` to a safetensors file. Floating point
/// variables are stored as F32, integer ones as I64.
pub fn save_safetensors<P: AsRef<Path>>(vs: &nn::VarStore, path: P) -> Result<()> {
    let mut buffers: Vec<(String, Dtype, Vec<usize>, Vec<u8>)> = Vec::new();

    for (name, tensor) in vs.variables() {
        let tensor = tensor.detach().to_device(Device::Cpu).contiguous();
        let shape: Vec<usize> = tensor.size().iter().map(|&d| d as usize).collect();
        let flat = tensor.flatten(0, -1);

        let (dtype, bytes): (Dtype, Vec<u8>) = match tensor.kind() {
            Kind::Int64 => {
                let values = Vec::<i64>::try_from(&flat)?;
                (Dtype::I64, values.iter().flat_map(|v| v.to_le_bytes()).collect())
            }
            _ => {
                let values = Vec::<f32>::try_from(&flat.to_kind(Kind::Float))?;
                (Dtype::F32, values.iter().flat_map(|v| v.to_le_bytes()).collect())
            }
        };
        buffers.push((name, dtype, shape, bytes));
    }

    let views = buffers
        .iter()
        .map(|(name, dtype, shape, bytes)| {
            TensorView::new(*dtype, shape.clone(), bytes).map(|view| (name.clone(), view))
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;

    safetensors::tensor::serialize_to_file(views, &None, path.as_ref())
        .with_context(|| format!("Failed to write weights {:?}", path.as_ref()))?;
    Ok(())
}

/// In-memory copy of every variable, used to restore the best parameters.
pub fn snapshot(vs: &nn::VarStore) -> Vec<(String, Tensor)> {
    vs.variables()
        .into_iter()
        .map(|(name, tensor)| (name, tensor.detach().copy()))
        .collect()
}

pub fn restore(vs: &mut nn::VarStore, snapshot: &[(String, Tensor)]) -> Result<()> {
    let mut variables = vs.variables();
    tch::no_grad(|| {
        for (name, saved) in snapshot {
            let var = variables
                .get_mut(name)
                .ok_or_else(|| anyhow::anyhow!("Variable {} missing from model", name))?;
            var.copy_(saved);
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_vars() -> nn::VarStore {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let _ = root.var("a", &[2, 3], nn::Init::Randn { mean: 0.0, stdev: 1.0 });
        let _ = root.var("b", &[4], nn::Init::Const(0.5));
        vs
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> f64 {
        (a - b).abs().max().double_value(&[])
    }

    #[test]
    fn saved_weights_load_into_fresh_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");

        let vs = store_with_vars();
        save_safetensors(&vs, &path).unwrap();

        let mut fresh = store_with_vars();
        let loaded = load_safetensors(&mut fresh, &path).unwrap();
        assert_eq!(loaded, 2);

        let original = vs.variables();
        for (name, tensor) in fresh.variables() {
            assert!(max_diff(&tensor, &original[&name]) < 1e-7);
        }
    }

    #[test]
    fn prefix_limits_which_tensors_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");
        save_safetensors(&store_with_vars(), &path).unwrap();

        let mut fresh = store_with_vars();
        let a_before = fresh.variables()["a"].copy();
        assert_eq!(load_safetensors_with_prefix(&mut fresh, &path, "b").unwrap(), 1);
        assert_eq!(load_safetensors_with_prefix(&mut fresh, &path, "cnn.").unwrap(), 0);
        assert!(max_diff(&fresh.variables()["a"], &a_before) < 1e-9);
    }

    #[test]
    fn snapshot_restores_previous_values() {
        let mut vs = store_with_vars();
        let saved = snapshot(&vs);

        tch::no_grad(|| {
            for (_, mut t) in vs.variables() {
                let _ = t.fill_(9.0);
            }
        });
        restore(&mut vs, &saved).unwrap();

        let vars = vs.variables();
        for (name, t) in &saved {
            assert!(max_diff(&vars[name], t) < 1e-7);
        }
    }
}
