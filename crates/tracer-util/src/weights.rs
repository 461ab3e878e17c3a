//! Reading checkpoints from disk into a [`WeightStore`], and Burn record
//! files for converted models.
//!
//! PyTorch pickles and safetensors files are read through `candle-core`,
//! converted to `TensorData` and applied by parameter name. Burn `.mpk`
//! records go through the regular recorder API.

use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::LazyLock,
};

use burn::{
    module::Module,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::{backend::Backend, TensorData},
};
use candle_core::{DType, Device};
use thiserror::Error;
use tracer_model::{LoadReport, LoadWeights, TracerError, WeightStore};
use tracing::info;

/// Prefix that `DataParallel` wrappers put in front of every key.
const DATA_PARALLEL_PREFIX: &str = "module.";

const RELEASE_URL: &str = "https://github.com/Karel911/TRACER/releases/download/v1.0";

/// Errors that can occur during model weight management operations.
#[derive(Debug, Error)]
pub enum WeightError {
    /// Checkpoint key not found in the registry
    #[error("unknown model '{model_name}' - available models: {available_models}")]
    UnknownModel {
        model_name: String,
        available_models: String,
    },

    /// File system errors
    #[error("file system error: {reason}")]
    FileSystemError { reason: String },

    /// Model loading errors
    #[error("failed to load model weights: {reason}")]
    ModelLoadError { reason: String },

    /// Record loading errors
    #[error("failed to load model record: {reason}")]
    RecordLoadError { reason: String },

    /// Record saving errors
    #[error("failed to save model record: {reason}")]
    RecordSaveError { reason: String },

    /// Unsupported file format
    #[error("unsupported weight file format: {format}")]
    UnsupportedFormat { format: String },

    /// The checkpoint was read but does not fit the model
    #[error(transparent)]
    Model(#[from] TracerError),
}

/// A published pretrained checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointSpec {
    /// Architecture index the checkpoint was trained with.
    pub arch: usize,
    pub url: String,
}

/// Pretrained checkpoints, keyed `TE-0` to `TE-7`.
static CHECKPOINTS: LazyLock<BTreeMap<String, CheckpointSpec>> = LazyLock::new(|| {
    (0..=7)
        .map(|arch| {
            (
                format!("TE-{arch}"),
                CheckpointSpec {
                    arch,
                    url: format!("{RELEASE_URL}/TRACER-Efficient-{arch}.pth"),
                },
            )
        })
        .collect()
});

/// Looks up a pretrained checkpoint by key.
pub fn checkpoint_spec(key: &str) -> Result<&'static CheckpointSpec, WeightError> {
    CHECKPOINTS
        .get(key)
        .ok_or_else(|| WeightError::UnknownModel {
            model_name: key.to_string(),
            available_models: available_checkpoints().join(", "),
        })
}

/// Download URL of a pretrained checkpoint.
pub fn checkpoint_url(key: &str) -> Result<&'static str, WeightError> {
    checkpoint_spec(key).map(|spec| spec.url.as_str())
}

pub fn available_checkpoints() -> Vec<&'static str> {
    CHECKPOINTS.keys().map(String::as_str).collect()
}

/// Supported weight file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightFormat {
    /// PyTorch pickle (.pth, .pt, .bin)
    PyTorch,
    /// SafeTensors format (.safetensors)
    SafeTensors,
    /// Burn named MessagePack record (.mpk)
    MessagePack,
}

impl WeightFormat {
    /// Determines the format from the file extension.
    pub fn from_path(path: &Path) -> Result<Self, WeightError> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default();

        match extension.to_lowercase().as_str() {
            "pth" | "pt" | "bin" => Ok(Self::PyTorch),
            "safetensors" => Ok(Self::SafeTensors),
            "mpk" => Ok(Self::MessagePack),
            other => Err(WeightError::UnsupportedFormat {
                format: other.to_string(),
            }),
        }
    }
}

fn to_tensor_data(tensor: &candle_core::Tensor) -> candle_core::Result<TensorData> {
    let shape = tensor.dims().to_vec();
    let values = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    Ok(TensorData::new(values, shape))
}

fn ensure_exists(path: &Path) -> Result<(), WeightError> {
    if path.exists() {
        Ok(())
    } else {
        Err(WeightError::FileSystemError {
            reason: format!("Weight file not found: {}", path.display()),
        })
    }
}

/// Reads a PyTorch or safetensors checkpoint into a [`WeightStore`], with
/// the `module.` prefix removed.
pub fn read_checkpoint(path: &Path) -> Result<WeightStore, WeightError> {
    ensure_exists(path)?;
    let format = WeightFormat::from_path(path)?;

    let tensors: Vec<(String, candle_core::Tensor)> = match format {
        WeightFormat::PyTorch => {
            candle_core::pickle::read_all(path).map_err(|e| WeightError::ModelLoadError {
                reason: format!("PyTorch checkpoint reading failed: {}", e),
            })?
        }
        WeightFormat::SafeTensors => candle_core::safetensors::load(path, &Device::Cpu)
            .map_err(|e| WeightError::ModelLoadError {
                reason: format!("Safetensors checkpoint reading failed: {}", e),
            })?
            .into_iter()
            .collect(),
        WeightFormat::MessagePack => {
            return Err(WeightError::UnsupportedFormat {
                format: "mpk records have no parameter names to match; use load_record"
                    .to_string(),
            })
        }
    };

    let mut data = HashMap::with_capacity(tensors.len());
    for (key, tensor) in tensors {
        let tensor = to_tensor_data(&tensor).map_err(|e| WeightError::ModelLoadError {
            reason: format!("Failed to convert '{}': {}", key, e),
        })?;
        data.insert(key, tensor);
    }
    info!(path = %path.display(), ?format, tensors = data.len(), "checkpoint read");

    Ok(WeightStore::new(data).strip_prefix(DATA_PARALLEL_PREFIX))
}

/// Applies a PyTorch or safetensors checkpoint to `model` by parameter name.
pub fn load_named<M: LoadWeights>(model: M, path: &Path) -> Result<(M, LoadReport), WeightError> {
    let mut store = read_checkpoint(path)?;
    let model = model.load_weights(&mut store, "")?;
    let report = store.finish()?;
    Ok((model, report))
}

/// Loads a Burn named MessagePack record.
pub fn load_record<B: Backend, M: Module<B>>(
    model: M,
    path: &Path,
    device: &B::Device,
) -> Result<M, WeightError> {
    ensure_exists(path)?;
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    model
        .load_file(path.to_path_buf(), &recorder, device)
        .map_err(|e| WeightError::RecordLoadError {
            reason: format!("MessagePack record loading failed: {}", e),
        })
}

/// Saves `model` as a Burn named MessagePack record. The recorder appends
/// the `.mpk` extension.
pub fn save_record<B: Backend, M: Module<B>>(model: M, path: &Path) -> Result<(), WeightError> {
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    model
        .save_file(path.to_path_buf(), &recorder)
        .map_err(|e| WeightError::RecordSaveError {
            reason: format!("MessagePack record saving failed: {}", e),
        })
}

/// Loads any supported checkpoint, dispatching on the file extension.
pub fn load_checkpoint<B, M>(model: M, path: &Path, device: &B::Device) -> Result<M, WeightError>
where
    B: Backend,
    M: Module<B> + LoadWeights,
{
    match WeightFormat::from_path(path)? {
        WeightFormat::MessagePack => load_record(model, path, device),
        WeightFormat::PyTorch | WeightFormat::SafeTensors => {
            load_named(model, path).map(|(model, _)| model)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use burn::{
        nn::conv::{Conv2d, Conv2dConfig},
        tensor::Tensor,
    };

    use super::*;
    use crate::tests::TestBackend;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("tracer-util-{}-{name}", std::process::id()))
    }

    fn conv() -> Conv2d<TestBackend> {
        Conv2dConfig::new([1, 2], [1, 1]).init(&Default::default())
    }

    #[test]
    fn format_follows_extension() {
        let cases = [
            ("model.pth", WeightFormat::PyTorch),
            ("model.PT", WeightFormat::PyTorch),
            ("model.bin", WeightFormat::PyTorch),
            ("model.safetensors", WeightFormat::SafeTensors),
            ("model.mpk", WeightFormat::MessagePack),
        ];
        for (name, expected) in cases {
            assert_eq!(WeightFormat::from_path(Path::new(name)).unwrap(), expected);
        }

        assert!(matches!(
            WeightFormat::from_path(Path::new("model.onnx")),
            Err(WeightError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn checkpoint_urls() {
        assert_eq!(
            checkpoint_url("TE-5").unwrap(),
            "https://github.com/Karel911/TRACER/releases/download/v1.0/TRACER-Efficient-5.pth"
        );
        assert_eq!(checkpoint_spec("TE-0").unwrap().arch, 0);
        assert_eq!(available_checkpoints().len(), 8);

        match checkpoint_url("TE-8") {
            Err(WeightError::UnknownModel {
                model_name,
                available_models,
            }) => {
                assert_eq!(model_name, "TE-8");
                assert!(available_models.contains("TE-7"));
            }
            _ => panic!("Expected UnknownModel error"),
        }
    }

    #[test]
    fn missing_file_is_reported() {
        let result = read_checkpoint(&temp_path("absent.pth"));

        assert!(matches!(result, Err(WeightError::FileSystemError { .. })));
    }

    #[test]
    fn safetensors_checkpoint_is_applied_by_name() {
        let path = temp_path("conv.safetensors");
        let device = Device::Cpu;
        let tensors = HashMap::from([
            (
                "module.weight".to_string(),
                candle_core::Tensor::from_vec(vec![2.0f32, -3.0], (2, 1, 1, 1), &device).unwrap(),
            ),
            (
                "module.bias".to_string(),
                candle_core::Tensor::from_vec(vec![0.5f32, 0.0], 2, &device).unwrap(),
            ),
            (
                "module.head.weight".to_string(),
                candle_core::Tensor::from_vec(vec![1.0f32], 1, &device).unwrap(),
            ),
        ]);
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let (conv, report) = load_named(conv(), &path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(
            conv.weight.val().into_data().to_vec::<f32>().unwrap(),
            vec![2.0, -3.0]
        );
        assert_eq!(report.loaded, vec!["bias", "weight"]);
        assert_eq!(report.unexpected, vec!["head.weight"]);
    }

    #[test]
    fn mpk_record_round_trip() {
        let device = Default::default();
        let path = temp_path("conv");
        let source = conv();
        let expected = source.weight.val().into_data().to_vec::<f32>().unwrap();

        save_record::<TestBackend, _>(source, &path).unwrap();
        let file = path.with_extension("mpk");
        let loaded = load_checkpoint::<TestBackend, _>(conv(), &file, &device).unwrap();
        std::fs::remove_file(&file).ok();

        let x = Tensor::<TestBackend, 4>::ones([1, 1, 1, 1], &device);
        assert_eq!(loaded.forward(x).dims(), [1, 2, 1, 1]);
        assert_eq!(
            loaded.weight.val().into_data().to_vec::<f32>().unwrap(),
            expected
        );
    }
}
