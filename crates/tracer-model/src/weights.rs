//! # Named weight loading
//!
//! Checkpoints are flat maps from dotted PyTorch parameter names to tensors.
//! [`WeightStore`] owns such a map and hands tensors out by name; every
//! module implements [`LoadWeights`] to pull its own parameters from it.
//!
//! Loading is partial: parameters without a checkpoint entry keep their
//! initial values, and checkpoint entries nothing asked for are reported as
//! unexpected. The classification head of a backbone checkpoint ends up
//! there.

use std::collections::{HashMap, HashSet};

use burn::{
    module::{Param, RunningState},
    nn::{conv::Conv2d, BatchNorm},
    prelude::*,
    tensor::TensorData,
};
use tracing::{info, warn};

use crate::error::{TracerError, TracerResult};

/// Joins a module prefix and a parameter name with a dot.
pub fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// What a load consumed and what it left behind, sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    /// Parameters the model asked for that the checkpoint lacks.
    pub missing: Vec<String>,
    /// Checkpoint entries no parameter asked for.
    pub unexpected: Vec<String>,
    /// Bookkeeping buffers that were recognised and ignored.
    pub skipped: Vec<String>,
}

/// A checkpoint in memory, keyed by parameter name.
#[derive(Debug, Default)]
pub struct WeightStore {
    tensors: HashMap<String, TensorData>,
    consumed: HashSet<String>,
    skipped: HashSet<String>,
    missing: Vec<String>,
}

impl WeightStore {
    pub fn new(tensors: HashMap<String, TensorData>) -> Self {
        Self {
            tensors,
            ..Default::default()
        }
    }

    /// Removes `prefix` from every key that starts with it, as left behind
    /// by data-parallel wrappers (`module.`).
    pub fn strip_prefix(mut self, prefix: &str) -> Self {
        self.tensors = self
            .tensors
            .into_iter()
            .map(|(key, value)| match key.strip_prefix(prefix) {
                Some(stripped) => (stripped.to_string(), value),
                None => (key, value),
            })
            .collect();
        self
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.tensors.contains_key(key)
    }

    /// Looks up `key` and checks it against `expected`. `None` records the
    /// key as missing.
    fn take<B: Backend, const D: usize>(
        &mut self,
        key: &str,
        expected: [usize; D],
        device: &Device<B>,
    ) -> TracerResult<Option<Tensor<B, D>>> {
        let Some(data) = self.tensors.get(key) else {
            self.missing.push(key.to_string());
            return Ok(None);
        };
        if data.shape != expected {
            return Err(TracerError::WeightShapeMismatch {
                key: key.to_string(),
                expected: expected.to_vec(),
                actual: data.shape.clone(),
            });
        }

        let tensor = Tensor::from_data(data.clone().convert::<B::FloatElem>(), device);
        self.consumed.insert(key.to_string());
        Ok(Some(tensor))
    }

    /// Replaces the value of a trainable parameter.
    pub fn param<B: Backend, const D: usize>(
        &mut self,
        key: &str,
        param: Param<Tensor<B, D>>,
    ) -> TracerResult<Param<Tensor<B, D>>> {
        let current = param.val();
        match self.take(key, current.dims(), &current.device())? {
            Some(tensor) => Ok(param.map(|_| tensor)),
            None => Ok(param),
        }
    }

    /// Replaces the value of a running statistic.
    pub fn running<B: Backend, const D: usize>(
        &mut self,
        key: &str,
        state: RunningState<Tensor<B, D>>,
    ) -> TracerResult<RunningState<Tensor<B, D>>> {
        let current = state.value();
        match self.take(key, current.dims(), &current.device())? {
            Some(tensor) => Ok(RunningState::new(tensor)),
            None => Ok(state),
        }
    }

    /// Marks a checkpoint entry as handled without loading it. Skipped
    /// entries never count as loaded.
    pub fn skip(&mut self, key: &str) {
        if self.tensors.contains_key(key) {
            self.skipped.insert(key.to_string());
        }
    }

    /// Closes the load and reports what was used.
    ///
    /// # Errors
    ///
    /// `NoMatchingWeights` if not a single parameter or running statistic
    /// was loaded.
    pub fn finish(self) -> TracerResult<LoadReport> {
        let mut loaded: Vec<String> = self.consumed.iter().cloned().collect();
        let mut skipped: Vec<String> = self.skipped.iter().cloned().collect();
        let mut unexpected: Vec<String> = self
            .tensors
            .keys()
            .filter(|key| !self.consumed.contains(*key) && !self.skipped.contains(*key))
            .cloned()
            .collect();
        let mut missing = self.missing;
        loaded.sort();
        skipped.sort();
        unexpected.sort();
        missing.sort();

        if loaded.is_empty() {
            return Err(TracerError::NoMatchingWeights {
                checkpoint_keys: self.tensors.len(),
            });
        }

        info!(
            loaded = loaded.len(),
            missing = missing.len(),
            unexpected = unexpected.len(),
            "checkpoint applied"
        );
        if !missing.is_empty() {
            warn!(keys = ?missing, "parameters missing from checkpoint");
        }
        if !unexpected.is_empty() {
            warn!(keys = ?unexpected, "unexpected checkpoint entries");
        }

        Ok(LoadReport {
            loaded,
            missing,
            unexpected,
            skipped,
        })
    }
}

/// Modules that can take their parameters from a [`WeightStore`].
pub trait LoadWeights: Sized {
    /// Loads every parameter below `prefix` and returns the updated module.
    fn load_weights(self, store: &mut WeightStore, prefix: &str) -> TracerResult<Self>;
}

impl<B: Backend> LoadWeights for Conv2d<B> {
    fn load_weights(mut self, store: &mut WeightStore, prefix: &str) -> TracerResult<Self> {
        self.weight = store.param(&join(prefix, "weight"), self.weight)?;
        self.bias = self
            .bias
            .map(|bias| store.param(&join(prefix, "bias"), bias))
            .transpose()?;
        Ok(self)
    }
}

impl<B: Backend> LoadWeights for BatchNorm<B, 2> {
    fn load_weights(mut self, store: &mut WeightStore, prefix: &str) -> TracerResult<Self> {
        self.gamma = store.param(&join(prefix, "weight"), self.gamma)?;
        self.beta = store.param(&join(prefix, "bias"), self.beta)?;
        self.running_mean = store.running(&join(prefix, "running_mean"), self.running_mean)?;
        self.running_var = store.running(&join(prefix, "running_var"), self.running_var)?;
        store.skip(&join(prefix, "num_batches_tracked"));
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use burn::nn::{conv::Conv2dConfig, BatchNormConfig};

    use super::*;
    use crate::tests::TestBackend;

    fn entry(key: &str, values: Vec<f32>, shape: Vec<usize>) -> (String, TensorData) {
        (key.to_string(), TensorData::new(values, shape))
    }

    #[test]
    fn conv_weights_are_loaded_by_name() {
        let device = Default::default();
        let conv = Conv2dConfig::new([1, 2], [1, 1]).init::<TestBackend>(&device);
        let mut store = WeightStore::new(HashMap::from([
            entry("layer.weight", vec![3.0, -1.0], vec![2, 1, 1, 1]),
            entry("layer.bias", vec![0.5, 0.25], vec![2]),
            entry("head.weight", vec![0.0], vec![1]),
        ]));

        let conv = conv.load_weights(&mut store, "layer").unwrap();
        let report = store.finish().unwrap();

        assert_eq!(
            conv.weight.val().into_data().to_vec::<f32>().unwrap(),
            vec![3.0, -1.0]
        );
        assert_eq!(report.loaded, vec!["layer.bias", "layer.weight"]);
        assert_eq!(report.unexpected, vec!["head.weight"]);
        assert!(report.missing.is_empty());
    }

    #[test]
    fn batch_norm_ignores_batch_counter() {
        let device = Default::default();
        let bn = BatchNormConfig::new(2).init::<TestBackend, 2>(&device);
        let mut store = WeightStore::new(HashMap::from([
            entry("bn.running_mean", vec![1.0, 2.0], vec![2]),
            ("bn.num_batches_tracked".to_string(), TensorData::new(vec![7i64], vec![1])),
        ]));

        let bn = bn.load_weights(&mut store, "bn").unwrap();
        let report = store.finish().unwrap();

        assert_eq!(
            bn.running_mean.value().into_data().to_vec::<f32>().unwrap(),
            vec![1.0, 2.0]
        );
        assert!(report.unexpected.is_empty());
        assert_eq!(report.loaded, vec!["bn.running_mean"]);
        assert_eq!(report.skipped, vec!["bn.num_batches_tracked"]);
        assert_eq!(report.missing, vec!["bn.bias", "bn.running_var", "bn.weight"]);
    }

    #[test]
    fn batch_counters_alone_do_not_count_as_a_match() {
        let device = Default::default();
        let bn = BatchNormConfig::new(2).init::<TestBackend, 2>(&device);
        let mut store = WeightStore::new(HashMap::from([(
            "bn.num_batches_tracked".to_string(),
            TensorData::new(vec![7i64], vec![1]),
        )]));

        let _bn = bn.load_weights(&mut store, "bn").unwrap();
        let err = store.finish().unwrap_err();

        assert!(matches!(
            err,
            TracerError::NoMatchingWeights { checkpoint_keys: 1 }
        ));
    }

    #[test]
    fn shape_mismatch_is_an_error() {
        let device = Default::default();
        let conv = Conv2dConfig::new([1, 2], [1, 1]).init::<TestBackend>(&device);
        let mut store = WeightStore::new(HashMap::from([entry(
            "weight",
            vec![1.0, 2.0, 3.0],
            vec![3, 1, 1, 1],
        )]));

        let err = conv.load_weights(&mut store, "").unwrap_err();

        assert!(matches!(err, TracerError::WeightShapeMismatch { .. }));
    }

    #[test]
    fn checkpoint_without_overlap_is_rejected() {
        let device = Default::default();
        let conv = Conv2dConfig::new([1, 2], [1, 1]).init::<TestBackend>(&device);
        let mut store = WeightStore::new(HashMap::from([
            entry("other.weight", vec![1.0], vec![1]),
            entry("other.bias", vec![1.0], vec![1]),
        ]));

        let _conv = conv.load_weights(&mut store, "layer").unwrap();
        let err = store.finish().unwrap_err();

        assert!(matches!(
            err,
            TracerError::NoMatchingWeights { checkpoint_keys: 2 }
        ));
    }

    #[test]
    fn data_parallel_prefix_is_stripped() {
        let store = WeightStore::new(HashMap::from([
            entry("module.rfb2.conv_res.conv.weight", vec![1.0], vec![1]),
            entry("agg.fc.weight", vec![1.0], vec![1]),
        ]))
        .strip_prefix("module.");

        assert!(store.contains("rfb2.conv_res.conv.weight"));
        assert!(store.contains("agg.fc.weight"));
    }
}
