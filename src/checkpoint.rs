//! Checkpoint files.
//!
//! A checkpoint is a single safetensors file. Parameters are stored as
//! `model.<name>`, Adam moments as `adam.m.<name>` / `adam.v.<name>`, and
//! the header metadata carries the format tag, format version,
//! architecture signature, progress counters and scalar optimizer state
//! (the last three as JSON).

use std::{
    collections::HashMap,
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

use candle_core::{Device, Tensor, safetensors::Load};
use candle_nn::VarMap;
use safetensors::{Dtype, SafeTensors};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ChessNetError, Result},
    network::{ArchitectureSignature, DualHeadNet, NetConfig, snapshot},
    optim::{Adam, AdamState},
};

pub const FORMAT: &str = "chessnet";
pub const FORMAT_VERSION: &str = "1";

const MODEL_PREFIX: &str = "model.";
const MOMENT_PREFIXES: [&str; 2] = ["adam.m.", "adam.v."];

/// Training progress at the time a checkpoint was written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    /// Epoch being trained (0-based). An epoch-boundary checkpoint records
    /// the next epoch with `items_in_epoch == 0`.
    pub epoch: usize,
    /// Optimizer steps taken so far.
    pub step: u64,
    /// Dataset items of `epoch` already consumed.
    pub items_in_epoch: usize,
}

/// A checkpoint read back from disk, validated against this build.
#[derive(Debug)]
pub struct Checkpoint {
    path: PathBuf,
    pub signature: ArchitectureSignature,
    pub counters: Counters,
    pub optimizer: Option<AdamState>,
    tensors: HashMap<String, Tensor>,
}

/// Write a checkpoint to `path`, replacing any existing file atomically.
pub fn save(
    path: &Path,
    signature: ArchitectureSignature,
    counters: Counters,
    varmap: &VarMap,
    optimizer: Option<&Adam>,
) -> Result<()> {
    let mut named: Vec<(String, Tensor)> = snapshot(varmap)?
        .into_iter()
        .map(|(name, t)| (format!("{MODEL_PREFIX}{name}"), t))
        .collect();
    if let Some(adam) = optimizer {
        named.extend(adam.moment_tensors()?);
    }

    let mut metadata = HashMap::new();
    metadata.insert("format".to_string(), FORMAT.to_string());
    metadata.insert("version".to_string(), FORMAT_VERSION.to_string());
    metadata.insert("signature".to_string(), serde_json::to_string(&signature)?);
    metadata.insert("counters".to_string(), serde_json::to_string(&counters)?);
    if let Some(adam) = optimizer {
        metadata.insert("optimizer".to_string(), serde_json::to_string(&adam.state())?);
    }

    let bytes = safetensors::serialize(named.iter().map(|(name, t)| (name.as_str(), t)), Some(metadata))?;

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("safetensors.tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    log::info!("wrote checkpoint {} (step {})", path.display(), counters.step);
    Ok(())
}

/// Read a checkpoint and check that it was written by a compatible build:
/// same format version, same input and move encodings, and a full set of
/// correctly shaped parameters for the recorded network shape.
pub fn load(path: &Path, device: &Device) -> Result<Checkpoint> {
    let incompatible = |reason: String| ChessNetError::IncompatibleCheckpoint {
        path: path.to_path_buf(),
        reason,
    };

    let bytes = fs::read(path)?;
    let (_, header) =
        SafeTensors::read_metadata(&bytes).map_err(|e| incompatible(format!("unreadable header: {e}")))?;
    let metadata = header.metadata().clone().unwrap_or_default();
    let field = |key: &str| {
        metadata
            .get(key)
            .ok_or_else(|| incompatible(format!("missing `{key}` metadata")))
    };

    if field("format")? != FORMAT {
        return Err(incompatible(format!("not a {FORMAT} checkpoint")));
    }
    let version = field("version")?;
    if version != FORMAT_VERSION {
        return Err(incompatible(format!(
            "format version {version}, expected {FORMAT_VERSION}"
        )));
    }

    let signature: ArchitectureSignature = serde_json::from_str(field("signature")?)
        .map_err(|e| incompatible(format!("bad signature: {e}")))?;
    let current = ArchitectureSignature::for_config(signature.net);
    if signature != current {
        return Err(incompatible(format!(
            "encoded for {} planes and {} moves, this build uses {} and {}",
            signature.input_planes, signature.move_space, current.input_planes, current.move_space
        )));
    }
    let counters: Counters = serde_json::from_str(field("counters")?)
        .map_err(|e| incompatible(format!("bad counters: {e}")))?;
    let optimizer = match metadata.get("optimizer") {
        Some(json) => Some(
            serde_json::from_str(json).map_err(|e| incompatible(format!("bad optimizer state: {e}")))?,
        ),
        None => None,
    };

    let st = SafeTensors::deserialize(&bytes).map_err(|e| incompatible(format!("unreadable tensors: {e}")))?;
    let mut tensors = HashMap::new();
    for (name, view) in st.tensors() {
        if view.dtype() != Dtype::F32 {
            return Err(incompatible(format!("tensor {name} has dtype {:?}", view.dtype())));
        }
        tensors.insert(name, view.load(device)?);
    }

    let checkpoint = Checkpoint {
        path: path.to_path_buf(),
        signature,
        counters,
        optimizer,
        tensors,
    };
    checkpoint.check_parameters()?;
    Ok(checkpoint)
}

impl Checkpoint {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn net_config(&self) -> NetConfig {
        self.signature.net
    }

    fn incompatible(&self, reason: String) -> ChessNetError {
        ChessNetError::IncompatibleCheckpoint {
            path: self.path.clone(),
            reason,
        }
    }

    /// Every parameter of the recorded network shape must be present with
    /// its exact dims, and so must both Adam moments when optimizer state
    /// was saved.
    fn check_parameters(&self) -> Result<()> {
        let (reference, _) = DualHeadNet::trainable(self.signature.net, &Device::Cpu)?;
        let vars = reference.data().lock().unwrap_or_else(|e| e.into_inner());
        let mut prefixes = vec![MODEL_PREFIX];
        if self.optimizer.is_some() {
            prefixes.extend(MOMENT_PREFIXES);
        }
        for (name, var) in vars.iter() {
            for prefix in &prefixes {
                let key = format!("{prefix}{name}");
                match self.tensors.get(&key) {
                    None => return Err(self.incompatible(format!("missing tensor {key}"))),
                    Some(t) if t.dims() != var.dims() => {
                        return Err(self.incompatible(format!(
                            "tensor {key} has shape {:?}, expected {:?}",
                            t.dims(),
                            var.dims()
                        )));
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }

    /// Parameters keyed by their name inside the network.
    pub fn parameters(&self) -> HashMap<String, Tensor> {
        self.tensors
            .iter()
            .filter_map(|(k, t)| k.strip_prefix(MODEL_PREFIX).map(|n| (n.to_string(), t.clone())))
            .collect()
    }

    /// A network over constant copies of the stored parameters.
    pub fn frozen_network(&self, device: &Device) -> Result<DualHeadNet> {
        DualHeadNet::frozen(self.signature.net, self.parameters(), device)
    }

    /// Fail unless the checkpoint was written for `expected`.
    pub fn require_signature(&self, expected: &ArchitectureSignature) -> Result<()> {
        if &self.signature != expected {
            return Err(self.incompatible(format!(
                "network shape {:?} does not match configured {:?}",
                self.signature.net, expected.net
            )));
        }
        Ok(())
    }

    /// Overwrite the variables of `varmap` with the stored parameters.
    pub fn restore_parameters(&self, varmap: &VarMap) -> Result<()> {
        let vars = varmap.data().lock().unwrap_or_else(|e| e.into_inner());
        for (name, var) in vars.iter() {
            let key = format!("{MODEL_PREFIX}{name}");
            let stored = self
                .tensors
                .get(&key)
                .ok_or_else(|| self.incompatible(format!("missing tensor {key}")))?;
            var.set(&stored.to_device(var.device())?)?;
        }
        Ok(())
    }

    /// Restore moments, step count and hyper-parameters into `adam`.
    pub fn restore_optimizer(&self, adam: &mut Adam) -> Result<()> {
        let state = self
            .optimizer
            .ok_or_else(|| self.incompatible("no optimizer state".to_string()))?;
        for (name, m, v) in adam.moments() {
            for (prefix, var) in MOMENT_PREFIXES.into_iter().zip([m, v]) {
                let key = format!("{prefix}{name}");
                let stored = self
                    .tensors
                    .get(&key)
                    .ok_or_else(|| self.incompatible(format!("missing tensor {key}")))?;
                var.set(&stored.to_device(var.device())?)?;
            }
        }
        adam.set_state(state);
        Ok(())
    }
}
