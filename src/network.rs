//! The dual-headed policy/value network.
//!
//! A convolutional residual trunk is shared by a policy head producing one
//! logit per entry of the move space and a value head producing a tanh
//! squashed evaluation for the side to move.

use std::collections::HashMap;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Linear, VarBuilder, VarMap, conv2d, linear};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ChessNetError, Result},
    moves::{MOVE_PLANES, MOVE_SPACE},
    tensor::PLANES,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Width of the shared trunk.
    pub channels: usize,
    pub residual_blocks: usize,
    pub policy_channels: usize,
    pub value_hidden: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            channels: 128,
            residual_blocks: 6,
            policy_channels: 32,
            value_hidden: 256,
        }
    }
}

impl NetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 || self.policy_channels == 0 || self.value_hidden == 0 {
            return Err(ChessNetError::InvalidConfig(format!(
                "network layers must have a positive width: {self:?}"
            )));
        }
        Ok(())
    }
}

/// Everything a set of weights depends on. Stored in checkpoints and
/// compared on load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchitectureSignature {
    pub input_planes: usize,
    pub move_space: usize,
    pub net: NetConfig,
}

impl ArchitectureSignature {
    pub fn for_config(net: NetConfig) -> Self {
        Self {
            input_planes: PLANES,
            move_space: MOVE_SPACE,
            net,
        }
    }
}

#[derive(Debug, Clone)]
struct ResidualBlock {
    conv1: Conv2d,
    conv2: Conv2d,
}

impl ResidualBlock {
    fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = same_padding();
        Ok(Self {
            conv1: conv2d(channels, channels, 3, cfg, vb.pp("conv1"))?,
            conv2: conv2d(channels, channels, 3, cfg, vb.pp("conv2"))?,
        })
    }
}

impl Module for ResidualBlock {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let ys = self.conv1.forward(xs)?.relu()?;
        let ys = self.conv2.forward(&ys)?;
        ys.add(xs)?.relu()
    }
}

fn same_padding() -> Conv2dConfig {
    Conv2dConfig {
        padding: 1,
        ..Default::default()
    }
}

#[derive(Debug, Clone)]
pub struct DualHeadNet {
    config: NetConfig,
    input: Conv2d,
    blocks: Vec<ResidualBlock>,
    policy_conv: Conv2d,
    policy_out: Conv2d,
    value_conv: Conv2d,
    value_fc1: Linear,
    value_fc2: Linear,
}

impl DualHeadNet {
    pub fn new(config: NetConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let trunk = vb.pp("trunk");
        let input = conv2d(PLANES, config.channels, 3, same_padding(), trunk.pp("input"))?;
        let blocks = (0..config.residual_blocks)
            .map(|i| ResidualBlock::new(config.channels, trunk.pp(format!("block{i}"))))
            .collect::<Result<Vec<_>>>()?;

        let policy = vb.pp("policy");
        let policy_conv = conv2d(
            config.channels,
            config.policy_channels,
            1,
            Default::default(),
            policy.pp("conv"),
        )?;
        let policy_out = conv2d(
            config.policy_channels,
            MOVE_PLANES,
            1,
            Default::default(),
            policy.pp("out"),
        )?;

        let value = vb.pp("value");
        let value_conv = conv2d(config.channels, 1, 1, Default::default(), value.pp("conv"))?;
        let value_fc1 = linear(64, config.value_hidden, value.pp("fc1"))?;
        let value_fc2 = linear(config.value_hidden, 1, value.pp("fc2"))?;

        Ok(Self {
            config,
            input,
            blocks,
            policy_conv,
            policy_out,
            value_conv,
            value_fc1,
            value_fc2,
        })
    }

    /// Fresh, randomly initialised parameters registered in a new `VarMap`.
    pub fn trainable(config: NetConfig, device: &Device) -> Result<(VarMap, Self)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let net = Self::new(config, vb)?;
        Ok((varmap, net))
    }

    /// Network backed by constant tensors. Nothing can mutate its weights.
    pub fn frozen(config: NetConfig, tensors: HashMap<String, Tensor>, device: &Device) -> Result<Self> {
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        Self::new(config, vb)
    }

    pub fn config(&self) -> NetConfig {
        self.config
    }

    pub fn signature(&self) -> ArchitectureSignature {
        ArchitectureSignature::for_config(self.config)
    }

    /// `xs` is `[B, PLANES, 8, 8]`. Returns the policy logits `[B, MOVE_SPACE]`
    /// (in move-index order, illegal moves included) and the value `[B]`.
    pub fn forward(&self, xs: &Tensor) -> Result<(Tensor, Tensor)> {
        let mut trunk = self.input.forward(xs)?.relu()?;
        for block in &self.blocks {
            trunk = block.forward(&trunk)?;
        }

        // [B, 73, 8, 8] flattens to plane * 64 + rank * 8 + file
        let policy = self.policy_conv.forward(&trunk)?.relu()?;
        let logits = self.policy_out.forward(&policy)?.flatten_from(1)?;

        let value = self.value_conv.forward(&trunk)?.relu()?.flatten_from(1)?;
        let value = self.value_fc1.forward(&value)?.relu()?;
        let value = self.value_fc2.forward(&value)?.tanh()?.squeeze(1)?;

        Ok((logits, value))
    }
}

/// Detached copies of every variable, keyed by parameter name.
pub fn snapshot(varmap: &VarMap) -> Result<HashMap<String, Tensor>> {
    let vars = varmap.data().lock().unwrap_or_else(|e| e.into_inner());
    let mut tensors = HashMap::with_capacity(vars.len());
    for (name, var) in vars.iter() {
        tensors.insert(name.clone(), var.as_tensor().copy()?);
    }
    Ok(tensors)
}

/// Smallest useful shape, for fast tests.
#[cfg(test)]
pub(crate) fn tiny() -> NetConfig {
    NetConfig {
        channels: 8,
        residual_blocks: 1,
        policy_channels: 4,
        value_hidden: 16,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{encode_position, stack_boards, to_tensor};
    use shakmaty::Chess;

    fn start_batch(n: usize) -> Tensor {
        let board = encode_position(&Chess::default());
        let batch = stack_boards(std::iter::repeat_n(&board, n));
        to_tensor(&batch, &Device::Cpu).unwrap()
    }

    #[test]
    fn output_shapes_and_value_range() {
        let (_, net) = DualHeadNet::trainable(tiny(), &Device::Cpu).unwrap();
        let (logits, value) = net.forward(&start_batch(3)).unwrap();
        assert_eq!(logits.dims(), &[3, MOVE_SPACE]);
        assert_eq!(value.dims(), &[3]);
        for v in value.to_vec1::<f32>().unwrap() {
            assert!((-1.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn parameters_are_named_by_layer() {
        let (varmap, _) = DualHeadNet::trainable(tiny(), &Device::Cpu).unwrap();
        let names = snapshot(&varmap).unwrap();
        for name in [
            "trunk.input.weight",
            "trunk.block0.conv1.weight",
            "trunk.block0.conv2.bias",
            "policy.conv.weight",
            "policy.out.weight",
            "value.conv.weight",
            "value.fc1.weight",
            "value.fc2.bias",
        ] {
            assert!(names.contains_key(name), "missing {name}");
        }
        assert_eq!(names["policy.out.weight"].dims(), &[MOVE_PLANES, 4, 1, 1]);
    }

    #[test]
    fn frozen_copy_computes_the_same_function() {
        let (varmap, net) = DualHeadNet::trainable(tiny(), &Device::Cpu).unwrap();
        let frozen = DualHeadNet::frozen(tiny(), snapshot(&varmap).unwrap(), &Device::Cpu).unwrap();

        let xs = start_batch(2);
        let (l1, v1) = net.forward(&xs).unwrap();
        let (l2, v2) = frozen.forward(&xs).unwrap();
        assert_eq!(l1.to_vec2::<f32>().unwrap(), l2.to_vec2::<f32>().unwrap());
        assert_eq!(v1.to_vec1::<f32>().unwrap(), v2.to_vec1::<f32>().unwrap());
    }

    #[test]
    fn frozen_rejects_mismatched_weights() {
        let (varmap, _) = DualHeadNet::trainable(tiny(), &Device::Cpu).unwrap();
        let wider = NetConfig {
            channels: 16,
            ..tiny()
        };
        assert!(DualHeadNet::frozen(wider, snapshot(&varmap).unwrap(), &Device::Cpu).is_err());
    }

    #[test]
    fn signature_tracks_shape() {
        let sig = ArchitectureSignature::for_config(tiny());
        assert_eq!(sig.input_planes, PLANES);
        assert_eq!(sig.move_space, MOVE_SPACE);
        assert_ne!(sig, ArchitectureSignature::for_config(NetConfig::default()));
    }
}
