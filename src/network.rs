// Intent classifier network.
//
// The Topology list is the single source of truth: the builder walks it to
// instantiate layers, and the codec walks it (through `weight_specs`) to
// lay out the weight blob. Build order and write order cannot diverge.
//
// The recurrent cells and the batch-norm layer are assembled by hand from
// basic ops; everything stays addressable by name in the VarMap so the
// codec can pack and restore weights byte-for-byte.

use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{embedding, linear, Dropout, Embedding, Init, Linear, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::vectorizer::SEQUENCE_LEN;

const EMBED_DIM: usize = 64;
const GRU_UNITS: usize = 32;
const DENSE1_UNITS: usize = 128;
const DENSE2_UNITS: usize = 64;
const BATCH_NORM_EPS: f64 = 1e-3;
const BATCH_NORM_MOMENTUM: f32 = 0.99;

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Relu,
    Softmax,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayerSpec {
    Embedding {
        input_dim: usize,
        output_dim: usize,
        input_length: usize,
    },
    BidirectionalGru {
        units: usize,
    },
    GlobalAveragePooling,
    Dense {
        units: usize,
        activation: Activation,
    },
    Dropout {
        rate: f32,
    },
    BatchNorm {
        features: usize,
    },
}

/// One entry of the weight manifest: a named array, its shape, its dtype.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: String,
}

impl WeightSpec {
    fn new(name: String, shape: Vec<usize>) -> Self {
        Self {
            name,
            shape,
            dtype: "f32".to_string(),
        }
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub layers: Vec<LayerSpec>,
}

impl Topology {
    /// The fixed network shape. Only the embedding rows and the output
    /// width depend on the data; everything else is constant.
    pub fn for_model(vocab_size: usize, intent_count: usize) -> Self {
        Self {
            layers: vec![
                LayerSpec::Embedding {
                    input_dim: vocab_size + 1,
                    output_dim: EMBED_DIM,
                    input_length: SEQUENCE_LEN,
                },
                LayerSpec::BidirectionalGru { units: GRU_UNITS },
                LayerSpec::GlobalAveragePooling,
                LayerSpec::Dense {
                    units: DENSE1_UNITS,
                    activation: Activation::Relu,
                },
                LayerSpec::Dropout { rate: 0.3 },
                LayerSpec::Dense {
                    units: DENSE2_UNITS,
                    activation: Activation::Relu,
                },
                LayerSpec::Dropout { rate: 0.2 },
                LayerSpec::BatchNorm {
                    features: DENSE2_UNITS,
                },
                LayerSpec::Dense {
                    units: intent_count,
                    activation: Activation::Softmax,
                },
            ],
        }
    }

    /// Weight manifest in instantiation order. The walk tracks the running
    /// feature width so each dense layer knows its input dimension.
    pub fn weight_specs(&self) -> Vec<WeightSpec> {
        let mut specs = Vec::new();
        let mut width = 0usize;
        let mut dense_idx = 0usize;
        for layer in &self.layers {
            match layer {
                LayerSpec::Embedding {
                    input_dim,
                    output_dim,
                    ..
                } => {
                    specs.push(WeightSpec::new(
                        "embedding.weight".to_string(),
                        vec![*input_dim, *output_dim],
                    ));
                    width = *output_dim;
                }
                LayerSpec::BidirectionalGru { units } => {
                    for dir in ["fwd", "bwd"] {
                        specs.push(WeightSpec::new(
                            format!("rnn.{dir}.ih.weight"),
                            vec![3 * units, width],
                        ));
                        specs.push(WeightSpec::new(format!("rnn.{dir}.ih.bias"), vec![3 * units]));
                        specs.push(WeightSpec::new(
                            format!("rnn.{dir}.hh.weight"),
                            vec![3 * units, *units],
                        ));
                        specs.push(WeightSpec::new(format!("rnn.{dir}.hh.bias"), vec![3 * units]));
                    }
                    width = 2 * units;
                }
                LayerSpec::GlobalAveragePooling | LayerSpec::Dropout { .. } => {}
                LayerSpec::Dense { units, activation } => {
                    let prefix = if *activation == Activation::Softmax {
                        "output".to_string()
                    } else {
                        dense_idx += 1;
                        format!("dense{dense_idx}")
                    };
                    specs.push(WeightSpec::new(
                        format!("{prefix}.weight"),
                        vec![*units, width],
                    ));
                    specs.push(WeightSpec::new(format!("{prefix}.bias"), vec![*units]));
                    width = *units;
                }
                LayerSpec::BatchNorm { features } => {
                    for suffix in ["weight", "bias", "running_mean", "running_var"] {
                        specs.push(WeightSpec::new(
                            format!("batch_norm.{suffix}"),
                            vec![*features],
                        ));
                    }
                }
            }
        }
        specs
    }
}

// ---------------------------------------------------------------------------
// GRU cell (hand-rolled, 3x-units gate layout)
// ---------------------------------------------------------------------------

struct GruCell {
    ih: Linear,
    hh: Linear,
    units: usize,
}

impl GruCell {
    fn new(input_dim: usize, units: usize, vb: VarBuilder) -> Result<Self, EngineError> {
        Ok(Self {
            ih: linear(input_dim, 3 * units, vb.pp("ih"))?,
            hh: linear(units, 3 * units, vb.pp("hh"))?,
            units,
        })
    }

    // Gate order: reset, update, candidate.
    fn step(&self, x: &Tensor, h: &Tensor) -> Result<Tensor, EngineError> {
        let gx = self.ih.forward(x)?;
        let gh = self.hh.forward(h)?;

        let rx = gx.narrow(1, 0, self.units)?;
        let zx = gx.narrow(1, self.units, self.units)?;
        let nx = gx.narrow(1, 2 * self.units, self.units)?;
        let rh = gh.narrow(1, 0, self.units)?;
        let zh = gh.narrow(1, self.units, self.units)?;
        let nh = gh.narrow(1, 2 * self.units, self.units)?;

        let r = candle_nn::ops::sigmoid(&(rx + rh)?)?;
        let z = candle_nn::ops::sigmoid(&(zx + zh)?)?;
        let n = (nx + (r * nh)?)?.tanh()?;

        // h' = n + z * (h - n)
        (((h - &n)? * z)? + n).map_err(Into::into)
    }
}

struct BiGru {
    fwd: GruCell,
    bwd: GruCell,
}

impl BiGru {
    fn new(input_dim: usize, units: usize, vb: VarBuilder) -> Result<Self, EngineError> {
        Ok(Self {
            fwd: GruCell::new(input_dim, units, vb.pp("fwd"))?,
            bwd: GruCell::new(input_dim, units, vb.pp("bwd"))?,
        })
    }

    /// (batch, seq, input_dim) -> (batch, seq, 2 * units); every position
    /// carries both-direction context, the sequence is not collapsed.
    fn forward(&self, x: &Tensor) -> Result<Tensor, EngineError> {
        let (batch, seq, _dim) = x.dims3()?;
        let device = x.device();

        let mut h = Tensor::zeros((batch, self.fwd.units), DType::F32, device)?;
        let mut fwd_states = Vec::with_capacity(seq);
        for t in 0..seq {
            let xt = x.narrow(1, t, 1)?.squeeze(1)?;
            h = self.fwd.step(&xt, &h)?;
            fwd_states.push(h.clone());
        }

        let mut h = Tensor::zeros((batch, self.bwd.units), DType::F32, device)?;
        let mut bwd_states = Vec::with_capacity(seq);
        for t in (0..seq).rev() {
            let xt = x.narrow(1, t, 1)?.squeeze(1)?;
            h = self.bwd.step(&xt, &h)?;
            bwd_states.push(h.clone());
        }
        bwd_states.reverse();

        let fwd_seq = Tensor::stack(&fwd_states, 1)?;
        let bwd_seq = Tensor::stack(&bwd_states, 1)?;
        Tensor::cat(&[&fwd_seq, &bwd_seq], 2).map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// Batch norm (hand-rolled so running stats live in the VarMap)
// ---------------------------------------------------------------------------

struct BatchNorm1d {
    gamma: Tensor,
    beta: Tensor,
    running_mean: Var,
    running_var: Var,
}

impl BatchNorm1d {
    fn new(
        features: usize,
        varmap: &VarMap,
        vb: VarBuilder,
        path: &str,
    ) -> Result<Self, EngineError> {
        let gamma = vb.get_with_hints(features, "weight", Init::Const(1.0))?;
        let beta = vb.get_with_hints(features, "bias", Init::Const(0.0))?;
        let _ = vb.get_with_hints(features, "running_mean", Init::Const(0.0))?;
        let _ = vb.get_with_hints(features, "running_var", Init::Const(1.0))?;
        Ok(Self {
            gamma,
            beta,
            running_mean: lookup_var(varmap, &format!("{path}.running_mean"))?,
            running_var: lookup_var(varmap, &format!("{path}.running_var"))?,
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor, EngineError> {
        let normed = if train {
            let mean = x.mean_keepdim(0)?;
            let centered = x.broadcast_sub(&mean)?;
            let variance = centered.sqr()?.mean_keepdim(0)?;
            let denom = (&variance + BATCH_NORM_EPS)?.sqrt()?;
            self.update_running(&mean.squeeze(0)?, &variance.squeeze(0)?)?;
            centered.broadcast_div(&denom)?
        } else {
            let centered = x.broadcast_sub(self.running_mean.as_tensor())?;
            let denom = (self.running_var.as_tensor() + BATCH_NORM_EPS)?.sqrt()?;
            centered.broadcast_div(&denom)?
        };
        normed
            .broadcast_mul(&self.gamma)?
            .broadcast_add(&self.beta)
            .map_err(Into::into)
    }

    fn update_running(&self, batch_mean: &Tensor, batch_var: &Tensor) -> Result<(), EngineError> {
        let bm = batch_mean.to_vec1::<f32>()?;
        let bv = batch_var.to_vec1::<f32>()?;
        let mut rm = self.running_mean.as_tensor().to_vec1::<f32>()?;
        let mut rv = self.running_var.as_tensor().to_vec1::<f32>()?;
        let momentum = BATCH_NORM_MOMENTUM;
        for i in 0..rm.len() {
            rm[i] = momentum * rm[i] + (1.0 - momentum) * bm[i];
            rv[i] = momentum * rv[i] + (1.0 - momentum) * bv[i];
        }
        let features = rm.len();
        let device = batch_mean.device();
        self.running_mean
            .set(&Tensor::from_vec(rm, features, device)?)?;
        self.running_var
            .set(&Tensor::from_vec(rv, features, device)?)?;
        Ok(())
    }
}

fn lookup_var(varmap: &VarMap, name: &str) -> Result<Var, EngineError> {
    varmap
        .data()
        .lock()
        .unwrap()
        .get(name)
        .cloned()
        .ok_or_else(|| EngineError::InvalidBundle(format!("variable '{name}' was never registered")))
}

// ---------------------------------------------------------------------------
// IntentNet
// ---------------------------------------------------------------------------

pub struct IntentNet {
    embedding: Embedding,
    rnn: BiGru,
    dense1: Linear,
    drop1: Dropout,
    dense2: Linear,
    drop2: Dropout,
    norm: BatchNorm1d,
    output: Linear,
}

impl IntentNet {
    /// Instantiate the network by walking the topology list. The same walk
    /// order produces `Topology::weight_specs`, so the manifest always
    /// matches what lands in the VarMap.
    pub fn build(
        topology: &Topology,
        varmap: &VarMap,
        device: &Device,
    ) -> Result<Self, EngineError> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, device);

        let mut embedding_layer = None;
        let mut rnn = None;
        let mut dense = Vec::new();
        let mut dropouts = Vec::new();
        let mut norm = None;
        let mut output = None;
        let mut width = 0usize;
        let mut dense_idx = 0usize;

        for layer in &topology.layers {
            match layer {
                LayerSpec::Embedding {
                    input_dim,
                    output_dim,
                    ..
                } => {
                    embedding_layer = Some(embedding(*input_dim, *output_dim, vb.pp("embedding"))?);
                    width = *output_dim;
                }
                LayerSpec::BidirectionalGru { units } => {
                    rnn = Some(BiGru::new(width, *units, vb.pp("rnn"))?);
                    width = 2 * units;
                }
                LayerSpec::GlobalAveragePooling => {}
                LayerSpec::Dense { units, activation } => {
                    if *activation == Activation::Softmax {
                        output = Some(linear(width, *units, vb.pp("output"))?);
                    } else {
                        dense_idx += 1;
                        dense.push(linear(width, *units, vb.pp(format!("dense{dense_idx}")))?);
                    }
                    width = *units;
                }
                LayerSpec::Dropout { rate } => dropouts.push(Dropout::new(*rate)),
                LayerSpec::BatchNorm { features } => {
                    norm = Some(BatchNorm1d::new(
                        *features,
                        varmap,
                        vb.pp("batch_norm"),
                        "batch_norm",
                    )?);
                }
            }
        }

        let (Some(embedding), Some(rnn), Some(norm), Some(output)) =
            (embedding_layer, rnn, norm, output)
        else {
            return Err(EngineError::InvalidBundle(
                "topology is missing a required layer".to_string(),
            ));
        };
        let [dense1, dense2]: [Linear; 2] = dense.try_into().map_err(|_| {
            EngineError::InvalidBundle("topology must carry exactly two hidden dense layers".into())
        })?;
        let [drop1, drop2]: [Dropout; 2] = dropouts.try_into().map_err(|_| {
            EngineError::InvalidBundle("topology must carry exactly two dropout layers".into())
        })?;

        Ok(Self {
            embedding,
            rnn,
            dense1,
            drop1,
            dense2,
            drop2,
            norm,
            output,
        })
    }

    /// `(batch, SEQUENCE_LEN)` u32 token ids -> `(batch, intent_count)`
    /// logits. Softmax is the caller's concern; training feeds these logits
    /// straight into cross-entropy.
    pub fn forward(&self, ids: &Tensor, train: bool) -> Result<Tensor, EngineError> {
        let x = self.embedding.forward(ids)?;
        let x = self.rnn.forward(&x)?;
        let x = x.mean(1)?;
        let x = self.dense1.forward(&x)?.relu()?;
        let x = self.drop1.forward(&x, train)?;
        let x = self.dense2.forward(&x)?.relu()?;
        let x = self.drop2.forward(&x, train)?;
        let x = self.norm.forward(&x, train)?;
        self.output.forward(&x).map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
