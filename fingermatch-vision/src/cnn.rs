//! Native implementation of the fingerprint CNN.
//!
//! Architecture (stride 1, zero padding 1 on every convolution):
//!
//! ```text
//! conv3x3(1 -> c1)  relu  maxpool 2x2
//! conv3x3(c1 -> c2) relu  maxpool 2x2
//! conv3x3(c2 -> c3) relu  global average pool
//! linear(c3 -> 128)
//! ```
//!
//! Weights use the PyTorch layout (`[out, in, 3, 3]` kernels, `[out, in]`
//! linear weights, row-major) and are stored on disk with `postcard`.
//! Every reduction runs in a fixed order, so identical inputs produce
//! bit-identical outputs.

use std::path::Path;

use ndarray::{Array3, Array4, Axis};
use serde::{Deserialize, Serialize};

use crate::error::ExtractError;
use crate::fingerprint::EMBEDDING_DIM;
use crate::model::Encoder;

pub const WEIGHTS_FORMAT: u32 = 1;
const KERNEL: usize = 9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conv2d {
    pub in_channels: usize,
    pub out_channels: usize,
    pub weight: Vec<f32>,
    pub bias: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Linear {
    pub in_features: usize,
    pub out_features: usize,
    pub weight: Vec<f32>,
    pub bias: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CnnWeights {
    pub format: u32,
    pub convs: Vec<Conv2d>,
    pub fc: Linear,
}

impl CnnWeights {
    /// Deterministically initialized weights.
    ///
    /// Convolution kernels and biases are positive, so every activation stays
    /// positive and a change to any input pixel reaches the pooled features.
    /// Useful to exercise the extractor without trained weights.
    pub fn seeded(channels: [usize; 3], seed: u64) -> Self {
        let mut state = seed;
        let mut next = move || {
            state = splitmix64(state);
            (state >> 40) as f32 / (1u64 << 24) as f32
        };

        let mut convs = Vec::with_capacity(3);
        let mut in_channels = 1;
        for &out_channels in &channels {
            let scale = 1.0 / in_channels as f32;
            let weight = (0..out_channels * in_channels * KERNEL)
                .map(|_| (0.01 + 0.09 * next()) * scale)
                .collect();
            convs.push(Conv2d {
                in_channels,
                out_channels,
                weight,
                bias: vec![1.0; out_channels],
            });
            in_channels = out_channels;
        }

        let fc = Linear {
            in_features: in_channels,
            out_features: EMBEDDING_DIM,
            weight: (0..EMBEDDING_DIM * in_channels)
                .map(|_| next() * 2.0 - 1.0)
                .collect(),
            bias: vec![0.0; EMBEDDING_DIM],
        };

        Self {
            format: WEIGHTS_FORMAT,
            convs,
            fc,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ExtractError> {
        let weights: Self = postcard::from_bytes(bytes)
            .map_err(|e| ExtractError::ModelLoad(format!("decoding cnn weights: {e}")))?;
        weights.validate()?;
        Ok(weights)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ExtractError> {
        postcard::to_allocvec(self).map_err(|e| ExtractError::ModelLoad(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<(), ExtractError> {
        let data = self.to_bytes()?;
        std::fs::write(path, data)
            .map_err(|e| ExtractError::ModelLoad(format!("writing {}: {e}", path.display())))
    }

    pub fn validate(&self) -> Result<(), ExtractError> {
        let bad = |msg: String| Err(ExtractError::ModelLoad(msg));

        if self.format != WEIGHTS_FORMAT {
            return bad(format!("unsupported weights format {}", self.format));
        }
        if self.convs.len() != 3 {
            return bad(format!("expected 3 conv layers, got {}", self.convs.len()));
        }

        let mut in_channels = 1;
        for (i, conv) in self.convs.iter().enumerate() {
            if conv.in_channels != in_channels || conv.out_channels == 0 {
                return bad(format!(
                    "conv{i}: expected {in_channels} input channels, got {}",
                    conv.in_channels
                ));
            }
            if conv.weight.len() != conv.out_channels * conv.in_channels * KERNEL
                || conv.bias.len() != conv.out_channels
            {
                return bad(format!("conv{i}: weight shape does not match channels"));
            }
            in_channels = conv.out_channels;
        }

        let fc = &self.fc;
        if fc.in_features != in_channels {
            return bad(format!(
                "fc expects {} inputs, last conv yields {in_channels}",
                fc.in_features
            ));
        }
        if fc.out_features != EMBEDDING_DIM {
            return bad(format!(
                "fc yields {} features, expected {EMBEDDING_DIM}",
                fc.out_features
            ));
        }
        if fc.weight.len() != fc.in_features * fc.out_features || fc.bias.len() != fc.out_features
        {
            return bad("fc: weight shape does not match features".to_string());
        }
        Ok(())
    }
}

/// Pure-Rust encoder running [`CnnWeights`]. Lock-free and `Sync`.
#[derive(Debug, Clone)]
pub struct CnnEncoder {
    weights: CnnWeights,
}

impl CnnEncoder {
    pub fn new(weights: CnnWeights) -> Result<Self, ExtractError> {
        weights.validate()?;
        Ok(Self { weights })
    }

    pub fn load(path: &Path) -> Result<Self, ExtractError> {
        let bytes = std::fs::read(path).map_err(|e| {
            ExtractError::ModelLoad(format!("reading weights {}: {e}", path.display()))
        })?;
        let weights = CnnWeights::from_bytes(&bytes)?;
        log::info!(
            "loaded native cnn weights {} (channels {:?})",
            path.display(),
            weights
                .convs
                .iter()
                .map(|c| c.out_channels)
                .collect::<Vec<_>>()
        );
        Ok(Self { weights })
    }

    pub fn weights(&self) -> &CnnWeights {
        &self.weights
    }
}

impl Encoder for CnnEncoder {
    fn encode(&self, input: Array4<f32>) -> Result<Vec<f32>, ExtractError> {
        let (batch, channels, height, width) = input.dim();
        if batch != 1 || channels != 1 || height < 4 || width < 4 {
            return Err(ExtractError::Inference(format!(
                "unexpected input shape {:?}",
                input.shape()
            )));
        }

        let x = input.index_axis_move(Axis(0), 0);
        let [c1, c2, c3] = [&self.weights.convs[0], &self.weights.convs[1], &self.weights.convs[2]];

        let x = max_pool2(&conv3x3_relu(&x, c1));
        let x = max_pool2(&conv3x3_relu(&x, c2));
        let x = conv3x3_relu(&x, c3);
        let pooled = global_avg_pool(&x);

        Ok(linear(&pooled, &self.weights.fc))
    }
}

fn conv3x3_relu(input: &Array3<f32>, layer: &Conv2d) -> Array3<f32> {
    let (c_in, h, w) = input.dim();
    let mut out = Array3::<f32>::zeros((layer.out_channels, h, w));

    for (o, mut plane) in out.outer_iter_mut().enumerate() {
        plane.fill(layer.bias[o]);
        for (i, src) in input.outer_iter().enumerate() {
            let kernel = &layer.weight[(o * c_in + i) * KERNEL..][..KERNEL];
            for ky in 0..3 {
                for kx in 0..3 {
                    let wv = kernel[ky * 3 + kx];
                    for y in 0..h {
                        let Some(sy) = (y + ky).checked_sub(1).filter(|&sy| sy < h) else {
                            continue;
                        };
                        for x in 0..w {
                            let Some(sx) = (x + kx).checked_sub(1).filter(|&sx| sx < w) else {
                                continue;
                            };
                            plane[[y, x]] += wv * src[[sy, sx]];
                        }
                    }
                }
            }
        }
    }

    out.mapv_inplace(|v| v.max(0.0));
    out
}

fn max_pool2(input: &Array3<f32>) -> Array3<f32> {
    let (c, h, w) = input.dim();
    Array3::from_shape_fn((c, h / 2, w / 2), |(ch, y, x)| {
        let (y0, x0) = (y * 2, x * 2);
        input[[ch, y0, x0]]
            .max(input[[ch, y0, x0 + 1]])
            .max(input[[ch, y0 + 1, x0]])
            .max(input[[ch, y0 + 1, x0 + 1]])
    })
}

fn global_avg_pool(input: &Array3<f32>) -> Vec<f32> {
    input
        .outer_iter()
        .map(|plane| plane.iter().sum::<f32>() / plane.len() as f32)
        .collect()
}

fn linear(x: &[f32], layer: &Linear) -> Vec<f32> {
    (0..layer.out_features)
        .map(|j| {
            let row = &layer.weight[j * layer.in_features..][..layer.in_features];
            row.iter()
                .zip(x)
                .fold(layer.bias[j], |acc, (w, v)| acc + w * v)
        })
        .collect()
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
