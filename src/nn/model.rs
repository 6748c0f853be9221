use crate::error::{MelodyError, Result};
use crate::features::encoder::RhythmFeatures;
use crate::features::{
    MelodyNumeric, NUM_MELODY_FEATURES, NUM_RHYTHM_FEATURES, NUM_SEMITONE_CLASSES, SemitoneVector,
};
use crate::nn::layers::{
    Cpu, CpuDevice, Dense, LatentState, Lstm, StateTensors, matrix, row, to_vec,
};
use crate::nn::weights::{DecoderParams, EncoderParams, ModelParams};
use burn::tensor::Tensor;
use burn::tensor::activation::softmax;
use log::info;
use std::path::{Path, PathBuf};

/// How the two directional encoder states become the decoder's initial state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateMerge {
    /// `[forward, backward]`, for a decoder twice as wide as each direction.
    Concatenate,
    /// `forward + backward`, for a decoder as wide as each direction.
    Sum,
}

/// One decoder transition.
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderOutput {
    /// Unconstrained predictions for velocity, step, duration and octave.
    pub numeric: MelodyNumeric,
    /// Probability distribution over the semitone classes.
    pub distribution: SemitoneVector,
    pub state: LatentState,
}

#[derive(Debug, Clone)]
struct Encoder {
    embedding: Dense,
    forward: Lstm,
    backward: Lstm,
}

#[derive(Debug, Clone)]
struct Decoder {
    embedding: Dense,
    lstm: Lstm,
    numeric_head: Dense,
    categorical_head: Dense,
}

/// Pretrained encoder/decoder pair on the CPU backend. Immutable once built,
/// so a single handle can serve concurrent generation requests.
#[derive(Debug, Clone)]
pub struct MelodyModel {
    encoder: Encoder,
    decoder: Decoder,
    merge: StateMerge,
    device: CpuDevice,
}

/// Keras-style masking: a timestep is skipped when either input is all zeros.
fn is_masked(numeric: &[f32], categorical: &[f32]) -> bool {
    numeric.iter().all(|&v| v == 0.0) || categorical.iter().all(|&v| v == 0.0)
}

impl Encoder {
    fn build(params: &EncoderParams, device: &CpuDevice) -> std::result::Result<Self, String> {
        let embed_dim = params.embedding.output_dim();
        let hidden = params.forward.units();
        let input_dim = NUM_RHYTHM_FEATURES + embed_dim;

        Ok(Self {
            embedding: params.embedding.build(
                "encoder.embedding",
                NUM_SEMITONE_CLASSES,
                embed_dim,
                device,
            )?,
            forward: params
                .forward
                .build("encoder.forward", input_dim, hidden, device)?,
            backward: params
                .backward
                .build("encoder.backward", input_dim, hidden, device)?,
        })
    }

    /// Final forward and backward states over the unmasked rows.
    fn run(&self, features: &RhythmFeatures, device: &CpuDevice) -> (StateTensors, StateTensors) {
        let units = self.forward.units();
        let kept: Vec<usize> = (0..features.len())
            .filter(|&t| !is_masked(&features.numeric[t], &features.categorical[t]))
            .collect();
        if kept.is_empty() {
            return (
                StateTensors::zeros(units, device),
                StateTensors::zeros(units, device),
            );
        }

        let steps = kept.len();
        let numeric: Vec<f32> = kept
            .iter()
            .flat_map(|&t| features.numeric[t])
            .collect();
        let categorical: Vec<f32> = kept
            .iter()
            .flat_map(|&t| features.categorical[t])
            .collect();

        let x = Tensor::cat(
            vec![
                matrix(&numeric, steps, NUM_RHYTHM_FEATURES, device),
                self.embedding
                    .forward(matrix(&categorical, steps, NUM_SEMITONE_CLASSES, device)),
            ],
            1,
        );
        let forward_in = self.forward.project(x.clone());
        let backward_in = self.backward.project(x);

        let forward = (0..steps).fold(StateTensors::zeros(units, device), |state, t| {
            self.forward
                .step_projected(forward_in.clone().narrow(0, t, 1), state)
        });
        let backward = (0..steps)
            .rev()
            .fold(StateTensors::zeros(units, device), |state, t| {
                self.backward
                    .step_projected(backward_in.clone().narrow(0, t, 1), state)
            });
        (forward, backward)
    }
}

impl Decoder {
    fn build(
        params: &DecoderParams,
        units: usize,
        device: &CpuDevice,
    ) -> std::result::Result<Self, String> {
        let embed_dim = params.embedding.output_dim();
        let input_dim = NUM_MELODY_FEATURES + embed_dim;

        Ok(Self {
            embedding: params.embedding.build(
                "decoder.embedding",
                NUM_SEMITONE_CLASSES,
                embed_dim,
                device,
            )?,
            lstm: params
                .lstm
                .build("decoder.lstm", input_dim, units, device)?,
            numeric_head: params.numeric_head.build(
                "decoder.numeric_head",
                units,
                NUM_MELODY_FEATURES,
                device,
            )?,
            categorical_head: params.categorical_head.build(
                "decoder.categorical_head",
                units,
                NUM_SEMITONE_CLASSES,
                device,
            )?,
        })
    }
}

impl MelodyModel {
    /// Loads both parameter blobs from a weights directory.
    pub fn load(dir: &Path) -> Result<Self> {
        let params = ModelParams::load(dir)?;
        Self::build(&params, dir)
    }

    pub fn from_params(params: &ModelParams) -> Result<Self> {
        Self::build(params, "<memory>")
    }

    fn build(params: &ModelParams, source: impl Into<PathBuf>) -> Result<Self> {
        let source = source.into();
        let device = CpuDevice::default();
        let encoder = Encoder::build(&params.encoder, &device)
            .map_err(|e| MelodyError::model_load(&source, e))?;

        let hidden = encoder.forward.units();
        let decoder_units = params.decoder.lstm.units();
        let merge = if decoder_units == 2 * hidden {
            StateMerge::Concatenate
        } else if decoder_units == hidden {
            StateMerge::Sum
        } else {
            return Err(MelodyError::model_load(
                &source,
                format!(
                    "decoder width {decoder_units} matches neither {hidden} nor {} encoder units",
                    2 * hidden
                ),
            ));
        };

        let decoder = Decoder::build(&params.decoder, decoder_units, &device)
            .map_err(|e| MelodyError::model_load(&source, e))?;

        info!(
            "Loaded melody model from {}: {} encoder units per direction, {} decoder units ({:?})..!",
            source.display(),
            hidden,
            decoder_units,
            merge
        );

        Ok(Self {
            encoder,
            decoder,
            merge,
            device,
        })
    }

    pub fn merge(&self) -> StateMerge {
        self.merge
    }

    /// Width of the latent state consumed by the decoder.
    pub fn latent_units(&self) -> usize {
        self.decoder.lstm.units()
    }

    /// Compresses a rhythm feature sequence into the decoder's initial state.
    pub fn encode(&self, features: &RhythmFeatures) -> Result<LatentState> {
        if features.is_empty() {
            return Err(MelodyError::EmptyInput);
        }
        if features.numeric.len() != features.categorical.len() {
            return Err(MelodyError::InvalidConfig(format!(
                "feature sequences differ in length: {} numeric rows, {} categorical rows",
                features.numeric.len(),
                features.categorical.len()
            )));
        }

        let (forward, backward) = self.encoder.run(features, &self.device);
        let merged = match self.merge {
            StateMerge::Concatenate => StateTensors {
                hidden: Tensor::cat(vec![forward.hidden, backward.hidden], 1),
                memory: Tensor::cat(vec![forward.memory, backward.memory], 1),
            },
            StateMerge::Sum => StateTensors {
                hidden: forward.hidden.add(backward.hidden),
                memory: forward.memory.add(backward.memory),
            },
        };
        merged.download()
    }

    /// Single decoder transition from the previous note and state.
    ///
    /// A masked input (the all-zero start token) leaves the state untouched and
    /// feeds a zero output to both heads.
    pub fn decode_step(
        &self,
        previous_numeric: &MelodyNumeric,
        previous_categorical: &SemitoneVector,
        state: LatentState,
    ) -> Result<DecoderOutput> {
        let decoder = &self.decoder;
        let device = &self.device;

        let (output, state): (Tensor<Cpu, 2>, LatentState) =
            if is_masked(previous_numeric, previous_categorical) {
                (Tensor::zeros([1, decoder.lstm.units()], device), state)
            } else {
                let x = Tensor::cat(
                    vec![
                        row(previous_numeric, device),
                        decoder
                            .embedding
                            .forward(row(previous_categorical, device)),
                    ],
                    1,
                );
                let next = decoder
                    .lstm
                    .step(x, StateTensors::upload(&state, device));
                (next.hidden.clone(), next.download()?)
            };

        let mut numeric = [0.0f32; NUM_MELODY_FEATURES];
        numeric.copy_from_slice(&to_vec(decoder.numeric_head.forward(output.clone()))?);

        let mut distribution = [0.0f32; NUM_SEMITONE_CLASSES];
        distribution.copy_from_slice(&to_vec(softmax(
            decoder.categorical_head.forward(output),
            1,
        ))?);

        Ok(DecoderOutput {
            numeric,
            distribution,
            state,
        })
    }
}
