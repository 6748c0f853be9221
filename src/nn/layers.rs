//! Inference-only building blocks on burn's `NdArray` backend: dense layers and
//! an LSTM cell.
//!
//! Kernels are `input_dim x output_dim` matrices and rows are timesteps, so a
//! layer maps `[steps, input_dim]` to `[steps, output_dim]`. LSTM gates are laid
//! out input, forget, cell, output along the output axis.

use crate::error::{MelodyError, Result};
use burn::backend::NdArray;
use burn::backend::ndarray::NdArrayDevice;
use burn::tensor::Tensor;
use burn::tensor::activation::sigmoid;

pub type Cpu = NdArray<f32>;
pub type CpuDevice = NdArrayDevice;

/// Recurrent state threaded through encoder and decoder steps.
///
/// Kept host-side between calls so a request can own, compare and clone it
/// without holding backend tensors.
#[derive(Debug, Clone, PartialEq)]
pub struct LatentState {
    pub hidden: Vec<f32>,
    pub memory: Vec<f32>,
}

impl LatentState {
    pub fn zeros(units: usize) -> Self {
        Self {
            hidden: vec![0.0; units],
            memory: vec![0.0; units],
        }
    }

    pub fn units(&self) -> usize {
        self.hidden.len()
    }
}

/// The same state while it lives on the backend, each half `[1, units]`.
#[derive(Debug, Clone)]
pub struct StateTensors {
    pub hidden: Tensor<Cpu, 2>,
    pub memory: Tensor<Cpu, 2>,
}

impl StateTensors {
    pub fn zeros(units: usize, device: &CpuDevice) -> Self {
        Self {
            hidden: Tensor::zeros([1, units], device),
            memory: Tensor::zeros([1, units], device),
        }
    }

    pub fn upload(state: &LatentState, device: &CpuDevice) -> Self {
        Self {
            hidden: row(&state.hidden, device),
            memory: row(&state.memory, device),
        }
    }

    pub fn download(self) -> Result<LatentState> {
        Ok(LatentState {
            hidden: to_vec(self.hidden)?,
            memory: to_vec(self.memory)?,
        })
    }
}

/// A single `[1, n]` row.
pub fn row(values: &[f32], device: &CpuDevice) -> Tensor<Cpu, 2> {
    matrix(values, 1, values.len(), device)
}

/// A row-major `[rows, cols]` matrix; `values` must hold `rows * cols` entries.
pub fn matrix(values: &[f32], rows: usize, cols: usize, device: &CpuDevice) -> Tensor<Cpu, 2> {
    debug_assert_eq!(values.len(), rows * cols);
    Tensor::<Cpu, 1>::from_floats(values, device).reshape([rows, cols])
}

/// Reads a tensor back in row-major order.
pub fn to_vec(tensor: Tensor<Cpu, 2>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| MelodyError::Inference(format!("{:?}", e)))
}

#[derive(Debug, Clone)]
pub struct Dense {
    input_dim: usize,
    output_dim: usize,
    kernel: Tensor<Cpu, 2>,
    bias: Option<Tensor<Cpu, 2>>,
}

impl Dense {
    /// `kernel` holds `input_dim * output_dim` values row-major. Without a bias
    /// the layer is a plain projection.
    pub fn new(
        input_dim: usize,
        output_dim: usize,
        kernel: &[f32],
        bias: Option<&[f32]>,
        device: &CpuDevice,
    ) -> Self {
        Self {
            input_dim,
            output_dim,
            kernel: matrix(kernel, input_dim, output_dim, device),
            bias: bias.map(|bias| row(bias, device)),
        }
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    pub fn forward(&self, x: Tensor<Cpu, 2>) -> Tensor<Cpu, 2> {
        let y = x.matmul(self.kernel.clone());
        match self.bias.as_ref() {
            Some(bias) => y.add(bias.clone()),
            None => y,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Lstm {
    input_dim: usize,
    units: usize,
    kernel: Tensor<Cpu, 2>,
    recurrent_kernel: Tensor<Cpu, 2>,
    bias: Tensor<Cpu, 2>,
}

impl Lstm {
    pub fn new(
        input_dim: usize,
        units: usize,
        kernel: &[f32],
        recurrent_kernel: &[f32],
        bias: &[f32],
        device: &CpuDevice,
    ) -> Self {
        Self {
            input_dim,
            units,
            kernel: matrix(kernel, input_dim, 4 * units, device),
            recurrent_kernel: matrix(recurrent_kernel, units, 4 * units, device),
            bias: row(bias, device),
        }
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn units(&self) -> usize {
        self.units
    }

    /// Input half of the gate pre-activations, `x . W + b`, for every row of `x`.
    pub fn project(&self, x: Tensor<Cpu, 2>) -> Tensor<Cpu, 2> {
        x.matmul(self.kernel.clone()).add(self.bias.clone())
    }

    /// Advances the cell by one timestep from an already projected `[1, 4 * units]` row.
    pub fn step_projected(&self, projected: Tensor<Cpu, 2>, state: StateTensors) -> StateTensors {
        let units = self.units;
        let z = projected.add(state.hidden.matmul(self.recurrent_kernel.clone()));

        let input_gate = sigmoid(z.clone().narrow(1, 0, units));
        let forget_gate = sigmoid(z.clone().narrow(1, units, units));
        let candidate = z.clone().narrow(1, 2 * units, units).tanh();
        let output_gate = sigmoid(z.narrow(1, 3 * units, units));

        let memory = forget_gate
            .mul(state.memory)
            .add(input_gate.mul(candidate));
        let hidden = output_gate.mul(memory.clone().tanh());
        StateTensors { hidden, memory }
    }

    pub fn step(&self, x: Tensor<Cpu, 2>, state: StateTensors) -> StateTensors {
        self.step_projected(self.project(x), state)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;
    use burn::tensor::activation::softmax;

    fn sigmoid(x: f32) -> f32 {
        1.0 / (1.0 + (-x).exp())
    }

    #[test]
    fn dense_forward() {
        let device = CpuDevice::default();
        // 2 inputs -> 3 outputs
        let dense = Dense::new(
            2,
            3,
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            Some(&[0.5, 0.0, -0.5][..]),
            &device,
        );
        let out = to_vec(dense.forward(row(&[1.0, -1.0], &device))).unwrap();
        assert_eq!(out, vec![-2.5, -3.0, -3.5]);
    }

    #[test]
    fn dense_without_bias() {
        let device = CpuDevice::default();
        let dense = Dense::new(1, 2, &[2.0, -2.0], None, &device);
        let out = to_vec(dense.forward(row(&[0.25], &device))).unwrap();
        assert_eq!(out, vec![0.5, -0.5]);
    }

    #[test]
    fn dense_maps_every_row() {
        let device = CpuDevice::default();
        let dense = Dense::new(2, 1, &[1.0, 1.0], Some(&[1.0][..]), &device);
        let x = matrix(&[1.0, 2.0, 3.0, 4.0, 0.0, 0.0], 3, 2, &device);
        assert_eq!(to_vec(dense.forward(x)).unwrap(), vec![4.0, 8.0, 1.0]);
    }

    #[test]
    fn lstm_step_matches_hand_computation() {
        let device = CpuDevice::default();
        // single unit, single input, gates all share the same weights
        let lstm = Lstm::new(1, 1, &[1.0; 4], &[0.5; 4], &[0.0; 4], &device);
        let state = LatentState {
            hidden: vec![0.2],
            memory: vec![0.4],
        };
        let next = lstm
            .step(row(&[1.0], &device), StateTensors::upload(&state, &device))
            .download()
            .unwrap();

        let z: f32 = 1.0 + 0.5 * 0.2;
        let gate = sigmoid(z);
        let memory = gate * 0.4 + gate * z.tanh();
        let hidden = gate * memory.tanh();

        assert_relative_eq!(next.memory[0], memory, epsilon = 1e-6);
        assert_relative_eq!(next.hidden[0], hidden, epsilon = 1e-6);
    }

    #[test]
    fn gates_are_read_in_keras_order() {
        let device = CpuDevice::default();
        // input gate wide open, forget gate shut, candidate 0.5, output gate open
        let bias = [20.0, -20.0, 0.5f32.atanh(), 20.0];
        let lstm = Lstm::new(1, 1, &[0.0; 4], &[0.0; 4], &bias, &device);
        let state = LatentState {
            hidden: vec![0.0],
            memory: vec![3.0],
        };
        let next = lstm
            .step(row(&[0.0], &device), StateTensors::upload(&state, &device))
            .download()
            .unwrap();

        assert_relative_eq!(next.memory[0], 0.5, epsilon = 1e-4);
        assert_relative_eq!(next.hidden[0], 0.5f32.tanh(), epsilon = 1e-4);
    }

    #[test]
    fn zero_weights_decay_memory_by_half() {
        let device = CpuDevice::default();
        let lstm = Lstm::new(2, 3, &[0.0; 24], &[0.0; 36], &[0.0; 12], &device);
        let state = LatentState {
            hidden: vec![1.0; 3],
            memory: vec![1.0; 3],
        };
        let next = lstm
            .step(row(&[1.0, 1.0], &device), StateTensors::upload(&state, &device))
            .download()
            .unwrap();
        for j in 0..3 {
            assert_relative_eq!(next.memory[j], 0.5, epsilon = 1e-6);
            assert_relative_eq!(next.hidden[j], 0.5 * 0.5f32.tanh(), epsilon = 1e-6);
        }
    }

    #[test]
    fn projected_sequence_matches_stepwise_input() {
        let device = CpuDevice::default();
        let kernel: Vec<f32> = (0..16).map(|i| i as f32 / 16.0 - 0.5).collect();
        let recurrent: Vec<f32> = (0..16).map(|i| 0.25 - i as f32 / 32.0).collect();
        let lstm = Lstm::new(4, 2, &kernel, &recurrent, &[0.1; 8], &device);

        let rows = [[0.1, 0.2, 0.3, 0.4], [0.4, 0.3, 0.2, 0.1]];
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        let projected = lstm.project(matrix(&flat, 2, 4, &device));

        let by_projection = (0..2)
            .fold(StateTensors::zeros(2, &device), |state, t| {
                lstm.step_projected(projected.clone().narrow(0, t, 1), state)
            })
            .download()
            .unwrap();
        let by_step = rows
            .iter()
            .fold(StateTensors::zeros(2, &device), |state, x| {
                lstm.step(row(x, &device), state)
            })
            .download()
            .unwrap();

        for j in 0..2 {
            assert_relative_eq!(by_projection.hidden[j], by_step.hidden[j], epsilon = 1e-6);
            assert_relative_eq!(by_projection.memory[j], by_step.memory[j], epsilon = 1e-6);
        }
    }

    #[test]
    fn softmax_is_stable() {
        let device = CpuDevice::default();
        let probs = to_vec(softmax(row(&[1.0, 2.0, 3.0, 1000.0], &device), 1)).unwrap();
        assert_relative_eq!(probs.iter().sum::<f32>(), 1.0, epsilon = 1e-6);
        assert!(probs.iter().all(|p| p.is_finite()));
        assert_relative_eq!(probs[3], 1.0, epsilon = 1e-6);
    }
}
