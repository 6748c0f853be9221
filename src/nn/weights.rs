use crate::error::{MelodyError, Result};
use crate::nn::layers::{CpuDevice, Dense, Lstm};
use log::debug;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

pub const ENCODER_FILE: &str = "encoder.json";
pub const DECODER_FILE: &str = "decoder.json";

/// A dense layer's parameters, kernel stored as `input_dim` rows of `output_dim` values.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DenseParams {
    pub kernel: Vec<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bias: Option<Vec<f32>>,
}

/// An LSTM layer's parameters with gates ordered input, forget, cell, output.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LstmParams {
    pub kernel: Vec<Vec<f32>>,
    pub recurrent_kernel: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EncoderParams {
    /// Bias-free projection of the 13 semitone classes.
    pub embedding: DenseParams,
    pub forward: LstmParams,
    pub backward: LstmParams,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DecoderParams {
    pub embedding: DenseParams,
    pub lstm: LstmParams,
    pub numeric_head: DenseParams,
    pub categorical_head: DenseParams,
}

/// Both parameter blobs of a sequence model.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ModelParams {
    pub encoder: EncoderParams,
    pub decoder: DecoderParams,
}

impl ModelParams {
    /// Reads `encoder.json` and `decoder.json` from a weights directory.
    pub fn load(dir: &Path) -> Result<Self> {
        Ok(Self {
            encoder: read_json(&dir.join(ENCODER_FILE))?,
            decoder: read_json(&dir.join(DECODER_FILE))?,
        })
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        write_json(&dir.join(ENCODER_FILE), &self.encoder)?;
        write_json(&dir.join(DECODER_FILE), &self.decoder)?;
        Ok(())
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).map_err(|e| MelodyError::model_load(path, e))?;
    let value = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| MelodyError::model_load(path, e))?;
    debug!("Read parameter blob {}..!", path.display());
    Ok(value)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut writer, value).map_err(std::io::Error::from)?;
    writer.flush()?;
    Ok(())
}

/// Flattens a row-major matrix after checking it is `rows x cols`.
fn flatten(
    name: &str,
    matrix: &[Vec<f32>],
    rows: usize,
    cols: usize,
) -> std::result::Result<Vec<f32>, String> {
    if matrix.len() != rows {
        return Err(format!(
            "{name}: expected {rows} rows, found {}",
            matrix.len()
        ));
    }
    if let Some((i, row)) = matrix.iter().enumerate().find(|(_, row)| row.len() != cols) {
        return Err(format!(
            "{name}: row {i} has {} columns, expected {cols}",
            row.len()
        ));
    }
    Ok(matrix.iter().flatten().copied().collect())
}

impl DenseParams {
    pub fn input_dim(&self) -> usize {
        self.kernel.len()
    }

    pub fn output_dim(&self) -> usize {
        self.kernel.first().map_or(0, Vec::len)
    }

    pub(crate) fn build(
        &self,
        name: &str,
        input_dim: usize,
        output_dim: usize,
        device: &CpuDevice,
    ) -> std::result::Result<Dense, String> {
        let kernel = flatten(&format!("{name}.kernel"), &self.kernel, input_dim, output_dim)?;
        if let Some(bias) = self.bias.as_ref()
            && bias.len() != output_dim
        {
            return Err(format!(
                "{name}.bias: expected {output_dim} values, found {}",
                bias.len()
            ));
        }
        Ok(Dense::new(
            input_dim,
            output_dim,
            &kernel,
            self.bias.as_deref(),
            device,
        ))
    }
}

impl LstmParams {
    pub fn units(&self) -> usize {
        self.recurrent_kernel.len()
    }

    pub(crate) fn build(
        &self,
        name: &str,
        input_dim: usize,
        units: usize,
        device: &CpuDevice,
    ) -> std::result::Result<Lstm, String> {
        let kernel = flatten(&format!("{name}.kernel"), &self.kernel, input_dim, 4 * units)?;
        let recurrent_kernel = flatten(
            &format!("{name}.recurrent_kernel"),
            &self.recurrent_kernel,
            units,
            4 * units,
        )?;
        if self.bias.len() != 4 * units {
            return Err(format!(
                "{name}.bias: expected {} values, found {}",
                4 * units,
                self.bias.len()
            ));
        }
        Ok(Lstm::new(
            input_dim,
            units,
            &kernel,
            &recurrent_kernel,
            &self.bias,
            device,
        ))
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn save_then_load_from_directory() {
        env_logger::try_init().unwrap_or(());

        let dir = TempDir::new().unwrap();
        let params = fixtures::model_params(3, 2, 6);
        params.save(dir.path()).unwrap();

        assert!(dir.path().join(ENCODER_FILE).exists());
        assert!(dir.path().join(DECODER_FILE).exists());
        assert_eq!(ModelParams::load(dir.path()).unwrap(), params);
    }

    #[test]
    fn missing_directory_is_a_load_error() {
        env_logger::try_init().unwrap_or(());

        let dir = TempDir::new().unwrap();
        let result = ModelParams::load(&dir.path().join("nope"));
        assert!(matches!(result, Err(MelodyError::ModelLoad { .. })));
    }

    #[test]
    fn corrupt_blob_is_a_load_error() {
        env_logger::try_init().unwrap_or(());

        let dir = TempDir::new().unwrap();
        fixtures::model_params(2, 2, 4).save(dir.path()).unwrap();
        std::fs::write(dir.path().join(DECODER_FILE), b"{\"embedding\": [").unwrap();

        match ModelParams::load(dir.path()) {
            Err(MelodyError::ModelLoad { path, .. }) => {
                assert!(path.ends_with(DECODER_FILE));
            }
            other => panic!("expected a model load error, got {:?}", other),
        }
    }

    #[test]
    fn dense_shape_is_checked() {
        let device = CpuDevice::default();
        let params = DenseParams {
            kernel: vec![vec![1.0, 2.0], vec![3.0]],
            bias: None,
        };
        let err = params.build("head", 2, 2, &device).unwrap_err();
        assert!(err.contains("row 1"));

        let params = DenseParams {
            kernel: vec![vec![1.0, 2.0]],
            bias: Some(vec![0.0]),
        };
        assert!(params.build("head", 1, 2, &device).unwrap_err().contains("bias"));
        assert!(params.build("head", 2, 2, &device).is_err());
    }

    #[test]
    fn lstm_shape_is_checked() {
        let device = CpuDevice::default();
        let params = fixtures::model_params(2, 3, 4).encoder.forward;
        assert_eq!(params.units(), 2);
        assert!(params.build("forward", 8, 2, &device).is_ok());
        assert!(params.build("forward", 7, 2, &device).is_err());
        assert!(params.build("forward", 8, 3, &device).is_err());
    }
}
