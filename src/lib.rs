#![allow(non_snake_case)]

mod error;
mod generator;
mod midi_exporter;
mod midi_importer;
mod model;
mod pipeline;
mod sampler;

pub mod features;
pub mod nn;

pub use error::*;
pub use generator::*;
pub use midi_exporter::*;
pub use midi_importer::*;
pub use model::config::*;
pub use model::song::*;
pub use nn::model::MelodyModel;
pub use pipeline::*;
pub use sampler::*;
