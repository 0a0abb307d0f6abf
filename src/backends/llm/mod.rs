//! Language model adapters

pub mod llama;
