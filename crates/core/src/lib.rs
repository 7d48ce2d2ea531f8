//! Tiled inference over large multidimensional images.
//!
//! A [`controller::TilingController`] plans patches for a model, mirrors the
//! image borders, runs the model on every patch through a
//! [`inference::PatchInference`] implementation and stitches the results.

pub mod axis;
pub mod backend;
pub mod config;
pub mod controller;
pub mod error;
pub mod extract;
pub mod inference;
pub mod logging;
pub mod mirror;
pub mod model_spec;
pub mod planner;
pub mod progress;
pub mod reconstruct;
pub mod runtime;
pub mod volume;
