//! NutriLens core: turn a tap on a camera frame into a logged meal.
//!
//! A [`pipeline::Pipeline`] gates capture on the [`session::SessionStore`],
//! assembles [`capture::CaptureEvidence`], sends it to the
//! [`analysis::AnalysisClient`], and on confirmation commits the result into
//! the [`food_log::FoodLogStore`].

pub mod analysis;
pub mod backend;
pub mod capture;
pub mod config;
pub mod error;
pub mod food_log;
pub mod insights;
pub mod model;
pub mod pipeline;
pub mod session;

pub use error::{ErrorKind, NutriLensError, Result};
pub use pipeline::{Pipeline, PipelineState, TapOutcome};
