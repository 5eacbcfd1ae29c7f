pub mod cache;
pub mod classifier;
pub mod cli;
pub mod codebook;
pub mod config;
pub mod corpus;
pub mod engine;
pub mod error;
pub mod histogram;
pub mod learner;
mod metrics;
pub mod pipeline;
pub mod predictor;
pub mod provider;
pub mod server;
pub mod sift;
pub mod store;
pub mod trainer;
pub mod utils;

pub use config::Opts;
pub use engine::Engine;
