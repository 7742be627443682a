//! honeycomb - basemap cache build and upload tool.
//!
//! The binary front-end over `honeycomb-pipeline`: configuration,
//! command dispatch, and the vector-tile publish path.

pub mod config;
pub mod controller;
pub mod vector;

pub use config::AppConfig;
pub use controller::Controller;
pub use vector::VectorPublisher;
