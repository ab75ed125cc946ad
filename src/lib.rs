pub mod error;
pub mod constants;
pub mod geodesy;
pub mod raw;
pub mod station_file;
pub mod station;
pub mod propagation;
pub mod correlate;
pub mod solution;
pub mod solver;
pub mod locate;
pub mod output;
pub mod config;

pub use error::{LmaError, Result};
