pub mod assertions;
pub mod cluster;
pub mod diagnose;
pub mod error;
pub mod model;
pub mod netstack;
pub mod plugin;
pub mod report;

pub use error::{Error, Result};

#[cfg(test)]
mod test;
