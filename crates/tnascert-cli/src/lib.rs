//! tnascert-deploy command-line support

pub mod config;
