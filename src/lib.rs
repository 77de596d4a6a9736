//! reroute - development reverse proxy driven by a rule file
//!
//! - `config`: Configuration file schema and loading
//! - `logging`: Logging system initialization

pub mod config;
pub mod logging;
