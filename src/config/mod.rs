//! Configuration
//!
//! Loading, defaults and startup validation of coordinator tuning.

pub mod config;
pub mod types;
pub mod validator;
