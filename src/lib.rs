#![forbid(unsafe_code)]

pub mod aggregate;
pub mod cli;
pub mod config;
pub mod dedup;
pub mod error;
pub mod formats;
pub mod http;
pub mod logging;
pub mod overall;
pub mod partial;
pub mod pool;
pub mod restaurant;
pub mod site;
