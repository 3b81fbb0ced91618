pub mod assemble;
pub mod config;
pub mod http;
pub mod metrics;
pub mod pdp;
pub mod pipeline;
pub mod processor;
