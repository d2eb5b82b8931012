pub mod config;
pub mod model;
pub mod rate_limit;
pub mod smtp;
pub mod store;
pub mod submit;
pub mod telemetry;
pub mod worker;
