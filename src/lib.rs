pub mod config;
pub mod export;
pub mod fetch;
pub mod model;
pub mod parser;
pub mod pipeline;
pub mod rate_limit;
pub mod robots;
