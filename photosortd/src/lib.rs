pub mod auth;
pub mod clock;
pub mod config;
pub mod daemon;
pub mod logging;
pub mod moves;
pub mod oauth_flow;
pub mod rate_limit;
pub mod storage;
