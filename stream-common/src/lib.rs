pub mod client;
pub mod health;
pub mod metrics;
pub mod mock;
pub mod streams;
