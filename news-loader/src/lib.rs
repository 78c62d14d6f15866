pub mod companies;
pub mod completion;
pub mod config;
pub mod consumer;
pub mod decode;
pub mod error;
pub mod loader;
pub mod processor;
pub mod progress;
pub mod publisher;
pub mod shutdown;
pub mod store;
