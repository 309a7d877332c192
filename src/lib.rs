pub mod agent;
pub mod embedding;
pub mod error;
pub mod insights;
pub mod models;
pub mod preferences;
pub mod server;
pub mod session;
pub mod settings;
pub mod storage;
