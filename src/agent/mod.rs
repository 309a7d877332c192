pub mod context;
pub mod engine;
pub mod strategies;
pub mod tools;

pub use engine::{Engine, LoopReport, LoopResult, LoopState};
