// src/spygame/mod.rs

pub mod agent_proxy;
pub mod belief;
pub mod executor;
pub mod orchestrator;
pub mod round;
pub mod state;
pub mod strategy_cache;

// Export the main entry points so callers reach them as spygame::GameOrchestrator
// instead of spygame::spygame::orchestrator::GameOrchestrator.
pub use orchestrator::GameOrchestrator;
pub use round::RoundController;
