pub mod generator;
pub mod orchestrator;
pub mod profiler;
pub mod sessions;
pub mod ssh;
