//! 槽位：可独立加载的生成工作单元及其注册表

pub mod descriptor;
pub mod engine;
pub mod engines;
pub mod registry;
pub mod slot;

pub use descriptor::{EngineConfig, GenerationParams, SlotDescriptor, SlotRole};
pub use engine::GenerationEngine;
pub use engines::{create_engine, LlamaServerEngine, ScriptedEngine};
pub use registry::{BootReport, EvictionReport, SlotRegistry};
pub use slot::{Slot, SlotLease, SlotPhase, SlotStatus};
