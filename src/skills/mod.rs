//! Skill Subsystem
//!
//! Skills are external services described by SKILL.md manifests on
//! disk. The registry discovers and indexes them, and the executor
//! dispatches model-emitted invocations through the sandbox. The
//! engine itself never depends on any skill's environment.

pub mod executor;
pub mod manifest;
pub mod registry;

pub use executor::{InvocationPayload, InvocationRequest, Observation, SkillExecutor};
pub use manifest::{ManifestError, SkillManifest};
pub use registry::{RegistryError, RegistrySnapshot, SkillRegistry, MANIFEST_FILENAME};
