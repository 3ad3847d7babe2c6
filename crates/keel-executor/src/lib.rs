//! External actions for Keel.
//!
//! - Content fingerprinting of source trees
//! - Change-triggered execution guarded by a trigger store
//! - Container image build and push
//! - Command-based provisioning of plain nodes
//! - The default [`Applier`](keel_core::applier::Applier) tying them together

pub mod applier;
pub mod container;
pub mod fingerprint;
mod process;
pub mod provisioner;
pub mod trigger;

pub use applier::{ApplyTimeouts, DefaultApplier, default_tag};
pub use container::{ContainerTool, ImageBuildRequest, ImageBuilder, RegistryLogin};
pub use fingerprint::{DEFAULT_EXCLUDES, ExcludeSet, Fingerprint, fingerprint, fingerprint_async};
pub use provisioner::CommandProvisioner;
pub use trigger::{TriggerOutcome, TriggerRunner, forced_key};
