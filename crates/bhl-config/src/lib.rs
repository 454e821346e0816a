// SPDX-License-Identifier: MIT OR Apache-2.0
//! bhl-config
//!
//! Configuration store for backhaul: YAML loading with in-place migrations,
//! transparent at-rest field encryption, `${…}` variable substitution,
//! human-unit handling, and repo ↔ group inheritance resolution with a
//! parallel inheritance map.

pub mod crypt;
pub mod defaults;
pub mod inherit;
pub mod store;
pub mod tree;
pub mod vars;
pub mod view;

pub use crypt::{ENCRYPTED_OPTIONS, anonymize};
pub use defaults::{CURRENT_CONF_VERSION, MIN_MIGRATABLE_CONF_VERSION, default_config};
pub use inherit::merge_repo_with_group;
pub use store::{ConfigError, ConfigStore, GlobalOptions};
pub use view::{BackupOpts, EnvSection, GlobalPrometheus, RepoOpts, RepoView, RetentionPolicy, SourceType};

/// Environment variable that non-interactively authorizes permission
/// changes.
pub const ENV_MANAGER_PASSWORD: &str = "BACKHAUL_MANAGER_PASSWORD";
