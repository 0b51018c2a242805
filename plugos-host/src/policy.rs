//! Host policy: reads `~/.plugos/policy.toml` and decides which plugins may
//! load, which syscalls are hidden and what limits sandboxes run with.

use crate::sandbox::SandboxLimits;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Plugin admission mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    /// Only listed plugins may load.
    Allowlist,
    /// Every plugin except the listed ones may load.
    Denylist,
    #[default]
    Unrestricted,
}

/// Effective policy after parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyConfig {
    pub mode: PolicyMode,
    /// Plugin names the mode applies to.
    pub plugin_names: Vec<String>,
    /// Syscalls hidden from every plugin.
    pub denied_syscalls: HashSet<String>,
    pub limits: SandboxLimits,
}

pub struct PolicyEngine {
    config: PolicyConfig,
    policy_path: Option<PathBuf>,
}

impl PolicyEngine {
    /// Loads policy from `~/.plugos/policy.toml` if it exists.
    /// Falls back to unrestricted mode with a warning on parse errors.
    pub fn load() -> Self {
        Self::load_from(dirs_path().join("policy.toml"))
    }

    pub fn load_from(policy_path: PathBuf) -> Self {
        if !policy_path.exists() {
            info!("No policy file found at {:?}, running unrestricted", policy_path);
            return Self {
                config: PolicyConfig::default(),
                policy_path: None,
            };
        }

        match std::fs::read_to_string(&policy_path) {
            Ok(contents) => match toml::from_str::<PolicyFile>(&contents) {
                Ok(file) => {
                    info!("Loaded host policy from {:?}", policy_path);
                    Self {
                        config: file.into_config(),
                        policy_path: Some(policy_path),
                    }
                }
                Err(e) => {
                    warn!(
                        "Failed to parse policy file {:?}: {}. Falling back to unrestricted mode.",
                        policy_path, e
                    );
                    Self {
                        config: PolicyConfig::default(),
                        policy_path: Some(policy_path),
                    }
                }
            },
            Err(e) => {
                warn!("Failed to read policy file {:?}: {}", policy_path, e);
                Self {
                    config: PolicyConfig::default(),
                    policy_path: Some(policy_path),
                }
            }
        }
    }

    pub fn with_config(config: PolicyConfig) -> Self {
        Self {
            config,
            policy_path: None,
        }
    }

    pub fn is_plugin_allowed(&self, plugin: &str) -> bool {
        let listed = self.config.plugin_names.iter().any(|name| name == plugin);
        match self.config.mode {
            PolicyMode::Unrestricted => true,
            PolicyMode::Allowlist => listed,
            PolicyMode::Denylist => !listed,
        }
    }

    pub fn is_syscall_denied(&self, syscall: &str) -> bool {
        self.config.denied_syscalls.contains(syscall)
    }

    pub fn limits(&self) -> SandboxLimits {
        self.config.limits
    }

    /// Returns whether a policy file was found.
    pub fn has_policy_file(&self) -> bool {
        self.policy_path.is_some()
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }
}

/// Raw TOML structure matching the policy.toml format.
#[derive(Deserialize)]
struct PolicyFile {
    #[serde(default)]
    policy: PolicySection,
    #[serde(default)]
    limits: SandboxLimits,
}

#[derive(Deserialize, Default)]
struct PolicySection {
    #[serde(default)]
    mode: PolicyMode,
    #[serde(default)]
    plugins: PluginList,
    #[serde(default)]
    syscalls: SyscallList,
}

#[derive(Deserialize, Default)]
struct PluginList {
    #[serde(default)]
    names: Vec<String>,
}

#[derive(Deserialize, Default)]
struct SyscallList {
    #[serde(default)]
    denied: Vec<String>,
}

impl PolicyFile {
    fn into_config(self) -> PolicyConfig {
        PolicyConfig {
            mode: self.policy.mode,
            plugin_names: self.policy.plugins.names,
            denied_syscalls: self.policy.syscalls.denied.into_iter().collect(),
            limits: self.limits,
        }
    }
}

/// Resolve the plugos config directory.
fn dirs_path() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        Path::new(&home).join(".plugos")
    } else if let Ok(home) = std::env::var("USERPROFILE") {
        Path::new(&home).join(".plugos")
    } else {
        PathBuf::from(".plugos")
    }
}
