//! The options tree.
//!
//! One immutable snapshot of everything the daemon can be told.  Each
//! subsystem's tunables live in that subsystem's crate; this module
//! composes them, adds the daemon-level sections, and owns the schema
//! metadata the differ consults (which paths require a restart, which
//! are secrets).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use safelog::Sensitive;
use serde::{Deserialize, Serialize};

use slsk_shares::SharesConfig;
use slsk_transfers::UploadGroupsConfig;

use crate::err::ConfigError;

/// Leaf paths (or subtree prefixes) that cannot change while the daemon
/// is running.  A diff touching one of these raises `pending-restart`.
pub(crate) const RESTART_REQUIRED_PATHS: &[&str] = &[
    "instance_name",
    "relay.mode",
    "relay.agent.controller_address",
    "searches_database",
    "shares",
];

/// Leaf paths (or subtree prefixes) whose values must never appear in
/// logs.
pub(crate) const SENSITIVE_PATHS: &[&str] = &[
    "soulseek.password",
    "relay.agent.secret",
    "relay.controller.agents",
];

/// The subtree whose changes are collected into a patch for the
/// peer-protocol client.  Any change under it requires (at most) a
/// server reconnect, never a restart.
pub(crate) const SOULSEEK_SUBTREE: &str = "soulseek";

/// Connection settings for the Soulseek server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct SoulseekOptions {
    /// The server to connect to, as `host:port`.
    pub address: String,
    /// The username to log in with.  Absent credentials park the
    /// connection watchdog instead of failing startup.
    pub username: Option<String>,
    /// The password to log in with.
    pub password: Option<Sensitive<String>>,
    /// The port peers connect back to us on.
    pub listen_port: Option<u16>,
    /// Free-text self-description shown to peers.
    pub description: String,
    /// How long one connection attempt may take.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for SoulseekOptions {
    fn default() -> Self {
        SoulseekOptions {
            address: "vps.slsknet.org:2271".to_owned(),
            username: None,
            password: None,
            listen_port: Some(50300),
            description: "a slskd-rs user".to_owned(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Which relay role this instance plays, if any.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum RelayMode {
    /// Relay is off.
    #[default]
    Disabled,
    /// Aggregate agents' shares and proxy their files.
    Controller,
    /// Offer our shares to a controller.
    Agent,
}

/// One agent a controller will accept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::exhaustive_structs)] // plain data carrier
pub struct RelayAgentEntry {
    /// The agent's instance name.
    pub name: String,
    /// The secret shared with that agent.
    pub secret: Sensitive<String>,
}

/// Agent-side relay settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct RelayAgentOptions {
    /// Where the controller lives.
    pub controller_address: String,
    /// The secret shared with the controller.
    pub secret: Sensitive<String>,
}

/// Relay settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct RelayOptions {
    /// Which role to play.
    pub mode: RelayMode,
    /// Controller-side settings: the permitted agents.
    pub controller: RelayControllerOptions,
    /// Agent-side settings.
    pub agent: RelayAgentOptions,
}

/// Controller-side relay settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct RelayControllerOptions {
    /// The agents this controller accepts.
    pub agents: Vec<RelayAgentEntry>,
}

/// Everything the daemon can be told.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct Options {
    /// This instance's name; relay agents are known to their controller
    /// by it.
    pub instance_name: String,
    /// Path of the searches database.  Empty means in-memory.
    pub searches_database: String,
    /// Soulseek server settings.
    pub soulseek: SoulseekOptions,
    /// Share index settings.
    pub shares: SharesConfig,
    /// Upload scheduler groups.
    pub groups: UploadGroupsConfig,
    /// Relay settings.
    pub relay: RelayOptions,
}

impl Options {
    /// Load and validate options from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Arc<Self>, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(Arc::new(e)))?;
        Self::from_yaml(&text)
    }

    /// Parse and validate options from YAML text.
    pub fn from_yaml(text: &str) -> Result<Arc<Self>, ConfigError> {
        let options: Options =
            serde_yaml::from_str(text).map_err(|e| ConfigError::Parse(Arc::new(e)))?;
        options.validate()?;
        Ok(Arc::new(options))
    }

    /// Check the tree for inconsistencies no field type can express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        /// Shorthand for a validation failure.
        fn invalid(reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                reason: reason.into(),
            }
        }

        if self.groups.global_slots == 0 {
            return Err(invalid("groups.global_slots must be at least 1"));
        }
        for group in &self.groups.user_defined {
            let name = group.name.trim();
            if name.is_empty() {
                return Err(invalid("user-defined group with empty name"));
            }
            if ["privileged", "default", "leechers"].contains(&name) {
                return Err(invalid(format!(
                    "user-defined group {name:?} shadows a built-in group"
                )));
            }
        }
        if self.shares.min_query_chars == 0 {
            return Err(invalid("shares.min_query_chars must be at least 1"));
        }
        if self.shares.max_search_results == 0 {
            return Err(invalid("shares.max_search_results must be at least 1"));
        }
        match self.relay.mode {
            RelayMode::Disabled => {}
            RelayMode::Controller => {
                if self.relay.controller.agents.is_empty() {
                    return Err(invalid("relay.mode=controller with no agents configured"));
                }
                if self
                    .relay
                    .controller
                    .agents
                    .iter()
                    .any(|a| a.name.trim().is_empty() || a.secret.as_inner().is_empty())
                {
                    return Err(invalid("relay agent entries need a name and a secret"));
                }
            }
            RelayMode::Agent => {
                if self.relay.agent.controller_address.is_empty() {
                    return Err(invalid("relay.mode=agent without a controller_address"));
                }
                if self.relay.agent.secret.as_inner().is_empty() {
                    return Err(invalid("relay.mode=agent without a secret"));
                }
                if self.instance_name.trim().is_empty() {
                    return Err(invalid("relay.mode=agent requires an instance_name"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let options = Options::default();
        options.validate().unwrap();
        assert_eq!(options.soulseek.listen_port, Some(50300));
    }

    #[test]
    fn yaml_round_trip() {
        let yaml = r#"
instance_name: basement
soulseek:
  username: alice
  password: hunter2
  listen_port: 2234
  connect_timeout: 5s
shares:
  min_query_chars: 4
groups:
  global_slots: 5
  leechers:
    priority: 99
    slots: 1
"#;
        let options = Options::from_yaml(yaml).unwrap();
        assert_eq!(options.instance_name, "basement");
        assert_eq!(options.soulseek.username.as_deref(), Some("alice"));
        assert_eq!(
            options.soulseek.password.as_ref().map(|p| p.as_inner().clone()),
            Some("hunter2".to_owned())
        );
        assert_eq!(options.soulseek.connect_timeout, Duration::from_secs(5));
        assert_eq!(options.shares.min_query_chars, 4);
        assert_eq!(options.groups.global_slots, 5);
        assert_eq!(options.groups.leechers.priority, 99);
        // Unspecified sections keep their defaults.
        assert_eq!(options.groups.default.priority, 5);
    }

    #[test]
    fn password_does_not_leak_through_debug() {
        let options = Options::from_yaml("soulseek: {password: hunter2}").unwrap();
        let debugged = format!("{:?}", options.soulseek);
        assert!(!debugged.contains("hunter2"), "{debugged}");
    }

    #[test]
    fn validation_rejects_bad_groups() {
        let yaml = r#"
groups:
  user_defined:
    - name: default
      priority: 1
"#;
        assert!(matches!(
            Options::from_yaml(yaml),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn validation_rejects_incomplete_relay_sections() {
        let controller = "relay: {mode: controller}";
        assert!(Options::from_yaml(controller).is_err());

        let agent = "relay: {mode: agent}";
        assert!(Options::from_yaml(agent).is_err());

        let agent_ok = r#"
instance_name: basement
relay:
  mode: agent
  agent:
    controller_address: "https://attic.example:5030"
    secret: swordfish
"#;
        Options::from_yaml(agent_ok).unwrap();
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        assert!(matches!(
            Options::from_yaml("{{nope"),
            Err(ConfigError::Parse(_))
        ));
    }
}
