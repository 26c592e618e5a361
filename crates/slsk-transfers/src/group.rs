//! Upload groups and their configuration.

use serde::{Deserialize, Serialize};

/// Name of the built-in group for privileged users.
pub const PRIVILEGED_GROUP: &str = "privileged";
/// Name of the built-in group ordinary users fall into.
pub const DEFAULT_GROUP: &str = "default";
/// Name of the built-in group for users classified as leechers.
pub const LEECHERS_GROUP: &str = "leechers";

/// How a group chooses among its candidate uploads.
///
/// Adding a strategy means adding a variant here and a selection key in
/// the queue; nothing else changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum QueueStrategy {
    /// Strict enqueue-order release across all users in the group.
    #[default]
    FirstInFirstOut,
    /// Rotate across users: each user's head upload competes, and a
    /// release sends that user to the back of the rotation.
    RoundRobin,
}

/// Configuration for one upload group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct GroupConfig {
    /// Release priority; lower is released first.
    pub priority: u32,
    /// Slot budget.  Clamped to the global slot cap.
    pub slots: u32,
    /// Release strategy.
    pub strategy: QueueStrategy,
}

impl Default for GroupConfig {
    fn default() -> Self {
        GroupConfig {
            priority: 5,
            slots: u32::MAX,
            strategy: QueueStrategy::default(),
        }
    }
}

/// A user-defined group: a name plus its configuration.
///
/// Declaration order is significant; it breaks priority ties after the
/// built-in groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct NamedGroupConfig {
    /// The group's name.
    pub name: String,
    /// The group's configuration.
    #[serde(flatten)]
    pub config: GroupConfig,
}

/// Configuration for the whole group table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct UploadGroupsConfig {
    /// Cap on any single group's slot budget.
    pub global_slots: u32,
    /// The built-in privileged group.
    pub privileged: GroupConfig,
    /// The built-in default group.
    pub default: GroupConfig,
    /// The built-in leechers group.
    pub leechers: GroupConfig,
    /// User-defined groups, in declaration order.
    pub user_defined: Vec<NamedGroupConfig>,
}

impl Default for UploadGroupsConfig {
    fn default() -> Self {
        UploadGroupsConfig {
            global_slots: 10,
            privileged: GroupConfig {
                priority: 0,
                ..GroupConfig::default()
            },
            default: GroupConfig::default(),
            leechers: GroupConfig {
                priority: 10,
                slots: 1,
                ..GroupConfig::default()
            },
            user_defined: Vec::new(),
        }
    }
}

impl UploadGroupsConfig {
    /// Iterate over all configured groups in declaration order:
    /// the three built-ins, then user-defined groups.
    pub fn declared(&self) -> impl Iterator<Item = (&str, &GroupConfig)> {
        [
            (PRIVILEGED_GROUP, &self.privileged),
            (DEFAULT_GROUP, &self.default),
            (LEECHERS_GROUP, &self.leechers),
        ]
        .into_iter()
        .chain(self.user_defined.iter().map(|g| (g.name.as_str(), &g.config)))
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn declaration_order() {
        let mut cfg = UploadGroupsConfig::default();
        cfg.user_defined.push(NamedGroupConfig {
            name: "friends".into(),
            config: GroupConfig::default(),
        });
        let names: Vec<&str> = cfg.declared().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["privileged", "default", "leechers", "friends"]);
    }

    #[test]
    fn strategy_serde_names() {
        let s: QueueStrategy = serde_json::from_str(r#""round_robin""#).unwrap();
        assert_eq!(s, QueueStrategy::RoundRobin);
        let s: QueueStrategy = serde_json::from_str(r#""first_in_first_out""#).unwrap();
        assert_eq!(s, QueueStrategy::FirstInFirstOut);
    }
}
