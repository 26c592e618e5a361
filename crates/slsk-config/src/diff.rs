//! Diffing two options snapshots.
//!
//! Both snapshots are serialized to value trees and walked in lockstep;
//! every leaf whose value differs yields one [`OptionDiff`] carrying the
//! dotted path, both values, and the flags the schema metadata assigns
//! to that path.  Sequences are treated as atomic leaves: reordering a
//! list is a change to the list.

use serde_json::Value;

use crate::err::ConfigError;
use crate::options::{Options, SoulseekOptions, RESTART_REQUIRED_PATHS, SENSITIVE_PATHS, SOULSEEK_SUBTREE};

/// One changed leaf between two options snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct OptionDiff {
    /// Dotted path of the leaf, e.g. `soulseek.listen_port`.
    pub path: String,
    /// The value in the old snapshot (`Null` when newly introduced).
    pub old: Value,
    /// The value in the new snapshot (`Null` when removed).
    pub new: Value,
    /// The change only takes effect after a restart.
    pub requires_restart: bool,
    /// The change is under `soulseek.*` and goes into the peer-client
    /// patch; applying it may require a server reconnect.
    pub soulseek_scoped: bool,
    /// The values are secrets and must not be logged.
    pub sensitive: bool,
}

impl OptionDiff {
    /// Render one side of the diff for logging, scrubbing secrets.
    pub fn display_value(&self, value: &Value) -> String {
        if self.sensitive {
            "[scrubbed]".to_owned()
        } else {
            value.to_string()
        }
    }
}

/// Does `path` name `entry` itself or something inside it?
fn path_within(path: &str, entry: &str) -> bool {
    path == entry
        || path
            .strip_prefix(entry)
            .map_or(false, |rest| rest.starts_with('.'))
}

/// Compute the flags for a changed path.
fn flags_for(path: &str) -> (bool, bool, bool) {
    let requires_restart = RESTART_REQUIRED_PATHS
        .iter()
        .any(|e| path_within(path, e));
    let soulseek_scoped = path_within(path, SOULSEEK_SUBTREE);
    let sensitive = SENSITIVE_PATHS.iter().any(|e| path_within(path, e));
    (requires_restart, soulseek_scoped, sensitive)
}

/// Diff two options snapshots.
///
/// Equal snapshots yield an empty list.
pub fn diff_options(old: &Options, new: &Options) -> Result<Vec<OptionDiff>, ConfigError> {
    let old = serde_json::to_value(old).map_err(|e| ConfigError::Serialize(std::sync::Arc::new(e)))?;
    let new = serde_json::to_value(new).map_err(|e| ConfigError::Serialize(std::sync::Arc::new(e)))?;
    let mut out = Vec::new();
    walk("", &old, &new, &mut out);
    Ok(out)
}

/// Recursive lockstep walk.
fn walk(path: &str, old: &Value, new: &Value, out: &mut Vec<OptionDiff>) {
    match (old, new) {
        (Value::Object(a), Value::Object(b)) => {
            let mut keys: Vec<&String> = a.keys().chain(b.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                let old_child = a.get(key).unwrap_or(&Value::Null);
                let new_child = b.get(key).unwrap_or(&Value::Null);
                walk(&child_path, old_child, new_child, out);
            }
        }
        _ if old != new => {
            let (requires_restart, soulseek_scoped, sensitive) = flags_for(path);
            out.push(OptionDiff {
                path: path.to_owned(),
                old: old.clone(),
                new: new.clone(),
                requires_restart,
                soulseek_scoped,
                sensitive,
            });
        }
        _ => {}
    }
}

/// The subset of changed `soulseek.*` settings, for the peer client.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct SoulseekPatch {
    /// Dotted paths of the changed leaves.
    pub changed: Vec<String>,
    /// The full new `soulseek` section; the client applies the fields
    /// named in `changed`.
    pub options: SoulseekOptions,
}

impl SoulseekPatch {
    /// Build the patch from a diff and the new snapshot.
    pub fn from_diffs(diffs: &[OptionDiff], new: &Options) -> Self {
        SoulseekPatch {
            changed: diffs
                .iter()
                .filter(|d| d.soulseek_scoped)
                .map(|d| d.path.clone())
                .collect(),
            options: new.soulseek.clone(),
        }
    }

    /// True if nothing in the `soulseek` subtree changed.
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }

    /// True if the named leaf changed.
    pub fn changed(&self, leaf: &str) -> bool {
        self.changed.iter().any(|p| p == leaf)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn equal_snapshots_diff_to_nothing() {
        let a = Options::default();
        assert!(diff_options(&a, &a.clone()).unwrap().is_empty());
    }

    #[test]
    fn changed_leaves_are_reported_with_flags() {
        let a = Options::default();
        let mut b = a.clone();
        b.soulseek.listen_port = Some(54321);
        b.instance_name = "attic".to_owned();

        let diffs = diff_options(&a, &b).unwrap();
        assert_eq!(diffs.len(), 2);

        let port = diffs
            .iter()
            .find(|d| d.path == "soulseek.listen_port")
            .unwrap();
        assert!(port.soulseek_scoped);
        assert!(!port.requires_restart);
        assert_eq!(port.new, serde_json::json!(54321));

        let name = diffs.iter().find(|d| d.path == "instance_name").unwrap();
        assert!(name.requires_restart);
        assert!(!name.soulseek_scoped);
    }

    #[test]
    fn patch_contains_only_soulseek_changes() {
        let a = Options::default();
        let mut b = a.clone();
        b.soulseek.listen_port = Some(54321);
        b.instance_name = "attic".to_owned();

        let diffs = diff_options(&a, &b).unwrap();
        let patch = SoulseekPatch::from_diffs(&diffs, &b);
        assert_eq!(patch.changed, vec!["soulseek.listen_port".to_owned()]);
        assert!(patch.changed("soulseek.listen_port"));
        assert!(!patch.changed("soulseek.address"));
        assert_eq!(patch.options.listen_port, Some(54321));
    }

    #[test]
    fn sensitive_paths_are_scrubbed_for_display() {
        let a = Options::default();
        let mut b = a.clone();
        b.soulseek.password = Some("hunter2".to_owned().into());

        let diffs = diff_options(&a, &b).unwrap();
        let pw = diffs.iter().find(|d| d.path == "soulseek.password").unwrap();
        assert!(pw.sensitive);
        assert_eq!(pw.display_value(&pw.new), "[scrubbed]");
        // The raw value is still present for appliers, just not shown.
        assert_eq!(pw.new, serde_json::json!("hunter2"));
    }

    #[test]
    fn sequences_diff_atomically() {
        let a = Options::default();
        let mut b = a.clone();
        b.shares
            .blacklisted_usernames
            .insert("spider".to_owned());

        let diffs = diff_options(&a, &b).unwrap();
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].path, "shares.blacklisted_usernames");
    }

    #[test]
    fn prefix_matching_is_segment_aware() {
        // "soulseek_extra" is not inside "soulseek".
        assert!(path_within("soulseek.listen_port", "soulseek"));
        assert!(!path_within("soulseek_extra.x", "soulseek"));
        assert!(path_within("soulseek", "soulseek"));
    }
}
