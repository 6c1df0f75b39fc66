//! Maps raw storage paths onto logical resource coordinates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Per-resource-type rule inside a prefix table entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceRule {
    #[serde(default)]
    pub namespaced: bool,
    /// Logical resource substituted for the on-disk type when they differ.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_name: Option<String>,
}

impl ResourceRule {
    pub fn namespaced() -> Self {
        Self {
            namespaced: true,
            resource_name: None,
        }
    }

    pub fn cluster_scoped() -> Self {
        Self::default()
    }

    pub fn aliased(resource_name: &str) -> Self {
        Self {
            namespaced: true,
            resource_name: Some(resource_name.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceKey {
    pub resource: String,
    pub namespace: String,
    pub name: String,
}

/// Two-level table: top-level path prefix to raw resource type to rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrefixMap(BTreeMap<String, BTreeMap<String, ResourceRule>>);

impl PrefixMap {
    pub fn new(table: BTreeMap<String, BTreeMap<String, ResourceRule>>) -> Self {
        Self(table)
    }

    /// The OpenShift and Kubernetes resource types the archiver tracks by
    /// default.
    pub fn cluster_defaults() -> Self {
        let mut openshift = BTreeMap::new();
        openshift.insert("buildconfigs".to_string(), ResourceRule::namespaced());
        openshift.insert("deploymentconfigs".to_string(), ResourceRule::namespaced());
        openshift.insert(
            "replicationcontrollers".to_string(),
            ResourceRule::namespaced(),
        );
        openshift.insert("imagestreams".to_string(), ResourceRule::namespaced());
        openshift.insert("images".to_string(), ResourceRule::cluster_scoped());

        let mut kubernetes = BTreeMap::new();
        kubernetes.insert("namespaces".to_string(), ResourceRule::cluster_scoped());
        kubernetes.insert(
            "controllers".to_string(),
            ResourceRule::aliased("replicationcontrollers"),
        );
        kubernetes.insert("pods".to_string(), ResourceRule::namespaced());

        let mut table = BTreeMap::new();
        table.insert("openshift.io".to_string(), openshift);
        table.insert("kubernetes.io".to_string(), kubernetes);
        Self(table)
    }

    /// Resolves a storage path to `(resource, namespace, name)`, or `None`
    /// when the path does not match the table.
    ///
    /// Paths have the shape `/<prefix>/<type>/<namespace>/<name>` for
    /// namespaced entries and `/<prefix>/<type>/<name>` otherwise; the arity
    /// must match the entry exactly.
    pub fn key_for_path(&self, path: &str) -> Option<ResourceKey> {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        let segments: Vec<&str> = trimmed.splitn(4, '/').collect();
        if segments.len() < 2 {
            return None;
        }

        let rules = self.0.get(segments[0])?;
        let raw_type = segments[1];
        let rule = rules.get(raw_type)?;

        let (namespace, name) = if rule.namespaced {
            if segments.len() != 4 {
                return None;
            }
            (segments[2], segments[3])
        } else {
            if segments.len() != 3 {
                return None;
            }
            ("", segments[2])
        };

        let resource = rule
            .resource_name
            .clone()
            .unwrap_or_else(|| raw_type.to_string());

        Some(ResourceKey {
            resource,
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(resource: &str, namespace: &str, name: &str) -> ResourceKey {
        ResourceKey {
            resource: resource.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn maps_namespaced_paths() {
        let map = PrefixMap::cluster_defaults();
        assert_eq!(
            map.key_for_path("/kubernetes.io/pods/default/p1"),
            Some(key("pods", "default", "p1"))
        );
        assert_eq!(
            map.key_for_path("/openshift.io/buildconfigs/dev/frontend"),
            Some(key("buildconfigs", "dev", "frontend"))
        );
    }

    #[test]
    fn maps_cluster_scoped_paths() {
        let map = PrefixMap::cluster_defaults();
        assert_eq!(
            map.key_for_path("/kubernetes.io/namespaces/default"),
            Some(key("namespaces", "", "default"))
        );
        assert_eq!(
            map.key_for_path("/openshift.io/images/sha-abc123"),
            Some(key("images", "", "sha-abc123"))
        );
    }

    #[test]
    fn substitutes_aliased_resource_names() {
        let map = PrefixMap::cluster_defaults();
        assert_eq!(
            map.key_for_path("/kubernetes.io/controllers/default/rc-1"),
            Some(key("replicationcontrollers", "default", "rc-1"))
        );
    }

    #[test]
    fn rejects_arity_mismatches() {
        let map = PrefixMap::cluster_defaults();
        // namespaced entry without a namespace
        assert_eq!(map.key_for_path("/kubernetes.io/pods/p1"), None);
        // cluster-scoped entry with a namespace
        assert_eq!(map.key_for_path("/kubernetes.io/namespaces/default/extra"), None);
    }

    #[test]
    fn rejects_unknown_prefixes_and_types() {
        let map = PrefixMap::cluster_defaults();
        assert_eq!(map.key_for_path("/unknown.io/widgets/x"), None);
        assert_eq!(map.key_for_path("/kubernetes.io/widgets/default/x"), None);
        assert_eq!(map.key_for_path("/kubernetes.io"), None);
        assert_eq!(map.key_for_path("/"), None);
    }

    #[test]
    fn splits_into_at_most_four_segments() {
        // the final segment absorbs any remaining path
        let map = PrefixMap::cluster_defaults();
        assert_eq!(
            map.key_for_path("/kubernetes.io/pods/default/p1/nested"),
            Some(key("pods", "default", "p1/nested"))
        );
    }

    #[test]
    fn tolerates_missing_leading_slash() {
        let map = PrefixMap::cluster_defaults();
        assert_eq!(
            map.key_for_path("kubernetes.io/pods/default/p1"),
            Some(key("pods", "default", "p1"))
        );
    }
}
