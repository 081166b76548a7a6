//! Helpers for reading identity and labels off Kubernetes objects

use kube::Resource;

/// Stable `namespace/name` identity, or just `name` for cluster-scoped objects.
///
/// Used as the debounce key so that every event for one object coalesces.
pub fn namespace_and_name<K: Resource>(resource: &K) -> String {
    let meta = resource.meta();
    let name = meta.name.as_deref().unwrap_or("unknown");
    match meta.namespace.as_deref() {
        Some(namespace) => format!("{namespace}/{name}"),
        None => name.to_string(),
    }
}

/// Value of the label `key`, if present
pub fn label_value<'a, K: Resource>(resource: &'a K, key: &str) -> Option<&'a str> {
    resource
        .meta()
        .labels
        .as_ref()
        .and_then(|labels| labels.get(key))
        .map(String::as_str)
}
