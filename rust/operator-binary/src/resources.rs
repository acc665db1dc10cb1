//! Hash-gated writes and ownership-checked deletes.
//!
//! Children are rewritten only when absent or when their stored spec-hash
//! annotation differs from the freshly computed one, so a reconcile pass
//! over an unchanged spec performs no writes. Reads and deletes go through
//! `kube::Api` handles obtained from the operator client; writes go through
//! the client's server-side apply.

use std::fmt::Debug;

use serde::{de::DeserializeOwned, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    client::Client,
    kube::{
        self,
        api::{DeleteParams, ListParams},
        core::NamespaceResourceScope,
        Api, Resource, ResourceExt,
    },
};

use crate::crd::SPEC_HASH_ANNOTATION;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to read {name}"))]
    Get { source: kube::Error, name: String },
    #[snafu(display("failed to list objects matching {selector}"))]
    List {
        source: kube::Error,
        selector: String,
    },
    #[snafu(display("failed to delete {name}"))]
    Delete { source: kube::Error, name: String },
    #[snafu(display("failed to apply {name}"))]
    Apply {
        source: stackable_operator::error::Error,
        name: String,
    },
    #[snafu(display("object {name} has no namespace"))]
    NoNamespace { name: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

fn api_for<T>(client: &Client, namespace: &str) -> Api<T>
where
    T: Resource<Scope = NamespaceResourceScope> + DeserializeOwned + Clone + Debug,
    T::DynamicType: Default,
{
    Api::namespaced(client.as_kube_client(), namespace)
}

pub async fn get_opt<T>(client: &Client, name: &str, namespace: &str) -> Result<Option<T>>
where
    T: Resource<Scope = NamespaceResourceScope> + DeserializeOwned + Clone + Debug,
    T::DynamicType: Default,
{
    api_for::<T>(client, namespace)
        .get_opt(name)
        .await
        .context(GetSnafu { name })
}

/// Lists objects in `namespace` matching a label selector.
pub async fn list_with_labels<T>(
    client: &Client,
    namespace: &str,
    label_selector: &str,
) -> Result<Vec<T>>
where
    T: Resource<Scope = NamespaceResourceScope> + DeserializeOwned + Clone + Debug,
    T::DynamicType: Default,
{
    api_for::<T>(client, namespace)
        .list(&ListParams::default().labels(label_selector))
        .await
        .map(|list| list.items)
        .context(ListSnafu {
            selector: label_selector,
        })
}

/// True when the existing object already carries the computed spec hash.
pub fn hash_matches<T: Resource>(existing: &T, hash: &str) -> bool {
    existing
        .meta()
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(SPEC_HASH_ANNOTATION))
        .map(|stored| stored == hash)
        .unwrap_or(false)
}

pub fn is_owned_by<T: Resource>(object: &T, owner_uid: &str) -> bool {
    object
        .meta()
        .owner_references
        .as_ref()
        .map(|refs| refs.iter().any(|r| r.uid == owner_uid))
        .unwrap_or(false)
}

/// Applies `resource` unless the live object already carries `hash`.
/// Returns the live object and whether a write happened.
pub async fn apply_if_changed<T>(
    client: &Client,
    field_manager: &str,
    resource: &T,
    hash: &str,
) -> Result<(T, bool)>
where
    T: Resource<Scope = NamespaceResourceScope> + Clone + Debug + DeserializeOwned + Serialize,
    T::DynamicType: Default,
{
    let name = resource.name_any();
    let namespace = resource
        .namespace()
        .with_context(|| NoNamespaceSnafu { name: name.clone() })?;
    if let Some(existing) = get_opt::<T>(client, &name, &namespace).await? {
        if hash_matches(&existing, hash) {
            return Ok((existing, false));
        }
    }
    let applied = client
        .apply_patch(field_manager, resource, resource)
        .await
        .with_context(|_| ApplySnafu { name: name.clone() })?;
    Ok((applied, true))
}

/// Deletes `name` when it exists and is owned by `owner_uid`. Returns
/// whether a delete was issued. Objects owned by someone else are left
/// alone.
pub async fn delete_if_owned<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    owner_uid: &str,
) -> Result<bool>
where
    T: Resource<Scope = NamespaceResourceScope> + DeserializeOwned + Clone + Debug,
    T::DynamicType: Default,
{
    let api = api_for::<T>(client, namespace);
    match api.get_opt(name).await.context(GetSnafu { name })? {
        Some(existing) if is_owned_by(&existing, owner_uid) => {
            api.delete(name, &DeleteParams::default())
                .await
                .map(|_| ())
                .context(DeleteSnafu { name })?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackable_operator::k8s_openapi::{
        api::core::v1::ConfigMap,
        apimachinery::pkg::apis::meta::v1::OwnerReference,
    };
    use std::collections::BTreeMap;

    fn config_map_with_hash(hash: Option<&str>) -> ConfigMap {
        let mut cm = ConfigMap::default();
        if let Some(hash) = hash {
            cm.metadata.annotations = Some(BTreeMap::from([(
                SPEC_HASH_ANNOTATION.to_string(),
                hash.to_string(),
            )]));
        }
        cm
    }

    #[test]
    fn hash_matches_only_on_equal_annotation() {
        assert!(hash_matches(&config_map_with_hash(Some("42")), "42"));
        assert!(!hash_matches(&config_map_with_hash(Some("42")), "43"));
        assert!(!hash_matches(&config_map_with_hash(None), "42"));
    }

    #[test]
    fn ownership_is_checked_by_uid() {
        let mut cm = ConfigMap::default();
        cm.metadata.owner_references = Some(vec![OwnerReference {
            uid: "uid-1".to_string(),
            ..OwnerReference::default()
        }]);
        assert!(is_owned_by(&cm, "uid-1"));
        assert!(!is_owned_by(&cm, "uid-2"));
        assert!(!is_owned_by(&ConfigMap::default(), "uid-1"));
    }
}
