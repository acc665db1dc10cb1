//! Reconciliation of [`DevStagingEnvironment`] resources into application
//! stacks.

pub mod controller;
pub mod dependency;

use std::collections::BTreeMap;

use snafu::{ResultExt, Snafu};
use stackable_operator::{
    builder::ObjectMetaBuilder,
    kube::api::ObjectMeta,
    labels::ObjectLabels,
};

use crate::crd::{
    environment::DevStagingEnvironment, APP_NAME, LABEL_ENVIRONMENT, OPERATOR_NAME,
    SPEC_HASH_ANNOTATION,
};

pub const ENVIRONMENT_CONTROLLER_NAME: &str = "devstagingenvironment";
pub const ENVIRONMENT_FULL_CONTROLLER_NAME: &str = "devstagingenvironment.apps.example.com";

#[derive(Snafu, Debug)]
pub enum MetaError {
    #[snafu(display("object is missing metadata to build owner reference"))]
    ObjectMissingMetadataForOwnerRef {
        source: stackable_operator::error::Error,
    },
}

/// Recommended labels for every object derived from an environment.
pub fn build_recommended_labels<'a>(
    env: &'a DevStagingEnvironment,
    app_version: &'a str,
    role: &'a str,
    role_group: &'a str,
) -> ObjectLabels<'a, DevStagingEnvironment> {
    ObjectLabels {
        owner: env,
        app_name: APP_NAME,
        app_version,
        operator_name: OPERATOR_NAME,
        controller_name: ENVIRONMENT_CONTROLLER_NAME,
        role,
        role_group,
    }
}

/// Object metadata for an owned child: owner reference, recommended labels,
/// the environment identity label, any component-specific labels, and the
/// spec-hash annotation the write gate compares against.
pub fn build_child_meta(
    env: &DevStagingEnvironment,
    name: &str,
    app_version: &str,
    role: &str,
    role_group: &str,
    extra_labels: BTreeMap<String, String>,
    spec_hash: &str,
) -> Result<ObjectMeta, MetaError> {
    let mut meta = ObjectMetaBuilder::new()
        .name_and_namespace(env)
        .name(name)
        .ownerreference_from_resource(env, None, Some(true))
        .context(ObjectMissingMetadataForOwnerRefSnafu)?
        .with_recommended_labels(build_recommended_labels(env, app_version, role, role_group))
        .build();
    let labels = meta.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(
        LABEL_ENVIRONMENT.to_string(),
        stackable_operator::kube::ResourceExt::name_any(env),
    );
    labels.extend(extra_labels);
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(SPEC_HASH_ANNOTATION.to_string(), spec_hash.to_string());
    Ok(meta)
}

/// The version component of an image reference, used as the
/// `app.kubernetes.io/version` label value.
pub fn image_version(image: &str) -> &str {
    image
        .rsplit_once(':')
        .map(|(_, tag)| tag)
        .filter(|tag| !tag.contains('/'))
        .unwrap_or("latest")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_version_extracts_tags() {
        assert_eq!(image_version("nginx:1.25"), "1.25");
        assert_eq!(image_version("registry:5000/api:v1"), "v1");
        assert_eq!(image_version("nginx"), "latest");
        // a port without a tag is not a version
        assert_eq!(image_version("registry:5000/api"), "latest");
    }
}
