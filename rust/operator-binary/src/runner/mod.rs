//! Reconciliation of [`RunnerPool`] resources into per-developer CI runner
//! deployments.

pub mod controller;

use std::collections::BTreeMap;

use snafu::{ResultExt, Snafu};
use stackable_operator::{
    builder::ObjectMetaBuilder,
    kube::api::ObjectMeta,
    labels::ObjectLabels,
};

use crate::crd::{
    runner::RunnerPool, APP_NAME, COMPONENT_RUNNER, LABEL_COMPONENT, OPERATOR_NAME,
    SPEC_HASH_ANNOTATION,
};

pub const RUNNER_CONTROLLER_NAME: &str = "runnerpool";
pub const RUNNER_FULL_CONTROLLER_NAME: &str = "runnerpool.apps.example.com";

#[derive(Snafu, Debug)]
pub enum MetaError {
    #[snafu(display("object is missing metadata to build owner reference"))]
    ObjectMissingMetadataForOwnerRef {
        source: stackable_operator::error::Error,
    },
}

pub fn build_recommended_labels<'a>(
    pool: &'a RunnerPool,
    app_version: &'a str,
    role: &'a str,
    role_group: &'a str,
) -> ObjectLabels<'a, RunnerPool> {
    ObjectLabels {
        owner: pool,
        app_name: APP_NAME,
        app_version,
        operator_name: OPERATOR_NAME,
        controller_name: RUNNER_CONTROLLER_NAME,
        role,
        role_group,
    }
}

/// Metadata for an owned, namespaced child of the pool.
pub fn build_child_meta(
    pool: &RunnerPool,
    name: &str,
    extra_labels: BTreeMap<String, String>,
    spec_hash: &str,
) -> Result<ObjectMeta, MetaError> {
    let sanitized = pool.sanitized_username();
    let mut meta = ObjectMetaBuilder::new()
        .name_and_namespace(pool)
        .name(name)
        .ownerreference_from_resource(pool, None, Some(true))
        .context(ObjectMissingMetadataForOwnerRefSnafu)?
        .with_recommended_labels(build_recommended_labels(
            pool,
            "v1alpha1",
            COMPONENT_RUNNER,
            &sanitized,
        ))
        .build();
    decorate(&mut meta, extra_labels, spec_hash);
    Ok(meta)
}

/// Metadata for the pool's ClusterRole. Cluster-scoped objects cannot carry
/// an owner reference to a namespaced pool, so this one is identified by
/// labels alone.
pub fn build_cluster_scoped_meta(
    pool: &RunnerPool,
    name: &str,
    extra_labels: BTreeMap<String, String>,
    spec_hash: &str,
) -> ObjectMeta {
    let sanitized = pool.sanitized_username();
    let mut meta = ObjectMetaBuilder::new()
        .name(name)
        .with_recommended_labels(build_recommended_labels(
            pool,
            "v1alpha1",
            COMPONENT_RUNNER,
            &sanitized,
        ))
        .build();
    decorate(&mut meta, extra_labels, spec_hash);
    meta
}

fn decorate(meta: &mut ObjectMeta, extra_labels: BTreeMap<String, String>, spec_hash: &str) {
    let labels = meta.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(LABEL_COMPONENT.to_string(), COMPONENT_RUNNER.to_string());
    labels.extend(extra_labels);
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(SPEC_HASH_ANNOTATION.to_string(), spec_hash.to_string());
}
