//! # Resource module
//!
//! This module provide helpers on kubernetes [`Resource`]

use std::fmt::Debug;

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    api::{Patch, PatchParams, PostParams},
    core::NamespaceResourceScope,
    Api, Client, CustomResourceExt, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

// -----------------------------------------------------------------------------
// constants

/// field manager recorded by server-side apply requests
pub const FIELD_MANAGER: &str = "lambda-operator";

// -----------------------------------------------------------------------------
// Helpers functions

/// returns if the resource is considered from kubernetes point of view as deleted
pub fn deleted<T>(obj: &T) -> bool
where
    T: Resource,
{
    obj.meta().deletion_timestamp.is_some()
}

/// returns the namespace and name of the kubernetes resource.
///
/// # Panic
///
/// panic if the namespace or name is null which is impossible btw
pub fn namespaced_name<T>(obj: &T) -> (String, String)
where
    T: ResourceExt,
{
    (
        obj.namespace()
            .expect("resource to be owned by a namespace"),
        obj.name_any(),
    )
}

/// returns difference between the two given objects serialized as json patch
pub fn diff<T>(origin: &T, modified: &T) -> Result<json_patch::Patch, serde_json::Error>
where
    T: Serialize,
{
    Ok(json_patch::diff(
        &serde_json::to_value(origin)?,
        &serde_json::to_value(modified)?,
    ))
}

/// make a patch request on the given resource using the given patch
pub async fn patch<T>(client: Client, obj: &T, patch: json_patch::Patch) -> Result<T, kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope> + DeserializeOwned + Serialize + Clone + Debug,
    <T as Resource>::DynamicType: Default,
{
    let (namespace, name) = namespaced_name(obj);

    if patch.0.is_empty() {
        debug!(
            namespace = &namespace,
            name = &name,
            "skip patch request on resource, no operation to apply",
        );

        return Ok(obj.to_owned());
    }

    debug!(
        namespace = &namespace,
        name = &name,
        "execute patch request on resource",
    );

    Api::namespaced(client, &namespace)
        .patch(&name, &PatchParams::default(), &Patch::Json::<T>(patch))
        .await
}

/// make a patch request on the given resource's status using the given patch
pub async fn patch_status<T>(
    client: Client,
    obj: T,
    patch: json_patch::Patch,
) -> Result<T, kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope> + DeserializeOwned + Serialize + Clone + Debug,
    <T as Resource>::DynamicType: Default,
{
    let (namespace, name) = namespaced_name(&obj);

    if patch.0.is_empty() {
        debug!(
            namespace = &namespace,
            name = &name,
            "skip patch request on resource's status, no operation to apply",
        );

        return Ok(obj.to_owned());
    }

    debug!(
        namespace = &namespace,
        name = &name,
        "execute patch request on resource's status",
    );

    Api::namespaced(client, &namespace)
        .patch_status(&name, &PatchParams::default(), &Patch::Json::<T>(patch))
        .await
}

/// returns the resource of the given name in the given namespace, absence is
/// not an error
pub async fn get<T>(client: Client, namespace: &str, name: &str) -> Result<Option<T>, kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope> + DeserializeOwned + Clone + Debug,
    <T as Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client, namespace);

    debug!(
        namespace = namespace,
        name = name,
        "execute a request to retrieve resource",
    );

    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(err)) if err.code == 404 => Ok(None),
        Err(err) => Err(err),
    }
}

/// create the resource when it does not already exist, patch it with the
/// difference otherwise. The creation race with a concurrent writer is
/// resolved by treating an already-exists answer as success of the intent
pub async fn upsert<T>(client: Client, obj: &T) -> Result<T, kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope> + DeserializeOwned + Serialize + Clone + Debug,
    <T as Resource>::DynamicType: Default,
{
    let (namespace, name) = namespaced_name(obj);

    if let Some(o) = get(client.to_owned(), &namespace, &name).await? {
        let p = diff(&o, obj).map_err(kube::Error::SerdeError)?;
        return patch(client, obj, p).await;
    }

    debug!(
        namespace = &namespace,
        name = &name,
        "execute a request to create resource",
    );

    let api: Api<T> = Api::namespaced(client.to_owned(), &namespace);
    match api.create(&PostParams::default(), obj).await {
        Ok(created) => Ok(created),
        Err(kube::Error::Api(err)) if err.code == 409 => {
            Ok(get(client, &namespace, &name)
                .await?
                .expect("resource to exist after an already-exists conflict"))
        }
        Err(err) => Err(err),
    }
}

/// apply the desired state of a child resource with server-side apply
/// semantics, the api server computes the difference and only mutates on
/// drift, which keeps a converged reconcile free of writes
pub async fn apply<T>(client: Client, obj: &T) -> Result<T, kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope> + DeserializeOwned + Serialize + Clone + Debug,
    <T as Resource>::DynamicType: Default,
{
    let (namespace, name) = namespaced_name(obj);

    debug!(
        namespace = &namespace,
        name = &name,
        "execute apply request on resource",
    );

    Api::namespaced(client, &namespace)
        .patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(obj),
        )
        .await
}

/// delete the resource of the given name, absence is not an error
pub async fn delete<T>(client: Client, namespace: &str, name: &str) -> Result<(), kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope> + DeserializeOwned + Clone + Debug,
    <T as Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client, namespace);

    debug!(
        namespace = namespace,
        name = name,
        "execute a request to delete resource",
    );

    match api.delete(name, &Default::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
        Err(err) => Err(err),
    }
}

/// returns a owner reference object pointing to the given resource
pub fn owner_reference<T>(obj: &T) -> OwnerReference
where
    T: ResourceExt + CustomResourceExt,
{
    let api_resource = T::api_resource();

    OwnerReference {
        api_version: api_resource.api_version,
        block_owner_deletion: Some(true),
        controller: Some(true),
        kind: api_resource.kind,
        name: obj.name_any(),
        uid: obj
            .uid()
            .expect("to have an unique identifier provided by kubernetes"),
        ..Default::default()
    }
}

/// returns a reference to the given resource, used to link events to it
pub fn object_reference<T>(obj: &T) -> ObjectReference
where
    T: ResourceExt + CustomResourceExt,
{
    let api_resource = T::api_resource();

    ObjectReference {
        api_version: Some(api_resource.api_version),
        kind: Some(api_resource.kind),
        name: Some(obj.name_any()),
        namespace: obj.namespace(),
        uid: obj.uid(),
        resource_version: obj.resource_version(),
        ..Default::default()
    }
}
