//! # Finalizer module
//!
//! This module provide helpers methods to interact with kubernetes' resource
//! finalizer

use kube::Resource;

/// returns if there is the given finalizer on the resource
pub fn contains<T>(obj: &T, finalizer: &str) -> bool
where
    T: Resource,
{
    obj.meta()
        .finalizers
        .as_ref()
        .map(|finalizers| finalizers.iter().any(|f| finalizer == f))
        .unwrap_or(false)
}

/// add finalizer to the resource
pub fn add<T>(mut obj: T, finalizer: &str) -> T
where
    T: Resource,
{
    if !contains(&obj, finalizer) {
        obj.meta_mut()
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(finalizer.into());
    }

    obj
}

/// remove finalizer from the resource
pub fn remove<T>(mut obj: T, finalizer: &str) -> T
where
    T: Resource,
{
    if let Some(finalizers) = &mut obj.meta_mut().finalizers {
        finalizers.retain(|f| f != finalizer);
    }

    obj
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::ConfigMap;

    use super::*;

    const FINALIZER: &str = "api.lambda.sh/function";

    #[test]
    fn add_is_idempotent() {
        let obj = add(ConfigMap::default(), FINALIZER);
        let obj = add(obj, FINALIZER);

        assert_eq!(obj.metadata.finalizers, Some(vec![FINALIZER.to_string()]));
        assert!(contains(&obj, FINALIZER));
    }

    #[test]
    fn remove_only_drops_the_given_finalizer() {
        let obj = add(ConfigMap::default(), FINALIZER);
        let obj = add(obj, "api.lambda.sh/agent");
        let obj = remove(obj, FINALIZER);

        assert!(!contains(&obj, FINALIZER));
        assert!(contains(&obj, "api.lambda.sh/agent"));
    }

    #[test]
    fn remove_on_missing_finalizer_is_a_no_op() {
        let obj = remove(ConfigMap::default(), FINALIZER);

        assert!(!contains(&obj, FINALIZER));
    }
}
