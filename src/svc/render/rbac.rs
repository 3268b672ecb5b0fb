//! # Rbac renderer module
//!
//! This module renders the workload identity of a custom resource, a
//! dedicated service account with no extra role binding

use k8s_openapi::api::core::v1::ServiceAccount;
use kube::api::ObjectMeta;

use crate::svc::render::Workload;

pub fn name(workload: &Workload) -> String {
    format!("{}-runner", workload.name)
}

pub fn render(workload: &Workload) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(name(workload)),
            namespace: Some(workload.namespace.to_owned()),
            labels: Some(workload.labels()),
            owner_references: Some(vec![workload.owner.to_owned()]),
            ..Default::default()
        },
        automount_service_account_token: Some(false),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use crate::svc::render::tests::workload;

    use super::*;

    #[test]
    fn service_account_is_scoped_to_the_workload() {
        let workload = workload();
        let account = render(&workload);

        assert_eq!(account.metadata.name.as_deref(), Some("hello-runner"));
        assert_eq!(account.automount_service_account_token, Some(false));
    }
}
