//! Fills the fields a policy assigns to pods that leave them unset.

use crate::baseline::Baseline;
use aro_admission_controller_k8s_api::{Capabilities, Container, PodSpec, SecurityContext};
use std::collections::BTreeSet;

pub(super) fn apply(spec: &mut PodSpec, baseline: &Baseline) {
    let pod_uid = spec.security_context.as_ref().and_then(|sc| sc.run_as_user);

    let containers = spec
        .containers
        .iter_mut()
        .chain(spec.init_containers.iter_mut().flatten());
    for container in containers {
        capabilities(container, baseline);

        if pod_uid.is_none() {
            if let Some(uid) = baseline.run_as_user.default_uid() {
                let sc = security_context(container);
                sc.run_as_user.get_or_insert(uid);
            }
        }

        if let Some(default) = baseline.escalation.default {
            let sc = security_context(container);
            sc.allow_privilege_escalation.get_or_insert(default);
        }
    }

    if let Some(gid) = baseline.fs_group.default_id() {
        let sc = spec.security_context.get_or_insert_with(Default::default);
        sc.fs_group.get_or_insert(gid);
    }

    if let Some(gid) = baseline.supplemental_groups.default_id() {
        let sc = spec.security_context.get_or_insert_with(Default::default);
        let groups = sc.supplemental_groups.get_or_insert_with(Vec::new);
        if groups.is_empty() {
            groups.push(gid);
        }
    }
}

/// Adds the policy's default capabilities, unless the container drops them,
/// and the capabilities the policy requires to be dropped.
///
/// A container whose capabilities already satisfy the policy is unchanged.
fn capabilities(container: &mut Container, baseline: &Baseline) {
    let current = container
        .security_context
        .as_ref()
        .and_then(|sc| sc.capabilities.as_ref());
    let add = current
        .and_then(|c| c.add.as_ref())
        .into_iter()
        .flatten()
        .cloned()
        .collect::<BTreeSet<_>>();
    let drop = current
        .and_then(|c| c.drop.as_ref())
        .into_iter()
        .flatten()
        .cloned()
        .collect::<BTreeSet<_>>();

    let combined_add = baseline
        .default_add_capabilities
        .iter()
        .filter(|cap| !drop.contains(*cap))
        .cloned()
        .chain(add.iter().cloned())
        .collect::<BTreeSet<_>>();
    let combined_drop = baseline
        .required_drop_capabilities
        .iter()
        .cloned()
        .chain(drop.iter().cloned())
        .collect::<BTreeSet<_>>();

    if combined_add.len() == add.len() && combined_drop.len() == drop.len() {
        return;
    }

    security_context(container).capabilities = Some(Capabilities {
        add: Some(combined_add.into_iter().collect()),
        drop: Some(combined_drop.into_iter().collect()),
    });
}

fn security_context(container: &mut Container) -> &mut SecurityContext {
    container
        .security_context
        .get_or_insert_with(Default::default)
}
