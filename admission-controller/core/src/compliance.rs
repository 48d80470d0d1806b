//! Evaluates a pod template against a baseline policy.
//!
//! Each dimension of the policy is checked independently and every violation
//! is collected. Violations are ordered by dimension (privileged,
//! capabilities, host namespaces, volumes, run-as-user, SELinux, groups,
//! escalation, read-only root filesystem, seccomp, sysctls) and then by
//! container, with `containers` preceding `initContainers`.

mod defaults;


use crate::{
    baseline::{Baseline, Capabilities, Groups, RunAsUser, Seccomp, SeLinux},
    field::{Path, Violation},
};
use ahash::AHashSet as HashSet;
use aro_admission_controller_k8s_api::{
    api::core::v1::SeccompProfile, Container, PodSpec, SELinuxOptions, Volume,
};

/// Returns every way in which `spec` fails to comply with `baseline`.
///
/// The caller's template is not modified; defaults are applied to a copy
/// before it is validated.
pub fn evaluate(spec: &PodSpec, baseline: &Baseline, namespace: &str) -> Vec<Violation> {
    let mut spec = spec.clone();
    defaults::apply(&mut spec, baseline);

    let pod = Pod::new(&spec);
    let mut violations = Vec::new();
    privileged(&pod, baseline, &mut violations);
    capabilities(&pod, baseline, &mut violations);
    host_namespaces(&pod, baseline, &mut violations);
    volumes(&pod, baseline, &mut violations);
    run_as_user(&pod, baseline, &mut violations);
    se_linux(&pod, baseline, &mut violations);
    groups(&pod, baseline, &mut violations);
    escalation(&pod, baseline, &mut violations);
    read_only_root_filesystem(&pod, baseline, &mut violations);
    seccomp(&pod, baseline, &mut violations);
    sysctls(&pod, baseline, &mut violations);

    tracing::trace!(
        %namespace,
        policy = %baseline.name,
        violations = violations.len(),
        "Evaluated pod template"
    );
    violations
}

/// A view over a defaulted pod template with the field path of each container.
struct Pod<'s> {
    spec: &'s PodSpec,
    root: Path,
    containers: Vec<(Path, &'s Container)>,
}

impl<'s> Pod<'s> {
    fn new(spec: &'s PodSpec) -> Self {
        let root = Path::new("spec");
        let containers = {
            let path = root.child("containers");
            spec.containers
                .iter()
                .enumerate()
                .map(move |(i, c)| (path.index(i), c))
        };
        let init = {
            let path = root.child("initContainers");
            spec.init_containers
                .iter()
                .flatten()
                .enumerate()
                .map(move |(i, c)| (path.index(i), c))
        };
        Self {
            containers: containers.chain(init).collect(),
            spec,
            root,
        }
    }

    fn security_context(&self) -> Path {
        self.root.child("securityContext")
    }

    fn run_as_user(&self) -> Option<i64> {
        self.spec.security_context.as_ref()?.run_as_user
    }

    fn run_as_non_root(&self) -> Option<bool> {
        self.spec.security_context.as_ref()?.run_as_non_root
    }
}

fn privileged(pod: &Pod<'_>, baseline: &Baseline, violations: &mut Vec<Violation>) {
    if baseline.allow_privileged {
        return;
    }
    for (path, container) in &pod.containers {
        let privileged = container
            .security_context
            .as_ref()
            .and_then(|sc| sc.privileged)
            .unwrap_or(false);
        if privileged {
            violations.push(Violation::invalid(
                path.child("securityContext").child("privileged"),
                true,
                "Privileged containers are not allowed",
            ));
        }
    }
}

fn capabilities(pod: &Pod<'_>, baseline: &Baseline, violations: &mut Vec<Violation>) {
    if baseline.allowed_capabilities == Capabilities::Any {
        return;
    }

    for (path, container) in &pod.containers {
        let path = path.child("securityContext");
        let caps = container
            .security_context
            .as_ref()
            .and_then(|sc| sc.capabilities.as_ref());
        let Some(caps) = caps else {
            if !baseline.default_add_capabilities.is_empty()
                || !baseline.required_drop_capabilities.is_empty()
            {
                violations.push(Violation::invalid(
                    path.child("capabilities"),
                    serde_json::Value::Null,
                    "required capabilities are not set on the securityContext",
                ));
            }
            continue;
        };

        let path = path.child("capabilities");
        for cap in caps.add.iter().flatten() {
            if !baseline.default_add_capabilities.contains(cap)
                && !baseline.allowed_capabilities.allows(cap)
            {
                violations.push(Violation::invalid(
                    path.child("add"),
                    cap.as_str(),
                    "capability may not be added",
                ));
            }
        }

        let dropped = caps
            .drop
            .iter()
            .flatten()
            .map(String::as_str)
            .collect::<HashSet<_>>();
        for required in &baseline.required_drop_capabilities {
            if !dropped.contains(required.as_str()) {
                violations.push(Violation::invalid(
                    path.child("drop"),
                    caps.drop.clone().unwrap_or_default(),
                    format_args!("{required} is required to be dropped but was not found"),
                ));
            }
        }
    }
}

fn host_namespaces(pod: &Pod<'_>, baseline: &Baseline, violations: &mut Vec<Violation>) {
    let path = pod.security_context();
    let host = &baseline.host;
    for (allowed, requested, field, name) in [
        (host.network, pod.spec.host_network, "hostNetwork", "network"),
        (host.pid, pod.spec.host_pid, "hostPID", "PID"),
        (host.ipc, pod.spec.host_ipc, "hostIPC", "IPC"),
    ] {
        if !allowed && requested == Some(true) {
            violations.push(Violation::invalid(
                path.child(field),
                true,
                format_args!("Host {name} is not allowed to be used"),
            ));
        }
    }

    if host.ports {
        return;
    }
    for (path, container) in &pod.containers {
        for port in container.ports.iter().flatten() {
            if let Some(host_port) = port.host_port.filter(|p| *p > 0) {
                violations.push(Violation::invalid(
                    path.child("hostPort"),
                    host_port,
                    "Host ports are not allowed to be used",
                ));
            }
        }
    }
}

fn volumes(pod: &Pod<'_>, baseline: &Baseline, violations: &mut Vec<Violation>) {
    let path = pod.root.child("volumes");
    for (i, volume) in pod.spec.volumes.iter().flatten().enumerate() {
        let fs_type = volume_type(volume);
        if !baseline.volumes.allows(&fs_type) {
            violations.push(Violation::invalid(
                path.index(i),
                fs_type.as_str(),
                format_args!("{fs_type} volumes are not allowed to be used"),
            ));
            continue;
        }

        if let Some(flex) = volume.flex_volume.as_ref() {
            if !baseline.allows_flex_driver(&flex.driver) {
                violations.push(Violation::invalid(
                    path.index(i).child("driver"),
                    flex.driver.as_str(),
                    "Flexvolume driver is not allowed to be used",
                ));
            }
        }
    }
}

/// Names the source of a volume the way policies refer to it.
///
/// A volume without a source is an `emptyDir`.
fn volume_type(volume: &Volume) -> String {
    let source = serde_json::to_value(volume)
        .ok()
        .and_then(|v| match v {
            serde_json::Value::Object(fields) => fields
                .into_iter()
                .map(|(k, _)| k)
                .find(|k| k != "name"),
            _ => None,
        })
        .unwrap_or_else(|| "emptyDir".to_string());
    match source.as_str() {
        "cephfs" => "cephFS".to_string(),
        "storageos" => "storageOS".to_string(),
        "vsphereVolume" => "vsphere".to_string(),
        _ => source,
    }
}

fn run_as_user(pod: &Pod<'_>, baseline: &Baseline, violations: &mut Vec<Violation>) {
    let pod_path = pod.security_context();
    match baseline.run_as_user {
        RunAsUser::RunAsAny => {}

        RunAsUser::MustRunAs(required) => {
            let check = |subject: &str, path: Path, uid: i64, violations: &mut Vec<Violation>| {
                if uid != required {
                    violations.push(Violation::invalid(
                        path,
                        uid,
                        format_args!(
                            "UID on {subject} does not match required UID.  Found {uid}, wanted {required}"
                        ),
                    ));
                }
            };
            if let Some(uid) = pod.run_as_user() {
                check("pod", pod_path.child("runAsUser"), uid, violations);
            }
            for (path, container) in &pod.containers {
                if let Some(uid) = container_run_as_user(container) {
                    let path = path.child("securityContext").child("runAsUser");
                    let subject = format!("container {}", container.name);
                    check(&subject, path, uid, violations);
                }
            }
        }

        RunAsUser::MustRunAsRange { min, max } => {
            let check = |subject: &str, path: Path, uid: i64, violations: &mut Vec<Violation>| {
                if uid < min || uid > max {
                    violations.push(Violation::invalid(
                        path,
                        uid,
                        format_args!(
                            "UID on {subject} does not match required range.  Found {uid}, required min: {min} max: {max}"
                        ),
                    ));
                }
            };
            if let Some(uid) = pod.run_as_user() {
                check("pod", pod_path.child("runAsUser"), uid, violations);
            }
            for (path, container) in &pod.containers {
                if let Some(uid) = container_run_as_user(container) {
                    let path = path.child("securityContext").child("runAsUser");
                    let subject = format!("container {}", container.name);
                    check(&subject, path, uid, violations);
                }
            }
        }

        RunAsUser::MustRunAsNonRoot => {
            non_root(pod.run_as_non_root(), pod.run_as_user(), &pod_path, violations);
            for (path, container) in &pod.containers {
                let path = path.child("securityContext");
                let sc = container.security_context.as_ref();
                let non_root_flag = sc.and_then(|sc| sc.run_as_non_root);
                let uid = sc.and_then(|sc| sc.run_as_user);

                // Nothing on the container or the pod asserts a non-root user,
                // so the image may run as root.
                if non_root_flag.or(pod.run_as_non_root()).is_none()
                    && uid.or(pod.run_as_user()).is_none()
                {
                    violations.push(Violation::required(
                        path.child("runAsNonRoot"),
                        "must be true",
                    ));
                    continue;
                }
                non_root(non_root_flag, uid, &path, violations);
            }
        }
    }
}

/// Checks explicitly set non-root assertions and UIDs.
fn non_root(
    run_as_non_root: Option<bool>,
    uid: Option<i64>,
    path: &Path,
    violations: &mut Vec<Violation>,
) {
    if run_as_non_root == Some(false) {
        violations.push(Violation::invalid(
            path.child("runAsNonRoot"),
            false,
            "must be true",
        ));
    }
    if uid == Some(0) {
        violations.push(Violation::invalid(
            path.child("runAsUser"),
            0,
            "running with the root UID is forbidden",
        ));
    }
}

fn container_run_as_user(container: &Container) -> Option<i64> {
    container.security_context.as_ref()?.run_as_user
}

fn se_linux(pod: &Pod<'_>, baseline: &Baseline, violations: &mut Vec<Violation>) {
    let required = match baseline.se_linux {
        SeLinux::RunAsAny => return,
        SeLinux::MustRunAs(ref opts) => opts,
    };

    if let Some(opts) = pod
        .spec
        .security_context
        .as_ref()
        .and_then(|sc| sc.se_linux_options.as_ref())
    {
        let path = pod.security_context().child("seLinuxOptions");
        se_linux_options(required, opts, &path, violations);
    }
    for (path, container) in &pod.containers {
        if let Some(opts) = container
            .security_context
            .as_ref()
            .and_then(|sc| sc.se_linux_options.as_ref())
        {
            let path = path.child("securityContext").child("seLinuxOptions");
            se_linux_options(required, opts, &path, violations);
        }
    }
}

fn se_linux_options(
    required: &SELinuxOptions,
    opts: &SELinuxOptions,
    path: &Path,
    violations: &mut Vec<Violation>,
) {
    let required_level = required.level.as_deref().unwrap_or_default();
    let level = opts.level.as_deref().unwrap_or_default();
    if !equal_levels(required_level, level) {
        violations.push(Violation::invalid(
            path.child("level"),
            level,
            format_args!("must be {required_level}"),
        ));
    }

    for (field, required, actual) in [
        ("role", &required.role, &opts.role),
        ("type", &required.type_, &opts.type_),
        ("user", &required.user, &opts.user),
    ] {
        let required = required.as_deref().unwrap_or_default();
        let actual = actual.as_deref().unwrap_or_default();
        if required != actual {
            violations.push(Violation::invalid(
                path.child(field),
                actual,
                format_args!("must be {required}"),
            ));
        }
    }
}

/// Compares MCS levels such as `s0:c1,c0`, ignoring the order of categories.
fn equal_levels(expected: &str, actual: &str) -> bool {
    if expected == actual {
        return true;
    }
    let (exp_sensitivity, exp_categories) = split_level(expected);
    let (sensitivity, categories) = split_level(actual);
    exp_sensitivity == sensitivity && exp_categories == categories
}

fn split_level(level: &str) -> (&str, HashSet<&str>) {
    match level.split_once(':') {
        Some((sensitivity, categories)) => (
            sensitivity,
            categories.split(',').filter(|c| !c.is_empty()).collect(),
        ),
        None => (level, HashSet::new()),
    }
}

fn groups(pod: &Pod<'_>, baseline: &Baseline, violations: &mut Vec<Violation>) {
    let path = pod.security_context();
    let sc = pod.spec.security_context.as_ref();

    if let Groups::MustRunAs(_) = baseline.fs_group {
        let path = path.child("fsGroup");
        match sc.and_then(|sc| sc.fs_group) {
            None => violations.push(Violation::invalid(
                path,
                serde_json::Value::Null,
                "unable to validate empty groups against required ranges",
            )),
            Some(gid) if !baseline.fs_group.allows(gid) => violations.push(Violation::invalid(
                path,
                gid,
                format_args!("{gid} is not an allowed group"),
            )),
            Some(_) => {}
        }
    }

    if let Groups::MustRunAs(_) = baseline.supplemental_groups {
        let path = path.child("supplementalGroups");
        let gids = sc
            .and_then(|sc| sc.supplemental_groups.clone())
            .unwrap_or_default();
        if gids.is_empty() {
            violations.push(Violation::invalid(
                path.clone(),
                gids.clone(),
                "unable to validate empty groups against required ranges",
            ));
        }
        for gid in &gids {
            if !baseline.supplemental_groups.allows(*gid) {
                violations.push(Violation::invalid(
                    path.clone(),
                    gids.clone(),
                    format_args!("{gid} is not an allowed group"),
                ));
            }
        }
    }
}

fn escalation(pod: &Pod<'_>, baseline: &Baseline, violations: &mut Vec<Violation>) {
    if baseline.escalation.allowed {
        return;
    }
    for (path, container) in &pod.containers {
        let path = path.child("securityContext").child("allowPrivilegeEscalation");
        match container
            .security_context
            .as_ref()
            .and_then(|sc| sc.allow_privilege_escalation)
        {
            Some(false) => {}
            Some(true) => violations.push(Violation::invalid(
                path,
                true,
                "Allowing privilege escalation for containers is not allowed",
            )),
            None => violations.push(Violation::required(
                path,
                "Allowing privilege escalation for containers is not allowed",
            )),
        }
    }
}

fn read_only_root_filesystem(
    pod: &Pod<'_>,
    baseline: &Baseline,
    violations: &mut Vec<Violation>,
) {
    if !baseline.read_only_root_filesystem {
        return;
    }
    for (path, container) in &pod.containers {
        let path = path.child("securityContext").child("readOnlyRootFilesystem");
        match container
            .security_context
            .as_ref()
            .and_then(|sc| sc.read_only_root_filesystem)
        {
            Some(true) => {}
            Some(false) => violations.push(Violation::invalid(
                path,
                false,
                "ReadOnlyRootFilesystem must be set to true",
            )),
            None => violations.push(Violation::required(
                path,
                "ReadOnlyRootFilesystem must be set to true",
            )),
        }
    }
}

/// Checks requested seccomp profiles. An unset profile is left to the
/// runtime default and always complies.
fn seccomp(pod: &Pod<'_>, baseline: &Baseline, violations: &mut Vec<Violation>) {
    if baseline.seccomp == Seccomp::Any {
        return;
    }

    let check = |path: Path, profile: &SeccompProfile, violations: &mut Vec<Violation>| {
        let name = seccomp_profile_name(profile);
        match &baseline.seccomp {
            Seccomp::Only(allowed) if allowed.is_empty() => {
                violations.push(Violation::forbidden(path, "seccomp may not be set"))
            }
            Seccomp::Only(allowed) if !baseline.seccomp.allows(&name) => {
                violations.push(Violation::forbidden(
                    path,
                    format_args!(
                        "{name} is not a valid seccomp profile. Valid values are {}",
                        allowed.join(", ")
                    ),
                ))
            }
            _ => {}
        }
    };

    if let Some(profile) = pod
        .spec
        .security_context
        .as_ref()
        .and_then(|sc| sc.seccomp_profile.as_ref())
    {
        check(pod.security_context().child("seccompProfile"), profile, violations);
    }
    for (path, container) in &pod.containers {
        if let Some(profile) = container
            .security_context
            .as_ref()
            .and_then(|sc| sc.seccomp_profile.as_ref())
        {
            let path = path.child("securityContext").child("seccompProfile");
            check(path, profile, violations);
        }
    }
}

/// Names a seccomp profile the way policies list it.
fn seccomp_profile_name(profile: &SeccompProfile) -> String {
    match profile.type_.as_str() {
        "RuntimeDefault" => "runtime/default".to_string(),
        "Unconfined" => "unconfined".to_string(),
        "Localhost" => format!(
            "localhost/{}",
            profile.localhost_profile.as_deref().unwrap_or_default()
        ),
        other => other.to_string(),
    }
}

fn sysctls(pod: &Pod<'_>, baseline: &Baseline, violations: &mut Vec<Violation>) {
    let path = pod.security_context().child("sysctls");
    let requested = pod
        .spec
        .security_context
        .as_ref()
        .and_then(|sc| sc.sysctls.as_ref());
    for (i, sysctl) in requested.into_iter().flatten().enumerate() {
        let name = sysctl.name.as_str();
        if baseline.sysctls.is_forbidden(name) {
            violations.push(Violation::forbidden(
                path.index(i),
                format_args!("sysctl {name:?} is not allowed"),
            ));
        } else if !baseline.sysctls.allows(name) {
            violations.push(Violation::forbidden(
                path.index(i),
                format_args!("unsafe sysctl {name:?} is not allowed"),
            ));
        }
    }
}
