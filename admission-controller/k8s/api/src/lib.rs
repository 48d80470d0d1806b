#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod security;

pub use self::security::SecurityContextConstraints;
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{
            Capabilities, Container, ContainerPort, PodSecurityContext, PodSpec, PodTemplateSpec,
            SELinuxOptions, SecurityContext, Volume,
        },
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
pub use kube::{
    core::{DynamicObject, GroupVersionKind, GroupVersionResource},
    Resource, ResourceExt,
};
