#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod admission;
mod args;
mod config;
mod metrics;
pub mod setup;

pub use self::{
    admission::{Admission, Error, POLICY_PATH},
    args::Args,
    config::WhitelistConfig,
    metrics::AdmissionMetrics,
};
pub use aro_admission_controller_core as core;
pub use aro_admission_controller_k8s_api as k8s;
