use crate::{
    admission::Admission,
    config::WhitelistConfig,
    core::{
        bootstrap::{self, Allocation, UidRange},
        Engine, Whitelist,
    },
    metrics::AdmissionMetrics,
    setup,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::{path::PathBuf, sync::Arc};
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "aro-admission-controller",
    about = "Validates workloads and security context constraints"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "aro=info,warn",
        env = "ARO_ADMISSION_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// A YAML file listing the image patterns that are exempt from policy
    /// evaluation.
    #[clap(long, env = "ARO_ADMISSION_CONTROLLER_WHITELIST")]
    whitelist_config: Option<PathBuf>,

    /// An additional exempt image pattern. May be repeated.
    #[clap(long = "whitelisted-image")]
    whitelisted_images: Vec<String>,

    /// The UID block, as `start/size`, that the restricted policy requires.
    #[clap(long, default_value = "1000000000/10000")]
    uid_range: UidRange,

    /// The SELinux MCS level that the restricted policy requires.
    #[clap(long, default_value = "s0:c1,c0")]
    mcs_level: String,

    /// Registers the admission webhooks with the cluster once the controller
    /// is available.
    #[clap(long)]
    setup: bool,

    #[clap(long, default_value = "kube-system")]
    namespace: String,

    /// The number of ready controller pods to wait for before registering
    /// webhooks.
    #[clap(long, default_value = "3")]
    replicas: usize,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            server,
            admin,
            whitelist_config,
            whitelisted_images,
            uid_range,
            mcs_level,
            setup,
            namespace,
            replicas,
        } = self;

        let mut patterns = match whitelist_config {
            Some(path) => WhitelistConfig::load(&path)?.whitelisted_images,
            None => Vec::new(),
        };
        patterns.extend(whitelisted_images);
        let whitelist = Whitelist::new(&patterns).context("invalid image whitelist")?;

        let alloc = Allocation {
            uids: uid_range,
            mcs_level,
        };
        let baseline = bootstrap::restricted(&alloc)
            .with_context(|| format!("invalid {} policy", bootstrap::RESTRICTED))?;
        let engine = Arc::new(Engine::new(whitelist, baseline, bootstrap::protected()));

        let mut prom = <Registry>::default();
        let metrics = AdmissionMetrics::register(prom.sub_registry_with_prefix("aro_admission"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(Some(server))
            .build()
            .await?;

        info!(
            whitelisted = engine.whitelist().len(),
            protected = engine.protected().len(),
            uids = %alloc.uids,
            mcs = %alloc.mcs_level,
            "Admission policy loaded"
        );

        if setup {
            let client = runtime.client();
            let params = setup::Params {
                namespace,
                replicas,
            };
            tokio::spawn(
                async move {
                    match setup::run(client, params).await {
                        Ok(()) => info!("Admission webhooks registered"),
                        Err(error) => warn!(%error, "Failed to register admission webhooks"),
                    }
                }
                .instrument(info_span!("setup")),
            );
        }

        let admission = Admission::new(engine, metrics);
        let runtime = runtime.spawn_server(move || admission.clone());

        // Block the main thread on the shutdown signal.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
