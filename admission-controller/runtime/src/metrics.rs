use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time;

#[derive(Clone, Debug)]
pub struct AdmissionMetrics {
    reviews: Family<ReviewLabels, Counter>,
    durations: Family<KindLabels, Histogram>,
}

/// Records the outcome of a single review when it completes.
pub(crate) struct ReviewObserver {
    start: time::Instant,
    kind: &'static str,
    metrics: AdmissionMetrics,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct ReviewLabels {
    kind: &'static str,
    decision: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct KindLabels {
    kind: &'static str,
}

/// How a review was resolved.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Decision {
    Allowed,
    Denied,
    /// The request could not be reviewed.
    Rejected,
}

// === impl AdmissionMetrics ===

impl AdmissionMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let reviews = Family::<ReviewLabels, Counter>::default();
        reg.register(
            "reviews",
            "Total number of admission reviews by resource kind and decision",
            reviews.clone(),
        );

        let durations = Family::<KindLabels, Histogram>::new_with_constructor(|| {
            // Reviews are expected to complete well within the API server's
            // webhook timeout.
            Histogram::new([0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0])
        });
        reg.register_with_unit(
            "review_duration",
            "Histogram of the time taken to review admission requests",
            Unit::Seconds,
            durations.clone(),
        );

        Self { reviews, durations }
    }

    pub(crate) fn start(&self, kind: &'static str) -> ReviewObserver {
        ReviewObserver {
            start: time::Instant::now(),
            kind,
            metrics: self.clone(),
        }
    }
}

impl Default for AdmissionMetrics {
    /// Metrics that are not exported.
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}

// === impl ReviewObserver ===

impl ReviewObserver {
    pub(crate) fn end(self, decision: Decision) {
        let Self {
            start,
            kind,
            metrics,
        } = self;
        metrics
            .reviews
            .get_or_create(&ReviewLabels {
                kind,
                decision: decision.as_str(),
            })
            .inc();
        metrics
            .durations
            .get_or_create(&KindLabels { kind })
            .observe(start.elapsed().as_secs_f64());
    }
}

// === impl Decision ===

impl Decision {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Denied => "denied",
            Self::Rejected => "rejected",
        }
    }
}
