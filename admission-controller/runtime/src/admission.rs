use crate::metrics::{AdmissionMetrics, Decision};
use aro_admission_controller_core::{self as core, Engine, Verdict, WorkloadKind};
use aro_admission_controller_k8s_api::{
    DynamicObject, Resource, ResourceExt, SecurityContextConstraints,
};
use bytes::Bytes;
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::core::admission::Operation;
use std::{fmt, sync::Arc};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// The webhook path that serves security context constraints.
pub const POLICY_PATH: &str = "/sccs";

/// Serves admission reviews for workloads and security context constraints.
#[derive(Clone)]
pub struct Admission {
    engine: Arc<Engine>,
    metrics: AdmissionMetrics,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;
type AdmissionReview = kube::core::admission::AdmissionReview<DynamicObject>;

type Body = http_body_util::Full<Bytes>;

/// The resources served at a webhook path.
#[derive(Copy, Clone, Debug)]
enum Route {
    Workload(&'static WorkloadKind),
    Policy,
}

/// A request that could not be reviewed.
#[derive(Debug)]
struct Rejection {
    status: http::StatusCode,
    message: String,
}

// === impl Admission ===

impl tower::Service<Request<hyper::body::Incoming>> for Admission {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        let admission = self.clone();
        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let bytes = body.collect().await?.to_bytes();
            admission.handle(Request::from_parts(parts, bytes))
        })
    }
}

impl Admission {
    pub fn new(engine: Arc<Engine>, metrics: AdmissionMetrics) -> Self {
        Self { engine, metrics }
    }

    /// Reviews a request whose body has been read.
    ///
    /// Requests that cannot be reviewed are answered with an error status and
    /// a plain-text reason; all others are answered with an `AdmissionReview`.
    pub fn handle(&self, req: Request<Bytes>) -> Result<Response<Body>, Error> {
        let path = req.uri().path().to_string();
        let Some(route) = Route::from_path(&path) else {
            warn!(%path, "Unknown webhook path");
            let rejection = Rejection::new(http::StatusCode::NOT_FOUND, "not found");
            return Ok(rejection.into_response());
        };

        let observer = self.metrics.start(route.kind());
        match self.review(route, req) {
            Ok(rsp) => {
                observer.end(if rsp.allowed {
                    Decision::Allowed
                } else {
                    Decision::Denied
                });
                debug!(?rsp);
                json_response(rsp.into_review())
            }
            Err(rejection) => {
                warn!(
                    %path,
                    status = %rejection.status,
                    error = %rejection.message,
                    "Rejected admission request"
                );
                observer.end(Decision::Rejected);
                Ok(rejection.into_response())
            }
        }
    }

    fn review(&self, route: Route, req: Request<Bytes>) -> Result<AdmissionResponse, Rejection> {
        if req.method() != http::Method::POST {
            return Err(Rejection::new(
                http::StatusCode::METHOD_NOT_ALLOWED,
                format_args!("invalid method {}, only POST is allowed", req.method()),
            ));
        }
        if !is_json(req.headers()) {
            return Err(Rejection::new(
                http::StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "only application/json content is allowed",
            ));
        }

        let review = serde_json::from_slice::<AdmissionReview>(req.body()).map_err(|error| {
            Rejection::bad_request(format_args!("failed to parse admission review: {error}"))
        })?;
        trace!(?review);
        let req: AdmissionRequest = review.try_into().map_err(|error| {
            Rejection::bad_request(format_args!("invalid admission review: {error}"))
        })?;
        debug!(uid = %req.uid, kind = %req.kind.kind, operation = ?req.operation, "Reviewing");

        if req.uid.is_empty() {
            return Err(Rejection::bad_request("admission request missing uid"));
        }
        if !route.matches(&req) {
            return Err(Rejection::bad_request(format_args!(
                "unexpected resource {}/{}/{} ({}) for {}",
                req.kind.group,
                req.kind.version,
                req.kind.kind,
                req.resource.resource,
                route.kind(),
            )));
        }
        if let Some(sub) = req.sub_resource.as_deref().filter(|s| !s.is_empty()) {
            return Err(Rejection::bad_request(format_args!(
                "unexpected subresource {sub}"
            )));
        }

        match route {
            Route::Workload(kind) => self.admit_workload(kind, req),
            Route::Policy => self.admit_policy(req),
        }
    }

    fn admit_workload(
        &self,
        kind: &'static WorkloadKind,
        req: AdmissionRequest,
    ) -> Result<AdmissionResponse, Rejection> {
        let rsp = AdmissionResponse::from(&req);
        if matches!(req.operation, Operation::Delete) {
            return Ok(rsp);
        }

        let obj = req
            .object
            .as_ref()
            .ok_or_else(|| Rejection::bad_request("admission request missing object"))?;
        let workload = core::normalize(&req.kind, obj, req.namespace.as_deref())?;

        let verdict = self.engine.admit_workload(&workload);
        let name = obj.name_any();
        Ok(respond(rsp, verdict, kind.kind, &workload.namespace, &name))
    }

    fn admit_policy(&self, req: AdmissionRequest) -> Result<AdmissionResponse, Rejection> {
        let kind = SecurityContextConstraints::kind(&());
        let rsp = AdmissionResponse::from(&req);

        if matches!(req.operation, Operation::Delete) {
            let name = if req.name.is_empty() {
                req.old_object
                    .as_ref()
                    .map(|o| o.name_any())
                    .unwrap_or_default()
            } else {
                req.name.clone()
            };
            let verdict = self.engine.admit_policy_deletion(&name);
            return Ok(respond(rsp, verdict, &kind, "", &name));
        }

        let obj = req
            .object
            .ok_or_else(|| Rejection::bad_request("admission request missing object"))?;
        let scc = serde_json::to_value(obj)
            .and_then(serde_json::from_value::<SecurityContextConstraints>)
            .map_err(|error| {
                Rejection::bad_request(format_args!("failed to decode {kind}: {error}"))
            })?;

        let verdict = self.engine.admit_policy(&scc);
        Ok(respond(rsp, verdict, &kind, "", &scc.name_any()))
    }
}

fn respond(
    rsp: AdmissionResponse,
    verdict: Verdict,
    kind: &str,
    ns: &str,
    name: &str,
) -> AdmissionResponse {
    match verdict {
        Verdict { allowed: true, .. } => rsp,
        Verdict { message, .. } => {
            let error = message.unwrap_or_default();
            info!(%error, %ns, %name, %kind, "Denied");
            rsp.deny(error)
        }
    }
}

fn is_json(headers: &http::HeaderMap) -> bool {
    headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
}

fn json_response(rsp: AdmissionReview) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}

// === impl Route ===

impl Route {
    fn from_path(path: &str) -> Option<Self> {
        if path == POLICY_PATH {
            return Some(Self::Policy);
        }
        WorkloadKind::by_path(path).map(Self::Workload)
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Workload(kind) => kind.kind,
            Self::Policy => "SecurityContextConstraints",
        }
    }

    fn matches(&self, req: &AdmissionRequest) -> bool {
        let resource = &req.resource;
        match self {
            Self::Workload(kind) => {
                kind.matches_kind(&req.kind)
                    && kind.matches_resource(&resource.group, &resource.version, &resource.resource)
            }
            Self::Policy => {
                let dt = ();
                req.kind.group == SecurityContextConstraints::group(&dt)
                    && req.kind.version == SecurityContextConstraints::version(&dt)
                    && req.kind.kind == SecurityContextConstraints::kind(&dt)
                    && resource.group == SecurityContextConstraints::group(&dt)
                    && resource.version == SecurityContextConstraints::version(&dt)
                    && resource.resource == SecurityContextConstraints::plural(&dt)
            }
        }
    }
}

// === impl Rejection ===

/// Routes only accept the kinds they normalize, so an unsupported kind means
/// the routing table and the normalizer disagree and is a server error.
/// Malformed objects are the client's.
impl From<core::Error> for Rejection {
    fn from(error: core::Error) -> Self {
        if error.is_unsupported() {
            Self::new(http::StatusCode::INTERNAL_SERVER_ERROR, error)
        } else {
            Self::bad_request(error)
        }
    }
}

impl Rejection {
    fn new(status: http::StatusCode, message: impl fmt::Display) -> Self {
        Self {
            status,
            message: message.to_string(),
        }
    }

    fn bad_request(message: impl fmt::Display) -> Self {
        Self::new(http::StatusCode::BAD_REQUEST, message)
    }

    fn into_response(self) -> Response<Body> {
        Response::builder()
            .status(self.status)
            .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(Body::from(self.message))
            .expect("rejection response must be valid")
    }
}
