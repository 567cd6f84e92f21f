use crate::error::{AdmissionError, GuardError};
use crate::identity::{ActorId, Endpoint, TenantId};
use crate::plan::EndpointPolicy;
use crate::rate_limit::{RateDecision, RateLimiter};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// A layer that enforces a fixed-window budget using a [`RateLimiter`].
///
/// `extract` names the `(tenant, actor, endpoint)` a request is counted
/// against.
/// Requests it cannot attribute are refused with
/// [`GuardError::Admission`] rather than let through uncounted.
pub struct RateLimitLayer<L, F> {
    limiter: Arc<L>,
    extract: Arc<F>,
    policy: EndpointPolicy,
}

impl<L, F> Clone for RateLimitLayer<L, F> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone(), extract: self.extract.clone(), policy: self.policy }
    }
}

impl<L, F> fmt::Debug for RateLimitLayer<L, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitLayer").field("policy", &self.policy).finish_non_exhaustive()
    }
}

impl<L, F> RateLimitLayer<L, F> {
    /// Create a new rate limit layer.
    pub fn new(limiter: Arc<L>, policy: EndpointPolicy, extract: F) -> Self {
        Self { limiter, extract: Arc::new(extract), policy }
    }
}

impl<S, L, F> Layer<S> for RateLimitLayer<L, F>
where
    L: RateLimiter + 'static,
{
    type Service = RateLimitService<S, L, F>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService {
            inner: service,
            limiter: self.limiter.clone(),
            extract: self.extract.clone(),
            policy: self.policy,
        }
    }
}

/// Middleware service that enforces rate limits.
pub struct RateLimitService<S, L, F> {
    inner: S,
    limiter: Arc<L>,
    extract: Arc<F>,
    policy: EndpointPolicy,
}

impl<S: Clone, L, F> Clone for RateLimitService<S, L, F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            extract: self.extract.clone(),
            policy: self.policy,
        }
    }
}

impl<S, L, F, Req> Service<Req> for RateLimitService<S, L, F>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    L: RateLimiter + 'static,
    F: Fn(&Req) -> Option<(TenantId, ActorId, Endpoint)> + Send + Sync + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = GuardError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GuardError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let limiter = self.limiter.clone();
        let policy = self.policy;
        let key = (self.extract)(&req);
        // Take the service that was driven to readiness; leave a clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let (tenant, actor, endpoint) = key.ok_or_else(|| {
                GuardError::Admission(AdmissionError::validation("request", "no rate limit key"))
            })?;
            let (max, window) = (policy.max_requests, policy.window_secs);
            match limiter.check_and_increment(&tenant, &actor, &endpoint, max, window).await {
                Ok(RateDecision::Allowed { .. }) => {
                    inner.call(req).await.map_err(GuardError::Inner)
                }
                Ok(RateDecision::Denied(denial)) => Err(GuardError::RateLimited(denial)),
                Err(e) => Err(GuardError::Admission(e)),
            }
        })
    }
}
