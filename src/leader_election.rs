//! Leader election using Kubernetes Leases
//!
//! The manager only reports readiness once it holds the lease, so tests run
//! against a manager that behaves like the active replica of a real
//! deployment.
//!
//! # Atomicity
//!
//! Uses resourceVersion for compare-and-swap semantics. If the lease changes
//! between read and write, the update fails with 409 Conflict and we retry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const FIELD_MANAGER: &str = "kube-envtest";

/// Leader election errors
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The lease object came back without a resourceVersion
    #[error("lease {0} has no resourceVersion")]
    MissingResourceVersion(String),
}

/// Timing and identity for leader election
#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    /// Lease object name
    pub lease_name: String,
    /// Namespace holding the lease
    pub namespace: String,
    /// Holder identity written into the lease
    pub identity: String,
    /// How long a lease is valid without renewal
    pub lease_duration: Duration,
    /// How often the holder renews
    pub renew_interval: Duration,
    /// How often a candidate retries
    pub retry_interval: Duration,
}

impl LeaderElectionConfig {
    /// Config with a random identity and timings tuned for a local fixture
    pub fn new(lease_name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            lease_name: lease_name.into(),
            namespace: namespace.into(),
            identity: format!("envtest-{}", uuid::Uuid::new_v4()),
            lease_duration: Duration::from_secs(15),
            renew_interval: Duration::from_secs(5),
            retry_interval: Duration::from_secs(2),
        }
    }
}

/// Leader elector using Kubernetes Leases
pub struct LeaderElector {
    client: Client,
    config: LeaderElectionConfig,
    is_leader: Arc<AtomicBool>,
}

impl LeaderElector {
    /// Create a new leader elector
    pub fn new(client: Client, config: LeaderElectionConfig) -> Self {
        Self {
            client,
            config,
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether this elector currently holds the lease
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Block until leadership is acquired or `shutdown` is cancelled
    ///
    /// Returns `None` on cancellation. API errors while campaigning are
    /// logged and retried.
    pub async fn acquire(self: Arc<Self>, shutdown: &CancellationToken) -> Option<LeaderGuard> {
        info!(
            identity = %self.config.identity,
            lease = %self.config.lease_name,
            "Waiting for leadership..."
        );

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.config.identity, "Leadership acquired");
                    self.is_leader.store(true, Ordering::SeqCst);
                    return Some(self.create_guard());
                }
                Ok(false) => {
                    debug!(
                        identity = %self.config.identity,
                        retry_ms = u64::try_from(self.config.retry_interval.as_millis()).unwrap_or(u64::MAX),
                        "Lease held by another, waiting..."
                    );
                }
                Err(e) => {
                    warn!(
                        identity = %self.config.identity,
                        error = %e,
                        "Failed to acquire lease, retrying..."
                    );
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = tokio::time::sleep(self.config.retry_interval) => {}
            }
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let now = Utc::now();

        let existing = match api.get(&self.config.lease_name).await {
            Ok(lease) => Some(lease),
            Err(kube::Error::Api(e)) if e.code == 404 => None,
            Err(e) => return Err(e.into()),
        };

        let Some(lease) = existing else {
            return self.create_lease(&api, now).await;
        };

        let spec = lease.spec.as_ref();
        let holder = spec.and_then(|s| s.holder_identity.as_ref());
        if holder == Some(&self.config.identity) {
            return self.write_lease(&api, &lease, now, false).await;
        }

        let renew_time = spec.and_then(|s| s.renew_time.as_ref());
        let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
        let is_expired = match (holder, renew_time, duration_secs) {
            (None, _, _) => true,
            (_, Some(rt), Some(duration)) => {
                now > rt.0 + chrono::Duration::seconds(i64::from(duration))
            }
            _ => true,
        };

        if is_expired {
            self.write_lease(&api, &lease, now, true).await
        } else {
            Ok(false)
        }
    }

    /// Lease duration as the API stores it, saturating at `i32::MAX` seconds
    fn lease_duration_seconds(&self) -> i32 {
        i32::try_from(self.config.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }

    fn desired_spec(&self, now: chrono::DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.config.identity.clone()),
            lease_duration_seconds: Some(self.lease_duration_seconds()),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    async fn create_lease(
        &self,
        api: &Api<Lease>,
        now: chrono::DateTime<Utc>,
    ) -> Result<bool, LeaderElectionError> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.config.lease_name.clone()),
                namespace: Some(self.config.namespace.clone()),
                ..Default::default()
            },
            spec: Some(self.desired_spec(now, 0)),
        };

        match api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(identity = %self.config.identity, "Created new lease");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.config.identity, "Lease creation conflict, will retry");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Renew a lease we hold, or take over an expired one
    async fn write_lease(
        &self,
        api: &Api<Lease>,
        existing: &Lease,
        now: chrono::DateTime<Utc>,
        take_over: bool,
    ) -> Result<bool, LeaderElectionError> {
        let resource_version = existing
            .metadata
            .resource_version
            .clone()
            .ok_or_else(|| {
                LeaderElectionError::MissingResourceVersion(self.config.lease_name.clone())
            })?;

        let mut updated = existing.clone();
        updated.metadata.resource_version = Some(resource_version);
        if take_over {
            let transitions = existing
                .spec
                .as_ref()
                .and_then(|s| s.lease_transitions)
                .unwrap_or(0);
            updated.spec = Some(self.desired_spec(now, transitions + 1));
        } else if let Some(ref mut spec) = updated.spec {
            spec.renew_time = Some(MicroTime(now));
        }

        match api
            .replace(&self.config.lease_name, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => {
                if take_over {
                    info!(identity = %self.config.identity, "Took over expired lease");
                } else {
                    debug!(identity = %self.config.identity, "Lease renewed");
                }
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(
                    identity = %self.config.identity,
                    take_over,
                    "Lease write conflict"
                );
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(self.config.renew_interval).await;

            match self.try_acquire_or_renew().await {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    warn!(identity = %self.config.identity, "Leadership lost");
                    self.is_leader.store(false, Ordering::SeqCst);
                    let _ = lost_tx.send(());
                    return;
                }
            }
        }
    }

    /// Clear the holder so the next candidate need not wait for expiry
    async fn release_lease(&self) -> Result<(), LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.config.namespace);

        let lease = match api.get(&self.config.lease_name).await {
            Ok(l) => l,
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_ref());
        if holder != Some(&self.config.identity) {
            debug!(identity = %self.config.identity, "Not the lease holder, nothing to release");
            return Ok(());
        }

        let past = Utc::now() - chrono::Duration::seconds(60);
        let patch = json!({
            "spec": {
                "holderIdentity": null,
                "renewTime": past.to_rfc3339()
            }
        });

        api.patch(
            &self.config.lease_name,
            &PatchParams {
                field_manager: Some(FIELD_MANAGER.to_string()),
                ..Default::default()
            },
            &Patch::Merge(&patch),
        )
        .await?;

        info!(identity = %self.config.identity, "Lease released");
        Ok(())
    }
}

/// Guard that maintains leadership
///
/// The renewal task is aborted when the guard is dropped.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost
    pub async fn lost(&mut self) {
        match self.lost_rx.as_mut() {
            Some(rx) => {
                let _ = rx.await;
                self.lost_rx = None;
            }
            None => std::future::pending::<()>().await,
        }
    }

    /// Stop renewing and hand the lease back
    pub async fn release(self) -> Result<(), LeaderElectionError> {
        self.renewal_task.abort();
        self.elector.release_lease().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.elector.is_leader.store(false, Ordering::SeqCst);
        self.renewal_task.abort();
        debug!(identity = %self.elector.config.identity, "Leader guard dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use http::{Method, Request, Response};
    use kube::client::Body;
    use serde_json::Value;
    use tower_test::mock::{Handle, SendResponse};

    type ApiServerHandle = Handle<Request<Body>, Response<Body>>;

    const LEASE_PATH: &str = "/apis/coordination.k8s.io/v1/namespaces/default/leases/lease";

    fn mock_elector(config: LeaderElectionConfig) -> (Arc<LeaderElector>, ApiServerHandle) {
        let (service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(service, "default");
        (Arc::new(LeaderElector::new(client, config)), handle)
    }

    fn lease(holder: Option<&str>, renewed: DateTime<Utc>, transitions: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some("lease".to_string()),
                namespace: Some("default".to_string()),
                resource_version: Some("7".to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: holder.map(str::to_string),
                lease_duration_seconds: Some(15),
                renew_time: Some(MicroTime(renewed)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    fn status(code: u16, reason: &str) -> Value {
        json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": format!("lease {}", reason.to_lowercase()),
            "reason": reason,
            "code": code
        })
    }

    fn respond(send: SendResponse<Response<Body>>, code: u16, body: &impl serde::Serialize) {
        let bytes = serde_json::to_vec(body).unwrap();
        send.send_response(Response::builder().status(code).body(Body::from(bytes)).unwrap());
    }

    async fn expect(
        handle: &mut ApiServerHandle,
        method: Method,
    ) -> (Request<Body>, SendResponse<Response<Body>>) {
        let (request, send) = handle.next_request().await.expect("service not called");
        assert_eq!(request.method(), method);
        assert_eq!(request.uri().path(), LEASE_PATH);
        (request, send)
    }

    async fn body_json(request: Request<Body>) -> Value {
        let bytes = request.into_body().collect_bytes().await.unwrap();
        serde_json::from_slice(&bytes).expect("request body is json")
    }

    async fn finish<T>(server: JoinHandle<T>) -> T {
        tokio::time::timeout(Duration::from_secs(1), server)
            .await
            .expect("timeout on mock apiserver")
            .expect("scenario succeeded")
    }

    #[test]
    fn config_identities_are_unique() {
        let a = LeaderElectionConfig::new("lease", "default");
        let b = LeaderElectionConfig::new("lease", "default");
        assert_ne!(a.identity, b.identity);
        assert!(a.identity.starts_with("envtest-"));
    }

    #[test]
    fn renewal_is_faster_than_expiry() {
        let config = LeaderElectionConfig::new("lease", "default");
        assert!(config.renew_interval < config.lease_duration);
        assert!(config.retry_interval < config.lease_duration);
    }

    #[tokio::test]
    async fn oversized_lease_duration_saturates() {
        let mut config = LeaderElectionConfig::new("lease", "default");
        config.lease_duration = Duration::from_secs(u64::MAX);
        let (elector, _handle) = mock_elector(config);
        let spec = elector.desired_spec(Utc::now(), 0);
        assert_eq!(spec.lease_duration_seconds, Some(i32::MAX));
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over() {
        let config = LeaderElectionConfig::new("lease", "default");
        let identity = config.identity.clone();
        let (elector, mut handle) = mock_elector(config);

        let server = tokio::spawn(async move {
            let (_, send) = expect(&mut handle, Method::GET).await;
            respond(send, 200, &lease(Some("other"), Utc::now() - chrono::Duration::hours(1), 2));

            let (request, send) = expect(&mut handle, Method::PUT).await;
            let written = body_json(request).await;
            respond(send, 200, &written);
            written
        });

        let guard = elector
            .clone()
            .acquire(&CancellationToken::new())
            .await
            .expect("leadership acquired");
        let written = finish(server).await;

        assert_eq!(written["spec"]["holderIdentity"], identity.as_str());
        assert_eq!(written["spec"]["leaseTransitions"], 3);
        assert_eq!(written["metadata"]["resourceVersion"], "7");
        assert!(elector.is_leader());

        drop(guard);
        assert!(!elector.is_leader());
    }

    #[tokio::test]
    async fn live_lease_held_by_another_is_left_alone() {
        let (elector, mut handle) = mock_elector(LeaderElectionConfig::new("lease", "default"));

        let server = tokio::spawn(async move {
            let (_, send) = expect(&mut handle, Method::GET).await;
            respond(send, 200, &lease(Some("other"), Utc::now(), 0));
        });

        assert!(!elector.try_acquire_or_renew().await.unwrap());
        finish(server).await;
    }

    #[tokio::test]
    async fn missing_lease_is_created() {
        let config = LeaderElectionConfig::new("lease", "default");
        let identity = config.identity.clone();
        let (elector, mut handle) = mock_elector(config);

        let server = tokio::spawn(async move {
            let (_, send) = expect(&mut handle, Method::GET).await;
            respond(send, 404, &status(404, "NotFound"));

            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.method(), Method::POST);
            assert_eq!(
                request.uri().path(),
                "/apis/coordination.k8s.io/v1/namespaces/default/leases"
            );
            let created = body_json(request).await;
            respond(send, 201, &created);
            created
        });

        assert!(elector.try_acquire_or_renew().await.unwrap());
        let created = finish(server).await;
        assert_eq!(created["spec"]["holderIdentity"], identity.as_str());
        assert_eq!(created["spec"]["leaseDurationSeconds"], 15);
    }

    #[tokio::test]
    async fn conflicting_takeover_reports_not_acquired() {
        let (elector, mut handle) = mock_elector(LeaderElectionConfig::new("lease", "default"));

        let server = tokio::spawn(async move {
            let (_, send) = expect(&mut handle, Method::GET).await;
            respond(send, 200, &lease(None, Utc::now(), 1));

            let (_, send) = expect(&mut handle, Method::PUT).await;
            respond(send, 409, &status(409, "Conflict"));
        });

        assert!(!elector.try_acquire_or_renew().await.unwrap());
        finish(server).await;
        assert!(!elector.is_leader());
    }

    #[tokio::test]
    async fn failed_renewal_signals_lost_leadership() {
        let mut config = LeaderElectionConfig::new("lease", "default");
        config.renew_interval = Duration::from_millis(50);
        let identity = config.identity.clone();
        let (elector, mut handle) = mock_elector(config);

        let server = tokio::spawn(async move {
            let (_, send) = expect(&mut handle, Method::GET).await;
            respond(send, 200, &lease(Some(identity.as_str()), Utc::now(), 0));
            let (request, send) = expect(&mut handle, Method::PUT).await;
            let renewed = body_json(request).await;
            respond(send, 200, &renewed);

            // First renewal after the interval hits a broken API server
            let (_, send) = expect(&mut handle, Method::GET).await;
            respond(send, 500, &status(500, "InternalError"));
        });

        let mut guard = elector
            .clone()
            .acquire(&CancellationToken::new())
            .await
            .expect("leadership acquired");
        tokio::time::timeout(Duration::from_secs(1), guard.lost())
            .await
            .expect("loss must be signalled");
        finish(server).await;
        assert!(!elector.is_leader());
    }

    #[tokio::test]
    async fn release_clears_the_holder() {
        let config = LeaderElectionConfig::new("lease", "default");
        let identity = config.identity.clone();
        let (elector, mut handle) = mock_elector(config);

        let server = tokio::spawn(async move {
            let held = lease(Some(identity.as_str()), Utc::now(), 0);
            let (_, send) = expect(&mut handle, Method::GET).await;
            respond(send, 200, &held);
            let (_, send) = expect(&mut handle, Method::PUT).await;
            respond(send, 200, &held);

            let (_, send) = expect(&mut handle, Method::GET).await;
            respond(send, 200, &held);
            let (request, send) = expect(&mut handle, Method::PATCH).await;
            assert_eq!(
                request.headers()[http::header::CONTENT_TYPE],
                "application/merge-patch+json"
            );
            let patch = body_json(request).await;
            respond(send, 200, &held);
            patch
        });

        let guard = elector
            .clone()
            .acquire(&CancellationToken::new())
            .await
            .expect("leadership acquired");
        guard.release().await.unwrap();

        let patch = finish(server).await;
        assert!(patch["spec"]["holderIdentity"].is_null());
        assert!(patch["spec"].get("holderIdentity").is_some());
    }
}
