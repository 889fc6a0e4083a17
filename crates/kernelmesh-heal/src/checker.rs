//! Deadline-bounded liveness check of kernel connections.
//!
//! Every source/destination pair of the connection is probed concurrently
//! and the outcomes are reduced to a single verdict. A check never fails
//! with an error: anything that goes wrong only makes the verdict `false`,
//! and the cause is logged.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use kernelmesh_common::config::LivenessSettings;
use kernelmesh_common::constants;
use kernelmesh_common::context::Context;
use kernelmesh_common::error::KernelmeshError;
use kernelmesh_common::types::{Connection, parse_ip_net};

use crate::pinger::{PingerFactory, SystemPingerFactory};

/// Fully specified checker configuration.
#[derive(Clone)]
pub struct LivenessConfig {
    /// Timeout used when the caller's context has no deadline.
    pub default_timeout: Duration,
    /// Echo requests sent per pair.
    pub packet_count: usize,
    /// How long the aggregator waits past the deadline for late probes.
    pub grace: Duration,
    /// Probe implementation.
    pub pinger_factory: Arc<dyn PingerFactory>,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            default_timeout: constants::DEFAULT_LIVENESS_TIMEOUT,
            packet_count: constants::LIVENESS_PACKET_COUNT,
            grace: constants::LIVENESS_GRACE,
            pinger_factory: Arc::new(SystemPingerFactory::new(constants::PING_BINARY)),
        }
    }
}

impl std::fmt::Debug for LivenessConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivenessConfig")
            .field("default_timeout", &self.default_timeout)
            .field("packet_count", &self.packet_count)
            .field("grace", &self.grace)
            .finish_non_exhaustive()
    }
}

/// Builder applying overrides on top of [`LivenessConfig::default`].
#[derive(Debug, Default)]
pub struct LivenessCheckerBuilder {
    config: LivenessConfig,
}

impl LivenessCheckerBuilder {
    /// Sets the timeout used when the caller sets no deadline.
    #[must_use]
    pub const fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    /// Sets the number of echo requests per pair.
    #[must_use]
    pub const fn packet_count(mut self, count: usize) -> Self {
        self.config.packet_count = count;
        self
    }

    /// Sets the grace period past the deadline.
    #[must_use]
    pub const fn grace(mut self, grace: Duration) -> Self {
        self.config.grace = grace;
        self
    }

    /// Replaces the probe implementation.
    #[must_use]
    pub fn pinger_factory(mut self, factory: Arc<dyn PingerFactory>) -> Self {
        self.config.pinger_factory = factory;
        self
    }

    /// Builds the checker.
    #[must_use]
    pub fn build(self) -> LivenessChecker {
        LivenessChecker {
            config: self.config,
        }
    }
}

/// Outcome of one dispatched probe.
#[derive(Debug)]
struct ProbeOutcome {
    src: IpAddr,
    dst: IpAddr,
    received: usize,
    error: Option<KernelmeshError>,
}

impl ProbeOutcome {
    const fn is_alive(&self) -> bool {
        self.error.is_none() && self.received > 0
    }
}

/// Verifies that a kernel connection still forwards traffic.
#[derive(Debug, Clone, Default)]
pub struct LivenessChecker {
    config: LivenessConfig,
}

impl LivenessChecker {
    /// Starts a builder from the default configuration.
    #[must_use]
    pub fn builder() -> LivenessCheckerBuilder {
        LivenessCheckerBuilder::default()
    }

    /// Creates a checker from forwarder settings, probing with the system `ping`.
    #[must_use]
    pub fn from_settings(settings: &LivenessSettings) -> Self {
        Self::builder()
            .default_timeout(settings.default_timeout())
            .packet_count(settings.packet_count)
            .grace(settings.grace())
            .pinger_factory(Arc::new(SystemPingerFactory::new(&settings.ping_binary)))
            .build()
    }

    /// Returns the active configuration.
    #[must_use]
    pub const fn config(&self) -> &LivenessConfig {
        &self.config
    }

    /// Probes every address pair of `conn` and returns `true` if all answered.
    ///
    /// Non-kernel connections and connections without address pairs are
    /// reported live. Pairs whose address families differ are skipped.
    /// Probes share the time left until the deadline of `ctx`, or the
    /// default timeout when `ctx` has none.
    pub async fn check(&self, ctx: &Context, conn: &Connection) -> bool {
        if !conn.mechanism.is_kernel() {
            tracing::warn!(
                id = %conn.id,
                mechanism = %conn.mechanism.kind,
                "liveness check is only supported for kernel mechanisms"
            );
            return true;
        }

        let ip = &conn.context.ip_context;
        let total = ip.src_ip_addrs.len() * ip.dst_ip_addrs.len();
        if total == 0 {
            return true;
        }

        let Some(pairs) = probe_pairs(conn) else {
            return false;
        };
        let skipped = total - pairs.len();
        if pairs.is_empty() {
            tracing::debug!(id = %conn.id, skipped, "no address pair to probe");
            return true;
        }

        let timeout = ctx.remaining_or(self.config.default_timeout);
        let deadline = Instant::now() + timeout;
        let dispatched = pairs.len();
        let (tx, mut rx) = mpsc::channel(dispatched);
        for (src, dst) in pairs {
            let tx = tx.clone();
            let factory = Arc::clone(&self.config.pinger_factory);
            let count = self.config.packet_count;
            let _ = tokio::task::spawn_blocking(move || {
                let mut pinger = factory.create_pinger(src, dst, timeout, count);
                let error = pinger.run().err();
                let _ = tx.blocking_send(ProbeOutcome {
                    src,
                    dst,
                    received: pinger.received_packets(),
                    error,
                });
            });
        }
        drop(tx);

        let limit = deadline + self.config.grace;
        let mut alive = true;
        for _ in 0..dispatched {
            match tokio::time::timeout_at(limit, rx.recv()).await {
                Ok(Some(outcome)) => {
                    if !outcome.is_alive() {
                        log_failure(conn, &outcome);
                        alive = false;
                    }
                }
                Ok(None) => {
                    tracing::error!(id = %conn.id, "probe ended without reporting");
                    return false;
                }
                Err(_) => {
                    tracing::warn!(
                        id = %conn.id,
                        ?timeout,
                        "liveness check deadline exceeded"
                    );
                    return false;
                }
            }
        }
        tracing::debug!(id = %conn.id, dispatched, skipped, alive, "liveness check done");
        alive
    }
}

/// Pairs with matching address families, or `None` if any address is invalid.
fn probe_pairs(conn: &Connection) -> Option<Vec<(IpAddr, IpAddr)>> {
    let ip = &conn.context.ip_context;
    let parse = |cidrs: &[String]| -> Option<Vec<IpAddr>> {
        cidrs
            .iter()
            .map(|cidr| {
                parse_ip_net(cidr)
                    .map_err(|e| {
                        tracing::error!(id = %conn.id, error = %e, "cannot probe address");
                    })
                    .ok()
            })
            .collect()
    };
    let srcs = parse(&ip.src_ip_addrs)?;
    let dsts = parse(&ip.dst_ip_addrs)?;
    Some(
        srcs.iter()
            .flat_map(|src| dsts.iter().map(move |dst| (*src, *dst)))
            .filter(|(src, dst)| src.is_ipv4() == dst.is_ipv4())
            .collect(),
    )
}

fn log_failure(conn: &Connection, outcome: &ProbeOutcome) {
    match &outcome.error {
        Some(e) => tracing::error!(
            id = %conn.id,
            src = %outcome.src,
            dst = %outcome.dst,
            error = %e,
            "probe failed"
        ),
        None => tracing::error!(
            id = %conn.id,
            src = %outcome.src,
            dst = %outcome.dst,
            received = outcome.received,
            "no echo reply"
        ),
    }
}

/// Checks `conn` with the default configuration.
pub async fn kernel_liveness_check(ctx: &Context, conn: &Connection) -> bool {
    LivenessChecker::default().check(ctx, conn).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Barrier, Mutex};

    use kernelmesh_common::error::Result;
    use kernelmesh_common::types::{Mechanism, MechanismKind};

    use crate::pinger::Pinger;

    /// Deterministic probe double.
    #[derive(Default)]
    struct MockFactory {
        received: usize,
        delay: Duration,
        fail: bool,
        barrier: Option<Arc<Barrier>>,
        created: Mutex<Vec<(IpAddr, IpAddr, Duration, usize)>>,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    }

    struct MockPinger {
        received: usize,
        reported: usize,
        delay: Duration,
        fail: bool,
        barrier: Option<Arc<Barrier>>,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    }

    impl PingerFactory for MockFactory {
        fn create_pinger(
            &self,
            src: IpAddr,
            dst: IpAddr,
            timeout: Duration,
            count: usize,
        ) -> Box<dyn Pinger> {
            self.created.lock().unwrap().push((src, dst, timeout, count));
            Box::new(MockPinger {
                received: self.received,
                reported: 0,
                delay: self.delay,
                fail: self.fail,
                barrier: self.barrier.clone(),
                in_flight: Arc::clone(&self.in_flight),
                max_in_flight: Arc::clone(&self.max_in_flight),
            })
        }
    }

    impl Pinger for MockPinger {
        fn run(&mut self) -> Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(barrier) = &self.barrier {
                let _ = barrier.wait();
            }
            std::thread::sleep(self.delay);
            let _ = self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                return Err(KernelmeshError::Probe {
                    src: "mock".into(),
                    dst: "mock".into(),
                    message: "network unreachable".into(),
                });
            }
            self.reported = self.received;
            Ok(())
        }

        fn received_packets(&self) -> usize {
            self.reported
        }
    }

    fn checker(factory: &Arc<MockFactory>) -> LivenessChecker {
        LivenessChecker::builder()
            .pinger_factory(Arc::clone(factory) as Arc<dyn PingerFactory>)
            .build()
    }

    fn conn(src: &[&str], dst: &[&str]) -> Connection {
        let mut conn = Connection::new(Mechanism::kernel("nsm-1", "file:///var/run/netns/pod"));
        conn.context.ip_context.src_ip_addrs = src.iter().map(ToString::to_string).collect();
        conn.context.ip_context.dst_ip_addrs = dst.iter().map(ToString::to_string).collect();
        conn
    }

    fn dispatched(factory: &MockFactory) -> usize {
        factory.created.lock().unwrap().len()
    }

    #[tokio::test]
    async fn no_pairs_is_live() {
        let factory = Arc::new(MockFactory::default());
        assert!(checker(&factory).check(&Context::new(), &conn(&[], &["10.0.0.2/32"])).await);
        assert_eq!(dispatched(&factory), 0);
    }

    #[tokio::test]
    async fn other_mechanisms_are_live() {
        let factory = Arc::new(MockFactory::default());
        let mut c = conn(&["10.0.0.1/32"], &["10.0.0.2/32"]);
        c.mechanism.kind = MechanismKind::Other("MEMIF".into());

        assert!(checker(&factory).check(&Context::new(), &c).await);
        assert_eq!(dispatched(&factory), 0);
    }

    #[tokio::test]
    async fn partial_replies_are_live() {
        let factory = Arc::new(MockFactory {
            received: 2,
            ..MockFactory::default()
        });

        let live = checker(&factory)
            .check(&Context::new(), &conn(&["10.0.0.1/32"], &["10.0.0.2/32"]))
            .await;

        assert!(live);
        let created = factory.created.lock().unwrap().clone();
        assert_eq!(created.len(), 1);
        let (src, dst, timeout, count) = created[0];
        assert_eq!(src, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(dst, "10.0.0.2".parse::<IpAddr>().unwrap());
        assert!(timeout <= constants::DEFAULT_LIVENESS_TIMEOUT);
        assert_eq!(count, 4);
    }

    #[tokio::test]
    async fn no_replies_is_not_live() {
        let factory = Arc::new(MockFactory::default());
        let live = checker(&factory)
            .check(&Context::new(), &conn(&["10.0.0.1/32"], &["10.0.0.2/32"]))
            .await;
        assert!(!live);
    }

    #[tokio::test]
    async fn failing_pair_dominates_mismatched_pair() {
        let factory = Arc::new(MockFactory::default());

        let live = checker(&factory)
            .check(
                &Context::new(),
                &conn(&["10.0.0.1/32"], &["10.0.0.2/32", "fd00::2/128"]),
            )
            .await;

        assert!(!live);
        assert_eq!(dispatched(&factory), 1, "mismatched pair is never probed");
    }

    #[tokio::test]
    async fn only_mismatched_pairs_is_live() {
        let factory = Arc::new(MockFactory::default());
        let live = checker(&factory)
            .check(&Context::new(), &conn(&["10.0.0.1/32"], &["fd00::2/128"]))
            .await;
        assert!(live);
        assert_eq!(dispatched(&factory), 0);
    }

    #[tokio::test]
    async fn transport_error_is_not_live() {
        let factory = Arc::new(MockFactory {
            received: 4,
            fail: true,
            ..MockFactory::default()
        });
        let live = checker(&factory)
            .check(&Context::new(), &conn(&["10.0.0.1/32"], &["10.0.0.2/32"]))
            .await;
        assert!(!live);
    }

    #[tokio::test]
    async fn invalid_address_is_not_live() {
        let factory = Arc::new(MockFactory {
            received: 4,
            ..MockFactory::default()
        });
        let live = checker(&factory)
            .check(&Context::new(), &conn(&["10.0.0.1/32"], &["not-an-ip"]))
            .await;
        assert!(!live);
        assert_eq!(dispatched(&factory), 0);
    }

    #[tokio::test]
    async fn ten_pairs_are_probed_concurrently() {
        let delay = Duration::from_millis(150);
        let factory = Arc::new(MockFactory {
            received: 1,
            delay,
            barrier: Some(Arc::new(Barrier::new(10))),
            ..MockFactory::default()
        });
        let dsts: Vec<String> = (2..12).map(|i| format!("10.0.0.{i}/32")).collect();
        let dsts: Vec<&str> = dsts.iter().map(String::as_str).collect();
        let checker = LivenessChecker::builder()
            .pinger_factory(Arc::clone(&factory) as Arc<dyn PingerFactory>)
            .default_timeout(Duration::from_secs(5))
            .build();

        let started = std::time::Instant::now();
        let live = checker
            .check(&Context::new(), &conn(&["10.0.0.1/32"], &dsts))
            .await;
        let elapsed = started.elapsed();

        assert!(live);
        assert_eq!(dispatched(&factory), 10);
        assert_eq!(factory.max_in_flight.load(Ordering::SeqCst), 10);
        assert!(elapsed < delay * 5, "took {elapsed:?}, sum would be {:?}", delay * 10);
    }

    #[tokio::test]
    async fn caller_deadline_bounds_the_check() {
        let factory = Arc::new(MockFactory {
            received: 4,
            delay: Duration::from_millis(600),
            ..MockFactory::default()
        });
        let checker = LivenessChecker::builder()
            .pinger_factory(Arc::clone(&factory) as Arc<dyn PingerFactory>)
            .grace(Duration::from_millis(50))
            .build();

        let started = std::time::Instant::now();
        let live = checker
            .check(
                &Context::with_timeout(Duration::from_millis(100)),
                &conn(&["10.0.0.1/32"], &["10.0.0.2/32"]),
            )
            .await;

        assert!(!live);
        assert!(started.elapsed() < Duration::from_millis(500));
        let (_, _, timeout, _) = factory.created.lock().unwrap()[0];
        assert!(timeout <= Duration::from_millis(100));
    }

    #[test]
    fn builder_overrides_defaults() {
        let checker = LivenessChecker::builder()
            .packet_count(2)
            .grace(Duration::ZERO)
            .build();
        assert_eq!(checker.config().packet_count, 2);
        assert_eq!(checker.config().grace, Duration::ZERO);
        assert_eq!(
            checker.config().default_timeout,
            constants::DEFAULT_LIVENESS_TIMEOUT
        );
    }

    #[test]
    fn from_settings_copies_every_field() {
        let settings = LivenessSettings {
            default_timeout_ms: 250,
            packet_count: 3,
            grace_ms: 10,
            ping_binary: "/bin/ping".into(),
        };
        let config = LivenessChecker::from_settings(&settings).config().clone();
        assert_eq!(config.default_timeout, Duration::from_millis(250));
        assert_eq!(config.packet_count, 3);
        assert_eq!(config.grace, Duration::from_millis(10));
    }
}
