//! Delivery verification across a set of receiver workers.
//!
//! A verification sends a numbered batch of payloads into one
//! conversation and checks what each receiver observed. Payloads are
//! `<prefix><index>-<token>` with a per-run token, so concurrent or
//! back-to-back verifications on the same conversation never count each
//! other's traffic.
//!
//! Three modes cover the interesting failure surfaces:
//! - **stream**: receivers collect from their live streams; collectors
//!   are registered before the first send, so nothing can fall between
//!   registration and delivery.
//! - **poll**: receivers sync and read history after the fact; immune
//!   to stream faults by construction.
//! - **offline recovery**: one receiver is terminated first, the batch
//!   is sent while it is away, and a fresh worker over the same
//!   identity and storage must find the full batch in history.

use std::sync::Arc;
use std::time::Duration;

use mesh_client::{ContentType, DecodedMessage, MeshConversation};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use tracing::info;

use crate::config::DEFAULT_PER_MESSAGE_TIMEOUT;
use crate::error::{PoolError, VerifyError};
use crate::pool::{self, WorkerDescriptor, WorkerPool};
use crate::thresholds::{DELIVERY_RATE_FLOOR, ORDER_RATE_FLOOR};
use crate::worker::Worker;

/// Parameters of one verification run.
#[derive(Clone, Debug)]
pub struct VerifyOptions {
    /// Number of payloads to send and expect.
    pub count: usize,
    /// Content type the receivers filter for.
    pub content_type: ContentType,
    /// Explicit batch token; a random one is drawn when absent.
    pub token: Option<String>,
    /// Wait budget per expected message while collecting.
    pub per_message_timeout: Duration,
    /// Payload prefix ahead of the index.
    pub payload_prefix: String,
}

impl VerifyOptions {
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            count,
            content_type: ContentType::Text,
            token: None,
            per_message_timeout: DEFAULT_PER_MESSAGE_TIMEOUT,
            payload_prefix: "gm-".to_owned(),
        }
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = content_type;
        self
    }

    #[must_use]
    pub fn with_per_message_timeout(mut self, timeout: Duration) -> Self {
        self.per_message_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_payload_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.payload_prefix = prefix.into();
        self
    }

    /// The numbered payloads for this run, send order.
    #[must_use]
    pub fn expected_payloads(&self, token: &str) -> Vec<String> {
        (1..=self.count)
            .map(|index| format!("{}{}-{}", self.payload_prefix, index, token))
            .collect()
    }

    fn resolve_token(&self) -> String {
        self.token.clone().unwrap_or_else(random_token)
    }

    fn collection_timeout(&self) -> Duration {
        self.per_message_timeout * self.count.max(1) as u32
    }
}

fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

/// Delivery and ordering statistics over a receiver set.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct MessageStats {
    /// Every receiver observed every expected payload.
    pub all_received: bool,
    /// Received over expected across all receivers, in percent.
    /// Deliberately uncapped: duplicate delivery shows up as >100.
    pub reception_percentage: f64,
    /// Fraction of receivers whose observed sequence matches the send
    /// order exactly, in percent.
    pub order_percentage: f64,
}

/// Fold per-receiver observations into aggregate statistics.
///
/// With no receivers or no expected payloads there is nothing that can
/// have been missed, so the result is a clean 100/100.
#[must_use]
pub fn compute_message_stats(observed: &[Vec<String>], expected: &[String]) -> MessageStats {
    if observed.is_empty() || expected.is_empty() {
        return MessageStats {
            all_received: true,
            reception_percentage: 100.0,
            order_percentage: 100.0,
        };
    }
    let mut total_received = 0usize;
    let mut receivers_in_order = 0usize;
    let mut all_received = true;
    for payloads in observed {
        total_received += payloads.len();
        if payloads == expected {
            receivers_in_order += 1;
        }
        if !expected.iter().all(|payload| payloads.contains(payload)) {
            all_received = false;
        }
    }
    let denominator = (observed.len() * expected.len()) as f64;
    MessageStats {
        all_received,
        reception_percentage: total_received as f64 / denominator * 100.0,
        order_percentage: receivers_in_order as f64 / observed.len() as f64 * 100.0,
    }
}

/// What one receiver observed during a verification.
#[derive(Clone, Debug, Serialize)]
pub struct ReceiverReport {
    pub worker: String,
    /// Matching payload bodies in observation order.
    pub payloads: Vec<String>,
}

/// Outcome of one verification run.
#[derive(Clone, Debug, Serialize)]
pub struct DeliveryReport {
    pub token: String,
    pub expected: Vec<String>,
    pub receivers: Vec<ReceiverReport>,
    pub stats: MessageStats,
}

impl DeliveryReport {
    #[must_use]
    pub fn all_received(&self) -> bool {
        self.stats.all_received
    }

    #[must_use]
    pub fn reception_percentage(&self) -> f64 {
        self.stats.reception_percentage
    }

    #[must_use]
    pub fn order_percentage(&self) -> f64 {
        self.stats.order_percentage
    }

    /// Whether the run clears the delivery and ordering floors.
    #[must_use]
    pub fn meets_floors(&self) -> bool {
        self.stats.reception_percentage >= DELIVERY_RATE_FLOOR
            && self.stats.order_percentage >= ORDER_RATE_FLOOR
    }
}

/// Send a batch and verify it on the receivers' live streams.
///
/// Collectors are registered on every receiver before the first payload
/// is sent. A receiver that times out contributes whatever it saw;
/// a receiver whose stream faults fails the whole verification.
pub async fn verify_message_stream(
    conversation: &dyn MeshConversation,
    receivers: &[Arc<Worker>],
    options: &VerifyOptions,
) -> Result<DeliveryReport, VerifyError> {
    let token = options.resolve_token();
    let expected = options.expected_payloads(&token);
    let conversation_id = conversation.id();

    let mut labels = Vec::with_capacity(receivers.len());
    let mut collections = Vec::with_capacity(receivers.len());
    for receiver in receivers {
        labels.push(receiver.label());
        collections.push(receiver.collect_messages(
            &conversation_id,
            options.content_type,
            &token,
            options.count,
            options.collection_timeout(),
        ));
    }

    for payload in &expected {
        conversation.send(payload).await.map_err(VerifyError::Send)?;
    }

    let results = futures::future::join_all(collections).await;
    let mut receiver_reports = Vec::with_capacity(labels.len());
    for (worker, result) in labels.into_iter().zip(results) {
        let messages = result?;
        receiver_reports.push(ReceiverReport {
            worker,
            payloads: bodies(messages),
        });
    }

    Ok(build_report(token, expected, receiver_reports, "stream"))
}

/// Send a batch and verify it by syncing and reading history.
///
/// No live streams are involved, so this passes even when every
/// receiver's stream path is fully impaired.
pub async fn verify_message_poll(
    conversation: &dyn MeshConversation,
    receivers: &[Arc<Worker>],
    options: &VerifyOptions,
) -> Result<DeliveryReport, VerifyError> {
    let token = options.resolve_token();
    let expected = options.expected_payloads(&token);
    let conversation_id = conversation.id();

    for payload in &expected {
        conversation.send(payload).await.map_err(VerifyError::Send)?;
    }

    let mut receiver_reports = Vec::with_capacity(receivers.len());
    for receiver in receivers {
        let worker = receiver.label();
        let attribute = |source| VerifyError::Receiver {
            worker: receiver.label(),
            source,
        };
        let convo = receiver
            .conversation(&conversation_id)
            .await
            .map_err(attribute)?;
        convo.sync().await.map_err(attribute)?;
        let history = convo.messages().await.map_err(attribute)?;
        receiver_reports.push(ReceiverReport {
            worker,
            payloads: bodies(filter_history(history, options.content_type, &token)),
        });
    }

    Ok(build_report(token, expected, receiver_reports, "poll"))
}

/// Terminate a receiver, send the batch while it is away, then bring a
/// fresh worker up over the same identity and storage and verify the
/// full batch is present in recovered history.
pub async fn verify_offline_recovery(
    pool: &WorkerPool,
    offline_worker: &str,
    conversation: &dyn MeshConversation,
    options: &VerifyOptions,
) -> Result<DeliveryReport, VerifyError> {
    let (name, installation) = pool::split_lookup(offline_worker);
    let worker = pool
        .get_installation(&name, &installation)
        .ok_or_else(|| {
            VerifyError::Pool(PoolError::NotReady {
                name: name.clone(),
                installation: installation.clone(),
            })
        })?;
    let descriptor = WorkerDescriptor::new(worker.name())
        .with_installation(worker.installation_id())
        .with_version(worker.version());
    let label = worker.label();
    drop(worker);

    pool.terminate_worker(offline_worker).await?;
    info!(worker = %label, "receiver offline; sending batch while away");

    let token = options.resolve_token();
    let expected = options.expected_payloads(&token);
    let conversation_id = conversation.id();
    for payload in &expected {
        conversation.send(payload).await.map_err(VerifyError::Send)?;
    }

    let mut recreated = pool.create_workers(descriptor).await?;
    let receiver = recreated.pop().ok_or(VerifyError::Pool(PoolError::NotReady {
        name,
        installation,
    }))?;
    let attribute = |source| VerifyError::Receiver {
        worker: receiver.label(),
        source,
    };
    receiver
        .client()
        .sync_conversations()
        .await
        .map_err(attribute)?;
    let convo = receiver
        .conversation(&conversation_id)
        .await
        .map_err(attribute)?;
    convo.sync().await.map_err(attribute)?;
    let history = convo.messages().await.map_err(attribute)?;
    let report = ReceiverReport {
        worker: receiver.label(),
        payloads: bodies(filter_history(history, options.content_type, &token)),
    };

    Ok(build_report(token, expected, vec![report], "offline-recovery"))
}

fn bodies(messages: Vec<DecodedMessage>) -> Vec<String> {
    messages.into_iter().map(|message| message.body).collect()
}

fn filter_history(
    history: Vec<DecodedMessage>,
    content_type: ContentType,
    token: &str,
) -> Vec<DecodedMessage> {
    history
        .into_iter()
        .filter(|message| message.content_type == content_type && message.body.contains(token))
        .collect()
}

fn build_report(
    token: String,
    expected: Vec<String>,
    receivers: Vec<ReceiverReport>,
    mode: &str,
) -> DeliveryReport {
    let observed: Vec<Vec<String>> = receivers
        .iter()
        .map(|report| report.payloads.clone())
        .collect();
    let stats = compute_message_stats(&observed, &expected);
    info!(
        mode,
        token = %token,
        receivers = receivers.len(),
        expected = expected.len(),
        reception = stats.reception_percentage,
        order = stats.order_percentage,
        "verification complete"
    );
    DeliveryReport {
        token,
        expected,
        receivers,
        stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HarnessConfig;
    use mesh_client::{LocalMeshNetwork, NetworkProfile};
    use tempfile::TempDir;

    fn stats(observed: &[&[&str]], expected: &[&str]) -> MessageStats {
        let observed: Vec<Vec<String>> = observed
            .iter()
            .map(|payloads| payloads.iter().map(|s| (*s).to_owned()).collect())
            .collect();
        let expected: Vec<String> = expected.iter().map(|s| (*s).to_owned()).collect();
        compute_message_stats(&observed, &expected)
    }

    #[test]
    fn stats_full_delivery_in_order() {
        let result = stats(
            &[&["gm-1-t", "gm-2-t"], &["gm-1-t", "gm-2-t"]],
            &["gm-1-t", "gm-2-t"],
        );
        assert!(result.all_received);
        assert_eq!(result.reception_percentage, 100.0);
        assert_eq!(result.order_percentage, 100.0);
    }

    #[test]
    fn stats_partial_delivery_counts_received() {
        let result = stats(
            &[&["gm-1-t", "gm-2-t"], &["gm-1-t"]],
            &["gm-1-t", "gm-2-t"],
        );
        assert!(!result.all_received);
        assert_eq!(result.reception_percentage, 75.0);
        assert_eq!(result.order_percentage, 50.0);
    }

    #[test]
    fn stats_out_of_order_receiver_fails_order_only() {
        let result = stats(&[&["gm-2-t", "gm-1-t"]], &["gm-1-t", "gm-2-t"]);
        assert!(result.all_received);
        assert_eq!(result.reception_percentage, 100.0);
        assert_eq!(result.order_percentage, 0.0);
    }

    #[test]
    fn stats_duplicates_push_reception_past_hundred() {
        let result = stats(&[&["gm-1-t", "gm-1-t"]], &["gm-1-t"]);
        assert_eq!(result.reception_percentage, 200.0);
        assert_eq!(result.order_percentage, 0.0);
    }

    #[test]
    fn stats_trivial_inputs_are_clean() {
        let empty_receivers = stats(&[], &["gm-1-t"]);
        assert!(empty_receivers.all_received);
        assert_eq!(empty_receivers.reception_percentage, 100.0);

        let empty_expected = stats(&[&[]], &[]);
        assert!(empty_expected.all_received);
        assert_eq!(empty_expected.order_percentage, 100.0);
    }

    #[test]
    fn expected_payloads_are_numbered_from_one() {
        let options = VerifyOptions::new(3).with_token("tok");
        assert_eq!(
            options.expected_payloads("tok"),
            ["gm-1-tok", "gm-2-tok", "gm-3-tok"]
        );
    }

    struct Fixture {
        pool: WorkerPool,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = HarnessConfig::new("verify-tests").with_base_dir(dir.path());
        let network = Arc::new(LocalMeshNetwork::new());
        let pool = WorkerPool::new(config, network.registry()).unwrap();
        Fixture { pool, _dir: dir }
    }

    #[tokio::test]
    async fn stream_mode_verifies_group_delivery() {
        let fixture = fixture();
        let workers = fixture
            .pool
            .create_workers_named(&["henry", "nancy", "oscar"])
            .await
            .unwrap();
        let (sender, receivers) = workers.split_first().unwrap();

        let members: Vec<_> = receivers
            .iter()
            .map(|worker| worker.inbox_id().clone())
            .collect();
        let convo = sender.client().new_group(&members).await.unwrap();

        let options = VerifyOptions::new(5).with_token("batch1");
        let report = verify_message_stream(convo.as_ref(), receivers, &options)
            .await
            .unwrap();

        assert!(report.all_received());
        assert_eq!(report.reception_percentage(), 100.0);
        assert_eq!(report.order_percentage(), 100.0);
        assert!(report.meets_floors());
        for receiver in &report.receivers {
            assert_eq!(receiver.payloads, report.expected);
        }
    }

    #[tokio::test]
    async fn lossy_receiver_is_reported_not_hidden() {
        let fixture = fixture();
        let workers = fixture
            .pool
            .create_workers_named(&["bob", "alice"])
            .await
            .unwrap();
        let (sender, receiver) = (&workers[0], &workers[1]);

        let convo = sender
            .client()
            .new_dm(receiver.inbox_id())
            .await
            .unwrap();
        let mut blackout = NetworkProfile::packet_loss();
        blackout.packet_loss_rate = Some(1.0);
        fixture
            .pool
            .set_worker_network_conditions("alice", blackout)
            .unwrap();

        let options = VerifyOptions::new(3)
            .with_token("lost")
            .with_per_message_timeout(Duration::from_millis(50));
        let report =
            verify_message_stream(convo.as_ref(), &[Arc::clone(receiver)], &options)
                .await
                .unwrap();

        assert!(!report.all_received());
        assert_eq!(report.reception_percentage(), 0.0);
        assert!(!report.meets_floors());
    }

    #[tokio::test]
    async fn poll_mode_is_immune_to_stream_loss() {
        let fixture = fixture();
        let workers = fixture
            .pool
            .create_workers_named(&["bob", "alice"])
            .await
            .unwrap();
        let (sender, receiver) = (&workers[0], &workers[1]);

        let convo = sender
            .client()
            .new_dm(receiver.inbox_id())
            .await
            .unwrap();
        let mut blackout = NetworkProfile::packet_loss();
        blackout.packet_loss_rate = Some(1.0);
        fixture
            .pool
            .set_worker_network_conditions("alice", blackout)
            .unwrap();

        let options = VerifyOptions::new(3).with_token("polled");
        let report = verify_message_poll(convo.as_ref(), &[Arc::clone(receiver)], &options)
            .await
            .unwrap();

        assert!(report.all_received());
        assert_eq!(report.reception_percentage(), 100.0);
        assert_eq!(report.order_percentage(), 100.0);
    }

    #[tokio::test]
    async fn consecutive_batches_do_not_cross_count() {
        let fixture = fixture();
        let workers = fixture
            .pool
            .create_workers_named(&["bob", "alice"])
            .await
            .unwrap();
        let (sender, receiver) = (&workers[0], &workers[1]);
        let convo = sender
            .client()
            .new_dm(receiver.inbox_id())
            .await
            .unwrap();

        let first = verify_message_stream(
            convo.as_ref(),
            &[Arc::clone(receiver)],
            &VerifyOptions::new(2).with_token("first"),
        )
        .await
        .unwrap();
        let second = verify_message_stream(
            convo.as_ref(),
            &[Arc::clone(receiver)],
            &VerifyOptions::new(2).with_token("second"),
        )
        .await
        .unwrap();

        assert_eq!(first.reception_percentage(), 100.0);
        assert_eq!(second.reception_percentage(), 100.0);
        assert_eq!(second.receivers[0].payloads, second.expected);
    }

    #[tokio::test]
    async fn offline_receiver_recovers_full_history() {
        let fixture = fixture();
        let workers = fixture
            .pool
            .create_workers_named(&["bob", "henry"])
            .await
            .unwrap();
        let sender = &workers[0];
        let receiver_inbox = workers[1].inbox_id().clone();
        let convo = sender.client().new_dm(&receiver_inbox).await.unwrap();

        let options = VerifyOptions::new(3).with_token("away");
        let report = verify_offline_recovery(&fixture.pool, "henry", convo.as_ref(), &options)
            .await
            .unwrap();

        assert!(report.all_received());
        assert_eq!(report.order_percentage(), 100.0);
        assert_eq!(report.receivers.len(), 1);
        assert_eq!(report.receivers[0].payloads, report.expected);
        // The recovered worker is back in the pool.
        assert!(fixture.pool.get("henry").is_some());
    }

    #[tokio::test]
    async fn send_failures_abort_verification() {
        let fixture = fixture();
        let workers = fixture
            .pool
            .create_workers_named(&["bob", "alice"])
            .await
            .unwrap();
        let (sender, receiver) = (&workers[0], &workers[1]);

        let convo = sender
            .client()
            .new_group(&[receiver.inbox_id().clone()])
            .await
            .unwrap();
        // Sender leaves the group; its sends must now be refused.
        convo
            .remove_members(&[sender.inbox_id().clone()])
            .await
            .unwrap();

        let err = verify_message_stream(
            convo.as_ref(),
            &[Arc::clone(receiver)],
            &VerifyOptions::new(1).with_token("refused"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, VerifyError::Send(_)));
    }

    #[tokio::test]
    async fn unknown_offline_worker_is_a_pool_error() {
        let fixture = fixture();
        let workers = fixture.pool.create_workers_named(&["bob"]).await.unwrap();
        let convo = workers[0]
            .client()
            .new_group(&[])
            .await
            .unwrap();

        let err = verify_offline_recovery(
            &fixture.pool,
            "ghost",
            convo.as_ref(),
            &VerifyOptions::new(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, VerifyError::Pool(PoolError::NotReady { .. })));
    }
}
