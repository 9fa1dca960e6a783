//! # Network Condition Simulation
//!
//! Degrades a client's live transport according to a [`NetworkProfile`].
//! The injector wraps an already-built client as a decorator
//! ([`FaultedClient`] / [`FaultedConversation`]), so the wrapped library
//! stays a black box.
//!
//! ## Impairment axes
//!
//! | Axis          | Effect                                                    |
//! |---------------|-----------------------------------------------------------|
//! | latency/jitter| each live operation delayed by `latency + uniform(0, jitter)` |
//! | packet loss   | message sends and inbound stream events silently dropped  |
//! | disconnection | transport forced offline for a window, rolled per attempt |
//! | bandwidth     | payload transfer time capped at the configured rate       |
//!
//! History reads (`sync`, `messages`) are exempt: poll-mode verification must
//! stay an independent proof from stream-mode delivery. Profiles swap at
//! runtime with last-write-wins semantics and affect only operations issued
//! after the swap.

use crate::client::{MeshClient, MeshConversation, MessageStream};
use crate::error::ClientError;
use crate::types::{
    AccountAddress, ConversationId, DecodedMessage, InboxId, InboxState, MessageId,
    ProtocolVersion,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Default offline window when a profile enables disconnects without a
/// duration.
const DEFAULT_DISCONNECT_MS: u64 = 5_000;

/// Transport impairment profile. Absent fields mean no impairment on that
/// axis.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkProfile {
    pub latency_ms: Option<u64>,
    pub jitter_ms: Option<u64>,
    /// Probability in `[0, 1]` that a message send / inbound event is dropped.
    pub packet_loss_rate: Option<f64>,
    /// Probability in `[0, 1]`, rolled per operation attempt, of opening an
    /// offline window.
    pub disconnect_probability: Option<f64>,
    pub disconnect_duration_ms: Option<u64>,
    pub bandwidth_limit_kbps: Option<u64>,
}

/// Invalid profile field.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProfileError {
    #[error("{field} must be within [0.0, 1.0], got {value}")]
    RateOutOfRange { field: &'static str, value: f64 },
}

impl NetworkProfile {
    /// Satellite-grade round-trip delay.
    #[must_use]
    pub fn high_latency() -> Self {
        Self {
            latency_ms: Some(1_000),
            jitter_ms: Some(500),
            ..Self::default()
        }
    }

    /// Lossy link dropping a quarter of live traffic.
    #[must_use]
    pub fn packet_loss() -> Self {
        Self {
            packet_loss_rate: Some(0.25),
            ..Self::default()
        }
    }

    /// Flapping link: frequent multi-second offline windows.
    #[must_use]
    pub fn disconnection() -> Self {
        Self {
            disconnect_probability: Some(0.25),
            disconnect_duration_ms: Some(5_000),
            ..Self::default()
        }
    }

    /// Narrow pipe, otherwise clean.
    #[must_use]
    pub fn bandwidth_limited() -> Self {
        Self {
            bandwidth_limit_kbps: Some(64),
            ..Self::default()
        }
    }

    /// Slow, jittery and lossy all at once.
    #[must_use]
    pub fn poor_connection() -> Self {
        Self {
            latency_ms: Some(500),
            jitter_ms: Some(250),
            packet_loss_rate: Some(0.1),
            bandwidth_limit_kbps: Some(128),
            ..Self::default()
        }
    }

    /// Check probability fields are valid rates.
    pub fn validate(&self) -> Result<(), ProfileError> {
        for (field, value) in [
            ("packet_loss_rate", self.packet_loss_rate),
            ("disconnect_probability", self.disconnect_probability),
        ] {
            if let Some(rate) = value {
                if !(0.0..=1.0).contains(&rate) {
                    return Err(ProfileError::RateOutOfRange { field, value: rate });
                }
            }
        }
        Ok(())
    }

    /// True when no axis is impaired.
    #[must_use]
    pub fn is_unimpaired(&self) -> bool {
        *self == Self::default()
    }
}

/// Outcome of a fault roll for one operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultDecision {
    Deliver,
    Drop,
}

/// Per-worker fault state: the active profile plus any open offline window.
///
/// Shared between the harness (profile swaps) and the faulted client
/// decorators (per-operation rolls).
pub struct FaultInjector {
    profile: RwLock<NetworkProfile>,
    offline_until: Mutex<Option<Instant>>,
}

impl FaultInjector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            profile: RwLock::new(NetworkProfile::default()),
            offline_until: Mutex::new(None),
        }
    }

    /// Replace the active profile (last-write-wins). In-flight operations
    /// keep the delays they already rolled.
    pub fn set_profile(&self, profile: NetworkProfile) {
        debug!(?profile, "network profile applied");
        *self.profile.write() = profile;
    }

    /// Snapshot of the active profile.
    #[must_use]
    pub fn profile(&self) -> NetworkProfile {
        self.profile.read().clone()
    }

    /// Whether an offline window is currently open (does not roll a new one).
    #[must_use]
    pub fn is_offline(&self) -> bool {
        self.offline_until
            .lock()
            .is_some_and(|until| Instant::now() < until)
    }

    /// Gate a live conversation/metadata operation: offline check plus
    /// transfer delay. Loss does not apply (a dropped creation could not
    /// return a handle).
    pub async fn outbound_op(&self, payload_len: usize) -> Result<(), ClientError> {
        if self.roll_disconnect() {
            return Err(ClientError::Offline);
        }
        self.delay(payload_len).await;
        Ok(())
    }

    /// Gate a message send: offline check, transfer delay, then loss roll.
    pub async fn outbound_send(&self, payload_len: usize) -> Result<FaultDecision, ClientError> {
        if self.roll_disconnect() {
            return Err(ClientError::Offline);
        }
        self.delay(payload_len).await;
        Ok(self.roll_loss())
    }

    /// Gate an inbound stream event: drops are always silent on this path.
    pub async fn inbound(&self, payload_len: usize) -> FaultDecision {
        if self.roll_disconnect() {
            return FaultDecision::Drop;
        }
        if self.roll_loss() == FaultDecision::Drop {
            return FaultDecision::Drop;
        }
        self.delay(payload_len).await;
        FaultDecision::Deliver
    }

    /// Check the open offline window, then roll for a new one.
    fn roll_disconnect(&self) -> bool {
        let mut offline = self.offline_until.lock();
        if let Some(until) = *offline {
            if Instant::now() < until {
                return true;
            }
            *offline = None;
        }

        let profile = self.profile.read().clone();
        let probability = profile.disconnect_probability.unwrap_or(0.0);
        if probability > 0.0 && rand::thread_rng().gen_bool(probability.clamp(0.0, 1.0)) {
            let duration_ms = profile
                .disconnect_duration_ms
                .unwrap_or(DEFAULT_DISCONNECT_MS);
            *offline = Some(Instant::now() + Duration::from_millis(duration_ms));
            warn!(duration_ms, "simulated disconnect window opened");
            return true;
        }
        false
    }

    fn roll_loss(&self) -> FaultDecision {
        let rate = self.profile.read().packet_loss_rate.unwrap_or(0.0);
        if rate > 0.0 && rand::thread_rng().gen_bool(rate.clamp(0.0, 1.0)) {
            FaultDecision::Drop
        } else {
            FaultDecision::Deliver
        }
    }

    /// Latency + jitter + bandwidth transfer time for one payload.
    fn transfer_delay(&self, payload_len: usize) -> Duration {
        let profile = self.profile.read().clone();
        let mut delay = Duration::from_millis(profile.latency_ms.unwrap_or(0));

        if let Some(jitter) = profile.jitter_ms {
            if jitter > 0 {
                delay += Duration::from_millis(rand::thread_rng().gen_range(0..=jitter));
            }
        }

        if let Some(kbps) = profile.bandwidth_limit_kbps {
            if kbps > 0 {
                // Effective throughput is capped at the configured rate.
                let bits = (payload_len as f64) * 8.0;
                delay += Duration::from_secs_f64(bits / (kbps as f64 * 1_000.0));
            }
        }

        delay
    }

    async fn delay(&self, payload_len: usize) {
        let delay = self.transfer_delay(payload_len);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for FaultInjector {
    fn default() -> Self {
        Self::new()
    }
}

/// [`MeshClient`] decorator routing live operations through a
/// [`FaultInjector`].
pub struct FaultedClient {
    inner: Arc<dyn MeshClient>,
    injector: Arc<FaultInjector>,
}

impl FaultedClient {
    #[must_use]
    pub fn new(inner: Arc<dyn MeshClient>, injector: Arc<FaultInjector>) -> Self {
        Self { inner, injector }
    }

    #[must_use]
    pub fn injector(&self) -> Arc<FaultInjector> {
        Arc::clone(&self.injector)
    }

    fn wrap_conversation(&self, inner: Arc<dyn MeshConversation>) -> Arc<dyn MeshConversation> {
        Arc::new(FaultedConversation {
            inner,
            injector: Arc::clone(&self.injector),
        })
    }
}

#[async_trait]
impl MeshClient for FaultedClient {
    fn inbox_id(&self) -> InboxId {
        self.inner.inbox_id()
    }

    fn address(&self) -> AccountAddress {
        self.inner.address()
    }

    fn version(&self) -> ProtocolVersion {
        self.inner.version()
    }

    // History sync is exempt from impairment.
    async fn sync_conversations(&self) -> Result<usize, ClientError> {
        self.inner.sync_conversations().await
    }

    async fn new_dm(&self, peer: &InboxId) -> Result<Arc<dyn MeshConversation>, ClientError> {
        self.injector.outbound_op(0).await?;
        let conversation = self.inner.new_dm(peer).await?;
        Ok(self.wrap_conversation(conversation))
    }

    async fn new_group(
        &self,
        members: &[InboxId],
    ) -> Result<Arc<dyn MeshConversation>, ClientError> {
        self.injector.outbound_op(0).await?;
        let conversation = self.inner.new_group(members).await?;
        Ok(self.wrap_conversation(conversation))
    }

    async fn conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Arc<dyn MeshConversation>, ClientError> {
        let conversation = self.inner.conversation(id).await?;
        Ok(self.wrap_conversation(conversation))
    }

    async fn stream_all_messages(&self) -> Result<MessageStream, ClientError> {
        let stream = self.inner.stream_all_messages().await?;
        Ok(stream.with_injector(Arc::clone(&self.injector)))
    }

    async fn inbox_state(&self) -> Result<InboxState, ClientError> {
        self.injector.outbound_op(0).await?;
        self.inner.inbox_state().await
    }

    async fn can_message(&self, peer: &InboxId) -> Result<bool, ClientError> {
        self.injector.outbound_op(0).await?;
        self.inner.can_message(peer).await
    }
}

/// [`MeshConversation`] decorator applying the owning client's fault state.
pub struct FaultedConversation {
    inner: Arc<dyn MeshConversation>,
    injector: Arc<FaultInjector>,
}

#[async_trait]
impl MeshConversation for FaultedConversation {
    fn id(&self) -> ConversationId {
        self.inner.id()
    }

    async fn send(&self, body: &str) -> Result<MessageId, ClientError> {
        match self.injector.outbound_send(body.len()).await? {
            FaultDecision::Deliver => self.inner.send(body).await,
            FaultDecision::Drop => {
                // Loss is silent: the sender sees a normal ack and the gap
                // must be caught by delivery verification.
                debug!(conversation = %self.inner.id(), "send dropped by loss simulation");
                Ok(MessageId::generate())
            }
        }
    }

    // History reads are exempt from impairment.
    async fn messages(&self) -> Result<Vec<DecodedMessage>, ClientError> {
        self.inner.messages().await
    }

    async fn members(&self) -> Result<Vec<InboxId>, ClientError> {
        self.inner.members().await
    }

    async fn add_members(&self, members: &[InboxId]) -> Result<(), ClientError> {
        self.injector.outbound_op(0).await?;
        self.inner.add_members(members).await
    }

    async fn remove_members(&self, members: &[InboxId]) -> Result<(), ClientError> {
        self.injector.outbound_op(0).await?;
        self.inner.remove_members(members).await
    }

    async fn update_name(&self, name: &str) -> Result<(), ClientError> {
        self.injector.outbound_op(name.len()).await?;
        self.inner.update_name(name).await
    }

    async fn name(&self) -> Result<String, ClientError> {
        self.inner.name().await
    }

    async fn sync(&self) -> Result<(), ClientError> {
        self.inner.sync().await
    }
}
