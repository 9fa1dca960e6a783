//! One isolated execution unit owning exactly one protocol client.
//!
//! A worker is built in five timed steps (signer, storage path, client
//! build, stream start, initial sync) so that slow or broken
//! environments show up as a per-step timing rather than one opaque
//! stall. After initialization the worker runs a background consumer
//! that fans every inbound stream item out on a broadcast channel;
//! collectors subscribe to that channel and never touch the client
//! stream directly, so any number of concurrent collections can observe
//! the same traffic.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mesh_client::{
    AccountAddress, ClientError, ClientOptions, ClientRegistry, ContentType, ConversationId,
    DecodedMessage, FaultInjector, FaultedClient, InboxId, MeshClient, MeshConversation,
    MeshSigner, MessageStream, NetworkProfile, ProtocolVersion,
};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{HarnessConfig, StreamMode};
use crate::error::{StreamFault, WorkerInitError};
use crate::identity::WorkerIdentity;
use crate::storage;

const EVENT_CHANNEL_CAPACITY: usize = 1_000;

/// Notification fanned out by a worker's background stream consumer.
#[derive(Clone, Debug)]
pub enum WorkerEvent {
    /// A message arrived on the live stream.
    StreamMessage(DecodedMessage),
    /// The stream reported a fault or closed underneath the consumer.
    StreamError { detail: String },
}

/// Wall-clock duration of each initialization step.
#[derive(Clone, Copy, Debug, Default)]
pub struct InitTimings {
    pub signer: Duration,
    pub storage_path: Duration,
    pub client_build: Duration,
    pub stream_start: Duration,
    pub sync: Duration,
    pub total: Duration,
}

/// A named, versioned protocol client plus its stream consumer.
pub struct Worker {
    name: String,
    installation_id: String,
    version: ProtocolVersion,
    identity: Arc<WorkerIdentity>,
    address: AccountAddress,
    inbox_id: InboxId,
    storage_path: PathBuf,
    client: Arc<dyn MeshClient>,
    injector: Arc<FaultInjector>,
    events: broadcast::Sender<WorkerEvent>,
    stream_task: Mutex<Option<JoinHandle<()>>>,
    terminated: AtomicBool,
    init_timings: InitTimings,
}

impl Worker {
    /// Build a worker through the five timed steps. On a later-step
    /// failure, anything already started is torn down before returning,
    /// so a failed initialization never leaks a stream consumer.
    pub(crate) async fn initialize(
        config: &HarnessConfig,
        registry: &ClientRegistry,
        identity: Arc<WorkerIdentity>,
        name: &str,
        installation_id: &str,
        version: Option<ProtocolVersion>,
    ) -> Result<Self, WorkerInitError> {
        let label = format!("{name}-{installation_id}");
        let overall = Instant::now();

        // Step 1: rebuild key material.
        let step = Instant::now();
        let signer = identity
            .signer()
            .map_err(|source| WorkerInitError::Identity {
                worker: label.clone(),
                source,
            })?;
        let storage_key = identity
            .storage_key()
            .map_err(|source| WorkerInitError::Identity {
                worker: label.clone(),
                source,
            })?;
        let address = signer.address();
        let signer_elapsed = step.elapsed();

        let builder = registry.resolve(version).map_err(|e| match e {
            ClientError::UnsupportedVersion(v) => WorkerInitError::UnsupportedVersion {
                worker: label.clone(),
                version: v,
            },
            other => WorkerInitError::ClientBuild {
                worker: label.clone(),
                source: other,
            },
        })?;
        let resolved_version = builder.version();

        // Step 2: deterministic storage path.
        let step = Instant::now();
        let storage_path = storage::resolve_path(
            config.base_dir(),
            &config.test_name,
            name,
            installation_id,
            &address,
            config.env,
            Some(resolved_version),
        )
        .map_err(|source| WorkerInitError::Storage {
            worker: label.clone(),
            source,
        })?;
        let storage_elapsed = step.elapsed();

        // Step 3: build the client, wrapped for fault injection.
        let step = Instant::now();
        let inner = builder
            .build(
                Arc::new(signer),
                storage_key,
                ClientOptions {
                    env: config.env,
                    storage_path: storage_path.clone(),
                },
            )
            .await
            .map_err(|source| WorkerInitError::ClientBuild {
                worker: label.clone(),
                source,
            })?;
        let injector = Arc::new(FaultInjector::new());
        let client: Arc<dyn MeshClient> =
            Arc::new(FaultedClient::new(inner, Arc::clone(&injector)));
        let build_elapsed = step.elapsed();

        // Step 4: start the background stream consumer.
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let step = Instant::now();
        let stream_task = match config.stream_mode {
            StreamMode::Messages => {
                let stream =
                    client
                        .stream_all_messages()
                        .await
                        .map_err(|source| WorkerInitError::StreamStart {
                            worker: label.clone(),
                            source,
                        })?;
                Some(tokio::spawn(consume_stream(
                    stream,
                    events.clone(),
                    label.clone(),
                )))
            }
            StreamMode::Disabled => None,
        };
        let stream_elapsed = step.elapsed();

        // Step 5: initial conversation sync.
        let step = Instant::now();
        if let Err(source) = client.sync_conversations().await {
            if let Some(task) = stream_task {
                task.abort();
            }
            return Err(WorkerInitError::Sync {
                worker: label,
                source,
            });
        }
        let sync_elapsed = step.elapsed();

        let init_timings = InitTimings {
            signer: signer_elapsed,
            storage_path: storage_elapsed,
            client_build: build_elapsed,
            stream_start: stream_elapsed,
            sync: sync_elapsed,
            total: overall.elapsed(),
        };
        debug!(
            worker = %label,
            signer_ms = init_timings.signer.as_millis() as u64,
            storage_ms = init_timings.storage_path.as_millis() as u64,
            build_ms = init_timings.client_build.as_millis() as u64,
            stream_ms = init_timings.stream_start.as_millis() as u64,
            sync_ms = init_timings.sync.as_millis() as u64,
            "initialization step timings"
        );
        info!(
            worker = %label,
            version = resolved_version.tag(),
            address = %address,
            path = %storage_path.display(),
            total_ms = init_timings.total.as_millis() as u64,
            "worker initialized"
        );

        let inbox_id = client.inbox_id();
        Ok(Self {
            name: name.to_owned(),
            installation_id: installation_id.to_owned(),
            version: resolved_version,
            identity,
            address,
            inbox_id,
            storage_path,
            client,
            injector,
            events,
            stream_task: Mutex::new(stream_task),
            terminated: AtomicBool::new(false),
            init_timings,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn installation_id(&self) -> &str {
        &self.installation_id
    }

    /// `name-installation` label used in logs and error attribution.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}-{}", self.name, self.installation_id)
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn identity(&self) -> &Arc<WorkerIdentity> {
        &self.identity
    }

    pub fn address(&self) -> &AccountAddress {
        &self.address
    }

    pub fn inbox_id(&self) -> &InboxId {
        &self.inbox_id
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    /// Handle to the fault-wrapped protocol client.
    #[must_use]
    pub fn client(&self) -> Arc<dyn MeshClient> {
        Arc::clone(&self.client)
    }

    pub fn init_timings(&self) -> InitTimings {
        self.init_timings
    }

    /// False once the worker has been terminated.
    pub fn is_ready(&self) -> bool {
        !self.terminated.load(Ordering::SeqCst)
    }

    /// Swap the network fault profile on this worker's transport.
    /// Takes effect for all subsequent operations; in-flight ones
    /// complete under the profile they started with.
    pub fn apply_network_profile(&self, profile: NetworkProfile) {
        self.injector.set_profile(profile);
    }

    /// Currently active network fault profile.
    #[must_use]
    pub fn network_profile(&self) -> NetworkProfile {
        self.injector.profile()
    }

    /// Subscribe to this worker's stream events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    /// Conversation handle through this worker's client.
    pub async fn conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Arc<dyn MeshConversation>, ClientError> {
        self.client.conversation(id).await
    }

    /// Collect up to `expected` streamed messages for a conversation.
    ///
    /// The subscription and the timeout deadline are established before
    /// this function returns, so messages sent between registration and
    /// the first poll of the returned future are still observed. The
    /// future resolves with whatever arrived once the deadline passes
    /// (partial results are data, not an error); a stream fault fails
    /// the collection instead.
    pub fn collect_messages(
        &self,
        conversation_id: &ConversationId,
        content_type: ContentType,
        match_token: &str,
        expected: usize,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<DecodedMessage>, StreamFault>> + Send + 'static {
        let mut events = self.events.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        let conversation_id = conversation_id.clone();
        let match_token = match_token.to_owned();
        let worker = self.label();
        async move {
            let mut collected = Vec::with_capacity(expected);
            while collected.len() < expected {
                let event = match tokio::time::timeout_at(deadline, events.recv()).await {
                    Ok(Ok(event)) => event,
                    Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                        debug!(worker = %worker, skipped, "event channel lagged");
                        continue;
                    }
                    Ok(Err(broadcast::error::RecvError::Closed)) => break,
                    Err(_) => {
                        debug!(
                            worker = %worker,
                            collected = collected.len(),
                            expected,
                            "collection deadline reached"
                        );
                        break;
                    }
                };
                match event {
                    WorkerEvent::StreamMessage(message) => {
                        if message.conversation_id == conversation_id
                            && message.content_type == content_type
                            && message.body.contains(&match_token)
                        {
                            collected.push(message);
                        }
                    }
                    WorkerEvent::StreamError { detail } => {
                        return Err(StreamFault { worker, detail });
                    }
                }
            }
            Ok(collected)
        }
    }

    /// Stop the background stream consumer and mark the worker done.
    /// Idempotent; the consumer is fully stopped before this returns.
    pub async fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            debug!(worker = %self.label(), "already terminated");
            return;
        }
        let task = self.stream_task.lock().take();
        if let Some(task) = task {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(worker = %self.label(), error = %e, "stream consumer ended abnormally");
                }
            }
        }
        info!(worker = %self.label(), "worker terminated");
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("installation_id", &self.installation_id)
            .field("version", &self.version)
            .field("address", &self.address)
            .field("storage_path", &self.storage_path)
            .finish_non_exhaustive()
    }
}

/// Forward stream items as events until the stream ends.
async fn consume_stream(
    mut stream: MessageStream,
    events: broadcast::Sender<WorkerEvent>,
    worker: String,
) {
    loop {
        match stream.next().await {
            Some(Ok(message)) => {
                // No receivers subscribed yet is normal.
                let _ = events.send(WorkerEvent::StreamMessage(message));
            }
            Some(Err(e)) => {
                warn!(worker = %worker, error = %e, "stream fault");
                let _ = events.send(WorkerEvent::StreamError {
                    detail: e.to_string(),
                });
            }
            None => {
                debug!(worker = %worker, "message stream closed");
                let _ = events.send(WorkerEvent::StreamError {
                    detail: "stream closed".to_owned(),
                });
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityProvisioner;
    use mesh_client::LocalMeshNetwork;
    use tempfile::TempDir;

    struct Fixture {
        config: HarnessConfig,
        registry: ClientRegistry,
        network: Arc<LocalMeshNetwork>,
        provisioner: IdentityProvisioner,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = HarnessConfig::new("worker-tests").with_base_dir(dir.path());
        let network = Arc::new(LocalMeshNetwork::new());
        let registry = network.registry();
        let provisioner = IdentityProvisioner::open(&config).unwrap();
        Fixture {
            config,
            registry,
            network,
            provisioner,
            _dir: dir,
        }
    }

    async fn spawn_worker(fixture: &Fixture, name: &str) -> Worker {
        let identity = fixture.provisioner.ensure_identity(name).await.unwrap();
        Worker::initialize(&fixture.config, &fixture.registry, identity, name, "a", None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn initialize_produces_ready_worker_with_timings() {
        let fixture = fixture();
        let worker = spawn_worker(&fixture, "henry").await;

        assert!(worker.is_ready());
        assert_eq!(worker.label(), "henry-a");
        assert_eq!(worker.version(), ProtocolVersion::V2);
        assert!(worker.storage_path().parent().unwrap().is_dir());
        let timings = worker.init_timings();
        assert!(timings.total >= timings.sync);
        assert_eq!(fixture.network.registered_inboxes(), 1);
    }

    #[tokio::test]
    async fn streamed_messages_reach_collectors_in_order() {
        let fixture = fixture();
        let sender = spawn_worker(&fixture, "bob").await;
        let receiver = spawn_worker(&fixture, "alice").await;

        let convo = sender.client().new_dm(receiver.inbox_id()).await.unwrap();
        let collect = receiver.collect_messages(
            &convo.id(),
            ContentType::Text,
            "tok",
            2,
            Duration::from_secs(2),
        );
        convo.send("gm-1-tok").await.unwrap();
        convo.send("gm-2-tok").await.unwrap();

        let collected = collect.await.unwrap();
        let bodies: Vec<_> = collected.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, ["gm-1-tok", "gm-2-tok"]);
    }

    #[tokio::test]
    async fn collection_registered_before_send_misses_nothing() {
        let fixture = fixture();
        let sender = spawn_worker(&fixture, "bob").await;
        let receiver = spawn_worker(&fixture, "alice").await;

        let convo = sender.client().new_dm(receiver.inbox_id()).await.unwrap();
        // The send happens before the collection future is first polled.
        let collect = receiver.collect_messages(
            &convo.id(),
            ContentType::Text,
            "early",
            1,
            Duration::from_secs(2),
        );
        convo.send("gm-1-early").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let collected = collect.await.unwrap();
        assert_eq!(collected.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn collection_times_out_with_partial_results() {
        let fixture = fixture();
        let sender = spawn_worker(&fixture, "bob").await;
        let receiver = spawn_worker(&fixture, "alice").await;

        let convo = sender.client().new_dm(receiver.inbox_id()).await.unwrap();
        let collect = receiver.collect_messages(
            &convo.id(),
            ContentType::Text,
            "tok",
            3,
            Duration::from_millis(100),
        );
        convo.send("gm-1-tok").await.unwrap();

        let collected = collect.await.unwrap();
        assert_eq!(collected.len(), 1);
    }

    #[tokio::test]
    async fn zero_expected_resolves_immediately() {
        let fixture = fixture();
        let sender = spawn_worker(&fixture, "bob").await;
        let receiver = spawn_worker(&fixture, "alice").await;

        let convo = sender.client().new_dm(receiver.inbox_id()).await.unwrap();
        let collected = receiver
            .collect_messages(
                &convo.id(),
                ContentType::Text,
                "tok",
                0,
                Duration::from_secs(30),
            )
            .await
            .unwrap();
        assert!(collected.is_empty());
    }

    #[tokio::test]
    async fn unrelated_traffic_is_filtered_out() {
        let fixture = fixture();
        let sender = spawn_worker(&fixture, "bob").await;
        let receiver = spawn_worker(&fixture, "alice").await;

        let watched = sender.client().new_dm(receiver.inbox_id()).await.unwrap();
        let other = sender
            .client()
            .new_group(&[receiver.inbox_id().clone()])
            .await
            .unwrap();

        let collect = receiver.collect_messages(
            &watched.id(),
            ContentType::Text,
            "tok",
            1,
            Duration::from_millis(300),
        );
        other.send("gm-1-tok").await.unwrap();
        watched.send("gm-1-tok").await.unwrap();

        let collected = collect.await.unwrap();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].conversation_id, watched.id());
    }

    #[tokio::test]
    async fn stream_error_event_fails_collection() {
        let fixture = fixture();
        let worker = spawn_worker(&fixture, "bob").await;

        let collect = worker.collect_messages(
            &ConversationId::generate(),
            ContentType::Text,
            "tok",
            1,
            Duration::from_secs(5),
        );
        worker
            .events
            .send(WorkerEvent::StreamError {
                detail: "simulated fault".to_owned(),
            })
            .unwrap();

        let err = collect.await.unwrap_err();
        assert_eq!(err.worker, "bob-a");
        assert!(err.detail.contains("simulated fault"));
    }

    #[tokio::test]
    async fn unknown_version_fails_with_attribution() {
        let fixture = fixture();
        let identity = fixture.provisioner.ensure_identity("bob").await.unwrap();
        let err = Worker::initialize(
            &fixture.config,
            &fixture.registry,
            identity,
            "bob",
            "a",
            Some(ProtocolVersion(9)),
        )
        .await
        .unwrap_err();
        match err {
            WorkerInitError::UnsupportedVersion { worker, version } => {
                assert_eq!(worker, "bob-a");
                assert_eq!(version, 9);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn terminate_is_idempotent_and_stops_the_consumer() {
        let fixture = fixture();
        let worker = spawn_worker(&fixture, "bob").await;
        assert!(worker.stream_task.lock().is_some());

        worker.terminate().await;
        assert!(!worker.is_ready());
        assert!(worker.stream_task.lock().is_none());
        worker.terminate().await;
        assert!(!worker.is_ready());
    }

    #[tokio::test]
    async fn disabled_stream_mode_runs_no_consumer() {
        let dir = TempDir::new().unwrap();
        let config = HarnessConfig::new("worker-tests")
            .with_base_dir(dir.path())
            .with_stream_mode(StreamMode::Disabled);
        let network = Arc::new(LocalMeshNetwork::new());
        let registry = network.registry();
        let provisioner = IdentityProvisioner::open(&config).unwrap();
        let identity = provisioner.ensure_identity("bob").await.unwrap();

        let worker = Worker::initialize(&config, &registry, identity, "bob", "a", None)
            .await
            .unwrap();
        assert!(worker.stream_task.lock().is_none());
        assert!(worker.is_ready());
    }
}
