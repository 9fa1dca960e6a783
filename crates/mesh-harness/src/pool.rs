//! Worker pool: batch creation, indexing and teardown.
//!
//! The pool owns every worker it creates, keyed by
//! `(base name, installation id)`. Batch creation is atomic: members are
//! provisioned in parallel, and if any member fails the ones that
//! succeeded are terminated again before the error is returned, so the
//! pool never ends up holding half a batch. Count-based requests draw
//! names from a fixed pool, which keeps runs reproducible: asking for
//! three workers always yields the same three names.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use mesh_client::{ClientRegistry, NetworkProfile, ProtocolVersion};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::HarnessConfig;
use crate::error::PoolError;
use crate::identity::IdentityProvisioner;
use crate::worker::Worker;

/// Installation id assumed when a descriptor does not name one.
pub const DEFAULT_INSTALLATION_ID: &str = "a";

/// Fixed name pool backing count-based worker requests.
pub const WORKER_NAME_POOL: &[&str] = &[
    "bob", "alice", "fabri", "elon", "joe", "charlie", "dave", "rosalie", "eve", "frank", "grace",
    "henry", "ivy", "jack", "karen", "larry", "mary", "nancy", "oscar", "paul", "quinn", "rachel",
    "steve", "tom", "ursula", "victor", "wendy", "xavier", "yolanda", "zack", "adam", "bella",
    "carl", "diana", "eric", "fiona", "george", "hannah", "ian", "julia", "keith", "lisa", "mike",
    "nina", "oliver", "penny", "quentin", "rosa", "sam", "tina", "uma", "vince", "walt", "xena",
    "yara", "zara", "guada",
];

type WorkerKey = (String, String);

/// Identifies one worker to create: name, installation, pinned version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerDescriptor {
    pub name: String,
    pub installation_id: String,
    pub version: Option<ProtocolVersion>,
}

impl WorkerDescriptor {
    /// Descriptor for the default installation on the latest version.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().to_lowercase(),
            installation_id: DEFAULT_INSTALLATION_ID.to_owned(),
            version: None,
        }
    }

    #[must_use]
    pub fn with_installation(mut self, installation_id: impl Into<String>) -> Self {
        self.installation_id = installation_id.into().to_lowercase();
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: ProtocolVersion) -> Self {
        self.version = Some(version);
        self
    }

    fn key(&self) -> WorkerKey {
        (self.name.clone(), self.installation_id.clone())
    }

    fn label(&self) -> String {
        format!("{}-{}", self.name, self.installation_id)
    }
}

/// Parses `name`, `name-installation` or `name-installation-version`.
impl FromStr for WorkerDescriptor {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('-');
        let name = match parts.next() {
            Some(name) if !name.is_empty() => name,
            _ => return Err(PoolError::InvalidDescriptor(s.to_owned())),
        };
        let mut descriptor = WorkerDescriptor::new(name);
        if let Some(installation) = parts.next() {
            if installation.is_empty() {
                return Err(PoolError::InvalidDescriptor(s.to_owned()));
            }
            descriptor = descriptor.with_installation(installation);
        }
        if let Some(version) = parts.next() {
            let tag: u16 = version
                .parse()
                .map_err(|_| PoolError::InvalidDescriptor(s.to_owned()))?;
            descriptor = descriptor.with_version(ProtocolVersion(tag));
        }
        if parts.next().is_some() {
            return Err(PoolError::InvalidDescriptor(s.to_owned()));
        }
        Ok(descriptor)
    }
}

/// What a batch creation call asks for.
#[derive(Clone, Debug)]
pub enum WorkerRequest {
    /// The first N names from [`WORKER_NAME_POOL`], default installation.
    Count(usize),
    /// Explicit descriptors.
    Descriptors(Vec<WorkerDescriptor>),
}

impl From<usize> for WorkerRequest {
    fn from(count: usize) -> Self {
        WorkerRequest::Count(count)
    }
}

impl From<Vec<WorkerDescriptor>> for WorkerRequest {
    fn from(descriptors: Vec<WorkerDescriptor>) -> Self {
        WorkerRequest::Descriptors(descriptors)
    }
}

impl From<WorkerDescriptor> for WorkerRequest {
    fn from(descriptor: WorkerDescriptor) -> Self {
        WorkerRequest::Descriptors(vec![descriptor])
    }
}

/// Owns and indexes every active worker of a run.
pub struct WorkerPool {
    config: Arc<HarnessConfig>,
    registry: Arc<ClientRegistry>,
    provisioner: Arc<IdentityProvisioner>,
    workers: RwLock<HashMap<WorkerKey, Arc<Worker>>>,
    provisioning: Mutex<HashSet<WorkerKey>>,
}

impl WorkerPool {
    /// Pool with its own provisioner over the config's key store.
    pub fn new(config: HarnessConfig, registry: ClientRegistry) -> Result<Self, PoolError> {
        let provisioner = Arc::new(IdentityProvisioner::open(&config)?);
        Ok(Self::with_provisioner(config, registry, provisioner))
    }

    /// Pool sharing an externally owned provisioner.
    pub fn with_provisioner(
        config: HarnessConfig,
        registry: ClientRegistry,
        provisioner: Arc<IdentityProvisioner>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            provisioner,
            workers: RwLock::new(HashMap::new()),
            provisioning: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Create (or reuse) the requested workers, all or nothing.
    ///
    /// Already-ready workers are reused as-is. New workers are
    /// provisioned in parallel; if any member fails, the members that
    /// did come up are terminated and nothing is added to the index.
    /// The returned handles follow the request order.
    pub async fn create_workers(
        &self,
        request: impl Into<WorkerRequest>,
    ) -> Result<Vec<Arc<Worker>>, PoolError> {
        let descriptors = self.expand_request(request.into())?;

        // Partition into reusable and to-create under one reservation
        // lock so two overlapping batches cannot both build the same
        // worker.
        let mut plan: Vec<WorkerKey> = Vec::with_capacity(descriptors.len());
        let mut reused: HashMap<WorkerKey, Arc<Worker>> = HashMap::new();
        let mut to_create: Vec<WorkerDescriptor> = Vec::new();
        {
            let workers = self.workers.read();
            let mut provisioning = self.provisioning.lock();
            let mut planned: HashSet<WorkerKey> = HashSet::new();
            for descriptor in &descriptors {
                let key = descriptor.key();
                plan.push(key.clone());
                if !planned.insert(key.clone()) {
                    continue;
                }
                match workers.get(&key) {
                    Some(worker) if worker.is_ready() => {
                        debug!(worker = %descriptor.label(), "reusing ready worker");
                        reused.insert(key, Arc::clone(worker));
                    }
                    _ => {
                        if provisioning.contains(&key) {
                            // Nothing reserved yet for this batch, so
                            // bailing here leaves no stale reservations.
                            return Err(PoolError::ProvisioningInProgress {
                                name: key.0,
                                installation: key.1,
                            });
                        }
                        to_create.push(descriptor.clone());
                    }
                }
            }
            for descriptor in &to_create {
                provisioning.insert(descriptor.key());
            }
        }

        let reserved: Vec<WorkerKey> = to_create.iter().map(WorkerDescriptor::key).collect();
        let outcome = self.provision_batch(to_create).await;
        {
            let mut provisioning = self.provisioning.lock();
            for key in &reserved {
                provisioning.remove(key);
            }
        }
        let created = outcome?;

        // Commit, then assemble in request order.
        {
            let mut workers = self.workers.write();
            for (key, worker) in &created {
                workers.insert(key.clone(), Arc::clone(worker));
            }
        }
        let mut result = Vec::with_capacity(plan.len());
        for key in plan {
            let worker = reused.get(&key).or_else(|| created.get(&key));
            match worker {
                Some(worker) => result.push(Arc::clone(worker)),
                // Every planned key is either reused or created; a miss
                // would be a bookkeeping bug, not a runtime condition.
                None => {
                    return Err(PoolError::NotReady {
                        name: key.0,
                        installation: key.1,
                    })
                }
            }
        }
        info!(
            requested = result.len(),
            created = created.len(),
            reused = reused.len(),
            "worker batch ready"
        );
        Ok(result)
    }

    /// Parse-and-create convenience over string descriptors.
    pub async fn create_workers_named(
        &self,
        names: &[&str],
    ) -> Result<Vec<Arc<Worker>>, PoolError> {
        let descriptors = names
            .iter()
            .map(|name| WorkerDescriptor::from_str(name))
            .collect::<Result<Vec<_>, _>>()?;
        self.create_workers(descriptors).await
    }

    fn expand_request(&self, request: WorkerRequest) -> Result<Vec<WorkerDescriptor>, PoolError> {
        match request {
            WorkerRequest::Count(count) => {
                if count > WORKER_NAME_POOL.len() {
                    return Err(PoolError::NamePoolExhausted {
                        requested: count,
                        available: WORKER_NAME_POOL.len(),
                    });
                }
                Ok(WORKER_NAME_POOL[..count]
                    .iter()
                    .copied()
                    .map(WorkerDescriptor::new)
                    .collect())
            }
            WorkerRequest::Descriptors(descriptors) => {
                for descriptor in &descriptors {
                    if descriptor.name.is_empty() || descriptor.installation_id.is_empty() {
                        return Err(PoolError::InvalidDescriptor(descriptor.label()));
                    }
                }
                Ok(descriptors)
            }
        }
    }

    /// Run the per-member provisioning tasks and collect the outcome.
    /// All members run to completion; on any failure the successful
    /// ones are terminated again and the first error is returned.
    async fn provision_batch(
        &self,
        to_create: Vec<WorkerDescriptor>,
    ) -> Result<HashMap<WorkerKey, Arc<Worker>>, PoolError> {
        let mut handles: Vec<(WorkerKey, JoinHandle<Result<Arc<Worker>, PoolError>>)> =
            Vec::with_capacity(to_create.len());
        for descriptor in to_create {
            let config = Arc::clone(&self.config);
            let registry = Arc::clone(&self.registry);
            let provisioner = Arc::clone(&self.provisioner);
            let key = descriptor.key();
            handles.push((
                key,
                tokio::spawn(async move {
                    let identity = provisioner.ensure_identity(&descriptor.name).await?;
                    let worker = Worker::initialize(
                        &config,
                        &registry,
                        identity,
                        &descriptor.name,
                        &descriptor.installation_id,
                        descriptor.version,
                    )
                    .await?;
                    Ok(Arc::new(worker))
                }),
            ));
        }

        let mut created: HashMap<WorkerKey, Arc<Worker>> = HashMap::new();
        let mut failure: Option<PoolError> = None;
        for (key, handle) in handles {
            match handle.await {
                Ok(Ok(worker)) => {
                    created.insert(key, worker);
                }
                Ok(Err(e)) => {
                    warn!(worker = %format!("{}-{}", key.0, key.1), error = %e, "worker provisioning failed");
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
                Err(join_err) => {
                    let label = format!("{}-{}", key.0, key.1);
                    warn!(worker = %label, error = %join_err, "provisioning task panicked");
                    if failure.is_none() {
                        failure = Some(PoolError::ProvisioningPanic(label));
                    }
                }
            }
        }

        if let Some(error) = failure {
            if !created.is_empty() {
                warn!(
                    rolled_back = created.len(),
                    "rolling back partially created batch"
                );
                futures::future::join_all(created.values().map(|worker| worker.terminate()))
                    .await;
            }
            return Err(error);
        }
        Ok(created)
    }

    /// Look up a ready worker by `name` or `name-installation`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Worker>> {
        let (name, installation) = split_lookup(name);
        self.get_installation(&name, &installation)
    }

    /// Look up a ready worker by explicit name and installation.
    #[must_use]
    pub fn get_installation(&self, name: &str, installation: &str) -> Option<Arc<Worker>> {
        let key = (name.to_lowercase(), installation.to_lowercase());
        self.workers
            .read()
            .get(&key)
            .filter(|worker| worker.is_ready())
            .cloned()
    }

    /// Apply a network fault profile to one ready worker.
    pub fn set_worker_network_conditions(
        &self,
        name: &str,
        profile: NetworkProfile,
    ) -> Result<(), PoolError> {
        profile.validate()?;
        let (base, installation) = split_lookup(name);
        let worker = self
            .get_installation(&base, &installation)
            .ok_or(PoolError::NotReady {
                name: base,
                installation,
            })?;
        info!(worker = %worker.label(), ?profile, "applying network conditions");
        worker.apply_network_profile(profile);
        Ok(())
    }

    /// Terminate one worker and drop it from the index.
    pub async fn terminate_worker(&self, name: &str) -> Result<(), PoolError> {
        let (base, installation) = split_lookup(name);
        let key = (base.clone(), installation.clone());
        let worker = self.workers.write().remove(&key);
        match worker {
            Some(worker) => {
                worker.terminate().await;
                Ok(())
            }
            None => Err(PoolError::NotReady {
                name: base,
                installation,
            }),
        }
    }

    /// Terminate every worker. Idempotent; safe to call on an empty pool.
    pub async fn terminate_all(&self) {
        let drained: Vec<Arc<Worker>> = {
            let mut workers = self.workers.write();
            workers.drain().map(|(_, worker)| worker).collect()
        };
        if drained.is_empty() {
            debug!("terminate_all on empty pool");
            return;
        }
        let count = drained.len();
        futures::future::join_all(drained.iter().map(|worker| worker.terminate())).await;
        info!(count, "all workers terminated");
    }

    /// Uniformly sampled ready workers, at most `count`.
    #[must_use]
    pub fn random_workers(&self, count: usize) -> Vec<Arc<Worker>> {
        let snapshot: Vec<Arc<Worker>> = self.workers.read().values().cloned().collect();
        let mut rng = rand::thread_rng();
        snapshot
            .choose_multiple(&mut rng, count.min(snapshot.len()))
            .cloned()
            .collect()
    }

    /// Snapshot of all active workers, unordered.
    #[must_use]
    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.workers.read().values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.read().is_empty()
    }
}

pub(crate) fn split_lookup(name: &str) -> (String, String) {
    match name.split_once('-') {
        Some((base, installation)) => (base.to_lowercase(), installation.to_lowercase()),
        None => (name.to_lowercase(), DEFAULT_INSTALLATION_ID.to_owned()),
    }
}
