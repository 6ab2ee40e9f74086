//! Mock ConsulClient for unit testing
//!
//! Stores services, sessions, KV pairs and Connect material in memory. Every
//! mutation bumps a global index, and blocking queries wait for the index to
//! move past the one they were given, as a real agent does.

use crate::consul_trait::ConsulClientTrait;
use crate::error::ConsulError;
use crate::models::{
    AgentService, CaRoots, KvPair, LeafCert, Node, QueryOptions, QueryResult, ServiceEntry,
    SessionRequest,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

const MOCK_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct MockState {
    services: HashMap<String, (u64, Vec<ServiceEntry>)>,
    sessions: HashMap<String, SessionRequest>,
    kv: HashMap<String, KvPair>,
    roots: (u64, CaRoots),
    leaves: HashMap<String, (u64, LeafCert)>,
    next_session: u64,
}

/// Mock ConsulClient for testing
#[derive(Debug, Clone)]
pub struct MockConsulClient {
    address: String,
    state: Arc<Mutex<MockState>>,
    index: Arc<watch::Sender<u64>>,
    health_queries: Arc<AtomicUsize>,
}

impl MockConsulClient {
    /// Create a new mock client
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            state: Arc::new(Mutex::new(MockState::default())),
            index: Arc::new(watch::Sender::new(1)),
            health_queries: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) -> u64 {
        let mut next = 0;
        self.index.send_modify(|index| {
            *index += 1;
            next = *index;
        });
        next
    }

    /// Replace the passing instances of `service`.
    pub fn set_service(&self, service: &str, instances: Vec<(&str, &str, u16)>) {
        let entries = instances
            .into_iter()
            .map(|(id, address, port)| ServiceEntry {
                node: Node {
                    node: format!("node-{id}"),
                    address: "10.0.0.1".to_string(),
                    datacenter: "dc1".to_string(),
                },
                service: AgentService {
                    id: id.to_string(),
                    service: service.to_string(),
                    address: address.to_string(),
                    port,
                    tags: None,
                },
                checks: Vec::new(),
            })
            .collect();
        self.set_service_entries(service, entries);
    }

    pub fn set_service_entries(&self, service: &str, entries: Vec<ServiceEntry>) {
        let index = self.bump();
        self.state()
            .services
            .insert(service.to_string(), (index, entries));
    }

    pub fn set_roots(&self, roots: CaRoots) {
        let index = self.bump();
        self.state().roots = (index, roots);
    }

    pub fn set_leaf(&self, service: &str, leaf: LeafCert) {
        let index = self.bump();
        self.state()
            .leaves
            .insert(service.to_string(), (index, leaf));
    }

    /// Drop a session as if its TTL had lapsed, releasing its locks.
    pub fn expire_session(&self, id: &str) {
        {
            let mut state = self.state();
            state.sessions.remove(id);
            for pair in state.kv.values_mut() {
                if pair.session.as_deref() == Some(id) {
                    pair.session = None;
                }
            }
        }
        self.bump();
    }

    pub fn session_count(&self) -> usize {
        self.state().sessions.len()
    }

    pub fn health_query_count(&self) -> usize {
        self.health_queries.load(Ordering::SeqCst)
    }

    /// Wait until the global index passes `options.index` or the wait elapses.
    async fn block(&self, options: &QueryOptions, current: impl Fn(&MockState) -> u64) {
        if options.index == 0 {
            return;
        }
        let mut changes = self.index.subscribe();
        let wait = options.wait.unwrap_or(MOCK_WAIT);
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if current(&self.state()) > options.index {
                return;
            }
            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                () = tokio::time::sleep_until(deadline) => return,
            }
        }
    }
}

#[async_trait::async_trait]
impl ConsulClientTrait for MockConsulClient {
    fn address(&self) -> &str {
        &self.address
    }

    async fn health_service(
        &self,
        service: &str,
        options: &QueryOptions,
    ) -> Result<QueryResult<Vec<ServiceEntry>>, ConsulError> {
        self.health_queries.fetch_add(1, Ordering::SeqCst);
        self.block(options, |state| {
            state.services.get(service).map_or(1, |(index, _)| *index)
        })
        .await;
        let state = self.state();
        let (index, entries) = state
            .services
            .get(service)
            .cloned()
            .unwrap_or((1, Vec::new()));
        Ok(QueryResult {
            value: entries,
            index,
        })
    }

    async fn session_create(&self, request: &SessionRequest) -> Result<String, ConsulError> {
        let mut state = self.state();
        state.next_session += 1;
        let id = format!("session-{}", state.next_session);
        state.sessions.insert(id.clone(), request.clone());
        Ok(id)
    }

    async fn session_renew(&self, id: &str) -> Result<(), ConsulError> {
        if self.state().sessions.contains_key(id) {
            Ok(())
        } else {
            Err(ConsulError::NotFound(format!("session {id}")))
        }
    }

    async fn session_destroy(&self, id: &str) -> Result<(), ConsulError> {
        self.expire_session(id);
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<KvPair>, ConsulError> {
        Ok(self.state().kv.get(key).cloned())
    }

    async fn kv_acquire(&self, key: &str, session: &str, value: &[u8]) -> Result<bool, ConsulError> {
        let acquired = {
            let mut state = self.state();
            if !state.sessions.contains_key(session) {
                return Err(ConsulError::Api {
                    status: 500,
                    body: format!("invalid session \"{session}\""),
                });
            }
            let pair = state.kv.entry(key.to_string()).or_insert_with(|| KvPair {
                key: key.to_string(),
                ..Default::default()
            });
            let held_elsewhere = pair
                .session
                .as_deref()
                .is_some_and(|holder| holder != session);
            if !held_elsewhere {
                pair.session = Some(session.to_string());
                pair.value = Some(KvPair::encode(value));
            }
            !held_elsewhere
        };
        if acquired {
            let index = self.bump();
            if let Some(pair) = self.state().kv.get_mut(key) {
                pair.modify_index = index;
            }
        }
        Ok(acquired)
    }

    async fn kv_release(&self, key: &str, session: &str) -> Result<bool, ConsulError> {
        let released = {
            let mut state = self.state();
            match state.kv.get_mut(key) {
                Some(pair) if pair.session.as_deref() == Some(session) => {
                    pair.session = None;
                    true
                }
                _ => false,
            }
        };
        if released {
            self.bump();
        }
        Ok(released)
    }

    async fn connect_ca_roots(&self, options: &QueryOptions) -> Result<QueryResult<CaRoots>, ConsulError> {
        self.block(options, |state| state.roots.0).await;
        let (index, roots) = self.state().roots.clone();
        Ok(QueryResult { value: roots, index })
    }

    async fn connect_leaf(
        &self,
        service: &str,
        options: &QueryOptions,
    ) -> Result<QueryResult<LeafCert>, ConsulError> {
        self.block(options, |state| {
            state.leaves.get(service).map_or(0, |(index, _)| *index)
        })
        .await;
        match self.state().leaves.get(service).cloned() {
            Some((index, leaf)) => Ok(QueryResult { value: leaf, index }),
            None => Err(ConsulError::NotFound(format!("leaf certificate for {service}"))),
        }
    }
}
