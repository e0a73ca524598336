//! Provider records: which peers announced they can supply which keys.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::common::{Id, Node};
use crate::rpc::reprovider::should_reprovide;

/// Maximum remote provider records across all keys.
const MAX_PROVIDER_RECORDS: usize = 10_000;
/// Maximum remote provider records per key.
const MAX_PROVIDERS_PER_KEY: usize = 100;

#[derive(Debug, Clone)]
pub struct ProviderRecord {
    pub node: Node,
    /// This node's own announcement; exempt from expiry purging and
    /// capacity eviction, and the only kind that gets reprovided.
    pub is_self: bool,
    pub expires_at: Instant,
}

/// Provider records per key, with asymmetric expiry: records learned from
/// other peers are purged lazily once expired, while this node's own
/// records are kept past expiry so they can still be re-announced.
#[derive(Debug)]
pub struct ProviderStore {
    local_id: Id,
    validity: Duration,
    providers: HashMap<Id, Vec<ProviderRecord>>,
    /// Original key bytes of the keys this node provides, needed to
    /// re-announce them.
    self_keys: HashMap<Id, Box<[u8]>>,
    /// `(key, provider)` in insertion order, for capacity eviction.
    /// Never contains self records.
    insertion_order: Vec<(Id, Id)>,
}

impl ProviderStore {
    pub fn new(local_id: Id, validity: Duration) -> ProviderStore {
        ProviderStore {
            local_id,
            validity,
            providers: HashMap::new(),
            self_keys: HashMap::new(),
            insertion_order: Vec::new(),
        }
    }

    // === Getters ===

    pub fn validity(&self) -> Duration {
        self.validity
    }

    /// Number of keys with at least one provider record.
    pub fn keys_count(&self) -> usize {
        self.providers.len()
    }

    // === Public Methods ===

    /// Insert or refresh a provider record for `key`.
    ///
    /// An existing `(key, provider)` pair is updated in place with a fresh
    /// expiry rather than duplicated.
    pub fn add_provider(&mut self, key: Id, node: Node) {
        let is_self = node.id() == &self.local_id;
        let provider_id = *node.id();
        let expires_at = Instant::now() + self.validity;

        let records = self.providers.entry(key).or_insert_with(Vec::new);

        if let Some(record) = records
            .iter_mut()
            .find(|record| record.node.id() == &provider_id)
        {
            record.node = node;
            record.expires_at = expires_at;
            return;
        }

        if !is_self {
            if records.iter().filter(|record| !record.is_self).count() >= MAX_PROVIDERS_PER_KEY {
                Self::evict_oldest_in_key(records, &mut self.insertion_order, &key);
            }

            if self.insertion_order.len() >= MAX_PROVIDER_RECORDS {
                let (old_key, old_provider) = self.insertion_order.remove(0);
                if let Some(old_records) = self.providers.get_mut(&old_key) {
                    old_records.retain(|record| record.node.id() != &old_provider);
                    if old_records.is_empty() {
                        self.providers.remove(&old_key);
                    }
                }
            }

            self.insertion_order.push((key, provider_id));
        }

        self.providers
            .entry(key)
            .or_insert_with(Vec::new)
            .push(ProviderRecord {
                node,
                is_self,
                expires_at,
            });
    }

    /// Record that this node itself provides `key_bytes`, remembering the
    /// original key so it can be re-announced later.
    /// Returns the key's keyspace id.
    pub fn provide_local(&mut self, key_bytes: &[u8], node: Node) -> Id {
        let key = Id::hash(key_bytes);

        self.self_keys.insert(key, key_bytes.into());
        self.add_provider(key, node);

        key
    }

    /// Current providers of `key`, purging expired remote records on the way.
    pub fn get_providers(&mut self, key: &Id) -> Vec<Node> {
        let now = Instant::now();

        let records = match self.providers.get_mut(key) {
            Some(records) => records,
            None => return Vec::new(),
        };

        let mut purged = Vec::new();
        records.retain(|record| {
            if record.is_self || record.expires_at > now {
                true
            } else {
                purged.push(*record.node.id());
                false
            }
        });

        let providers = records.iter().map(|record| record.node.clone()).collect();

        if records.is_empty() {
            self.providers.remove(key);
        }
        if !purged.is_empty() {
            self.insertion_order
                .retain(|(k, provider)| k != key || !purged.contains(provider));
        }

        providers
    }

    pub fn remove_provider(&mut self, key: &Id, provider: &Id) {
        if let Some(records) = self.providers.get_mut(key) {
            records.retain(|record| record.node.id() != provider);
            if records.is_empty() {
                self.providers.remove(key);
            }
        }

        self.insertion_order
            .retain(|(k, p)| k != key || p != provider);

        if provider == &self.local_id {
            self.self_keys.remove(key);
        }
    }

    fn evict_oldest_in_key(
        records: &mut Vec<ProviderRecord>,
        insertion_order: &mut Vec<(Id, Id)>,
        key: &Id,
    ) {
        if let Some(position) = records.iter().position(|record| !record.is_self) {
            let evicted = records.remove(position);
            insertion_order.retain(|(k, provider)| k != key || provider != evicted.node.id());
        }
    }

    /// This node's own records that are due for re-announcement, with
    /// their original key bytes.
    pub fn due_self_records(&self, threshold: Duration) -> Vec<(Id, Box<[u8]>)> {
        let now = Instant::now();

        self.self_keys
            .iter()
            .filter_map(|(key, key_bytes)| {
                let record = self
                    .providers
                    .get(key)?
                    .iter()
                    .find(|record| record.is_self)?;

                if should_reprovide(record.is_self, record.expires_at, now, threshold) {
                    Some((*key, key_bytes.clone()))
                } else {
                    None
                }
            })
            .collect()
    }
}
