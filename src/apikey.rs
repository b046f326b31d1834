use crate::errors::ProxyError;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

pub const KEY_PREFIX: &str = "mcp_";

/// Stored credential. The plaintext key is never stored; only its SHA-256.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyRecord {
	pub key_id: String,
	#[serde(skip_serializing)]
	pub key_hash: String,
	pub name: String,
	pub owner: String,
	pub permissions: Vec<String>,
	pub created_at: DateTime<Utc>,
	pub expires_at: Option<DateTime<Utc>>,
	pub last_used_at: Option<DateTime<Utc>>,
	pub active: bool,
}

/// Abstract credential storage so in-memory, relational and KV backings are
/// interchangeable. Every lookup is indexed by key hash.
#[async_trait::async_trait]
pub trait KeyRepository: Send + Sync {
	async fn insert(&self, record: ApiKeyRecord) -> Result<(), ProxyError>;
	async fn find_by_hash(&self, key_hash: &str) -> Option<ApiKeyRecord>;
	async fn touch(&self, key_hash: &str, when: DateTime<Utc>) -> bool;
	async fn set_active(&self, key_id: &str, active: bool) -> bool;
	async fn list(&self, owner: Option<&str>) -> Vec<ApiKeyRecord>;
}

#[derive(Default)]
pub struct MemoryKeyRepository {
	// Primary index is the key hash; ids map to hashes for revocation.
	by_hash: RwLock<HashMap<String, ApiKeyRecord>>,
	id_index: RwLock<HashMap<String, String>>,
}

#[async_trait::async_trait]
impl KeyRepository for MemoryKeyRepository {
	async fn insert(&self, record: ApiKeyRecord) -> Result<(), ProxyError> {
		let mut by_hash = self.by_hash.write().await;
		let mut ids = self.id_index.write().await;
		ids.insert(record.key_id.clone(), record.key_hash.clone());
		by_hash.insert(record.key_hash.clone(), record);
		Ok(())
	}

	async fn find_by_hash(&self, key_hash: &str) -> Option<ApiKeyRecord> {
		self.by_hash.read().await.get(key_hash).cloned()
	}

	async fn touch(&self, key_hash: &str, when: DateTime<Utc>) -> bool {
		match self.by_hash.write().await.get_mut(key_hash) {
			Some(record) => {
				record.last_used_at = Some(when);
				true
			},
			None => false,
		}
	}

	async fn set_active(&self, key_id: &str, active: bool) -> bool {
		let ids = self.id_index.read().await;
		let Some(hash) = ids.get(key_id) else {
			return false;
		};
		match self.by_hash.write().await.get_mut(hash) {
			Some(record) => {
				record.active = active;
				true
			},
			None => false,
		}
	}

	async fn list(&self, owner: Option<&str>) -> Vec<ApiKeyRecord> {
		let mut records: Vec<ApiKeyRecord> = self
			.by_hash
			.read()
			.await
			.values()
			.filter(|r| owner.is_none_or(|o| r.owner == o))
			.cloned()
			.collect();
		records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
		records
	}
}

/// Hash-indexed credentials with permissions, expiry and revocation.
pub struct ApiKeyStore {
	repository: Arc<dyn KeyRepository>,
}

impl ApiKeyStore {
	pub fn new(repository: Arc<dyn KeyRepository>) -> Self {
		Self { repository }
	}

	pub fn in_memory() -> Self {
		Self::new(Arc::new(MemoryKeyRepository::default()))
	}

	/// Generate a new key. The plaintext is returned exactly once and never
	/// stored.
	pub async fn generate(
		&self,
		name: &str,
		owner: &str,
		permissions: Vec<String>,
		expires_in_days: Option<i64>,
	) -> Result<(String, ApiKeyRecord), ProxyError> {
		let key_id = format!("key_{}", random_token(16));
		let api_key = format!("{}{}", KEY_PREFIX, random_token(32));
		let record = ApiKeyRecord {
			key_id,
			key_hash: hash_key(&api_key),
			name: name.to_string(),
			owner: owner.to_string(),
			permissions,
			created_at: Utc::now(),
			expires_at: expires_in_days.map(|days| Utc::now() + Duration::days(days)),
			last_used_at: None,
			active: true,
		};
		self.repository.insert(record.clone()).await?;
		info!(name = %record.name, owner = %record.owner, "generated api key");
		Ok((api_key, record))
	}

	/// Validate a candidate key: prefix check, hash lookup, active and expiry
	/// checks, then a last-used update.
	pub async fn validate(&self, api_key: &str) -> Option<ApiKeyRecord> {
		if !api_key.starts_with(KEY_PREFIX) {
			return None;
		}
		let key_hash = hash_key(api_key);
		let record = self.repository.find_by_hash(&key_hash).await?;
		if !record.active {
			return None;
		}
		if let Some(expires_at) = record.expires_at {
			if expires_at <= Utc::now() {
				return None;
			}
		}
		let now = Utc::now();
		self.repository.touch(&key_hash, now).await;
		Some(ApiKeyRecord {
			last_used_at: Some(now),
			..record
		})
	}

	pub async fn check_permission(&self, api_key: &str, permission: &str) -> bool {
		match self.validate(api_key).await {
			Some(record) => record.permissions.iter().any(|p| p == permission),
			None => false,
		}
	}

	pub async fn revoke(&self, key_id: &str) -> bool {
		let revoked = self.repository.set_active(key_id, false).await;
		if revoked {
			info!(%key_id, "revoked api key");
		}
		revoked
	}

	pub async fn list(&self, owner: Option<&str>) -> Vec<ApiKeyRecord> {
		self.repository.list(owner).await
	}
}

fn random_token(bytes: usize) -> String {
	let mut buf = vec![0u8; bytes];
	rand::rng().fill_bytes(&mut buf);
	URL_SAFE_NO_PAD.encode(&buf)
}

fn hash_key(api_key: &str) -> String {
	let mut hasher = Sha256::new();
	hasher.update(api_key.as_bytes());
	hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
	bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
