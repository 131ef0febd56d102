use anyhow::{Context, Result};
use azure_core::credentials::AccessToken;
use azure_core::time::Duration;
use serde::{Deserialize, Serialize};

/// Cached tokens for one (user, tenant) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCacheEntry {
    pub user_id: String,
    pub tenant_id: String,
    pub access_token: AccessToken,
    pub refresh_token: Option<String>,
}

impl TokenCacheEntry {
    /// Tenant and user comparisons are ASCII case-insensitive: tenants are
    /// GUIDs of varying case in the wild, and AAD treats UPNs the same way.
    pub fn matches(&self, user_id: &str, tenant_id: &str) -> bool {
        self.user_id.eq_ignore_ascii_case(user_id) && self.tenant_id.eq_ignore_ascii_case(tenant_id)
    }

    /// Whether the access token is already unusable once `buffer` is taken
    /// into account. Callers should refresh rather than hand it out.
    pub fn is_expired(&self, buffer: Duration) -> bool {
        self.access_token.expires_on <= azure_core::time::OffsetDateTime::now_utc() + buffer
    }
}

impl PartialEq for TokenCacheEntry {
    fn eq(&self, other: &Self) -> bool {
        self.matches(&other.user_id, &other.tenant_id)
            && self.access_token.token.secret() == other.access_token.token.secret()
            && self.access_token.expires_on == other.access_token.expires_on
            && self.refresh_token == other.refresh_token
    }
}

impl Eq for TokenCacheEntry {}

/// In-memory token cache. At most one entry per (user, tenant); `upsert`
/// enforces that by replacing, so a refresh never leaves a stale sibling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenCache {
    entries: Vec<TokenCacheEntry>,
}

impl TokenCache {
    pub fn find(&self, user_id: &str, tenant_id: &str) -> Option<&TokenCacheEntry> {
        self.entries.iter().find(|e| e.matches(user_id, tenant_id))
    }

    pub fn upsert(&mut self, entry: TokenCacheEntry) {
        self.entries
            .retain(|e| !e.matches(&entry.user_id, &entry.tenant_id));
        self.entries.push(entry);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[TokenCacheEntry] {
        &self.entries
    }

    /// Snapshot for the on-disk store. The store treats this as an opaque
    /// blob; only this type knows it is JSON.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).context("serializing token cache")
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("parsing token cache")
    }
}
