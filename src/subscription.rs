use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_lock::RwLock;
use serde::{Deserialize, Serialize};

use crate::client::ArmClient;

pub const SUBSCRIPTIONS_API_VERSION: &str = "2022-12-01";

/// One Azure subscription as the resource tree sees it.
///
/// Identity is the subscription id alone, ASCII case-insensitively: ARM is
/// not consistent about GUID casing across endpoints, and two records with
/// the same id are the same subscription no matter what the display fields
/// or the `selected` flag say.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionDetail {
    pub subscription_id: String,
    pub display_name: String,
    pub tenant_id: String,
    /// Whether the user wants this subscription shown in the resource tree.
    pub selected: bool,
}

impl SubscriptionDetail {
    fn key(&self) -> String {
        self.subscription_id.to_ascii_lowercase()
    }
}

impl PartialEq for SubscriptionDetail {
    fn eq(&self, other: &Self) -> bool {
        self.subscription_id
            .eq_ignore_ascii_case(&other.subscription_id)
    }
}

impl Eq for SubscriptionDetail {}

impl std::hash::Hash for SubscriptionDetail {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

/// Subscription record as ARM returns it from `GET /subscriptions`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSubscription {
    subscription_id: String,
    display_name: String,
    tenant_id: String,
}

/// The subscriptions an account can see, and which of them the user keeps
/// selected for the resource tree. Selection survives restarts through a
/// small JSON preferences file; losing that file only loses the selection.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    path: PathBuf,
    subscriptions: RwLock<Vec<SubscriptionDetail>>,
}

impl SubscriptionRegistry {
    /// Creates the registry, warm-starting from the preferences file when a
    /// readable one exists.
    pub async fn load(path: PathBuf) -> Self {
        let subscriptions = match tokio::fs::read_to_string(&path).await {
            Ok(data) => match serde_json::from_str::<Vec<SubscriptionDetail>>(&data) {
                Ok(subscriptions) => dedup(subscriptions),
                Err(err) => {
                    tracing::warn!(
                        "ignoring unreadable subscription preferences at {}: {err}",
                        path.display()
                    );
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                tracing::warn!(
                    "could not read subscription preferences at {}: {e}",
                    path.display()
                );
                Vec::new()
            }
        };
        Self {
            path,
            subscriptions: RwLock::new(subscriptions),
        }
    }

    /// Repopulates from the management plane. A previously known id keeps
    /// its `selected` choice; newly appearing subscriptions start selected.
    pub async fn refresh(&self, client: &ArmClient) -> Result<Vec<SubscriptionDetail>> {
        let fetched: Vec<WireSubscription> = client
            .get_all("/subscriptions", SUBSCRIPTIONS_API_VERSION)
            .await
            .context("listing subscriptions")?;
        tracing::debug!("management plane returned {} subscriptions", fetched.len());

        let fetched = fetched
            .into_iter()
            .map(|wire| SubscriptionDetail {
                subscription_id: wire.subscription_id,
                display_name: wire.display_name,
                tenant_id: wire.tenant_id,
                selected: true,
            })
            .collect();

        let merged;
        {
            let mut subscriptions = self.subscriptions.write().await;
            let next = merge_keeping_selection(&subscriptions, fetched);
            *subscriptions = next;
            merged = subscriptions.clone();
        }
        self.save(&merged).await;
        Ok(merged)
    }

    /// Flips the selection for one subscription. Unknown ids are reported as
    /// `false` and change nothing.
    pub async fn set_selected(&self, subscription_id: &str, selected: bool) -> bool {
        let snapshot = {
            let mut subscriptions = self.subscriptions.write().await;
            let Some(subscription) = subscriptions
                .iter_mut()
                .find(|s| s.subscription_id.eq_ignore_ascii_case(subscription_id))
            else {
                tracing::debug!(
                    "ignoring a selection change for unknown subscription {subscription_id}"
                );
                return false;
            };
            subscription.selected = selected;
            subscriptions.clone()
        };
        self.save(&snapshot).await;
        true
    }

    pub async fn all(&self) -> Vec<SubscriptionDetail> {
        self.subscriptions.read().await.clone()
    }

    pub async fn selected(&self) -> Vec<SubscriptionDetail> {
        self.subscriptions
            .read()
            .await
            .iter()
            .filter(|s| s.selected)
            .cloned()
            .collect()
    }

    /// Best effort: preferences are nice to keep, never worth failing the
    /// calling operation over.
    async fn save(&self, subscriptions: &[SubscriptionDetail]) {
        if let Err(err) = self.try_save(subscriptions).await {
            tracing::warn!(
                "could not save subscription preferences to {}: {err:#}",
                self.path.display()
            );
        }
    }

    async fn try_save(&self, subscriptions: &[SubscriptionDetail]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_string_pretty(subscriptions)?;
        tokio::fs::write(&self.path, data).await?;
        Ok(())
    }
}

/// Set-insert semantics over the id: the first record for an id wins and
/// later duplicates are dropped.
fn dedup(subscriptions: Vec<SubscriptionDetail>) -> Vec<SubscriptionDetail> {
    let mut seen = HashSet::new();
    subscriptions
        .into_iter()
        .filter(|s| seen.insert(s.key()))
        .collect()
}

/// The merge behind `refresh`: fetched records win for the display fields,
/// while ids we already knew keep their `selected` choice.
fn merge_keeping_selection(
    existing: &[SubscriptionDetail],
    fetched: Vec<SubscriptionDetail>,
) -> Vec<SubscriptionDetail> {
    let prior: HashMap<String, bool> = existing.iter().map(|s| (s.key(), s.selected)).collect();
    dedup(fetched)
        .into_iter()
        .map(|mut subscription| {
            if let Some(&selected) = prior.get(&subscription.key()) {
                subscription.selected = selected;
            }
            subscription
        })
        .collect()
}
