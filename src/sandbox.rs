//! Remote sandbox lifecycle management.
//!
//! The remote host is the source of truth for every instance; descriptors
//! kept here are a cache that is reconciled through probes rather than
//! trusted blindly.

use crate::config::SandboxConfig;
use crate::error::{SandboxError, SandboxResult};
use crate::gate::now_millis;
use crate::sandbox_client::{CreateOptions, DeleteReply, SandboxClient, StaticToken, TokenProvider};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

pub const DEFAULT_TTL_MINUTES: u32 = 1440;

/// Where an instance is in its lifecycle, as far as this server knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    Creating,
    Active,
    Refreshing,
    Deleting,
    Deleted,
    Absent,
}

impl SandboxState {
    pub fn is_gone(self) -> bool {
        matches!(self, SandboxState::Deleted | SandboxState::Absent)
    }

    /// Whether `self -> next` is an edge of the lifecycle.
    pub fn can_transition(self, next: SandboxState) -> bool {
        use SandboxState::*;
        match (self, next) {
            (Absent, Creating) | (Creating, Active) | (Creating, Absent) => true,
            (Active, Refreshing) | (Refreshing, Active) => true,
            (Active, Deleting) | (Refreshing, Deleting) => true,
            // A failed delete leaves the instance where it was.
            (Deleting, Active) => true,
            (Deleting, Deleted) | (Deleting, Absent) => true,
            (Active, Absent) | (Refreshing, Absent) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxInstance {
    pub id: String,
    pub url: String,
    pub created_at: u64,
    pub last_used_at: u64,
    pub ttl_minutes: u32,
    pub is_active: bool,
    pub state: SandboxState,
}

impl SandboxInstance {
    fn transition(&mut self, next: SandboxState) -> bool {
        if !self.state.can_transition(next) {
            warn!(instance = %self.id, from = ?self.state, to = ?next, "ignoring invalid sandbox state transition");
            return false;
        }
        self.state = next;
        self.is_active = !next.is_gone();
        true
    }
}

/// Result of a delete that did not hit a hard failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOutcome {
    pub success: bool,
    pub should_continue: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeleteOutcome {
    pub fn deleted() -> Self {
        Self {
            success: true,
            should_continue: true,
            error: None,
        }
    }

    pub fn already_gone(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            should_continue: true,
            error: Some(reason.into()),
        }
    }
}

/// Ids of recently removed instances kept so a repeated delete is answered
/// locally.
const REMOVED_HISTORY: usize = 256;

#[derive(Debug, Default)]
struct Descriptors {
    live: HashMap<String, SandboxInstance>,
    removed: VecDeque<(String, SandboxState)>,
}

impl Descriptors {
    fn removed_state(&self, id: &str) -> Option<SandboxState> {
        self.removed
            .iter()
            .find(|(removed, _)| removed == id)
            .map(|(_, state)| *state)
    }

    /// Drops the live descriptor and remembers how it ended.
    fn retire(&mut self, id: &str, last: SandboxState) {
        self.live.remove(id);
        self.removed.retain(|(removed, _)| removed != id);
        self.removed.push_back((id.to_string(), last));
        while self.removed.len() > REMOVED_HISTORY {
            self.removed.pop_front();
        }
    }
}

pub struct SandboxManager {
    client: SandboxClient,
    default_ttl_minutes: u32,
    descriptors: RwLock<Descriptors>,
}

impl SandboxManager {
    pub fn new(config: &SandboxConfig) -> SandboxResult<Self> {
        Self::with_token_provider(config, Arc::new(StaticToken(config.token.clone())))
    }

    pub fn with_token_provider(
        config: &SandboxConfig,
        tokens: Arc<dyn TokenProvider>,
    ) -> SandboxResult<Self> {
        let client = SandboxClient::new(&config.base_url, tokens)?;
        Ok(Self::with_client(client, config.default_ttl_minutes))
    }

    pub fn with_client(client: SandboxClient, default_ttl_minutes: u32) -> Self {
        Self {
            client,
            default_ttl_minutes,
            descriptors: RwLock::new(Descriptors::default()),
        }
    }

    pub fn default_ttl_minutes(&self) -> u32 {
        self.default_ttl_minutes
    }

    pub fn instance_url(&self, id: &str) -> String {
        self.client.instance_url(id)
    }

    /// Descriptor of a live instance. Removed instances are no longer
    /// tracked; see [`SandboxManager::state`].
    pub async fn instance(&self, id: &str) -> Option<SandboxInstance> {
        self.descriptors.read().await.live.get(id).cloned()
    }

    /// Last known state of `id`, including recently removed instances.
    pub async fn state(&self, id: &str) -> Option<SandboxState> {
        let descriptors = self.descriptors.read().await;
        match descriptors.live.get(id) {
            Some(instance) => Some(instance.state),
            None => descriptors.removed_state(id),
        }
    }

    /// Number of live descriptors.
    pub async fn tracked(&self) -> usize {
        self.descriptors.read().await.live.len()
    }

    pub async fn create_instance(&self, options: CreateOptions) -> SandboxResult<SandboxInstance> {
        let ttl_minutes = options.ttl_minutes.unwrap_or(self.default_ttl_minutes);
        let id = match self.client.create(ttl_minutes, &options).await {
            Ok(id) => id,
            Err(e) => {
                error!(session_id = ?options.session_id, "failed to create sandbox instance: {}", e);
                return Err(e);
            }
        };

        let now = now_millis();
        let mut instance = SandboxInstance {
            url: self.client.instance_url(&id),
            id,
            created_at: now,
            last_used_at: now,
            ttl_minutes,
            is_active: false,
            state: SandboxState::Creating,
        };
        instance.transition(SandboxState::Active);

        info!(instance = %instance.id, url = %instance.url, ttl_minutes, "created sandbox instance");
        let mut descriptors = self.descriptors.write().await;
        descriptors.removed.retain(|(removed, _)| removed != &instance.id);
        descriptors
            .live
            .insert(instance.id.clone(), instance.clone());
        Ok(instance)
    }

    /// Deletes an instance, treating an instance that is already gone as a
    /// soft failure the caller may continue past.
    pub async fn delete_instance(&self, id: &str) -> SandboxResult<DeleteOutcome> {
        let previous = {
            let mut descriptors = self.descriptors.write().await;
            if descriptors.removed_state(id).is_some() {
                return Ok(DeleteOutcome::already_gone(format!(
                    "sandbox instance {} was already removed",
                    id
                )));
            }
            descriptors.live.get_mut(id).map(|instance| {
                let previous = instance.state;
                if previous != SandboxState::Deleting {
                    instance.transition(SandboxState::Deleting);
                }
                previous
            })
        };

        match self.client.delete(id).await {
            Ok(DeleteReply::Deleted) => {
                self.retire(id, SandboxState::Deleted).await;
                info!(instance = %id, "deleted sandbox instance");
                Ok(DeleteOutcome::deleted())
            }
            Ok(DeleteReply::AlreadyGone(reason)) => {
                self.retire(id, SandboxState::Absent).await;
                warn!(instance = %id, "sandbox instance already gone: {}", reason);
                Ok(DeleteOutcome::already_gone(reason))
            }
            Err(e) if e.is_transport() => {
                warn!(instance = %id, "delete request failed, probing instance: {}", e);
                if self.client.probe_not_exist(id).await {
                    self.retire(id, SandboxState::Absent).await;
                    return Ok(DeleteOutcome::already_gone(format!(
                        "sandbox instance {} does not exist: {}",
                        id, e
                    )));
                }
                self.abandon_delete(id, previous).await;
                error!(instance = %id, "failed to delete sandbox instance: {}", e);
                Err(e)
            }
            Err(e) => {
                self.abandon_delete(id, previous).await;
                error!(instance = %id, "failed to delete sandbox instance: {}", e);
                Err(e)
            }
        }
    }

    /// Extends the lease of an instance. Instances being deleted or already
    /// removed are refused without contacting the host.
    pub async fn refresh_instance_ttl(&self, id: &str, ttl_minutes: u32) -> SandboxResult<()> {
        let previous = self.begin_refresh(id).await?;
        let result = self.client.refresh(id, ttl_minutes).await;

        if let Some(instance) = self.descriptors.write().await.live.get_mut(id) {
            if previous == Some(SandboxState::Active) && instance.state == SandboxState::Refreshing {
                instance.transition(SandboxState::Active);
            }
            if result.is_ok() {
                instance.ttl_minutes = ttl_minutes;
                instance.last_used_at = now_millis();
            }
        }

        match result {
            Ok(()) => {
                info!(instance = %id, ttl_minutes, "refreshed sandbox lease");
                Ok(())
            }
            Err(e) => {
                error!(instance = %id, "failed to refresh sandbox lease: {}", e);
                Err(e)
            }
        }
    }

    pub async fn check_instance_not_exist(&self, id: &str) -> bool {
        self.client.probe_not_exist(id).await
    }

    /// Image version reported by the instance, empty when unavailable.
    pub async fn get_image_version(&self, id: &str) -> String {
        match self.client.image_version(id).await {
            Ok(version) => version,
            Err(e) => {
                warn!(instance = %id, "failed to read sandbox image version: {}", e);
                String::new()
            }
        }
    }

    pub async fn test_instance(&self, id: &str) -> bool {
        match self.client.ping(id).await {
            Ok(()) => {
                if let Some(instance) = self.descriptors.write().await.live.get_mut(id) {
                    instance.last_used_at = now_millis();
                }
                true
            }
            Err(e) => {
                warn!(instance = %id, "sandbox ping failed: {}", e);
                false
            }
        }
    }

    async fn retire(&self, id: &str, last: SandboxState) {
        self.descriptors.write().await.retire(id, last);
    }

    /// Returns a descriptor whose delete failed to where it was before.
    async fn abandon_delete(&self, id: &str, previous: Option<SandboxState>) {
        if previous == Some(SandboxState::Deleting) {
            return;
        }
        if let Some(instance) = self.descriptors.write().await.live.get_mut(id) {
            if instance.state == SandboxState::Deleting {
                instance.transition(SandboxState::Active);
            }
        }
    }

    /// Moves a live descriptor to `Refreshing` and returns the state it had.
    /// Untracked ids return `None` and are refreshed blindly.
    async fn begin_refresh(&self, id: &str) -> SandboxResult<Option<SandboxState>> {
        let mut descriptors = self.descriptors.write().await;
        if let Some(state) = descriptors.removed_state(id) {
            return Err(SandboxError::Unavailable {
                id: id.to_string(),
                state,
            });
        }
        let Some(instance) = descriptors.live.get_mut(id) else {
            return Ok(None);
        };
        match instance.state {
            SandboxState::Active => {
                instance.transition(SandboxState::Refreshing);
                Ok(Some(SandboxState::Active))
            }
            SandboxState::Refreshing => Ok(Some(SandboxState::Refreshing)),
            state => Err(SandboxError::Unavailable {
                id: id.to_string(),
                state,
            }),
        }
    }
}

impl std::fmt::Debug for SandboxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxManager")
            .field("default_ttl_minutes", &self.default_ttl_minutes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_edges() {
        use SandboxState::*;
        assert!(Absent.can_transition(Creating));
        assert!(Creating.can_transition(Active));
        assert!(Active.can_transition(Refreshing));
        assert!(Refreshing.can_transition(Active));
        assert!(Active.can_transition(Deleting));
        assert!(Deleting.can_transition(Deleted));
        assert!(Deleting.can_transition(Absent));

        assert!(!Deleted.can_transition(Active));
        assert!(!Absent.can_transition(Deleting));
        assert!(!Deleted.can_transition(Deleting));
    }

    #[test]
    fn gone_states_are_inactive() {
        let mut instance = SandboxInstance {
            id: "i".into(),
            url: "https://i.example.com".into(),
            created_at: 0,
            last_used_at: 0,
            ttl_minutes: 10,
            is_active: true,
            state: SandboxState::Active,
        };
        assert!(instance.transition(SandboxState::Deleting));
        assert!(instance.is_active);
        assert!(instance.transition(SandboxState::Deleted));
        assert!(!instance.is_active);
        assert!(!instance.transition(SandboxState::Active));
        assert_eq!(instance.state, SandboxState::Deleted);
    }

    #[test]
    fn delete_outcomes_serialize_camel_case() {
        let soft = serde_json::to_value(DeleteOutcome::already_gone("gone")).unwrap();
        assert_eq!(soft["success"], false);
        assert_eq!(soft["shouldContinue"], true);
        assert_eq!(soft["error"], "gone");

        let ok = serde_json::to_value(DeleteOutcome::deleted()).unwrap();
        assert!(ok.get("error").is_none());
    }

    #[test]
    fn removed_history_is_bounded() {
        let mut descriptors = Descriptors::default();
        for n in 0..REMOVED_HISTORY + 10 {
            let id = format!("inst-{n}");
            descriptors.live.insert(
                id.clone(),
                SandboxInstance {
                    id: id.clone(),
                    url: String::new(),
                    created_at: 0,
                    last_used_at: 0,
                    ttl_minutes: 1,
                    is_active: true,
                    state: SandboxState::Deleting,
                },
            );
            descriptors.retire(&id, SandboxState::Deleted);
        }

        assert!(descriptors.live.is_empty());
        assert_eq!(descriptors.removed.len(), REMOVED_HISTORY);
        assert_eq!(descriptors.removed_state("inst-0"), None);
        assert_eq!(
            descriptors.removed_state(&format!("inst-{}", REMOVED_HISTORY + 9)),
            Some(SandboxState::Deleted)
        );

        descriptors.retire("inst-20", SandboxState::Absent);
        assert_eq!(descriptors.removed.len(), REMOVED_HISTORY);
        assert_eq!(descriptors.removed_state("inst-20"), Some(SandboxState::Absent));
    }
}
