//! Domain Cache Bundle (component E): the concrete catalog of caches a
//! federated social server needs (§4.5.1), wired to the cross-cache
//! invalidation rules triggered by domain events (§4.5.3) and the
//! hibernation `onChanged` hook (§4.5.4).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::bus::{EventBus, HandlerOptions};
use crate::cache::{LoaderSet, QuantumCache};
use crate::config::CacheOptions;
use crate::domain::types::{
    Emoji, FederatedInstance, FollowStats, FollowerMap, FollowingMap, ListMembershipMap, Profile,
    PublicKey, User,
};
use crate::error::Result;
use crate::registry::CacheRegistry;
use crate::store::MemoryCache;

/// One [`LoaderSet`] per quantum cache in the catalog; callers build these
/// with [`LoaderSet::new`]/`with_fetch_maybe`/`with_fetch_bulk` against their
/// own database layer (§6.2 loader contracts) before constructing the
/// bundle. `userFollowStats` has no entry — it's a plain derived
/// [`MemoryCache`] with no loader pipeline (§4.6).
pub struct DomainLoaders {
    pub user_by_id: LoaderSet<User>,
    pub local_user_by_native_token: LoaderSet<String>,
    pub user_by_acct: LoaderSet<String>,
    pub user_profile: LoaderSet<Profile>,
    pub user_mutings: LoaderSet<HashSet<String>>,
    pub user_muted: LoaderSet<HashSet<String>>,
    pub user_blocking: LoaderSet<HashSet<String>>,
    pub user_blocked: LoaderSet<HashSet<String>>,
    pub user_list_memberships: LoaderSet<ListMembershipMap>,
    pub list_user_memberships: LoaderSet<ListMembershipMap>,
    pub user_list_favorites: LoaderSet<HashSet<String>>,
    pub list_user_favorites: LoaderSet<HashSet<String>>,
    pub renote_mutings: LoaderSet<HashSet<String>>,
    pub thread_mutings: LoaderSet<HashSet<String>>,
    pub note_mutings: LoaderSet<HashSet<String>>,
    pub user_followings: LoaderSet<FollowingMap>,
    pub user_followers: LoaderSet<FollowerMap>,
    pub hibernated_users: LoaderSet<bool>,
    pub user_following_channels: LoaderSet<HashSet<String>>,
    pub uri_person: LoaderSet<String>,
    pub public_key_by_key_id: LoaderSet<PublicKey>,
    pub public_key_by_user_id: LoaderSet<PublicKey>,
    pub emojis_by_id: LoaderSet<Emoji>,
    pub emojis_by_key: LoaderSet<Emoji>,
    pub federated_instance: LoaderSet<FederatedInstance>,
}

/// Fetches the hibernation flag from the database for a single user id.
/// Installed once per bundle as the hibernation hook's re-fetch callback
/// (§4.5.4); the hook itself only needs a narrow slice of a full loader.
pub type HibernationRefetch =
    Arc<dyn Fn(String) -> futures::future::BoxFuture<'static, Result<bool>> + Send + Sync>;

/// The 26-cache catalog from §4.5.1, wired to the bus for §4.5.3's
/// invalidation rules. Held as `Arc<Self>` so cache construction and event
/// handler closures can capture cheap clones of individual cache handles
/// without capturing the whole bundle.
pub struct DomainCacheBundle {
    pub user_by_id: Arc<QuantumCache<User>>,
    pub local_user_by_native_token: Arc<QuantumCache<String>>,
    pub user_by_acct: Arc<QuantumCache<String>>,
    pub user_profile: Arc<QuantumCache<Profile>>,
    pub user_mutings: Arc<QuantumCache<HashSet<String>>>,
    pub user_muted: Arc<QuantumCache<HashSet<String>>>,
    pub user_blocking: Arc<QuantumCache<HashSet<String>>>,
    pub user_blocked: Arc<QuantumCache<HashSet<String>>>,
    pub user_list_memberships: Arc<QuantumCache<ListMembershipMap>>,
    pub list_user_memberships: Arc<QuantumCache<ListMembershipMap>>,
    pub user_list_favorites: Arc<QuantumCache<HashSet<String>>>,
    pub list_user_favorites: Arc<QuantumCache<HashSet<String>>>,
    pub renote_mutings: Arc<QuantumCache<HashSet<String>>>,
    pub thread_mutings: Arc<QuantumCache<HashSet<String>>>,
    pub note_mutings: Arc<QuantumCache<HashSet<String>>>,
    pub user_followings: Arc<QuantumCache<FollowingMap>>,
    pub user_followers: Arc<QuantumCache<FollowerMap>>,
    pub hibernated_users: Arc<QuantumCache<bool>>,
    pub user_following_channels: Arc<QuantumCache<HashSet<String>>>,
    pub user_follow_stats: Arc<MemoryCache<FollowStats>>,
    pub uri_person: Arc<QuantumCache<String>>,
    pub public_key_by_key_id: Arc<QuantumCache<PublicKey>>,
    pub public_key_by_user_id: Arc<QuantumCache<PublicKey>>,
    pub emojis_by_id: Arc<QuantumCache<Emoji>>,
    pub emojis_by_key: Arc<QuantumCache<Emoji>>,
    pub federated_instance: Arc<QuantumCache<FederatedInstance>>,
    pub(crate) local_host: Option<String>,
    bus: Arc<EventBus>,
}

macro_rules! min {
    ($n:expr) => {
        Duration::from_secs($n * 60)
    };
}

impl DomainCacheBundle {
    /// Registers every cache in the catalog against `registry` with the
    /// lifetimes from §4.5.1, wires the hibernation hook, and subscribes the
    /// domain-event invalidation handlers from §4.5.3.
    pub fn new(
        registry: &Arc<CacheRegistry>,
        loaders: DomainLoaders,
        hibernation_refetch: HibernationRefetch,
    ) -> Result<Arc<Self>> {
        let bus = registry.bus();
        let user_by_id = registry.create_quantum(CacheOptions::new("userById", min!(5)), loaders.user_by_id)?;
        let local_user_by_native_token = registry.create_quantum(
            CacheOptions::new("localUserByNativeToken", min!(5)),
            loaders.local_user_by_native_token,
        )?;
        let user_by_acct =
            registry.create_quantum(CacheOptions::new("userByAcct", min!(30)), loaders.user_by_acct)?;
        let user_profile =
            registry.create_quantum(CacheOptions::new("userProfile", min!(30)), loaders.user_profile)?;
        let user_mutings =
            registry.create_quantum(CacheOptions::new("userMutings", min!(30)), loaders.user_mutings)?;
        let user_muted =
            registry.create_quantum(CacheOptions::new("userMuted", min!(30)), loaders.user_muted)?;
        let user_blocking =
            registry.create_quantum(CacheOptions::new("userBlocking", min!(30)), loaders.user_blocking)?;
        let user_blocked =
            registry.create_quantum(CacheOptions::new("userBlocked", min!(30)), loaders.user_blocked)?;
        let user_list_memberships = registry.create_quantum(
            CacheOptions::new("userListMemberships", min!(30)),
            loaders.user_list_memberships,
        )?;
        let list_user_memberships = registry.create_quantum(
            CacheOptions::new("listUserMemberships", min!(30)),
            loaders.list_user_memberships,
        )?;
        let user_list_favorites = registry.create_quantum(
            CacheOptions::new("userListFavorites", min!(30)),
            loaders.user_list_favorites,
        )?;
        let list_user_favorites = registry.create_quantum(
            CacheOptions::new("listUserFavorites", min!(30)),
            loaders.list_user_favorites,
        )?;
        let renote_mutings = registry
            .create_quantum(CacheOptions::new("renoteMutings", min!(30)), loaders.renote_mutings)?;
        let thread_mutings = registry
            .create_quantum(CacheOptions::new("threadMutings", min!(30)), loaders.thread_mutings)?;
        let note_mutings =
            registry.create_quantum(CacheOptions::new("noteMutings", min!(30)), loaders.note_mutings)?;
        let user_followings = registry
            .create_quantum(CacheOptions::new("userFollowings", min!(30)), loaders.user_followings)?;
        let user_followers = registry
            .create_quantum(CacheOptions::new("userFollowers", min!(30)), loaders.user_followers)?;
        let hibernated_users = registry
            .create_quantum(CacheOptions::new("hibernatedUsers", min!(30)), loaders.hibernated_users)?;
        let user_following_channels = registry.create_quantum(
            CacheOptions::new("userFollowingChannels", min!(30)),
            loaders.user_following_channels,
        )?;
        let user_follow_stats: Arc<MemoryCache<FollowStats>> =
            registry.create_memory("userFollowStats", Duration::from_secs(10 * 60))?;
        let uri_person =
            registry.create_quantum(CacheOptions::new("uriPerson", min!(30)), loaders.uri_person)?;
        let public_key_by_key_id = registry.create_quantum(
            CacheOptions::new("publicKeyByKeyId", Duration::from_secs(12 * 3600)),
            loaders.public_key_by_key_id,
        )?;
        let public_key_by_user_id = registry.create_quantum(
            CacheOptions::new("publicKeyByUserId", Duration::from_secs(12 * 3600)),
            loaders.public_key_by_user_id,
        )?;
        let emojis_by_id = registry
            .create_quantum(CacheOptions::new("emojisById", Duration::from_secs(3600)), loaders.emojis_by_id)?;
        let emojis_by_key = registry.create_quantum(
            CacheOptions::new("emojisByKey", Duration::from_secs(3600)),
            loaders.emojis_by_key,
        )?;
        let federated_instance = registry.create_quantum(
            CacheOptions::new("federatedInstance", min!(3)),
            loaders.federated_instance,
        )?;

        wire_hibernation_hook(&hibernated_users, &user_by_id, hibernation_refetch);

        let bundle = Arc::new(Self {
            user_by_id,
            local_user_by_native_token,
            user_by_acct,
            user_profile,
            user_mutings,
            user_muted,
            user_blocking,
            user_blocked,
            user_list_memberships,
            list_user_memberships,
            user_list_favorites,
            list_user_favorites,
            renote_mutings,
            thread_mutings,
            note_mutings,
            user_followings,
            user_followers,
            hibernated_users,
            user_following_channels,
            user_follow_stats,
            uri_person,
            public_key_by_key_id,
            public_key_by_user_id,
            emojis_by_id,
            emojis_by_key,
            federated_instance,
            local_host: registry.local_host().map(str::to_string),
            bus: bus.clone(),
        });
        bundle.wire_invalidation_rules();
        Ok(bundle)
    }

    #[must_use]
    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }
}

/// Installs the `onChanged` hook for `hibernatedUsers`: for every changed
/// key that currently has a resident user in `userById`, re-fetch the
/// authoritative hibernation flag and patch it into the cached user in
/// place (§4.5.4). Runs on both local and remote delivery, mirroring the
/// base cache's hook invocation for local ops and coherence receipt alike.
fn wire_hibernation_hook(
    hibernated_users: &Arc<QuantumCache<bool>>,
    user_by_id: &Arc<QuantumCache<User>>,
    refetch: HibernationRefetch,
) {
    let user_by_id = user_by_id.clone();
    hibernated_users.set_on_changed(move |keys| {
        let user_by_id = user_by_id.clone();
        let refetch = refetch.clone();
        async move {
            for key in keys {
                if !user_by_id.has(&key) {
                    continue;
                }
                let is_hibernated = refetch(key.clone()).await?;
                let _ = user_by_id.update_in_place(&key, |user| user.is_hibernated = is_hibernated)?;
            }
            Ok(())
        }
    });
}

// ===== Domain event payloads (§6.1) =====

#[derive(Deserialize)]
struct IdsPayload {
    #[serde(default)]
    ids: Vec<String>,
    #[serde(default)]
    id: Option<String>,
}

impl IdsPayload {
    fn into_ids(self) -> Vec<String> {
        if !self.ids.is_empty() {
            self.ids
        } else {
            self.id.into_iter().collect()
        }
    }
}

#[derive(Deserialize)]
struct TokenRegeneratedPayload {
    id: String,
    #[serde(rename = "oldToken")]
    old_token: String,
    #[serde(rename = "newToken")]
    new_token: String,
}

#[derive(Deserialize)]
struct FollowPayload {
    #[serde(rename = "followerId")]
    follower_id: String,
    #[serde(rename = "followeeId")]
    followee_id: String,
}

#[derive(Deserialize)]
struct ChannelFollowPayload {
    #[serde(rename = "userId")]
    user_id: String,
}

#[derive(Deserialize)]
struct UpdateProfilePayload {
    #[serde(rename = "userId")]
    user_id: String,
}

#[derive(Deserialize)]
struct ListMemberPayload {
    #[serde(rename = "memberId")]
    member_id: String,
    #[serde(rename = "userListId")]
    user_list_id: String,
}

#[derive(Deserialize)]
struct ListMemberBulkPayload {
    #[serde(rename = "memberId")]
    member_id: String,
    #[serde(rename = "userListIds")]
    user_list_ids: Vec<String>,
}

#[derive(Deserialize)]
struct MetaPayload {
    #[serde(default)]
    before: Option<MetaHostFields>,
    after: MetaHostFields,
}

#[derive(Deserialize, Default, PartialEq, Eq)]
struct MetaHostFields {
    #[serde(default, rename = "blockedHosts")]
    blocked_hosts: Vec<String>,
    #[serde(default, rename = "silencedHosts")]
    silenced_hosts: Vec<String>,
    #[serde(default, rename = "mediaSilencedHosts")]
    media_silenced_hosts: Vec<String>,
    #[serde(default, rename = "federationHosts")]
    federation_hosts: Vec<String>,
    #[serde(default, rename = "bubbleInstances")]
    bubble_instances: Vec<String>,
}

impl DomainCacheBundle {
    fn wire_invalidation_rules(self: &Arc<Self>) {
        self.wire_user_event_topics();
        self.wire_token_regenerated();
        self.wire_follow_topics();
        self.wire_channel_follow_topics();
        self.wire_profile_updated();
        self.wire_list_member_topics();
        self.wire_meta_updated();
    }

    fn wire_user_event_topics(self: &Arc<Self>) {
        const TOPICS: &[&str] = &[
            "userUpdated",
            "usersUpdated",
            "userChangeSuspendedState",
            "userChangeDeletedState",
            "remoteUserUpdated",
            "localUserUpdated",
        ];
        for topic in TOPICS {
            let this = self.clone();
            self.bus.on(*topic, HandlerOptions::default(), move |payload, is_local| {
                let this = this.clone();
                async move {
                    if !is_local {
                        return Ok(());
                    }
                    let ids = serde_json::from_value::<IdsPayload>(payload)
                        .map(IdsPayload::into_ids)
                        .unwrap_or_default();
                    this.evict_user_fan_out(ids).await
                }
            });
        }
    }

    /// §4.5.3's 14-cache user-update fan-out, including the scan for
    /// list-ids whose membership currently references any of `ids`.
    async fn evict_user_fan_out(&self, ids: Vec<String>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let id_set: HashSet<&String> = ids.iter().collect();
        let affected_lists: Vec<String> = self
            .list_user_memberships
            .entries()
            .into_iter()
            .filter_map(|(list_id, members)| members.keys().any(|m| id_set.contains(m)).then_some(list_id))
            .collect();

        self.user_by_id.delete_many(ids.clone()).await?;
        self.user_profile.delete_many(ids.clone()).await?;
        self.user_mutings.delete_many(ids.clone()).await?;
        self.user_muted.delete_many(ids.clone()).await?;
        self.user_blocking.delete_many(ids.clone()).await?;
        self.user_blocked.delete_many(ids.clone()).await?;
        self.renote_mutings.delete_many(ids.clone()).await?;
        self.user_followings.delete_many(ids.clone()).await?;
        self.user_followers.delete_many(ids.clone()).await?;
        self.hibernated_users.delete_many(ids.clone()).await?;
        self.thread_mutings.delete_many(ids.clone()).await?;
        self.note_mutings.delete_many(ids.clone()).await?;
        self.user_list_memberships.delete_many(ids).await?;
        self.list_user_memberships.delete_many(affected_lists).await?;
        Ok(())
    }

    fn wire_token_regenerated(self: &Arc<Self>) {
        let this = self.clone();
        self.bus.on("userTokenRegenerated", HandlerOptions::default(), move |payload, is_local| {
            let this = this.clone();
            async move {
                if !is_local {
                    return Ok(());
                }
                let payload: TokenRegeneratedPayload = serde_json::from_value(payload)
                    .map_err(|e| crate::error::QkvcError::internal(e.to_string()))?;
                this.local_user_by_native_token.delete(payload.old_token).await?;
                this.local_user_by_native_token.set(payload.new_token, payload.id).await?;
                Ok(())
            }
        });
    }

    fn wire_follow_topics(self: &Arc<Self>) {
        for (topic, delta) in [("follow", 1i64), ("unfollow", -1i64)] {
            let this = self.clone();
            self.bus.on(topic, HandlerOptions::default(), move |payload, _is_local| {
                let this = this.clone();
                async move {
                    let payload: FollowPayload = serde_json::from_value(payload)
                        .map_err(|e| crate::error::QkvcError::internal(e.to_string()))?;
                    this.apply_follow_delta(&payload.follower_id, &payload.followee_id, delta).await
                }
            });
        }
    }

    /// §9 Open Question 1: this mutates the cached user's follow counts
    /// without checking whether the database write has landed yet, exactly
    /// as instructed — the race is preserved, not papered over.
    async fn apply_follow_delta(&self, follower_id: &str, followee_id: &str, delta: i64) -> Result<()> {
        let _ = self.user_by_id.update_in_place(follower_id, |u| {
            u.following_count = (u.following_count + delta).max(0);
        })?;
        let _ = self.user_by_id.update_in_place(followee_id, |u| {
            u.followers_count = (u.followers_count + delta).max(0);
        })?;
        self.user_followings.delete(follower_id).await?;
        self.user_followers.delete(followee_id).await?;
        self.user_follow_stats.delete(follower_id);
        self.user_follow_stats.delete(followee_id);
        Ok(())
    }

    fn wire_channel_follow_topics(self: &Arc<Self>) {
        for topic in ["followChannel", "unfollowChannel"] {
            let this = self.clone();
            self.bus.on(topic, HandlerOptions::default(), move |payload, is_local| {
                let this = this.clone();
                async move {
                    if !is_local {
                        return Ok(());
                    }
                    let payload: ChannelFollowPayload = serde_json::from_value(payload)
                        .map_err(|e| crate::error::QkvcError::internal(e.to_string()))?;
                    this.user_following_channels.delete(payload.user_id).await
                }
            });
        }
    }

    fn wire_profile_updated(self: &Arc<Self>) {
        let this = self.clone();
        self.bus.on("updateUserProfile", HandlerOptions::default(), move |payload, is_local| {
            let this = this.clone();
            async move {
                if !is_local {
                    return Ok(());
                }
                let payload: UpdateProfilePayload = serde_json::from_value(payload)
                    .map_err(|e| crate::error::QkvcError::internal(e.to_string()))?;
                this.user_profile.delete(payload.user_id).await
            }
        });
    }

    fn wire_list_member_topics(self: &Arc<Self>) {
        for topic in ["userListMemberAdded", "userListMemberUpdated", "userListMemberRemoved"] {
            let this = self.clone();
            self.bus.on(topic, HandlerOptions::default(), move |payload, _is_local| {
                let this = this.clone();
                async move {
                    let payload: ListMemberPayload = serde_json::from_value(payload)
                        .map_err(|e| crate::error::QkvcError::internal(e.to_string()))?;
                    this.user_list_memberships.delete(payload.member_id).await?;
                    this.list_user_memberships.delete(payload.user_list_id).await
                }
            });
        }
        for topic in ["userListMemberBulkAdded", "userListMemberBulkUpdated", "userListMemberBulkRemoved"] {
            let this = self.clone();
            self.bus.on(topic, HandlerOptions::default(), move |payload, _is_local| {
                let this = this.clone();
                async move {
                    let payload: ListMemberBulkPayload = serde_json::from_value(payload)
                        .map_err(|e| crate::error::QkvcError::internal(e.to_string()))?;
                    this.user_list_memberships.delete(payload.member_id).await?;
                    this.list_user_memberships.delete_many(payload.user_list_ids).await
                }
            });
        }
    }

    fn wire_meta_updated(self: &Arc<Self>) {
        let this = self.clone();
        self.bus.on("metaUpdated", HandlerOptions::default(), move |payload, is_local| {
            let this = this.clone();
            async move {
                if !is_local {
                    return Ok(());
                }
                let payload: MetaPayload = serde_json::from_value(payload)
                    .map_err(|e| crate::error::QkvcError::internal(e.to_string()))?;
                let changed = payload.before.map(|b| b != payload.after).unwrap_or(true);
                if changed {
                    this.federated_instance.clear()?;
                }
                Ok(())
            }
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Tests can use unwrap for simplicity
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::bus::transport::InMemoryClusterTransport;
    use crate::cache::LoaderSet;
    use crate::config::RegistryOptions;

    fn noop_loader<V: Clone + Send + Sync + 'static>() -> LoaderSet<V> {
        LoaderSet::new(|key, _ctx| async move { Err(format!("no loader configured for {key}")) })
    }

    fn test_loaders() -> DomainLoaders {
        DomainLoaders {
            user_by_id: noop_loader(),
            local_user_by_native_token: noop_loader(),
            user_by_acct: noop_loader(),
            user_profile: noop_loader(),
            user_mutings: noop_loader(),
            user_muted: noop_loader(),
            user_blocking: noop_loader(),
            user_blocked: noop_loader(),
            user_list_memberships: noop_loader(),
            list_user_memberships: noop_loader(),
            user_list_favorites: noop_loader(),
            list_user_favorites: noop_loader(),
            renote_mutings: noop_loader(),
            thread_mutings: noop_loader(),
            note_mutings: noop_loader(),
            user_followings: noop_loader(),
            user_followers: noop_loader(),
            hibernated_users: noop_loader(),
            user_following_channels: noop_loader(),
            uri_person: noop_loader(),
            public_key_by_key_id: noop_loader(),
            public_key_by_user_id: noop_loader(),
            emojis_by_id: noop_loader(),
            emojis_by_key: noop_loader(),
            federated_instance: noop_loader(),
        }
    }

    fn test_user(id: &str) -> User {
        User {
            id: id.to_string(),
            host: None,
            username: id.to_string(),
            token: None,
            following_count: 0,
            followers_count: 0,
            is_hibernated: false,
            is_suspended: false,
            is_deleted: false,
        }
    }

    async fn bundle() -> Arc<DomainCacheBundle> {
        let registry = CacheRegistry::with_bus(
            RegistryOptions::new("proc-a", "example.com"),
            Arc::new(InMemoryClusterTransport::default()),
        );
        DomainCacheBundle::new(&registry, test_loaders(), Arc::new(|_key| Box::pin(async { Ok(false) })))
            .unwrap()
    }

    #[tokio::test]
    async fn test_follow_invalidates_both_sides_and_stats() {
        let bundle = bundle().await;
        bundle
            .user_followings
            .set("A".to_string(), [("B".to_string(), dummy_follow("A", "B"))].into_iter().collect())
            .await
            .unwrap();
        bundle
            .user_followers
            .set("B".to_string(), [("A".to_string(), dummy_follow("A", "B"))].into_iter().collect())
            .await
            .unwrap();
        bundle.user_follow_stats.set("A", FollowStats::default(), None);
        bundle.user_follow_stats.set("B", FollowStats::default(), None);

        bundle.bus().emit("follow", serde_json::json!({"followerId": "A", "followeeId": "B"}), true).await;

        assert!(!bundle.user_followings.has("A"));
        assert!(!bundle.user_followers.has("B"));
        assert_eq!(bundle.user_follow_stats.get("A"), None);
        assert_eq!(bundle.user_follow_stats.get("B"), None);
    }

    fn dummy_follow(follower: &str, followee: &str) -> crate::domain::types::Follow {
        crate::domain::types::Follow {
            follower_id: follower.to_string(),
            followee_id: followee.to_string(),
            follower_inbox: None,
            with_replies: false,
        }
    }

    #[tokio::test]
    async fn test_user_updated_fans_out_to_fourteen_caches() {
        let bundle = bundle().await;
        let x = "X".to_string();
        bundle.user_by_id.set(x.clone(), test_user(&x)).await.unwrap();
        bundle.user_profile.set(x.clone(), Profile { user_id: x.clone(), description: None, muted_instances: HashSet::new() }).await.unwrap();
        bundle.user_mutings.set(x.clone(), HashSet::new()).await.unwrap();
        bundle.user_muted.set(x.clone(), HashSet::new()).await.unwrap();
        bundle.user_blocking.set(x.clone(), HashSet::new()).await.unwrap();
        bundle.user_blocked.set(x.clone(), HashSet::new()).await.unwrap();
        bundle.renote_mutings.set(x.clone(), HashSet::new()).await.unwrap();
        bundle.user_followings.set(x.clone(), FollowingMap::new()).await.unwrap();
        bundle.user_followers.set(x.clone(), FollowerMap::new()).await.unwrap();
        bundle.hibernated_users.set(x.clone(), false).await.unwrap();
        bundle.thread_mutings.set(x.clone(), HashSet::new()).await.unwrap();
        bundle.note_mutings.set(x.clone(), HashSet::new()).await.unwrap();
        bundle.user_list_memberships.set(x.clone(), ListMembershipMap::new()).await.unwrap();

        bundle.bus().emit("userUpdated", serde_json::json!({"id": x}), true).await;

        assert!(!bundle.user_by_id.has(&x));
        assert!(!bundle.user_profile.has(&x));
        assert!(!bundle.user_mutings.has(&x));
        assert!(!bundle.user_muted.has(&x));
        assert!(!bundle.user_blocking.has(&x));
        assert!(!bundle.user_blocked.has(&x));
        assert!(!bundle.renote_mutings.has(&x));
        assert!(!bundle.user_followings.has(&x));
        assert!(!bundle.user_followers.has(&x));
        assert!(!bundle.hibernated_users.has(&x));
        assert!(!bundle.thread_mutings.has(&x));
        assert!(!bundle.note_mutings.has(&x));
        assert!(!bundle.user_list_memberships.has(&x));
    }

    #[tokio::test]
    async fn test_token_rotation_moves_the_index_entry() {
        let bundle = bundle().await;
        bundle.local_user_by_native_token.set("old".to_string(), "U".to_string()).await.unwrap();

        bundle
            .bus()
            .emit(
                "userTokenRegenerated",
                serde_json::json!({"id": "U", "oldToken": "old", "newToken": "new"}),
                true,
            )
            .await;

        assert!(!bundle.local_user_by_native_token.has("old"));
        assert_eq!(bundle.local_user_by_native_token.get("new").unwrap(), "U");
    }

    #[tokio::test]
    async fn test_user_event_is_ignored_when_not_local() {
        let bundle = bundle().await;
        let x = "X".to_string();
        bundle.user_by_id.set(x.clone(), test_user(&x)).await.unwrap();

        bundle.bus().emit("userUpdated", serde_json::json!({"id": x}), false).await;

        assert!(bundle.user_by_id.has(&x));
    }

    #[tokio::test]
    async fn test_meta_updated_clears_federated_instance_only_on_host_list_change() {
        let bundle = bundle().await;
        bundle
            .federated_instance
            .set(
                "example.com".to_string(),
                FederatedInstance {
                    host: "example.com".into(),
                    is_blocked: false,
                    is_silenced: false,
                    is_media_silenced: false,
                },
            )
            .await
            .unwrap();

        bundle
            .bus()
            .emit(
                "metaUpdated",
                serde_json::json!({
                    "before": {"blockedHosts": []},
                    "after": {"blockedHosts": ["bad.example"]}
                }),
                true,
            )
            .await;

        assert!(!bundle.federated_instance.has("example.com"));
    }

    #[tokio::test]
    async fn test_hibernation_hook_patches_resident_user_in_place() {
        let registry = CacheRegistry::with_bus(
            RegistryOptions::new("proc-a", "example.com"),
            Arc::new(InMemoryClusterTransport::default()),
        );
        let bundle =
            DomainCacheBundle::new(&registry, test_loaders(), Arc::new(|_key| Box::pin(async { Ok(true) })))
                .unwrap();

        let x = "X".to_string();
        bundle.user_by_id.set(x.clone(), test_user(&x)).await.unwrap();
        bundle.hibernated_users.set(x.clone(), true).await.unwrap();

        let refreshed = bundle.user_by_id.get(&x).unwrap();
        assert!(refreshed.is_hibernated);
    }
}
