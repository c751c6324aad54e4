//! Compound reads built on top of the cache catalog (§4.5.5) and the emoji /
//! federated-instance helpers that sit alongside it (§4.5.6). None of this
//! adds new cache state; it composes the catalog's existing fetch/refresh
//! contracts into the shapes callers actually want.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::domain::bundle::DomainCacheBundle;
use crate::domain::keys::{encode_acct_key, encode_emoji_key, normalize_acct_host, punyhost};
use crate::domain::types::{Emoji, FederatedInstance, FollowStats, FollowerEntry, User};
use crate::error::{QkvcError, Result};

fn acct_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^([-\w]+)(?:@([\w.-]+))?$").expect("static pattern is valid"))
}

/// Splits `"name"` or `"name@host"` into its parts, validating against the
/// acct/emoji-reference grammar shared by both (§4.5.6).
fn parse_name_with_host(input: &str) -> Result<(String, Option<String>)> {
    let captures =
        acct_pattern().captures(input).ok_or_else(|| QkvcError::invalid_emoji_key(input))?;
    let name = captures.get(1).expect("group 1 is mandatory").as_str().to_string();
    let host = captures.get(2).map(|m| m.as_str().to_string());
    Ok((name, host))
}

impl DomainCacheBundle {
    /// Normalizes `acct` (lowercase username, punycode + null-normalize
    /// host against the local server) and resolves it all the way through
    /// to the `User` it names.
    pub async fn find_user_by_acct(&self, acct: &str) -> Result<User> {
        let (username, raw_host) = parse_name_with_host(acct)?;
        let host = normalize_acct_host(raw_host.as_deref(), self.local_host.as_deref());
        let key = encode_acct_key(&username, host.as_deref());
        let id = self.user_by_acct.fetch(key).await?;
        self.user_by_id.fetch(id).await
    }

    /// Resolves a native session token all the way to its owning `User`,
    /// rejecting remote users with *UserNotLocal* (§4.5.5).
    pub async fn find_local_user_by_native_token(&self, token: &str) -> Result<User> {
        let id = self.local_user_by_native_token.fetch(token).await?;
        let user = self.user_by_id.fetch(id).await?;
        if user.is_remote() {
            return Err(QkvcError::user_not_local(user.id));
        }
        Ok(user)
    }

    /// Whether `a` follows `b`. Prefers whichever direction is already
    /// resident in memory, only falling back to a loader round trip when
    /// neither side is cached (§4.5.5).
    pub async fn is_following(&self, a: &str, b: &str) -> Result<bool> {
        if let Some(followers) = self.user_followers.get_maybe(b) {
            return Ok(followers.contains_key(a));
        }
        let followings = self.user_followings.fetch(a).await?;
        Ok(followings.contains_key(b))
    }

    /// Forces `userFollowings` for `user_id` to reload, then evicts every
    /// followee's cached `userFollowers` entry so the peer side of the
    /// relation picks up the change too (§4.5.5).
    pub async fn refresh_follow_relations_for(&self, user_id: &str) -> Result<()> {
        let followings = self.user_followings.refresh(user_id).await?;
        let followee_ids: Vec<String> = followings.into_keys().collect();
        self.user_followers.delete_many(followee_ids).await
    }

    /// `userFollowStats` on hit; on miss, reconstructs the
    /// local/remote breakdown from `userFollowings`/`userFollowers`,
    /// falling back to the aggregate-count heuristic for a remote focal
    /// user whose full relation set isn't known locally (§4.5.5, §9 note 4).
    pub async fn get_follow_stats(&self, user_id: &str) -> Result<FollowStats> {
        if let Some(stats) = self.user_follow_stats.get(user_id) {
            return Ok(stats);
        }

        let user = self.user_by_id.fetch(user_id).await?;
        let followings = self.user_followings.fetch(user_id).await?;
        let followers = self.user_followers.fetch(user_id).await?;

        let local_following = self.count_local(followings.keys()).await?;
        let local_followers = self.count_local(followers.keys()).await?;

        let stats = if user.is_local() {
            let remote_following = u64::try_from(followings.len()).unwrap_or(0) - local_following;
            let remote_followers = u64::try_from(followers.len()).unwrap_or(0) - local_followers;
            FollowStats { local_following, local_followers, remote_following, remote_followers }
        } else {
            let aggregate_following = u64::try_from(user.following_count.max(0)).unwrap_or(0);
            let aggregate_followers = u64::try_from(user.followers_count.max(0)).unwrap_or(0);
            FollowStats {
                local_following,
                local_followers,
                remote_following: aggregate_following.saturating_sub(local_following),
                remote_followers: aggregate_followers.saturating_sub(local_followers),
            }
        };

        self.user_follow_stats.set(user_id, stats, None);
        Ok(stats)
    }

    async fn count_local<'a>(&self, ids: impl Iterator<Item = &'a String>) -> Result<u64> {
        let ids: Vec<String> = ids.cloned().collect();
        if ids.is_empty() {
            return Ok(0);
        }
        let users = self.user_by_id.fetch_many(ids).await?;
        Ok(users.iter().filter(|(_, u)| u.is_local()).count() as u64)
    }

    /// `userFollowers.fetch` enriched with each follower's current
    /// hibernation flag, defaulting to `false` for any follower
    /// `hibernatedUsers` has no opinion on (§4.5.5).
    pub async fn get_followers_with_hibernation(&self, followee_id: &str) -> Result<Vec<FollowerEntry>> {
        let followers = self.user_followers.fetch(followee_id).await?;
        let follower_ids: Vec<String> = followers.keys().cloned().collect();
        let hibernation: HashMap<String, bool> =
            self.hibernated_users.fetch_many(follower_ids).await?.into_iter().collect();
        Ok(followers
            .into_iter()
            .map(|(follower_id, follow)| FollowerEntry {
                is_follower_hibernated: hibernation.get(&follower_id).copied().unwrap_or(false),
                follow,
            })
            .collect())
    }

    /// Resolves a `":name:"` or `":name@host:"` reference (colons already
    /// stripped by the caller) against the note author's host, returning
    /// whichever of `publicUrl`/`url` the resolved emoji carries (§4.5.6).
    pub async fn populate_emoji(
        &self,
        name_with_optional_host: &str,
        note_user_host: Option<&str>,
    ) -> Result<Option<String>> {
        let (name, raw_host) = parse_name_with_host(name_with_optional_host)?;
        let host = match raw_host.as_deref() {
            Some(".") => None,
            Some(host) => Some(punyhost(host)),
            None => note_user_host.map(punyhost),
        };
        let host = match host {
            Some(host) if self.local_host.as_deref() == Some(host.as_str()) => None,
            other => other,
        };
        let key = encode_emoji_key(&name, host.as_deref())?;
        let emoji = self.emojis_by_key.fetch_maybe(key).await?;
        Ok(emoji.and_then(|e| e.public_url.or(Some(e.url))))
    }

    /// Installs a freshly inserted emoji row into both entity and index
    /// caches with no coherence event — peers have nothing to invalidate
    /// for a key that didn't exist a moment ago (§4.5.6).
    pub async fn create_emoji(&self, new_id: &str) -> Result<Emoji> {
        let emoji = self.emojis_by_id.fetch(new_id).await?;
        let key = encode_emoji_key(&emoji.name, emoji.host.as_deref())?;
        self.emojis_by_key.add(key, emoji.clone()).await?;
        Ok(emoji)
    }

    /// Reloads `emojisById` after a database write and re-keys
    /// `emojisByKey`, evicting `old_key` if the rename moved it (§4.5.6).
    pub async fn update_emoji(&self, id: &str, old_key: Option<&str>) -> Result<Emoji> {
        let updated = self.emojis_by_id.refresh(id).await?;
        let new_key = encode_emoji_key(&updated.name, updated.host.as_deref())?;
        self.emojis_by_key.set(new_key.clone(), updated.clone()).await?;
        if let Some(old_key) = old_key {
            if old_key != new_key {
                self.emojis_by_key.delete(old_key).await?;
            }
        }
        Ok(updated)
    }

    /// `federatedInstance.fetch` with the host punycoded first, since this
    /// index is keyed on punyhost form rather than whatever casing a caller
    /// happens to pass in (§4.5.6).
    pub async fn get_federated_instance(&self, host: &str) -> Result<FederatedInstance> {
        self.federated_instance.fetch(punyhost(host)).await
    }
}
