//! Minimal domain entities (§3.4). Every struct carries exactly the fields
//! the cache bundle and its invalidation rules need; nothing here models the
//! rest of the federated server (timelines, notes, drive files, ...).

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// A local or remote account. Local when `host` is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub host: Option<String>,
    pub username: String,
    pub token: Option<String>,
    pub following_count: i64,
    pub followers_count: i64,
    pub is_hibernated: bool,
    pub is_suspended: bool,
    pub is_deleted: bool,
}

impl User {
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.host.is_none()
    }

    #[must_use]
    pub fn is_remote(&self) -> bool {
        !self.is_local()
    }
}

/// Profile fields kept separate from `User` itself (§3.4).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: String,
    pub description: Option<String>,
    pub muted_instances: HashSet<String>,
}

/// A follow edge, present 0-or-1 per ordered `(follower_id, followee_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Follow {
    pub follower_id: String,
    pub followee_id: String,
    pub follower_inbox: Option<String>,
    pub with_replies: bool,
}

/// Per-user membership of one list, keyed by the member's own id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListMembership {
    pub user_id: String,
    pub list_id: String,
    pub with_replies: bool,
}

/// A federated instance row (§3.4); `host` is already in registered-domain,
/// punycoded form by the time it reaches this cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederatedInstance {
    pub host: String,
    pub is_blocked: bool,
    pub is_silenced: bool,
    pub is_media_silenced: bool,
}

/// A custom emoji, with its two keying schemes (id and `name`/`name host`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Emoji {
    pub id: String,
    pub name: String,
    pub host: Option<String>,
    pub url: String,
    pub public_url: Option<String>,
    pub aliases: Vec<String>,
}

/// An ActivityPub actor public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    pub key_id: String,
    pub user_id: String,
    pub pem: String,
}

/// `{localFollowing, localFollowers, remoteFollowing, remoteFollowers}`
/// (§4.5.1 `userFollowStats`, §4.5.5 `getFollowStats`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FollowStats {
    pub local_following: u64,
    pub local_followers: u64,
    pub remote_following: u64,
    pub remote_followers: u64,
}

/// A `followers.fetch` entry enriched with the follower's hibernation state
/// (§4.5.5 `getFollowersWithHibernation`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowerEntry {
    pub follow: Follow,
    pub is_follower_hibernated: bool,
}

pub type FollowingMap = HashMap<String, Follow>;
pub type FollowerMap = HashMap<String, Follow>;
pub type ListMembershipMap = HashMap<String, ListMembership>;
