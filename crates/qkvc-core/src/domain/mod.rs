//! Domain Cache Bundle: the concrete 26-cache catalog a federated social
//! server needs, its key-encoding rules, and the compound reads built on top
//! of it.

mod bundle;
mod keys;
mod reads;
mod types;

pub use bundle::{DomainCacheBundle, DomainLoaders, HibernationRefetch};
pub use keys::{decode_emoji_key, encode_acct_key, encode_emoji_key, normalize_acct_host, punyhost};
pub use types::{
    Emoji, FederatedInstance, Follow, FollowerEntry, FollowerMap, FollowingMap, FollowStats,
    ListMembership, ListMembershipMap, Profile, PublicKey, User,
};
