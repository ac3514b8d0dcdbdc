//! Entity identity shared by dependency declarations, mapping keys and
//! result buckets.

use serde::{Serialize, Serializer};
use std::fmt;

/// Stable name of an entity type taking part in a migration.
///
/// The same value is used as a dependency-graph node, as the namespace of
/// mapping-cache keys and as the bucket name in [`ImportResult`], so renaming
/// an entity renames it everywhere at once.
///
/// [`ImportResult`]: crate::migration::ImportResult
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(&'static str);

impl EntityId {
    pub const USERS: EntityId = EntityId("users");
    pub const GROUPS: EntityId = EntityId("groups");
    pub const GROUP_MEMBERS: EntityId = EntityId("group_members");
    pub const FORUM_CATEGORIES: EntityId = EntityId("forum_categories");
    pub const FORUMS: EntityId = EntityId("forums");
    pub const TOPICS: EntityId = EntityId("topics");
    pub const POSTS: EntityId = EntityId("posts");
    pub const BLOGS: EntityId = EntityId("blogs");
    pub const BLOG_COMMENTS: EntityId = EntityId("blog_comments");
    pub const PRODUCT_CATEGORIES: EntityId = EntityId("product_categories");
    pub const PRODUCTS: EntityId = EntityId("products");
    pub const PRODUCT_PRICES: EntityId = EntityId("product_prices");
    pub const SUBSCRIPTIONS: EntityId = EntityId("subscriptions");
    pub const ORDERS: EntityId = EntityId("orders");
    pub const ORDER_ITEMS: EntityId = EntityId("order_items");
    pub const USER_SUBSCRIPTIONS: EntityId = EntityId("user_subscriptions");

    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub const fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl Serialize for EntityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.0)
    }
}

impl From<EntityId> for String {
    fn from(entity: EntityId) -> Self {
        entity.0.to_string()
    }
}
