//! Importers for an Invision Community installation.
//!
//! The legacy schema is read as-is (`core_members`, `forums_topics`,
//! `nexus_invoices`, ...). Each importer is a [`PolicyImporter`] over one
//! or more policies; composites import the entities that cannot exist on
//! their own (forum categories, product categories, memberships) in the
//! same step as their owner.
//!
//! ```text
//! users ── groups (+ group_members) ·· forums (+ categories)
//! forums, users ── topics ── posts
//! users ── blogs ·· blog_comments
//! products (+ categories, prices) ── orders (+ order_items)
//! users, subscriptions, ·orders ── user_subscriptions
//! ```
//!
//! `──` is a required dependency, `··` an optional one.

mod blogs;
mod commerce;
mod forums;
mod members;
pub mod transform;

pub use blogs::{BlogCommentPolicy, BlogPolicy};
pub use commerce::{
    OrderPolicy, ProductCategoryPolicy, ProductPolicy, SubscriptionPolicy, UserSubscriptionPolicy,
};
pub use forums::{ForumCategoryPolicy, ForumPolicy, PostPolicy, TopicPolicy};
pub use members::{GroupMemberPolicy, GroupPolicy, UserPolicy};

use crate::migration::dependency::ImporterDependency;
use crate::migration::entity::EntityId;
use crate::migration::importer::{EntityImporter, PolicyImporter};

/// Source-system id used in mapping keys by default.
pub const SOURCE_NAME: &str = "invision";

/// Knobs for the Invision importers.
#[derive(Debug, Clone)]
pub struct InvisionOptions {
    /// See [`OrderPolicy::placeholder_items`].
    pub placeholder_order_items: bool,
}

impl Default for InvisionOptions {
    fn default() -> Self {
        Self {
            placeholder_order_items: true,
        }
    }
}

/// Every Invision importer, in declaration order.
pub fn importers(options: &InvisionOptions) -> Vec<Box<dyn EntityImporter>> {
    vec![
        Box::new(PolicyImporter::single(UserPolicy, vec![])),
        Box::new(PolicyImporter::composite(
            EntityId::GROUPS,
            vec![Box::new(GroupPolicy), Box::new(GroupMemberPolicy)],
            vec![ImporterDependency::required_pre(
                EntityId::USERS,
                "memberships link users to groups",
            )],
        )),
        Box::new(PolicyImporter::composite(
            EntityId::FORUMS,
            vec![Box::new(ForumCategoryPolicy), Box::new(ForumPolicy)],
            vec![ImporterDependency::optional_pre(
                EntityId::GROUPS,
                "forum access is granted per group",
            )],
        )),
        Box::new(PolicyImporter::single(
            TopicPolicy,
            vec![
                ImporterDependency::required_pre(EntityId::FORUMS, "topics belong to a forum"),
                ImporterDependency::required_pre(EntityId::USERS, "topics have a starter"),
            ],
        )),
        Box::new(PolicyImporter::single(
            PostPolicy,
            vec![
                ImporterDependency::required_pre(EntityId::TOPICS, "posts belong to a topic"),
                ImporterDependency::required_pre(EntityId::USERS, "posts have an author"),
            ],
        )),
        Box::new(PolicyImporter::single(
            BlogPolicy,
            vec![
                ImporterDependency::required_pre(EntityId::USERS, "entries have an author"),
                ImporterDependency::optional_post(
                    EntityId::BLOG_COMMENTS,
                    "comments can follow their entries",
                ),
            ],
        )),
        Box::new(PolicyImporter::single(
            BlogCommentPolicy,
            vec![
                ImporterDependency::required_pre(EntityId::BLOGS, "comments belong to an entry"),
                ImporterDependency::required_pre(EntityId::USERS, "comments have an author"),
            ],
        )),
        Box::new(PolicyImporter::composite(
            EntityId::PRODUCTS,
            vec![Box::new(ProductCategoryPolicy), Box::new(ProductPolicy)],
            vec![],
        )),
        Box::new(PolicyImporter::single(
            SubscriptionPolicy,
            vec![ImporterDependency::optional_pre(
                EntityId::PRODUCTS,
                "subscription tiers are listed next to store products",
            )],
        )),
        Box::new(PolicyImporter::single(
            OrderPolicy {
                placeholder_items: options.placeholder_order_items,
            },
            vec![
                ImporterDependency::required_pre(EntityId::USERS, "orders belong to a customer"),
                ImporterDependency::required_pre(EntityId::PRODUCTS, "order items reference products"),
            ],
        )),
        Box::new(PolicyImporter::single(
            UserSubscriptionPolicy,
            vec![
                ImporterDependency::required_pre(EntityId::USERS, "subscriptions belong to a member"),
                ImporterDependency::required_pre(
                    EntityId::SUBSCRIPTIONS,
                    "member subscriptions reference a package",
                ),
                ImporterDependency::optional_pre(
                    EntityId::ORDERS,
                    "member subscriptions may reference the paying order",
                ),
            ],
        )),
    ]
}

/// Target tables whose names differ from the entity name.
pub fn target_tables() -> Vec<(EntityId, &'static str)> {
    vec![
        (EntityId::GROUP_MEMBERS, "group_user"),
        (EntityId::FORUM_CATEGORIES, "forum_categories"),
        (EntityId::PRODUCT_PRICES, "product_prices"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::ordering::resolve_order;

    #[test]
    fn test_invision_importers_resolve_in_dependency_order() {
        let importers = importers(&InvisionOptions::default());
        let nodes: Vec<_> = importers
            .iter()
            .map(|i| (i.entity_name(), i.dependencies()))
            .collect();
        let order = resolve_order(&nodes).unwrap();

        let position = |e: EntityId| order.iter().position(|x| *x == e).unwrap();
        assert!(position(EntityId::USERS) < position(EntityId::GROUPS));
        assert!(position(EntityId::GROUPS) < position(EntityId::FORUMS));
        assert!(position(EntityId::FORUMS) < position(EntityId::TOPICS));
        assert!(position(EntityId::TOPICS) < position(EntityId::POSTS));
        assert!(position(EntityId::BLOGS) < position(EntityId::BLOG_COMMENTS));
        assert!(position(EntityId::PRODUCTS) < position(EntityId::ORDERS));
        assert!(position(EntityId::ORDERS) < position(EntityId::USER_SUBSCRIPTIONS));
        assert!(position(EntityId::SUBSCRIPTIONS) < position(EntityId::USER_SUBSCRIPTIONS));
        assert_eq!(order.len(), importers.len());
    }

    #[test]
    fn test_composites_read_all_their_tables() {
        let importers = importers(&InvisionOptions::default());
        let products = importers
            .iter()
            .find(|i| i.entity_name() == EntityId::PRODUCTS)
            .unwrap();
        assert_eq!(
            products.source_tables(),
            vec!["nexus_package_groups", "nexus_packages"]
        );
        assert_eq!(products.source_table(), "nexus_packages");
        assert_eq!(products.cache_tags(), vec!["store"]);
    }
}
