//! Forum categories, forums, topics and posts.
//!
//! Invision keeps categories and forums in one table; categories are the
//! rows with `parent_id = -1`.

use super::transform::{clean_html, fields, slug_for, timestamp};
use crate::error::RecordError;
use crate::migration::cache::CacheScope;
use crate::migration::entity::EntityId;
use crate::migration::outcome::{Detail, detail};
use crate::migration::policy::{EntityPolicy, Reference, ResolvedRefs};
use crate::migration::source::{Filter, SourceQuery, SourceRow};
use crate::migration::target::{NaturalKey, TargetRecord};
use serde_json::json;

const FORUM_TABLE: &str = "forums_forums";
const ROOT_PARENT: i64 = -1;

fn forum_slug(row: &SourceRow, fallback: &str) -> Result<String, RecordError> {
    Ok(slug_for(row, "name_seo", row.str("name")?, fallback, row.i64("id")?))
}

pub struct ForumCategoryPolicy;

impl EntityPolicy for ForumCategoryPolicy {
    fn entity(&self) -> EntityId {
        EntityId::FORUM_CATEGORIES
    }

    fn source(&self) -> SourceQuery {
        SourceQuery::new(FORUM_TABLE, "id").filter(Filter::Eq("parent_id", json!(ROOT_PARENT)))
    }

    fn cache_scope(&self) -> CacheScope {
        CacheScope::Tagged("forums")
    }

    fn natural_key(&self, row: &SourceRow, _refs: &ResolvedRefs) -> Result<NaturalKey, RecordError> {
        Ok(NaturalKey::new().with("slug", forum_slug(row, "category")?))
    }

    fn transform(&self, row: &SourceRow, _refs: &ResolvedRefs) -> Result<TargetRecord, RecordError> {
        Ok(TargetRecord::new(fields(json!({
            "name": row.str("name")?.trim(),
            "slug": forum_slug(row, "category")?,
            "position": row.opt_i64("position")?.unwrap_or(0),
        }))))
    }

    fn describe(&self, row: &SourceRow) -> Detail {
        detail([("name", row.get("name").clone())])
    }
}

pub struct ForumPolicy;

impl EntityPolicy for ForumPolicy {
    fn entity(&self) -> EntityId {
        EntityId::FORUMS
    }

    fn source(&self) -> SourceQuery {
        SourceQuery::new(FORUM_TABLE, "id").filter(Filter::Ne("parent_id", json!(ROOT_PARENT)))
    }

    fn cache_scope(&self) -> CacheScope {
        CacheScope::Tagged("forums")
    }

    /// Sub-forums hang off another forum rather than a category and keep no
    /// category of their own.
    fn references(&self) -> Vec<Reference> {
        vec![Reference::optional(
            "parent_id",
            EntityId::FORUM_CATEGORIES,
            "forum category",
        )]
    }

    fn natural_key(&self, row: &SourceRow, refs: &ResolvedRefs) -> Result<NaturalKey, RecordError> {
        Ok(NaturalKey::new()
            .with("slug", forum_slug(row, "forum")?)
            .with("category_id", refs.get("parent_id")))
    }

    fn transform(&self, row: &SourceRow, refs: &ResolvedRefs) -> Result<TargetRecord, RecordError> {
        Ok(TargetRecord::new(fields(json!({
            "category_id": refs.get("parent_id"),
            "name": row.str("name")?.trim(),
            "slug": forum_slug(row, "forum")?,
            "description": row.opt_str("description").map(clean_html),
            "position": row.opt_i64("position")?.unwrap_or(0),
            "allows_posting": row.opt_i64("sub_can_post")?.is_none_or(|v| v != 0),
        }))))
    }

    fn describe(&self, row: &SourceRow) -> Detail {
        detail([
            ("name", row.get("name").clone()),
            ("parent_id", row.get("parent_id").clone()),
        ])
    }
}

pub struct TopicPolicy;

impl EntityPolicy for TopicPolicy {
    fn entity(&self) -> EntityId {
        EntityId::TOPICS
    }

    fn source(&self) -> SourceQuery {
        SourceQuery::new("forums_topics", "tid")
    }

    fn references(&self) -> Vec<Reference> {
        vec![
            Reference::required("forum_id", EntityId::FORUMS, "forum"),
            Reference::optional("starter_id", EntityId::USERS, "user"),
        ]
    }

    fn natural_key(&self, row: &SourceRow, refs: &ResolvedRefs) -> Result<NaturalKey, RecordError> {
        Ok(NaturalKey::new()
            .with("forum_id", refs.require("forum_id")?)
            .with("title", row.str("title")?.trim())
            .with("created_at", timestamp(row, "start_date")?))
    }

    fn transform(&self, row: &SourceRow, refs: &ResolvedRefs) -> Result<TargetRecord, RecordError> {
        let title = row.str("title")?.trim();
        Ok(TargetRecord::new(fields(json!({
            "forum_id": refs.require("forum_id")?,
            "user_id": refs.get("starter_id"),
            "title": title,
            "slug": slug_for(row, "title_seo", title, "topic", row.i64("tid")?),
            "views": row.opt_i64("views")?.unwrap_or(0),
            "is_pinned": row.flag("pinned"),
            "is_locked": row.opt_str("state") == Some("closed"),
            "is_approved": row.opt_i64("approved")?.is_none_or(|v| v == 1),
            "created_at": timestamp(row, "start_date")?,
            "last_post_at": timestamp(row, "last_post")?,
        }))))
    }

    fn describe(&self, row: &SourceRow) -> Detail {
        detail([
            ("title", row.get("title").clone()),
            ("forum_id", row.get("forum_id").clone()),
        ])
    }
}

pub struct PostPolicy;

impl EntityPolicy for PostPolicy {
    fn entity(&self) -> EntityId {
        EntityId::POSTS
    }

    fn source(&self) -> SourceQuery {
        SourceQuery::new("forums_posts", "pid")
    }

    fn references(&self) -> Vec<Reference> {
        vec![
            Reference::required("topic_id", EntityId::TOPICS, "topic"),
            // Guests post with author_id 0.
            Reference::optional("author_id", EntityId::USERS, "user"),
        ]
    }

    fn natural_key(&self, row: &SourceRow, refs: &ResolvedRefs) -> Result<NaturalKey, RecordError> {
        Ok(NaturalKey::new()
            .with("topic_id", refs.require("topic_id")?)
            .with("user_id", refs.get("author_id"))
            .with("created_at", timestamp(row, "post_date")?)
            .with("body", clean_html(row.str("post")?)))
    }

    fn transform(&self, row: &SourceRow, refs: &ResolvedRefs) -> Result<TargetRecord, RecordError> {
        let user_id = refs.get("author_id");
        let guest_name = match user_id {
            Some(_) => None,
            None => row.opt_str("author_name").map(str::trim),
        };

        Ok(TargetRecord::new(fields(json!({
            "topic_id": refs.require("topic_id")?,
            "user_id": user_id,
            "guest_name": guest_name,
            "body": clean_html(row.str("post")?),
            "is_first_post": row.flag("new_topic"),
            "is_hidden": row.opt_i64("queued")?.is_some_and(|q| q != 0),
            "created_at": timestamp(row, "post_date")?,
            "edited_at": timestamp(row, "edit_time")?,
        }))))
    }

    fn describe(&self, row: &SourceRow) -> Detail {
        detail([
            ("topic_id", row.get("topic_id").clone()),
            ("author", row.get("author_name").clone()),
        ])
    }
}
