//! Blog entries and their comments.

use super::transform::{clean_html, fields, slug_for, timestamp};
use crate::error::RecordError;
use crate::migration::entity::EntityId;
use crate::migration::outcome::{Detail, detail};
use crate::migration::policy::{EntityPolicy, Reference, ResolvedRefs};
use crate::migration::source::{Filter, SourceQuery, SourceRow};
use crate::migration::target::{NaturalKey, TargetRecord};
use serde_json::json;

pub struct BlogPolicy;

fn entry_slug(row: &SourceRow) -> Result<String, RecordError> {
    Ok(slug_for(
        row,
        "entry_name_seo",
        row.str("entry_name")?,
        "entry",
        row.i64("entry_id")?,
    ))
}

impl EntityPolicy for BlogPolicy {
    fn entity(&self) -> EntityId {
        EntityId::BLOGS
    }

    fn source(&self) -> SourceQuery {
        SourceQuery::new("blog_entries", "entry_id")
    }

    fn references(&self) -> Vec<Reference> {
        vec![Reference::required("entry_author_id", EntityId::USERS, "author")]
    }

    fn key_uses_references(&self) -> bool {
        false
    }

    fn natural_key(&self, row: &SourceRow, _refs: &ResolvedRefs) -> Result<NaturalKey, RecordError> {
        Ok(NaturalKey::new()
            .with("title", row.str("entry_name")?.trim())
            .with("slug", entry_slug(row)?))
    }

    fn transform(&self, row: &SourceRow, refs: &ResolvedRefs) -> Result<TargetRecord, RecordError> {
        let status = match row.opt_str("entry_status") {
            Some("published") | None => "published",
            Some(_) => "draft",
        };

        Ok(TargetRecord::new(fields(json!({
            "user_id": refs.require("entry_author_id")?,
            "title": row.str("entry_name")?.trim(),
            "slug": entry_slug(row)?,
            "body": clean_html(row.str("entry_content")?),
            "status": status,
            "is_featured": row.flag("entry_featured"),
            "views": row.opt_i64("entry_views")?.unwrap_or(0),
            "published_at": timestamp(row, "entry_date")?,
        }))))
    }

    fn describe(&self, row: &SourceRow) -> Detail {
        detail([("title", row.get("entry_name").clone())])
    }
}

/// Approved comments only; queued and hidden ones stay behind.
pub struct BlogCommentPolicy;

impl EntityPolicy for BlogCommentPolicy {
    fn entity(&self) -> EntityId {
        EntityId::BLOG_COMMENTS
    }

    fn source(&self) -> SourceQuery {
        SourceQuery::new("blog_comments", "comment_id")
            .filter(Filter::Eq("comment_approved", json!(1)))
    }

    fn references(&self) -> Vec<Reference> {
        vec![
            Reference::required("comment_entry_id", EntityId::BLOGS, "blog"),
            Reference::required("comment_member_id", EntityId::USERS, "user"),
        ]
    }

    fn natural_key(&self, row: &SourceRow, refs: &ResolvedRefs) -> Result<NaturalKey, RecordError> {
        Ok(NaturalKey::new()
            .with("blog_id", refs.require("comment_entry_id")?)
            .with("user_id", refs.require("comment_member_id")?)
            .with("created_at", timestamp(row, "comment_date")?))
    }

    fn transform(&self, row: &SourceRow, refs: &ResolvedRefs) -> Result<TargetRecord, RecordError> {
        Ok(TargetRecord::new(fields(json!({
            "blog_id": refs.require("comment_entry_id")?,
            "user_id": refs.require("comment_member_id")?,
            "body": clean_html(row.str("comment_text")?),
            "created_at": timestamp(row, "comment_date")?,
        }))))
    }

    fn describe(&self, row: &SourceRow) -> Detail {
        detail([("blog_id", row.get("comment_entry_id").clone())])
    }
}
