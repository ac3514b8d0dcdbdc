//! Members, groups and group memberships.

use super::transform::{fields, slug_for, timestamp};
use crate::error::RecordError;
use crate::migration::cache::CacheScope;
use crate::migration::entity::EntityId;
use crate::migration::outcome::{Detail, detail};
use crate::migration::policy::{EntityPolicy, Reference, ResolvedRefs};
use crate::migration::source::{SourceQuery, SourceRow};
use crate::migration::target::{NaturalKey, TargetRecord};
use serde_json::json;

pub struct UserPolicy;

impl EntityPolicy for UserPolicy {
    fn entity(&self) -> EntityId {
        EntityId::USERS
    }

    fn source(&self) -> SourceQuery {
        SourceQuery::new("core_members", "member_id")
    }

    /// Member identities never change, so their mappings outlive cleanups.
    fn cache_scope(&self) -> CacheScope {
        CacheScope::Forever
    }

    fn natural_key(&self, row: &SourceRow, _refs: &ResolvedRefs) -> Result<NaturalKey, RecordError> {
        Ok(NaturalKey::new().with("email", normalized_email(row)?))
    }

    fn transform(&self, row: &SourceRow, _refs: &ResolvedRefs) -> Result<TargetRecord, RecordError> {
        let name = row.str("name")?.trim();
        if name.is_empty() {
            return Err(RecordError::invalid_field("name", "empty display name"));
        }

        Ok(TargetRecord::new(fields(json!({
            "name": name,
            "email": normalized_email(row)?,
            "created_at": timestamp(row, "joined")?,
            "last_seen_at": timestamp(row, "last_visit")?,
            "is_banned": row.opt_i64("temp_ban")?.is_some_and(|ban| ban != 0),
        }))))
    }

    fn describe(&self, row: &SourceRow) -> Detail {
        detail([("name", row.get("name").clone()), ("email", row.get("email").clone())])
    }
}

fn normalized_email(row: &SourceRow) -> Result<String, RecordError> {
    let email = row.str("email")?.trim().to_lowercase();
    if !email.contains('@') {
        return Err(RecordError::invalid_field("email", format!("'{}' is not an address", email)));
    }
    Ok(email)
}

pub struct GroupPolicy;

impl EntityPolicy for GroupPolicy {
    fn entity(&self) -> EntityId {
        EntityId::GROUPS
    }

    fn source(&self) -> SourceQuery {
        SourceQuery::new("core_groups", "g_id")
    }

    fn natural_key(&self, row: &SourceRow, _refs: &ResolvedRefs) -> Result<NaturalKey, RecordError> {
        Ok(NaturalKey::new().with("slug", group_slug(row)?))
    }

    fn transform(&self, row: &SourceRow, _refs: &ResolvedRefs) -> Result<TargetRecord, RecordError> {
        Ok(TargetRecord::new(fields(json!({
            "name": row.str("g_title")?.trim(),
            "slug": group_slug(row)?,
            "is_admin": row.flag("g_access_cp"),
        }))))
    }

    fn describe(&self, row: &SourceRow) -> Detail {
        detail([("name", row.get("g_title").clone())])
    }
}

fn group_slug(row: &SourceRow) -> Result<String, RecordError> {
    Ok(slug_for(row, "g_title_seo", row.str("g_title")?, "group", row.i64("g_id")?))
}

/// Primary group of each member, written to the membership pivot.
pub struct GroupMemberPolicy;

impl EntityPolicy for GroupMemberPolicy {
    fn entity(&self) -> EntityId {
        EntityId::GROUP_MEMBERS
    }

    fn source(&self) -> SourceQuery {
        SourceQuery::new("core_members", "member_id")
    }

    /// Pivot rows are never referenced by id.
    fn cache_scope(&self) -> CacheScope {
        CacheScope::None
    }

    fn references(&self) -> Vec<Reference> {
        vec![
            Reference::required("member_id", EntityId::USERS, "user"),
            Reference::required("member_group_id", EntityId::GROUPS, "group"),
        ]
    }

    fn natural_key(&self, _row: &SourceRow, refs: &ResolvedRefs) -> Result<NaturalKey, RecordError> {
        Ok(NaturalKey::new()
            .with("user_id", refs.require("member_id")?)
            .with("group_id", refs.require("member_group_id")?))
    }

    fn transform(&self, _row: &SourceRow, refs: &ResolvedRefs) -> Result<TargetRecord, RecordError> {
        Ok(TargetRecord::new(fields(json!({
            "user_id": refs.require("member_id")?,
            "group_id": refs.require("member_group_id")?,
        }))))
    }

    fn describe(&self, row: &SourceRow) -> Detail {
        detail([
            ("member_id", row.get("member_id").clone()),
            ("group_id", row.get("member_group_id").clone()),
        ])
    }
}
