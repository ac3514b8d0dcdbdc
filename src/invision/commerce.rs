//! Store: product groups, packages with their prices, subscription
//! packages, paid invoices and member subscriptions.

use super::transform::{Money, cents, clean_html, fields, interval, json_column, parse_money, slug_for, timestamp};
use crate::error::RecordError;
use crate::migration::cache::CacheScope;
use crate::migration::entity::EntityId;
use crate::migration::outcome::{Detail, detail};
use crate::migration::policy::{EntityPolicy, Reference, ResolvedRefs};
use crate::migration::source::{Filter, SourceQuery, SourceRow};
use crate::migration::target::{Attachment, ChildRecords, Fields, NaturalKey, TargetRecord};
use serde_json::{Value, json};

pub struct ProductCategoryPolicy;

fn category_slug(row: &SourceRow) -> Result<String, RecordError> {
    Ok(slug_for(row, "pg_seo_name", row.str("pg_name")?, "category", row.i64("pg_id")?))
}

impl EntityPolicy for ProductCategoryPolicy {
    fn entity(&self) -> EntityId {
        EntityId::PRODUCT_CATEGORIES
    }

    fn source(&self) -> SourceQuery {
        SourceQuery::new("nexus_package_groups", "pg_id")
    }

    fn cache_scope(&self) -> CacheScope {
        CacheScope::Tagged("store")
    }

    fn key_uses_references(&self) -> bool {
        false
    }

    fn natural_key(&self, row: &SourceRow, _refs: &ResolvedRefs) -> Result<NaturalKey, RecordError> {
        Ok(NaturalKey::new().with("slug", category_slug(row)?))
    }

    fn transform(&self, row: &SourceRow, _refs: &ResolvedRefs) -> Result<TargetRecord, RecordError> {
        Ok(TargetRecord::new(fields(json!({
            "name": row.str("pg_name")?.trim(),
            "slug": category_slug(row)?,
            "position": row.opt_i64("pg_position")?.unwrap_or(0),
        }))))
    }

    fn describe(&self, row: &SourceRow) -> Detail {
        detail([("name", row.get("pg_name").clone())])
    }
}

fn price_row(money: &Money, interval: Option<&str>, count: Option<i64>, is_default: bool) -> Fields {
    fields(json!({
        "currency": money.currency,
        "amount_cents": money.cents,
        "interval": interval,
        "interval_count": count,
        "is_default": is_default,
    }))
}

/// One-off base prices followed by one row per renewal term and currency.
fn product_prices(row: &SourceRow) -> Result<Vec<Fields>, RecordError> {
    let mut rows: Vec<Fields> = parse_money("p_base_price", &json_column(row, "p_base_price")?)?
        .iter()
        .enumerate()
        .map(|(i, money)| price_row(money, None, None, i == 0))
        .collect();

    if let Value::Array(options) = json_column(row, "p_renew_options")? {
        for option in &options {
            let unit = option.get("unit").and_then(Value::as_str).unwrap_or_default();
            let Some(interval) = interval(unit) else {
                return Err(RecordError::invalid_field(
                    "p_renew_options",
                    format!("unknown renewal unit '{}'", unit),
                ));
            };
            let term = option.get("term").and_then(Value::as_i64).unwrap_or(1);
            let cost = option.get("cost").cloned().unwrap_or(Value::Null);
            for money in parse_money("p_renew_options", &cost)? {
                rows.push(price_row(&money, Some(interval), Some(term), false));
            }
        }
    }

    Ok(rows)
}

fn product_slug(row: &SourceRow) -> Result<String, RecordError> {
    Ok(slug_for(row, "p_seo_name", row.str("p_name")?, "product", row.i64("p_id")?))
}

pub struct ProductPolicy;

impl EntityPolicy for ProductPolicy {
    fn entity(&self) -> EntityId {
        EntityId::PRODUCTS
    }

    fn source(&self) -> SourceQuery {
        SourceQuery::new("nexus_packages", "p_id")
    }

    fn cache_scope(&self) -> CacheScope {
        CacheScope::Tagged("store")
    }

    fn references(&self) -> Vec<Reference> {
        vec![Reference::optional("p_group", EntityId::PRODUCT_CATEGORIES, "product category")]
    }

    fn key_uses_references(&self) -> bool {
        false
    }

    fn natural_key(&self, row: &SourceRow, _refs: &ResolvedRefs) -> Result<NaturalKey, RecordError> {
        Ok(NaturalKey::new().with("slug", product_slug(row)?))
    }

    fn transform(&self, row: &SourceRow, refs: &ResolvedRefs) -> Result<TargetRecord, RecordError> {
        let stock = row.opt_i64("p_stock")?.filter(|stock| *stock >= 0);
        let mut record = TargetRecord::new(fields(json!({
            "name": row.str("p_name")?.trim(),
            "slug": product_slug(row)?,
            "description": row.opt_str("p_desc").map(clean_html),
            "is_visible": row.flag("p_store"),
            "stock": stock,
            "created_at": timestamp(row, "p_date_added")?,
        })))
        .with_children(ChildRecords {
            entity: EntityId::PRODUCT_PRICES,
            parent_field: "product_id",
            rows: product_prices(row)?,
        });

        if let Some(category_id) = refs.get("p_group") {
            record = record.with_attachment(Attachment {
                relation: "category_product",
                owner_field: "product_id",
                other_field: "category_id",
                other_id: category_id,
            });
        }
        Ok(record)
    }

    fn describe(&self, row: &SourceRow) -> Detail {
        detail([("name", row.get("p_name").clone())])
    }
}

pub struct SubscriptionPolicy;

impl EntityPolicy for SubscriptionPolicy {
    fn entity(&self) -> EntityId {
        EntityId::SUBSCRIPTIONS
    }

    fn source(&self) -> SourceQuery {
        SourceQuery::new("nexus_member_subscription_packages", "sp_id")
    }

    fn key_uses_references(&self) -> bool {
        false
    }

    fn natural_key(&self, row: &SourceRow, _refs: &ResolvedRefs) -> Result<NaturalKey, RecordError> {
        Ok(NaturalKey::new().with("slug", subscription_slug(row)?))
    }

    fn transform(&self, row: &SourceRow, _refs: &ResolvedRefs) -> Result<TargetRecord, RecordError> {
        let price = parse_money("sp_price", &json_column(row, "sp_price")?)?
            .into_iter()
            .next();
        let renewal = json_column(row, "sp_renew_options")?;
        let unit = renewal.get("unit").and_then(Value::as_str);
        let interval = match unit {
            Some(unit) => Some(interval(unit).ok_or_else(|| {
                RecordError::invalid_field("sp_renew_options", format!("unknown renewal unit '{}'", unit))
            })?),
            None => None,
        };

        Ok(TargetRecord::new(fields(json!({
            "name": row.str("sp_name")?.trim(),
            "slug": subscription_slug(row)?,
            "currency": price.as_ref().map(|p| p.currency.clone()),
            "price_cents": price.as_ref().map_or(0, |p| p.cents),
            "interval": interval,
            "interval_count": renewal.get("term").and_then(Value::as_i64),
            "is_active": row.flag("sp_enabled"),
            "position": row.opt_i64("sp_position")?.unwrap_or(0),
        }))))
    }

    fn describe(&self, row: &SourceRow) -> Detail {
        detail([("name", row.get("sp_name").clone())])
    }
}

fn subscription_slug(row: &SourceRow) -> Result<String, RecordError> {
    Ok(slug_for(row, "sp_seo_name", row.str("sp_name")?, "subscription", row.i64("sp_id")?))
}

/// Paid invoices become orders, their line items order items.
pub struct OrderPolicy {
    /// Give invoices without line items one item covering the total.
    pub placeholder_items: bool,
}

/// Line items of an invoice, from the `i_items` JSON list.
fn invoice_items(row: &SourceRow) -> Result<Vec<Value>, RecordError> {
    match json_column(row, "i_items")? {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        Value::Object(items) => Ok(items.into_iter().map(|(_, item)| item).collect()),
        other => Err(RecordError::invalid_field(
            "i_items",
            format!("expected a list, got {}", other),
        )),
    }
}

fn item_product_id(item: &Value) -> Option<i64> {
    let is_package = item.get("app").and_then(Value::as_str).is_none_or(|app| app == "nexus")
        && item.get("type").and_then(Value::as_str).is_none_or(|t| t == "package");
    if !is_package {
        return None;
    }
    match item.get("itemID")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn item_cents(item: &Value) -> Result<i64, RecordError> {
    let cost = match item.get("cost") {
        None | Some(Value::Null) => return Ok(0),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    }
    .ok_or_else(|| RecordError::invalid_field("i_items", "invalid item cost"))?;
    Ok((cost * 100.0).round() as i64)
}

impl OrderPolicy {
    fn items(&self, row: &SourceRow, refs: &ResolvedRefs) -> Result<Vec<Fields>, RecordError> {
        let mut rows = Vec::new();
        for item in invoice_items(row)? {
            let product_id = item_product_id(&item).and_then(|id| refs.lookup(EntityId::PRODUCTS, id));
            rows.push(fields(json!({
                "product_id": product_id,
                "name": item.get("itemName").and_then(Value::as_str).unwrap_or("Item"),
                "quantity": item.get("quantity").and_then(Value::as_i64).unwrap_or(1),
                "unit_price_cents": item_cents(&item)?,
            })));
        }

        if rows.is_empty() && self.placeholder_items {
            let id = row.i64("i_id")?;
            let name = row
                .opt_str("i_title")
                .filter(|t| !t.trim().is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("Invoice #{}", id));
            rows.push(fields(json!({
                "product_id": null,
                "name": name,
                "quantity": 1,
                "unit_price_cents": cents(row, "i_total")?,
            })));
        }
        Ok(rows)
    }
}

impl EntityPolicy for OrderPolicy {
    fn entity(&self) -> EntityId {
        EntityId::ORDERS
    }

    fn source(&self) -> SourceQuery {
        SourceQuery::new("nexus_invoices", "i_id").filter(Filter::Eq("i_status", json!("paid")))
    }

    fn references(&self) -> Vec<Reference> {
        vec![Reference::required("i_member", EntityId::USERS, "user")]
    }

    fn lookups(&self, row: &SourceRow) -> Result<Vec<(EntityId, i64)>, RecordError> {
        Ok(invoice_items(row)?
            .iter()
            .filter_map(item_product_id)
            .map(|id| (EntityId::PRODUCTS, id))
            .collect())
    }

    fn key_uses_references(&self) -> bool {
        false
    }

    fn natural_key(&self, row: &SourceRow, _refs: &ResolvedRefs) -> Result<NaturalKey, RecordError> {
        Ok(NaturalKey::new().with("reference", format!("INV-{}", row.i64("i_id")?)))
    }

    fn transform(&self, row: &SourceRow, refs: &ResolvedRefs) -> Result<TargetRecord, RecordError> {
        Ok(TargetRecord::new(fields(json!({
            "user_id": refs.require("i_member")?,
            "reference": format!("INV-{}", row.i64("i_id")?),
            "status": "paid",
            "currency": row.opt_str("i_currency").unwrap_or("USD").to_uppercase(),
            "total_cents": cents(row, "i_total")?,
            "created_at": timestamp(row, "i_date")?,
            "paid_at": timestamp(row, "i_paid")?,
        })))
        .with_children(ChildRecords {
            entity: EntityId::ORDER_ITEMS,
            parent_field: "order_id",
            rows: self.items(row, refs)?,
        }))
    }

    fn describe(&self, row: &SourceRow) -> Detail {
        detail([
            ("invoice", row.get("i_id").clone()),
            ("total", row.get("i_total").clone()),
        ])
    }
}

pub struct UserSubscriptionPolicy;

impl EntityPolicy for UserSubscriptionPolicy {
    fn entity(&self) -> EntityId {
        EntityId::USER_SUBSCRIPTIONS
    }

    fn source(&self) -> SourceQuery {
        SourceQuery::new("nexus_member_subscriptions", "sub_id")
    }

    fn references(&self) -> Vec<Reference> {
        vec![
            Reference::required("sub_member_id", EntityId::USERS, "user"),
            Reference::required("sub_package_id", EntityId::SUBSCRIPTIONS, "subscription"),
            Reference::optional("sub_invoice_id", EntityId::ORDERS, "order"),
        ]
    }

    fn natural_key(&self, row: &SourceRow, refs: &ResolvedRefs) -> Result<NaturalKey, RecordError> {
        Ok(NaturalKey::new()
            .with("user_id", refs.require("sub_member_id")?)
            .with("subscription_id", refs.require("sub_package_id")?)
            .with("starts_at", timestamp(row, "sub_start")?))
    }

    fn transform(&self, row: &SourceRow, refs: &ResolvedRefs) -> Result<TargetRecord, RecordError> {
        let status = if row.flag("sub_active") { "active" } else { "expired" };
        Ok(TargetRecord::new(fields(json!({
            "user_id": refs.require("sub_member_id")?,
            "subscription_id": refs.require("sub_package_id")?,
            "order_id": refs.get("sub_invoice_id"),
            "status": status,
            "starts_at": timestamp(row, "sub_start")?,
            "ends_at": timestamp(row, "sub_expire")?,
        }))))
    }

    fn describe(&self, row: &SourceRow) -> Detail {
        detail([
            ("member_id", row.get("sub_member_id").clone()),
            ("package_id", row.get("sub_package_id").clone()),
        ])
    }
}
