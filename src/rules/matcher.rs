//! Rule-matching predicate and duplicate-safe match creation.

use chrono::Utc;
use serde_json::json;

use crate::events::{Event, EventType, NewEvent};
use crate::notifications::fanout::fan_out_event;
use crate::store::listings::Listing;
use crate::store::rules::WatchRule;
use crate::store::Store;

/// Evaluate a rule's filter predicate against a listing. All three clauses
/// must hold. `user_currency` is the user's account-level currency, used as
/// the fallback when the rule itself doesn't declare one. A currency
/// mismatch is a hard no-match — there is no automatic conversion
/// anywhere in this crate.
pub fn rule_matches_listing(rule: &WatchRule, listing: &Listing, user_currency: Option<&str>) -> bool {
    if !rule.query.sources.iter().any(|s| s.eq_ignore_ascii_case(&listing.provider)) {
        return false;
    }

    if let Some(max_price) = rule.query.max_price {
        let expected_currency = rule.query.currency.as_deref().or(user_currency);
        match expected_currency {
            Some(expected) if expected.eq_ignore_ascii_case(&listing.currency) => {}
            _ => return false,
        }
        if listing.price > max_price {
            return false;
        }
    }

    let normalized_title = listing.normalized_title.as_deref().unwrap_or("");
    rule.query.keywords.iter().all(|kw| {
        let kw = kw.trim();
        !kw.is_empty() && normalized_title.contains(&kw.to_lowercase())
    })
}

/// If `rule` matches `listing` and no (rule, listing) match yet exists,
/// insert a match row and a `NEW_MATCH` event in the same unit of work,
/// then fan the event out to notifications. A unique-constraint conflict on
/// either insert is treated as "already done" and yields
/// `Ok(None)` rather than an error.
pub fn create_match_if_needed(
    store: &Store,
    rule: &WatchRule,
    listing: &Listing,
    user_currency: Option<&str>,
) -> anyhow::Result<Option<Event>> {
    if !rule_matches_listing(rule, listing, user_currency) {
        return Ok(None);
    }
    if store.find_match(rule.id, listing.id)?.is_some() {
        return Ok(None);
    }

    let match_context = json!({
        "rule_name": rule.name,
        "matched_keywords": rule.query.keywords,
        "listing_price": listing.price,
        "listing_currency": listing.currency,
    });

    let inserted = store.insert_match_if_absent(rule.id, listing.id, Utc::now(), Some(&match_context))?;
    let Some(_match_id) = inserted else {
        return Ok(None);
    };

    let new_event = NewEvent::new(rule.user_id, EventType::NewMatch)
        .with_rule(rule.id)
        .with_listing(listing.id)
        .with_payload(json!({
            "rule_name": rule.name,
            "listing_title": listing.title,
            "listing_price": listing.price,
            "listing_currency": listing.currency,
            "listing_url": listing.url,
        }));

    let Some(event) = store.insert_event(&new_event)? else {
        return Ok(None);
    };

    fan_out_event(store, &event)?;
    Ok(Some(event))
}
