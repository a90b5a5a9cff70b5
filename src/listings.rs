//! Listing ingest: normalization + the create/update + snapshot policy.

use chrono::Utc;
use uuid::Uuid;

use crate::providers::ProviderListing;
use crate::store::listings::Listing;
use crate::store::Store;

/// Lowercase, collapse non-alphanumerics to spaces, trim and collapse runs of spaces.
pub fn normalize_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut last_was_space = false;
    for ch in title.to_lowercase().chars() {
        if ch.is_alphanumeric() {
            out.push(ch);
            last_was_space = false;
        } else if !last_was_space {
            out.push(' ');
            last_was_space = true;
        }
    }
    out.trim().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    UpdatedWithPriceChange,
    UpdatedNoPriceChange,
}

pub struct UpsertResult {
    pub listing: Listing,
    pub outcome: UpsertOutcome,
}

/// Insert a brand-new listing or refresh an existing one keyed by
/// `(provider, external_id)`. A price snapshot is always recorded on create;
/// on update a snapshot is recorded only if the price actually changed.
pub fn upsert_listing(store: &Store, incoming: &ProviderListing) -> anyhow::Result<UpsertResult> {
    let normalized_title = normalize_title(&incoming.title);
    let now = Utc::now();

    match store.find_listing_by_provider_external(&incoming.provider, &incoming.external_id)? {
        None => {
            let listing = Listing {
                id: Uuid::new_v4(),
                provider: incoming.provider.clone(),
                external_id: incoming.external_id.clone(),
                url: incoming.url.clone(),
                title: incoming.title.clone(),
                normalized_title: Some(normalized_title),
                price: incoming.price,
                currency: incoming.currency.clone(),
                condition: incoming.condition.clone(),
                seller: incoming.seller.clone(),
                location: incoming.location.clone(),
                status: "active".to_string(),
                discogs_release_id: incoming.discogs_release_id,
                discogs_master_id: None,
                first_seen_at: now,
                last_seen_at: now,
                raw: incoming.raw.clone(),
            };
            store.insert_listing(&listing)?;
            store.insert_price_snapshot(listing.id, listing.price, &listing.currency)?;
            Ok(UpsertResult {
                listing,
                outcome: UpsertOutcome::Created,
            })
        }
        Some(mut listing) => {
            let price_changed = (listing.price - incoming.price).abs() > f64::EPSILON;

            listing.url = incoming.url.clone();
            listing.title = incoming.title.clone();
            listing.normalized_title = Some(normalized_title);
            listing.price = incoming.price;
            listing.currency = incoming.currency.clone();
            listing.condition = incoming.condition.clone();
            listing.seller = incoming.seller.clone();
            listing.location = incoming.location.clone();
            listing.status = "active".to_string();
            listing.discogs_release_id = incoming.discogs_release_id;
            listing.last_seen_at = now;
            listing.raw = incoming.raw.clone();

            store.update_listing(&listing)?;

            let outcome = if price_changed {
                store.insert_price_snapshot(listing.id, listing.price, &listing.currency)?;
                UpsertOutcome::UpdatedWithPriceChange
            } else {
                UpsertOutcome::UpdatedNoPriceChange
            };

            Ok(UpsertResult { listing, outcome })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_punctuation() {
        assert_eq!(
            normalize_title("Primus - Frizzle Fry (Vinyl, LP)!!"),
            "primus frizzle fry vinyl lp"
        );
    }

    #[test]
    fn collapses_whitespace_runs() {
        assert_eq!(normalize_title("  A   B  "), "a b");
    }

    #[test]
    fn upsert_creates_on_first_sight() {
        let store = Store::open_in_memory().unwrap();
        let incoming = ProviderListing {
            provider: "discogs".into(),
            external_id: "abc123".into(),
            url: "https://example.com/abc123".into(),
            title: "Primus - Frizzle Fry".into(),
            price: 42.0,
            currency: "USD".into(),
            condition: None,
            seller: None,
            location: None,
            discogs_release_id: None,
            raw: None,
        };
        let result = upsert_listing(&store, &incoming).unwrap();
        assert_eq!(result.outcome, UpsertOutcome::Created);
        assert_eq!(store.count_price_snapshots(result.listing.id).unwrap(), 1);
    }

    #[test]
    fn upsert_snapshots_only_on_price_change() {
        let store = Store::open_in_memory().unwrap();
        let mut incoming = ProviderListing {
            provider: "discogs".into(),
            external_id: "abc123".into(),
            url: "https://example.com/abc123".into(),
            title: "Primus - Frizzle Fry".into(),
            price: 42.0,
            currency: "USD".into(),
            condition: None,
            seller: None,
            location: None,
            discogs_release_id: None,
            raw: None,
        };
        let first = upsert_listing(&store, &incoming).unwrap();

        // same price, re-seen: no new snapshot
        let again = upsert_listing(&store, &incoming).unwrap();
        assert_eq!(again.outcome, UpsertOutcome::UpdatedNoPriceChange);
        assert_eq!(store.count_price_snapshots(first.listing.id).unwrap(), 1);

        // price changed: one more snapshot
        incoming.price = 39.99;
        let changed = upsert_listing(&store, &incoming).unwrap();
        assert_eq!(changed.outcome, UpsertOutcome::UpdatedWithPriceChange);
        assert_eq!(store.count_price_snapshots(first.listing.id).unwrap(), 2);
    }
}
