//! Listing -> watch-release confidence mapper. When a listing arrives with
//! no `discogs_release_id` of its own, this scores it against a user's
//! active watch releases by token overlap and accepts the best candidate if
//! it clears both an absolute and a relative-margin threshold.

use std::collections::HashSet;

use serde_json::json;
use uuid::Uuid;

use crate::store::listings::Listing;
use crate::store::releases::WatchRelease;
use crate::store::Store;

const TITLE_WEIGHT: f64 = 0.8;
const ARTIST_WEIGHT: f64 = 0.2;
const ACCEPT_THRESHOLD: f64 = 0.82;
const MIN_MARGIN: f64 = 0.10;

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "lp", "ep", "vinyl", "record", "records", "original", "reissue",
];

/// Lowercase, collapse non-alphanumerics to single-word tokens, drop
/// stop-words and empties.
fn tokenize(s: &str) -> HashSet<String> {
    s.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|tok| !tok.is_empty() && !STOP_WORDS.contains(tok))
        .map(|tok| tok.to_string())
        .collect()
}

fn overlap(candidate: &HashSet<String>, listing: &HashSet<String>) -> f64 {
    if candidate.is_empty() {
        return 0.0;
    }
    let shared = candidate.intersection(listing).count();
    shared as f64 / candidate.len() as f64
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

#[derive(Debug, Clone)]
struct Candidate {
    release_id: uuid::Uuid,
    discogs_release_id: i64,
    discogs_master_id: Option<i64>,
    confidence: f64,
    title_overlap: f64,
    artist_overlap: f64,
    title_tokens: Vec<String>,
    artist_tokens: Vec<String>,
}

/// The result of scoring a listing against a user's watch releases.
/// `decision` is always produced (even on no-match) so the caller can
/// persist it into `listing.raw.matching.discogs_mapping` for diagnostics.
pub struct MappingOutcome {
    pub matched: bool,
    pub discogs_release_id: Option<i64>,
    pub discogs_master_id: Option<i64>,
    pub decision: serde_json::Value,
}

/// Score `listing_title` (and an optional `listing_artist`, when the
/// provider surfaces one separately) against every active watch release the
/// user owns, and accept the top candidate if it clears the confidence
/// threshold with a sufficient margin over the runner-up.
pub fn map_listing_to_release(
    listing_title: &str,
    listing_artist: Option<&str>,
    releases: &[WatchRelease],
) -> MappingOutcome {
    let listing_title_tokens = tokenize(listing_title);
    let listing_artist_tokens = listing_artist.map(tokenize).unwrap_or_default();

    let mut candidates: Vec<Candidate> = releases
        .iter()
        .map(|release| {
            let title_tokens = tokenize(&release.title);
            let artist_tokens = release
                .artist
                .as_deref()
                .map(tokenize)
                .unwrap_or_default();

            let title_overlap_raw = overlap(&title_tokens, &listing_title_tokens);
            let artist_overlap_raw = if artist_tokens.is_empty() || listing_artist_tokens.is_empty() {
                0.0
            } else {
                overlap(&artist_tokens, &listing_artist_tokens)
            };
            let confidence = round4(TITLE_WEIGHT * title_overlap_raw + ARTIST_WEIGHT * artist_overlap_raw);
            let title_overlap = round4(title_overlap_raw);
            let artist_overlap = round4(artist_overlap_raw);

            Candidate {
                release_id: release.id,
                discogs_release_id: release.discogs_release_id,
                discogs_master_id: release.discogs_master_id,
                confidence,
                title_overlap,
                artist_overlap,
                title_tokens: sorted(&title_tokens),
                artist_tokens: sorted(&artist_tokens),
            }
        })
        .collect();

    candidates.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap());

    let listing_tokens_json = json!({
        "title_tokens": sorted(&listing_title_tokens),
        "artist_tokens": sorted(&listing_artist_tokens),
    });

    let Some(top) = candidates.first() else {
        return MappingOutcome {
            matched: false,
            discogs_release_id: None,
            discogs_master_id: None,
            decision: json!({
                "matched": false,
                "threshold": ACCEPT_THRESHOLD,
                "min_margin": MIN_MARGIN,
                "candidate_count": 0,
                "listing_tokens": listing_tokens_json,
            }),
        };
    };

    let second_confidence = candidates.get(1).map(|c| c.confidence).unwrap_or(0.0);
    let margin = round4(top.confidence - second_confidence);
    let matched = top.confidence >= ACCEPT_THRESHOLD && margin >= MIN_MARGIN;

    let decision = json!({
        "matched": matched,
        "threshold": ACCEPT_THRESHOLD,
        "min_margin": MIN_MARGIN,
        "candidate_count": candidates.len(),
        "listing_tokens": listing_tokens_json,
        "top_candidate": {
            "watch_release_id": top.release_id,
            "discogs_release_id": top.discogs_release_id,
            "discogs_master_id": top.discogs_master_id,
            "confidence": top.confidence,
            "title_overlap": top.title_overlap,
            "artist_overlap": top.artist_overlap,
            "margin": margin,
            "title_tokens": top.title_tokens,
            "artist_tokens": top.artist_tokens,
        },
    });

    if matched {
        MappingOutcome {
            matched: true,
            discogs_release_id: Some(top.discogs_release_id),
            discogs_master_id: top.discogs_master_id,
            decision,
        }
    } else {
        MappingOutcome {
            matched: false,
            discogs_release_id: None,
            discogs_master_id: None,
            decision,
        }
    }
}

fn sorted(set: &HashSet<String>) -> Vec<String> {
    let mut v: Vec<String> = set.iter().cloned().collect();
    v.sort();
    v
}

/// Entry point the rule runner calls after ingest: if `listing` has no
/// `discogs_release_id` of its own, score it against `user_id`'s active
/// watch releases and persist the decision into
/// `listing.raw.matching.discogs_mapping`, updating the
/// listing's `discogs_release_id`/`discogs_master_id` on acceptance.
/// No-op (and no store write) when the listing already carries a release id.
pub fn enrich_listing_with_release_mapping(
    store: &Store,
    user_id: Uuid,
    listing: &mut Listing,
) -> anyhow::Result<bool> {
    if listing.discogs_release_id.is_some() {
        return Ok(false);
    }

    let releases = store.list_active_releases_for_user(user_id)?;
    let outcome = map_listing_to_release(&listing.title, None, &releases);

    let mut raw = listing.raw.clone().unwrap_or_else(|| json!({}));
    if !raw.is_object() {
        raw = json!({});
    }
    raw["matching"] = json!({ "discogs_mapping": outcome.decision });
    listing.raw = Some(raw);

    if outcome.matched {
        listing.discogs_release_id = outcome.discogs_release_id;
        listing.discogs_master_id = outcome.discogs_master_id;
    }

    store.update_listing(listing)?;
    Ok(outcome.matched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::releases::MatchMode;
    use chrono::Utc;
    use uuid::Uuid;

    fn release(title: &str, artist: Option<&str>, discogs_release_id: i64) -> WatchRelease {
        let now = Utc::now();
        WatchRelease {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            discogs_release_id,
            discogs_master_id: None,
            match_mode: MatchMode::ExactRelease,
            title: title.into(),
            artist: artist.map(|a| a.to_string()),
            year: None,
            target_price: None,
            currency: "USD".into(),
            min_condition: None,
            is_active: true,
            imported_from_wantlist: false,
            imported_from_collection: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn accepts_clear_winner_above_threshold_and_margin() {
        let releases = vec![
            release("Frizzle Fry", Some("Primus"), 111),
            release("Sailing the Seas of Cheese", Some("Primus"), 222),
        ];
        let outcome = map_listing_to_release(
            "Primus - Frizzle Fry (Vinyl, LP)",
            Some("Primus"),
            &releases,
        );
        assert!(outcome.matched);
        assert_eq!(outcome.discogs_release_id, Some(111));
    }

    #[test]
    fn rejects_when_top_two_are_too_close() {
        let releases = vec![release("Greatest Hits", None, 1), release("Greatest Hits Vol 2", None, 2)];
        let outcome = map_listing_to_release("Greatest Hits", None, &releases);
        assert!(!outcome.matched);
        assert_eq!(outcome.discogs_release_id, None);
    }

    #[test]
    fn no_candidates_is_a_clean_no_match() {
        let outcome = map_listing_to_release("Anything", None, &[]);
        assert!(!outcome.matched);
        assert_eq!(outcome.decision["candidate_count"], 0);
    }

    #[test]
    fn rejects_below_absolute_threshold() {
        let releases = vec![release("Completely Different Album", Some("Other Artist"), 5)];
        let outcome = map_listing_to_release("Primus - Frizzle Fry", Some("Primus"), &releases);
        assert!(!outcome.matched);
    }
}
