//! Deterministic-seeded synthetic provider, used by tests and by rule
//! validation dry-runs. Output is seeded from the query so repeated calls
//! with the same input are reproducible.

use async_trait::async_trait;

use super::{ProviderClient, ProviderError, ProviderListing, ProviderQuery, RequestLogSink};

pub struct MockClient;

impl MockClient {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MockClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Small xorshift-style PRNG seeded from a string, so results are stable
/// across runs for a given rule/seed.
struct SeededRng(u64);

impl SeededRng {
    fn from_seed(seed: &str) -> Self {
        let mut h: u64 = 0xcbf29ce484222325;
        for b in seed.bytes() {
            h ^= b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        Self(h.max(1))
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn next_f64_range(&mut self, lo: f64, hi: f64) -> f64 {
        let frac = (self.next_u64() % 1_000_000) as f64 / 1_000_000.0;
        lo + frac * (hi - lo)
    }
}

#[async_trait]
impl ProviderClient for MockClient {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn search(
        &self,
        query: &ProviderQuery,
        limit: u32,
        sink: &dyn RequestLogSink,
    ) -> Result<Vec<ProviderListing>, ProviderError> {
        let seed = query
            .seed
            .clone()
            .unwrap_or_else(|| query.keywords.join(" "));
        let mut rng = SeededRng::from_seed(&seed);
        let count = (rng.next_u64() % 3 + 1).min(limit as u64) as usize;
        let title_base = if query.keywords.is_empty() {
            "Untitled".to_string()
        } else {
            query.keywords.join(" ")
        };

        let listings = (0..count)
            .map(|i| {
                let price = rng.next_f64_range(5.0, 120.0);
                let external_id = format!("mock-{seed}-{i}");
                ProviderListing {
                    provider: "mock".into(),
                    external_id,
                    url: format!("https://mock.invalid/listing/{seed}/{i}"),
                    title: format!("{title_base} (mock #{i})"),
                    price: (price * 100.0).round() / 100.0,
                    currency: "USD".into(),
                    condition: Some("VG+".into()),
                    seller: Some("mock-seller".into()),
                    location: Some("US".into()),
                    discogs_release_id: None,
                    raw: None,
                }
            })
            .collect();

        sink.log(super::ProviderRequestLog {
            provider: "mock".into(),
            endpoint: "mock://search".into(),
            method: "GET".into(),
            status_code: Some(200),
            duration_ms: Some(0),
            error: None,
            attempt: 1,
            total_attempts: 1,
            retry_after_seconds: None,
            rate_limit_remaining: None,
            upstream_request_id: None,
        });

        Ok(listings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSink;
    impl RequestLogSink for NullSink {
        fn log(&self, _entry: super::super::ProviderRequestLog) {}
    }

    #[tokio::test]
    async fn same_seed_yields_same_listings() {
        let client = MockClient::new();
        let query = ProviderQuery {
            keywords: vec!["primus".into(), "frizzle".into()],
            max_price: None,
            seed: Some("rule-123".into()),
        };
        let a = client.search(&query, 5, &NullSink).await.unwrap();
        let b = client.search(&query, 5, &NullSink).await.unwrap();
        assert_eq!(a.len(), b.len());
        assert!(!a.is_empty());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.external_id, y.external_id);
            assert_eq!(x.price, y.price);
        }
    }

    #[tokio::test]
    async fn different_seeds_yield_different_ids() {
        let client = MockClient::new();
        let q1 = ProviderQuery {
            keywords: vec!["primus".into()],
            max_price: None,
            seed: Some("rule-a".into()),
        };
        let q2 = ProviderQuery {
            keywords: vec!["primus".into()],
            max_price: None,
            seed: Some("rule-b".into()),
        };
        let a = client.search(&q1, 5, &NullSink).await.unwrap();
        let b = client.search(&q2, 5, &NullSink).await.unwrap();
        assert_ne!(a[0].external_id, b[0].external_id);
    }
}
