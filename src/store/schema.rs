//! SQLite schema migrations.
//! Mission: `CREATE TABLE IF NOT EXISTS` for every aggregate, run once at startup.
//! There is no separate migration tool here — this crate only ever adds
//! columns/tables forward.

use rusqlite::Connection;

pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA foreign_keys = ON;
        PRAGMA journal_mode = WAL;

        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            hashed_password TEXT NOT NULL,
            display_name TEXT,
            timezone TEXT,
            currency TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS external_account_links (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            provider TEXT NOT NULL,
            external_user_id TEXT NOT NULL,
            access_token TEXT,
            refresh_token TEXT,
            access_token_expires_at TEXT,
            token_type TEXT,
            scopes TEXT,
            token_metadata TEXT,
            connected_at TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (user_id, provider)
        );
        CREATE INDEX IF NOT EXISTS ix_external_account_links_provider_external_user
            ON external_account_links (provider, external_user_id);

        CREATE TABLE IF NOT EXISTS import_jobs (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            external_account_link_id TEXT REFERENCES external_account_links(id) ON DELETE SET NULL,
            provider TEXT NOT NULL,
            import_scope TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            cursor TEXT,
            page INTEGER NOT NULL DEFAULT 1,
            processed_count INTEGER NOT NULL DEFAULT 0,
            imported_count INTEGER NOT NULL DEFAULT 0,
            created_count INTEGER NOT NULL DEFAULT 0,
            updated_count INTEGER NOT NULL DEFAULT 0,
            error_count INTEGER NOT NULL DEFAULT 0,
            errors TEXT,
            started_at TEXT,
            completed_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS ix_import_jobs_user_created ON import_jobs (user_id, created_at);
        CREATE INDEX IF NOT EXISTS ix_import_jobs_status ON import_jobs (status);
        -- single-flight: at most one active (pending/running) job per (user, provider, scope)
        CREATE UNIQUE INDEX IF NOT EXISTS uq_import_jobs_active_scope
            ON import_jobs (user_id, provider, import_scope)
            WHERE status IN ('pending', 'running');

        CREATE TABLE IF NOT EXISTS watch_releases (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            discogs_release_id INTEGER NOT NULL,
            discogs_master_id INTEGER,
            match_mode TEXT NOT NULL DEFAULT 'exact_release',
            title TEXT NOT NULL,
            artist TEXT,
            year INTEGER,
            target_price REAL,
            currency TEXT NOT NULL DEFAULT 'USD',
            min_condition TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            imported_from_wantlist INTEGER NOT NULL DEFAULT 0,
            imported_from_collection INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS ix_watch_releases_user_active ON watch_releases (user_id, is_active);
        -- partial uniqueness: exact_release rows are unique per (user, release);
        -- master_release rows are unique per (user, master) instead.
        CREATE UNIQUE INDEX IF NOT EXISTS uq_watch_releases_exact
            ON watch_releases (user_id, discogs_release_id)
            WHERE match_mode = 'exact_release';
        CREATE UNIQUE INDEX IF NOT EXISTS uq_watch_releases_master
            ON watch_releases (user_id, discogs_master_id)
            WHERE match_mode = 'master_release';

        CREATE TABLE IF NOT EXISTS watch_search_rules (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            query TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            poll_interval_seconds INTEGER NOT NULL DEFAULT 600,
            last_run_at TEXT,
            next_run_at TEXT,
            claim_token TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS ix_watch_search_rules_user_active ON watch_search_rules (user_id, is_active);
        CREATE INDEX IF NOT EXISTS ix_watch_search_rules_next_run ON watch_search_rules (next_run_at);

        CREATE TABLE IF NOT EXISTS listings (
            id TEXT PRIMARY KEY,
            provider TEXT NOT NULL,
            external_id TEXT NOT NULL,
            url TEXT NOT NULL,
            title TEXT NOT NULL,
            normalized_title TEXT,
            price REAL NOT NULL CHECK (price >= 0),
            currency TEXT NOT NULL DEFAULT 'USD',
            condition TEXT,
            seller TEXT,
            location TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            discogs_release_id INTEGER,
            discogs_master_id INTEGER,
            first_seen_at TEXT NOT NULL,
            last_seen_at TEXT NOT NULL,
            raw TEXT,
            UNIQUE (provider, external_id)
        );
        CREATE INDEX IF NOT EXISTS ix_listings_provider_status_last_seen
            ON listings (provider, status, last_seen_at);
        CREATE INDEX IF NOT EXISTS ix_listings_discogs_release_id ON listings (discogs_release_id);

        CREATE TABLE IF NOT EXISTS watch_matches (
            id TEXT PRIMARY KEY,
            rule_id TEXT NOT NULL REFERENCES watch_search_rules(id) ON DELETE CASCADE,
            listing_id TEXT NOT NULL REFERENCES listings(id) ON DELETE CASCADE,
            matched_at TEXT NOT NULL,
            match_context TEXT,
            UNIQUE (rule_id, listing_id)
        );
        CREATE INDEX IF NOT EXISTS ix_watch_matches_rule_matched_at ON watch_matches (rule_id, matched_at);

        CREATE TABLE IF NOT EXISTS events (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            type TEXT NOT NULL,
            watch_release_id TEXT REFERENCES watch_releases(id) ON DELETE SET NULL,
            rule_id TEXT REFERENCES watch_search_rules(id) ON DELETE SET NULL,
            listing_id TEXT REFERENCES listings(id) ON DELETE SET NULL,
            payload TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS ix_events_user_created_at ON events (user_id, created_at);
        CREATE INDEX IF NOT EXISTS ix_events_type_created_at ON events (type, created_at);
        -- NEW_MATCH is idempotent per (user, watch_release, listing) when both
        -- references are present; rule-scoped matches have no watch_release_id
        -- and fall outside this index (uniqueness there is the watch_matches table).
        CREATE UNIQUE INDEX IF NOT EXISTS uq_events_new_match
            ON events (user_id, type, watch_release_id, listing_id)
            WHERE type = 'NEW_MATCH' AND watch_release_id IS NOT NULL AND listing_id IS NOT NULL;

        CREATE TABLE IF NOT EXISTS notifications (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            event_id TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
            event_type TEXT NOT NULL,
            channel TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            is_read INTEGER NOT NULL DEFAULT 0,
            attempts INTEGER NOT NULL DEFAULT 0,
            defer_until TEXT,
            delivered_at TEXT,
            failed_at TEXT,
            read_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (event_id, channel)
        );
        CREATE INDEX IF NOT EXISTS ix_notifications_user_created_at ON notifications (user_id, created_at);
        CREATE INDEX IF NOT EXISTS ix_notifications_user_read ON notifications (user_id, is_read);
        CREATE INDEX IF NOT EXISTS ix_notifications_status ON notifications (status);

        CREATE TABLE IF NOT EXISTS user_notification_preferences (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL UNIQUE REFERENCES users(id) ON DELETE CASCADE,
            email_enabled INTEGER NOT NULL DEFAULT 1,
            realtime_enabled INTEGER NOT NULL DEFAULT 1,
            quiet_hours_start INTEGER,
            quiet_hours_end INTEGER,
            timezone_override TEXT,
            delivery_frequency TEXT NOT NULL DEFAULT 'instant',
            event_toggles TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS price_snapshots (
            id TEXT PRIMARY KEY,
            listing_id TEXT NOT NULL REFERENCES listings(id) ON DELETE CASCADE,
            price REAL NOT NULL CHECK (price >= 0),
            currency TEXT NOT NULL DEFAULT 'USD',
            recorded_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS ix_price_snapshots_listing_recorded_at
            ON price_snapshots (listing_id, recorded_at);

        CREATE TABLE IF NOT EXISTS provider_requests (
            id TEXT PRIMARY KEY,
            user_id TEXT REFERENCES users(id) ON DELETE CASCADE,
            provider TEXT NOT NULL,
            endpoint TEXT NOT NULL,
            method TEXT NOT NULL DEFAULT 'GET',
            status_code INTEGER,
            duration_ms INTEGER,
            error TEXT,
            meta TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS ix_provider_requests_user_created_at
            ON provider_requests (user_id, created_at);
        CREATE INDEX IF NOT EXISTS ix_provider_requests_provider_created_at
            ON provider_requests (provider, created_at);

        CREATE TABLE IF NOT EXISTS outbound_clicks (
            id TEXT PRIMARY KEY,
            listing_id TEXT NOT NULL REFERENCES listings(id) ON DELETE CASCADE,
            user_id TEXT REFERENCES users(id) ON DELETE SET NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS ix_outbound_clicks_listing ON outbound_clicks (listing_id);
        "#,
    )
}
