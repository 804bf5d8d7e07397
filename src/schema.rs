//! Database schema bootstrap.

use anyhow::{Context, Result};
use sqlx::PgPool;

const STATEMENTS: &[(&str, &str)] = &[
    (
        "subscriptions table",
        r"
        CREATE TABLE IF NOT EXISTS subscriptions (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            url TEXT NOT NULL,
            secret BYTEA NOT NULL,
            previous_secret BYTEA,
            secret_rotated_at TIMESTAMPTZ,
            previous_secret_expires_at TIMESTAMPTZ,
            event_types TEXT[] NOT NULL,
            status TEXT NOT NULL,
            timeout_seconds INTEGER NOT NULL DEFAULT 30,
            max_retries INTEGER NOT NULL DEFAULT 3,
            success_count BIGINT NOT NULL DEFAULT 0,
            failure_count BIGINT NOT NULL DEFAULT 0,
            last_triggered_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
    ),
    (
        "deliveries table",
        r"
        CREATE TABLE IF NOT EXISTS deliveries (
            id UUID PRIMARY KEY,
            subscription_id UUID NOT NULL REFERENCES subscriptions(id),
            event_type TEXT NOT NULL,
            payload JSONB NOT NULL,
            status TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            response_code INTEGER,
            response_body TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            completed_at TIMESTAMPTZ
        )
        ",
    ),
    (
        "delivery_tasks table",
        r"
        CREATE TABLE IF NOT EXISTS delivery_tasks (
            delivery_id UUID PRIMARY KEY REFERENCES deliveries(id),
            due_at TIMESTAMPTZ NOT NULL,
            lease_id UUID
        )
        ",
    ),
    (
        "subscriptions rotation index",
        r"
        CREATE INDEX IF NOT EXISTS idx_subscriptions_previous_secret
        ON subscriptions(previous_secret_expires_at)
        WHERE previous_secret IS NOT NULL
        ",
    ),
    (
        "deliveries subscription index",
        r"
        CREATE INDEX IF NOT EXISTS idx_deliveries_subscription
        ON deliveries(subscription_id, created_at DESC)
        ",
    ),
    (
        "delivery_tasks due index",
        r"
        CREATE INDEX IF NOT EXISTS idx_delivery_tasks_due
        ON delivery_tasks(due_at)
        ",
    ),
];

/// Creates tables and indexes that do not exist yet.
pub async fn ensure(pool: &PgPool) -> Result<()> {
    // TODO: move to sqlx::migrate! once the schema needs its first ALTER.
    for (name, sql) in STATEMENTS {
        sqlx::query(sql).execute(pool).await.with_context(|| format!("failed to create {name}"))?;
    }
    Ok(())
}
