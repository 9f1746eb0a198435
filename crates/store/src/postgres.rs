//! Postgres-backed implementation of [`Store`], using `sqlx` against the
//! `events_seen` and `agg_1m` tables of §6.

use async_trait::async_trait;
use model::{AggregateRecord, DiagnosisLabel, PercentilePair, StageErrorCounters, WindowKey};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};

use crate::{Error, RetentionReport, Store};

/// Connects to Postgres and runs the schema migration statements this crate
/// depends on. The schema itself is small enough (two tables) that it is
/// embedded rather than shipped as a separate migrations directory.
pub async fn connect(database_url: &str) -> Result<PgStore, Error> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(|err| Error::Unavailable { reason: err.to_string() })?;

    PgStore::new(pool).migrate().await
}

/// A [`Store`] backed by a Postgres connection pool.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wraps an existing pool without running migrations.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn migrate(self) -> Result<Self, Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events_seen (
                event_id   TEXT PRIMARY KEY,
                client_id  TEXT NOT NULL,
                ts_ms      BIGINT NOT NULL,
                created_at BIGINT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS events_seen_client_ts_idx ON events_seen (client_id, ts_ms);
            CREATE INDEX IF NOT EXISTS events_seen_created_at_idx ON events_seen (created_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|err| Error::Query {
            operation: "migrate_events_seen",
            reason: err.to_string(),
        })?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agg_1m (
                client_id             TEXT NOT NULL,
                target                TEXT NOT NULL,
                window_start_ts       BIGINT NOT NULL,
                count_total           BIGINT NOT NULL,
                count_success         BIGINT NOT NULL,
                count_error           BIGINT NOT NULL,
                dns_error_count       BIGINT NOT NULL,
                tcp_error_count       BIGINT NOT NULL,
                tls_error_count       BIGINT NOT NULL,
                http_error_count      BIGINT NOT NULL,
                throughput_error_count BIGINT NOT NULL,
                dns_p50               DOUBLE PRECISION,
                dns_p95               DOUBLE PRECISION,
                tcp_p50               DOUBLE PRECISION,
                tcp_p95               DOUBLE PRECISION,
                tls_p50               DOUBLE PRECISION,
                tls_p95               DOUBLE PRECISION,
                ttfb_p50              DOUBLE PRECISION,
                ttfb_p95              DOUBLE PRECISION,
                throughput_p50        DOUBLE PRECISION,
                throughput_p95        DOUBLE PRECISION,
                diagnosis_label       TEXT,
                updated_at            BIGINT NOT NULL,
                PRIMARY KEY (client_id, target, window_start_ts)
            );
            CREATE INDEX IF NOT EXISTS agg_1m_window_start_idx ON agg_1m (window_start_ts);
            CREATE INDEX IF NOT EXISTS agg_1m_diagnosis_label_idx ON agg_1m (diagnosis_label) WHERE diagnosis_label IS NOT NULL;
            CREATE INDEX IF NOT EXISTS agg_1m_recent_history_idx ON agg_1m (client_id, target, window_start_ts DESC);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|err| Error::Query {
            operation: "migrate_agg_1m",
            reason: err.to_string(),
        })?;

        Ok(self)
    }
}

fn diagnosis_label_to_db(label: Option<DiagnosisLabel>) -> Option<&'static str> {
    label.map(|l| l.as_str())
}

fn diagnosis_label_from_db(raw: Option<String>) -> Option<DiagnosisLabel> {
    match raw.as_deref() {
        Some("DNS-bound") => Some(DiagnosisLabel::DnsBound),
        Some("Handshake-bound") => Some(DiagnosisLabel::HandshakeBound),
        Some("Server-bound") => Some(DiagnosisLabel::ServerBound),
        Some("Throughput-bound") => Some(DiagnosisLabel::ThroughputBound),
        _ => None,
    }
}

fn row_to_aggregate(row: sqlx::postgres::PgRow) -> Result<AggregateRecord, Error> {
    let map_err = |operation: &'static str| move |err: sqlx::Error| Error::Query {
        operation,
        reason: err.to_string(),
    };

    Ok(AggregateRecord {
        key: WindowKey {
            client_id: row.try_get("client_id").map_err(map_err("decode_client_id"))?,
            target: row.try_get("target").map_err(map_err("decode_target"))?,
            window_start_ms: row.try_get("window_start_ts").map_err(map_err("decode_window_start"))?,
        },
        count_total: row.try_get::<i64, _>("count_total").map_err(map_err("decode_count_total"))? as u64,
        count_success: row.try_get::<i64, _>("count_success").map_err(map_err("decode_count_success"))? as u64,
        count_error: row.try_get::<i64, _>("count_error").map_err(map_err("decode_count_error"))? as u64,
        stage_errors: StageErrorCounters {
            dns: row.try_get::<i64, _>("dns_error_count").map_err(map_err("decode_dns_error"))? as u64,
            tcp: row.try_get::<i64, _>("tcp_error_count").map_err(map_err("decode_tcp_error"))? as u64,
            tls: row.try_get::<i64, _>("tls_error_count").map_err(map_err("decode_tls_error"))? as u64,
            http: row.try_get::<i64, _>("http_error_count").map_err(map_err("decode_http_error"))? as u64,
            throughput: row
                .try_get::<i64, _>("throughput_error_count")
                .map_err(map_err("decode_throughput_error"))? as u64,
        },
        dns_ms: PercentilePair {
            p50: row.try_get("dns_p50").map_err(map_err("decode_dns_p50"))?,
            p95: row.try_get("dns_p95").map_err(map_err("decode_dns_p95"))?,
        },
        tcp_ms: PercentilePair {
            p50: row.try_get("tcp_p50").map_err(map_err("decode_tcp_p50"))?,
            p95: row.try_get("tcp_p95").map_err(map_err("decode_tcp_p95"))?,
        },
        tls_ms: PercentilePair {
            p50: row.try_get("tls_p50").map_err(map_err("decode_tls_p50"))?,
            p95: row.try_get("tls_p95").map_err(map_err("decode_tls_p95"))?,
        },
        ttfb_ms: PercentilePair {
            p50: row.try_get("ttfb_p50").map_err(map_err("decode_ttfb_p50"))?,
            p95: row.try_get("ttfb_p95").map_err(map_err("decode_ttfb_p95"))?,
        },
        throughput_kbps: PercentilePair {
            p50: row.try_get("throughput_p50").map_err(map_err("decode_throughput_p50"))?,
            p95: row.try_get("throughput_p95").map_err(map_err("decode_throughput_p95"))?,
        },
        diagnosis_label: diagnosis_label_from_db(row.try_get("diagnosis_label").map_err(map_err("decode_label"))?),
        updated_at: row.try_get("updated_at").map_err(map_err("decode_updated_at"))?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn dedup_insert_if_absent(&self, event_id: &str, client_id: &str, ts_ms: i64) -> Result<bool, Error> {
        let result = sqlx::query(
            "INSERT INTO events_seen (event_id, client_id, ts_ms, created_at) \
             VALUES ($1, $2, $3, $4) ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(event_id)
        .bind(client_id)
        .bind(ts_ms)
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .map_err(|err| Error::Query {
            operation: "dedup_insert_if_absent",
            reason: err.to_string(),
        })?;

        Ok(result.rows_affected() == 1)
    }

    async fn upsert_aggregate(&self, record: &AggregateRecord) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO agg_1m (
                client_id, target, window_start_ts,
                count_total, count_success, count_error,
                dns_error_count, tcp_error_count, tls_error_count, http_error_count, throughput_error_count,
                dns_p50, dns_p95, tcp_p50, tcp_p95, tls_p50, tls_p95, ttfb_p50, ttfb_p95,
                throughput_p50, throughput_p95, diagnosis_label, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23
            )
            ON CONFLICT (client_id, target, window_start_ts) DO UPDATE SET
                count_total = EXCLUDED.count_total,
                count_success = EXCLUDED.count_success,
                count_error = EXCLUDED.count_error,
                dns_error_count = EXCLUDED.dns_error_count,
                tcp_error_count = EXCLUDED.tcp_error_count,
                tls_error_count = EXCLUDED.tls_error_count,
                http_error_count = EXCLUDED.http_error_count,
                throughput_error_count = EXCLUDED.throughput_error_count,
                dns_p50 = EXCLUDED.dns_p50, dns_p95 = EXCLUDED.dns_p95,
                tcp_p50 = EXCLUDED.tcp_p50, tcp_p95 = EXCLUDED.tcp_p95,
                tls_p50 = EXCLUDED.tls_p50, tls_p95 = EXCLUDED.tls_p95,
                ttfb_p50 = EXCLUDED.ttfb_p50, ttfb_p95 = EXCLUDED.ttfb_p95,
                throughput_p50 = EXCLUDED.throughput_p50, throughput_p95 = EXCLUDED.throughput_p95,
                diagnosis_label = EXCLUDED.diagnosis_label,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&record.key.client_id)
        .bind(&record.key.target)
        .bind(record.key.window_start_ms)
        .bind(record.count_total as i64)
        .bind(record.count_success as i64)
        .bind(record.count_error as i64)
        .bind(record.stage_errors.dns as i64)
        .bind(record.stage_errors.tcp as i64)
        .bind(record.stage_errors.tls as i64)
        .bind(record.stage_errors.http as i64)
        .bind(record.stage_errors.throughput as i64)
        .bind(record.dns_ms.p50)
        .bind(record.dns_ms.p95)
        .bind(record.tcp_ms.p50)
        .bind(record.tcp_ms.p95)
        .bind(record.tls_ms.p50)
        .bind(record.tls_ms.p95)
        .bind(record.ttfb_ms.p50)
        .bind(record.ttfb_ms.p95)
        .bind(record.throughput_kbps.p50)
        .bind(record.throughput_kbps.p95)
        .bind(diagnosis_label_to_db(record.diagnosis_label))
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|err| Error::Query {
            operation: "upsert_aggregate",
            reason: err.to_string(),
        })?;

        Ok(())
    }

    async fn recent_history(&self, client_id: &str, target: &str, limit: usize) -> Result<Vec<AggregateRecord>, Error> {
        let rows = sqlx::query(
            "SELECT * FROM agg_1m WHERE client_id = $1 AND target = $2 \
             ORDER BY window_start_ts DESC LIMIT $3",
        )
        .bind(client_id)
        .bind(target)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| Error::Query {
            operation: "recent_history",
            reason: err.to_string(),
        })?;

        rows.into_iter().map(row_to_aggregate).collect()
    }

    async fn retention_sweep(&self, dedup_cutoff_ms: i64, aggregate_cutoff_ms: i64) -> Result<RetentionReport, Error> {
        let dedup_result = sqlx::query("DELETE FROM events_seen WHERE created_at < $1")
            .bind(dedup_cutoff_ms)
            .execute(&self.pool)
            .await
            .map_err(|err| Error::Query {
                operation: "retention_sweep_dedup",
                reason: err.to_string(),
            })?;

        let aggregate_result = sqlx::query("DELETE FROM agg_1m WHERE updated_at < $1")
            .bind(aggregate_cutoff_ms)
            .execute(&self.pool)
            .await
            .map_err(|err| Error::Query {
                operation: "retention_sweep_aggregate",
                reason: err.to_string(),
            })?;

        Ok(RetentionReport {
            dedup_rows_deleted: dedup_result.rows_affected(),
            aggregate_rows_deleted: aggregate_result.rows_affected(),
        })
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}
