//! Postgres-backed repository.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use prescale_id::{ClusterId, DatacenterId, EventId, ScheduledHpaId, UpdatedNodePoolId};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::debug;

use super::{DbError, Repository};
use crate::model::{
    ClusterRecord, DatacenterRecord, Event, EventStatus, HpaStatus, NodePoolStatus,
    ScheduledHpaTarget, TargetStatus, UnknownStatus, UpdatedNodePool,
};

const EVENT_COLUMNS: &str = "id, name, start_time, end_time, status, message, calculate_node_pool, cluster_id";

/// Repository over a Postgres pool.
#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_events_starting_before(
        &self,
        status: EventStatus,
        before: DateTime<Utc>,
    ) -> Result<Vec<Event>, DbError> {
        let sql = format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM events
            WHERE status = $1
              AND start_time <= $2
              AND deleted_at IS NULL
            ORDER BY start_time ASC
            "#
        );
        sqlx::query_as::<_, Event>(&sql)
            .bind(status.as_str())
            .bind(before)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::Query)
    }
}

fn decode_status<T>(row: &PgRow, column: &str) -> Result<T, sqlx::Error>
where
    T: std::str::FromStr<Err = UnknownStatus>,
{
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|e: UnknownStatus| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}

impl<'r> FromRow<'r, PgRow> for Event {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: EventId::from_uuid(row.try_get("id")?),
            name: row.try_get("name")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            status: decode_status(row, "status")?,
            message: row.try_get("message")?,
            calculate_node_pool: row.try_get("calculate_node_pool")?,
            cluster_id: ClusterId::from_uuid(row.try_get("cluster_id")?),
        })
    }
}

impl<'r> FromRow<'r, PgRow> for ScheduledHpaTarget {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: ScheduledHpaId::from_uuid(row.try_get("id")?),
            event_id: EventId::from_uuid(row.try_get("event_id")?),
            name: row.try_get("name")?,
            namespace: row.try_get("namespace")?,
            min_replicas: row.try_get("min_pods")?,
            max_replicas: row.try_get("max_pods")?,
            status: decode_status(row, "status")?,
            message: row.try_get("message")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for UpdatedNodePool {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: UpdatedNodePoolId::from_uuid(row.try_get("id")?),
            event_id: EventId::from_uuid(row.try_get("event_id")?),
            node_pool_name: row.try_get("node_pool_name")?,
            max_node: row.try_get("max_node")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for ClusterRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: ClusterId::from_uuid(row.try_get("id")?),
            name: row.try_get("name")?,
            server_endpoint: row.try_get("server_endpoint")?,
            certificate: row.try_get("certificate")?,
            hpa_api_version: row.try_get("latest_hpa_api_version")?,
            datacenter: DatacenterRecord {
                id: DatacenterId::from_uuid(row.try_get("datacenter_id")?),
                name: row.try_get("datacenter_name")?,
                credentials: row.try_get("credentials")?,
            },
        })
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn find_pending_within(
        &self,
        now: DateTime<Utc>,
        horizon: Duration,
    ) -> Result<Vec<Event>, DbError> {
        self.find_events_starting_before(EventStatus::Pending, now + horizon)
            .await
    }

    async fn find_prescaled_within(
        &self,
        now: DateTime<Utc>,
        horizon: Duration,
    ) -> Result<Vec<Event>, DbError> {
        self.find_events_starting_before(EventStatus::Prescaled, now + horizon)
            .await
    }

    async fn finish_watched(&self, now: DateTime<Utc>) -> Result<Vec<EventId>, DbError> {
        let ids = sqlx::query_scalar::<_, prescale_id::Uuid>(
            r#"
            UPDATE events
            SET status = $1, updated_at = now()
            WHERE status = $2
              AND end_time < $3
              AND deleted_at IS NULL
            RETURNING id
            "#,
        )
        .bind(EventStatus::Success.as_str())
        .bind(EventStatus::Watching.as_str())
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        Ok(ids.into_iter().map(EventId::from_uuid).collect())
    }

    async fn transition_event(
        &self,
        id: EventId,
        from: EventStatus,
        to: EventStatus,
    ) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE events
            SET status = $3, updated_at = now()
            WHERE id = $1 AND status = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;

        debug!(event_id = %id, %from, %to, rows = result.rows_affected(), "Event transition");
        Ok(result.rows_affected() == 1)
    }

    async fn set_event_status(
        &self,
        id: EventId,
        status: EventStatus,
        message: &str,
    ) -> Result<(), DbError> {
        let result = sqlx::query(
            "UPDATE events SET status = $2, message = $3, updated_at = now() WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .bind(message)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("event", id));
        }
        Ok(())
    }

    async fn set_event_message(&self, id: EventId, message: &str) -> Result<(), DbError> {
        sqlx::query("UPDATE events SET message = $2, updated_at = now() WHERE id = $1")
            .bind(id.as_uuid())
            .bind(message)
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }

    async fn get_cluster(&self, id: ClusterId) -> Result<ClusterRecord, DbError> {
        sqlx::query_as::<_, ClusterRecord>(
            r#"
            SELECT c.id, c.name, c.server_endpoint, c.certificate, c.latest_hpa_api_version,
                   d.id AS datacenter_id, d.name AS datacenter_name, d.credentials
            FROM clusters c
            JOIN datacenters d ON d.id = c.datacenter_id
            WHERE c.id = $1
              AND c.deleted_at IS NULL
              AND d.deleted_at IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)?
        .ok_or_else(|| DbError::not_found("cluster", id))
    }

    async fn list_targets(&self, event_id: EventId) -> Result<Vec<ScheduledHpaTarget>, DbError> {
        sqlx::query_as::<_, ScheduledHpaTarget>(
            r#"
            SELECT id, event_id, name, namespace, min_pods, max_pods, status, message
            FROM scheduled_hpa_configs
            WHERE event_id = $1 AND deleted_at IS NULL
            ORDER BY namespace, name
            "#,
        )
        .bind(event_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    async fn set_target_status(
        &self,
        id: ScheduledHpaId,
        status: TargetStatus,
        message: &str,
    ) -> Result<(), DbError> {
        sqlx::query(
            "UPDATE scheduled_hpa_configs SET status = $2, message = $3, updated_at = now() WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .bind(message)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;
        Ok(())
    }

    async fn insert_updated_node_pools(&self, pools: &[UpdatedNodePool]) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;
        for pool in pools {
            sqlx::query(
                r#"
                INSERT INTO updated_node_pools (id, event_id, node_pool_name, max_node)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (event_id, node_pool_name) DO NOTHING
                "#,
            )
            .bind(pool.id.as_uuid())
            .bind(pool.event_id.as_uuid())
            .bind(&pool.node_pool_name)
            .bind(pool.max_node)
            .execute(&mut *tx)
            .await
            .map_err(DbError::Query)?;
        }
        tx.commit().await.map_err(DbError::Query)?;
        Ok(())
    }

    async fn list_updated_node_pools(
        &self,
        event_id: EventId,
    ) -> Result<Vec<UpdatedNodePool>, DbError> {
        sqlx::query_as::<_, UpdatedNodePool>(
            r#"
            SELECT id, event_id, node_pool_name, max_node
            FROM updated_node_pools
            WHERE event_id = $1
            ORDER BY node_pool_name
            "#,
        )
        .bind(event_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    async fn insert_node_pool_statuses(&self, rows: &[NodePoolStatus]) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;
        for row in rows {
            sqlx::query(
                "INSERT INTO node_pool_statuses (updated_node_pool_id, node_count, created_at) VALUES ($1, $2, $3)",
            )
            .bind(row.updated_node_pool_id.as_uuid())
            .bind(row.node_count)
            .bind(row.created_at)
            .execute(&mut *tx)
            .await
            .map_err(DbError::Query)?;
        }
        tx.commit().await.map_err(DbError::Query)?;
        Ok(())
    }

    async fn insert_hpa_statuses(&self, rows: &[HpaStatus]) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO hpa_statuses
                    (scheduled_hpa_config_id, replicas, available_replicas, ready_replicas,
                     unavailable_replicas, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(row.scheduled_hpa_id.as_uuid())
            .bind(row.replicas)
            .bind(row.available_replicas)
            .bind(row.ready_replicas)
            .bind(row.unavailable_replicas)
            .bind(row.created_at)
            .execute(&mut *tx)
            .await
            .map_err(DbError::Query)?;
        }
        tx.commit().await.map_err(DbError::Query)?;
        Ok(())
    }
}
