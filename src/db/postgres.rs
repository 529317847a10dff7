use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use uuid::Uuid;

use super::{OwnedStrategies, StoreError, StoreResult, StrategyPatch, StrategyState, StrategyStore};
use crate::contract::ContractParams;
use crate::models::{
    ExchangeOrdersDetails, NewStrategy, PendingAction, PositionStatus, Side, StrategyRecord,
};

const STRATEGY_COLUMNS: &str = r#"
    id, uuid, owner_uuid, symbol, side, margin, exchange, enabled, position_status,
    params, exchange_orders_details, comment, pending_action, last_position_at,
    created_at, updated_at
"#;

const PATCH_SQL: &str = r#"
    UPDATE contract_strategies SET
        enabled = COALESCE($2, enabled),
        position_status = COALESCE($3, position_status),
        params = COALESCE($4, params),
        exchange_orders_details = COALESCE($5, exchange_orders_details),
        margin = COALESCE($6, margin),
        comment = COALESCE($7, comment),
        pending_action = CASE WHEN $8 THEN $9 ELSE pending_action END,
        updated_at = NOW()
    WHERE uuid = $1
"#;

/// Postgres persistence for contract strategies
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and run migrations
    ///
    /// # Arguments
    /// * `database_url` - Postgres connection URL
    pub async fn new(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres");

        Ok(Self { pool })
    }

    async fn fetch_one_by_uuid(&self, uuid: Uuid) -> StoreResult<Option<StrategyRecord>> {
        let sql = format!("SELECT {} FROM contract_strategies WHERE uuid = $1", STRATEGY_COLUMNS);
        let row = sqlx::query(&sql).bind(uuid).fetch_optional(&self.pool).await?;
        row.as_ref().map(record_from_row).transpose()
    }
}

/// Decode a row, validating the JSON documents at the boundary
fn record_from_row(row: &PgRow) -> StoreResult<StrategyRecord> {
    let uuid: Uuid = row.try_get("uuid")?;
    let corrupt = |reason: String| StoreError::Corrupt { uuid, reason };

    let side_code: i16 = row.try_get("side")?;
    let side = Side::from_code(side_code).ok_or_else(|| corrupt(format!("invalid side {}", side_code)))?;

    let status_code: i16 = row.try_get("position_status")?;
    let position_status = PositionStatus::from_code(status_code)
        .ok_or_else(|| corrupt(format!("invalid position status {}", status_code)))?;

    let params_document: Value = row.try_get("params")?;
    let params = ContractParams::from_document(&params_document).map_err(|e| corrupt(e.to_string()))?;

    let details_document: Value = row.try_get("exchange_orders_details")?;
    let exchange_orders_details: ExchangeOrdersDetails = serde_json::from_value(details_document)
        .map_err(|e| corrupt(format!("exchange_orders_details: {}", e)))?;

    let pending_action: Option<String> = row.try_get("pending_action")?;
    let pending_action = pending_action
        .map(|value| {
            PendingAction::parse(&value).ok_or_else(|| corrupt(format!("invalid pending action {}", value)))
        })
        .transpose()?;

    let record = StrategyRecord {
        id: row.try_get("id")?,
        uuid,
        owner_uuid: row.try_get("owner_uuid")?,
        symbol: row.try_get("symbol")?,
        side,
        margin: row.try_get::<Decimal, _>("margin")?,
        exchange: row.try_get("exchange")?,
        enabled: row.try_get("enabled")?,
        position_status,
        params,
        exchange_orders_details,
        comment: row.try_get("comment")?,
        pending_action,
        last_position_at: row.try_get::<Option<DateTime<Utc>>, _>("last_position_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    };

    // Still returned so the operator can reset it
    if let Err(reason) = record.check_consistency() {
        tracing::warn!("{}", reason);
    }
    Ok(record)
}

fn patch_details(uuid: Uuid, patch: &StrategyPatch) -> StoreResult<Option<Value>> {
    patch
        .exchange_orders_details
        .as_ref()
        .map(|details: &ExchangeOrdersDetails| {
            serde_json::to_value(details).map_err(|e| StoreError::Corrupt {
                uuid,
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn bind_patch<'q>(
    sql: &'q str,
    uuid: Uuid,
    patch: &'q StrategyPatch,
    details: Option<Value>,
) -> Query<'q, Postgres, PgArguments> {
    sqlx::query(sql)
        .bind(uuid)
        .bind(patch.enabled)
        .bind(patch.position_status.map(PositionStatus::code))
        .bind(patch.params.as_ref().map(ContractParams::to_document))
        .bind(details)
        .bind(patch.margin)
        .bind(patch.comment.as_deref())
        .bind(patch.pending_action.is_some())
        .bind(patch.pending_action.flatten().map(PendingAction::as_str))
}

#[async_trait]
impl StrategyStore for PostgresStore {
    async fn find_owned(&self, owner_uuid: Uuid, uuid: Uuid) -> StoreResult<Option<StrategyRecord>> {
        let sql = format!(
            "SELECT {} FROM contract_strategies WHERE uuid = $1 AND owner_uuid = $2",
            STRATEGY_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(uuid)
            .bind(owner_uuid)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn list_by_owner(&self, owner_uuid: Uuid) -> StoreResult<OwnedStrategies> {
        let sql = format!(
            "SELECT {} FROM contract_strategies WHERE owner_uuid = $1 \
             ORDER BY enabled DESC, position_status DESC, id ASC",
            STRATEGY_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(owner_uuid).fetch_all(&self.pool).await?;

        let mut owned = OwnedStrategies::default();
        for row in &rows {
            match record_from_row(row) {
                Ok(record) => owned.records.push(record),
                Err(StoreError::Corrupt { uuid, reason }) => {
                    tracing::warn!("Skipping unreadable strategy {}: {}", uuid, reason);
                    owned.unreadable.push(uuid);
                }
                Err(e) => return Err(e),
            }
        }
        tracing::debug!("Loaded {} strategies for {}", owned.records.len(), owner_uuid);
        Ok(owned)
    }

    async fn find_state(&self, owner_uuid: Uuid, uuid: Uuid) -> StoreResult<Option<StrategyState>> {
        let row = sqlx::query(
            "SELECT enabled, position_status FROM contract_strategies WHERE uuid = $1 AND owner_uuid = $2",
        )
        .bind(uuid)
        .bind(owner_uuid)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> StoreResult<StrategyState> {
            Ok(StrategyState {
                enabled: row.try_get("enabled")?,
                position_status: PositionStatus::from_code(row.try_get("position_status")?),
            })
        })
        .transpose()
    }

    async fn enabled_symbols(&self, exchange: &str) -> StoreResult<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT name FROM contract_symbols
            WHERE exchange = $1 AND enabled = TRUE
            ORDER BY name ASC
            "#,
        )
        .bind(exchange)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("name").map_err(StoreError::from))
            .collect()
    }

    async fn insert(&self, strategy: NewStrategy) -> StoreResult<StrategyRecord> {
        let sql = format!(
            r#"
            INSERT INTO contract_strategies (
                uuid, owner_uuid, symbol, side, margin, exchange, enabled,
                position_status, params, exchange_orders_details, comment
            )
            VALUES ($1, $2, $3, $4, $5, $6, FALSE, $7, $8, '{{}}'::jsonb, $9)
            RETURNING {}
            "#,
            STRATEGY_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(strategy.uuid)
            .bind(strategy.owner_uuid)
            .bind(&strategy.symbol)
            .bind(strategy.side.code())
            .bind(strategy.margin)
            .bind(&strategy.exchange)
            .bind(PositionStatus::Closed.code())
            .bind(strategy.params.to_document())
            .bind(&strategy.comment)
            .fetch_one(&self.pool)
            .await?;

        let record = record_from_row(&row)?;
        tracing::info!("Created strategy {} ({} {})", record.uuid, record.symbol, record.side);
        Ok(record)
    }

    async fn apply(&self, uuid: Uuid, patch: &StrategyPatch) -> StoreResult<StrategyRecord> {
        if *patch == StrategyPatch::default() {
            return self.fetch_one_by_uuid(uuid).await?.ok_or(StoreError::NotFound(uuid));
        }

        let sql = format!("{} RETURNING {}", PATCH_SQL, STRATEGY_COLUMNS);
        let details = patch_details(uuid, patch)?;
        let row = bind_patch(&sql, uuid, patch, details)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => record_from_row(&row),
            None => Err(StoreError::NotFound(uuid)),
        }
    }

    async fn write(&self, uuid: Uuid, patch: &StrategyPatch) -> StoreResult<()> {
        let details = patch_details(uuid, patch)?;
        let result = bind_patch(PATCH_SQL, uuid, patch, details)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(uuid));
        }
        Ok(())
    }

    async fn delete(&self, uuid: Uuid) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM contract_strategies WHERE uuid = $1")
            .bind(uuid)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(uuid));
        }
        tracing::info!("Deleted strategy {}", uuid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn get_test_db() -> PostgresStore {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/cryptobot_test".to_string());

        PostgresStore::new(&database_url)
            .await
            .expect("Failed to connect to test database")
    }

    fn new_strategy(owner: Uuid) -> NewStrategy {
        NewStrategy {
            uuid: Uuid::new_v4(),
            owner_uuid: owner,
            symbol: "BTC-PERP".to_string(),
            side: Side::Long,
            margin: Decimal::from(100),
            exchange: "FTX".to_string(),
            params: ContractParams::from_document(&json!({
                "entry_type": "limit",
                "entry_order": {
                    "trigger": {"trigger_type": "limit", "operator": "<=", "price": "19000"},
                    "flip_operator_enabled": false
                }
            }))
            .unwrap(),
            comment: String::new(),
        }
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running
    async fn test_insert_and_find() {
        let db = get_test_db().await;
        let owner = Uuid::new_v4();

        let record = db.insert(new_strategy(owner)).await.unwrap();
        let found = db.find_owned(owner, record.uuid).await.unwrap().unwrap();
        assert_eq!(found.params, record.params);
        assert!(found.exchange_orders_details.is_empty());
        assert!(db.find_owned(Uuid::new_v4(), record.uuid).await.unwrap().is_none());

        db.delete(record.uuid).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running
    async fn test_apply_patch_and_clear_marker() {
        let db = get_test_db().await;
        let record = db.insert(new_strategy(Uuid::new_v4())).await.unwrap();

        let marked = db
            .apply(record.uuid, &StrategyPatch::pending_action(Some(PendingAction::ClosingPosition)))
            .await
            .unwrap();
        assert_eq!(marked.pending_action, Some(PendingAction::ClosingPosition));
        assert_eq!(marked.margin, record.margin);

        let closed = db.apply(record.uuid, &StrategyPatch::closed(None)).await.unwrap();
        assert_eq!(closed.pending_action, None);
        assert!(!closed.enabled);

        db.delete(record.uuid).await.unwrap();
        assert!(matches!(db.delete(record.uuid).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running
    async fn test_unreadable_row_is_listed_apart_and_can_be_reset() {
        let db = get_test_db().await;
        let owner = Uuid::new_v4();
        let good = db.insert(new_strategy(owner)).await.unwrap();
        let bad = db.insert(new_strategy(owner)).await.unwrap();
        sqlx::query(
            "UPDATE contract_strategies SET exchange_orders_details = '{\"entry_order\": 5}'::jsonb, \
             position_status = $2 WHERE uuid = $1",
        )
        .bind(bad.uuid)
        .bind(PositionStatus::Unknown.code())
        .execute(&db.pool)
        .await
        .unwrap();

        let owned = db.list_by_owner(owner).await.unwrap();
        assert_eq!(owned.records.len(), 1);
        assert_eq!(owned.records[0].uuid, good.uuid);
        assert_eq!(owned.unreadable, vec![bad.uuid]);
        assert!(matches!(
            db.find_owned(owner, bad.uuid).await,
            Err(StoreError::Corrupt { .. })
        ));

        let state = db.find_state(owner, bad.uuid).await.unwrap().unwrap();
        assert_eq!(state.position_status, Some(PositionStatus::Unknown));

        db.write(bad.uuid, &StrategyPatch::closed(None)).await.unwrap();
        let reset = db.find_owned(owner, bad.uuid).await.unwrap().unwrap();
        assert_eq!(reset.position_status, PositionStatus::Closed);

        db.delete(good.uuid).await.unwrap();
        db.delete(bad.uuid).await.unwrap();
    }
}
