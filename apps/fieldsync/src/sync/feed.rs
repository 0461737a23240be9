//! Incremental change feed
//!
//! Reads rows changed after a cursor across any set of entity tables, in
//! change-sequence order. Tombstoned rows are included.

use sqlx::SqlitePool;

use super::cursor::Cursor;
use crate::entities::{EntityRow, EntityType, SyncableEntity, ENTITY_COLUMNS};
use crate::error::{AppError, Result};

/// A changed row and its position in the feed
#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    pub change_seq: i64,
    pub entity: SyncableEntity,
}

pub struct ChangeFeed<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ChangeFeed<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Rows of the given types changed after `cursor`, oldest first
    pub async fn since(
        &self,
        cursor: Cursor,
        entity_types: &[EntityType],
        limit: usize,
    ) -> Result<Vec<FeedItem>> {
        if entity_types.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let selects: Vec<String> = entity_types
            .iter()
            .map(|entity_type| {
                format!(
                    "SELECT '{}' AS entity_type, {} FROM {} WHERE change_seq > ?",
                    entity_type.as_str(),
                    ENTITY_COLUMNS,
                    entity_type.table()
                )
            })
            .collect();
        let sql = format!(
            "{} ORDER BY change_seq ASC LIMIT ?",
            selects.join(" UNION ALL ")
        );

        let mut query = sqlx::query_as::<_, FeedRow>(&sql);
        for _ in entity_types {
            query = query.bind(cursor.seq());
        }
        let rows = query
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(self.pool)
            .await?;

        rows.into_iter().map(FeedRow::into_item).collect()
    }
}

#[derive(sqlx::FromRow)]
struct FeedRow {
    entity_type: String,
    #[sqlx(flatten)]
    row: EntityRow,
}

impl FeedRow {
    fn into_item(self) -> Result<FeedItem> {
        let entity_type = self
            .entity_type
            .parse::<EntityType>()
            .map_err(AppError::Internal)?;
        let change_seq = self.row.change_seq;

        Ok(FeedItem {
            change_seq,
            entity: self.row.into_entity(entity_type)?,
        })
    }
}
