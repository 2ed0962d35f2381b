//! Unique identifiers from a shared sequence table.
//!
//! Every call inserts a row and takes the engine-assigned value, so
//! concurrent callers on different connections never see the same id.
//! Rows pile up as a side effect; [`SequenceGenerator::cleanup`] removes all
//! but the highest one when the connection closes.

use crate::db::dialect::DialectAdapter;
use crate::db::engine::Engine;
use crate::error::{DbError, DbResult};
use crate::models::{QueryParam, ReturnMode};
use tracing::debug;

/// Unprefixed name of the sequence table.
pub const SEQUENCE_TABLE: &str = "sequences";

#[derive(Debug)]
pub struct SequenceGenerator {
    /// Prefixed and quoted table name.
    table: String,
    needs_cleanup: bool,
}

impl SequenceGenerator {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            needs_cleanup: false,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// True once an id was minted and the surplus rows not yet deleted.
    pub fn needs_cleanup(&self) -> bool {
        self.needs_cleanup
    }

    /// Create the sequence table if it does not exist yet.
    pub async fn ensure_table(
        &self,
        engine: &mut dyn Engine,
        dialect: &dyn DialectAdapter,
    ) -> DbResult<()> {
        engine
            .run(
                &dialect.sequence_table_sql(&self.table),
                &[],
                ReturnMode::Nothing,
            )
            .await?;
        Ok(())
    }

    /// Mint an id strictly greater than `existing_floor`.
    ///
    /// When the counter is behind the floor it is raised to the floor first
    /// and a second id is requested.
    pub async fn next_id(
        &mut self,
        engine: &mut dyn Engine,
        dialect: &dyn DialectAdapter,
        existing_floor: i64,
    ) -> DbResult<i64> {
        let mut id = self.insert(engine, dialect).await?;

        if id <= existing_floor {
            debug!(
                id = id,
                floor = existing_floor,
                "Sequence behind floor, raising it"
            );
            engine
                .run(
                    &dialect.sequence_floor_sql(&self.table),
                    &[QueryParam::Int(existing_floor)],
                    ReturnMode::Nothing,
                )
                .await?;
            id = self.insert(engine, dialect).await?;
        }

        self.needs_cleanup = true;
        Ok(id)
    }

    async fn insert(
        &self,
        engine: &mut dyn Engine,
        dialect: &dyn DialectAdapter,
    ) -> DbResult<i64> {
        let output = engine
            .run(
                &dialect.sequence_insert_sql(&self.table),
                &[],
                ReturnMode::InsertId,
            )
            .await?;
        output.insert_id().ok_or_else(|| {
            DbError::internal(format!("Sequence insert into {} returned no id", self.table))
        })
    }

    /// Delete every row below the current maximum. Failures are logged and
    /// otherwise ignored; the next cleanup will catch up.
    pub async fn cleanup(&mut self, engine: &mut dyn Engine, dialect: &dyn DialectAdapter) {
        let max = match engine
            .run(
                &format!("SELECT MAX(value) FROM {}", self.table),
                &[],
                ReturnMode::Rows,
            )
            .await
        {
            Ok(output) => output.scalar_i64(),
            Err(e) => {
                debug!(error = %e, "Sequence cleanup skipped");
                return;
            }
        };

        if let Some(max) = max {
            let delete = format!(
                "DELETE FROM {} WHERE value < {}",
                self.table,
                dialect.placeholder(1)
            );
            if let Err(e) = engine
                .run(&delete, &[QueryParam::Int(max)], ReturnMode::Nothing)
                .await
            {
                debug!(error = %e, "Sequence cleanup failed");
                return;
            }
        }
        self.needs_cleanup = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_generator_is_clean() {
        let generator = SequenceGenerator::new("\"sequences\"");
        assert_eq!(generator.table(), "\"sequences\"");
        assert!(!generator.needs_cleanup());
    }
}
