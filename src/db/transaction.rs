//! Nested transactions on top of savepoints.
//!
//! The outermost layer is a real engine transaction; every layer above it is
//! a savepoint. Layers are released by name and may be released out of
//! order: a released layer stays on the stack until everything above it has
//! been released too, and only then is its savepoint released (or, for the
//! outermost layer, the transaction committed).
//!
//! Engines that commit implicitly on schema changes (MySQL) can make the
//! bookkeeping stale. A release that fails because the savepoint is gone
//! is taken as proof that everything was already committed, and a rollback
//! while the engine has no open transaction clears the stack.

use crate::db::dialect::DialectAdapter;
use crate::db::engine::Engine;
use crate::db::quote::is_bare_identifier;
use crate::error::{DbError, DbResult};
use crate::models::ReturnMode;
use serde::Serialize;
use tracing::{debug, warn};

/// Name given to an unnamed outermost layer.
pub const OUTERMOST_NAME: &str = "transaction";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerState {
    Active,
    /// Released by its owner, waiting for the layers above it.
    Released,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionLayer {
    pub name: String,
    pub state: LayerState,
}

/// Stack of transaction layers for one connection.
#[derive(Debug)]
pub struct TransactionManager {
    layers: Vec<TransactionLayer>,
    enabled: bool,
}

impl TransactionManager {
    /// A manager that is a no-op when `enabled` is false.
    pub fn new(enabled: bool) -> Self {
        Self {
            layers: Vec::new(),
            enabled,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    pub fn in_transaction(&self) -> bool {
        !self.layers.is_empty()
    }

    pub fn layers(&self) -> &[TransactionLayer] {
        &self.layers
    }

    pub fn contains(&self, name: &str) -> bool {
        self.layers.iter().any(|l| l.name == name)
    }

    /// Name for a new layer when the caller did not pick one.
    pub fn next_name(&self) -> String {
        match self.depth() {
            0 => OUTERMOST_NAME.to_string(),
            depth => format!("savepoint_{}", depth + 1),
        }
    }

    /// Open a layer: a real transaction when the stack is empty, a
    /// savepoint otherwise.
    pub async fn push(
        &mut self,
        engine: &mut dyn Engine,
        dialect: &dyn DialectAdapter,
        name: &str,
    ) -> DbResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if !is_bare_identifier(name) {
            return Err(DbError::invalid_input(format!(
                "Invalid transaction name '{name}'"
            )));
        }
        if self.contains(name) {
            return Err(DbError::transaction_name_not_unique(name));
        }

        let sql = if self.layers.is_empty() {
            dialect.begin_sql().to_string()
        } else {
            dialect.savepoint_sql(name)
        };
        engine.run(&sql, &[], ReturnMode::Nothing).await?;

        self.layers.push(TransactionLayer {
            name: name.to_string(),
            state: LayerState::Active,
        });
        debug!(name = %name, depth = self.depth(), "Transaction layer pushed");
        Ok(())
    }

    /// Release the layer `name`, then everything that became committable.
    pub async fn pop(
        &mut self,
        engine: &mut dyn Engine,
        dialect: &dyn DialectAdapter,
        name: &str,
    ) -> DbResult<()> {
        if !self.enabled {
            return Ok(());
        }
        let layer = self
            .layers
            .iter_mut()
            .find(|l| l.name == name)
            .ok_or_else(|| {
                DbError::no_active_transaction(format!("No transaction layer named '{name}'"))
            })?;
        layer.state = LayerState::Released;

        self.pop_committable(engine, dialect).await
    }

    /// Release the innermost active layer.
    pub async fn pop_innermost(
        &mut self,
        engine: &mut dyn Engine,
        dialect: &dyn DialectAdapter,
    ) -> DbResult<()> {
        if !self.enabled {
            return Ok(());
        }
        let name = self
            .layers
            .iter()
            .rev()
            .find(|l| l.state == LayerState::Active)
            .map(|l| l.name.clone())
            .ok_or_else(|| DbError::no_active_transaction("Transaction stack is empty"))?;
        self.pop(engine, dialect, &name).await
    }

    /// Roll back to (and discard) the layer `name`.
    ///
    /// Active layers above `name` are discarded along with it; that is
    /// reported as [`DbError::TransactionOutOfOrder`] once the rollback has
    /// been carried out.
    pub async fn rollback(
        &mut self,
        engine: &mut dyn Engine,
        dialect: &dyn DialectAdapter,
        name: &str,
    ) -> DbResult<()> {
        if !self.enabled {
            return Ok(());
        }
        let Some(index) = self.layers.iter().rposition(|l| l.name == name) else {
            return Err(DbError::no_active_transaction(format!(
                "No transaction layer named '{name}'"
            )));
        };
        if !engine.in_transaction() {
            warn!(
                name = %name,
                depth = self.depth(),
                "Engine has no open transaction; discarding stale transaction layers"
            );
            self.layers.clear();
            return Err(DbError::no_active_transaction(format!(
                "Cannot roll back '{name}': no transaction is open"
            )));
        }

        let discarded_active = self.layers[index + 1..]
            .iter()
            .any(|l| l.state == LayerState::Active);

        // The stack only shrinks once the engine accepted the rollback.
        if index == 0 {
            engine
                .run(dialect.rollback_sql(), &[], ReturnMode::Nothing)
                .await?;
            self.layers.clear();
        } else {
            engine
                .run(
                    &dialect.rollback_to_savepoint_sql(name),
                    &[],
                    ReturnMode::Nothing,
                )
                .await?;
            self.layers.truncate(index);
            self.pop_committable(engine, dialect).await?;
        }

        debug!(name = %name, depth = self.depth(), "Transaction layer rolled back");
        if discarded_active {
            return Err(DbError::transaction_out_of_order(name));
        }
        Ok(())
    }

    /// Drop released layers from the top until an active one is reached.
    async fn pop_committable(
        &mut self,
        engine: &mut dyn Engine,
        dialect: &dyn DialectAdapter,
    ) -> DbResult<()> {
        while self
            .layers
            .last()
            .is_some_and(|l| l.state == LayerState::Released)
        {
            let Some(layer) = self.layers.pop() else {
                break;
            };

            if self.layers.is_empty() {
                return commit(engine, dialect).await;
            }

            let release = dialect.release_savepoint_sql(&layer.name);
            match engine.run(&release, &[], ReturnMode::Nothing).await {
                Ok(_) => {}
                Err(e) if dialect.is_missing_savepoint(&e) => {
                    warn!(
                        savepoint = %layer.name,
                        depth = self.depth(),
                        "Savepoint already gone; the engine committed implicitly"
                    );
                    self.layers.clear();
                    return commit(engine, dialect).await;
                }
                Err(e) => return Err(DbError::transaction_commit_failed(e.to_string())),
            }
        }
        Ok(())
    }
}

async fn commit(engine: &mut dyn Engine, dialect: &dyn DialectAdapter) -> DbResult<()> {
    engine
        .run(dialect.commit_sql(), &[], ReturnMode::Nothing)
        .await
        .map_err(|e| DbError::transaction_commit_failed(e.to_string()))?;
    debug!("Transaction committed");
    Ok(())
}
