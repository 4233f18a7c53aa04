use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

use crate::scheduler::{OrderStore, PlanStore, StoreError};
use crate::types::{GradeId, OrderLine, TrimPlan};

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Encoding(err.to_string())
    }
}

/// A persisted plan together with its bookkeeping columns.
#[derive(Debug, Clone, Serialize)]
pub struct StoredPlan {
    pub grade_id: GradeId,
    pub computed_at: String,
    #[serde(flatten)]
    pub plan: TrimPlan,
}

/// Flattened order line for the tabular export.
#[derive(Debug, Serialize)]
pub struct OrderRow {
    pub grade_id: GradeId,
    pub grade: String,
    pub width: u32,
    pub quantity: u32,
}

/// One audit-trail row from the operation log.
#[derive(Debug, Clone, Serialize)]
pub struct BacklogEntry {
    pub id: i64,
    pub occurred_at: String,
    pub kind: String,
    pub grade_id: GradeId,
    pub details: String,
}

/// Flattened plan summary for the tabular export.
#[derive(Debug, Serialize)]
pub struct PlanRow {
    pub grade_id: GradeId,
    pub grade: String,
    pub leftover_weight: f64,
    pub stage1_pair_count: f64,
    pub action_count: usize,
    pub computed_at: String,
}

/// SQLite-backed order and plan storage. Plans are stored as JSON columns;
/// every mutation runs in a transaction.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS grades (
                 id   INTEGER PRIMARY KEY,
                 name TEXT NOT NULL UNIQUE
             );
             CREATE TABLE IF NOT EXISTS orders (
                 grade_id INTEGER NOT NULL REFERENCES grades(id),
                 width    INTEGER NOT NULL,
                 quantity INTEGER NOT NULL,
                 UNIQUE (grade_id, width)
             );
             CREATE TABLE IF NOT EXISTS trim_plans (
                 grade_id          INTEGER PRIMARY KEY REFERENCES grades(id),
                 residuals         TEXT NOT NULL,
                 actions           TEXT NOT NULL,
                 leftover_weight   REAL NOT NULL,
                 stage1_pair_count REAL NOT NULL,
                 computed_at       TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS operation_log (
                 id          INTEGER PRIMARY KEY AUTOINCREMENT,
                 occurred_at TEXT NOT NULL,
                 kind        TEXT NOT NULL,
                 grade_id    INTEGER NOT NULL,
                 details     TEXT NOT NULL
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_grade(&self, name: &str) -> Result<GradeId, StoreError> {
        let conn = self.conn();
        conn.execute("INSERT INTO grades (name) VALUES (?1)", params![name])?;
        Ok(conn.last_insert_rowid())
    }

    pub fn grade_name(&self, grade: GradeId) -> Result<Option<String>, StoreError> {
        let name = self
            .conn()
            .query_row(
                "SELECT name FROM grades WHERE id = ?1",
                params![grade],
                |row| row.get(0),
            )
            .optional()?;
        Ok(name)
    }

    /// Adds order lines for a grade; a width already on order has the new
    /// quantity added to it.
    pub fn add_orders(&self, grade: GradeId, lines: &[OrderLine]) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        ensure_grade(&tx, grade)?;
        for line in lines {
            tx.execute(
                "INSERT INTO orders (grade_id, width, quantity) VALUES (?1, ?2, ?3)
                 ON CONFLICT (grade_id, width)
                 DO UPDATE SET quantity = quantity + excluded.quantity",
                params![grade, line.width, line.quantity],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Records produced rolls: decrements `quantity` from each of the given
    /// widths and drops lines that reach zero. Validates presence and
    /// sufficiency of every width before touching anything.
    pub fn apply_production(
        &self,
        grade: GradeId,
        widths: &[u32],
        quantity: u32,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        ensure_grade(&tx, grade)?;
        for &width in widths {
            let have: Option<u32> = tx
                .query_row(
                    "SELECT quantity FROM orders WHERE grade_id = ?1 AND width = ?2",
                    params![grade, width],
                    |row| row.get(0),
                )
                .optional()?;
            match have {
                None => return Err(StoreError::WidthNotFound { grade, width }),
                Some(have) if have < quantity => {
                    return Err(StoreError::InsufficientQuantity {
                        width,
                        have,
                        need: quantity,
                    });
                }
                Some(_) => {}
            }
        }
        for &width in widths {
            tx.execute(
                "UPDATE orders SET quantity = quantity - ?3
                 WHERE grade_id = ?1 AND width = ?2",
                params![grade, width, quantity],
            )?;
        }
        tx.execute(
            "DELETE FROM orders WHERE grade_id = ?1 AND quantity <= 0",
            params![grade],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn plan(&self, grade: GradeId) -> Result<Option<StoredPlan>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT residuals, actions, leftover_weight, stage1_pair_count, computed_at
                 FROM trim_plans WHERE grade_id = ?1",
                params![grade],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((residuals, actions, leftover_weight, stage1_pair_count, computed_at)) => {
                Ok(Some(StoredPlan {
                    grade_id: grade,
                    computed_at,
                    plan: TrimPlan {
                        residuals: serde_json::from_str(&residuals)?,
                        actions: serde_json::from_str(&actions)?,
                        leftover_weight,
                        stage1_pair_count,
                    },
                }))
            }
        }
    }

    pub fn log_operation(
        &self,
        kind: &str,
        grade: GradeId,
        details: &str,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO operation_log (occurred_at, kind, grade_id, details)
             VALUES (?1, ?2, ?3, ?4)",
            params![chrono::Utc::now().to_rfc3339(), kind, grade, details],
        )?;
        Ok(())
    }

    /// Most recent operations first, capped at `limit` rows.
    pub fn backlog(&self, limit: u32) -> Result<Vec<BacklogEntry>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, occurred_at, kind, grade_id, details
             FROM operation_log ORDER BY id DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit], |row| {
                Ok(BacklogEntry {
                    id: row.get(0)?,
                    occurred_at: row.get(1)?,
                    kind: row.get(2)?,
                    grade_id: row.get(3)?,
                    details: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn order_rows(&self) -> Result<Vec<OrderRow>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT o.grade_id, g.name, o.width, o.quantity
             FROM orders o JOIN grades g ON g.id = o.grade_id
             ORDER BY g.name, o.width",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(OrderRow {
                    grade_id: row.get(0)?,
                    grade: row.get(1)?,
                    width: row.get(2)?,
                    quantity: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn plan_rows(&self) -> Result<Vec<PlanRow>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT p.grade_id, g.name, p.leftover_weight, p.stage1_pair_count,
                    p.actions, p.computed_at
             FROM trim_plans p JOIN grades g ON g.id = p.grade_id
             ORDER BY g.name",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, GradeId>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(
                |(grade_id, grade, leftover_weight, stage1_pair_count, actions, computed_at)| {
                    let actions: Vec<crate::types::TrimAction> = serde_json::from_str(&actions)?;
                    Ok(PlanRow {
                        grade_id,
                        grade,
                        leftover_weight,
                        stage1_pair_count,
                        action_count: actions.len(),
                        computed_at,
                    })
                },
            )
            .collect()
    }
}

fn ensure_grade(conn: &Connection, grade: GradeId) -> Result<(), StoreError> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM grades WHERE id = ?1",
            params![grade],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(StoreError::GradeNotFound(grade));
    }
    Ok(())
}

impl OrderStore for SqliteStore {
    fn orders(&self, grade: GradeId) -> Result<Vec<OrderLine>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT width, quantity FROM orders
             WHERE grade_id = ?1 ORDER BY width ASC",
        )?;
        let lines = stmt
            .query_map(params![grade], |row| {
                Ok(OrderLine {
                    width: row.get(0)?,
                    quantity: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(lines)
    }

    fn grades_with_orders(&self) -> Result<Vec<GradeId>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT g.id FROM grades g
             JOIN orders o ON o.grade_id = g.id
             WHERE o.quantity > 0
             ORDER BY g.name",
        )?;
        let grades = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(grades)
    }
}

impl PlanStore for SqliteStore {
    fn replace(&self, grade: GradeId, plan: &TrimPlan) -> Result<(), StoreError> {
        let residuals = serde_json::to_string(&plan.residuals)?;
        let actions = serde_json::to_string(&plan.actions)?;
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM trim_plans WHERE grade_id = ?1",
            params![grade],
        )?;
        tx.execute(
            "INSERT INTO trim_plans
             (grade_id, residuals, actions, leftover_weight, stage1_pair_count, computed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                grade,
                residuals,
                actions,
                plan.leftover_weight,
                plan.stage1_pair_count,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }
}
