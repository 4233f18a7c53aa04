use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::scheduler::StoreError;
use crate::store::SqliteStore;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("export io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv write error: {0}")]
    Csv(#[from] csv::Error),
}

/// Writes the current orders and plan summaries as a pair of timestamped
/// CSV files under `dir`, creating the directory if needed. Returns the
/// written paths.
pub fn export_csv(store: &SqliteStore, dir: &Path) -> Result<Vec<PathBuf>, ExportError> {
    std::fs::create_dir_all(dir)?;
    let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");

    let orders_path = dir.join(format!("orders_{stamp}.csv"));
    let mut writer = csv::Writer::from_path(&orders_path)?;
    for row in store.order_rows()? {
        writer.serialize(row)?;
    }
    writer.flush()?;

    let plans_path = dir.join(format!("plans_{stamp}.csv"));
    let mut writer = csv::Writer::from_path(&plans_path)?;
    for row in store.plan_rows()? {
        writer.serialize(row)?;
    }
    writer.flush()?;

    tracing::info!(orders = %orders_path.display(), plans = %plans_path.display(), "exported snapshot");
    Ok(vec![orders_path, plans_path])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::PlanStore;
    use crate::types::{OrderLine, TrimAction, TrimPlan};

    #[test]
    fn test_export_writes_both_files() {
        let store = SqliteStore::open_in_memory().unwrap();
        let grade = store.add_grade("NW-60").unwrap();
        store
            .add_orders(grade, &[OrderLine { width: 150, quantity: 10 }])
            .unwrap();
        store
            .replace(grade, &TrimPlan {
                residuals: vec![],
                leftover_weight: 0.25,
                actions: vec![TrimAction::pair(150, 5, 162, 5)],
                stage1_pair_count: 5.0,
            })
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let paths = export_csv(&store, dir.path()).unwrap();
        assert_eq!(paths.len(), 2);

        let orders = std::fs::read_to_string(&paths[0]).unwrap();
        assert!(orders.contains("grade_id,grade,width,quantity"));
        assert!(orders.contains("NW-60,150,10"));

        let plans = std::fs::read_to_string(&paths[1]).unwrap();
        assert!(plans.contains("leftover_weight"));
        assert!(plans.contains("0.25"));
    }

    #[test]
    fn test_export_with_empty_store() {
        let store = SqliteStore::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let paths = export_csv(&store, dir.path()).unwrap();
        for path in paths {
            // Headers only.
            let contents = std::fs::read_to_string(path).unwrap();
            assert!(contents.is_empty() || contents.lines().count() <= 1);
        }
    }
}
