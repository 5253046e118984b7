// sqlx::Error -> AppError
//
// Orphan rules prevent `impl From<sqlx::Error> for AppError`, so every adapter
// call goes through `map_sqlx_error`.
//
// Lock contention and pool exhaustion become `AppError::Retriable`: the worker
// requeues the task and the next run resumes from its checkpoint. Constraint
// violations become `AppError::Constraint` so no retry loop replays them.

use bulkimport_core::error::AppError;

pub(crate) fn map_sqlx_error(err: sqlx::Error) -> AppError {
    match &err {
        sqlx::Error::Database(db_err) => {
            // SQLite (extended) result codes: https://www.sqlite.org/rescode.html
            match db_err.code().as_deref() {
                Some(code @ ("2067" | "1555" | "787" | "1299" | "275" | "19")) => {
                    AppError::Constraint(format!("{} ({})", db_err.message(), code))
                }
                Some(code @ ("5" | "6" | "261" | "262" | "517")) => AppError::Retriable(format!(
                    "Database locked (SQLITE_BUSY/LOCKED {}): {}",
                    code,
                    db_err.message()
                )),
                Some("13") => AppError::Database(format!("Database full: {}", db_err.message())),
                Some(code) => AppError::Database(format!(
                    "Database error [{}]: {}",
                    code,
                    db_err.message()
                )),
                None => AppError::Database(format!("Database error: {}", db_err.message())),
            }
        }
        sqlx::Error::PoolTimedOut => {
            AppError::Retriable("Timed out waiting for a database connection".to_string())
        }
        sqlx::Error::RowNotFound => AppError::Database("Row not found".to_string()),
        sqlx::Error::ColumnNotFound(col) => {
            AppError::Database(format!("Column not found: {}", col))
        }
        // Connection, pool and protocol errors
        _ => AppError::Database(err.to_string()),
    }
}
