//! Persistent download queue backed by `SQLite`.
//!
//! Every method commits before returning, so a following `get` or `list`
//! observes the write. There are no multi-call transactions: a reader may see
//! an item with its title set and its thumbnail still missing.
//!
//! # Overview
//!
//! - [`Queue`] - store operations (insert, partial update, listing, reordering)
//! - [`QueueItem`] - one persisted row
//! - [`QueueStatus`] - item lifecycle states
//! - [`ItemUpdate`] - typed partial update
//! - [`QueueError`] - operation error types
//!
//! # Example
//!
//! ```ignore
//! use mediaqueue_core::{Database, ItemUpdate, Queue, QueueStatus};
//! use std::path::Path;
//!
//! let db = Database::new(Path::new("downloads.sqlite3")).await?;
//! let queue = Queue::new(db);
//!
//! let id = queue.insert("https://example.com/watch?v=abc", "bv*+ba/best").await?;
//! queue.update(id, &ItemUpdate::new().title("A video")).await?;
//! queue.move_up(id).await?;
//! ```

mod error;
mod item;

pub use error::{QueueDbErrorKind, QueueError};
pub use item::{ItemUpdate, QueueItem, QueueStatus};

use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{instrument, warn};

use crate::db::Database;

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Returns `Ok(())` if at least one row was affected; otherwise [`QueueError::ItemNotFound`].
fn check_affected(id: i64, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        Err(QueueError::ItemNotFound(id))
    } else {
        Ok(())
    }
}

/// Current wall-clock time as unix seconds.
fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

/// Escapes `LIKE` wildcards so search terms match literally.
fn like_pattern(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len() + 2);
    escaped.push('%');
    for ch in term.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

/// Which neighbour a reorder swaps with.
#[derive(Debug, Clone, Copy)]
enum Direction {
    Up,
    Down,
}

/// Download queue store.
///
/// Cheap to clone; clones share the same connection pool.
#[derive(Debug, Clone)]
pub struct Queue {
    db: Database,
}

impl Queue {
    /// Creates a new queue store with the given database connection.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Adds a URL at the end of the queue with status `queued`.
    ///
    /// The position is computed inside the insert statement, so concurrent
    /// callers never receive the same position.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the insert fails.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn insert(&self, url: &str, format: &str) -> Result<i64> {
        let now = now_secs();
        let row = sqlx::query(
            r"INSERT INTO downloads (url, status, added_at, updated_at, format, position)
              VALUES (?, ?, ?, ?, ?, (SELECT COALESCE(MAX(position), 0) + 1 FROM downloads))
              RETURNING id",
        )
        .bind(url)
        .bind(QueueStatus::Queued.as_str())
        .bind(now)
        .bind(now)
        .bind(format)
        .fetch_one(self.db.pool())
        .await?;

        Ok(row.get("id"))
    }

    /// Applies a partial update and stamps `updated_at`.
    ///
    /// An empty update does nothing. An update for an id that no longer
    /// exists is logged and ignored, since items may be deleted while a
    /// worker still holds their id.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidTransition`] if `update.status` is not
    /// reachable from the stored status, or [`QueueError::Database`] if the
    /// statement fails.
    #[instrument(skip(self, update), fields(status = ?update.status))]
    pub async fn update(&self, id: i64, update: &ItemUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }

        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("UPDATE downloads SET updated_at = MAX(COALESCE(updated_at, 0), ");
        qb.push_bind(now_secs());
        qb.push(")");

        if let Some(status) = update.status {
            qb.push(", status = ").push_bind(status.as_str());
        }
        if let Some(title) = &update.title {
            qb.push(", title = ").push_bind(title.as_str());
        }
        if let Some(uploader) = &update.uploader {
            qb.push(", uploader = ").push_bind(uploader.as_str());
        }
        if let Some(duration) = update.duration {
            qb.push(", duration = ").push_bind(duration);
        }
        if let Some(filepath) = &update.filepath {
            qb.push(", filepath = ").push_bind(filepath.as_str());
        }
        if let Some(total) = update.total_bytes {
            qb.push(", total_bytes = ").push_bind(total);
        }
        if let Some(downloaded) = update.downloaded_bytes {
            qb.push(", downloaded_bytes = ").push_bind(downloaded);
        }
        if let Some(speed) = update.speed {
            qb.push(", speed = ").push_bind(speed);
        }
        if let Some(eta) = update.eta {
            qb.push(", eta = ").push_bind(eta);
        }
        if let Some(errmsg) = &update.errmsg {
            qb.push(", errmsg = ").push_bind(errmsg.as_deref());
        }
        if let Some(format) = &update.format {
            qb.push(", format = ").push_bind(format.as_str());
        }
        if let Some(thumb_path) = &update.thumb_path {
            qb.push(", thumb_path = ").push_bind(thumb_path.as_str());
        }

        qb.push(" WHERE id = ").push_bind(id);

        if let Some(next) = update.status {
            qb.push(" AND status IN (");
            let mut allowed = qb.separated(", ");
            for from in QueueStatus::ALL
                .into_iter()
                .filter(|from| from.can_transition_to(next))
            {
                allowed.push_bind(from.as_str());
            }
            allowed.push_unseparated(")");
        }

        let result = qb.build().execute(self.db.pool()).await?;
        if result.rows_affected() > 0 {
            return Ok(());
        }

        match self.get(id).await? {
            None => {
                warn!(item_id = id, "update ignored: item no longer exists");
                Ok(())
            }
            Some(current) => Err(QueueError::InvalidTransition {
                id,
                from: current.status(),
                to: update.status.unwrap_or_else(|| current.status()),
            }),
        }
    }

    /// Gets a queue item by ID.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get(&self, id: i64) -> Result<Option<QueueItem>> {
        let item = sqlx::query_as::<_, QueueItem>(r"SELECT * FROM downloads WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;

        Ok(item)
    }

    /// Lists items by ascending position, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list(&self, status: Option<QueueStatus>) -> Result<Vec<QueueItem>> {
        let items = match status {
            Some(status) => {
                sqlx::query_as::<_, QueueItem>(
                    r"SELECT * FROM downloads WHERE status = ? ORDER BY position ASC, id ASC",
                )
                .bind(status.as_str())
                .fetch_all(self.db.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, QueueItem>(
                    r"SELECT * FROM downloads ORDER BY position ASC, id ASC",
                )
                .fetch_all(self.db.pool())
                .await?
            }
        };

        Ok(items)
    }

    /// Substring search across url, title and filepath, by ascending position.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn search(&self, term: &str) -> Result<Vec<QueueItem>> {
        let pattern = like_pattern(term);
        let items = sqlx::query_as::<_, QueueItem>(
            r"SELECT * FROM downloads
              WHERE url LIKE ? ESCAPE '\'
                 OR title LIKE ? ESCAPE '\'
                 OR filepath LIKE ? ESCAPE '\'
              ORDER BY position ASC, id ASC",
        )
        .bind(&pattern)
        .bind(&pattern)
        .bind(&pattern)
        .fetch_all(self.db.pool())
        .await?;

        Ok(items)
    }

    /// Counts items by status.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn count_by_status(&self, status: QueueStatus) -> Result<i64> {
        let row = sqlx::query(r"SELECT COUNT(*) AS count FROM downloads WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(self.db.pool())
            .await?;

        Ok(row.get("count"))
    }

    /// Removes a queue item by ID.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ItemNotFound`] if no item exists with the given ID.
    /// Returns [`QueueError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: i64) -> Result<()> {
        let result = sqlx::query(r"DELETE FROM downloads WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await?;

        check_affected(id, result.rows_affected())
    }

    /// Deletes completed, errored and canceled items.
    ///
    /// # Returns
    ///
    /// The number of items removed.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn clear_history(&self) -> Result<u64> {
        let [completed, error, canceled] = QueueStatus::HISTORY;
        let result = sqlx::query(r"DELETE FROM downloads WHERE status IN (?, ?, ?)")
            .bind(completed.as_str())
            .bind(error.as_str())
            .bind(canceled.as_str())
            .execute(self.db.pool())
            .await?;

        Ok(result.rows_affected())
    }

    /// Swaps the item's position with the item listed immediately above it.
    ///
    /// Returns `false` when the item is first (or missing) and nothing moved.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the transaction fails.
    #[instrument(skip(self))]
    pub async fn move_up(&self, id: i64) -> Result<bool> {
        self.swap_with_neighbour(id, Direction::Up).await
    }

    /// Swaps the item's position with the item listed immediately below it.
    ///
    /// Returns `false` when the item is last (or missing) and nothing moved.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the transaction fails.
    #[instrument(skip(self))]
    pub async fn move_down(&self, id: i64) -> Result<bool> {
        self.swap_with_neighbour(id, Direction::Down).await
    }

    async fn swap_with_neighbour(&self, id: i64, direction: Direction) -> Result<bool> {
        let mut tx = self.db.pool().begin().await?;

        let Some(row) = sqlx::query(r"SELECT position FROM downloads WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(false);
        };
        let position: i64 = row.get("position");

        let neighbour_sql = match direction {
            Direction::Up => {
                r"SELECT id, position FROM downloads
                  WHERE position < ? ORDER BY position DESC LIMIT 1"
            }
            Direction::Down => {
                r"SELECT id, position FROM downloads
                  WHERE position > ? ORDER BY position ASC LIMIT 1"
            }
        };
        let Some(neighbour) = sqlx::query(neighbour_sql)
            .bind(position)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(false);
        };
        let neighbour_id: i64 = neighbour.get("id");
        let neighbour_position: i64 = neighbour.get("position");

        sqlx::query(r"UPDATE downloads SET position = ? WHERE id = ?")
            .bind(neighbour_position)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(r"UPDATE downloads SET position = ? WHERE id = ?")
            .bind(position)
            .bind(neighbour_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Returns rows left `downloading` by a previous process to `queued`.
    ///
    /// No execution survives a restart, so those rows would otherwise show
    /// as active forever.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn reset_interrupted(&self) -> Result<u64> {
        let result = sqlx::query(
            r"UPDATE downloads
              SET status = ?, updated_at = MAX(COALESCE(updated_at, 0), ?)
              WHERE status = ?",
        )
        .bind(QueueStatus::Queued.as_str())
        .bind(now_secs())
        .bind(QueueStatus::Downloading.as_str())
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected())
    }

    /// Marks a still-unresolved item as `error`.
    ///
    /// Only applies while the item is `queued` with no title, so it never
    /// overrides a worker that has already started on the item. The write is
    /// committed only if `unclaimed` still holds once the row is locked;
    /// otherwise it is rolled back and never becomes visible.
    ///
    /// Returns `true` if the row was changed.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the transaction fails.
    #[instrument(skip(self, message, unclaimed))]
    pub async fn mark_unresolved(
        &self,
        id: i64,
        message: &str,
        unclaimed: impl FnOnce() -> bool,
    ) -> Result<bool> {
        let mut tx = self.db.pool().begin().await?;
        let result = sqlx::query(
            r"UPDATE downloads
              SET status = ?, errmsg = ?, updated_at = MAX(COALESCE(updated_at, 0), ?)
              WHERE id = ? AND status = ? AND title IS NULL",
        )
        .bind(QueueStatus::Error.as_str())
        .bind(message)
        .bind(now_secs())
        .bind(id)
        .bind(QueueStatus::Queued.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 || !unclaimed() {
            tx.rollback().await?;
            return Ok(false);
        }
        tx.commit().await?;
        Ok(true)
    }
}
