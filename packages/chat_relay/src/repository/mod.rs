// Repository layer: each domain lives in its own file with `impl ChatRepository`.

use sqlx::sqlite::SqlitePool;

pub(crate) mod auth;
mod sessions;

#[cfg(test)]
pub(crate) mod test_helpers;

#[derive(Clone)]
pub struct ChatRepository {
    pub(crate) pool: SqlitePool,
}

impl ChatRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}
