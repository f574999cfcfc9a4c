//! PostgreSQL-backed image store

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Pool, Postgres};

use super::{ImageStore, ImageStoreError, ImageStoreResult, ImageSummary, NewImage, PageRequest};

/// Embedded schema, applied statement by statement on connect
const SCHEMA: &str = include_str!("schema.sql");

fn schema_statements(schema: &str) -> impl Iterator<Item = &str> {
    schema.split(';').map(str::trim).filter(|statement| {
        statement.lines().any(|line| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with("--")
        })
    })
}

fn list_approved_query(page: &PageRequest) -> String {
    // `image_id` keeps page boundaries stable between rows with equal sort values
    format!(
        "SELECT image_id AS id, file_name AS name, preview_link AS thumbnail, download_url, liked_count \
         FROM images \
         WHERE is_approved \
         ORDER BY {} DESC, image_id ASC \
         LIMIT $1 OFFSET $2",
        page.sort_key.column()
    )
}

/// Image store client for Postgres
pub struct PostgresImageStore {
    pool: Pool<Postgres>,
}

impl PostgresImageStore {
    /// Connects to Postgres and applies the embedded schema
    ///
    /// # Arguments
    ///
    /// * `database_url` - Postgres connection URL
    /// * `max_connections` - Upper bound on pooled connections
    ///
    /// # Errors
    ///
    /// Returns `ImageStoreError::Database` if the URL is invalid or the
    /// connection fails, `ImageStoreError::Migration` if the schema cannot be applied
    pub async fn connect(database_url: &str, max_connections: u32) -> ImageStoreResult<Self> {
        let options = PgConnectOptions::from_str(database_url)?;

        tracing::info!(
            host = options.get_host(),
            database = options.get_database().unwrap_or("<default>"),
            max_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        Ok(store)
    }

    /// Creates the `images` table and its indexes if they do not exist
    ///
    /// # Errors
    ///
    /// Returns `ImageStoreError::Migration` if any statement fails
    pub async fn migrate(&self) -> ImageStoreResult<()> {
        // Postgres prepared statements accept a single statement each
        for statement in schema_statements(SCHEMA) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| ImageStoreError::Migration(e.to_string()))?;
        }

        Ok(())
    }

    /// Checks that the database answers queries
    ///
    /// # Errors
    ///
    /// Returns `ImageStoreError::Database` if the round-trip fails
    pub async fn health_check(&self) -> ImageStoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ImageStore for PostgresImageStore {
    async fn liked_count(&self, asset_id: &str) -> ImageStoreResult<i64> {
        sqlx::query_scalar::<_, i64>("SELECT liked_count FROM images WHERE image_id = $1")
            .bind(asset_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ImageStoreError::NotFound(asset_id.to_string()))
    }

    async fn add_liked_count(&self, asset_id: &str, delta: i64) -> ImageStoreResult<()> {
        // A single UPDATE either applies the full delta or nothing
        let result = sqlx::query(
            "UPDATE images SET liked_count = liked_count + $1 WHERE image_id = $2",
        )
        .bind(delta)
        .bind(asset_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ImageStoreError::NotFound(asset_id.to_string()));
        }

        Ok(())
    }

    async fn insert(&self, image: &NewImage) -> ImageStoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO images
                (image_id, created_at, liked_count, uploaded_by, file_name,
                 download_url, preview_link, is_approved, marked_for_review)
            VALUES ($1, CURRENT_TIMESTAMP, 0, $2, $3, $4, $5, FALSE, FALSE)
            ",
        )
        .bind(&image.asset_id)
        .bind(&image.uploaded_by)
        .bind(&image.file_name)
        .bind(&image.download_url)
        .bind(&image.preview_link)
        .execute(&self.pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                ImageStoreError::AlreadyExists(image.asset_id.clone())
            }
            other => other.into(),
        })?;

        Ok(())
    }

    async fn update_preview_link(
        &self,
        asset_id: &str,
        preview_link: &str,
    ) -> ImageStoreResult<()> {
        let result = sqlx::query("UPDATE images SET preview_link = $1 WHERE image_id = $2")
            .bind(preview_link)
            .bind(asset_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ImageStoreError::NotFound(asset_id.to_string()));
        }

        Ok(())
    }

    async fn list_approved(&self, page: &PageRequest) -> ImageStoreResult<Vec<ImageSummary>> {
        let rows = sqlx::query_as::<_, ImageSummary>(&list_approved_query(page))
            .bind(i64::from(page.page_size))
            .bind(page.offset())
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    async fn count_approved(&self) -> ImageStoreResult<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM images WHERE is_approved")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}
