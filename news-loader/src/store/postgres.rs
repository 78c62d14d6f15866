use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};

use crate::companies::CompanyName;
use crate::error::StoreError;
use crate::store::{NewsRow, NewsStore, WriteSummary};

/// A `NewsStore` on top of the `company` and `company_news` PostgreSQL tables.
pub struct PgNewsStore {
    pool: PgPool,
    /// Primary key column of `company`, quoted for use as an identifier.
    company_id_column: String,
}

impl PgNewsStore {
    pub async fn new(
        url: &str,
        max_connections: u32,
        company_id_column: &str,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(Self::from_pool(pool, company_id_column))
    }

    pub fn from_pool(pool: PgPool, company_id_column: &str) -> Self {
        Self {
            pool,
            company_id_column: quote_identifier(company_id_column),
        }
    }
}

fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Insert the company if needed and return its id.
/// A known company keeps its Korean name unless a non-empty one is provided.
async fn upsert_company(
    conn: &mut PgConnection,
    company: &CompanyName,
    id_column: &str,
) -> Result<i64, StoreError> {
    sqlx::query(
        r#"
INSERT INTO company
    (company_name, company_name_kr)
VALUES
    ($1, NULLIF($2, ''))
ON CONFLICT (company_name) DO UPDATE
SET
    company_name_kr = COALESCE(EXCLUDED.company_name_kr, company.company_name_kr)
        "#,
    )
    .bind(&company.name)
    .bind(&company.name_kr)
    .execute(&mut *conn)
    .await
    .map_err(|error| StoreError::QueryError {
        command: "INSERT".to_owned(),
        error,
    })?;

    let select = format!(
        "SELECT {} FROM company WHERE company_name = $1",
        id_column
    );
    let company_id: Option<i64> = sqlx::query_scalar(&select)
        .bind(&company.name)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })?;

    company_id.ok_or_else(|| StoreError::CompanyNotResolved(company.name.clone()))
}

/// Update the row keyed by (company_id, url), returning the number of rows matched.
async fn update_news(
    conn: &mut PgConnection,
    company_id: i64,
    row: &NewsRow,
) -> Result<u64, StoreError> {
    let result = sqlx::query(
        r#"
UPDATE company_news
SET
    title = $1,
    published_at = $2::date,
    thumbnail_url = $3
WHERE
    company_id = $4
    AND url = $5
        "#,
    )
    .bind(&row.title)
    .bind(&row.published_at)
    .bind(&row.thumbnail_url)
    .bind(company_id)
    .bind(&row.url)
    .execute(&mut *conn)
    .await
    .map_err(|error| StoreError::QueryError {
        command: "UPDATE".to_owned(),
        error,
    })?;

    Ok(result.rows_affected())
}

async fn insert_news(
    conn: &mut PgConnection,
    company_id: i64,
    row: &NewsRow,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
INSERT INTO company_news
    (company_id, url, title, published_at, thumbnail_url)
VALUES
    ($1, $2, $3, $4::date, $5)
        "#,
    )
    .bind(company_id)
    .bind(&row.url)
    .bind(&row.title)
    .bind(&row.published_at)
    .bind(&row.thumbnail_url)
    .execute(&mut *conn)
    .await
    .map_err(|error| StoreError::QueryError {
        command: "INSERT".to_owned(),
        error,
    })?;

    Ok(())
}

#[async_trait]
impl NewsStore for PgNewsStore {
    async fn write_batch(
        &self,
        company: &CompanyName,
        rows: &[NewsRow],
    ) -> Result<WriteSummary, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::QueryError {
                command: "BEGIN".to_owned(),
                error,
            })?;

        let company_id = upsert_company(&mut *tx, company, &self.company_id_column).await?;
        let mut summary = WriteSummary {
            company_id,
            ..Default::default()
        };

        for row in rows {
            // PostgreSQL reports matched rows, so an UPDATE that changes nothing still counts.
            if update_news(&mut *tx, company_id, row).await? > 0 {
                summary.updated += 1;
            } else {
                insert_news(&mut *tx, company_id, row).await?;
                summary.inserted += 1;
            }
        }

        tx.commit().await.map_err(|error| StoreError::QueryError {
            command: "COMMIT".to_owned(),
            error,
        })?;

        Ok(summary)
    }
}
