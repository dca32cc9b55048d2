use super::schema::Database;
use super::types::{to_micros, DatabaseError, Tag, TagRow};

const MAX_TAG_LENGTH: usize = 64;

impl Database {
    // ========================================================================
    // Tag Vocabulary
    // ========================================================================

    /// Add a name to the tag vocabulary.
    ///
    /// Names are trimmed and must contain at least one letter or digit (they
    /// are matched against post text as phrases). Uniqueness is
    /// case-insensitive.
    pub async fn create_tag(&self, name: &str) -> Result<Tag, DatabaseError> {
        let name = name.trim();
        if !name.chars().any(char::is_alphanumeric) {
            return Err(DatabaseError::InvalidInput(
                "tag name must contain a letter or digit".to_string(),
            ));
        }
        if name.chars().count() > MAX_TAG_LENGTH {
            return Err(DatabaseError::InvalidInput(format!(
                "tag name exceeds {} characters",
                MAX_TAG_LENGTH
            )));
        }

        let now = to_micros(self.now());
        self.timed(async {
            let row = sqlx::query_as::<_, TagRow>(
                "INSERT INTO tags (name, created_at, updated_at) VALUES (?, ?, ?) \
                 RETURNING id, name, created_at, updated_at",
            )
            .bind(name)
            .bind(now)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
            Ok(row.into_tag())
        })
        .await
    }

    pub async fn list_tags(&self) -> Result<Vec<Tag>, DatabaseError> {
        self.timed(async {
            let rows = sqlx::query_as::<_, TagRow>(
                "SELECT id, name, created_at, updated_at FROM tags ORDER BY name COLLATE NOCASE",
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(rows.into_iter().map(TagRow::into_tag).collect())
        })
        .await
    }

    /// Remove a tag by name (case-insensitive).
    pub async fn delete_tag(&self, name: &str) -> Result<(), DatabaseError> {
        self.timed(async {
            let result = sqlx::query("DELETE FROM tags WHERE name = ?")
                .bind(name.trim())
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(DatabaseError::NotFound);
            }
            Ok(())
        })
        .await
    }
}
