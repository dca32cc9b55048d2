use sqlx::QueryBuilder;
use std::collections::HashMap;

use super::schema::Database;
use super::types::{Article, ArticleRow, DatabaseError, SearchConsistencyReport};

// ============================================================================
// Query Translation
// ============================================================================

const MAX_QUERY_LENGTH: usize = 256;
const MAX_QUERY_TERMS: usize = 16;

/// Maximum number of articles returned by a single page (OOM protection)
pub const MAX_PAGE_SIZE: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Term { text: String, negated: bool },
    Or,
}

/// Split user input into search terms.
///
/// Supports bare words, `"quoted phrases"`, `-excluded` terms and `or`.
/// Everything that isn't a letter or digit separates words, so no input can
/// smuggle FTS5 operators or syntax into the query.
fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    let mut negate = false;
    let mut prev: Option<char> = None;

    while let Some(c) = chars.next() {
        if c == '"' {
            let phrase: String = chars.by_ref().take_while(|&c| c != '"').collect();
            let words = words_of(&phrase);
            if !words.is_empty() {
                tokens.push(Token::Term {
                    text: words.join(" "),
                    negated: negate,
                });
            }
            negate = false;
            prev = Some('"');
        } else if c == '-' && prev.map_or(true, char::is_whitespace) {
            negate = true;
            prev = Some(c);
        } else if c.is_alphanumeric() {
            let mut word = String::from(c);
            while let Some(&next) = chars.peek() {
                if !next.is_alphanumeric() {
                    break;
                }
                word.push(next);
                chars.next();
            }
            prev = word.chars().last();
            if !negate && word.eq_ignore_ascii_case("or") {
                tokens.push(Token::Or);
            } else {
                tokens.push(Token::Term {
                    text: word,
                    negated: negate,
                });
            }
            negate = false;
        } else {
            negate = false;
            prev = Some(c);
        }
    }

    tokens
}

fn words_of(text: &str) -> Vec<&str> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect()
}

fn quote(term: &str) -> String {
    format!("\"{}\"", term.replace('"', "\"\""))
}

/// Translate a web-style search string into an FTS5 MATCH expression.
///
/// Adjacent terms are ANDed; `or` joins its neighbours into one group.
/// Returns `Ok(None)` when nothing searchable remains (empty input, or only
/// excluded terms).
pub(crate) fn to_fts_query(input: &str) -> Result<Option<String>, DatabaseError> {
    let input = input.trim();
    if input.len() > MAX_QUERY_LENGTH {
        return Err(DatabaseError::InvalidInput(format!(
            "search query exceeds maximum length of {} characters",
            MAX_QUERY_LENGTH
        )));
    }

    let tokens = tokenize(input);
    let term_count = tokens
        .iter()
        .filter(|t| matches!(t, Token::Term { .. }))
        .count();
    if term_count > MAX_QUERY_TERMS {
        return Err(DatabaseError::InvalidInput(format!(
            "search query has more than {} terms",
            MAX_QUERY_TERMS
        )));
    }

    let mut groups: Vec<Vec<String>> = Vec::new();
    let mut excluded: Vec<String> = Vec::new();
    let mut pending_or = false;

    for token in tokens {
        match token {
            Token::Or => pending_or = !groups.is_empty(),
            Token::Term { text, negated: true } => {
                excluded.push(quote(&text));
                pending_or = false;
            }
            Token::Term {
                text,
                negated: false,
            } => {
                match groups.last_mut() {
                    Some(group) if pending_or => group.push(quote(&text)),
                    _ => groups.push(vec![quote(&text)]),
                }
                pending_or = false;
            }
        }
    }

    if groups.is_empty() {
        return Ok(None);
    }

    let positive = groups
        .into_iter()
        .map(|group| {
            if group.len() == 1 {
                group.join("")
            } else {
                format!("({})", group.join(" OR "))
            }
        })
        .collect::<Vec<_>>()
        .join(" AND ");

    if excluded.is_empty() {
        return Ok(Some(positive));
    }

    let mut expression = format!("({})", positive);
    for term in excluded {
        expression.push_str(" NOT ");
        expression.push_str(&term);
    }
    Ok(Some(expression))
}

fn page_bounds(limit: usize, offset: usize) -> (i64, i64) {
    (limit.min(MAX_PAGE_SIZE) as i64, offset.min(i64::MAX as usize) as i64)
}

impl Database {
    // ========================================================================
    // Listing and Search
    // ========================================================================

    /// Articles newest first. `limit` is capped at [`MAX_PAGE_SIZE`].
    pub async fn list_articles(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Article>, DatabaseError> {
        let (limit, offset) = page_bounds(limit, offset);
        self.timed(async {
            let rows = sqlx::query_as::<_, ArticleRow>(
                r#"
                SELECT p.id AS post_id, p.blog_id, p.url, p.title, p.published_at,
                       b.title AS blog_title, b.site_url AS blog_site_url,
                       NULL AS score
                FROM posts p
                INNER JOIN blogs b ON b.id = p.blog_id
                ORDER BY p.published_at DESC, p.id DESC
                LIMIT ? OFFSET ?
            "#,
            )
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

            let mut articles: Vec<Article> =
                rows.into_iter().map(ArticleRow::into_article).collect();
            self.attach_tags(&mut articles).await?;
            Ok(articles)
        })
        .await
    }

    /// Articles matching `query`, most relevant first.
    ///
    /// Relevance is FTS5 `bm25` over title and content, reported as a
    /// positive `score`. Ties are broken by recency. An empty query, or one
    /// with only excluded terms, returns no articles.
    pub async fn search_articles(
        &self,
        query: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Article>, DatabaseError> {
        let Some(fts_query) = to_fts_query(query)? else {
            return Ok(Vec::new());
        };
        let (limit, offset) = page_bounds(limit, offset);

        tracing::debug!(query = %query, fts = %fts_query, limit = limit, offset = offset, "search_articles");

        self.timed(async {
            let rows = sqlx::query_as::<_, ArticleRow>(
                r#"
                SELECT p.id AS post_id, p.blog_id, p.url, p.title, p.published_at,
                       b.title AS blog_title, b.site_url AS blog_site_url,
                       -bm25(posts_fts) AS score
                FROM posts_fts
                INNER JOIN posts p ON p.id = posts_fts.rowid
                INNER JOIN blogs b ON b.id = p.blog_id
                WHERE posts_fts MATCH ?
                ORDER BY score DESC, p.published_at DESC, p.id DESC
                LIMIT ? OFFSET ?
            "#,
            )
            .bind(&fts_query)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

            let mut articles: Vec<Article> =
                rows.into_iter().map(ArticleRow::into_article).collect();
            self.attach_tags(&mut articles).await?;
            Ok(articles)
        })
        .await
    }

    pub async fn count_articles(&self) -> Result<i64, DatabaseError> {
        self.timed(async {
            let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts")
                .fetch_one(&self.pool)
                .await?;
            Ok(count.0)
        })
        .await
    }

    /// Number of articles [`Database::search_articles`] can page through.
    pub async fn count_search(&self, query: &str) -> Result<i64, DatabaseError> {
        let Some(fts_query) = to_fts_query(query)? else {
            return Ok(0);
        };
        self.timed(async {
            let count: (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM posts_fts WHERE posts_fts MATCH ?")
                    .bind(&fts_query)
                    .fetch_one(&self.pool)
                    .await?;
            Ok(count.0)
        })
        .await
    }

    /// Attach the best-matching vocabulary tags to each article.
    ///
    /// Every tag name is run as an FTS5 phrase query restricted to this page's
    /// posts. Per post, tags are ordered by score (highest first), then by
    /// name case-insensitively, and truncated to `max_tags_per_article`.
    async fn attach_tags(&self, articles: &mut [Article]) -> Result<(), DatabaseError> {
        if articles.is_empty() || self.max_tags_per_article == 0 {
            return Ok(());
        }

        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            r#"
            SELECT posts_fts.rowid AS post_id, tags.name AS name, -bm25(posts_fts) AS score
            FROM tags CROSS JOIN posts_fts
            WHERE posts_fts MATCH '"' || replace(tags.name, '"', '""') || '"'
              AND posts_fts.rowid IN (
            "#,
        );
        let mut separated = builder.separated(", ");
        for article in articles.iter() {
            separated.push_bind(article.post_id);
        }
        separated.push_unseparated(")");
        builder.push(" ORDER BY post_id, score DESC, name COLLATE NOCASE ASC");

        let rows: Vec<(i64, String, f64)> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await?;

        let mut by_post: HashMap<i64, Vec<String>> = HashMap::new();
        for (post_id, name, _score) in rows {
            let tags = by_post.entry(post_id).or_default();
            if tags.len() < self.max_tags_per_article {
                tags.push(name);
            }
        }

        for article in articles.iter_mut() {
            if let Some(tags) = by_post.remove(&article.post_id) {
                article.tags = tags;
            }
        }
        Ok(())
    }

    // ========================================================================
    // FTS5 Maintenance Operations
    // ========================================================================

    /// Compare `posts` with `posts_fts`: counts, orphaned and missing entries.
    pub async fn check_search_consistency(&self) -> Result<SearchConsistencyReport, DatabaseError> {
        self.timed(async {
            let posts_count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts")
                .fetch_one(&self.pool)
                .await?;

            // External-content tables answer COUNT(*) from the content table,
            // so ask the index itself via the docsize shadow table.
            let indexed: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts_fts_docsize")
                .fetch_one(&self.pool)
                .await?;

            let orphaned: (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM posts_fts_docsize d LEFT JOIN posts p ON d.id = p.id WHERE p.id IS NULL",
            )
            .fetch_one(&self.pool)
            .await?;

            let missing: (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM posts p LEFT JOIN posts_fts_docsize d ON p.id = d.id WHERE d.id IS NULL",
            )
            .fetch_one(&self.pool)
            .await?;

            let is_consistent = orphaned.0 == 0 && missing.0 == 0 && posts_count.0 == indexed.0;

            tracing::debug!(
                posts = posts_count.0,
                indexed = indexed.0,
                orphaned = orphaned.0,
                missing = missing.0,
                is_consistent = is_consistent,
                "Search index consistency check"
            );

            Ok(SearchConsistencyReport {
                posts_count: posts_count.0,
                indexed_count: indexed.0,
                orphaned_entries: orphaned.0,
                missing_entries: missing.0,
                is_consistent,
            })
        })
        .await
    }

    /// Rebuild the FTS5 index from the posts table.
    ///
    /// Returns the number of posts indexed.
    pub async fn rebuild_search_index(&self) -> Result<usize, DatabaseError> {
        self.timed(async {
            sqlx::query("INSERT INTO posts_fts(posts_fts) VALUES('rebuild')")
                .execute(&self.pool)
                .await?;

            let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts")
                .fetch_one(&self.pool)
                .await?;

            tracing::info!(posts = count.0, "Search index rebuilt");
            Ok(count.0 as usize)
        })
        .await
    }
}
