//! Integration tests for search and query-time tagging.
//!
//! Posts are written through the storage API so the FTS5 triggers keep the
//! index current; nothing here touches `posts_fts` directly.

use blogroll::storage::{Blog, Database, DatabaseOptions, NewBlog, NewPost};
use chrono::{Duration, TimeZone, Utc};
use pretty_assertions::assert_eq;

async fn setup(max_tags: usize) -> (Database, Blog) {
    let db = Database::open_with(
        ":memory:",
        DatabaseOptions {
            max_tags_per_article: max_tags,
            ..DatabaseOptions::default()
        },
    )
    .await
    .unwrap();
    let blog = db
        .create_blog(&NewBlog {
            feed_url: "https://blog.example.com/feed.xml".to_string(),
            site_url: "https://blog.example.com/".to_string(),
            title: "Example".to_string(),
        })
        .await
        .unwrap();
    (db, blog)
}

async fn add_post(db: &Database, blog: &Blog, slug: &str, title: &str, content: &str, day: i64) {
    db.create_post(&NewPost {
        blog_id: blog.id,
        url: format!("https://blog.example.com/{}", slug),
        title: title.to_string(),
        content: content.to_string(),
        published_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(day),
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_search_returns_only_matching_post() {
    let (db, blog) = setup(3).await;
    add_post(&db, &blog, "one", "One", "content about python", 0).await;
    add_post(&db, &blog, "two", "Two", "content about nothing", 1).await;

    let results = db.search_articles("python", 10, 0).await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].url, "https://blog.example.com/one");
    assert_eq!(results[0].blog_title, "Example");
    assert!(results[0].score.unwrap_or_default() > 0.0);
    assert_eq!(db.count_search("python").await.unwrap(), 1);
}

#[tokio::test]
async fn test_search_ranks_denser_match_first() {
    let (db, blog) = setup(3).await;
    add_post(&db, &blog, "light", "Light", "a passing mention of tokio among many other words here", 5).await;
    add_post(&db, &blog, "heavy", "Heavy", "tokio tokio tokio", 0).await;
    add_post(&db, &blog, "none", "None", "unrelated", 3).await;

    let results = db.search_articles("tokio", 10, 0).await.unwrap();
    let urls: Vec<&str> = results.iter().map(|a| a.url.as_str()).collect();
    assert_eq!(
        urls,
        vec![
            "https://blog.example.com/heavy",
            "https://blog.example.com/light"
        ]
    );
}

#[tokio::test]
async fn test_tags_ranked_by_relevance() {
    let (db, blog) = setup(3).await;
    db.create_tag("go").await.unwrap();
    db.create_tag("rust").await.unwrap();
    db.create_tag("haskell").await.unwrap();
    add_post(&db, &blog, "first", "First", "rust rust rust go", 1).await;
    add_post(&db, &blog, "second", "Second", "go", 0).await;

    let articles = db.list_articles(10, 0).await.unwrap();
    assert_eq!(articles[0].url, "https://blog.example.com/first");
    assert_eq!(articles[0].tags, vec!["rust", "go"]);
    assert_eq!(articles[1].tags, vec!["go"]);
}

#[tokio::test]
async fn test_tag_ties_broken_by_name() {
    let (db, blog) = setup(3).await;
    db.create_tag("beta").await.unwrap();
    db.create_tag("Alpha").await.unwrap();
    add_post(&db, &blog, "only", "Only", "alpha beta", 0).await;

    let articles = db.list_articles(10, 0).await.unwrap();
    assert_eq!(articles[0].tags, vec!["Alpha", "beta"]);
}

#[tokio::test]
async fn test_tags_truncated_to_limit() {
    let (db, blog) = setup(2).await;
    for tag in ["one", "two", "three", "four"] {
        db.create_tag(tag).await.unwrap();
    }
    add_post(&db, &blog, "p", "P", "one two three four", 0).await;

    let articles = db.list_articles(10, 0).await.unwrap();
    assert_eq!(articles[0].tags.len(), 2);
}

#[tokio::test]
async fn test_deleted_tag_no_longer_attached() {
    let (db, blog) = setup(3).await;
    db.create_tag("sqlite").await.unwrap();
    add_post(&db, &blog, "p", "P", "notes on sqlite", 0).await;
    assert_eq!(db.list_articles(10, 0).await.unwrap()[0].tags, vec!["sqlite"]);

    db.delete_tag("SQLite").await.unwrap();
    assert!(db.list_articles(10, 0).await.unwrap()[0].tags.is_empty());
}

#[tokio::test]
async fn test_list_pagination_newest_first() {
    let (db, blog) = setup(3).await;
    for day in 0..5 {
        add_post(&db, &blog, &format!("p{}", day), "Post", "body", day).await;
    }

    let mut pages: Vec<Vec<String>> = Vec::new();
    for offset in [0, 2, 4] {
        let page = db.list_articles(2, offset).await.unwrap();
        pages.push(page.into_iter().map(|a| a.url).collect());
    }

    assert_eq!(
        pages,
        vec![
            vec![
                "https://blog.example.com/p4".to_string(),
                "https://blog.example.com/p3".to_string()
            ],
            vec![
                "https://blog.example.com/p2".to_string(),
                "https://blog.example.com/p1".to_string()
            ],
            vec!["https://blog.example.com/p0".to_string()],
        ]
    );
    assert_eq!(db.count_articles().await.unwrap(), 5);
}

#[tokio::test]
async fn test_index_consistent_after_writes_and_rebuild() {
    let (db, blog) = setup(3).await;
    add_post(&db, &blog, "a", "A", "first body", 0).await;
    add_post(&db, &blog, "b", "B", "second body", 1).await;
    db.delete_blog(blog.id).await.unwrap();

    let report = db.check_search_consistency().await.unwrap();
    assert!(report.is_consistent, "{:?}", report);
    assert_eq!(report.posts_count, 0);

    let (db, blog) = setup(3).await;
    add_post(&db, &blog, "c", "C", "third body", 0).await;
    assert_eq!(db.rebuild_search_index().await.unwrap(), 1);
    assert_eq!(db.search_articles("third", 10, 0).await.unwrap().len(), 1);
}
