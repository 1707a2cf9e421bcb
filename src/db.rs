use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sqlx::{
    sqlite::SqlitePoolOptions, FromRow, QueryBuilder, Sqlite, SqliteConnection, SqlitePool,
};

use crate::pagination::{IdSlice, PAGE_SIZE};
use crate::query::FeedQuery;
use crate::trending::TrendingCandidate;

#[derive(Debug, Clone, FromRow)]
pub struct Article {
    pub id: i64,
    pub headline: String,
    pub body: String,
    pub image: Option<String>,
    pub news_agency: String,
    pub source: String,
    pub file_type: String,
    pub user_id: Option<i64>,
    pub pos: i64,
    pub neg: i64,
    pub clickable: bool,
    pub visibility: bool,
    pub independent: bool,
    pub time: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct Tag {
    pub id: i64,
    pub name: String,
    pub image: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

impl User {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct SaveRecord {
    pub id: i64,
    #[serde(rename = "user")]
    pub user_id: i64,
    #[serde(rename = "news")]
    pub news_id: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct VoteRecord {
    pub id: i64,
    #[serde(rename = "user")]
    pub user_id: i64,
    #[serde(rename = "news")]
    pub news_id: i64,
    pub polarity: bool,
    pub created_at: String,
}

/// Article as handed over by the ingestion side
#[derive(Debug, Clone)]
pub struct NewArticle {
    pub headline: String,
    pub body: String,
    pub news_agency: String,
    pub source: String,
    pub image: Option<String>,
    pub file_type: String,
    pub user_id: Option<i64>,
    pub independent: bool,
    pub visibility: bool,
    pub clickable: bool,
    pub time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub categories: Vec<i64>,
    pub tags: Vec<i64>,
}

impl NewArticle {
    /// A visible, aggregated article with no categories or tags
    pub fn new(headline: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            headline: headline.to_string(),
            body: String::new(),
            news_agency: "Independent".to_string(),
            source: String::new(),
            image: None,
            file_type: "IMG".to_string(),
            user_id: None,
            independent: false,
            visibility: true,
            clickable: true,
            time: created_at,
            created_at,
            categories: Vec::new(),
            tags: Vec::new(),
        }
    }
}

#[derive(FromRow)]
struct ArticleCategoryRow {
    article_id: i64,
    id: i64,
    name: String,
    image: Option<String>,
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_timestamp(value: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

/// Change to (pos, neg) when a user's vote goes from `before` to `after`
pub fn vote_delta(before: Option<bool>, after: Option<bool>) -> (i64, i64) {
    let weight = |vote: Option<bool>| match vote {
        Some(true) => (1, 0),
        Some(false) => (0, 1),
        None => (0, 0),
    };
    let (old_pos, old_neg) = weight(before);
    let (new_pos, new_neg) = weight(after);
    (new_pos - old_pos, new_neg - old_neg)
}

/// LIMIT and OFFSET for a 1-indexed page of `PAGE_SIZE` rows
fn page_bounds(page: u32) -> (i64, i64) {
    let size = PAGE_SIZE as i64;
    (size, (i64::from(page.max(1)) - 1) * size)
}

pub(crate) fn push_id_list(builder: &mut QueryBuilder<'_, Sqlite>, ids: &[i64]) {
    let mut list = builder.separated(", ");
    for id in ids {
        list.push_bind(*id);
    }
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        email TEXT NOT NULL DEFAULT '',
        first_name TEXT NOT NULL DEFAULT '',
        last_name TEXT NOT NULL DEFAULT ''
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS auth_tokens (
        key TEXT PRIMARY KEY,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS categories (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        image TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tags (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        image TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS articles (
        id INTEGER PRIMARY KEY,
        headline TEXT NOT NULL,
        body TEXT NOT NULL,
        image TEXT,
        news_agency TEXT NOT NULL DEFAULT 'Independent',
        source TEXT NOT NULL,
        file_type TEXT NOT NULL DEFAULT 'IMG',
        user_id INTEGER REFERENCES users(id),
        pos INTEGER NOT NULL DEFAULT 0 CHECK (pos >= 0),
        neg INTEGER NOT NULL DEFAULT 0 CHECK (neg >= 0),
        clickable INTEGER NOT NULL DEFAULT 1,
        visibility INTEGER NOT NULL DEFAULT 0,
        independent INTEGER NOT NULL DEFAULT 0,
        time TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_articles_visible_created
    ON articles(visibility, independent, created_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS article_categories (
        article_id INTEGER NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
        category_id INTEGER NOT NULL REFERENCES categories(id) ON DELETE CASCADE,
        PRIMARY KEY (article_id, category_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS article_tags (
        article_id INTEGER NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
        tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
        PRIMARY KEY (article_id, tag_id)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_article_tags_tag
    ON article_tags(tag_id, article_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_preferences (
        user_id INTEGER PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_preference_categories (
        user_id INTEGER NOT NULL REFERENCES user_preferences(user_id) ON DELETE CASCADE,
        category_id INTEGER NOT NULL REFERENCES categories(id) ON DELETE CASCADE,
        PRIMARY KEY (user_id, category_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS saves (
        id INTEGER PRIMARY KEY,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        news_id INTEGER NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
        created_at TEXT NOT NULL,
        UNIQUE(user_id, news_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS votes (
        id INTEGER PRIMARY KEY,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        news_id INTEGER NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
        polarity INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE(user_id, news_id)
    )
    "#,
    r#"
    CREATE VIRTUAL TABLE IF NOT EXISTS article_search USING fts5(
        headline,
        body,
        news_agency,
        categories,
        tags,
        tokenize = 'porter unicode61'
    )
    "#,
];

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        // Every connection to :memory: opens its own private database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn initialize(&self) -> anyhow::Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    // Users and tokens

    pub async fn create_user(
        &self,
        username: &str,
        first_name: &str,
        last_name: &str,
    ) -> anyhow::Result<i64> {
        let result = sqlx::query(
            "INSERT INTO users (username, email, first_name, last_name) VALUES (?, ?, ?, ?)",
        )
        .bind(username)
        .bind(format!("{}@example.com", username))
        .bind(first_name)
        .bind(last_name)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn insert_token(&self, key: &str, user_id: i64) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO auth_tokens (key, user_id) VALUES (?, ?)")
            .bind(key)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_user_by_token(&self, key: &str) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT u.id, u.username, u.email, u.first_name, u.last_name
            FROM users u
            JOIN auth_tokens t ON t.user_id = u.id
            WHERE t.key = ?
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn users_by_ids(&self, ids: &[i64]) -> anyhow::Result<HashMap<i64, User>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, username, email, first_name, last_name FROM users WHERE id IN (",
        );
        push_id_list(&mut builder, ids);
        builder.push(")");

        let users = builder
            .build_query_as::<User>()
            .fetch_all(&self.pool)
            .await?;
        Ok(users.into_iter().map(|u| (u.id, u)).collect())
    }

    // Categories and tags

    pub async fn create_category(&self, name: &str, image: Option<&str>) -> anyhow::Result<i64> {
        let result = sqlx::query("INSERT INTO categories (name, image) VALUES (?, ?)")
            .bind(name)
            .bind(image)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn list_categories(&self) -> anyhow::Result<Vec<Category>> {
        let categories =
            sqlx::query_as::<_, Category>("SELECT id, name, image FROM categories ORDER BY name, id")
                .fetch_all(&self.pool)
                .await?;
        Ok(categories)
    }

    pub async fn create_tag(&self, name: &str) -> anyhow::Result<i64> {
        let result = sqlx::query("INSERT INTO tags (name) VALUES (?)")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn list_tags(&self) -> anyhow::Result<Vec<Tag>> {
        let tags = sqlx::query_as::<_, Tag>("SELECT id, name, image FROM tags ORDER BY name, id")
            .fetch_all(&self.pool)
            .await?;
        Ok(tags)
    }

    pub async fn categories_for_articles(
        &self,
        article_ids: &[i64],
    ) -> anyhow::Result<HashMap<i64, Vec<Category>>> {
        let mut by_article: HashMap<i64, Vec<Category>> = HashMap::new();
        if article_ids.is_empty() {
            return Ok(by_article);
        }
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            r#"
            SELECT ac.article_id, c.id, c.name, c.image
            FROM article_categories ac
            JOIN categories c ON c.id = ac.category_id
            WHERE ac.article_id IN ("#,
        );
        push_id_list(&mut builder, article_ids);
        builder.push(") ORDER BY c.id");

        let rows = builder
            .build_query_as::<ArticleCategoryRow>()
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            by_article.entry(row.article_id).or_default().push(Category {
                id: row.id,
                name: row.name,
                image: row.image,
            });
        }
        Ok(by_article)
    }

    // Articles

    pub async fn insert_article(&self, article: &NewArticle) -> anyhow::Result<i64> {
        let mut tx = self.pool.begin().await?;

        let id = sqlx::query(
            r#"
            INSERT INTO articles (
                headline, body, image, news_agency, source, file_type, user_id,
                clickable, visibility, independent, time, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&article.headline)
        .bind(&article.body)
        .bind(&article.image)
        .bind(&article.news_agency)
        .bind(&article.source)
        .bind(&article.file_type)
        .bind(article.user_id)
        .bind(article.clickable)
        .bind(article.visibility)
        .bind(article.independent)
        .bind(format_timestamp(article.time))
        .bind(format_timestamp(article.created_at))
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        for category_id in &article.categories {
            sqlx::query("INSERT OR IGNORE INTO article_categories (article_id, category_id) VALUES (?, ?)")
                .bind(id)
                .bind(category_id)
                .execute(&mut *tx)
                .await?;
        }
        for tag_id in &article.tags {
            sqlx::query("INSERT OR IGNORE INTO article_tags (article_id, tag_id) VALUES (?, ?)")
                .bind(id)
                .bind(tag_id)
                .execute(&mut *tx)
                .await?;
        }

        reindex_article(&mut *tx, id).await?;
        tx.commit().await?;

        Ok(id)
    }

    pub async fn get_article(&self, id: i64) -> anyhow::Result<Option<Article>> {
        let article = sqlx::query_as::<_, Article>("SELECT * FROM articles WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(article)
    }

    /// Articles for the given ids, in no particular order
    pub async fn articles_by_ids(&self, ids: &[i64]) -> anyhow::Result<Vec<Article>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM articles WHERE id IN (");
        push_id_list(&mut builder, ids);
        builder.push(")");

        let articles = builder
            .build_query_as::<Article>()
            .fetch_all(&self.pool)
            .await?;
        Ok(articles)
    }

    // Feed queries

    pub async fn fetch_feed_ids(&self, query: &FeedQuery, slice: IdSlice) -> anyhow::Result<Vec<i64>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT a.id FROM articles a");
        query.push_conditions(&mut builder);
        slice.push_bounds(&mut builder);

        let rows: Vec<(i64,)> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn fetch_trending_candidates(
        &self,
        query: &FeedQuery,
    ) -> anyhow::Result<Vec<TrendingCandidate>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT a.id, a.created_at, a.pos, a.neg FROM articles a");
        query.push_conditions(&mut builder);

        let rows: Vec<(i64, String, i64, i64)> =
            builder.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|(id, created_at, pos, neg)| {
                Ok(TrendingCandidate {
                    id,
                    created_at: parse_timestamp(&created_at)?,
                    pos,
                    neg,
                })
            })
            .collect()
    }

    /// Visible articles sharing tags with `anchor`, most shared tags first.
    /// `None` when the anchor itself is missing or hidden.
    pub async fn similar_article_ids(&self, anchor: i64) -> anyhow::Result<Option<Vec<i64>>> {
        let exists: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM articles WHERE id = ? AND visibility = 1")
                .bind(anchor)
                .fetch_optional(&self.pool)
                .await?;
        if exists.is_none() {
            return Ok(None);
        }

        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT a.id
            FROM articles a
            JOIN article_tags t ON t.article_id = a.id
            WHERE t.tag_id IN (SELECT tag_id FROM article_tags WHERE article_id = ?1)
              AND a.id != ?1
              AND a.visibility = 1
            GROUP BY a.id
            ORDER BY COUNT(*) DESC, a.id DESC
            "#,
        )
        .bind(anchor)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(rows.into_iter().map(|(id,)| id).collect()))
    }

    // Preferences

    /// Category ids of the user's stored preference, `None` if no record exists
    pub async fn preference_category_ids(&self, user_id: i64) -> anyhow::Result<Option<Vec<i64>>> {
        let record: Option<(i64,)> =
            sqlx::query_as("SELECT user_id FROM user_preferences WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        if record.is_none() {
            return Ok(None);
        }

        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT category_id FROM user_preference_categories WHERE user_id = ? ORDER BY category_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(Some(rows.into_iter().map(|(id,)| id).collect()))
    }

    pub async fn get_preference(&self, user_id: i64) -> anyhow::Result<Option<Vec<Category>>> {
        let record: Option<(i64,)> =
            sqlx::query_as("SELECT user_id FROM user_preferences WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        if record.is_none() {
            return Ok(None);
        }

        let categories = sqlx::query_as::<_, Category>(
            r#"
            SELECT c.id, c.name, c.image
            FROM user_preference_categories p
            JOIN categories c ON c.id = p.category_id
            WHERE p.user_id = ?
            ORDER BY c.name, c.id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(Some(categories))
    }

    /// Replace the user's preference set, creating the record if needed.
    /// Unknown category ids are ignored.
    pub async fn set_preference(&self, user_id: i64, category_ids: &[i64]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT OR IGNORE INTO user_preferences (user_id) VALUES (?)")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM user_preference_categories WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        for category_id in category_ids {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO user_preference_categories (user_id, category_id)
                SELECT ?, id FROM categories WHERE id = ?
                "#,
            )
            .bind(user_id)
            .bind(category_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    // Bookmarks

    /// Bookmark an article; returns the existing record if already saved,
    /// `None` if the article does not exist.
    pub async fn create_save(
        &self,
        user_id: i64,
        news_id: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<SaveRecord>> {
        let result = sqlx::query(
            r#"
            INSERT INTO saves (user_id, news_id, created_at)
            SELECT ?, id, ? FROM articles WHERE id = ?
            ON CONFLICT(user_id, news_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(format_timestamp(now))
        .bind(news_id)
        .execute(&self.pool)
        .await?;
        tracing::debug!(user_id, news_id, inserted = result.rows_affected(), "create_save");

        let save = sqlx::query_as::<_, SaveRecord>(
            "SELECT id, user_id, news_id, created_at FROM saves WHERE user_id = ? AND news_id = ?",
        )
        .bind(user_id)
        .bind(news_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(save)
    }

    /// One page of the user's bookmarks, newest first
    pub async fn list_saves(&self, user_id: i64, page: u32) -> anyhow::Result<Vec<SaveRecord>> {
        let (limit, offset) = page_bounds(page);
        let saves = sqlx::query_as::<_, SaveRecord>(
            r#"
            SELECT id, user_id, news_id, created_at FROM saves
            WHERE user_id = ?
            ORDER BY created_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(saves)
    }

    /// Returns false when the bookmark does not exist or belongs to someone else
    pub async fn delete_save(&self, user_id: i64, save_id: i64) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM saves WHERE id = ? AND user_id = ?")
            .bind(save_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn saves_for_articles(
        &self,
        user_id: i64,
        article_ids: &[i64],
    ) -> anyhow::Result<HashMap<i64, SaveRecord>> {
        if article_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, user_id, news_id, created_at FROM saves WHERE user_id = ",
        );
        builder.push_bind(user_id);
        builder.push(" AND news_id IN (");
        push_id_list(&mut builder, article_ids);
        builder.push(")");

        let saves = builder
            .build_query_as::<SaveRecord>()
            .fetch_all(&self.pool)
            .await?;
        Ok(saves.into_iter().map(|s| (s.news_id, s)).collect())
    }

    // Votes

    /// Cast or flip a vote. Counters on the article move in the same
    /// transaction as the vote row. `None` if the article does not exist.
    pub async fn record_vote(
        &self,
        user_id: i64,
        news_id: i64,
        polarity: bool,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<VoteRecord>> {
        let mut tx = self.pool.begin().await?;

        if !lock_article(&mut *tx, news_id).await? {
            return Ok(None);
        }

        let previous: Option<(i64, bool)> =
            sqlx::query_as("SELECT id, polarity FROM votes WHERE user_id = ? AND news_id = ?")
                .bind(user_id)
                .bind(news_id)
                .fetch_optional(&mut *tx)
                .await?;

        let (pos, neg) = vote_delta(previous.map(|(_, p)| p), Some(polarity));
        adjust_counters(&mut *tx, news_id, pos, neg).await?;

        let vote_id = match previous {
            Some((id, _)) => {
                sqlx::query("UPDATE votes SET polarity = ? WHERE id = ?")
                    .bind(polarity)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                id
            }
            None => sqlx::query(
                "INSERT INTO votes (user_id, news_id, polarity, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(user_id)
            .bind(news_id)
            .bind(polarity)
            .bind(format_timestamp(now))
            .execute(&mut *tx)
            .await?
            .last_insert_rowid(),
        };

        let vote = sqlx::query_as::<_, VoteRecord>(
            "SELECT id, user_id, news_id, polarity, created_at FROM votes WHERE id = ?",
        )
        .bind(vote_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(vote))
    }

    /// Retract a vote and roll back its counter. Returns false when the vote
    /// does not exist or belongs to someone else.
    pub async fn delete_vote(&self, user_id: i64, vote_id: i64) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;

        let vote: Option<(i64, bool)> = sqlx::query_as(
            "DELETE FROM votes WHERE id = ? AND user_id = ? RETURNING news_id, polarity",
        )
        .bind(vote_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((news_id, polarity)) = vote else {
            return Ok(false);
        };

        let (pos, neg) = vote_delta(Some(polarity), None);
        adjust_counters(&mut *tx, news_id, pos, neg).await?;

        tx.commit().await?;
        Ok(true)
    }

    /// One page of the user's votes, newest first
    pub async fn list_votes(&self, user_id: i64, page: u32) -> anyhow::Result<Vec<VoteRecord>> {
        let (limit, offset) = page_bounds(page);
        let votes = sqlx::query_as::<_, VoteRecord>(
            r#"
            SELECT id, user_id, news_id, polarity, created_at FROM votes
            WHERE user_id = ?
            ORDER BY created_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(votes)
    }

    pub async fn votes_for_articles(
        &self,
        user_id: i64,
        article_ids: &[i64],
    ) -> anyhow::Result<HashMap<i64, VoteRecord>> {
        if article_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, user_id, news_id, polarity, created_at FROM votes WHERE user_id = ",
        );
        builder.push_bind(user_id);
        builder.push(" AND news_id IN (");
        push_id_list(&mut builder, article_ids);
        builder.push(")");

        let votes = builder
            .build_query_as::<VoteRecord>()
            .fetch_all(&self.pool)
            .await?;
        Ok(votes.into_iter().map(|v| (v.news_id, v)).collect())
    }

    /// Recorded (positive, negative) votes for an article, counted from the votes table
    pub async fn count_votes(&self, news_id: i64) -> anyhow::Result<(i64, i64)> {
        let counts: (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN polarity THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN polarity THEN 0 ELSE 1 END), 0)
            FROM votes WHERE news_id = ?
            "#,
        )
        .bind(news_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(counts)
    }
}

/// Touch the article row so a deferred transaction holds the write lock
/// before it reads anything. False when the article does not exist.
async fn lock_article(conn: &mut SqliteConnection, news_id: i64) -> anyhow::Result<bool> {
    let result = sqlx::query("UPDATE articles SET pos = pos WHERE id = ?")
        .bind(news_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

async fn adjust_counters(
    conn: &mut SqliteConnection,
    news_id: i64,
    pos: i64,
    neg: i64,
) -> anyhow::Result<()> {
    sqlx::query("UPDATE articles SET pos = pos + ?, neg = neg + ? WHERE id = ?")
        .bind(pos)
        .bind(neg)
        .bind(news_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Rebuild the full-text row of one article from its own columns plus the
/// names of its categories and tags.
async fn reindex_article(conn: &mut SqliteConnection, article_id: i64) -> anyhow::Result<()> {
    sqlx::query("DELETE FROM article_search WHERE rowid = ?")
        .bind(article_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        r#"
        INSERT INTO article_search (rowid, headline, body, news_agency, categories, tags)
        SELECT
            a.id,
            a.headline,
            a.body,
            a.news_agency,
            COALESCE((
                SELECT group_concat(c.name, ' ')
                FROM article_categories ac JOIN categories c ON c.id = ac.category_id
                WHERE ac.article_id = a.id
            ), ''),
            COALESCE((
                SELECT group_concat(t.name, ' ')
                FROM article_tags at2 JOIN tags t ON t.id = at2.tag_id
                WHERE at2.article_id = a.id
            ), '')
        FROM articles a
        WHERE a.id = ?
        "#,
    )
    .bind(article_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
