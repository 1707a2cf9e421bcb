//! Filter-predicate builder for the news feed.
//!
//! A [`FeedQuery`] starts as "every visible article, newest first" and is
//! narrowed by a fixed sequence of pure steps. Each step takes the query by
//! value and returns the refined query, so every stage can be exercised on
//! its own. [`FeedQuery::push_conditions`] compiles the result into the
//! `WHERE` clause of a SQLite statement over `articles a`.

use chrono::{DateTime, Duration, Utc};
use sqlx::{QueryBuilder, Sqlite};

use crate::db::{format_timestamp, push_id_list};
use crate::feed::FeedError;

/// Trending only considers articles created within this many days
pub const TRENDING_WINDOW_DAYS: i64 = 5;

const INDEPENDENT: &str = "independent";
const PREFERENCE: &str = "preference";
const TRENDING: &str = "trending";

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Visible,
    Independent(bool),
    /// FTS5 match expression over headline, body, agency, category and tag names
    Matches(String),
    InCategories(Vec<i64>),
    CategoryNamed(Vec<String>),
    Tagged(Vec<i64>),
    CreatedAfter(DateTime<Utc>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ranking {
    /// Descending id
    Newest,
    /// Time-decayed vote score, computed outside the database
    Trending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedQuery {
    pub filters: Vec<Filter>,
    pub ranking: Ranking,
}

impl FeedQuery {
    pub fn visible() -> Self {
        Self {
            filters: vec![Filter::Visible],
            ranking: Ranking::Newest,
        }
    }

    fn and(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Append ` WHERE ...` for all filters. Always emits a WHERE clause so
    /// callers can continue with ` AND ...`.
    pub fn push_conditions(&self, builder: &mut QueryBuilder<'_, Sqlite>) {
        builder.push(" WHERE ");
        if self.filters.is_empty() {
            builder.push("1");
        }
        for (i, filter) in self.filters.iter().enumerate() {
            if i > 0 {
                builder.push(" AND ");
            }
            match filter {
                Filter::Visible => {
                    builder.push("a.visibility = 1");
                }
                Filter::Independent(flag) => {
                    builder.push("a.independent = ");
                    builder.push_bind(*flag);
                }
                Filter::Matches(expression) => {
                    builder.push(
                        "a.id IN (SELECT rowid FROM article_search WHERE article_search MATCH ",
                    );
                    builder.push_bind(expression.clone());
                    builder.push(")");
                }
                Filter::InCategories(ids) if ids.is_empty() => {
                    builder.push("0");
                }
                Filter::InCategories(ids) => {
                    builder.push(
                        "EXISTS (SELECT 1 FROM article_categories ac \
                         WHERE ac.article_id = a.id AND ac.category_id IN (",
                    );
                    push_id_list(builder, ids);
                    builder.push("))");
                }
                Filter::CategoryNamed(names) if names.is_empty() => {
                    builder.push("0");
                }
                Filter::CategoryNamed(names) => {
                    builder.push(
                        "EXISTS (SELECT 1 FROM article_categories ac \
                         JOIN categories c ON c.id = ac.category_id \
                         WHERE ac.article_id = a.id AND c.name IN (",
                    );
                    let mut list = builder.separated(", ");
                    for name in names {
                        list.push_bind(name.clone());
                    }
                    builder.push("))");
                }
                Filter::Tagged(ids) if ids.is_empty() => {
                    builder.push("0");
                }
                Filter::Tagged(ids) => {
                    builder.push(
                        "EXISTS (SELECT 1 FROM article_tags t \
                         WHERE t.article_id = a.id AND t.tag_id IN (",
                    );
                    push_id_list(builder, ids);
                    builder.push("))");
                }
                Filter::CreatedAfter(threshold) => {
                    builder.push("a.created_at > ");
                    builder.push_bind(format_timestamp(*threshold));
                }
            }
        }
    }
}

/// Category tokens split into reserved flags and literal category names
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategoryTokens {
    pub independent: bool,
    pub preference: bool,
    pub trending: bool,
    pub literals: Vec<String>,
}

impl CategoryTokens {
    pub fn classify<S: AsRef<str>>(tokens: &[S]) -> Self {
        let mut classified = Self::default();
        for token in tokens {
            match token.as_ref() {
                INDEPENDENT => classified.independent = true,
                PREFERENCE => classified.preference = true,
                TRENDING => classified.trending = true,
                literal => {
                    if !classified.literals.iter().any(|l| l == literal) {
                        classified.literals.push(literal.to_string());
                    }
                }
            }
        }
        classified
    }
}

/// What the datastore knows about the viewer's category preference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preference {
    /// `preference` token not present, nothing was looked up
    NotRequested,
    /// `preference` requested without an authenticated viewer
    Anonymous,
    /// Authenticated viewer without a stored preference record
    Unset,
    Categories(Vec<i64>),
}

/// Outcome of the category decision table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryPlan {
    pub independent: bool,
    pub categories: Option<Vec<i64>>,
    pub trending: bool,
    /// Only populated when not trending
    pub literals: Vec<String>,
}

impl CategoryPlan {
    /// Applies the reserved tokens in order: independent, preference,
    /// trending, then literal names.
    pub fn decide(tokens: &CategoryTokens, preference: Preference) -> Result<Self, FeedError> {
        let mut trending = tokens.trending;
        let mut categories = None;

        if tokens.preference {
            match preference {
                Preference::Anonymous => return Err(FeedError::Unauthenticated),
                Preference::Unset | Preference::NotRequested => trending = true,
                Preference::Categories(ids) => categories = Some(ids),
            }
        }

        let literals = if trending {
            Vec::new()
        } else {
            tokens.literals.clone()
        };

        Ok(Self {
            independent: tokens.independent,
            categories,
            trending,
            literals,
        })
    }
}

/// Quote every word so user input never reaches FTS5 operator syntax.
/// Words are implicitly ANDed. Words without any letter or digit would
/// tokenize to nothing and are dropped.
pub fn fts_expression(term: &str) -> Option<String> {
    let words: Vec<String> = term
        .split_whitespace()
        .filter(|word| word.chars().any(char::is_alphanumeric))
        .map(|word| format!("\"{}\"", word.replace('"', "\"\"")))
        .collect();
    if words.is_empty() {
        None
    } else {
        Some(words.join(" "))
    }
}

pub fn filter_search(query: FeedQuery, term: Option<&str>) -> FeedQuery {
    match term.and_then(fts_expression) {
        Some(expression) => query.and(Filter::Matches(expression)),
        None => query,
    }
}

pub fn filter_origin(query: FeedQuery, plan: &CategoryPlan) -> FeedQuery {
    query.and(Filter::Independent(plan.independent))
}

pub fn filter_preference(query: FeedQuery, plan: &CategoryPlan) -> FeedQuery {
    match &plan.categories {
        Some(ids) => query.and(Filter::InCategories(ids.clone())),
        None => query,
    }
}

pub fn rank_trending(query: FeedQuery, plan: &CategoryPlan, now: DateTime<Utc>) -> FeedQuery {
    if !plan.trending {
        return query;
    }
    let mut query = query.and(Filter::CreatedAfter(now - Duration::days(TRENDING_WINDOW_DAYS)));
    query.ranking = Ranking::Trending;
    query
}

pub fn filter_category_names(query: FeedQuery, plan: &CategoryPlan) -> FeedQuery {
    if plan.literals.is_empty() {
        query
    } else {
        query.and(Filter::CategoryNamed(plan.literals.clone()))
    }
}

pub fn filter_tags(query: FeedQuery, tags: &[i64]) -> FeedQuery {
    if tags.is_empty() {
        query
    } else {
        query.and(Filter::Tagged(tags.to_vec()))
    }
}

/// Run every step in order over the visible base query
pub fn build(plan: &CategoryPlan, search: Option<&str>, tags: &[i64], now: DateTime<Utc>) -> FeedQuery {
    let query = FeedQuery::visible();
    let query = filter_search(query, search);
    let query = filter_origin(query, plan);
    let query = filter_preference(query, plan);
    let query = rank_trending(query, plan, now);
    let query = filter_category_names(query, plan);
    filter_tags(query, tags)
}
