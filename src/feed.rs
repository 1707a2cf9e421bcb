//! The news feed query engine: filter, rank, window, project.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::db::{Database, User};
use crate::pagination::{window_ranked, IdSlice, Window, Windows};
use crate::projection::{project, ArticleView};
use crate::query::{self, CategoryPlan, CategoryTokens, FeedQuery, Preference, Ranking};
use crate::trending;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("User is not Authenticated")]
    Unauthenticated,
    #[error("Article {0} not found")]
    ArticleNotFound(i64),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// One feed request, already validated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedRequest {
    pub anchor: Option<i64>,
    pub categories: Vec<String>,
    pub tags: Vec<i64>,
    pub search: Option<String>,
    pub similar: Option<i64>,
    pub next: u32,
    pub prev: u32,
    pub page: u32,
}

impl Default for FeedRequest {
    fn default() -> Self {
        Self {
            anchor: None,
            categories: Vec::new(),
            tags: Vec::new(),
            search: None,
            similar: None,
            next: 0,
            prev: 0,
            page: 1,
        }
    }
}

impl FeedRequest {
    pub fn window(&self) -> Window {
        Window::new(self.anchor, self.next, self.prev, self.page)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedResult {
    pub next: Vec<ArticleView>,
    pub prev: Vec<ArticleView>,
}

pub struct FeedEngine<'a> {
    db: &'a Database,
    media_base: &'a Url,
}

impl<'a> FeedEngine<'a> {
    pub fn new(db: &'a Database, media_base: &'a Url) -> Self {
        Self { db, media_base }
    }

    pub async fn run(
        &self,
        request: &FeedRequest,
        viewer: Option<&User>,
        now: DateTime<Utc>,
    ) -> Result<FeedResult, FeedError> {
        let windows = self.resolve_ids(request, viewer, now).await?;

        let mut unique: Vec<i64> = windows.next.iter().chain(&windows.prev).copied().collect();
        unique.sort_unstable();
        unique.dedup();

        let views: HashMap<i64, ArticleView> = project(self.db, &unique, viewer, self.media_base)
            .await?
            .into_iter()
            .map(|view| (view.id, view))
            .collect();
        let pick = |ids: &[i64]| -> Vec<ArticleView> {
            ids.iter().filter_map(|id| views.get(id).cloned()).collect()
        };

        Ok(FeedResult {
            next: pick(&windows.next),
            prev: pick(&windows.prev),
        })
    }

    /// Ordered article ids for both windows
    pub async fn resolve_ids(
        &self,
        request: &FeedRequest,
        viewer: Option<&User>,
        now: DateTime<Utc>,
    ) -> Result<Windows<i64>, FeedError> {
        if let Some(anchor) = request.similar {
            let ranked = self
                .db
                .similar_article_ids(anchor)
                .await?
                .ok_or(FeedError::ArticleNotFound(anchor))?;
            debug!(anchor, matches = ranked.len(), "similar articles");
            return Ok(window_ranked(&ranked, Window::Page(request.page)));
        }

        let tokens = CategoryTokens::classify(&request.categories);
        let preference = self.preference(&tokens, viewer).await?;
        let plan = CategoryPlan::decide(&tokens, preference)?;
        let query = query::build(&plan, request.search.as_deref(), &request.tags, now);
        debug!(?plan, ranking = ?query.ranking, "feed query");

        let window = request.window();
        match query.ranking {
            Ranking::Trending => {
                let candidates = self.db.fetch_trending_candidates(&query).await?;
                let ranked = trending::rank(&candidates, now);
                Ok(window_ranked(&ranked, window))
            }
            Ranking::Newest => self.window_by_id(&query, window).await,
        }
    }

    async fn preference(
        &self,
        tokens: &CategoryTokens,
        viewer: Option<&User>,
    ) -> Result<Preference, FeedError> {
        if !tokens.preference {
            return Ok(Preference::NotRequested);
        }
        let Some(user) = viewer else {
            return Ok(Preference::Anonymous);
        };
        Ok(match self.db.preference_category_ids(user.id).await? {
            Some(ids) => Preference::Categories(ids),
            None => Preference::Unset,
        })
    }

    async fn window_by_id(&self, query: &FeedQuery, window: Window) -> Result<Windows<i64>, FeedError> {
        match window {
            Window::Page(page) => {
                let ids = self.db.fetch_feed_ids(query, IdSlice::page(page)).await?;
                Ok(Windows::both(ids))
            }
            Window::Anchored { anchor, next, prev } => {
                let next_ids = if next > 0 {
                    let slice = IdSlice::After {
                        anchor,
                        limit: next as i64,
                    };
                    Some(self.db.fetch_feed_ids(query, slice).await?)
                } else {
                    None
                };
                let prev_ids = if prev > 0 {
                    let slice = IdSlice::Before {
                        anchor,
                        limit: prev as i64,
                    };
                    Some(self.db.fetch_feed_ids(query, slice).await?)
                } else {
                    None
                };
                Ok(Windows::mirrored(next_ids, prev_ids))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewArticle;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap()
    }

    fn media() -> Url {
        Url::parse("http://localhost:3000/media/").unwrap()
    }

    async fn create_test_db() -> Database {
        let db = Database::new("sqlite::memory:").await.unwrap();
        db.initialize().await.unwrap();
        db
    }

    async fn viewer(db: &Database, username: &str) -> User {
        let id = db.create_user(username, "Test", "User").await.unwrap();
        db.users_by_ids(&[id]).await.unwrap().remove(&id).unwrap()
    }

    async fn ids(
        db: &Database,
        request: &FeedRequest,
        viewer: Option<&User>,
    ) -> Result<Windows<i64>, FeedError> {
        FeedEngine::new(db, &media()).resolve_ids(request, viewer, now()).await
    }

    fn request(categories: &[&str]) -> FeedRequest {
        FeedRequest {
            categories: categories.iter().map(|c| c.to_string()).collect(),
            ..FeedRequest::default()
        }
    }

    async fn insert(db: &Database, article: NewArticle) -> i64 {
        db.insert_article(&article).await.unwrap()
    }

    mod filter_tests {
        use super::*;

        #[tokio::test]
        async fn test_hidden_articles_never_returned() {
            let db = create_test_db().await;
            let shown = insert(&db, NewArticle::new("Shown", now())).await;
            let mut hidden = NewArticle::new("Hidden", now());
            hidden.visibility = false;
            insert(&db, hidden).await;

            let windows = ids(&db, &FeedRequest::default(), None).await.unwrap();
            assert_eq!(windows.next, vec![shown]);
        }

        #[tokio::test]
        async fn test_independent_split() {
            let db = create_test_db().await;
            let aggregated = insert(&db, NewArticle::new("Wire", now())).await;
            let mut own = NewArticle::new("Own", now());
            own.independent = true;
            let own = insert(&db, own).await;

            let default = ids(&db, &FeedRequest::default(), None).await.unwrap();
            assert_eq!(default.next, vec![aggregated]);

            let independent = ids(&db, &request(&["independent"]), None).await.unwrap();
            assert_eq!(independent.next, vec![own]);
        }

        #[tokio::test]
        async fn test_literal_categories_deduplicated() {
            let db = create_test_db().await;
            let world = db.create_category("World", None).await.unwrap();
            let tech = db.create_category("Tech", None).await.unwrap();
            let sport = db.create_category("Sport", None).await.unwrap();

            let mut both = NewArticle::new("Both", now());
            both.categories = vec![world, tech];
            let both = insert(&db, both).await;
            let mut other = NewArticle::new("Sport", now());
            other.categories = vec![sport];
            insert(&db, other).await;

            let windows = ids(&db, &request(&["World", "Tech"]), None).await.unwrap();
            assert_eq!(windows.next, vec![both]);
        }

        #[tokio::test]
        async fn test_unknown_category_is_empty_not_error() {
            let db = create_test_db().await;
            insert(&db, NewArticle::new("A", now())).await;

            let windows = ids(&db, &request(&["Nonexistent"]), None).await.unwrap();
            assert!(windows.next.is_empty());
        }

        #[tokio::test]
        async fn test_tag_filter() {
            let db = create_test_db().await;
            let rust = db.create_tag("rust").await.unwrap();
            let mut tagged = NewArticle::new("Tagged", now());
            tagged.tags = vec![rust];
            let tagged = insert(&db, tagged).await;
            insert(&db, NewArticle::new("Plain", now())).await;

            let request = FeedRequest {
                tags: vec![rust],
                ..FeedRequest::default()
            };
            let windows = ids(&db, &request, None).await.unwrap();
            assert_eq!(windows.next, vec![tagged]);
        }

        #[tokio::test]
        async fn test_article_with_several_requested_tags_appears_once() {
            let db = create_test_db().await;
            let rust = db.create_tag("rust").await.unwrap();
            let async_tag = db.create_tag("async").await.unwrap();

            let mut both = NewArticle::new("Both", now());
            both.tags = vec![rust, async_tag];
            let both = insert(&db, both).await;
            let mut one = NewArticle::new("One", now());
            one.tags = vec![async_tag];
            let one = insert(&db, one).await;

            let request = FeedRequest {
                tags: vec![rust, async_tag],
                ..FeedRequest::default()
            };
            let windows = ids(&db, &request, None).await.unwrap();
            assert_eq!(windows.next, vec![one, both]);

            let result = FeedEngine::new(&db, &media())
                .run(&request, None, now())
                .await
                .unwrap();
            assert_eq!(result.next.len(), 2);
        }

        #[tokio::test]
        async fn test_search_covers_category_and_tag_names() {
            let db = create_test_db().await;
            let politics = db.create_category("Politics", None).await.unwrap();
            let climate = db.create_tag("climate").await.unwrap();

            let mut by_category = NewArticle::new("Budget vote", now());
            by_category.categories = vec![politics];
            let by_category = insert(&db, by_category).await;

            let mut by_tag = NewArticle::new("Heatwave", now());
            by_tag.tags = vec![climate];
            let by_tag = insert(&db, by_tag).await;

            let mut by_body = NewArticle::new("Markets", now());
            by_body.body = "Investors reacted to the elections".to_string();
            let by_body = insert(&db, by_body).await;

            let search = |term: &str| FeedRequest {
                search: Some(term.to_string()),
                ..FeedRequest::default()
            };

            assert_eq!(ids(&db, &search("politics"), None).await.unwrap().next, vec![by_category]);
            assert_eq!(ids(&db, &search("climate"), None).await.unwrap().next, vec![by_tag]);
            // porter stemming matches "election" against "elections"
            assert_eq!(ids(&db, &search("election"), None).await.unwrap().next, vec![by_body]);
            assert!(ids(&db, &search("heatwave budget"), None).await.unwrap().next.is_empty());
        }

        #[tokio::test]
        async fn test_search_with_fts_operators_is_literal() {
            let db = create_test_db().await;
            insert(&db, NewArticle::new("Plain", now())).await;

            let request = FeedRequest {
                search: Some("\"unbalanced AND (".to_string()),
                ..FeedRequest::default()
            };
            let windows = ids(&db, &request, None).await.unwrap();
            assert!(windows.next.is_empty());
        }
    }

    mod preference_tests {
        use super::*;

        #[tokio::test]
        async fn test_anonymous_preference_is_rejected() {
            let db = create_test_db().await;
            let result = ids(&db, &request(&["preference"]), None).await;
            assert!(matches!(result, Err(FeedError::Unauthenticated)));
        }

        #[tokio::test]
        async fn test_preference_restricts_to_stored_categories() {
            let db = create_test_db().await;
            let user = viewer(&db, "reader").await;
            let a = db.create_category("A", None).await.unwrap();
            let b = db.create_category("B", None).await.unwrap();
            let c = db.create_category("C", None).await.unwrap();
            db.set_preference(user.id, &[a, b]).await.unwrap();

            let mut in_a = NewArticle::new("In A", now());
            in_a.categories = vec![a];
            let in_a = insert(&db, in_a).await;
            let mut in_b = NewArticle::new("In B", now());
            in_b.categories = vec![b, c];
            let in_b = insert(&db, in_b).await;
            let mut in_c = NewArticle::new("In C", now());
            in_c.categories = vec![c];
            insert(&db, in_c).await;

            let windows = ids(&db, &request(&["preference"]), Some(&user)).await.unwrap();
            assert_eq!(windows.next, vec![in_b, in_a]);
        }

        #[tokio::test]
        async fn test_missing_preference_equals_trending() {
            let db = create_test_db().await;
            let user = viewer(&db, "reader").await;
            let voter = viewer(&db, "voter").await;

            let old = insert(&db, NewArticle::new("Old", now() - Duration::days(6))).await;
            let quiet = insert(&db, NewArticle::new("Quiet", now() - Duration::hours(2))).await;
            let loud = insert(&db, NewArticle::new("Loud", now() - Duration::hours(20))).await;
            db.record_vote(voter.id, loud, true, now()).await.unwrap();
            db.record_vote(voter.id, old, true, now()).await.unwrap();

            let fallback = ids(&db, &request(&["preference"]), Some(&user)).await.unwrap();
            let trending = ids(&db, &request(&["trending"]), Some(&user)).await.unwrap();

            assert_eq!(fallback, trending);
            assert_eq!(trending.next, vec![loud, quiet]);
        }

        #[tokio::test]
        async fn test_empty_preference_set_is_empty_feed() {
            let db = create_test_db().await;
            let user = viewer(&db, "reader").await;
            db.set_preference(user.id, &[]).await.unwrap();
            insert(&db, NewArticle::new("A", now())).await;

            let windows = ids(&db, &request(&["preference"]), Some(&user)).await.unwrap();
            assert!(windows.next.is_empty());
        }
    }

    mod trending_tests {
        use super::*;

        #[tokio::test]
        async fn test_trending_ignores_literal_categories() {
            let db = create_test_db().await;
            let world = db.create_category("World", None).await.unwrap();
            let mut in_world = NewArticle::new("World", now() - Duration::hours(1));
            in_world.categories = vec![world];
            let in_world = insert(&db, in_world).await;
            let elsewhere = insert(&db, NewArticle::new("Elsewhere", now() - Duration::hours(1))).await;

            let windows = ids(&db, &request(&["World", "trending"]), None).await.unwrap();
            assert_eq!(windows.next, vec![elsewhere, in_world]);
        }

        #[tokio::test]
        async fn test_trending_anchor_windows_by_rank() {
            let db = create_test_db().await;
            let mut ranked = Vec::new();
            for (i, votes) in [0, 3, 1, 2].iter().enumerate() {
                let id = insert(
                    &db,
                    NewArticle::new(&format!("A{}", i), now() - Duration::hours(3)),
                )
                .await;
                for n in 0..*votes {
                    let user = viewer(&db, &format!("v{}-{}", i, n)).await;
                    db.record_vote(user.id, id, true, now()).await.unwrap();
                }
                ranked.push((id, *votes));
            }
            ranked.sort_by(|a, b| b.1.cmp(&a.1));
            let order: Vec<i64> = ranked.iter().map(|(id, _)| *id).collect();

            let request = FeedRequest {
                categories: vec!["trending".to_string()],
                anchor: Some(order[1]),
                next: 5,
                prev: 5,
                ..FeedRequest::default()
            };
            let windows = ids(&db, &request, None).await.unwrap();
            assert_eq!(windows.next, order[2..].to_vec());
            assert_eq!(windows.prev, vec![order[0]]);
        }
    }

    mod window_tests {
        use super::*;

        async fn seed(db: &Database, count: usize) -> Vec<i64> {
            let mut ids = Vec::new();
            for i in 0..count {
                ids.push(insert(db, NewArticle::new(&format!("A{}", i), now())).await);
            }
            ids
        }

        #[tokio::test]
        async fn test_pages_of_twenty_newest_first() {
            let db = create_test_db().await;
            let all = seed(&db, 45).await;

            let first = ids(&db, &FeedRequest::default(), None).await.unwrap();
            assert_eq!(first.next.len(), 20);
            assert_eq!(first.next[0], all[44]);
            assert_eq!(first.next, first.prev);

            let third = FeedRequest {
                page: 3,
                ..FeedRequest::default()
            };
            let third = ids(&db, &third, None).await.unwrap();
            assert_eq!(third.next, all[..5].iter().rev().copied().collect::<Vec<_>>());

            let beyond = FeedRequest {
                page: 9,
                ..FeedRequest::default()
            };
            assert!(ids(&db, &beyond, None).await.unwrap().next.is_empty());
        }

        #[tokio::test]
        async fn test_next_returns_smallest_greater_ids_ascending() {
            let db = create_test_db().await;
            let all = seed(&db, 10).await;
            let anchor = all[3];

            let request = FeedRequest {
                anchor: Some(anchor),
                next: 3,
                ..FeedRequest::default()
            };
            let windows = ids(&db, &request, None).await.unwrap();
            assert_eq!(windows.next, all[4..7].to_vec());
            assert_eq!(windows.prev, windows.next);
        }

        #[tokio::test]
        async fn test_prev_only_mirrors_into_next() {
            let db = create_test_db().await;
            let all = seed(&db, 10).await;

            let request = FeedRequest {
                anchor: Some(all[5]),
                prev: 2,
                ..FeedRequest::default()
            };
            let windows = ids(&db, &request, None).await.unwrap();
            assert_eq!(windows.prev, vec![all[4], all[3]]);
            assert_eq!(windows.next, windows.prev);
        }

        #[tokio::test]
        async fn test_both_directions() {
            let db = create_test_db().await;
            let all = seed(&db, 10).await;

            let request = FeedRequest {
                anchor: Some(all[5]),
                next: 2,
                prev: 2,
                ..FeedRequest::default()
            };
            let windows = ids(&db, &request, None).await.unwrap();
            assert_eq!(windows.next, vec![all[6], all[7]]);
            assert_eq!(windows.prev, vec![all[4], all[3]]);
        }

        #[tokio::test]
        async fn test_anchor_without_counts_is_empty() {
            let db = create_test_db().await;
            let all = seed(&db, 3).await;

            let request = FeedRequest {
                anchor: Some(all[1]),
                ..FeedRequest::default()
            };
            let windows = ids(&db, &request, None).await.unwrap();
            assert!(windows.next.is_empty());
            assert!(windows.prev.is_empty());
        }
    }

    mod similar_tests {
        use super::*;

        #[tokio::test]
        async fn test_similar_bypasses_category_filters() {
            let db = create_test_db().await;
            let tag = db.create_tag("space").await.unwrap();

            let mut anchor = NewArticle::new("Launch", now());
            anchor.tags = vec![tag];
            let anchor = insert(&db, anchor).await;
            let mut related = NewArticle::new("Orbit", now());
            related.tags = vec![tag];
            related.independent = true;
            let related = insert(&db, related).await;

            let request = FeedRequest {
                similar: Some(anchor),
                categories: vec!["preference".to_string()],
                ..FeedRequest::default()
            };
            let windows = ids(&db, &request, None).await.unwrap();
            assert_eq!(windows.next, vec![related]);
        }

        #[tokio::test]
        async fn test_similar_unknown_anchor() {
            let db = create_test_db().await;
            let request = FeedRequest {
                similar: Some(404),
                ..FeedRequest::default()
            };
            let result = ids(&db, &request, None).await;
            assert!(matches!(result, Err(FeedError::ArticleNotFound(404))));
        }
    }

    #[tokio::test]
    async fn test_run_projects_both_windows() {
        let db = create_test_db().await;
        let first = insert(&db, NewArticle::new("First", now())).await;
        let second = insert(&db, NewArticle::new("Second", now())).await;

        let request = FeedRequest {
            anchor: Some(first),
            next: 1,
            ..FeedRequest::default()
        };
        let result = FeedEngine::new(&db, &media())
            .run(&request, None, now())
            .await
            .unwrap();

        assert_eq!(result.next.len(), 1);
        assert_eq!(result.next[0].id, second);
        assert_eq!(result.next[0].headline, "Second");
        assert_eq!(result.prev[0].id, second);
    }
}
