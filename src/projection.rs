use std::collections::HashMap;

use serde::Serialize;
use url::Url;

use crate::db::{Article, Category, Database, SaveRecord, User, VoteRecord};

/// JSON shape of an article as returned to clients. Tag ids stay internal.
#[derive(Debug, Clone, Serialize)]
pub struct ArticleView {
    pub id: i64,
    pub headline: String,
    pub category: Vec<Category>,
    pub time: String,
    pub body: String,
    pub image: Option<String>,
    #[serde(rename = "newsAgency")]
    pub news_agency: String,
    pub source: String,
    pub file_type: String,
    pub user: Option<i64>,
    pub pos: i64,
    pub neg: i64,
    pub clickable: bool,
    pub visibility: bool,
    pub independent: bool,
    pub created_at: String,
    pub username: Option<String>,
    pub save: Option<SaveRecord>,
    pub vote: Option<VoteRecord>,
}

pub fn image_url(media_base: &Url, path: Option<&str>) -> Option<String> {
    let path = path.filter(|p| !p.is_empty())?;
    match media_base.join(path) {
        Ok(url) => Some(url.to_string()),
        Err(e) => {
            tracing::warn!(path, error = %e, "Unresolvable image path");
            None
        }
    }
}

/// Load projections for `ids`, preserving their order. Ids that no longer
/// resolve to an article are skipped.
pub async fn project(
    db: &Database,
    ids: &[i64],
    viewer: Option<&User>,
    media_base: &Url,
) -> anyhow::Result<Vec<ArticleView>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let articles: HashMap<i64, Article> = db
        .articles_by_ids(ids)
        .await?
        .into_iter()
        .map(|a| (a.id, a))
        .collect();
    let mut categories = db.categories_for_articles(ids).await?;

    let mut author_ids: Vec<i64> = articles.values().filter_map(|a| a.user_id).collect();
    author_ids.sort_unstable();
    author_ids.dedup();
    let authors = db.users_by_ids(&author_ids).await?;

    let (mut saves, mut votes) = match viewer {
        Some(user) => (
            db.saves_for_articles(user.id, ids).await?,
            db.votes_for_articles(user.id, ids).await?,
        ),
        None => (HashMap::new(), HashMap::new()),
    };

    let views = ids
        .iter()
        .filter_map(|id| articles.get(id))
        .map(|article| ArticleView {
            id: article.id,
            headline: article.headline.clone(),
            category: categories.remove(&article.id).unwrap_or_default(),
            time: article.time.clone(),
            body: article.body.clone(),
            image: image_url(media_base, article.image.as_deref()),
            news_agency: article.news_agency.clone(),
            source: article.source.clone(),
            file_type: article.file_type.clone(),
            user: article.user_id,
            pos: article.pos,
            neg: article.neg,
            clickable: article.clickable,
            visibility: article.visibility,
            independent: article.independent,
            created_at: article.created_at.clone(),
            username: article
                .user_id
                .and_then(|uid| authors.get(&uid))
                .map(User::full_name),
            save: saves.remove(&article.id),
            vote: votes.remove(&article.id),
        })
        .collect();

    Ok(views)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewArticle;
    use chrono::{TimeZone, Utc};

    fn media() -> Url {
        Url::parse("https://cdn.example.com/media/").unwrap()
    }

    async fn create_test_db() -> Database {
        let db = Database::new("sqlite::memory:").await.unwrap();
        db.initialize().await.unwrap();
        db
    }

    #[test]
    fn test_image_url() {
        assert_eq!(
            image_url(&media(), Some("news/a.png")),
            Some("https://cdn.example.com/media/news/a.png".to_string())
        );
        assert_eq!(image_url(&media(), Some("")), None);
        assert_eq!(image_url(&media(), None), None);
    }

    #[tokio::test]
    async fn test_project_preserves_order_and_skips_missing() {
        let db = create_test_db().await;
        let created = Utc.with_ymd_and_hms(2024, 3, 15, 8, 0, 0).unwrap();
        let a = db.insert_article(&NewArticle::new("A", created)).await.unwrap();
        let b = db.insert_article(&NewArticle::new("B", created)).await.unwrap();

        let views = project(&db, &[b, 999, a], None, &media()).await.unwrap();
        let ids: Vec<i64> = views.iter().map(|v| v.id).collect();
        assert_eq!(ids, vec![b, a]);
    }

    #[tokio::test]
    async fn test_project_expands_relations() {
        let db = create_test_db().await;
        let created = Utc.with_ymd_and_hms(2024, 3, 15, 8, 0, 0).unwrap();
        let author = db.create_user("writer", "Ada", "Lovelace").await.unwrap();
        let reader = db.create_user("reader", "Rea", "Der").await.unwrap();
        let world = db.create_category("World", None).await.unwrap();

        let mut article = NewArticle::new("A", created);
        article.user_id = Some(author);
        article.image = Some("news/a.png".to_string());
        article.categories = vec![world];
        let id = db.insert_article(&article).await.unwrap();

        db.create_save(reader, id, created).await.unwrap();
        db.record_vote(reader, id, true, created).await.unwrap();

        let users = db.users_by_ids(&[reader]).await.unwrap();
        let viewer = users.get(&reader);

        let views = project(&db, &[id], viewer, &media()).await.unwrap();
        let view = &views[0];
        assert_eq!(view.username.as_deref(), Some("Ada Lovelace"));
        assert_eq!(view.category[0].name, "World");
        assert_eq!(
            view.image.as_deref(),
            Some("https://cdn.example.com/media/news/a.png")
        );
        assert_eq!(view.pos, 1);
        assert!(view.save.is_some());
        assert!(view.vote.as_ref().unwrap().polarity);

        let anonymous = project(&db, &[id], None, &media()).await.unwrap();
        assert!(anonymous[0].save.is_none());
        assert!(anonymous[0].vote.is_none());
    }

    #[tokio::test]
    async fn test_serialized_shape() {
        let db = create_test_db().await;
        let created = Utc.with_ymd_and_hms(2024, 3, 15, 8, 0, 0).unwrap();
        let id = db.insert_article(&NewArticle::new("A", created)).await.unwrap();

        let views = project(&db, &[id], None, &media()).await.unwrap();
        let json = serde_json::to_value(&views[0]).unwrap();

        assert_eq!(json["newsAgency"], "Independent");
        assert!(json["username"].is_null());
        assert!(json["save"].is_null());
        assert!(json["vote"].is_null());
        assert!(json.get("tags").is_none());
        assert_eq!(json["category"], serde_json::json!([]));
    }
}
