use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use url::Url;

use crate::auth::Viewer;
use crate::db::{Category, Database, SaveRecord, Tag, VoteRecord};
use crate::feed::{FeedEngine, FeedError, FeedRequest, FeedResult};
use crate::projection::{project, ArticleView};

pub struct AppState {
    pub db: Arc<Database>,
    pub media_base: Url,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("User is not Authenticated")]
    Unauthenticated,
    #[error("Authentication credentials were not provided.")]
    NotAuthenticated,
    #[error("Invalid token.")]
    InvalidToken,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated | ApiError::NotAuthenticated | ApiError::InvalidToken => {
                StatusCode::UNAUTHORIZED
            }
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = match &self {
            ApiError::Internal(err) => {
                tracing::error!(error = ?err, "request failed");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };
        (self.status(), Json(json!({ "message": message }))).into_response()
    }
}

impl From<FeedError> for ApiError {
    fn from(err: FeedError) -> Self {
        match err {
            FeedError::Unauthenticated => ApiError::Unauthenticated,
            FeedError::ArticleNotFound(id) => ApiError::NotFound(format!("Article {} not found", id)),
            FeedError::Internal(err) => ApiError::Internal(err),
        }
    }
}

/// Raw `/api/news` query string. Everything arrives as text and is
/// validated in [`NewsParams::into_request`].
#[derive(Debug, Default, Deserialize)]
pub struct NewsParams {
    pub id: Option<String>,
    pub category: Option<String>,
    pub tag: Option<String>,
    pub search: Option<String>,
    pub similar: Option<String>,
    pub next: Option<String>,
    pub prev: Option<String>,
    pub page: Option<String>,
}

fn invalid(name: &str) -> ApiError {
    ApiError::BadRequest(format!("Invalid value for parameter '{}'", name))
}

fn parse_param<T: std::str::FromStr>(name: &str, value: Option<&str>) -> Result<Option<T>, ApiError> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => v.parse().map(Some).map_err(|_| invalid(name)),
        None => Ok(None),
    }
}

fn comma_list(value: Option<&str>) -> impl Iterator<Item = &str> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
}

/// 1-indexed page number, defaulting to the first page
fn parse_page(value: Option<&str>) -> Result<u32, ApiError> {
    let page = parse_param::<i64>("page", value)?.unwrap_or(1);
    if page < 1 {
        return Err(invalid("page"));
    }
    u32::try_from(page).map_err(|_| invalid("page"))
}

/// `?page=` on the bookmark and vote listings
#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    pub page: Option<String>,
}

impl NewsParams {
    pub fn into_request(self) -> Result<FeedRequest, ApiError> {
        let tags = comma_list(self.tag.as_deref())
            .map(|item| item.parse::<i64>().map_err(|_| invalid("tag")))
            .collect::<Result<Vec<_>, _>>()?;

        let page = parse_page(self.page.as_deref())?;

        Ok(FeedRequest {
            anchor: parse_param("id", self.id.as_deref())?,
            categories: comma_list(self.category.as_deref()).map(String::from).collect(),
            tags,
            search: self.search.filter(|s| !s.trim().is_empty()),
            similar: parse_param("similar", self.similar.as_deref())?,
            next: parse_param("next", self.next.as_deref())?.unwrap_or(0),
            prev: parse_param("prev", self.prev.as_deref())?.unwrap_or(0),
            page,
        })
    }
}

// Route handlers
pub async fn news(
    State(state): State<Arc<AppState>>,
    viewer: Viewer,
    Query(params): Query<NewsParams>,
) -> Result<Json<FeedResult>, ApiError> {
    let request = params.into_request()?;
    let engine = FeedEngine::new(&state.db, &state.media_base);
    let result = engine.run(&request, viewer.user(), Utc::now()).await?;
    tracing::info!(
        next = result.next.len(),
        prev = result.prev.len(),
        "served feed"
    );
    Ok(Json(result))
}

pub async fn categories(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Category>>, ApiError> {
    Ok(Json(state.db.list_categories().await?))
}

pub async fn tags(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Tag>>, ApiError> {
    Ok(Json(state.db.list_tags().await?))
}

#[derive(Debug, Serialize)]
pub struct PreferenceView {
    pub user: i64,
    pub categorys: Vec<Category>,
}

#[derive(Debug, Deserialize)]
pub struct PreferenceBody {
    pub categorys: Vec<i64>,
}

pub async fn get_preference(
    State(state): State<Arc<AppState>>,
    viewer: Viewer,
) -> Result<Json<PreferenceView>, ApiError> {
    let user = viewer.require()?;
    let categorys = state
        .db
        .get_preference(user.id)
        .await?
        .ok_or_else(|| ApiError::NotFound("No preference set".to_string()))?;
    Ok(Json(PreferenceView {
        user: user.id,
        categorys,
    }))
}

pub async fn put_preference(
    State(state): State<Arc<AppState>>,
    viewer: Viewer,
    Json(body): Json<PreferenceBody>,
) -> Result<Json<PreferenceView>, ApiError> {
    let user = viewer.require()?;
    state.db.set_preference(user.id, &body.categorys).await?;
    let categorys = state.db.get_preference(user.id).await?.unwrap_or_default();
    tracing::info!(user_id = user.id, count = categorys.len(), "preference updated");
    Ok(Json(PreferenceView {
        user: user.id,
        categorys,
    }))
}

/// A bookmark or vote together with the article it points at
#[derive(Debug, Serialize)]
pub struct WithArticle<R> {
    #[serde(flatten)]
    pub record: R,
    pub article: Option<ArticleView>,
}

async fn attach_articles<R>(
    state: &AppState,
    viewer: &Viewer,
    records: Vec<R>,
    news_id: impl Fn(&R) -> i64,
) -> Result<Vec<WithArticle<R>>, ApiError> {
    let ids: Vec<i64> = records.iter().map(&news_id).collect();
    let mut views: HashMap<i64, ArticleView> =
        project(&state.db, &ids, viewer.user(), &state.media_base)
            .await?
            .into_iter()
            .map(|view| (view.id, view))
            .collect();
    Ok(records
        .into_iter()
        .map(|record| {
            let article = views.remove(&news_id(&record));
            WithArticle { record, article }
        })
        .collect())
}

#[derive(Debug, Deserialize)]
pub struct SaveBody {
    pub news: i64,
}

pub async fn list_saves(
    State(state): State<Arc<AppState>>,
    viewer: Viewer,
    Query(params): Query<PageParams>,
) -> Result<Json<Vec<WithArticle<SaveRecord>>>, ApiError> {
    let user = viewer.require()?;
    let page = parse_page(params.page.as_deref())?;
    let saves = state.db.list_saves(user.id, page).await?;
    let saves = attach_articles(&state, &viewer, saves, |s| s.news_id).await?;
    Ok(Json(saves))
}

pub async fn create_save(
    State(state): State<Arc<AppState>>,
    viewer: Viewer,
    Json(body): Json<SaveBody>,
) -> Result<(StatusCode, Json<SaveRecord>), ApiError> {
    let user = viewer.require()?;
    let save = state
        .db
        .create_save(user.id, body.news, Utc::now())
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Article {} not found", body.news)))?;
    Ok((StatusCode::CREATED, Json(save)))
}

pub async fn delete_save(
    State(state): State<Arc<AppState>>,
    viewer: Viewer,
    Path(save_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let user = viewer.require()?;
    if state.db.delete_save(user.id, save_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Save {} not found", save_id)))
    }
}

#[derive(Debug, Deserialize)]
pub struct VoteBody {
    pub news: i64,
    pub polarity: bool,
}

pub async fn list_votes(
    State(state): State<Arc<AppState>>,
    viewer: Viewer,
    Query(params): Query<PageParams>,
) -> Result<Json<Vec<WithArticle<VoteRecord>>>, ApiError> {
    let user = viewer.require()?;
    let page = parse_page(params.page.as_deref())?;
    let votes = state.db.list_votes(user.id, page).await?;
    let votes = attach_articles(&state, &viewer, votes, |v| v.news_id).await?;
    Ok(Json(votes))
}

pub async fn create_vote(
    State(state): State<Arc<AppState>>,
    viewer: Viewer,
    Json(body): Json<VoteBody>,
) -> Result<(StatusCode, Json<VoteRecord>), ApiError> {
    let user = viewer.require()?;
    let vote = state
        .db
        .record_vote(user.id, body.news, body.polarity, Utc::now())
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Article {} not found", body.news)))?;
    tracing::info!(user_id = user.id, news_id = body.news, polarity = body.polarity, "vote recorded");
    Ok((StatusCode::CREATED, Json(vote)))
}

pub async fn delete_vote(
    State(state): State<Arc<AppState>>,
    viewer: Viewer,
    Path(vote_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let user = viewer.require()?;
    if state.db.delete_vote(user.id, vote_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Vote {} not found", vote_id)))
    }
}

pub async fn health() -> &'static str {
    "OK"
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/news", get(news))
        .route("/api/categories", get(categories))
        .route("/api/tags", get(tags))
        .route("/api/preferences", get(get_preference).put(put_preference))
        .route("/api/saves", get(list_saves).post(create_save))
        .route("/api/saves/:id", delete(delete_save))
        .route("/api/votes", get(list_votes).post(create_vote))
        .route("/api/votes/:id", delete(delete_vote))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
