//! CRUD routes for directory listings.

use axum::{
    Router,
    extract::{Path, Query, State},
    response::Json as ResponseJson,
    routing::get,
};
use db::models::{
    business::{Business, UpdateBusiness},
    review::Review,
};
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{AppState, error::ApiError};

const DEFAULT_PER_PAGE: i64 = 50;
const MAX_PER_PAGE: i64 = 200;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub page: Option<i64>,
    pub per_page: Option<i64>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct BusinessListResponse {
    pub businesses: Vec<Business>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct BusinessWithReviews {
    #[serde(flatten)]
    #[ts(flatten)]
    pub business: Business,
    pub reviews: Vec<Review>,
}

pub async fn list_businesses(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<ResponseJson<ApiResponse<BusinessListResponse>>, ApiError> {
    let page = query.page.unwrap_or(1).max(1);
    let per_page = query
        .per_page
        .unwrap_or(DEFAULT_PER_PAGE)
        .clamp(1, MAX_PER_PAGE);
    let category = query.category.as_deref();

    let businesses = Business::list(
        &state.db.pool,
        category,
        per_page,
        (page - 1) * per_page,
    )
    .await?;
    let total = Business::count(&state.db.pool, category).await?;

    Ok(ResponseJson(ApiResponse::success(BusinessListResponse {
        businesses,
        total,
        page,
        per_page,
    })))
}

pub async fn get_business(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<BusinessWithReviews>>, ApiError> {
    let business = Business::find_by_id(&state.db.pool, id)
        .await?
        .ok_or(ApiError::NotFound("business"))?;
    let reviews = Review::find_by_business_id(&state.db.pool, id).await?;

    Ok(ResponseJson(ApiResponse::success(BusinessWithReviews {
        business,
        reviews,
    })))
}

pub async fn update_business(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    axum::Json(payload): axum::Json<UpdateBusiness>,
) -> Result<ResponseJson<ApiResponse<Business>>, ApiError> {
    let business = Business::update_details(&state.db.pool, id, &payload)
        .await?
        .ok_or(ApiError::NotFound("business"))?;

    Ok(ResponseJson(ApiResponse::success(business)))
}

pub async fn delete_business(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    let deleted = Business::delete(&state.db.pool, id).await?;
    if deleted == 0 {
        return Err(ApiError::NotFound("business"));
    }

    Ok(ResponseJson(ApiResponse::success(())))
}

pub fn router() -> Router<AppState> {
    Router::new().nest(
        "/businesses",
        Router::new()
            .route("/", get(list_businesses))
            .route(
                "/{id}",
                get(get_business)
                    .put(update_business)
                    .delete(delete_business),
            ),
    )
}
