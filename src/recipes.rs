// src/recipes.rs
use crate::auth::{AuthUser, MaybeUser};
use crate::counters::CounterService;
use crate::error::AppError;
use crate::models::{LikeRequest, Recipe};
use crate::store::RecipeStore;
use crate::subscriptions::SubscriptionController;
use actix_web::{HttpResponse, get, post, web};
use moka::future::Cache;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

pub type RecipeCache = Cache<Uuid, Recipe>;

/// Recipe rows only. Counts change on every view and are never cached.
pub fn recipe_cache() -> RecipeCache {
    Cache::builder()
        .max_capacity(10_000)
        .time_to_live(Duration::from_secs(60))
        .build()
}

pub fn init_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(get_recipe);
    cfg.service(liked_recipes);
    cfg.service(like_from_body);
    cfg.service(like_status);
    cfg.service(like_from_path);
}

#[get("/api/recipes/{recipe_id}")]
pub async fn get_recipe(
    recipes: web::Data<dyn RecipeStore>,
    cache: web::Data<RecipeCache>,
    counters: web::Data<CounterService>,
    subscriptions: web::Data<SubscriptionController>,
    user: MaybeUser,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let recipe_id = path.into_inner();

    let recipe = match cache.get(&recipe_id).await {
        Some(recipe) => recipe,
        None => {
            let recipe = recipes
                .get_recipe(recipe_id)
                .await?
                .ok_or_else(|| AppError::not_found("Recipe not found"))?;
            cache.insert(recipe_id, recipe.clone()).await;
            recipe
        }
    };

    counters.record_view(recipe_id).await;
    let counts = counters.combined_counts(recipe_id).await?;

    let access_granted = match (&user.0, recipe.is_premium) {
        (_, false) => true,
        (Some(user), true) => subscriptions.has_active_subscription(user.user_id).await?,
        (None, true) => false,
    };

    let mut response = json!({
        "id": recipe.id,
        "title": recipe.title,
        "is_premium": recipe.is_premium,
        "views": counts.views,
        "likes": counts.likes,
        "created_at": recipe.created_at,
        "access_granted": access_granted,
    });
    if access_granted {
        response["body"] = json!(recipe.body);
    } else {
        response["message"] = json!("Subscribe to read this recipe");
    }
    Ok(HttpResponse::Ok().json(response))
}

#[get("/api/likes")]
pub async fn liked_recipes(
    counters: web::Data<CounterService>,
    user: AuthUser,
) -> Result<HttpResponse, AppError> {
    let recipe_ids = counters.liked_recipes(user.user_id).await?;
    Ok(HttpResponse::Ok().json(json!({ "recipe_ids": recipe_ids })))
}

async fn like(
    counters: &CounterService,
    user: &AuthUser,
    recipe_id: Uuid,
) -> Result<HttpResponse, AppError> {
    let outcome = counters.like_recipe(user.user_id, recipe_id).await?;
    let likes = counters.combined_counts(recipe_id).await?.likes;
    Ok(HttpResponse::Ok().json(json!({
        "recipe_id": recipe_id,
        "outcome": outcome,
        "likes": likes,
    })))
}

#[post("/api/likes")]
pub async fn like_from_body(
    counters: web::Data<CounterService>,
    user: AuthUser,
    req: web::Json<LikeRequest>,
) -> Result<HttpResponse, AppError> {
    like(&counters, &user, req.recipe_id).await
}

#[post("/api/likes/{recipe_id}")]
pub async fn like_from_path(
    counters: web::Data<CounterService>,
    user: AuthUser,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    like(&counters, &user, path.into_inner()).await
}

#[get("/api/likes/{recipe_id}")]
pub async fn like_status(
    counters: web::Data<CounterService>,
    user: MaybeUser,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let recipe_id = path.into_inner();
    let likes = counters.combined_counts(recipe_id).await?.likes;
    let liked = match &user.0 {
        Some(user) => counters.has_liked(user.user_id, recipe_id).await?,
        None => false,
    };
    Ok(HttpResponse::Ok().json(json!({ "liked": liked, "likes": likes })))
}
