// src/paywall.rs
use crate::auth::{AdminUser, AuthUser};
use crate::counters::CounterService;
use crate::error::AppError;
use crate::models::{PageQuery, PlanRequest, Subscription};
use crate::store::UserStore;
use crate::subscriptions::SubscriptionController;
use crate::webhook::{SIGNATURE_HEADER, WebhookProcessor};
use actix_web::{HttpRequest, HttpResponse, get, post, web};
use serde_json::json;
use uuid::Uuid;

pub fn init_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(get_subscription);
    cfg.service(subscribe);
    cfg.service(cancel_subscription);
    cfg.service(uncancel_subscription);
    cfg.service(change_plan);
    cfg.service(billing_webhook);
    cfg.service(admin_list_subscriptions);
    cfg.service(admin_cancel_subscription);
    cfg.service(admin_flush_counters);
}

fn subscription_json(sub: &Subscription) -> serde_json::Value {
    json!({
        "subscription": sub,
        "state": sub.state(),
        "active": sub.state().grants_access(),
    })
}

#[get("/api/subscriptions")]
pub async fn get_subscription(
    subscriptions: web::Data<SubscriptionController>,
    user: AuthUser,
) -> Result<HttpResponse, AppError> {
    let response = match subscriptions.current_subscription(user.user_id).await? {
        Some(sub) => subscription_json(&sub),
        None => json!({ "subscription": null, "state": null, "active": false }),
    };
    Ok(HttpResponse::Ok().json(response))
}

#[post("/api/subscriptions")]
pub async fn subscribe(
    subscriptions: web::Data<SubscriptionController>,
    users: web::Data<dyn UserStore>,
    user: AuthUser,
    req: web::Json<PlanRequest>,
) -> Result<HttpResponse, AppError> {
    let account = users
        .user_by_id(user.user_id)
        .await?
        .ok_or(AppError::Unauthorized)?;
    let session = subscriptions.subscribe(&account, &req.plan_id).await?;
    Ok(HttpResponse::Ok().json(json!({
        "session_id": session.id,
        "checkout_url": session.url,
    })))
}

#[post("/api/subscriptions/cancel")]
pub async fn cancel_subscription(
    subscriptions: web::Data<SubscriptionController>,
    user: AuthUser,
) -> Result<HttpResponse, AppError> {
    let sub = subscriptions.cancel_at_period_end(user.user_id).await?;
    Ok(HttpResponse::Ok().json(subscription_json(&sub)))
}

#[post("/api/subscriptions/uncancel")]
pub async fn uncancel_subscription(
    subscriptions: web::Data<SubscriptionController>,
    user: AuthUser,
) -> Result<HttpResponse, AppError> {
    let sub = subscriptions.resume(user.user_id).await?;
    Ok(HttpResponse::Ok().json(subscription_json(&sub)))
}

#[post("/api/subscriptions/change-plan")]
pub async fn change_plan(
    subscriptions: web::Data<SubscriptionController>,
    user: AuthUser,
    req: web::Json<PlanRequest>,
) -> Result<HttpResponse, AppError> {
    let sub = subscriptions.change_plan(user.user_id, &req.plan_id).await?;
    Ok(HttpResponse::Ok().json(subscription_json(&sub)))
}

#[post("/api/webhooks/billing")]
pub async fn billing_webhook(
    processor: web::Data<WebhookProcessor>,
    req: HttpRequest,
    body: web::Bytes,
) -> Result<HttpResponse, AppError> {
    let signature = req
        .headers()
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    let event = processor.parse(&body, signature)?;
    let outcome = processor.handle(&event).await?;
    Ok(HttpResponse::Ok().json(json!({ "received": true, "outcome": outcome })))
}

#[get("/api/admin/subscriptions")]
pub async fn admin_list_subscriptions(
    subscriptions: web::Data<SubscriptionController>,
    _admin: AdminUser,
    query: web::Query<PageQuery>,
) -> Result<HttpResponse, AppError> {
    let page = subscriptions
        .list_subscriptions(query.page, query.per_page)
        .await?;
    Ok(HttpResponse::Ok().json(page))
}

#[post("/api/admin/subscriptions/{subscription_id}/cancel")]
pub async fn admin_cancel_subscription(
    subscriptions: web::Data<SubscriptionController>,
    _admin: AdminUser,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let sub = subscriptions.admin_cancel(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(subscription_json(&sub)))
}

#[post("/api/admin/counters/flush")]
pub async fn admin_flush_counters(
    counters: web::Data<CounterService>,
    _admin: AdminUser,
) -> Result<HttpResponse, AppError> {
    let report = counters.flush().await?;
    Ok(HttpResponse::Ok().json(report))
}
