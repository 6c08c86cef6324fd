// src/auth.rs
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::{
    Claims, ForgotPasswordRequest, LoginRequest, RegisterRequest, ResetPasswordRequest, User,
    ROLE_ADMIN, ROLE_USER,
};
use crate::store::UserStore;
use crate::tokens::{MIN_PASSWORD_LEN, PasswordResets};
use actix_web::{FromRequest, HttpRequest, HttpResponse, dev::Payload, http::header, post, web};
use bcrypt::{DEFAULT_COST, hash, verify};
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde_json::json;
use std::future::{Ready, ready};
use uuid::Uuid;

pub fn init_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(login);
    cfg.service(register);
    cfg.service(forgot_password);
    cfg.service(reset_password);
}

pub fn issue_token(user: &User, secret: &str) -> AppResult<String> {
    let expiration = Utc::now() + Duration::hours(24);
    let claims = Claims {
        sub: user.id.to_string(),
        role: user.role.clone(),
        exp: expiration.timestamp() as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_ref()),
    )
    .map_err(|e| AppError::internal(format!("Token generation error: {e}")))
}

/// Caller identity taken from a verified bearer token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub role: String,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }
}

/// `Ok(None)` when no bearer token was sent at all.
fn authenticate(req: &HttpRequest) -> AppResult<Option<AuthUser>> {
    let Some(value) = req.headers().get(header::AUTHORIZATION) else {
        return Ok(None);
    };
    let token = value
        .to_str()
        .ok()
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(AppError::Unauthorized)?;
    let config = req
        .app_data::<web::Data<Config>>()
        .ok_or_else(|| AppError::internal("Config is not registered"))?;

    let claims = decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_ref()),
        &Validation::default(),
    )
    .map_err(|e| {
        tracing::debug!(error = %e, "Rejected bearer token");
        AppError::Unauthorized
    })?
    .claims;
    let user_id = Uuid::parse_str(&claims.sub).map_err(|_| AppError::Unauthorized)?;
    Ok(Some(AuthUser {
        user_id,
        role: claims.role,
    }))
}

impl FromRequest for AuthUser {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(authenticate(req).and_then(|user| user.ok_or(AppError::Unauthorized)))
    }
}

#[derive(Debug, Clone)]
pub struct AdminUser(pub AuthUser);

impl FromRequest for AdminUser {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(match authenticate(req) {
            Ok(Some(user)) if user.is_admin() => Ok(AdminUser(user)),
            Ok(Some(_)) => Err(AppError::Forbidden),
            Ok(None) => Err(AppError::Unauthorized),
            Err(e) => Err(e),
        })
    }
}

/// Optional identity for endpoints that also serve anonymous readers.
/// A bad token is treated as no token.
#[derive(Debug, Clone)]
pub struct MaybeUser(pub Option<AuthUser>);

impl FromRequest for MaybeUser {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(Ok(MaybeUser(authenticate(req).unwrap_or(None))))
    }
}

#[post("/auth/login")]
pub async fn login(
    users: web::Data<dyn UserStore>,
    config: web::Data<Config>,
    req: web::Json<LoginRequest>,
) -> Result<HttpResponse, AppError> {
    let Some(user) = users.user_by_username(&req.username).await? else {
        return Err(AppError::Unauthorized);
    };
    if !verify(&req.password, &user.password_hash).unwrap_or(false) {
        tracing::info!(username = %req.username, "Failed login attempt");
        return Err(AppError::Unauthorized);
    }

    let token = issue_token(&user, &config.jwt_secret)?;
    Ok(HttpResponse::Ok().json(json!({
        "token": token,
        "user_id": user.id,
    })))
}

#[post("/auth/register")]
pub async fn register(
    users: web::Data<dyn UserStore>,
    req: web::Json<RegisterRequest>,
) -> Result<HttpResponse, AppError> {
    let username = req.username.trim();
    let email = req.email.trim().to_lowercase();
    if username.is_empty() {
        return Err(AppError::validation("Username is required"));
    }
    if !email.contains('@') {
        return Err(AppError::validation("A valid email is required"));
    }
    if req.password.len() < MIN_PASSWORD_LEN {
        return Err(AppError::validation(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }

    if users.user_by_username(username).await?.is_some() {
        return Err(AppError::Conflict("Username already exists".to_string()));
    }
    if users.user_by_email(&email).await?.is_some() {
        return Err(AppError::Conflict("Email already registered".to_string()));
    }

    let password_hash = hash(&req.password, DEFAULT_COST)
        .map_err(|e| AppError::internal(format!("Password hashing error: {e}")))?;

    let new_user = User {
        id: Uuid::new_v4(),
        username: username.to_string(),
        email,
        password_hash,
        role: ROLE_USER.to_string(),
        created_at: Utc::now(),
    };
    users.create_user(&new_user).await?;
    tracing::info!(user_id = %new_user.id, "User registered");

    Ok(HttpResponse::Created().json(json!({
        "message": "User created successfully",
        "user_id": new_user.id,
    })))
}

#[post("/auth/password/forgot")]
pub async fn forgot_password(
    resets: web::Data<PasswordResets>,
    req: web::Json<ForgotPasswordRequest>,
) -> Result<HttpResponse, AppError> {
    resets.request_reset(&req.email).await?;
    Ok(HttpResponse::Ok().json(json!({
        "message": "If the email is registered, a reset link has been sent",
    })))
}

#[post("/auth/password/reset")]
pub async fn reset_password(
    resets: web::Data<PasswordResets>,
    req: web::Json<ResetPasswordRequest>,
) -> Result<HttpResponse, AppError> {
    resets
        .reset_password(&req.email, &req.token, &req.new_password)
        .await?;
    Ok(HttpResponse::Ok().json(json!({ "message": "Password updated" })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailer::Mailer;
    use crate::testing::{MemoryStore, RecordingMailer, test_config, test_user};
    use actix_web::{App, get, http::StatusCode, test};
    use std::sync::Arc;

    #[get("/whoami")]
    async fn whoami(user: AuthUser) -> HttpResponse {
        HttpResponse::Ok().json(json!({ "user_id": user.user_id, "admin": user.is_admin() }))
    }

    #[get("/admin-only")]
    async fn admin_only(_admin: AdminUser) -> HttpResponse {
        HttpResponse::NoContent().finish()
    }

    fn app_data(store: &Arc<MemoryStore>) -> (web::Data<dyn UserStore>, web::Data<PasswordResets>) {
        let mailer: Arc<dyn Mailer> = Arc::new(RecordingMailer::default());
        let resets = PasswordResets::new(store.clone(), store.clone(), mailer, "https://recipes.test")
            .with_bcrypt_cost(4);
        let users: Arc<dyn UserStore> = store.clone();
        (web::Data::from(users), web::Data::new(resets))
    }

    #[actix_web::test]
    async fn login_issues_token_accepted_by_extractor() {
        let store = Arc::new(MemoryStore::default());
        let user = test_user();
        store.add_user(user.clone());
        let (users, resets) = app_data(&store);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(test_config()))
                .app_data(users)
                .app_data(resets)
                .configure(init_routes)
                .service(whoami)
                .service(admin_only),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/auth/login")
            .set_json(json!({ "username": user.username, "password": "password-123" }))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        let token = body["token"].as_str().unwrap().to_string();

        let req = test::TestRequest::get()
            .uri("/whoami")
            .insert_header((header::AUTHORIZATION, format!("Bearer {token}")))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["user_id"], json!(user.id));
        assert_eq!(body["admin"], json!(false));

        let req = test::TestRequest::get()
            .uri("/admin-only")
            .insert_header((header::AUTHORIZATION, format!("Bearer {token}")))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::FORBIDDEN);
    }

    #[actix_web::test]
    async fn wrong_password_and_missing_token_are_unauthorized() {
        let store = Arc::new(MemoryStore::default());
        let user = test_user();
        store.add_user(user.clone());
        let (users, resets) = app_data(&store);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(test_config()))
                .app_data(users)
                .app_data(resets)
                .configure(init_routes)
                .service(whoami),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/auth/login")
            .set_json(json!({ "username": user.username, "password": "wrong-password" }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::UNAUTHORIZED);

        let req = test::TestRequest::get().uri("/whoami").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::UNAUTHORIZED);

        let req = test::TestRequest::get()
            .uri("/whoami")
            .insert_header((header::AUTHORIZATION, "Bearer not-a-jwt"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::UNAUTHORIZED);
    }

    #[actix_web::test]
    async fn register_rejects_duplicates_and_short_passwords() {
        let store = Arc::new(MemoryStore::default());
        let user = test_user();
        store.add_user(user.clone());
        let (users, resets) = app_data(&store);
        let app = test::init_service(
            App::new()
                .app_data(users)
                .app_data(resets)
                .configure(init_routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/auth/register")
            .set_json(json!({ "username": user.username, "email": "other@example.com", "password": "long-enough" }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CONFLICT);

        let req = test::TestRequest::post()
            .uri("/auth/register")
            .set_json(json!({ "username": "newcook", "email": "new@example.com", "password": "short" }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn forgot_password_answers_the_same_for_unknown_email() {
        let store = Arc::new(MemoryStore::default());
        let (users, resets) = app_data(&store);
        let app = test::init_service(
            App::new()
                .app_data(users)
                .app_data(resets)
                .configure(init_routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/auth/password/forgot")
            .set_json(json!({ "email": "nobody@example.com" }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
    }
}
