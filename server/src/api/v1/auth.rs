use std::sync::Arc;

use argon2::Argon2;
use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts, State},
    headers::{authorization::Bearer, Authorization, Cookie, Header, SetCookie},
    http::{request::Parts, HeaderValue, StatusCode},
    RequestPartsExt, TypedHeader,
};
use bson::oid::ObjectId;
use serde::{Deserialize, Serialize};
use tap::TapFallible;
use time::OffsetDateTime;
use validator::Validate;

use crate::{
    access::Principal,
    config::Config,
    error::{Error, UnauthorizedType},
    model::{UserModel, UserRole},
    store::UserCollection,
    util::{hash_password, non_blank, verify_password, Json, ObjectIdString},
};

use super::token::{decode_access_token, generate_access_token, JwtState, ACCESS_TOKEN_LIFETIME};

pub const SESSION_COOKIE: &str = "jwt";

/// Turns a presented credential into a [`Principal`].
#[async_trait]
pub trait Authenticator {
    type Credential: Send;

    async fn authenticate(&self, credential: Self::Credential) -> Result<Principal, Error>;
}

pub struct Credentials {
    pub identifier: String,
    pub secret: String,
}

/// Identifier + secret verification. The identifier is tried as an email
/// first and as a username second.
pub struct PasswordAuthenticator {
    users: UserCollection,
    argon: Argon2<'static>,
}

impl PasswordAuthenticator {
    pub fn new(users: UserCollection, argon: Argon2<'static>) -> Self {
        Self { users, argon }
    }
}

#[async_trait]
impl Authenticator for PasswordAuthenticator {
    type Credential = Credentials;

    async fn authenticate(&self, credential: Credentials) -> Result<Principal, Error> {
        let identifier = credential.identifier.trim();

        let user = match self.users.find_by_email(identifier).await? {
            Some(user) => Some(user),
            None => self.users.find_by_username(identifier).await?,
        };

        match user {
            Some(user) if verify_password(&self.argon, &credential.secret, &user.password) => {
                Ok(user.into())
            }
            _ => Err(Error::Unauthorized(UnauthorizedType::InvalidCredentials))
                .tap_err(|_| tracing::debug!("failed login for {:?}", identifier)),
        }
    }
}

/// Signed token verification, reloading the referenced user so deleted
/// accounts lose access immediately.
pub struct TokenAuthenticator {
    users: UserCollection,
    jwt_state: JwtState,
}

impl TokenAuthenticator {
    pub fn new(users: UserCollection, jwt_state: JwtState) -> Self {
        Self { users, jwt_state }
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    type Credential = String;

    async fn authenticate(&self, token: String) -> Result<Principal, Error> {
        let token = decode_access_token(&self.jwt_state, &token)?;

        self.users
            .find_by_id(token.claims.user_id.0)
            .await?
            .map(Principal::from)
            .ok_or(Error::Unauthorized(UnauthorizedType::InvalidAccessToken))
            .tap_err(|_| tracing::debug!("token for missing user {}", token.claims.user_id))
    }
}

/// Bearer header first, `jwt` cookie second.
async fn extract_token(parts: &mut Parts) -> Result<String, Error> {
    if let Ok(TypedHeader(Authorization(bearer))) =
        parts.extract::<TypedHeader<Authorization<Bearer>>>().await
    {
        return Ok(bearer.token().trim().to_string());
    }

    let cookie = parts
        .extract::<TypedHeader<Cookie>>()
        .await
        .map_err(|_| Error::Unauthorized(UnauthorizedType::MissingToken))
        .tap_err(|_| tracing::debug!("no bearer token or cookie"))?;

    cookie
        .get(SESSION_COOKIE)
        .map(ToString::to_string)
        .ok_or(Error::Unauthorized(UnauthorizedType::MissingToken))
}

#[async_trait]
impl<S> FromRequestParts<S> for Principal
where
    JwtState: FromRef<S>,
    UserCollection: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = extract_token(parts).await?;

        TokenAuthenticator::new(UserCollection::from_ref(state), JwtState::from_ref(state))
            .authenticate(token)
            .await
    }
}

pub fn session_cookie(token: &str, max_age: i64, secure: bool) -> Result<TypedHeader<SetCookie>, Error> {
    let mut cookie = format!(
        "{SESSION_COOKIE}={token}; HttpOnly; SameSite=Strict; Path=/; Max-Age={max_age}"
    );
    if secure {
        cookie.push_str("; Secure");
    }

    let value = HeaderValue::from_str(&cookie)
        .map_err(|_| Error::CustomStr(StatusCode::INTERNAL_SERVER_ERROR, "invalid cookie value"))?;

    SetCookie::decode(&mut std::iter::once(&value))
        .map(TypedHeader)
        .map_err(|_| Error::CustomStr(StatusCode::INTERNAL_SERVER_ERROR, "invalid cookie value"))
}

#[derive(Validate, Deserialize, Debug, Clone)]
pub struct RegisterRequest {
    #[validate(length(min = 3, max = 20))]
    pub username: String,

    #[validate(email)]
    pub email: String,

    #[validate(length(min = 6, max = 128))]
    pub password: String,

    #[serde(default)]
    pub phone: Option<String>,

    #[serde(default)]
    pub role: UserRole,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub id: ObjectIdString,
    pub username: String,
    pub email: String,
    pub role: UserRole,
    pub token: String,
}

impl AuthResponse {
    fn new(principal: Principal, token: String) -> Self {
        Self {
            id: principal.id,
            username: principal.username,
            email: principal.email,
            role: principal.role,
            token,
        }
    }
}

pub async fn create_user(
    users: &UserCollection,
    argon: &Argon2<'_>,
    request: RegisterRequest,
) -> Result<UserModel, Error> {
    let request = RegisterRequest {
        username: request.username.trim().to_string(),
        email: request.email.trim().to_string(),
        phone: non_blank(request.phone),
        ..request
    };
    request.validate()?;

    if users.exists(&request.username, &request.email).await? {
        return Err(Error::Conflict("user with that email or username".to_string()));
    }

    let now = OffsetDateTime::now_utc();
    let model = UserModel {
        id: ObjectId::new(),
        username: request.username,
        email: request.email,
        phone: request.phone,
        password: hash_password(argon, &request.password)?,
        role: request.role,
        created_at: now.into(),
        updated_at: now.into(),
    };
    users.insert(&model).await?;

    Ok(model)
}

#[tracing::instrument(
    skip_all,
    fields(
        username = %request.username,
        role = %request.role,
    )
)]
pub async fn register(
    State(users): State<UserCollection>,
    State(argon): State<Argon2<'static>>,
    State(jwt_state): State<JwtState>,
    State(config): State<Arc<Config>>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<AuthResponse>), Error> {
    if request.role == UserRole::Admin && !config.allow_admin_registration {
        return Err(Error::Forbidden("admin accounts cannot be self-registered"))
            .tap_err(|_| tracing::debug!("refused admin self-registration"));
    }

    let user = create_user(&users, &argon, request).await?;
    let token = generate_access_token(&jwt_state, user.id, user.role)?;

    tracing::debug!("registered user {}", user.id);
    Ok((
        StatusCode::CREATED,
        Json(AuthResponse::new(user.into(), token.token)),
    ))
}

#[derive(Deserialize, Debug, Clone)]
pub struct LoginRequest {
    #[serde(alias = "email")]
    pub identifier: String,
    pub password: String,
}

#[tracing::instrument(skip_all)]
pub async fn login(
    State(users): State<UserCollection>,
    State(argon): State<Argon2<'static>>,
    State(jwt_state): State<JwtState>,
    State(config): State<Arc<Config>>,
    Json(request): Json<LoginRequest>,
) -> Result<(TypedHeader<SetCookie>, Json<AuthResponse>), Error> {
    let principal = PasswordAuthenticator::new(users, argon)
        .authenticate(Credentials {
            identifier: request.identifier,
            secret: request.password,
        })
        .await?;

    let token = generate_access_token(&jwt_state, principal.user_id(), principal.role)?;
    let cookie = session_cookie(
        &token.token,
        ACCESS_TOKEN_LIFETIME.whole_seconds(),
        config.cookie_secure,
    )?;

    Ok((cookie, Json(AuthResponse::new(principal, token.token))))
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub async fn logout(
    State(config): State<Arc<Config>>,
) -> Result<(TypedHeader<SetCookie>, Json<MessageResponse>), Error> {
    let cookie = session_cookie("", 0, config.cookie_secure)?;

    Ok((cookie, Json(MessageResponse::new("Logged out"))))
}

pub async fn me(principal: Principal) -> Json<Principal> {
    Json(principal)
}
