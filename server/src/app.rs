use std::sync::Arc;

use axum::{
    extract::FromRef,
    http::{header, HeaderValue, Method, StatusCode, Uri},
    routing, Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    api::v1::{auth, package, token::JwtState, track, user},
    config::{Config, StorageBackend},
    error::Error,
    migrate::Migrator,
    store::{
        memory::{InMemoryPackages, InMemoryUsers},
        mongo::{MongoPackages, MongoUsers},
        PackageCollection, UserCollection,
    },
};

#[derive(FromRef, Clone)]
pub struct AppState {
    pub argon: argon2::Argon2<'static>,
    pub jwt_state: JwtState,
    pub config: Arc<Config>,

    pub user_collection: UserCollection,
    pub package_collection: PackageCollection,
}

impl AppState {
    pub fn with_stores(
        config: Config,
        user_collection: UserCollection,
        package_collection: PackageCollection,
    ) -> Self {
        Self {
            argon: argon2::Argon2::default(),
            jwt_state: JwtState::new(&config.jwt_secret),
            config: Arc::new(config),

            user_collection,
            package_collection,
        }
    }

    pub fn in_memory(config: Config) -> Self {
        Self::with_stores(
            config,
            UserCollection(Arc::new(InMemoryUsers::new())),
            PackageCollection(Arc::new(InMemoryPackages::new())),
        )
    }

    pub async fn mongo(config: Config, uri: &str, database_name: &str) -> Result<Self, Error> {
        let mongo_client_opt = mongodb::options::ClientOptions::parse(uri).await?;
        let mongo_client = mongodb::Client::with_options(mongo_client_opt)?;

        let db = mongo_client.database(database_name);
        Migrator::new(&db).run().await?;

        Ok(Self::with_stores(
            config,
            UserCollection(Arc::new(MongoUsers(db.collection("users").into()))),
            PackageCollection(Arc::new(MongoPackages(db.collection("packages").into()))),
        ))
    }

    pub async fn from_config(config: Config) -> Result<Self, Error> {
        match config.storage.clone() {
            StorageBackend::Mongo { uri, database } => {
                tracing::info!("using mongodb database {}", database);
                Self::mongo(config, &uri, &database).await
            }
            StorageBackend::Memory => {
                tracing::warn!("using in-memory storage, data is lost on restart");
                Ok(Self::in_memory(config))
            }
        }
    }
}

async fn health() -> &'static str {
    "API is running..."
}

async fn route_not_found(uri: Uri) -> Error {
    Error::RouteNotFound(uri)
}

fn cors_layer(client_url: &str) -> Result<CorsLayer, Error> {
    let origin = HeaderValue::from_str(client_url)
        .map_err(|_| Error::CustomStr(StatusCode::INTERNAL_SERVER_ERROR, "invalid CLIENT_URL"))?;

    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]))
}

pub fn router(app_state: AppState) -> Result<Router, Error> {
    let api = Router::new()
        .nest(
            "/auth",
            Router::new()
                .route("/register", routing::post(auth::register))
                .route("/login", routing::post(auth::login))
                .route("/logout", routing::post(auth::logout))
                .route("/me", routing::get(auth::me)),
        )
        .nest(
            "/users",
            Router::new()
                .route("/", routing::get(user::index))
                .route("/register", routing::post(auth::register))
                .route("/:id", routing::delete(user::delete)),
        )
        .nest(
            "/packages",
            Router::new()
                .route("/", routing::get(package::index).post(package::create))
                .route("/track/:tracking_id", routing::get(track::show))
                .route(
                    "/:key",
                    routing::get(package::show)
                        .put(package::update)
                        .delete(package::delete),
                ),
        );

    let client_url = app_state.config.client_url.clone();

    let mut app = Router::new()
        .route("/", routing::get(health))
        .nest("/api", api)
        .fallback(route_not_found)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http());

    if let Some(client_url) = client_url {
        app = app.layer(cors_layer(&client_url)?);
    }

    Ok(app)
}
