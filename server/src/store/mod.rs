//! User and package persistence.
//!
//! Handlers only see [`UserCollection`] and [`PackageCollection`]; the
//! backing implementation is MongoDB in production and an in-memory map in
//! tests or `STORAGE=memory` runs.

pub mod memory;
pub mod mongo;

use std::sync::Arc;

use axum::async_trait;
use bson::oid::ObjectId;

use crate::{
    error::Error,
    lifecycle::PackageChanges,
    model::{HistoryEntry, PackageModel, UserModel},
};

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Fails with [`Error::Conflict`] when the username or email is taken.
    async fn insert(&self, user: &UserModel) -> Result<(), Error>;

    async fn find_by_id(&self, id: ObjectId) -> Result<Option<UserModel>, Error>;

    async fn find_by_email(&self, email: &str) -> Result<Option<UserModel>, Error>;

    async fn find_by_username(&self, username: &str) -> Result<Option<UserModel>, Error>;

    /// Whether any user already owns the username or the email.
    async fn exists(&self, username: &str, email: &str) -> Result<bool, Error>;

    async fn list(&self) -> Result<Vec<UserModel>, Error>;

    async fn delete(&self, id: ObjectId) -> Result<bool, Error>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageFilter {
    All,
    Unassigned,
    AssignedTo(ObjectId),
    /// Sender or recipient email matches.
    Involving(String),
}

#[async_trait]
pub trait PackageStore: Send + Sync {
    /// Fails with [`Error::Conflict`] when the tracking id is taken.
    async fn insert(&self, package: &PackageModel) -> Result<(), Error>;

    async fn find_by_id(&self, id: ObjectId) -> Result<Option<PackageModel>, Error>;

    async fn find_by_tracking_id(&self, tracking_id: &str) -> Result<Option<PackageModel>, Error>;

    async fn list(&self, filter: &PackageFilter) -> Result<Vec<PackageModel>, Error>;

    /// Applies `changes` and appends `history` in a single write, returning
    /// the updated record or `None` if it no longer exists.
    async fn apply(
        &self,
        id: ObjectId,
        changes: &PackageChanges,
        history: &[HistoryEntry],
        updated_at: bson::DateTime,
    ) -> Result<Option<PackageModel>, Error>;

    async fn delete(&self, id: ObjectId) -> Result<bool, Error>;
}

#[derive(Clone)]
pub struct UserCollection(pub Arc<dyn UserStore>);

impl std::ops::Deref for UserCollection {
    type Target = dyn UserStore;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

#[derive(Clone)]
pub struct PackageCollection(pub Arc<dyn PackageStore>);

impl std::ops::Deref for PackageCollection {
    type Target = dyn PackageStore;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}
