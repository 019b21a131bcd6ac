use std::collections::HashMap;

use axum::async_trait;
use bson::oid::ObjectId;
use parking_lot::RwLock;

use crate::{
    error::Error,
    lifecycle::PackageChanges,
    model::{HistoryEntry, PackageModel, UserModel},
};

use super::{PackageFilter, PackageStore, UserStore};

/// Users kept in insertion order so listings are stable.
#[derive(Default)]
pub struct InMemoryUsers {
    users: RwLock<Vec<UserModel>>,
}

impl InMemoryUsers {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for InMemoryUsers {
    async fn insert(&self, user: &UserModel) -> Result<(), Error> {
        let mut users = self.users.write();

        if users.iter().any(|it| it.username == user.username) {
            return Err(Error::Conflict("username".to_string()));
        }
        if users.iter().any(|it| it.email == user.email) {
            return Err(Error::Conflict("email".to_string()));
        }

        users.push(user.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: ObjectId) -> Result<Option<UserModel>, Error> {
        Ok(self.users.read().iter().find(|it| it.id == id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<UserModel>, Error> {
        Ok(self.users.read().iter().find(|it| it.email == email).cloned())
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<UserModel>, Error> {
        Ok(self
            .users
            .read()
            .iter()
            .find(|it| it.username == username)
            .cloned())
    }

    async fn exists(&self, username: &str, email: &str) -> Result<bool, Error> {
        Ok(self
            .users
            .read()
            .iter()
            .any(|it| it.username == username || it.email == email))
    }

    async fn list(&self) -> Result<Vec<UserModel>, Error> {
        Ok(self.users.read().clone())
    }

    async fn delete(&self, id: ObjectId) -> Result<bool, Error> {
        let mut users = self.users.write();
        let before = users.len();
        users.retain(|it| it.id != id);

        Ok(users.len() != before)
    }
}

#[derive(Default)]
pub struct InMemoryPackages {
    packages: RwLock<HashMap<ObjectId, PackageModel>>,
}

impl InMemoryPackages {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PackageFilter {
    pub fn matches(&self, package: &PackageModel) -> bool {
        match self {
            Self::All => true,
            Self::Unassigned => package.assigned_courier.is_none(),
            Self::AssignedTo(courier) => package.assigned_courier == Some(*courier),
            Self::Involving(email) => package.involves_email(email),
        }
    }
}

#[async_trait]
impl PackageStore for InMemoryPackages {
    async fn insert(&self, package: &PackageModel) -> Result<(), Error> {
        let mut packages = self.packages.write();

        if packages
            .values()
            .any(|it| it.tracking_id == package.tracking_id)
        {
            return Err(Error::Conflict("trackingId".to_string()));
        }

        packages.insert(package.id, package.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: ObjectId) -> Result<Option<PackageModel>, Error> {
        Ok(self.packages.read().get(&id).cloned())
    }

    async fn find_by_tracking_id(&self, tracking_id: &str) -> Result<Option<PackageModel>, Error> {
        Ok(self
            .packages
            .read()
            .values()
            .find(|it| it.tracking_id == tracking_id)
            .cloned())
    }

    async fn list(&self, filter: &PackageFilter) -> Result<Vec<PackageModel>, Error> {
        let mut packages: Vec<_> = self
            .packages
            .read()
            .values()
            .filter(|it| filter.matches(it))
            .cloned()
            .collect();
        packages.sort_by_key(|it| it.created_at);

        Ok(packages)
    }

    async fn apply(
        &self,
        id: ObjectId,
        changes: &PackageChanges,
        history: &[HistoryEntry],
        updated_at: bson::DateTime,
    ) -> Result<Option<PackageModel>, Error> {
        let mut packages = self.packages.write();

        Ok(packages.get_mut(&id).map(|package| {
            changes.apply_to(package);
            package.history.extend_from_slice(history);
            package.updated_at = updated_at;
            package.clone()
        }))
    }

    async fn delete(&self, id: ObjectId) -> Result<bool, Error> {
        Ok(self.packages.write().remove(&id).is_some())
    }
}
