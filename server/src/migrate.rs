//! Versioned index migrations. Applied versions are recorded in the
//! `migrations` collection so each one runs once per database.

use std::collections::HashSet;

use bson::oid::ObjectId;
use mongodb::{options::IndexOptions, IndexModel};
use serde::{Deserialize, Serialize};

use crate::{
    error::Error,
    model::{PackageModel, UserModel},
    mongo_ext::Collection,
};

#[derive(Serialize, Deserialize, Debug)]
pub struct MigrateModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub version: i64,
}

#[derive(Clone)]
pub struct MigrationCollection(pub Collection<MigrateModel>);

impl std::ops::Deref for MigrationCollection {
    type Target = Collection<MigrateModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl MigrationCollection {
    pub async fn insert_version(&self, version: i64) -> Result<(), Error> {
        self.insert_one(
            MigrateModel {
                id: ObjectId::new(),
                version,
            },
            None,
        )
        .await
        .map(|_| ())
        .map_err(Into::into)
    }

    pub async fn applied_versions(&self) -> Result<HashSet<i64>, Error> {
        Ok(self
            .find_all(None)
            .await?
            .into_iter()
            .map(|it| it.version)
            .collect())
    }
}

fn unique(keys: bson::Document) -> IndexModel {
    IndexModel::builder()
        .keys(keys)
        .options(IndexOptions::builder().unique(true).build())
        .build()
}

fn lookup(keys: bson::Document) -> IndexModel {
    IndexModel::builder().keys(keys).build()
}

pub struct Migrator {
    pub migrations: MigrationCollection,
    pub users: Collection<UserModel>,
    pub packages: Collection<PackageModel>,
}

impl Migrator {
    pub fn new(database: &mongodb::Database) -> Self {
        Self {
            migrations: MigrationCollection(database.collection("migrations").into()),
            users: database.collection("users").into(),
            packages: database.collection("packages").into(),
        }
    }

    async fn v1_migrate(&self) -> Result<(), Error> {
        self.migrations
            .create_index(unique(bson::doc! { "version": 1 }), None)
            .await?;

        self.users
            .create_indexes(
                [
                    unique(bson::doc! { "username": 1 }),
                    unique(bson::doc! { "email": 1 }),
                ],
                None,
            )
            .await?;

        self.packages
            .create_index(unique(bson::doc! { "trackingId": 1 }), None)
            .await?;

        Ok(())
    }

    async fn v2_migrate(&self) -> Result<(), Error> {
        self.packages
            .create_indexes(
                [
                    lookup(bson::doc! { "assignedCourier": 1 }),
                    lookup(bson::doc! { "senderInfo.email": 1 }),
                    lookup(bson::doc! { "recipientInfo.email": 1 }),
                ],
                None,
            )
            .await?;

        Ok(())
    }

    /// A version is recorded only after all of its indexes exist.
    pub async fn run(&self) -> Result<(), Error> {
        let applied = self.migrations.applied_versions().await?;

        macro_rules! migrate {
            ($version:expr, $fun:ident) => {
                if !applied.contains(&$version) {
                    tracing::info!("running migration version {}", $version);
                    self.$fun().await?;
                    self.migrations.insert_version($version).await?;
                }
            };
        }

        migrate!(1, v1_migrate);
        migrate!(2, v2_migrate);

        Ok(())
    }
}
