use std::ops::Deref;

use bson::{oid::ObjectId, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use serde::de::DeserializeOwned;

use crate::error::Error;

const DUPLICATE_KEY: i32 = 11000;

pub struct Collection<T>(pub mongodb::Collection<T>);

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Deref for Collection<T> {
    type Target = mongodb::Collection<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> From<mongodb::Collection<T>> for Collection<T> {
    fn from(value: mongodb::Collection<T>) -> Self {
        Self(value)
    }
}

impl<T> Collection<T>
where
    T: DeserializeOwned + Send + Sync + Unpin,
{
    pub async fn find_one_by_id(&self, id: ObjectId) -> Result<Option<T>, Error> {
        self.find_one(bson::doc! { "_id": id }, None)
            .await
            .map_err(Into::into)
    }

    pub async fn find_all(&self, filter: impl Into<Option<Document>>) -> Result<Vec<T>, Error> {
        let mut cursor = self.find(filter, None).await?;

        let mut vec = vec![];

        while cursor.advance().await? {
            vec.push(cursor.deserialize_current()?);
        }

        Ok(vec)
    }

    pub async fn delete_one_by_id(&self, id: ObjectId) -> Result<bool, Error> {
        self.delete_one(bson::doc! { "_id": id }, None)
            .await
            .map(|it| it.deleted_count > 0)
            .map_err(Into::into)
    }
}

/// Unique index violation, either from an insert or from a
/// find-and-modify command.
pub fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(err)) => err.code == DUPLICATE_KEY,
        ErrorKind::Command(err) => err.code == DUPLICATE_KEY,
        _ => false,
    }
}

/// Maps a duplicate key failure on `field` to [`Error::Conflict`].
pub fn conflict_on_duplicate(field: &str) -> impl FnOnce(mongodb::error::Error) -> Error + '_ {
    move |err| {
        if is_duplicate_key(&err) {
            Error::Conflict(field.to_string())
        } else {
            err.into()
        }
    }
}
