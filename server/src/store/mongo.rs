use axum::async_trait;
use bson::{oid::ObjectId, Document};
use mongodb::options::{FindOneAndUpdateOptions, ReturnDocument};

use crate::{
    error::Error,
    lifecycle::PackageChanges,
    model::{HistoryEntry, PackageModel, UserModel},
    mongo_ext::{conflict_on_duplicate, Collection},
};

use super::{PackageFilter, PackageStore, UserStore};

#[derive(Clone)]
pub struct MongoUsers(pub Collection<UserModel>);

#[async_trait]
impl UserStore for MongoUsers {
    async fn insert(&self, user: &UserModel) -> Result<(), Error> {
        self.0
            .insert_one(user, None)
            .await
            .map(|_| ())
            .map_err(conflict_on_duplicate("username or email"))
    }

    async fn find_by_id(&self, id: ObjectId) -> Result<Option<UserModel>, Error> {
        self.0.find_one_by_id(id).await
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<UserModel>, Error> {
        self.0
            .find_one(bson::doc! { "email": email }, None)
            .await
            .map_err(Into::into)
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<UserModel>, Error> {
        self.0
            .find_one(bson::doc! { "username": username }, None)
            .await
            .map_err(Into::into)
    }

    async fn exists(&self, username: &str, email: &str) -> Result<bool, Error> {
        let count = self
            .0
            .count_documents(
                bson::doc! {
                    "$or": [
                        { "username": username },
                        { "email": email },
                    ]
                },
                None,
            )
            .await?;

        Ok(count > 0)
    }

    async fn list(&self) -> Result<Vec<UserModel>, Error> {
        self.0.find_all(None).await
    }

    async fn delete(&self, id: ObjectId) -> Result<bool, Error> {
        self.0.delete_one_by_id(id).await
    }
}

#[derive(Clone)]
pub struct MongoPackages(pub Collection<PackageModel>);

impl PackageFilter {
    pub fn to_document(&self) -> Document {
        match self {
            Self::All => bson::doc! {},
            Self::Unassigned => bson::doc! { "assignedCourier": null },
            Self::AssignedTo(courier) => bson::doc! { "assignedCourier": courier },
            Self::Involving(email) => bson::doc! {
                "$or": [
                    { "senderInfo.email": email },
                    { "recipientInfo.email": email },
                ]
            },
        }
    }
}

/// History is appended with `$push`, never rewritten, so writes planned from
/// the same snapshot all keep their entries.
fn update_document(
    changes: &PackageChanges,
    history: &[HistoryEntry],
    updated_at: bson::DateTime,
) -> Result<Document, Error> {
    let mut update = bson::doc! { "$set": set_document(changes, updated_at)? };

    if !history.is_empty() {
        let entries = history
            .iter()
            .map(bson::to_bson)
            .collect::<Result<Vec<_>, _>>()?;
        update.insert("$push", bson::doc! { "history": { "$each": entries } });
    }

    Ok(update)
}

fn set_document(changes: &PackageChanges, updated_at: bson::DateTime) -> Result<Document, Error> {
    let mut set = bson::doc! { "updatedAt": updated_at };

    if let Some(sender_info) = &changes.sender_info {
        set.insert("senderInfo", bson::to_bson(sender_info)?);
    }
    if let Some(recipient_info) = &changes.recipient_info {
        set.insert("recipientInfo", bson::to_bson(recipient_info)?);
    }
    if let Some(pickup_address) = &changes.pickup_address {
        set.insert("pickupAddress", pickup_address);
    }
    if let Some(delivery_address) = &changes.delivery_address {
        set.insert("deliveryAddress", delivery_address);
    }
    if let Some(status) = changes.status {
        set.insert("status", status.as_str());
    }
    if let Some(assigned_courier) = changes.assigned_courier {
        set.insert("assignedCourier", assigned_courier);
    }
    if let Some(current_location) = &changes.current_location {
        set.insert("currentLocation", current_location);
    }
    if let Some(eta) = changes.eta {
        set.insert("eta", eta);
    }

    Ok(set)
}

#[async_trait]
impl PackageStore for MongoPackages {
    async fn insert(&self, package: &PackageModel) -> Result<(), Error> {
        self.0
            .insert_one(package, None)
            .await
            .map(|_| ())
            .map_err(conflict_on_duplicate("trackingId"))
    }

    async fn find_by_id(&self, id: ObjectId) -> Result<Option<PackageModel>, Error> {
        self.0.find_one_by_id(id).await
    }

    async fn find_by_tracking_id(&self, tracking_id: &str) -> Result<Option<PackageModel>, Error> {
        self.0
            .find_one(bson::doc! { "trackingId": tracking_id }, None)
            .await
            .map_err(Into::into)
    }

    async fn list(&self, filter: &PackageFilter) -> Result<Vec<PackageModel>, Error> {
        self.0.find_all(filter.to_document()).await
    }

    async fn apply(
        &self,
        id: ObjectId,
        changes: &PackageChanges,
        history: &[HistoryEntry],
        updated_at: bson::DateTime,
    ) -> Result<Option<PackageModel>, Error> {
        let update = update_document(changes, history, updated_at)?;

        self.0
            .find_one_and_update(
                bson::doc! { "_id": id },
                update,
                FindOneAndUpdateOptions::builder()
                    .return_document(ReturnDocument::After)
                    .build(),
            )
            .await
            .map_err(Into::into)
    }

    async fn delete(&self, id: ObjectId) -> Result<bool, Error> {
        self.0.delete_one_by_id(id).await
    }
}

#[cfg(test)]
mod tests {
    use crate::model::{ContactInfo, PackageStatus};

    use super::*;

    #[test]
    fn test_filter_documents() {
        assert_eq!(PackageFilter::All.to_document(), bson::doc! {});
        assert_eq!(
            PackageFilter::Unassigned.to_document(),
            bson::doc! { "assignedCourier": null }
        );

        let document = PackageFilter::Involving("a@test.com".to_string()).to_document();
        let or = document.get_array("$or").unwrap();
        assert_eq!(or.len(), 2);
    }

    #[test]
    fn test_set_document() {
        let now = bson::DateTime::now();
        let set = set_document(&PackageChanges::default(), now).unwrap();
        assert_eq!(set, bson::doc! { "updatedAt": now });

        let changes = PackageChanges {
            status: Some(PackageStatus::PickedUp),
            assigned_courier: Some(None),
            recipient_info: Some(ContactInfo::default()),
            ..Default::default()
        };
        let set = set_document(&changes, now).unwrap();

        assert_eq!(set.get_str("status").unwrap(), "Picked Up");
        assert_eq!(set.get("assignedCourier"), Some(&bson::Bson::Null));
        assert!(set.get_document("recipientInfo").is_ok());
        assert!(set.get("currentLocation").is_none());
    }

    #[test]
    fn test_update_document_appends_history() {
        let now = bson::DateTime::now();
        let update = update_document(&PackageChanges::default(), &[], now).unwrap();
        assert_eq!(update, bson::doc! { "$set": { "updatedAt": now } });

        let entry = HistoryEntry {
            status: PackageStatus::InTransit,
            timestamp: now,
            location: "Hub 7".to_string(),
            description: "moved".to_string(),
        };
        let update = update_document(&PackageChanges::default(), &[entry], now).unwrap();

        let set = update.get_document("$set").unwrap();
        assert!(set.get("history").is_none());
        let each = update
            .get_document("$push")
            .unwrap()
            .get_document("history")
            .unwrap()
            .get_array("$each")
            .unwrap();
        assert_eq!(each.len(), 1);
    }
}
