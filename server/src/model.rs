//! Persisted documents for the `users` and `packages` collections.

use bson::oid::ObjectId;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::util::non_blank;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    #[default]
    Customer,
    Courier,
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Courier => "courier",
            Self::Admin => "admin",
        }
    }
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,

    pub username: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub password: String,
    pub role: UserRole,

    pub created_at: bson::DateTime,
    pub updated_at: bson::DateTime,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PackageStatus {
    #[default]
    Pending,
    #[serde(rename = "Out for Pickup")]
    OutForPickup,
    #[serde(rename = "Picked Up")]
    PickedUp,
    #[serde(rename = "In Transit")]
    InTransit,
    #[serde(rename = "Out for Delivery")]
    OutForDelivery,
    Delivered,
    #[serde(rename = "Attempted Delivery")]
    AttemptedDelivery,
    Cancelled,
    Returned,
}

impl PackageStatus {
    pub const ALL: [Self; 9] = [
        Self::Pending,
        Self::OutForPickup,
        Self::PickedUp,
        Self::InTransit,
        Self::OutForDelivery,
        Self::Delivered,
        Self::AttemptedDelivery,
        Self::Cancelled,
        Self::Returned,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::OutForPickup => "Out for Pickup",
            Self::PickedUp => "Picked Up",
            Self::InTransit => "In Transit",
            Self::OutForDelivery => "Out for Delivery",
            Self::Delivered => "Delivered",
            Self::AttemptedDelivery => "Attempted Delivery",
            Self::Cancelled => "Cancelled",
            Self::Returned => "Returned",
        }
    }

    /// Terminal by convention only; nothing stops a later update from
    /// moving the package on unless the workflow policy is enabled.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Cancelled | Self::Returned)
    }
}

impl std::fmt::Display for PackageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Validate, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContactInfo {
    #[validate(length(min = 1, message = "name is required"))]
    pub name: String,

    #[validate(length(min = 1, message = "address is required"))]
    pub address: String,

    #[validate(length(min = 1, message = "phone is required"))]
    pub phone: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(email)]
    pub email: Option<String>,
}

impl ContactInfo {
    /// Trims every field; an empty email counts as no email.
    pub fn normalized(self) -> Self {
        Self {
            name: self.name.trim().to_string(),
            address: self.address.trim().to_string(),
            phone: self.phone.trim().to_string(),
            email: non_blank(self.email),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub status: PackageStatus,
    pub timestamp: bson::DateTime,
    pub location: String,
    #[serde(default)]
    pub description: String,
}

pub const UNKNOWN_LOCATION: &str = "Unknown Location";

fn unknown_location() -> String {
    UNKNOWN_LOCATION.to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PackageModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub tracking_id: String,

    pub sender_info: ContactInfo,
    pub recipient_info: ContactInfo,
    pub pickup_address: String,
    pub delivery_address: String,

    pub status: PackageStatus,
    pub assigned_courier: Option<ObjectId>,
    #[serde(default = "unknown_location")]
    pub current_location: String,
    pub eta: Option<bson::DateTime>,

    #[serde(default)]
    pub history: Vec<HistoryEntry>,

    pub created_at: bson::DateTime,
    pub updated_at: bson::DateTime,
}

impl PackageModel {
    pub fn involves_email(&self, email: &str) -> bool {
        self.sender_info.email.as_deref() == Some(email)
            || self.recipient_info.email.as_deref() == Some(email)
    }

    pub fn involves_phone(&self, phone: &str) -> bool {
        self.sender_info.phone == phone || self.recipient_info.phone == phone
    }
}
