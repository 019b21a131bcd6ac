//! Package lifecycle: per-role field masks, creation, update planning and
//! the history entries derived from each applied change.
//!
//! Everything here is pure. Handlers load the current record, ask this module
//! for a plan, then hand the plan to the store as one write.

use std::{collections::HashMap, str::FromStr};

use bson::oid::ObjectId;
use serde::Deserialize;
use serde_json::Value;
use tap::TapFallible;
use time::{Duration, OffsetDateTime};
use validator::Validate;

use crate::{
    access::Principal,
    error::Error,
    model::{ContactInfo, HistoryEntry, PackageModel, PackageStatus, UserRole},
    util::{double_option, non_blank, random_base36, to_base36, FormattedDateTime, ObjectIdString},
};

pub const DEFAULT_ETA: Duration = Duration::days(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageField {
    TrackingId,
    SenderInfo,
    RecipientInfo,
    PickupAddress,
    DeliveryAddress,
    Status,
    AssignedCourier,
    CurrentLocation,
    Eta,
}

impl PackageField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TrackingId => "trackingId",
            Self::SenderInfo => "senderInfo",
            Self::RecipientInfo => "recipientInfo",
            Self::PickupAddress => "pickupAddress",
            Self::DeliveryAddress => "deliveryAddress",
            Self::Status => "status",
            Self::AssignedCourier => "assignedCourier",
            Self::CurrentLocation => "currentLocation",
            Self::Eta => "eta",
        }
    }
}

/// Fields a role may change on an existing package.
pub fn writable_fields(role: UserRole) -> &'static [PackageField] {
    use PackageField::*;

    match role {
        UserRole::Admin => &[
            SenderInfo,
            RecipientInfo,
            PickupAddress,
            DeliveryAddress,
            Status,
            AssignedCourier,
            CurrentLocation,
            Eta,
        ],
        UserRole::Courier => &[Status, CurrentLocation, Eta, AssignedCourier],
        UserRole::Customer => &[],
    }
}

/// Optional fields a role may supply when creating a package, on top of the
/// mandatory sender and recipient info.
pub fn creatable_fields(role: UserRole) -> &'static [PackageField] {
    use PackageField::*;

    match role {
        UserRole::Admin => &[TrackingId, Status, AssignedCourier, CurrentLocation, Eta],
        UserRole::Courier | UserRole::Customer => &[],
    }
}

fn check_mask(role: UserRole, requested: &[PackageField], allowed: &[PackageField]) -> Result<(), Error> {
    match requested.iter().find(|it| !allowed.contains(it)) {
        Some(field) => Err(Error::Forbidden(match role {
            UserRole::Courier => "couriers can only update status, location, ETA and self-assignment",
            UserRole::Customer | UserRole::Admin => "not authorized to set this field",
        }))
        .tap_err(|_| tracing::debug!("{} tried to set {}", role, field.as_str())),
        None => Ok(()),
    }
}

/// Keys outside the request schema, such as `trackingId` on an update or
/// `history` anywhere. Non-admins are refused outright; for an admin the field
/// is immutable or unknown.
fn check_extra_fields(role: UserRole, rest: &HashMap<String, Value>) -> Result<(), Error> {
    let Some(field) = rest.keys().min() else {
        return Ok(());
    };

    match role {
        UserRole::Admin => Err(Error::BadRequest(format!("{field} cannot be set"))),
        UserRole::Courier | UserRole::Customer => Err(Error::Forbidden("not authorized to set this field"))
            .tap_err(|_| tracing::debug!("{} tried to set {}", role, field)),
    }
}

/// Allowed status transitions. Unrestricted unless the workflow table is
/// switched on in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransitionPolicy {
    #[default]
    Unrestricted,
    Workflow,
}

impl TransitionPolicy {
    pub fn successors(status: PackageStatus) -> &'static [PackageStatus] {
        use PackageStatus::*;

        match status {
            Pending => &[OutForPickup, Cancelled],
            OutForPickup => &[PickedUp, Cancelled],
            PickedUp => &[InTransit, Returned, Cancelled],
            InTransit => &[OutForDelivery, Returned],
            OutForDelivery => &[Delivered, AttemptedDelivery, Returned],
            AttemptedDelivery => &[OutForDelivery, Returned],
            Delivered | Cancelled | Returned => &[],
        }
    }

    pub fn allows(&self, from: PackageStatus, to: PackageStatus) -> bool {
        match self {
            Self::Unrestricted => true,
            Self::Workflow => from == to || Self::successors(from).contains(&to),
        }
    }

    pub fn check(&self, from: PackageStatus, to: PackageStatus) -> Result<(), Error> {
        if self.allows(from, to) {
            Ok(())
        } else {
            Err(Error::BadRequest(format!(
                "cannot change status from {from} to {to}"
            )))
        }
    }
}

impl FromStr for TransitionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unrestricted" => Ok(Self::Unrestricted),
            "workflow" => Ok(Self::Workflow),
            other => Err(other.to_string()),
        }
    }
}

pub fn generate_tracking_id(now: OffsetDateTime) -> String {
    let millis = (now.unix_timestamp_nanos() / 1_000_000).max(0) as u64;

    format!("PKG-{}{}", to_base36(millis), random_base36(4))
}

#[derive(Deserialize, Validate, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct CreatePackageRequest {
    pub tracking_id: Option<String>,

    #[validate]
    pub sender_info: ContactInfo,
    #[validate]
    pub recipient_info: ContactInfo,

    pub status: Option<PackageStatus>,
    pub assigned_courier: Option<ObjectIdString>,
    pub current_location: Option<String>,
    pub eta: Option<FormattedDateTime>,

    #[serde(flatten)]
    pub rest: HashMap<String, Value>,
}

impl CreatePackageRequest {
    pub fn fields(&self) -> Vec<PackageField> {
        let mut fields = vec![];
        if self.tracking_id.is_some() {
            fields.push(PackageField::TrackingId);
        }
        if self.status.is_some() {
            fields.push(PackageField::Status);
        }
        if self.assigned_courier.is_some() {
            fields.push(PackageField::AssignedCourier);
        }
        if self.current_location.is_some() {
            fields.push(PackageField::CurrentLocation);
        }
        if self.eta.is_some() {
            fields.push(PackageField::Eta);
        }
        fields
    }
}

/// Builds a new package record, including its first history entry.
pub fn plan_create(
    actor: &Principal,
    request: CreatePackageRequest,
    now: OffsetDateTime,
) -> Result<PackageModel, Error> {
    check_mask(actor.role, &request.fields(), creatable_fields(actor.role))?;
    check_extra_fields(actor.role, &request.rest)?;

    let request = CreatePackageRequest {
        sender_info: request.sender_info.normalized(),
        recipient_info: request.recipient_info.normalized(),
        ..request
    };
    request.validate()?;

    let tracking_id = non_blank(request.tracking_id).unwrap_or_else(|| generate_tracking_id(now));
    let status = request.status.unwrap_or_default();
    let pickup_address = request.sender_info.address.clone();
    let delivery_address = request.recipient_info.address.clone();
    let current_location = non_blank(request.current_location).unwrap_or_else(|| pickup_address.clone());
    let eta = request.eta.map(|it| it.0).unwrap_or(now + DEFAULT_ETA);

    let history = vec![HistoryEntry {
        status,
        timestamp: now.into(),
        location: current_location.clone(),
        description: format!("Package created with status: {status}"),
    }];

    Ok(PackageModel {
        id: ObjectId::new(),
        tracking_id,
        sender_info: request.sender_info,
        recipient_info: request.recipient_info,
        pickup_address,
        delivery_address,
        status,
        assigned_courier: request.assigned_courier.map(Into::into),
        current_location,
        eta: Some(eta.into()),
        history,
        created_at: now.into(),
        updated_at: now.into(),
    })
}

/// Update request body. Absent fields are left alone; `assignedCourier: null`
/// unassigns.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct PackageUpdate {
    pub sender_info: Option<ContactInfo>,
    pub recipient_info: Option<ContactInfo>,
    pub pickup_address: Option<String>,
    pub delivery_address: Option<String>,
    pub status: Option<PackageStatus>,
    #[serde(default, deserialize_with = "double_option")]
    pub assigned_courier: Option<Option<ObjectIdString>>,
    pub current_location: Option<String>,
    pub eta: Option<FormattedDateTime>,

    #[serde(flatten)]
    pub rest: HashMap<String, Value>,
}

impl PackageUpdate {
    pub fn fields(&self) -> Vec<PackageField> {
        let mut fields = vec![];
        if self.sender_info.is_some() {
            fields.push(PackageField::SenderInfo);
        }
        if self.recipient_info.is_some() {
            fields.push(PackageField::RecipientInfo);
        }
        if self.pickup_address.is_some() {
            fields.push(PackageField::PickupAddress);
        }
        if self.delivery_address.is_some() {
            fields.push(PackageField::DeliveryAddress);
        }
        if self.status.is_some() {
            fields.push(PackageField::Status);
        }
        if self.assigned_courier.is_some() {
            fields.push(PackageField::AssignedCourier);
        }
        if self.current_location.is_some() {
            fields.push(PackageField::CurrentLocation);
        }
        if self.eta.is_some() {
            fields.push(PackageField::Eta);
        }
        fields
    }
}

/// Field values that differ from the stored record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackageChanges {
    pub sender_info: Option<ContactInfo>,
    pub recipient_info: Option<ContactInfo>,
    pub pickup_address: Option<String>,
    pub delivery_address: Option<String>,
    pub status: Option<PackageStatus>,
    pub assigned_courier: Option<Option<ObjectId>>,
    pub current_location: Option<String>,
    pub eta: Option<bson::DateTime>,
}

impl PackageChanges {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn apply_to(&self, package: &mut PackageModel) {
        if let Some(sender_info) = &self.sender_info {
            package.sender_info = sender_info.clone();
        }
        if let Some(recipient_info) = &self.recipient_info {
            package.recipient_info = recipient_info.clone();
        }
        if let Some(pickup_address) = &self.pickup_address {
            package.pickup_address = pickup_address.clone();
        }
        if let Some(delivery_address) = &self.delivery_address {
            package.delivery_address = delivery_address.clone();
        }
        if let Some(status) = self.status {
            package.status = status;
        }
        if let Some(assigned_courier) = self.assigned_courier {
            package.assigned_courier = assigned_courier;
        }
        if let Some(current_location) = &self.current_location {
            package.current_location = current_location.clone();
        }
        if let Some(eta) = self.eta {
            package.eta = Some(eta);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdatePlan {
    pub changes: PackageChanges,
    pub history: Vec<HistoryEntry>,
}

impl UpdatePlan {
    pub fn is_noop(&self) -> bool {
        self.changes.is_empty() && self.history.is_empty()
    }
}

fn changed<T: PartialEq>(requested: Option<T>, current: &T) -> Option<T> {
    requested.filter(|it| it != current)
}

fn non_empty_text(value: Option<String>, field: &'static str) -> Result<Option<String>, Error> {
    match value {
        Some(value) => non_blank(Some(value))
            .map(Some)
            .ok_or_else(|| Error::BadRequest(format!("{field} cannot be empty"))),
        None => Ok(None),
    }
}

fn resolve_courier_assignment(
    actor: &Principal,
    current: &PackageModel,
    requested: Option<Option<ObjectIdString>>,
) -> Result<Option<Option<ObjectId>>, Error> {
    let requested = requested.map(|it| it.map(ObjectId::from));

    match actor.role {
        UserRole::Courier => {
            let me = actor.user_id();
            let assignment = match (requested, current.assigned_courier) {
                (None, _) => None,
                (Some(Some(id)), None) if id == me => Some(Some(me)),
                (Some(Some(id)), Some(assigned)) if id == me && assigned == me => None,
                _ => {
                    return Err(Error::Forbidden(
                        "couriers cannot change assigned courier or take assigned packages",
                    ))
                    .tap_err(|_| tracing::debug!("courier {} tried reassigning", me))
                }
            };

            let assignee = assignment.flatten().or(current.assigned_courier);
            if assignee != Some(me) {
                return Err(Error::Forbidden("package is not assigned to this courier"))
                    .tap_err(|_| tracing::debug!("courier {} updating foreign package", me));
            }

            Ok(assignment)
        }
        UserRole::Admin | UserRole::Customer => Ok(requested.filter(|it| *it != current.assigned_courier)),
    }
}

/// Decides what an update request changes and which history entries it
/// produces. Fails without side effects when the actor may not make the
/// change.
pub fn plan_update(
    actor: &Principal,
    current: &PackageModel,
    update: PackageUpdate,
    policy: TransitionPolicy,
    now: OffsetDateTime,
) -> Result<UpdatePlan, Error> {
    check_mask(actor.role, &update.fields(), writable_fields(actor.role))?;
    check_extra_fields(actor.role, &update.rest)?;

    let assigned_courier = resolve_courier_assignment(actor, current, update.assigned_courier)?;

    let sender_info = update.sender_info.map(ContactInfo::normalized);
    if let Some(sender_info) = &sender_info {
        sender_info.validate()?;
    }
    let recipient_info = update.recipient_info.map(ContactInfo::normalized);
    if let Some(recipient_info) = &recipient_info {
        recipient_info.validate()?;
    }

    let status = changed(update.status, &current.status);
    if let Some(status) = status {
        policy.check(current.status, status)?;
    }

    let changes = PackageChanges {
        sender_info: changed(sender_info, &current.sender_info),
        recipient_info: changed(recipient_info, &current.recipient_info),
        pickup_address: changed(
            non_empty_text(update.pickup_address, "pickupAddress")?,
            &current.pickup_address,
        ),
        delivery_address: changed(
            non_empty_text(update.delivery_address, "deliveryAddress")?,
            &current.delivery_address,
        ),
        status,
        assigned_courier,
        current_location: changed(
            non_empty_text(update.current_location, "currentLocation")?,
            &current.current_location,
        ),
        eta: update
            .eta
            .map(bson::DateTime::from)
            .filter(|it| Some(*it) != current.eta),
    };

    let history = derive_history(current, &changes, actor.role, now);

    Ok(UpdatePlan { changes, history })
}

/// History entries implied by `changes`. A status change yields one entry
/// carrying the resulting location; a location-only change yields one entry
/// carrying the unchanged status. Timestamps never go backwards.
pub fn derive_history(
    current: &PackageModel,
    changes: &PackageChanges,
    role: UserRole,
    now: OffsetDateTime,
) -> Vec<HistoryEntry> {
    let now = bson::DateTime::from(now);
    let timestamp = current
        .history
        .last()
        .map(|last| last.timestamp.max(now))
        .unwrap_or(now);

    let location = changes
        .current_location
        .clone()
        .unwrap_or_else(|| current.current_location.clone());

    match (changes.status, &changes.current_location) {
        (Some(status), _) => vec![HistoryEntry {
            status,
            timestamp,
            location,
            description: format!("Status updated to {status} by {role}."),
        }],
        (None, Some(new_location)) => vec![HistoryEntry {
            status: current.status,
            timestamp,
            location,
            description: format!("Location updated to {new_location} by {role}."),
        }],
        (None, None) => vec![],
    }
}

/// Whether `principal` may read `package`: admins always, otherwise the
/// sender, the recipient or the assigned courier.
pub fn can_view(principal: &Principal, package: &PackageModel) -> bool {
    match principal.role {
        UserRole::Admin => true,
        UserRole::Courier | UserRole::Customer => {
            package.involves_email(&principal.email)
                || principal
                    .phone
                    .as_deref()
                    .map_or(false, |phone| package.involves_phone(phone))
                || package.assigned_courier == Some(principal.user_id())
        }
    }
}
