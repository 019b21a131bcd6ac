use std::{collections::HashMap, str::FromStr, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
};
use bson::oid::ObjectId;
use serde::{Deserialize, Serialize};
use tap::TapFallible;
use time::OffsetDateTime;

use crate::{
    access::{AdminOnly, Authorized, PackageCreators, PackageReaders, PackageWriters},
    config::Config,
    error::Error,
    lifecycle::{self, CreatePackageRequest, PackageUpdate},
    model::{ContactInfo, HistoryEntry, PackageModel, PackageStatus, UserRole},
    store::{PackageCollection, PackageFilter, UserCollection},
    util::{FormattedDateTime, Json, ObjectIdString, PathObjectId},
};

use super::auth::MessageResponse;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CourierSummary {
    pub id: ObjectIdString,
    pub username: String,
    pub email: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntryResponse {
    pub status: PackageStatus,
    pub timestamp: FormattedDateTime,
    pub location: String,
    pub description: String,
}

impl From<HistoryEntry> for HistoryEntryResponse {
    fn from(entry: HistoryEntry) -> Self {
        Self {
            status: entry.status,
            timestamp: entry.timestamp.into(),
            location: entry.location,
            description: entry.description,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PackageResponse {
    pub id: ObjectIdString,
    pub tracking_id: String,
    pub sender_info: ContactInfo,
    pub recipient_info: ContactInfo,
    pub pickup_address: String,
    pub delivery_address: String,
    pub status: PackageStatus,
    pub assigned_courier: Option<CourierSummary>,
    pub current_location: String,
    pub eta: Option<FormattedDateTime>,
    pub history: Vec<HistoryEntryResponse>,
    pub created_at: FormattedDateTime,
    pub updated_at: FormattedDateTime,
}

impl PackageResponse {
    pub fn new(package: PackageModel, assigned_courier: Option<CourierSummary>) -> Self {
        Self {
            id: package.id.into(),
            tracking_id: package.tracking_id,
            sender_info: package.sender_info,
            recipient_info: package.recipient_info,
            pickup_address: package.pickup_address,
            delivery_address: package.delivery_address,
            status: package.status,
            assigned_courier,
            current_location: package.current_location,
            eta: package.eta.map(Into::into),
            history: package.history.into_iter().map(Into::into).collect(),
            created_at: package.created_at.into(),
            updated_at: package.updated_at.into(),
        }
    }
}

async fn courier_summary(
    users: &UserCollection,
    courier: Option<ObjectId>,
) -> Result<Option<CourierSummary>, Error> {
    let Some(courier) = courier else {
        return Ok(None);
    };

    Ok(users.find_by_id(courier).await?.map(|user| CourierSummary {
        id: user.id.into(),
        username: user.username,
        email: user.email,
    }))
}

async fn to_response(users: &UserCollection, package: PackageModel) -> Result<PackageResponse, Error> {
    let courier = courier_summary(users, package.assigned_courier).await?;

    Ok(PackageResponse::new(package, courier))
}

/// The referenced user must exist and hold the courier role.
async fn ensure_courier(users: &UserCollection, courier: ObjectId) -> Result<(), Error> {
    match users.find_by_id(courier).await? {
        Some(user) if user.role == UserRole::Courier => Ok(()),
        _ => Err(Error::BadRequest("assigned courier must be an existing courier".to_string()))
            .tap_err(|_| tracing::debug!("invalid courier {}", courier)),
    }
}

/// Resolves a path key: 24 hex characters address the internal id first,
/// anything else (or an id that matches nothing) is a tracking id.
pub async fn find_by_key(packages: &PackageCollection, key: &str) -> Result<PackageModel, Error> {
    let key = key.trim();
    let by_id = match ObjectId::from_str(key) {
        Ok(id) if key.len() == 24 => packages.find_by_id(id).await?,
        _ => None,
    };
    let package = match by_id {
        Some(package) => Some(package),
        None => packages.find_by_tracking_id(key).await?,
    };

    package
        .ok_or(Error::NotFound("package"))
        .tap_err(|_| tracing::debug!("no package for key {:?}", key))
}

#[tracing::instrument(
    skip_all,
    fields(
        user = %user.id,
        role = %user.role,
    )
)]
pub async fn create(
    State(packages): State<PackageCollection>,
    State(users): State<UserCollection>,
    user: Authorized<PackageCreators>,
    Json(request): Json<CreatePackageRequest>,
) -> Result<(StatusCode, Json<PackageResponse>), Error> {
    let package = lifecycle::plan_create(&user, request, OffsetDateTime::now_utc())?;

    if let Some(courier) = package.assigned_courier {
        ensure_courier(&users, courier).await?;
    }

    packages.insert(&package).await?;
    tracing::debug!("created package {}", package.tracking_id);

    Ok((StatusCode::CREATED, Json(to_response(&users, package).await?)))
}

#[derive(Deserialize, Debug, Default)]
pub struct ListQuery {
    pub assigned: Option<bool>,
}

pub fn list_filter(user: &Authorized<PackageReaders>, query: &ListQuery) -> PackageFilter {
    let unassigned = query.assigned == Some(false);

    match user.role {
        UserRole::Admin if unassigned => PackageFilter::Unassigned,
        UserRole::Admin => PackageFilter::All,
        UserRole::Courier if unassigned => PackageFilter::Unassigned,
        UserRole::Courier => PackageFilter::AssignedTo(user.user_id()),
        UserRole::Customer => PackageFilter::Involving(user.email.clone()),
    }
}

#[tracing::instrument(
    skip_all,
    fields(
        user = %user.id,
        assigned = ?query.assigned,
    )
)]
pub async fn index(
    State(packages): State<PackageCollection>,
    State(users): State<UserCollection>,
    user: Authorized<PackageReaders>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<PackageResponse>>, Error> {
    let filter = list_filter(&user, &query);
    let list = packages.list(&filter).await?;

    let mut couriers: HashMap<ObjectId, Option<CourierSummary>> = HashMap::new();
    let mut response = Vec::with_capacity(list.len());
    for package in list {
        let courier = match package.assigned_courier {
            Some(id) => match couriers.get(&id) {
                Some(summary) => summary.clone(),
                None => {
                    let summary = courier_summary(&users, Some(id)).await?;
                    couriers.insert(id, summary.clone());
                    summary
                }
            },
            None => None,
        };
        response.push(PackageResponse::new(package, courier));
    }

    Ok(Json(response))
}

#[tracing::instrument(skip_all, fields(user = %user.id, key = %key))]
pub async fn show(
    State(packages): State<PackageCollection>,
    State(users): State<UserCollection>,
    user: Authorized<PackageReaders>,
    Path(key): Path<String>,
) -> Result<Json<PackageResponse>, Error> {
    let package = find_by_key(&packages, &key).await?;

    if !lifecycle::can_view(&user, &package) {
        return Err(Error::Forbidden("not authorized to view this package"))
            .tap_err(|_| tracing::debug!("package not visible to user"));
    }

    Ok(Json(to_response(&users, package).await?))
}

#[tracing::instrument(
    skip_all,
    fields(
        user = %user.id,
        role = %user.role,
        key = %key,
    )
)]
pub async fn update(
    State(packages): State<PackageCollection>,
    State(users): State<UserCollection>,
    State(config): State<Arc<Config>>,
    user: Authorized<PackageWriters>,
    Path(key): Path<String>,
    Json(request): Json<PackageUpdate>,
) -> Result<Json<PackageResponse>, Error> {
    let current = find_by_key(&packages, &key).await?;

    if user.role == UserRole::Admin {
        if let Some(Some(courier)) = request.assigned_courier {
            ensure_courier(&users, courier.0).await?;
        }
    }

    let now = OffsetDateTime::now_utc();
    let plan = lifecycle::plan_update(&user, &current, request, config.status_transitions, now)?;

    if plan.is_noop() {
        tracing::debug!("nothing changed");
        return Ok(Json(to_response(&users, current).await?));
    }

    let updated = packages
        .apply(current.id, &plan.changes, &plan.history, now.into())
        .await?
        .ok_or(Error::NotFound("package"))?;

    tracing::debug!("package updated, {} history entries added", plan.history.len());
    Ok(Json(to_response(&users, updated).await?))
}

#[tracing::instrument(skip_all, fields(user = %user.id, id = %package_id))]
pub async fn delete(
    State(packages): State<PackageCollection>,
    user: Authorized<AdminOnly>,
    PathObjectId(package_id): PathObjectId,
) -> Result<Json<MessageResponse>, Error> {
    if !packages.delete(package_id).await? {
        return Err(Error::NotFound("package")).tap_err(|_| tracing::debug!("no such package"));
    }

    Ok(Json(MessageResponse::new("Package removed")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use axum::{
        extract::{Path, Query, State},
        http::StatusCode,
    };
    use bson::oid::ObjectId;

    use crate::{
        access::{PackageCreators, PackageReaders, PackageWriters},
        api::v1::tests::{bootstrap, Bootstrap},
        error::Error,
        lifecycle::{CreatePackageRequest, PackageUpdate, TransitionPolicy},
        model::{ContactInfo, PackageStatus, UserRole},
        util::{Json, PathObjectId},
    };

    use super::{ListQuery, PackageResponse};

    fn contact(name: &str, email: &str) -> ContactInfo {
        ContactInfo {
            name: name.to_string(),
            address: format!("{name} street 1"),
            phone: format!("555-{name}"),
            email: Some(email.to_string()),
        }
    }

    fn request(sender: &str, recipient: &str) -> CreatePackageRequest {
        CreatePackageRequest {
            sender_info: contact("sender", sender),
            recipient_info: contact("recipient", recipient),
            ..Default::default()
        }
    }

    async fn create(user: &Bootstrap, request: CreatePackageRequest) -> Result<PackageResponse, Error> {
        super::create(
            user.package_collection(),
            user.user_collection(),
            user.authorized::<PackageCreators>(),
            Json(request),
        )
        .await
        .map(|(_, Json(package))| package)
    }

    async fn list(user: &Bootstrap, assigned: Option<bool>) -> Vec<PackageResponse> {
        let Json(packages) = super::index(
            user.package_collection(),
            user.user_collection(),
            user.authorized::<PackageReaders>(),
            Query(ListQuery { assigned }),
        )
        .await
        .unwrap();

        packages
    }

    async fn show(user: &Bootstrap, key: &str) -> Result<PackageResponse, Error> {
        super::show(
            user.package_collection(),
            user.user_collection(),
            user.authorized::<PackageReaders>(),
            Path(key.to_string()),
        )
        .await
        .map(|Json(package)| package)
    }

    async fn update(user: &Bootstrap, key: &str, request: PackageUpdate) -> Result<PackageResponse, Error> {
        super::update(
            user.package_collection(),
            user.user_collection(),
            user.config(),
            user.authorized::<PackageWriters>(),
            Path(key.to_string()),
            Json(request),
        )
        .await
        .map(|Json(package)| package)
    }

    #[tokio::test]
    async fn test_customer_creates_package() {
        let admin = bootstrap().await;
        let alice = admin.derive("alice", "alice@x.com", UserRole::Customer).await;

        let (status, Json(package)) = super::create(
            alice.package_collection(),
            alice.user_collection(),
            alice.authorized(),
            Json(request("alice@x.com", "bob@x.com")),
        )
        .await
        .unwrap();

        assert_eq!(status, StatusCode::CREATED);
        assert!(package.tracking_id.starts_with("PKG-"));
        assert_eq!(package.status, PackageStatus::Pending);
        assert_eq!(package.current_location, package.pickup_address);
        assert!(package.eta.is_some());
        assert_eq!(package.assigned_courier, None);
        assert_eq!(package.history.len(), 1);
        assert_eq!(package.history[0].status, PackageStatus::Pending);
    }

    #[tokio::test]
    async fn test_customer_cannot_set_admin_fields() {
        let admin = bootstrap().await;
        let alice = admin.derive("alice", "alice@x.com", UserRole::Customer).await;

        let err = create(
            &alice,
            CreatePackageRequest {
                status: Some(PackageStatus::Delivered),
                ..request("alice@x.com", "bob@x.com")
            },
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::Forbidden(_));
        assert!(list(&admin, None).await.is_empty());
    }

    #[tokio::test]
    async fn test_courier_cannot_create() {
        let admin = bootstrap().await;
        let carl = admin.derive("carl", "carl@x.com", UserRole::Courier).await;

        assert_matches!(
            carl.try_authorized::<PackageCreators>(),
            Err(Error::Forbidden(_))
        );
    }

    #[tokio::test]
    async fn test_admin_assigns_courier_on_create() {
        let admin = bootstrap().await;
        let carl = admin.derive("carl", "carl@x.com", UserRole::Courier).await;
        let alice = admin.derive("alice", "alice@x.com", UserRole::Customer).await;

        let err = create(
            &admin,
            CreatePackageRequest {
                assigned_courier: Some(alice.user_id().into()),
                ..request("alice@x.com", "bob@x.com")
            },
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::BadRequest(_));

        let package = create(
            &admin,
            CreatePackageRequest {
                assigned_courier: Some(carl.user_id().into()),
                ..request("alice@x.com", "bob@x.com")
            },
        )
        .await
        .unwrap();

        let courier = package.assigned_courier.unwrap();
        assert_eq!(courier.id, carl.user_id());
        assert_eq!(courier.username, "carl");
        assert_eq!(courier.email, "carl@x.com");
    }

    #[tokio::test]
    async fn test_duplicate_tracking_id() {
        let admin = bootstrap().await;
        let fixed = || CreatePackageRequest {
            tracking_id: Some("PKG-FIXED".to_string()),
            ..request("alice@x.com", "bob@x.com")
        };

        create(&admin, fixed()).await.unwrap();
        let err = create(&admin, fixed()).await.unwrap_err();
        assert_matches!(err, Error::Conflict(_));
    }

    #[tokio::test]
    async fn test_customer_lists_only_own_packages() {
        let admin = bootstrap().await;
        let alice = admin.derive("alice", "alice@x.com", UserRole::Customer).await;
        let eve = admin.derive("eve", "eve@x.com", UserRole::Customer).await;

        let own = create(&alice, request("alice@x.com", "bob@x.com")).await.unwrap();
        create(&admin, request("dave@x.com", "bob@x.com")).await.unwrap();
        let received = create(&admin, request("dave@x.com", "alice@x.com")).await.unwrap();

        let listed: Vec<_> = list(&alice, None).await.into_iter().map(|it| it.id).collect();
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&own.id));
        assert!(listed.contains(&received.id));

        assert!(list(&eve, None).await.is_empty());
        assert_eq!(list(&admin, None).await.len(), 3);
    }

    #[tokio::test]
    async fn test_courier_self_assign_flow() {
        let admin = bootstrap().await;
        let carl = admin.derive("carl", "carl@x.com", UserRole::Courier).await;
        let package = create(&admin, request("alice@x.com", "bob@x.com")).await.unwrap();

        assert_eq!(list(&carl, Some(false)).await.len(), 1);
        assert!(list(&carl, None).await.is_empty());

        let updated = update(
            &carl,
            &package.tracking_id,
            PackageUpdate {
                assigned_courier: Some(Some(carl.user_id().into())),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(updated.assigned_courier.unwrap().id, carl.user_id());
        assert_eq!(updated.history.len(), 1);

        let assigned = list(&carl, None).await;
        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned[0].id, package.id);
        assert_eq!(assigned[0].assigned_courier.as_ref().unwrap().username, "carl");
        assert!(list(&carl, Some(false)).await.is_empty());
        assert!(list(&admin, Some(false)).await.is_empty());
    }

    #[tokio::test]
    async fn test_courier_update_outside_whitelist() {
        let admin = bootstrap().await;
        let carl = admin.derive("carl", "carl@x.com", UserRole::Courier).await;
        let package = create(
            &admin,
            CreatePackageRequest {
                assigned_courier: Some(carl.user_id().into()),
                ..request("alice@x.com", "bob@x.com")
            },
        )
        .await
        .unwrap();

        let err = update(
            &carl,
            &package.id.to_string(),
            PackageUpdate {
                status: Some(PackageStatus::InTransit),
                delivery_address: Some("somewhere else".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::Forbidden(_));

        let unchanged = show(&admin, &package.tracking_id).await.unwrap();
        assert_eq!(unchanged.status, PackageStatus::Pending);
        assert_eq!(unchanged.delivery_address, package.delivery_address);
        assert_eq!(unchanged.history.len(), 1);
    }

    #[tokio::test]
    async fn test_courier_cannot_touch_foreign_package() {
        let admin = bootstrap().await;
        let carl = admin.derive("carl", "carl@x.com", UserRole::Courier).await;
        let dora = admin.derive("dora", "dora@x.com", UserRole::Courier).await;
        let package = create(
            &admin,
            CreatePackageRequest {
                assigned_courier: Some(dora.user_id().into()),
                ..request("alice@x.com", "bob@x.com")
            },
        )
        .await
        .unwrap();

        let err = update(
            &carl,
            &package.tracking_id,
            PackageUpdate {
                status: Some(PackageStatus::Delivered),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::Forbidden(_));

        let err = show(&carl, &package.tracking_id).await.unwrap_err();
        assert_matches!(err, Error::Forbidden(_));
    }

    #[tokio::test]
    async fn test_status_and_location_history() {
        let admin = bootstrap().await;
        let carl = admin.derive("carl", "carl@x.com", UserRole::Courier).await;
        let package = create(
            &admin,
            CreatePackageRequest {
                assigned_courier: Some(carl.user_id().into()),
                ..request("alice@x.com", "bob@x.com")
            },
        )
        .await
        .unwrap();

        let same = update(
            &carl,
            &package.tracking_id,
            PackageUpdate {
                status: Some(PackageStatus::Pending),
                current_location: Some(package.current_location.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(same.history.len(), 1);

        let picked = update(
            &carl,
            &package.tracking_id,
            PackageUpdate {
                status: Some(PackageStatus::PickedUp),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(picked.status, PackageStatus::PickedUp);
        assert_eq!(picked.history.len(), 2);
        assert_eq!(picked.history[1].status, PackageStatus::PickedUp);
        assert!(picked.history[1].timestamp >= picked.history[0].timestamp);

        let moved = update(
            &carl,
            &package.tracking_id,
            PackageUpdate {
                current_location: Some("Hub 7".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(moved.current_location, "Hub 7");
        assert_eq!(moved.history.len(), 3);
        assert_eq!(moved.history[2].status, PackageStatus::PickedUp);
        assert_eq!(moved.history[2].location, "Hub 7");
    }

    #[tokio::test]
    async fn test_admin_update_and_unassign() {
        let admin = bootstrap().await;
        let carl = admin.derive("carl", "carl@x.com", UserRole::Courier).await;
        let package = create(
            &admin,
            CreatePackageRequest {
                assigned_courier: Some(carl.user_id().into()),
                ..request("alice@x.com", "bob@x.com")
            },
        )
        .await
        .unwrap();

        let updated = update(
            &admin,
            &package.id.to_string(),
            PackageUpdate {
                assigned_courier: Some(None),
                delivery_address: Some("bob avenue 9".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(updated.assigned_courier, None);
        assert_eq!(updated.delivery_address, "bob avenue 9");
        assert_eq!(updated.tracking_id, package.tracking_id);
        assert_eq!(updated.history.len(), 1);

        let err = update(
            &admin,
            &package.id.to_string(),
            PackageUpdate {
                assigned_courier: Some(Some(ObjectId::new().into())),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::BadRequest(_));
    }

    #[tokio::test]
    async fn test_workflow_transitions() {
        let admin = bootstrap().await;
        let mut config = (*admin.app_state.config).clone();
        config.status_transitions = TransitionPolicy::Workflow;
        let package = create(&admin, request("alice@x.com", "bob@x.com")).await.unwrap();

        let err = super::update(
            admin.package_collection(),
            admin.user_collection(),
            State(Arc::new(config)),
            admin.authorized(),
            Path(package.tracking_id.clone()),
            Json(PackageUpdate {
                status: Some(PackageStatus::Delivered),
                ..Default::default()
            }),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::BadRequest(_));
    }

    #[tokio::test]
    async fn test_show_by_id_or_tracking_id() {
        let admin = bootstrap().await;
        let alice = admin.derive("alice", "alice@x.com", UserRole::Customer).await;
        let eve = admin.derive("eve", "eve@x.com", UserRole::Customer).await;
        let package = create(&alice, request("alice@x.com", "bob@x.com")).await.unwrap();

        assert_eq!(show(&alice, &package.id.to_string()).await.unwrap().id, package.id);
        assert_eq!(show(&alice, &package.tracking_id).await.unwrap().id, package.id);
        assert_eq!(show(&admin, &package.tracking_id).await.unwrap().id, package.id);

        assert_matches!(show(&eve, &package.tracking_id).await, Err(Error::Forbidden(_)));
        assert_matches!(
            show(&alice, &ObjectId::new().to_string()).await,
            Err(Error::NotFound(_))
        );
        assert_matches!(show(&alice, "PKG-MISSING").await, Err(Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_hex_tracking_id_is_reachable() {
        let admin = bootstrap().await;
        let hex = "0123456789abcdef01234567";
        let package = create(
            &admin,
            CreatePackageRequest {
                tracking_id: Some(hex.to_string()),
                ..request("alice@x.com", "bob@x.com")
            },
        )
        .await
        .unwrap();
        assert_eq!(package.tracking_id, hex);

        assert_eq!(show(&admin, hex).await.unwrap().id, package.id);

        let updated = update(
            &admin,
            hex,
            PackageUpdate {
                current_location: Some("Hub 7".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(updated.id, package.id);
        assert_eq!(updated.current_location, "Hub 7");
    }

    #[tokio::test]
    async fn test_delete_package() {
        let admin = bootstrap().await;
        let package = create(&admin, request("alice@x.com", "bob@x.com")).await.unwrap();

        let Json(message) = super::delete(
            admin.package_collection(),
            admin.authorized(),
            PathObjectId(package.id.0),
        )
        .await
        .unwrap();
        assert_eq!(message.message, "Package removed");

        assert_matches!(
            show(&admin, &package.tracking_id).await,
            Err(Error::NotFound(_))
        );

        let err = super::delete(
            admin.package_collection(),
            admin.authorized(),
            PathObjectId(ObjectId::new()),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::NotFound(_));
    }
}
