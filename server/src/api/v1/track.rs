//! Unauthenticated tracking lookup. Only the public subset of a package is
//! returned: no contact details, no internal ids, courier by username only.

use axum::extract::{Path, State};
use serde::{Deserialize, Serialize};
use tap::TapFallible;

use crate::{
    error::Error,
    model::{PackageModel, PackageStatus},
    store::{PackageCollection, UserCollection},
    util::{FormattedDateTime, Json},
};

use super::package::HistoryEntryResponse;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PublicCourier {
    pub username: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PublicPackageResponse {
    pub tracking_id: String,
    pub status: PackageStatus,
    pub current_location: String,
    pub eta: Option<FormattedDateTime>,
    pub history: Vec<HistoryEntryResponse>,
    pub assigned_courier: Option<PublicCourier>,
}

impl PublicPackageResponse {
    pub fn new(package: PackageModel, courier: Option<PublicCourier>) -> Self {
        Self {
            tracking_id: package.tracking_id,
            status: package.status,
            current_location: package.current_location,
            eta: package.eta.map(Into::into),
            history: package.history.into_iter().map(Into::into).collect(),
            assigned_courier: courier,
        }
    }
}

#[tracing::instrument(skip_all, fields(tracking_id = %tracking_id))]
pub async fn show(
    State(packages): State<PackageCollection>,
    State(users): State<UserCollection>,
    Path(tracking_id): Path<String>,
) -> Result<Json<PublicPackageResponse>, Error> {
    let package = packages
        .find_by_tracking_id(tracking_id.trim())
        .await?
        .ok_or(Error::NotFound("package"))
        .tap_err(|_| tracing::debug!("unknown tracking id"))?;

    let courier = match package.assigned_courier {
        Some(id) => users.find_by_id(id).await?.map(|user| PublicCourier {
            username: user.username,
        }),
        None => None,
    };

    Ok(Json(PublicPackageResponse::new(package, courier)))
}
