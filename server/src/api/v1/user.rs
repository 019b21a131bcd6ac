use axum::extract::State;
use serde::{Deserialize, Serialize};
use tap::TapFallible;

use crate::{
    access::{AdminOnly, Authorized},
    error::Error,
    model::{UserModel, UserRole},
    store::UserCollection,
    util::{FormattedDateTime, Json, ObjectIdString, PathObjectId},
};

use super::auth::MessageResponse;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub id: ObjectIdString,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub role: UserRole,
    pub created_at: FormattedDateTime,
    pub updated_at: FormattedDateTime,
}

impl From<UserModel> for UserResponse {
    fn from(user: UserModel) -> Self {
        Self {
            id: user.id.into(),
            username: user.username,
            email: user.email,
            phone: user.phone,
            role: user.role,
            created_at: user.created_at.into(),
            updated_at: user.updated_at.into(),
        }
    }
}

pub async fn index(
    State(users): State<UserCollection>,
    _admin: Authorized<AdminOnly>,
) -> Result<Json<Vec<UserResponse>>, Error> {
    let users = users.list().await?;

    Ok(Json(users.into_iter().map(Into::into).collect()))
}

#[tracing::instrument(
    skip_all,
    fields(
        admin = %admin.id,
        id = %user_id,
    )
)]
pub async fn delete(
    State(users): State<UserCollection>,
    admin: Authorized<AdminOnly>,
    PathObjectId(user_id): PathObjectId,
) -> Result<Json<MessageResponse>, Error> {
    if admin.user_id() == user_id {
        return Err(Error::BadRequest(
            "administrators cannot delete their own account".to_string(),
        ));
    }

    if !users.delete(user_id).await? {
        return Err(Error::NotFound("user")).tap_err(|_| tracing::debug!("no such user"));
    }

    tracing::debug!("user deleted");
    Ok(Json(MessageResponse::new("User removed")))
}
