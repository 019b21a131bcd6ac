//! Role-based access gate shared by every protected route.

use std::marker::PhantomData;

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
    RequestPartsExt,
};
use bson::oid::ObjectId;
use serde::Serialize;
use tap::TapFallible;

use crate::{
    api::v1::token::JwtState,
    error::Error,
    model::{UserModel, UserRole},
    store::UserCollection,
    util::ObjectIdString,
};

/// Authenticated identity attached to a request.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub id: ObjectIdString,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub role: UserRole,
}

impl Principal {
    pub fn user_id(&self) -> ObjectId {
        self.id.0
    }
}

impl From<UserModel> for Principal {
    fn from(user: UserModel) -> Self {
        Self {
            id: user.id.into(),
            username: user.username,
            email: user.email,
            phone: user.phone,
            role: user.role,
        }
    }
}

pub fn authorize<'a>(
    principal: Option<&'a Principal>,
    allowed: &[UserRole],
) -> Result<&'a Principal, Error> {
    match principal {
        Some(principal) if allowed.contains(&principal.role) => Ok(principal),
        Some(principal) => Err(Error::Forbidden("role is not authorized to access this route"))
            .tap_err(|_| {
                tracing::debug!(
                    "role {} denied, allowed {:?}",
                    principal.role,
                    allowed
                )
            }),
        None => Err(Error::Forbidden("role none is not authorized to access this route")),
    }
}

/// Allowed-role set declared by a route.
pub trait RoleSet {
    const ROLES: &'static [UserRole];
}

macro_rules! role_set {
    ($($(#[$meta:meta])* $name:ident => [$($role:ident),+];)+) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy)]
            pub struct $name;

            impl RoleSet for $name {
                const ROLES: &'static [UserRole] = &[$(UserRole::$role),+];
            }
        )+
    };
}

role_set! {
    /// User management and package deletion.
    AdminOnly => [Admin];
    PackageCreators => [Admin, Customer];
    PackageReaders => [Admin, Courier, Customer];
    PackageWriters => [Admin, Courier];
}

/// A principal that passed the gate for the role set `R`.
#[derive(Debug, Clone)]
pub struct Authorized<R: RoleSet> {
    principal: Principal,
    _roles: PhantomData<R>,
}

impl<R: RoleSet> Authorized<R> {
    pub fn new(principal: Principal) -> Result<Self, Error> {
        authorize(Some(&principal), R::ROLES)?;

        Ok(Self {
            principal,
            _roles: PhantomData,
        })
    }

    pub fn into_inner(self) -> Principal {
        self.principal
    }
}

impl<R: RoleSet> std::ops::Deref for Authorized<R> {
    type Target = Principal;

    fn deref(&self) -> &Self::Target {
        &self.principal
    }
}

#[async_trait]
impl<S, R> FromRequestParts<S> for Authorized<R>
where
    JwtState: FromRef<S>,
    UserCollection: FromRef<S>,
    S: Send + Sync,
    R: RoleSet + Send,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let principal = parts.extract_with_state::<Principal, _>(state).await?;

        Self::new(principal)
    }
}
