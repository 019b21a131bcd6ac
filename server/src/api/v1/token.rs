use bson::oid::ObjectId;
use jsonwebtoken::TokenData;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::{
    error::{Error, UnauthorizedType},
    model::UserRole,
    util::ObjectIdString,
};

pub const ACCESS_TOKEN_LIFETIME: Duration = Duration::hours(1);

#[derive(Clone)]
pub struct JwtState {
    validation: jsonwebtoken::Validation,
    header: jsonwebtoken::Header,

    encoding_key: jsonwebtoken::EncodingKey,
    decoding_key: jsonwebtoken::DecodingKey,
}

impl JwtState {
    pub fn new(secret: &str) -> Self {
        let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256);
        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
        validation.validate_exp = false;

        Self {
            header,
            validation,

            encoding_key: jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: jsonwebtoken::DecodingKey::from_secret(secret.as_bytes()),
        }
    }
}

pub fn current_timestamp() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AccessTokenClaims {
    pub user_id: ObjectIdString,
    pub role: UserRole,
    pub exp: i64,
}

impl AccessTokenClaims {
    pub fn is_expired(&self) -> bool {
        self.exp < current_timestamp().unix_timestamp()
    }
}

pub struct GenerateAccessTokenResponse {
    pub expired_at: OffsetDateTime,
    pub token: String,
}

pub fn generate_access_token(
    jwt_state: &JwtState,
    user_id: ObjectId,
    role: UserRole,
) -> Result<GenerateAccessTokenResponse, Error> {
    let expired_at = current_timestamp() + ACCESS_TOKEN_LIFETIME;
    let token = generate_access_token_with_exp(jwt_state, user_id, role, expired_at.unix_timestamp())?;

    Ok(GenerateAccessTokenResponse { expired_at, token })
}

pub fn generate_access_token_with_exp(
    jwt_state: &JwtState,
    user_id: ObjectId,
    role: UserRole,
    exp: i64,
) -> Result<String, Error> {
    jsonwebtoken::encode(
        &jwt_state.header,
        &AccessTokenClaims {
            user_id: user_id.into(),
            role,
            exp,
        },
        &jwt_state.encoding_key,
    )
    .map_err(Into::into)
}

/// Verifies signature and expiry. Every failure is reported as an invalid
/// token, never as a server error.
pub fn decode_access_token(
    jwt_state: &JwtState,
    token: &str,
) -> Result<TokenData<AccessTokenClaims>, Error> {
    let token: TokenData<AccessTokenClaims> =
        jsonwebtoken::decode(token, &jwt_state.decoding_key, &jwt_state.validation).map_err(|err| {
            tracing::debug!("rejected access token: {}", err);
            Error::Unauthorized(UnauthorizedType::InvalidAccessToken)
        })?;

    if token.claims.is_expired() {
        return Err(Error::Unauthorized(UnauthorizedType::InvalidAccessToken));
    }

    Ok(token)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    pub fn test_access_token() {
        let jwt = JwtState::new("test-secret");
        let user_id = ObjectId::new();

        let generated = generate_access_token(&jwt, user_id, UserRole::Courier).unwrap();
        assert!(generated.expired_at > current_timestamp() + Duration::minutes(59));

        let token = decode_access_token(&jwt, &generated.token).unwrap();
        assert_eq!(token.claims.user_id, user_id);
        assert_eq!(token.claims.role, UserRole::Courier);
        assert!(!token.claims.is_expired());
    }

    #[test]
    pub fn test_expired_access_token() {
        let jwt = JwtState::new("test-secret");

        let token = generate_access_token_with_exp(
            &jwt,
            ObjectId::new(),
            UserRole::Admin,
            (current_timestamp() + Duration::seconds(-1)).unix_timestamp(),
        )
        .unwrap();

        let err = decode_access_token(&jwt, &token).unwrap_err();
        assert_matches!(
            err,
            Error::Unauthorized(UnauthorizedType::InvalidAccessToken)
        );
    }

    #[test]
    pub fn test_foreign_signature() {
        let jwt = JwtState::new("test-secret");
        let other = JwtState::new("other-secret");

        let token = generate_access_token(&other, ObjectId::new(), UserRole::Admin)
            .unwrap()
            .token;

        let err = decode_access_token(&jwt, &token).unwrap_err();
        assert_matches!(
            err,
            Error::Unauthorized(UnauthorizedType::InvalidAccessToken)
        );

        let err = decode_access_token(&jwt, "not.a.token").unwrap_err();
        assert_matches!(
            err,
            Error::Unauthorized(UnauthorizedType::InvalidAccessToken)
        );
    }

    #[test]
    pub fn test_claims_shape() {
        let claims = AccessTokenClaims {
            user_id: ObjectId::new().into(),
            role: UserRole::Customer,
            exp: 0,
        };
        let json = serde_json::to_value(&claims).unwrap();

        assert!(json.get("userId").is_some());
        assert_eq!(json["role"], "customer");
    }
}
