use crate::model::user::User;
use crate::AppConfig;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use log::{debug, warn};
use poem::Request;
use poem_openapi::auth::Bearer;
use poem_openapi::SecurityScheme;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Tokens are valid for a week.
pub const TOKEN_LIFETIME_DAYS: i64 = 7;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    pub id: String,
    pub exp: usize,
}

pub fn create_token(secret: &str, user_id: &Uuid) -> Result<String, anyhow::Error> {
    let exp = (Utc::now() + Duration::days(TOKEN_LIFETIME_DAYS)).timestamp() as usize;
    let claims = Claims {
        id: user_id.to_string(),
        exp,
    };

    let token = encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok(token)
}

/// Checks the signature and the expiry.
pub fn decode_token(secret: &str, token: &str) -> Result<Claims, anyhow::Error> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )?;
    Ok(data.claims)
}

/// The user behind a valid bearer token. Requests without one are answered with 401.
#[derive(SecurityScheme)]
#[oai(type = "bearer", checker = "jwt_token_checker")]
pub struct BearerAuth(pub User);

async fn jwt_token_checker(req: &Request, bearer: Bearer) -> Option<User> {
    let config = match req.data::<Arc<AppConfig>>() {
        Some(config) => config,
        None => {
            warn!("The application config is not attached to the request.");
            return None;
        }
    };

    let claims = match decode_token(&config.jwt_secret, &bearer.token) {
        Ok(claims) => claims,
        Err(err) => {
            debug!("Rejected token: {}", err);
            return None;
        }
    };

    let user_id = match Uuid::parse_str(&claims.id) {
        Ok(id) => id,
        Err(err) => {
            warn!("Invalid user id in token: {}", err);
            return None;
        }
    };

    let pool = req.data::<Arc<sqlx::PgPool>>()?;
    match User::get_by_id(pool, &user_id).await {
        Ok(Some(user)) if user.is_active => Some(user),
        Ok(Some(_)) => {
            debug!("User {} is deactivated.", user_id);
            None
        }
        Ok(None) => {
            debug!("User {} no longer exists.", user_id);
            None
        }
        Err(err) => {
            warn!("Failed to load the user of a token: {}", err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_roundtrip() {
        let id = Uuid::new_v4();
        let token = create_token("secret", &id).unwrap();
        let claims = decode_token("secret", &token).unwrap();
        assert_eq!(claims.id, id.to_string());

        let lifetime = claims.exp as i64 - Utc::now().timestamp();
        assert!(lifetime > 6 * 24 * 3600 && lifetime <= 7 * 24 * 3600);
    }

    #[test]
    fn test_wrong_secret() {
        let token = create_token("secret", &Uuid::new_v4()).unwrap();
        assert!(decode_token("another-secret", &token).is_err());
        assert!(decode_token("secret", "not.a.token").is_err());
    }

    #[test]
    fn test_expired_token() {
        let claims = Claims {
            id: Uuid::new_v4().to_string(),
            exp: (Utc::now() - Duration::days(1)).timestamp() as usize,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        assert!(decode_token("secret", &token).is_err());
    }
}
