use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::{DbError, Result};
use crate::models::{AuthLevel, Permission, Token, TokenType};

pub const TOKEN_LENGTH: usize = 36;

/// Fresh random token value.
pub fn generate_token_value() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

/// Value of a `Bearer` authorization header.
pub fn bearer_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

pub fn require_level(token: &Token, level: AuthLevel) -> Result<()> {
    if token.auth_level >= level {
        Ok(())
    } else {
        Err(DbError::Forbidden(format!(
            "auth level {:?} required, token has {:?}",
            level, token.auth_level
        )))
    }
}

pub fn require_type(token: &Token, kind: TokenType) -> Result<()> {
    if token.kind == kind {
        Ok(())
    } else {
        Err(DbError::Forbidden(format!("{:?} token required", kind)))
    }
}

fn route_matches(pattern: &str, route: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => route.starts_with(prefix),
        None => pattern == route,
    }
}

fn grants(entry: &Permission, route: &str, permission: &str) -> bool {
    route_matches(&entry.route, route) && (entry.permission == "*" || entry.permission == permission)
}

/// Admin tokens reach every route; others need a matching permission entry.
pub fn check_permission(token: &Token, route: &str, permission: &str) -> Result<()> {
    if token.auth_level >= AuthLevel::Admin || token.permissions.iter().any(|p| grants(p, route, permission)) {
        return Ok(());
    }
    Err(DbError::Forbidden(format!("no {} permission for {}", permission, route)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::DocId;

    fn token(level: AuthLevel, permissions: Vec<Permission>) -> Token {
        Token {
            id: DocId::new(),
            value: generate_token_value(),
            kind: TokenType::User,
            auth_level: level,
            permissions,
            role: None,
            app: None,
            user: None,
            app_data_sharing: None,
            relationship: None,
        }
    }

    #[test]
    fn test_token_values() {
        let value = generate_token_value();
        assert_eq!(value.len(), TOKEN_LENGTH);
        assert!(value.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(value, generate_token_value());
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer "), None);
    }

    #[test]
    fn test_levels_and_permissions() {
        let user = token(
            AuthLevel::User,
            vec![Permission {
                route: "orders*".into(),
                permission: "read".into(),
            }],
        );
        assert!(require_level(&user, AuthLevel::User).is_ok());
        assert_eq!(require_level(&user, AuthLevel::Admin).unwrap_err().status(), 403);
        assert!(require_type(&user, TokenType::User).is_ok());
        assert!(require_type(&user, TokenType::DataSharing).is_err());

        assert!(check_permission(&user, "orders", "read").is_ok());
        assert!(check_permission(&user, "orders", "delete").is_err());
        assert!(check_permission(&user, "people", "read").is_err());
        assert!(check_permission(&token(AuthLevel::Admin, vec![]), "people", "delete").is_ok());
        assert!(check_permission(&token(AuthLevel::User, vec![Permission::wildcard()]), "x", "add").is_ok());
    }
}
