use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::auth::generate_token_value;
use crate::collection::{DocumentCollection, LocalCollection};
use crate::document::Document;
use crate::error::{DbError, Result};
use crate::ids::DocId;
use crate::models::{from_document, to_body, AuthLevel, Permission, Token, TokenType};

/// What a new token grants.
#[derive(Clone, Debug)]
pub struct NewToken {
    pub kind: TokenType,
    pub auth_level: AuthLevel,
    pub permissions: Vec<Permission>,
    pub role: Option<String>,
}

impl NewToken {
    pub fn new(kind: TokenType, auth_level: AuthLevel) -> Self {
        Self {
            kind,
            auth_level,
            permissions: Vec::new(),
            role: None,
        }
    }

    pub fn with_permissions(mut self, permissions: Vec<Permission>) -> Self {
        self.permissions = permissions;
        self
    }
}

/// The entity a token belongs to.
#[derive(Clone, Debug, Default)]
pub struct TokenLinks {
    pub app: Option<DocId>,
    pub user: Option<String>,
    pub app_data_sharing: Option<DocId>,
    pub relationship: Option<DocId>,
}

#[derive(Clone)]
pub struct TokenService {
    collection: Arc<LocalCollection>,
}

impl TokenService {
    pub fn new(collection: Arc<LocalCollection>) -> Self {
        Self { collection }
    }

    pub async fn mint(&self, request: NewToken, links: TokenLinks) -> Result<Token> {
        let token = Token {
            id: DocId::new(),
            value: generate_token_value(),
            kind: request.kind,
            auth_level: request.auth_level,
            permissions: request.permissions,
            role: request.role,
            app: links.app,
            user: links.user,
            app_data_sharing: links.app_data_sharing,
            relationship: links.relationship,
        };
        let mut stored = self.collection.add(to_body(&token)?, Document::new()).await?;
        let doc = stored
            .pop()
            .ok_or_else(|| DbError::Config("token insert returned nothing".into()))?;
        debug!(token = %token.id, kind = ?token.kind, "Token minted");
        from_document(doc)
    }

    /// Delete a token created by a provisioning step whose follow-up failed.
    pub async fn compensate(&self, token: &Token, reason: &DbError) {
        warn!(token = %token.id, error = %reason, "Removing token of failed provisioning");
        if let Err(err) = self.collection.rm(token.id).await {
            warn!(token = %token.id, error = %err, "Unable to remove orphaned token");
        }
    }

    pub async fn find_by_value(&self, value: &str) -> Result<Option<Token>> {
        let filter = self
            .collection
            .model()
            .parse_query(&json!({ "value": value }), &Default::default())?;
        self.collection.find_one(&filter).await?.map(from_document).transpose()
    }

    pub async fn find_by_id(&self, id: DocId) -> Result<Option<Token>> {
        self.collection.find_by_id(id).await?.map(from_document).transpose()
    }

    pub async fn rm(&self, id: DocId) -> Result<bool> {
        self.collection.rm(id).await
    }

    /// Replace the permission for `permission.route`, or append it.
    pub async fn add_or_update_permission(&self, id: DocId, permission: Permission) -> Result<Token> {
        let mut token = self
            .find_by_id(id)
            .await?
            .ok_or_else(|| DbError::not_found("invalid_id", format!("Unknown token {}", id)))?;
        match token.permissions.iter_mut().find(|p| p.route == permission.route) {
            Some(existing) => existing.permission = permission.permission,
            None => token.permissions.push(permission),
        }

        let mut details = Document::new();
        details.insert("permissions".into(), serde_json::to_value(&token.permissions)?);
        self.collection.update(details, id).await?;
        Ok(token)
    }

    pub async fn set_role(&self, id: DocId, role: Option<String>) -> Result<()> {
        let mut details = Document::new();
        details.insert("role".into(), role.map_or(Value::Null, Value::String));
        self.collection
            .update(details, id)
            .await?
            .ok_or_else(|| DbError::not_found("invalid_id", format!("Unknown token {}", id)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::fixtures::fixture;

    #[tokio::test]
    async fn test_mint_lookup_and_permissions() {
        let fx = fixture();
        let tokens = &fx.entities.tokens;
        let app = DocId::new();
        let token = tokens
            .mint(
                NewToken::new(TokenType::App, AuthLevel::Admin),
                TokenLinks {
                    app: Some(app),
                    ..TokenLinks::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(token.app, Some(app));

        let found = tokens.find_by_value(&token.value).await.unwrap().unwrap();
        assert_eq!(found, token);
        assert!(tokens.find_by_value("missing").await.unwrap().is_none());

        let read = Permission {
            route: "orders".into(),
            permission: "read".into(),
        };
        tokens.add_or_update_permission(token.id, read).await.unwrap();
        let write = Permission {
            route: "orders".into(),
            permission: "write".into(),
        };
        let updated = tokens.add_or_update_permission(token.id, write.clone()).await.unwrap();
        assert_eq!(updated.permissions, vec![write.clone()]);
        assert_eq!(tokens.find_by_id(token.id).await.unwrap().unwrap().permissions, vec![write]);

        tokens.set_role(token.id, Some("customer".into())).await.unwrap();
        assert_eq!(tokens.find_by_id(token.id).await.unwrap().unwrap().role.as_deref(), Some("customer"));
        assert!(tokens.rm(token.id).await.unwrap());
    }
}
