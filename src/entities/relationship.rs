use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::token::{NewToken, TokenLinks, TokenService};
use crate::collection::{DocumentCollection, LocalCollection};
use crate::document::Document;
use crate::error::{DbError, Result};
use crate::ids::DocId;
use crate::models::{
    from_document, to_body, AppRelationship, AuthLevel, Permission, RelationshipSide, RelationshipType, Token,
    TokenType,
};

#[derive(Clone, Debug, Deserialize)]
pub struct NewRelationship {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RelationshipType,
    pub source: RelationshipSide,
    pub destination: RelationshipSide,
}

#[derive(Clone)]
pub struct RelationshipService {
    collection: Arc<LocalCollection>,
    tokens: TokenService,
}

impl RelationshipService {
    pub fn new(collection: Arc<LocalCollection>, tokens: TokenService) -> Self {
        Self { collection, tokens }
    }

    /// Store one side of a relationship. The source side mints the token its
    /// counterpart will present.
    pub async fn add(&self, body: NewRelationship) -> Result<(AppRelationship, Option<Token>)> {
        let relationship = AppRelationship {
            id: DocId::new(),
            name: body.name,
            kind: body.kind,
            source: body.source,
            destination: body.destination,
            token: None,
        };
        let doc = to_body(&relationship)?;

        if relationship.kind == RelationshipType::Destination {
            let stored = self.store(doc, Document::new()).await?;
            info!(relationship = %stored.id, "Relationship destination added");
            return Ok((stored, None));
        }

        let token = self
            .tokens
            .mint(
                NewToken::new(TokenType::Relationship, AuthLevel::User).with_permissions(vec![Permission::wildcard()]),
                TokenLinks {
                    relationship: Some(relationship.id),
                    ..TokenLinks::default()
                },
            )
            .await?;
        let mut internals = Document::new();
        internals.insert("_tokenId".into(), token.id.to_value());
        match self.store(doc, internals).await {
            Ok(stored) => {
                info!(relationship = %stored.id, "Relationship source added");
                Ok((stored, Some(token)))
            }
            Err(err) => {
                self.tokens.compensate(&token, &err).await;
                Err(err)
            }
        }
    }

    async fn store(&self, body: serde_json::Value, internals: Document) -> Result<AppRelationship> {
        let mut docs = self.collection.add(body, internals).await?;
        let doc = docs
            .pop()
            .ok_or_else(|| DbError::Config("relationship insert returned nothing".into()))?;
        from_document(doc)
    }

    /// The destination record of relationship `name` held by `app_id`.
    pub async fn find_destination(&self, name: &str, app_id: DocId) -> Result<Option<AppRelationship>> {
        let filter = self.collection.model().parse_query(
            &json!({
                "type": "destination",
                "name": name,
                "destination.appId": app_id.to_string()
            }),
            &Default::default(),
        )?;
        self.collection.find_one(&filter).await?.map(from_document).transpose()
    }

    pub async fn find_by_id(&self, id: DocId) -> Result<Option<AppRelationship>> {
        self.collection.find_by_id(id).await?.map(from_document).transpose()
    }

    pub async fn rm(&self, id: DocId) -> Result<bool> {
        let Some(relationship) = self.find_by_id(id).await? else {
            return Ok(false);
        };
        if let Some(token) = relationship.token {
            self.tokens.rm(token).await?;
        }
        self.collection.rm(id).await
    }
}
