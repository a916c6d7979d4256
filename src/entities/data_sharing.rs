use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::token::{NewToken, TokenLinks, TokenService};
use crate::collection::{DocumentCollection, LocalCollection};
use crate::document::Document;
use crate::error::{DbError, Result};
use crate::federation::{RemoteConnector, RemoteTarget};
use crate::ids::DocId;
use crate::models::{from_document, to_body, AppDataSharing, AuthLevel, Permission, RemoteApp, SharingPolicy, Token, TokenType};
use crate::schema::{decode_value, encode};

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDataSharing {
    pub name: String,
    pub remote_app: RemoteApp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicySide {
    Local,
    Remote,
}

#[derive(Clone)]
pub struct DataSharingService {
    collection: Arc<LocalCollection>,
    tokens: TokenService,
}

fn unknown(what: impl std::fmt::Display) -> DbError {
    DbError::not_found("unknown_data_sharing", format!("Unknown data sharing {}", what))
}

impl DataSharingService {
    pub fn new(collection: Arc<LocalCollection>, tokens: TokenService) -> Self {
        Self { collection, tokens }
    }

    /// Store an inactive agreement together with the token the peer will use
    /// to reach this app.
    pub async fn add(&self, app_id: DocId, body: NewDataSharing) -> Result<(AppDataSharing, Token)> {
        if self.find_by_name(app_id, &body.name).await?.is_some() {
            return Err(DbError::validation(
                "duplicate_data_sharing",
                format!("Data sharing {} already exists", body.name),
            ));
        }

        let sharing = AppDataSharing {
            id: DocId::new(),
            name: body.name,
            remote_app: body.remote_app,
            data_sharing: SharingPolicy::default(),
            app: Some(app_id),
            token: None,
            active: false,
        };
        let token = self
            .tokens
            .mint(
                NewToken::new(TokenType::DataSharing, AuthLevel::User).with_permissions(vec![Permission::wildcard()]),
                TokenLinks {
                    app: Some(app_id),
                    app_data_sharing: Some(sharing.id),
                    ..TokenLinks::default()
                },
            )
            .await?;

        let mut internals = Document::new();
        internals.insert("_tokenId".into(), token.id.to_value());
        let stored = match to_body(&sharing) {
            Ok(body) => self.collection.add(body, internals).await,
            Err(err) => Err(err),
        };
        let sharing = match stored.and_then(|mut docs| {
            docs.pop()
                .ok_or_else(|| DbError::Config("data sharing insert returned nothing".into()))
                .and_then(from_document::<AppDataSharing>)
        }) {
            Ok(sharing) => sharing,
            Err(err) => {
                self.tokens.compensate(&token, &err).await;
                return Err(err);
            }
        };
        info!(data_sharing = %sharing.id, name = %sharing.name, "Data sharing added");
        Ok((sharing, token))
    }

    /// Create an agreement and, when a token for the peer is known, run the
    /// activation handshake: the peer is handed our token and only a positive
    /// reply activates our side. A failed handshake leaves the agreement
    /// stored but inactive.
    pub async fn register(
        &self,
        app_id: DocId,
        body: NewDataSharing,
        connector: &dyn RemoteConnector,
        allow_unauthorized: bool,
    ) -> Result<AppDataSharing> {
        let (mut sharing, token) = self.add(app_id, body).await?;
        let (Some(endpoint), Some(api_path), Some(remote_token)) = (
            sharing.remote_app.endpoint.clone(),
            sharing.remote_app.api_path.clone(),
            sharing.remote_app.token.clone(),
        ) else {
            return Ok(sharing);
        };

        let target = RemoteTarget {
            endpoint,
            api_path,
            token: remote_token,
            allow_unauthorized,
        };
        let api = connector.init(&target).await?;
        if api.activate_data_sharing(&token.value).await? {
            self.activate(sharing.id, None).await?;
            sharing.active = true;
            info!(data_sharing = %sharing.id, "Peer acknowledged data sharing");
        } else {
            warn!(data_sharing = %sharing.id, "Peer declined data sharing activation");
        }
        Ok(sharing)
    }

    /// Flag an agreement active, optionally recording the token the peer
    /// handed over.
    pub async fn activate(&self, id: DocId, remote_token: Option<String>) -> Result<AppDataSharing> {
        let mut details = Document::new();
        details.insert("active".into(), Value::Bool(true));
        if let Some(token) = remote_token {
            details.insert("remoteApp.token".into(), Value::String(token));
        }
        let doc = self.collection.update(details, id).await?.ok_or_else(|| unknown(id))?;
        from_document(doc)
    }

    /// Replace the local or remote policy (a schema description list).
    pub async fn update_policy(&self, app_id: DocId, id: DocId, side: PolicySide, policy: &Value) -> Result<AppDataSharing> {
        let owned = self
            .collection
            .model()
            .parse_query(&json!({ "_appId": app_id.to_string() }), &Default::default())?;
        if !self.collection.exists(id, Some(&owned)).await? {
            return Err(unknown(id));
        }

        let encoded = encode(&decode_value(policy)?);
        let path = match side {
            PolicySide::Local => "dataSharing.localApp",
            PolicySide::Remote => "dataSharing.remoteApp",
        };
        let mut details = Document::new();
        details.insert(path.into(), Value::String(encoded));
        let doc = self.collection.update(details, id).await?.ok_or_else(|| unknown(id))?;
        from_document(doc)
    }

    pub async fn find_by_id(&self, id: DocId) -> Result<Option<AppDataSharing>> {
        self.collection.find_by_id(id).await?.map(from_document).transpose()
    }

    pub async fn find_by_name(&self, app_id: DocId, name: &str) -> Result<Option<AppDataSharing>> {
        let filter = self.collection.model().parse_query(
            &json!({ "_appId": app_id.to_string(), "name": name }),
            &Default::default(),
        )?;
        self.collection.find_one(&filter).await?.map(from_document).transpose()
    }

    pub async fn find_by_token(&self, token_id: DocId) -> Result<Option<AppDataSharing>> {
        let filter = self
            .collection
            .model()
            .parse_query(&json!({ "_tokenId": token_id.to_string() }), &Default::default())?;
        self.collection.find_one(&filter).await?.map(from_document).transpose()
    }

    pub async fn find_for_app(&self, app_id: DocId) -> Result<Vec<AppDataSharing>> {
        let filter = self
            .collection
            .model()
            .parse_query(&json!({ "_appId": app_id.to_string() }), &Default::default())?;
        self.collection
            .find(&filter, Default::default())
            .await?
            .collect()
            .await?
            .into_iter()
            .map(from_document)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::fixtures::fixture;
    use crate::federation::memory::MemoryPeer;

    fn body(token: Option<&str>) -> NewDataSharing {
        NewDataSharing {
            name: "partner".into(),
            remote_app: RemoteApp {
                endpoint: Some("http://peer.test".into()),
                api_path: Some("peer".into()),
                token: token.map(str::to_string),
            },
        }
    }

    #[tokio::test]
    async fn test_add_mints_data_sharing_token() {
        let fx = fixture();
        let app = DocId::new();
        let (sharing, token) = fx.entities.data_sharing.add(app, body(None)).await.unwrap();
        assert!(!sharing.active);
        assert_eq!(sharing.app, Some(app));
        assert_eq!(sharing.token, Some(token.id));
        assert_eq!(token.kind, TokenType::DataSharing);
        assert_eq!(token.app_data_sharing, Some(sharing.id));

        let by_token = fx.entities.data_sharing.find_by_token(token.id).await.unwrap().unwrap();
        assert_eq!(by_token.id, sharing.id);
        assert!(fx.entities.data_sharing.find_by_name(DocId::new(), "partner").await.unwrap().is_none());

        let err = fx.entities.data_sharing.add(app, body(None)).await.unwrap_err();
        assert_eq!(err.code(), "duplicate_data_sharing");
    }

    #[tokio::test]
    async fn test_register_activates_on_acknowledgement() {
        let fx = fixture();
        let app = DocId::new();
        let peer = MemoryPeer::new();
        let sharing = fx
            .entities
            .data_sharing
            .register(app, body(Some("peer-token")), &peer, false)
            .await
            .unwrap();
        assert!(sharing.active);

        let token = fx.entities.tokens.find_by_id(sharing.token.unwrap()).await.unwrap().unwrap();
        assert_eq!(*peer.activations.lock().unwrap(), vec![token.value]);
        assert_eq!(peer.targets.lock().unwrap()[0].token, "peer-token");
        assert!(fx.entities.data_sharing.find_by_id(sharing.id).await.unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn test_register_stays_inactive_when_peer_declines_or_fails() {
        let fx = fixture();
        let peer = MemoryPeer::new();
        peer.refuse_activation();
        let declined = fx
            .entities
            .data_sharing
            .register(DocId::new(), body(Some("t")), &peer, false)
            .await
            .unwrap();
        assert!(!declined.active);

        let unreachable = MemoryPeer::new();
        unreachable.fail_handshakes(1);
        let app = DocId::new();
        let err = fx
            .entities
            .data_sharing
            .register(app, body(Some("t")), &unreachable, false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "federation_error");
        let stored = fx.entities.data_sharing.find_by_name(app, "partner").await.unwrap().unwrap();
        assert!(!stored.active);
    }

    #[tokio::test]
    async fn test_activate_and_policy() {
        let fx = fixture();
        let app = DocId::new();
        let (sharing, _) = fx.entities.data_sharing.add(app, body(None)).await.unwrap();
        let active = fx
            .entities
            .data_sharing
            .activate(sharing.id, Some("from-peer".into()))
            .await
            .unwrap();
        assert!(active.active);
        assert_eq!(active.remote_app.token.as_deref(), Some("from-peer"));

        let policy = json!([{"name": "people", "properties": {"name": {"__type": "string"}}}]);
        let updated = fx
            .entities
            .data_sharing
            .update_policy(app, sharing.id, PolicySide::Remote, &policy)
            .await
            .unwrap();
        assert!(updated.data_sharing.remote_app.unwrap().contains("people"));
        assert!(updated.data_sharing.local_app.is_none());

        let err = fx
            .entities
            .data_sharing
            .update_policy(DocId::new(), sharing.id, PolicySide::Local, &policy)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unknown_data_sharing");
        assert_eq!(fx.entities.data_sharing.find_for_app(app).await.unwrap().len(), 1);
    }
}
