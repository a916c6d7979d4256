//! Typed views of the core entity documents.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::Document;
use crate::error::{DbError, Result};
use crate::ids::DocId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TokenType {
    App,
    User,
    DataSharing,
    Relationship,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AuthLevel {
    None = 0,
    User = 1,
    Admin = 2,
    Super = 3,
}

impl TryFrom<u8> for AuthLevel {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(AuthLevel::None),
            1 => Ok(AuthLevel::User),
            2 => Ok(AuthLevel::Admin),
            3 => Ok(AuthLevel::Super),
            other => Err(format!("invalid auth level {}", other)),
        }
    }
}

impl From<AuthLevel> for u8 {
    fn from(level: AuthLevel) -> Self {
        level as u8
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub route: String,
    pub permission: String,
}

impl Permission {
    pub fn wildcard() -> Self {
        Self {
            route: "*".into(),
            permission: "*".into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Token {
    #[serde(rename = "_id")]
    pub id: DocId,
    pub value: String,
    #[serde(rename = "type")]
    pub kind: TokenType,
    #[serde(rename = "authLevel")]
    pub auth_level: AuthLevel,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(rename = "_app", default)]
    pub app: Option<DocId>,
    #[serde(rename = "_user", default)]
    pub user: Option<String>,
    #[serde(rename = "_appDataSharingId", default)]
    pub app_data_sharing: Option<DocId>,
    #[serde(rename = "_relationshipId", default)]
    pub relationship: Option<DocId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct App {
    #[serde(rename = "_id")]
    pub id: DocId,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(rename = "apiPath")]
    pub api_path: String,
    #[serde(rename = "_token", default)]
    pub token: Option<DocId>,
    /// Encoded schema description list.
    #[serde(rename = "__schema", default = "empty_schema")]
    pub schema: String,
    #[serde(rename = "__roles", default)]
    pub roles: Value,
}

fn empty_schema() -> String {
    "[]".into()
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteApp {
    pub endpoint: Option<String>,
    #[serde(rename = "apiPath")]
    pub api_path: Option<String>,
    pub token: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SharingPolicy {
    #[serde(rename = "localApp")]
    pub local_app: Option<String>,
    #[serde(rename = "remoteApp")]
    pub remote_app: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppDataSharing {
    #[serde(rename = "_id")]
    pub id: DocId,
    pub name: String,
    #[serde(rename = "remoteApp", default)]
    pub remote_app: RemoteApp,
    #[serde(rename = "dataSharing", default)]
    pub data_sharing: SharingPolicy,
    #[serde(rename = "_appId", default)]
    pub app: Option<DocId>,
    #[serde(rename = "_tokenId", default)]
    pub token: Option<DocId>,
    #[serde(default)]
    pub active: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationshipType {
    Source,
    Destination,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationshipSide {
    #[serde(rename = "appId", default)]
    pub app_id: Option<DocId>,
    pub endpoint: Option<String>,
    #[serde(rename = "apiPath", default)]
    pub api_path: Option<String>,
    #[serde(default)]
    pub policy: Option<String>,
    #[serde(rename = "sourceToken", default, skip_serializing_if = "Option::is_none")]
    pub source_token: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppRelationship {
    #[serde(rename = "_id")]
    pub id: DocId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RelationshipType,
    #[serde(default)]
    pub source: RelationshipSide,
    #[serde(default)]
    pub destination: RelationshipSide,
    #[serde(rename = "_tokenId", default)]
    pub token: Option<DocId>,
}

/// Read a stored document into one of the records above.
pub fn from_document<T: serde::de::DeserializeOwned>(doc: Document) -> Result<T> {
    serde_json::from_value(Value::Object(doc)).map_err(DbError::from)
}

/// Serialise a record into a document body.
pub fn to_body<T: Serialize>(record: &T) -> Result<Value> {
    Ok(serde_json::to_value(record)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_token_document_shape() {
        let id = DocId::new();
        let app = DocId::new();
        let doc = json!({
            "_id": id.to_string(),
            "value": "abc",
            "type": "dataSharing",
            "authLevel": 1,
            "permissions": [{"route": "*", "permission": "*"}],
            "role": null,
            "_app": app.to_string(),
            "_user": null,
            "_appDataSharingId": null,
            "_relationshipId": null
        });
        let token: Token = from_document(doc.as_object().cloned().unwrap()).unwrap();
        assert_eq!(token.kind, TokenType::DataSharing);
        assert_eq!(token.auth_level, AuthLevel::User);
        assert_eq!(token.app, Some(app));
        assert_eq!(token.permissions, vec![Permission::wildcard()]);
        assert_eq!(to_body(&token).unwrap(), doc);

        assert!(serde_json::from_value::<AuthLevel>(json!(7)).is_err());
        assert!(AuthLevel::Super > AuthLevel::Admin);
    }
}
