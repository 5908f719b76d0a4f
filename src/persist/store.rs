//! The document-store seam. The gateway only depends on these capabilities;
//! concrete backends (Firestore-like stores, SQL, …) are wired in at
//! composition time. An in-memory implementation backs tests and local runs.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::GatewayError;

/// A user's static public encryption key: a P-256 JWK plus version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPublicKey {
    pub public_jwk: String,
    pub version: i64,
}

/// Logical document paths.
pub fn chat_path(user_id: &str, chat_id: &str) -> String {
    format!("users/{user_id}/chats/{chat_id}")
}

pub fn message_path(user_id: &str, chat_id: &str, message_id: &str) -> String {
    format!("users/{user_id}/chats/{chat_id}/messages/{message_id}")
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// The `accountKey` field of `users/{user}`, if provisioned.
    async fn get_account_key(
        &self,
        user_id: &str,
    ) -> Result<Option<UserPublicKey>, GatewayError>;

    /// The chat's `lastResponseId`, if a background turn recorded one.
    async fn get_chat_last_response_id(
        &self,
        user_id: &str,
        chat_id: &str,
    ) -> Result<Option<String>, GatewayError>;

    /// Create-or-overwrite the message document. Overwrite is required: a
    /// tool-call continuation rewrites the same message id.
    async fn set_message(
        &self,
        user_id: &str,
        chat_id: &str,
        message_id: &str,
        doc: Value,
    ) -> Result<(), GatewayError>;

    /// Merge fields into an existing message document. `NotFound` when the
    /// message was never written.
    async fn update_message(
        &self,
        user_id: &str,
        chat_id: &str,
        message_id: &str,
        fields: Value,
    ) -> Result<(), GatewayError>;

    /// Merge fields into an existing chat document — never creates one; the
    /// client owns chat creation. `NotFound` when the chat doesn't exist.
    async fn update_chat(
        &self,
        user_id: &str,
        chat_id: &str,
        fields: Value,
    ) -> Result<(), GatewayError>;
}

/// In-memory document store keyed by logical path.
#[derive(Default)]
pub struct MemoryDocumentStore {
    docs: RwLock<HashMap<String, Value>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document at a logical path (tests and local runs).
    pub async fn put(&self, path: impl Into<String>, doc: Value) {
        self.docs.write().await.insert(path.into(), doc);
    }

    pub async fn get(&self, path: &str) -> Option<Value> {
        self.docs.read().await.get(path).cloned()
    }

    async fn merge(&self, path: &str, fields: Value) -> Result<(), GatewayError> {
        let mut docs = self.docs.write().await;
        let Some(doc) = docs.get_mut(path) else {
            return Err(GatewayError::NotFound(path.to_string()));
        };
        if let (Some(doc), Some(fields)) = (doc.as_object_mut(), fields.as_object()) {
            for (k, v) in fields {
                doc.insert(k.clone(), v.clone());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get_account_key(
        &self,
        user_id: &str,
    ) -> Result<Option<UserPublicKey>, GatewayError> {
        let docs = self.docs.read().await;
        let Some(user) = docs.get(&format!("users/{user_id}")) else {
            return Ok(None);
        };
        let Some(account_key) = user.get("accountKey") else {
            return Ok(None);
        };
        let Some(public_jwk) = account_key.get("public").and_then(Value::as_str) else {
            return Ok(None);
        };
        Ok(Some(UserPublicKey {
            public_jwk: public_jwk.to_string(),
            version: account_key
                .get("version")
                .and_then(Value::as_i64)
                .unwrap_or(1),
        }))
    }

    async fn get_chat_last_response_id(
        &self,
        user_id: &str,
        chat_id: &str,
    ) -> Result<Option<String>, GatewayError> {
        let docs = self.docs.read().await;
        Ok(docs
            .get(&chat_path(user_id, chat_id))
            .and_then(|c| c.get("lastResponseId"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn set_message(
        &self,
        user_id: &str,
        chat_id: &str,
        message_id: &str,
        doc: Value,
    ) -> Result<(), GatewayError> {
        self.docs
            .write()
            .await
            .insert(message_path(user_id, chat_id, message_id), doc);
        Ok(())
    }

    async fn update_message(
        &self,
        user_id: &str,
        chat_id: &str,
        message_id: &str,
        fields: Value,
    ) -> Result<(), GatewayError> {
        self.merge(&message_path(user_id, chat_id, message_id), fields)
            .await
    }

    async fn update_chat(
        &self,
        user_id: &str,
        chat_id: &str,
        fields: Value,
    ) -> Result<(), GatewayError> {
        self.merge(&chat_path(user_id, chat_id), fields).await
    }
}
