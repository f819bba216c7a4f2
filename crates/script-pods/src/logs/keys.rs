//! Per-script log encryption keys
//!
//! A key is generated once when the script pod is prepared, kept in memory and
//! persisted base64-encoded to the script's workspace so the agent can still
//! read the pod's logs after a restart.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::logs::cipher::{generate_key, LogCipher, KEY_LENGTH};
use crate::ticket::ScriptTicket;
use crate::workspace::ScriptWorkspaceFactory;

const KEY_FILE: &str = "keyfile";

#[derive(Debug)]
pub struct EncryptionKeyProvider {
    workspaces: Arc<ScriptWorkspaceFactory>,
    keys: DashMap<ScriptTicket, [u8; KEY_LENGTH]>,
}

impl EncryptionKeyProvider {
    #[must_use]
    pub fn new(workspaces: Arc<ScriptWorkspaceFactory>) -> Self {
        Self {
            workspaces,
            keys: DashMap::new(),
        }
    }

    /// Create and persist the key for a new script.
    ///
    /// Fails when the script already has a key.
    pub async fn generate_and_write(&self, ticket: &ScriptTicket) -> Result<[u8; KEY_LENGTH]> {
        let workspace = self.workspaces.workspace(ticket);
        if self.keys.contains_key(ticket) || workspace.try_read_file(KEY_FILE).await?.is_some() {
            return Err(Error::EncryptionKey(format!(
                "an encryption key already exists for script {ticket}"
            )));
        }

        let key = generate_key();
        workspace.write_file(KEY_FILE, &BASE64.encode(key)).await?;
        self.keys.insert(ticket.clone(), key);

        info!(ticket = %ticket, "Generated pod log encryption key");
        Ok(key)
    }

    pub async fn get_key(&self, ticket: &ScriptTicket) -> Result<[u8; KEY_LENGTH]> {
        if let Some(key) = self.keys.get(ticket) {
            return Ok(*key);
        }

        let encoded = self
            .workspaces
            .workspace(ticket)
            .try_read_file(KEY_FILE)
            .await
            .map_err(|e| Error::EncryptionKey(format!("failed to read key file: {e}")))?
            .ok_or_else(|| Error::EncryptionKey(format!("no key file for script {ticket}")))?;

        let encoded = encoded.trim();
        if encoded.is_empty() {
            return Err(Error::EncryptionKey(format!(
                "key file for script {ticket} is empty"
            )));
        }

        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| Error::EncryptionKey(format!("key file is not base64: {e}")))?;
        let key: [u8; KEY_LENGTH] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            Error::EncryptionKey(format!(
                "key file holds {} bytes, expected {KEY_LENGTH}",
                bytes.len()
            ))
        })?;

        debug!(ticket = %ticket, "Loaded pod log encryption key from workspace");
        self.keys.insert(ticket.clone(), key);
        Ok(key)
    }

    pub async fn cipher(&self, ticket: &ScriptTicket) -> Result<LogCipher> {
        LogCipher::new(&self.get_key(ticket).await?)
    }

    pub async fn delete(&self, ticket: &ScriptTicket) -> Result<()> {
        self.keys.remove(ticket);
        self.workspaces
            .workspace(ticket)
            .delete_file(KEY_FILE)
            .await
    }
}
