//! On-disk session layout (§4.1, §6):
//!
//! ```text
//! <base>/sessions/<sid>/
//!   session.json
//!   messages/<key>.json      # originals; written only for compressible messages
//!   turns/<agent>-<NNN>.json # agent ∈ {investigator, synthesizer, main}
//! ```

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;

use crate::context::Message;
use crate::error::StorageError;

/// Deterministic on-disk session store. Storage errors never corrupt
/// in-memory state — writes go to a temp file and get renamed into place.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn create_session(&self, session_id: &str) -> Result<(), StorageError>;

    /// Idempotent overwrite of `session.json`.
    async fn save_session(&self, session_id: &str, session: &Value) -> Result<(), StorageError>;

    async fn load_session(&self, session_id: &str) -> Result<Value, StorageError>;

    /// Writes the *original* content, called before compression. Returns
    /// the absolute path written.
    async fn save_message_content(
        &self,
        session_id: &str,
        message: &Message,
    ) -> Result<String, StorageError>;

    /// Returns the restored message with `compressed = false`.
    async fn load_message_content(
        &self,
        session_id: &str,
        key: &str,
    ) -> Result<Message, StorageError>;

    async fn save_turn(
        &self,
        session_id: &str,
        agent: &str,
        turn_number: u32,
        turn: &Value,
    ) -> Result<(), StorageError>;
}

/// Filesystem-backed `Storage` rooted at a configurable base directory.
pub struct FileStorage {
    base: std::path::PathBuf,
}

impl FileStorage {
    pub fn new(base: impl Into<std::path::PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn session_dir(&self, session_id: &str) -> std::path::PathBuf {
        self.base.join("sessions").join(session_id)
    }

    fn messages_dir(&self, session_id: &str) -> std::path::PathBuf {
        self.session_dir(session_id).join("messages")
    }

    fn turns_dir(&self, session_id: &str) -> std::path::PathBuf {
        self.session_dir(session_id).join("turns")
    }

    async fn write_json_atomic(path: &std::path::Path, value: &Value) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &body).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn create_session(&self, session_id: &str) -> Result<(), StorageError> {
        fs::create_dir_all(self.messages_dir(session_id)).await?;
        fs::create_dir_all(self.turns_dir(session_id)).await?;
        Ok(())
    }

    async fn save_session(&self, session_id: &str, session: &Value) -> Result<(), StorageError> {
        let path = self.session_dir(session_id).join("session.json");
        Self::write_json_atomic(&path, session).await
    }

    async fn load_session(&self, session_id: &str) -> Result<Value, StorageError> {
        let path = self.session_dir(session_id).join("session.json");
        let body = fs::read(&path)
            .await
            .map_err(|_| StorageError::SessionNotFound(session_id.to_string()))?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn save_message_content(
        &self,
        session_id: &str,
        message: &Message,
    ) -> Result<String, StorageError> {
        let path = self.messages_dir(session_id).join(format!("{}.json", message.key));
        let value = serde_json::to_value(message)?;
        Self::write_json_atomic(&path, &value).await?;
        Ok(path.to_string_lossy().into_owned())
    }

    async fn load_message_content(
        &self,
        session_id: &str,
        key: &str,
    ) -> Result<Message, StorageError> {
        let path = self.messages_dir(session_id).join(format!("{key}.json"));
        let body = fs::read(&path)
            .await
            .map_err(|_| StorageError::MessageNotFound(key.to_string()))?;
        let mut message: Message = serde_json::from_slice(&body)?;
        message.compressed = false;
        Ok(message)
    }

    async fn save_turn(
        &self,
        session_id: &str,
        agent: &str,
        turn_number: u32,
        turn: &Value,
    ) -> Result<(), StorageError> {
        let path = self
            .turns_dir(session_id)
            .join(format!("{agent}-{turn_number:03}.json"));
        Self::write_json_atomic(&path, turn).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(key: &str, content: &str) -> Message {
        Message {
            key: key.to_string(),
            role: crate::context::MessageRole::Assistant,
            content: content.to_string(),
            tokens: 10,
            compressed: false,
            original_tokens: None,
            timestamp: 0,
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn round_trips_session_and_message() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        storage.create_session("s1").await.unwrap();
        storage
            .save_session("s1", &json!({"id": "s1"}))
            .await
            .unwrap();

        let loaded = storage.load_session("s1").await.unwrap();
        assert_eq!(loaded["id"], "s1");

        let m = msg("msg_abcd1234", "hello world");
        let path = storage.save_message_content("s1", &m).await.unwrap();
        assert!(path.contains("msg_abcd1234.json"));

        let restored = storage.load_message_content("s1", "msg_abcd1234").await.unwrap();
        assert_eq!(restored.content, "hello world");
        assert!(!restored.compressed);
    }

    #[tokio::test]
    async fn turn_file_names_are_zero_padded() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        storage.create_session("s1").await.unwrap();
        storage
            .save_turn("s1", "investigator", 3, &json!({"iteration": 3}))
            .await
            .unwrap();

        let path = dir
            .path()
            .join("sessions/s1/turns/investigator-003.json");
        assert!(path.exists());
    }

    #[tokio::test]
    async fn missing_session_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let err = storage.load_session("nope").await.unwrap_err();
        assert!(matches!(err, StorageError::SessionNotFound(_)));
    }
}
