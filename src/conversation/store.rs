//! Directory-backed storage for saved conversations
//!
//! Each conversation lives in `<base_dir>/<id>.json`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::history::{Conversation, ConversationError};
use super::message::Role;

/// Storage manager for persisted conversations
pub struct ConversationStore {
    /// Base directory for conversation files
    base_dir: PathBuf,
}

impl ConversationStore {
    /// Create a new store, creating the directory if needed
    pub fn new(base_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Save a conversation under its id
    pub async fn save(&self, conversation: &Conversation) -> Result<PathBuf, ConversationError> {
        let path = self.conversation_path(&conversation.id);
        conversation.save(&path).await?;
        Ok(path)
    }

    /// Load a conversation by id
    pub async fn load(&self, id: &str) -> Result<Conversation, ConversationError> {
        Conversation::load(self.conversation_path(id)).await
    }

    /// List stored conversations, newest first.
    ///
    /// Files that fail to parse are skipped.
    pub async fn list(&self) -> Result<Vec<ConversationSummary>, ConversationError> {
        let mut summaries = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                match Conversation::load(&path).await {
                    Ok(conversation) => summaries.push(ConversationSummary::from(&conversation)),
                    Err(e) => {
                        tracing::debug!(path = %path.display(), error = %e, "Skipping unreadable conversation")
                    }
                }
            }
        }
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    /// Delete a stored conversation
    pub async fn delete(&self, id: &str) -> Result<(), ConversationError> {
        tokio::fs::remove_file(self.conversation_path(id)).await?;
        Ok(())
    }

    fn conversation_path(&self, id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", id))
    }
}

/// Summary of a stored conversation for listing
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub id: String,
    /// First user message, shortened
    pub preview: String,
    pub messages: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Conversation> for ConversationSummary {
    fn from(conversation: &Conversation) -> Self {
        let preview = conversation
            .messages()
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| truncate(&m.content, 50))
            .unwrap_or_default();
        Self {
            id: conversation.id.clone(),
            preview,
            messages: conversation.len(),
            created_at: conversation.created_at,
            updated_at: conversation.updated_at,
        }
    }
}

/// Truncate a string to at most `max_chars` characters, adding an ellipsis
fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Message;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
        assert_eq!(truncate("ééééééééééééé", 5), "éé...");
    }

    #[tokio::test]
    async fn test_store_save_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path().join("convs")).unwrap();

        let mut conv = Conversation::new();
        conv.push(Message::user("Find prime numbers below 100")).unwrap();
        store.save(&conv).await.unwrap();

        let loaded = store.load(&conv.id).await.unwrap();
        assert_eq!(loaded, conv);

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].messages, 1);
        assert!(listed[0].preview.starts_with("Find prime"));

        store.delete(&conv.id).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }
}
