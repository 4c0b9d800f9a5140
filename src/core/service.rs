//! Conversation orchestration
//!
//! The ChatService owns the process-local current-conversation pointer and
//! is the only writer to the store. It:
//! 1. Resolves (or creates) the current conversation
//! 2. Appends user turns and persists them before calling the provider
//! 3. Sends the full ordered history to the completion provider
//! 4. Persists the assistant reply and bumps the conversation timestamp
//! 5. Triggers best-effort title generation on the first user turn
//! 6. Emits change events so reactive readers re-query

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

use crate::conversation::{Conversation, Message, Role};
use crate::providers::{CompletionProvider, ProviderError};

use super::store::ChatStore;

/// Synthetic primer stored at position 0 of every conversation. It seeds
/// provider context and is never shown to the user.
const PRIMER_PROMPT: &str =
    "You are a helpful, friendly assistant. Answer clearly and concisely.";

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Emitted after every store write so reactive readers know what to reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// The conversation list changed (create, delete, retitle, timestamp bump).
    Conversations,
    /// Messages changed for the given conversation.
    Messages(String),
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Message must not be empty")]
    EmptyInput,

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Conversation not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

pub struct ChatService {
    store: ChatStore,
    provider: Arc<dyn CompletionProvider>,
    current: Mutex<Option<String>>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl ChatService {
    pub fn new(store: ChatStore, provider: Arc<dyn CompletionProvider>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            store,
            provider,
            current: Mutex::new(None),
            changes,
        }
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    /// Resolve the current conversation id. Returns the cached pointer if
    /// set; otherwise the most recently updated conversation, or a freshly
    /// created one if none exist. Idempotent until the current conversation
    /// is deleted.
    pub async fn current_conversation_id(&self) -> Result<String, ChatError> {
        let mut current = self.current.lock().await;
        if let Some(id) = current.as_ref() {
            return Ok(id.clone());
        }

        let conversations = self.store.all_conversations().await?;
        let id = match conversations.into_iter().next() {
            Some(conversation) => conversation.id,
            None => self.create_unselected("").await?,
        };

        *current = Some(id.clone());
        Ok(id)
    }

    /// Create a conversation, seed its primer message, and make it current.
    pub async fn create_conversation(&self, title: &str) -> Result<String, ChatError> {
        let id = self.create_unselected(title).await?;
        *self.current.lock().await = Some(id.clone());
        Ok(id)
    }

    async fn create_unselected(&self, title: &str) -> Result<String, ChatError> {
        let conversation = Conversation::new(title);
        self.store.insert_conversation(&conversation).await?;
        self.append_message(&conversation.id, Role::System, PRIMER_PROMPT)
            .await?;
        self.emit(ChangeEvent::Conversations);

        tracing::info!(conversation_id = %conversation.id, "created conversation");
        Ok(conversation.id)
    }

    /// Send a user message in the current conversation and return the
    /// assistant's reply. A provider failure does not roll back the already
    /// persisted user turn.
    pub async fn send_message(&self, content: &str) -> Result<Message, ChatError> {
        if content.trim().is_empty() {
            return Err(ChatError::EmptyInput);
        }

        let conversation_id = self.current_conversation_id().await?;
        if self
            .store
            .conversation_by_id(&conversation_id)
            .await?
            .is_none()
        {
            return Err(ChatError::NotFound(conversation_id));
        }

        // Decided before the user turn is inserted: count 1 means only the
        // primer exists, so this is the first user message.
        let is_first_user_turn = self.store.message_count(&conversation_id).await? <= 1;

        self.append_message(&conversation_id, Role::User, content)
            .await?;

        let history = self.store.messages_for(&conversation_id).await?;
        let reply = self.provider.complete(&history).await?;

        let assistant = self
            .append_message(&conversation_id, Role::Assistant, &reply)
            .await?;
        self.store
            .touch_conversation(&conversation_id, Utc::now())
            .await?;
        self.emit(ChangeEvent::Conversations);

        if is_first_user_turn {
            self.spawn_title_generation(conversation_id, content.to_string());
        }

        Ok(assistant)
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
    ) -> Result<Message, ChatError> {
        let position = self.store.message_count(conversation_id).await?;
        let message = Message::new(role, conversation_id, content, position);
        self.store.insert_message(&message).await?;
        self.emit(ChangeEvent::Messages(conversation_id.to_string()));
        Ok(message)
    }

    /// Messages visible to the presentation layer: ordered by position, with
    /// the synthetic system primer filtered out.
    pub async fn messages_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Message>, ChatError> {
        let messages = self.store.messages_for(conversation_id).await?;
        Ok(messages
            .into_iter()
            .filter(|message| message.role != Role::System)
            .collect())
    }

    pub async fn all_conversations(&self) -> Result<Vec<Conversation>, ChatError> {
        Ok(self.store.all_conversations().await?)
    }

    /// Switch the current pointer. Validated lazily: a nonexistent id makes
    /// the next `send_message` fail with `NotFound` instead of being checked
    /// here.
    pub async fn select_conversation(&self, conversation_id: &str) {
        *self.current.lock().await = Some(conversation_id.to_string());
    }

    /// Delete a conversation and its messages. Clears the current pointer
    /// when it referenced the deleted conversation.
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<(), ChatError> {
        self.store.delete_conversation(conversation_id).await?;

        let mut current = self.current.lock().await;
        if current.as_deref() == Some(conversation_id) {
            *current = None;
        }
        drop(current);

        self.emit(ChangeEvent::Conversations);
        tracing::info!(%conversation_id, "deleted conversation");
        Ok(())
    }

    /// No-op when the conversation no longer exists: the read-modify-write
    /// race against a concurrent delete is lost silently.
    pub async fn update_conversation_title(
        &self,
        conversation_id: &str,
        title: &str,
    ) -> Result<(), ChatError> {
        persist_title(&self.store, &self.changes, conversation_id, title).await?;
        Ok(())
    }

    fn spawn_title_generation(&self, conversation_id: String, first_message: String) {
        let store = self.store.clone();
        let provider = Arc::clone(&self.provider);
        let changes = self.changes.clone();

        tokio::spawn(async move {
            generate_title(store, provider, changes, conversation_id, first_message).await;
        });
    }

    fn emit(&self, event: ChangeEvent) {
        // Nobody listening is fine; readers subscribe when they care.
        let _ = self.changes.send(event);
    }
}

/// Best-effort title generation. Provider failures fall back to the raw
/// first message so a conversation is never left title-less; nothing here
/// is ever surfaced to the send path.
async fn generate_title(
    store: ChatStore,
    provider: Arc<dyn CompletionProvider>,
    changes: broadcast::Sender<ChangeEvent>,
    conversation_id: String,
    first_message: String,
) {
    let title = match provider.synthesize_title(&first_message).await {
        Ok(title) => title.trim().to_string(),
        Err(err) => {
            tracing::warn!(%conversation_id, error = %err, "title synthesis failed, using first message");
            first_message
        }
    };

    if let Err(err) = persist_title(&store, &changes, &conversation_id, &title).await {
        tracing::warn!(%conversation_id, error = %err, "failed to persist conversation title");
    }
}

async fn persist_title(
    store: &ChatStore,
    changes: &broadcast::Sender<ChangeEvent>,
    conversation_id: &str,
    title: &str,
) -> Result<(), sqlx::Error> {
    match store.conversation_by_id(conversation_id).await? {
        Some(mut conversation) => {
            conversation.title = title.to_string();
            store.update_conversation(&conversation).await?;
            let _ = changes.send(ChangeEvent::Conversations);
        }
        None => {
            tracing::debug!(%conversation_id, "conversation vanished before title update, dropping");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::MockProvider;
    use std::time::Duration;

    async fn service_with(provider: MockProvider) -> (ChatService, Arc<MockProvider>) {
        let provider = Arc::new(provider);
        let store = ChatStore::in_memory().await.unwrap();
        let service = ChatService::new(store, provider.clone());
        (service, provider)
    }

    /// Titles are persisted from a spawned task; poll until it lands.
    async fn wait_for_title(service: &ChatService, conversation_id: &str) -> String {
        for _ in 0..100 {
            let conversations = service.all_conversations().await.unwrap();
            if let Some(c) = conversations.iter().find(|c| c.id == conversation_id) {
                if !c.title.is_empty() {
                    return c.title.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("title was never generated for {conversation_id}");
    }

    #[tokio::test]
    async fn test_blank_send_fails_without_writes() {
        let (service, provider) = service_with(MockProvider::new()).await;

        assert!(matches!(
            service.send_message("").await,
            Err(ChatError::EmptyInput)
        ));
        assert!(matches!(
            service.send_message("   ").await,
            Err(ChatError::EmptyInput)
        ));

        // Rejected before any side effect, so not even a conversation exists
        assert!(service.all_conversations().await.unwrap().is_empty());
        assert_eq!(provider.complete_calls(), 0);
    }

    #[tokio::test]
    async fn test_create_conversation_seeds_primer() {
        let (service, _provider) = service_with(MockProvider::new()).await;

        let id = service.create_conversation("").await.unwrap();

        assert_eq!(service.store.message_count(&id).await.unwrap(), 1);
        // The primer is invisible to the presentation layer
        assert!(service
            .messages_for_conversation(&id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_send_appends_user_and_assistant_turns() {
        let provider = MockProvider::new().with_reply("Hi there");
        let (service, _provider) = service_with(provider).await;

        let id = service.create_conversation("").await.unwrap();
        let assistant = service.send_message("Hello").await.unwrap();

        assert_eq!(assistant.content, "Hi there");
        assert_eq!(assistant.role, Role::Assistant);

        let stored = service.store.messages_for(&id).await.unwrap();
        let positions: Vec<i64> = stored.iter().map(|m| m.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);

        let visible = service.messages_for_conversation(&id).await.unwrap();
        assert_eq!(visible.len(), 2);
        assert_eq!(visible[0].role, Role::User);
        assert_eq!(visible[0].content, "Hello");
        assert_eq!(visible[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_provider_failure_keeps_user_turn() {
        let provider = MockProvider::new().with_failing_reply("connection reset");
        let (service, _provider) = service_with(provider).await;

        let id = service.create_conversation("").await.unwrap();
        let result = service.send_message("Hello").await;

        assert!(matches!(result, Err(ChatError::Provider(_))));

        // The user's turn survives the failed completion
        let visible = service.messages_for_conversation(&id).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].content, "Hello");
    }

    #[tokio::test]
    async fn test_first_send_synthesizes_title() {
        let provider = MockProvider::new().with_title("Greetings");
        let (service, _provider) = service_with(provider).await;

        let id = service.create_conversation("").await.unwrap();
        service.send_message("Hello").await.unwrap();

        assert_eq!(wait_for_title(&service, &id).await, "Greetings");
    }

    #[tokio::test]
    async fn test_title_falls_back_to_first_message() {
        let provider = MockProvider::new().with_failing_title("quota exceeded");
        let (service, _provider) = service_with(provider).await;

        let id = service.create_conversation("").await.unwrap();
        service.send_message("Hello").await.unwrap();

        assert_eq!(wait_for_title(&service, &id).await, "Hello");
    }

    #[tokio::test]
    async fn test_title_generated_exactly_once() {
        let (service, provider) = service_with(MockProvider::new()).await;

        let id = service.create_conversation("").await.unwrap();
        service.send_message("first").await.unwrap();
        wait_for_title(&service, &id).await;
        service.send_message("second").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(provider.title_calls(), 1);
        let conversations = service.all_conversations().await.unwrap();
        assert_eq!(conversations[0].title, "Mock title");
    }

    #[tokio::test]
    async fn test_title_update_noop_when_conversation_deleted() {
        let (service, _provider) = service_with(MockProvider::new()).await;

        let id = service.create_conversation("").await.unwrap();
        service.delete_conversation(&id).await.unwrap();

        // Lost the read-modify-write race: silent no-op, not an error
        service
            .update_conversation_title(&id, "too late")
            .await
            .unwrap();
        assert!(service.all_conversations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_current_conversation_id_idempotent() {
        let (service, _provider) = service_with(MockProvider::new()).await;

        let first = service.current_conversation_id().await.unwrap();
        let second = service.current_conversation_id().await.unwrap();
        assert_eq!(first, second);

        // Only one conversation was auto-created
        assert_eq!(service.all_conversations().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_current_reresolves_to_remaining() {
        let provider = MockProvider::new();
        let (service, _provider) = service_with(provider).await;

        let a = service.create_conversation("a").await.unwrap();
        service.send_message("bump a").await.unwrap();
        let b = service.create_conversation("b").await.unwrap();

        service.delete_conversation(&b).await.unwrap();

        let current = service.current_conversation_id().await.unwrap();
        assert_ne!(current, b);
        assert_eq!(current, a);
    }

    #[tokio::test]
    async fn test_delete_last_conversation_creates_fresh_one() {
        let (service, _provider) = service_with(MockProvider::new()).await;

        let id = service.create_conversation("").await.unwrap();
        service.delete_conversation(&id).await.unwrap();

        let current = service.current_conversation_id().await.unwrap();
        assert_ne!(current, id);
        assert_eq!(service.store.message_count(&current).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_send_to_selected_nonexistent_conversation_fails() {
        let (service, _provider) = service_with(MockProvider::new()).await;

        // Selection is validated lazily
        service.select_conversation("no-such-id").await;

        let result = service.send_message("hello").await;
        assert!(matches!(result, Err(ChatError::NotFound(id)) if id == "no-such-id"));
    }

    #[tokio::test]
    async fn test_send_emits_change_events() {
        let provider = MockProvider::new().with_reply("ack");
        let (service, _provider) = service_with(provider).await;

        let id = service.create_conversation("").await.unwrap();
        let mut changes = service.subscribe_changes();
        service.send_message("hello").await.unwrap();

        let mut message_events = 0;
        let mut conversation_events = 0;
        while let Ok(event) = changes.try_recv() {
            match event {
                ChangeEvent::Messages(conversation_id) => {
                    assert_eq!(conversation_id, id);
                    message_events += 1;
                }
                ChangeEvent::Conversations => conversation_events += 1,
            }
        }
        // One event per appended turn, one for the timestamp bump
        assert_eq!(message_events, 2);
        assert!(conversation_events >= 1);
    }
}
