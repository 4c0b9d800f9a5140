//! Presentation state projection
//!
//! Combines the live message stream for the current conversation, the
//! conversation list, and transient loading/error flags into one immutable
//! `ChatState` snapshot published through a watch channel. The presentation
//! layer only reads snapshots and issues the commands defined here.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, watch};

use crate::conversation::{Message, DEFAULT_TITLE};

use super::service::{ChangeEvent, ChatError, ChatService};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationItem {
    pub id: String,
    pub title: String,
}

/// Immutable snapshot handed to the presentation layer on every change.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChatState {
    pub messages: Vec<Message>,
    pub conversations: Vec<ConversationItem>,
    pub current_conversation_id: Option<String>,
    pub is_loading: bool,
    pub error: Option<String>,
}

pub struct StateProjector {
    service: Arc<ChatService>,
    state: watch::Sender<ChatState>,
}

impl StateProjector {
    /// Resolve the initial conversation (creating one on a cold start),
    /// publish the first snapshot, and start reacting to change events.
    pub async fn new(service: Arc<ChatService>) -> Result<Arc<Self>, ChatError> {
        // Subscribe before the initial load so no write goes unobserved.
        let changes = service.subscribe_changes();

        let current_id = service.current_conversation_id().await?;
        let messages = service.messages_for_conversation(&current_id).await?;
        let conversations = conversation_items(&service).await?;

        let (state, _) = watch::channel(ChatState {
            messages,
            conversations,
            current_conversation_id: Some(current_id),
            is_loading: false,
            error: None,
        });

        let projector = Arc::new(Self { service, state });
        projector.clone().spawn_change_listener(changes);
        Ok(projector)
    }

    /// Subscribe to state snapshots.
    pub fn subscribe(&self) -> watch::Receiver<ChatState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> ChatState {
        self.state.borrow().clone()
    }

    /// Send a user message. Loading and error flags are owned here, never by
    /// the service; the send itself runs against the conversation that is
    /// current when the command is issued.
    pub async fn send_message(&self, content: &str) {
        if content.trim().is_empty() {
            return;
        }

        self.state.send_modify(|state| {
            state.is_loading = true;
            state.error = None;
        });

        match self.service.send_message(content).await {
            Ok(_) => {
                self.state.send_modify(|state| state.is_loading = false);
            }
            Err(err) => {
                tracing::warn!(error = %err, "send failed");
                self.state.send_modify(|state| {
                    state.is_loading = false;
                    state.error = Some(format!("Error: {err}"));
                });
            }
        }
    }

    pub async fn create_conversation(&self) {
        match self.service.create_conversation(DEFAULT_TITLE).await {
            Ok(id) => self.activate_conversation(id).await,
            Err(err) => {
                tracing::warn!(error = %err, "failed to create conversation");
                self.state
                    .send_modify(|state| state.error = Some(format!("Error: {err}")));
            }
        }
    }

    pub async fn select_conversation(&self, conversation_id: &str) {
        self.service.select_conversation(conversation_id).await;
        self.activate_conversation(conversation_id.to_string()).await;
    }

    /// Delete a conversation. When it was the current one, the pointer
    /// re-resolves (possibly to a freshly created conversation) and the
    /// snapshot switches to it.
    pub async fn delete_conversation(&self, conversation_id: &str) {
        let was_current =
            self.state.borrow().current_conversation_id.as_deref() == Some(conversation_id);

        if let Err(err) = self.service.delete_conversation(conversation_id).await {
            tracing::warn!(%conversation_id, error = %err, "failed to delete conversation");
            self.state
                .send_modify(|state| state.error = Some(format!("Error: {err}")));
            return;
        }

        if was_current {
            match self.service.current_conversation_id().await {
                Ok(next) => self.activate_conversation(next).await,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to re-resolve current conversation");
                    self.state
                        .send_modify(|state| state.error = Some(format!("Error: {err}")));
                }
            }
        }
    }

    /// Clear the displayed error after the presentation layer has shown it.
    pub fn dismiss_error(&self) {
        self.state.send_modify(|state| state.error = None);
    }

    async fn activate_conversation(&self, conversation_id: String) {
        let messages = match self.service.messages_for_conversation(&conversation_id).await {
            Ok(messages) => messages,
            Err(err) => {
                tracing::warn!(%conversation_id, error = %err, "failed to load messages");
                Vec::new()
            }
        };

        self.state.send_modify(|state| {
            state.current_conversation_id = Some(conversation_id);
            state.messages = messages;
        });
    }

    fn spawn_change_listener(self: Arc<Self>, mut changes: broadcast::Receiver<ChangeEvent>) {
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(event) => self.apply_change(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "change stream lagged, reloading everything");
                        self.refresh_all().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn apply_change(&self, event: ChangeEvent) {
        match event {
            ChangeEvent::Conversations => self.refresh_conversations().await,
            ChangeEvent::Messages(conversation_id) => {
                // Latest wins: a late write against a conversation that is no
                // longer current must not touch the visible message list.
                let is_current = self.state.borrow().current_conversation_id.as_deref()
                    == Some(conversation_id.as_str());
                if is_current {
                    self.refresh_messages(&conversation_id).await;
                }
            }
        }
    }

    async fn refresh_conversations(&self) {
        match conversation_items(&self.service).await {
            Ok(conversations) => {
                self.state
                    .send_modify(|state| state.conversations = conversations);
            }
            Err(err) => tracing::warn!(error = %err, "failed to refresh conversation list"),
        }
    }

    async fn refresh_messages(&self, conversation_id: &str) {
        match self.service.messages_for_conversation(conversation_id).await {
            Ok(messages) => {
                self.state.send_modify(|state| {
                    // Re-check under the same snapshot: the current pointer
                    // may have moved while we were querying.
                    if state.current_conversation_id.as_deref() == Some(conversation_id) {
                        state.messages = messages;
                    }
                });
            }
            Err(err) => {
                tracing::warn!(%conversation_id, error = %err, "failed to refresh messages")
            }
        }
    }

    async fn refresh_all(&self) {
        self.refresh_conversations().await;
        let current = self.state.borrow().current_conversation_id.clone();
        if let Some(conversation_id) = current {
            self.refresh_messages(&conversation_id).await;
        }
    }
}

async fn conversation_items(service: &ChatService) -> Result<Vec<ConversationItem>, ChatError> {
    Ok(service
        .all_conversations()
        .await?
        .into_iter()
        .map(|conversation| ConversationItem {
            id: conversation.id,
            title: conversation.title,
        })
        .collect())
}
