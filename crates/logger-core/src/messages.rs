//! User-facing messages
//!
//! Failures and notices the collaborator layer should surface. Messages
//! wait in the inbox until read; reading moves them to the archive.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::state::{Delivery, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Level {
    Debug = 100,
    Info = 200,
    Success = 250,
    Warning = 300,
    Error = 400,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message: String,
    pub level: Level,
    /// Entry the message is about
    pub target: Option<i64>,
    /// Rendered error, for error-level messages
    pub error: Option<String>,
    /// What the user can do about it
    #[serde(default)]
    pub suggestion: Option<String>,
}

impl Message {
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level,
            target: None,
            error: None,
            suggestion: None,
        }
    }

    pub fn debug(message: impl Into<String>) -> Self {
        Self::new(Level::Debug, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Level::Info, message)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(Level::Success, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Level::Warning, message)
    }

    /// An error-level message whose text is the error's display
    pub fn error(error: &dyn std::error::Error) -> Self {
        let rendered = error.to_string();
        Self {
            message: rendered.clone(),
            level: Level::Error,
            target: None,
            error: Some(rendered),
            suggestion: None,
        }
    }

    pub fn with_target(mut self, id: i64) -> Self {
        self.target = Some(id);
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.level, self.message)
    }
}

#[derive(Default)]
pub struct Messages {
    inbox: Vec<Message>,
    archive: Vec<Message>,
    subscription: Subscription<Vec<Message>>,
}

impl Messages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message; with subscribers present it is delivered right away
    pub fn insert(&mut self, message: Message) {
        if let Some((delivery, unread)) = self.push(message) {
            delivery.send(&unread);
        }
    }

    /// Queue a message without delivering it. With subscribers present the
    /// inbox is read and returned along with who should receive it.
    pub fn push(&mut self, message: Message) -> Option<(Delivery<Vec<Message>>, Vec<Message>)> {
        self.inbox.push(message);
        let delivery = self.subscription.delivery();
        if delivery.is_empty() {
            return None;
        }
        Some((delivery, self.read()))
    }

    /// Take all unread messages, archiving them
    pub fn read(&mut self) -> Vec<Message> {
        let unread = std::mem::take(&mut self.inbox);
        self.archive.extend(unread.iter().cloned());
        unread
    }

    /// Subscribe `target`, handing it anything already waiting
    pub fn subscribe<T, F>(&mut self, target: &Arc<T>, action: F) -> bool
    where
        T: Send + Sync + 'static,
        F: Fn(&T, &Vec<Message>) + Send + Sync + 'static,
    {
        if self.subscription.contains(target) {
            return false;
        }
        let pending = if self.inbox.is_empty() {
            None
        } else {
            Some(self.read())
        };
        if let Some(pending) = &pending {
            action(target.as_ref(), pending);
        }
        self.subscription.subscribe(target, action)
    }

    pub fn unsubscribe<T>(&mut self, target: &Arc<T>) -> bool {
        self.subscription.unsubscribe(target)
    }

    pub fn unread(&self) -> &[Message] {
        &self.inbox
    }

    pub fn archive(&self) -> &[Message] {
        &self.archive
    }
}
