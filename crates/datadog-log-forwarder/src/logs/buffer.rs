// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::logs::message::Message;

/// Accumulates messages up to a count limit and an aggregate content size limit.
///
/// A message that would push either total over its limit is rejected and the
/// buffer is left untouched, so a buffer never holds more than
/// `batch_size_limit` messages or more than `content_size_limit` bytes.
#[derive(Debug, Clone)]
pub struct MessageBuffer {
    messages: Vec<Message>,
    batch_size_limit: usize,
    content_size: usize,
    content_size_limit: usize,
}

impl MessageBuffer {
    #[must_use]
    pub fn new(batch_size_limit: usize, content_size_limit: usize) -> Self {
        Self {
            messages: Vec::with_capacity(batch_size_limit),
            batch_size_limit,
            content_size: 0,
            content_size_limit,
        }
    }

    /// Appends `message` if both limits still hold afterwards.
    pub fn add_message(&mut self, message: Message) -> Result<(), Message> {
        let message_size = message.content.len();
        if self.messages.len() < self.batch_size_limit
            && self.content_size + message_size <= self.content_size_limit
        {
            self.content_size += message_size;
            self.messages.push(message);
            Ok(())
        } else {
            Err(message)
        }
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.messages.len() >= self.batch_size_limit
            || self.content_size >= self.content_size_limit
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn content_size(&self) -> usize {
        self.content_size
    }

    /// Messages in insertion order.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Moves every message out, leaving an empty buffer behind.
    pub fn take_messages(&mut self) -> Vec<Message> {
        self.content_size = 0;
        std::mem::replace(&mut self.messages, Vec::with_capacity(self.batch_size_limit))
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.content_size = 0;
    }

    #[must_use]
    pub fn content_size_limit(&self) -> usize {
        self.content_size_limit
    }
}
