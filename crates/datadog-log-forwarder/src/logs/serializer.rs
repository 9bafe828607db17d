// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::logs::message::Message;

/// Turns a flushed batch of messages into the body of a payload.
pub trait MessageSerializer: Send + Sync {
    fn serialize(&self, messages: &[Message]) -> Vec<u8>;
    /// MIME type of the serialized body, sent as `Content-Type`.
    fn content_type(&self) -> &str;
}

/// Newline separated contents, for plain text intakes.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineSerializer;

impl MessageSerializer for LineSerializer {
    fn content_type(&self) -> &str {
        "text/plain"
    }

    fn serialize(&self, messages: &[Message]) -> Vec<u8> {
        let capacity = messages.iter().map(|m| m.content.len() + 1).sum();
        let mut buffer = Vec::with_capacity(capacity);
        for (i, message) in messages.iter().enumerate() {
            if i > 0 {
                buffer.push(b'\n');
            }
            buffer.extend_from_slice(&message.content);
        }
        buffer
    }
}

/// JSON array of contents that are already JSON objects: `[{...},{...}]`.
///
/// An empty batch serializes to an empty body, not `[]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArraySerializer;

impl MessageSerializer for ArraySerializer {
    fn content_type(&self) -> &str {
        "application/json"
    }

    fn serialize(&self, messages: &[Message]) -> Vec<u8> {
        if messages.is_empty() {
            return Vec::new();
        }
        // "[" + contents + separators + "]"
        let capacity = messages.iter().map(|m| m.content.len() + 1).sum::<usize>() + 1;
        let mut buffer = Vec::with_capacity(capacity);
        buffer.push(b'[');
        for message in messages {
            buffer.extend_from_slice(&message.content);
            buffer.push(b',');
        }
        buffer.pop();
        buffer.push(b']');
        buffer
    }
}
