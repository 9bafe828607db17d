// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io::Write;

use zstd::stream::write::Encoder;

use crate::errors::EncodingError;

/// Final transformation applied to a serialized batch before it leaves the
/// batching stage. The name ends up in the `Content-Encoding` header.
pub trait ContentEncoding: Send + Sync {
    fn name(&self) -> &str;
    fn encode(&self, payload: &[u8]) -> Result<Vec<u8>, EncodingError>;
}

/// Leaves the payload untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityContentEncoding;

impl ContentEncoding for IdentityContentEncoding {
    fn name(&self) -> &str {
        "identity"
    }

    fn encode(&self, payload: &[u8]) -> Result<Vec<u8>, EncodingError> {
        Ok(payload.to_vec())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ZstdContentEncoding {
    level: i32,
}

impl ZstdContentEncoding {
    #[must_use]
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl ContentEncoding for ZstdContentEncoding {
    fn name(&self) -> &str {
        "zstd"
    }

    fn encode(&self, payload: &[u8]) -> Result<Vec<u8>, EncodingError> {
        let mut encoder = Encoder::new(Vec::new(), self.level)?;
        encoder.write_all(payload)?;
        Ok(encoder.finish()?)
    }
}
