// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Encoding of transaction collections for the retry segments.
//!
//! The on-disk format is a versioned JSON envelope:
//!
//! ```json
//! {"version":2,"transactions":[{"endpoint":{"route":"/api/v2/logs","name":"logs"},"headers":{...},"payload":"<base64>",...}]}
//! ```
//!
//! The domain is not written: a serializer is bound to a single domain and
//! gives it back to every transaction it decodes. API keys never reach the
//! disk either, they are swapped for `@@@API_KEY_INDEX_<n>@@@` placeholders
//! and restored from the serializer's own key list.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::SerializerError;
use crate::retry::transaction::{Endpoint, HttpTransaction, Transaction, TransactionPriority};

const FORMAT_VERSION: u32 = 2;
const API_KEY_PLACEHOLDER_PREFIX: &str = "@@@API_KEY_INDEX_";
const API_KEY_PLACEHOLDER_SUFFIX: &str = "@@@";

/// Bidirectional codec between a transaction collection and bytes.
pub trait TransactionsSerializer: Send + Sync {
    type Transaction: Transaction;

    fn serialize(&self, transactions: &[Self::Transaction]) -> Result<Vec<u8>, SerializerError>;

    /// Fails on bytes that were not produced by a compatible serializer.
    fn deserialize(&self, bytes: &[u8]) -> Result<Vec<Self::Transaction>, SerializerError>;
}

#[derive(Serialize, Deserialize)]
struct TransactionCollection {
    version: u32,
    transactions: Vec<StoredTransaction>,
}

#[derive(Serialize, Deserialize)]
struct StoredTransaction {
    endpoint: Endpoint,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(with = "serde_base64")]
    payload: Vec<u8>,
    #[serde(default)]
    priority: TransactionPriority,
    created_at: i64,
    #[serde(default)]
    error_count: u32,
}

#[derive(Debug, Clone)]
pub struct HttpTransactionsSerializer {
    domain: String,
    api_keys: Vec<String>,
}

impl HttpTransactionsSerializer {
    pub fn new(domain: impl Into<String>, api_keys: Vec<String>) -> Self {
        Self {
            domain: domain.into(),
            api_keys: api_keys.into_iter().filter(|k| !k.is_empty()).collect(),
        }
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    fn scrub_api_keys(&self, value: &str) -> String {
        self.api_keys
            .iter()
            .enumerate()
            .fold(value.to_string(), |value, (index, api_key)| {
                value.replace(api_key.as_str(), &placeholder(index))
            })
    }

    fn restore_api_keys(&self, value: &str) -> Result<String, SerializerError> {
        let mut restored = String::with_capacity(value.len());
        let mut rest = value;
        while let Some(start) = rest.find(API_KEY_PLACEHOLDER_PREFIX) {
            let after_prefix = &rest[start + API_KEY_PLACEHOLDER_PREFIX.len()..];
            let Some(end) = after_prefix.find(API_KEY_PLACEHOLDER_SUFFIX) else {
                break;
            };
            let Ok(index) = after_prefix[..end].parse::<usize>() else {
                // not one of ours, keep it verbatim
                restored.push_str(&rest[..start + API_KEY_PLACEHOLDER_PREFIX.len()]);
                rest = after_prefix;
                continue;
            };
            let api_key = self
                .api_keys
                .get(index)
                .ok_or(SerializerError::UnknownApiKeyIndex(index))?;
            restored.push_str(&rest[..start]);
            restored.push_str(api_key);
            rest = &after_prefix[end + API_KEY_PLACEHOLDER_SUFFIX.len()..];
        }
        restored.push_str(rest);
        Ok(restored)
    }
}

mod serde_base64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = base64::engine::general_purpose::STANDARD.encode(value);
        serializer.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

fn placeholder(index: usize) -> String {
    format!("{API_KEY_PLACEHOLDER_PREFIX}{index}{API_KEY_PLACEHOLDER_SUFFIX}")
}

impl TransactionsSerializer for HttpTransactionsSerializer {
    type Transaction = HttpTransaction;

    fn serialize(&self, transactions: &[HttpTransaction]) -> Result<Vec<u8>, SerializerError> {
        let mut stored = Vec::with_capacity(transactions.len());
        for transaction in transactions {
            if transaction.domain != self.domain {
                return Err(SerializerError::DomainMismatch {
                    transaction: transaction.domain.clone(),
                    expected: self.domain.clone(),
                });
            }
            let headers = transaction
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), self.scrub_api_keys(v)))
                .collect();
            stored.push(StoredTransaction {
                endpoint: transaction.endpoint.clone(),
                headers,
                payload: transaction.payload.clone(),
                priority: transaction.priority,
                created_at: transaction.created_at,
                error_count: transaction.error_count,
            });
        }

        let collection = TransactionCollection {
            version: FORMAT_VERSION,
            transactions: stored,
        };
        Ok(serde_json::to_vec(&collection)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Vec<HttpTransaction>, SerializerError> {
        let collection: TransactionCollection = serde_json::from_slice(bytes)?;
        if collection.version != FORMAT_VERSION {
            return Err(SerializerError::UnsupportedVersion(collection.version));
        }

        collection
            .transactions
            .into_iter()
            .map(|stored| -> Result<HttpTransaction, SerializerError> {
                let headers = stored
                    .headers
                    .into_iter()
                    .map(|(k, v)| self.restore_api_keys(&v).map(|v| (k, v)))
                    .collect::<Result<BTreeMap<_, _>, _>>()?;
                Ok(HttpTransaction {
                    domain: self.domain.clone(),
                    endpoint: stored.endpoint,
                    headers,
                    payload: stored.payload,
                    priority: stored.priority,
                    created_at: stored.created_at,
                    error_count: stored.error_count,
                })
            })
            .collect()
    }
}
