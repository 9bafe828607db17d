// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Identity and bytes of one forwarding attempt, independently of the
/// protocol used to deliver it.
pub trait Transaction: Send + Sync {
    fn domain(&self) -> &str;
    fn endpoint_name(&self) -> &str;
    fn payload(&self) -> &[u8];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Path appended to the domain, e.g. `/api/v2/logs`.
    pub route: String,
    /// Short name used in logs and telemetry.
    pub name: String,
}

impl Endpoint {
    pub fn new(route: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionPriority {
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpTransaction {
    /// Scheme and host, e.g. `https://http-intake.logs.datadoghq.com`.
    pub domain: String,
    pub endpoint: Endpoint,
    pub headers: BTreeMap<String, String>,
    pub payload: Vec<u8>,
    pub priority: TransactionPriority,
    /// Seconds since the unix epoch.
    pub created_at: i64,
    /// Number of failed delivery attempts so far.
    pub error_count: u32,
}

impl HttpTransaction {
    pub fn new(domain: impl Into<String>, endpoint: Endpoint, payload: Vec<u8>) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
            .unwrap_or_default();
        Self {
            domain: domain.into(),
            endpoint,
            headers: BTreeMap::new(),
            payload,
            priority: TransactionPriority::Normal,
            created_at,
            error_count: 0,
        }
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Full URL the transaction is sent to.
    #[must_use]
    pub fn url(&self) -> String {
        format!("{}{}", self.domain, self.endpoint.route)
    }
}

impl Transaction for HttpTransaction {
    fn domain(&self) -> &str {
        &self.domain
    }

    fn endpoint_name(&self) -> &str {
        &self.endpoint.name
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }
}
