//! Target adapters: one uniform `invoke` per protocol.
//!
//! The engine depends only on [`TargetAdapter`]; [`TargetConnector`] turns a
//! run's [`TargetDescriptor`] into an adapter and is where descriptor
//! validation happens.

pub mod http;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{CallError, GateResult};
use crate::model::TargetDescriptor;

pub use http::{HttpConnector, HttpTarget};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRequest {
    pub case_id: String,
    pub input: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetResponse {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default)]
    pub meta: serde_json::Value,
}

impl TargetResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            status: None,
            meta: serde_json::Value::Null,
        }
    }
}

#[async_trait]
pub trait TargetAdapter: Send + Sync {
    /// Endpoint identity; circuit breakers are keyed by it.
    fn endpoint(&self) -> &str;

    /// Identity used in case fingerprints. Adapters that speak several
    /// protocols on one endpoint must fold the protocol into it.
    fn provider_id(&self) -> String {
        self.endpoint().to_string()
    }

    async fn invoke(&self, request: &TargetRequest) -> Result<TargetResponse, CallError>;
}

pub trait TargetConnector: Send + Sync {
    /// Build an adapter, or `GateError::InvalidTarget` for a bad descriptor.
    fn connect(&self, target: &TargetDescriptor) -> GateResult<Arc<dyn TargetAdapter>>;
}
