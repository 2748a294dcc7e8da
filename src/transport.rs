//! Transport collaborator interface.
//!
//! The core never speaks a wire protocol. A [`Transport`] issues a named operation with JSON
//! params and either returns the JSON result or fails with an unclassified [`RawError`].

use crate::error::RawError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

/// A named operation and its params.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub operation: String,
    pub params: Value,
}

impl TransportRequest {
    pub fn new(operation: impl Into<String>, params: Value) -> Self {
        Self { operation: operation.into(), params }
    }
}

#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    async fn call(&self, operation: &str, params: Value) -> Result<Value, RawError>;

    /// Issue several requests of the same operation as one unit.
    ///
    /// The default sends them one by one and fails the whole batch on the first error.
    /// Transports with a native batch endpoint should override this.
    async fn call_batch(
        &self,
        operation: &str,
        params: Vec<Value>,
    ) -> Result<Vec<Value>, RawError> {
        let mut results = Vec::with_capacity(params.len());
        for p in params {
            results.push(self.call(operation, p).await?);
        }
        Ok(results)
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn call(&self, operation: &str, params: Value) -> Result<Value, RawError> {
        (**self).call(operation, params).await
    }

    async fn call_batch(

        &self,

        operation: &str,

        params: Vec<Value>,

    ) -> Result<Vec<Value>, RawError> {
        (**self).call_batch(operation, params).await
    }
}

/// Adapts any `tower::Service<TransportRequest>` into a [`Transport`].
///
/// The service is cloned per call, so middleware stacks built with `tower::ServiceBuilder` plug
/// in directly.
#[derive(Clone)]
pub struct ServiceTransport<S> {
    service: S,
}

impl<S> ServiceTransport<S> {
    pub fn new(service: S) -> Self {
        Self { service }
    }
}

impl<S> std::fmt::Debug for ServiceTransport<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceTransport").field("service", &"<service>").finish()
    }
}

#[async_trait]
impl<S> Transport for ServiceTransport<S>
where
    S: tower::Service<TransportRequest, Response = Value> + Clone + Send + Sync + 'static,
    S::Error: Into<RawError> + Send,
    S::Future: Send,
{
    async fn call(&self, operation: &str, params: Value) -> Result<Value, RawError> {
        self.service
            .clone()
            .oneshot(TransportRequest::new(operation, params))
            .await
            .map_err(Into::into)
    }
}
