//! Backend abstraction.
//!
//! The core never talks to the network directly. Everything goes through a
//! [`ResourceBackend`], which lets the same reconciliation code run against
//! the HTTP API or the in-memory simulator.

use crate::api::ApiResult;
use crate::client::ClientHandle;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// One page of a listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListPage {
    /// Entities on this page.
    pub entities: Vec<Value>,
    /// 1-based page number.
    pub page_number: u32,
    /// Total number of pages.
    pub page_count: u32,
}

impl ListPage {
    /// Returns true if more pages follow.
    pub fn has_more(&self) -> bool {
        self.page_number < self.page_count
    }
}

/// CRUD operations on typed JSON resources.
pub trait ResourceBackend: Send + Sync {
    /// Reads one resource.
    fn get(&self, client: &ClientHandle, resource_type: &str, id: &str) -> ApiResult<Value>;

    /// Reads one page of all resources of a type.
    fn list_page(
        &self,
        client: &ClientHandle,
        resource_type: &str,
        page_number: u32,
        page_size: u32,
    ) -> ApiResult<ListPage>;

    /// Creates a resource and returns its stored representation.
    fn create(&self, client: &ClientHandle, resource_type: &str, body: &Value) -> ApiResult<Value>;

    /// Applies a versioned update. `body` carries the expected `version`.
    fn update(
        &self,
        client: &ClientHandle,
        resource_type: &str,
        id: &str,
        body: &Value,
    ) -> ApiResult<Value>;

    /// Deletes a resource.
    fn delete(&self, client: &ClientHandle, resource_type: &str, id: &str) -> ApiResult<()>;
}

impl<B: ResourceBackend + ?Sized> ResourceBackend for Arc<B> {
    fn get(&self, client: &ClientHandle, resource_type: &str, id: &str) -> ApiResult<Value> {
        (**self).get(client, resource_type, id)
    }

    fn list_page(
        &self,
        client: &ClientHandle,
        resource_type: &str,
        page_number: u32,
        page_size: u32,
    ) -> ApiResult<ListPage> {
        (**self).list_page(client, resource_type, page_number, page_size)
    }

    fn create(&self, client: &ClientHandle, resource_type: &str, body: &Value) -> ApiResult<Value> {
        (**self).create(client, resource_type, body)
    }

    fn update(
        &self,
        client: &ClientHandle,
        resource_type: &str,
        id: &str,
        body: &Value,
    ) -> ApiResult<Value> {
        (**self).update(client, resource_type, id, body)
    }

    fn delete(&self, client: &ClientHandle, resource_type: &str, id: &str) -> ApiResult<()> {
        (**self).delete(client, resource_type, id)
    }
}

/// Returns the `id` field of a resource.
pub fn resource_id(value: &Value) -> Option<&str> {
    value.get("id").and_then(Value::as_str)
}
