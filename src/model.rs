//! Outbound mutation types.
//!
//! Each queued operation carries a closed, per-resource payload that is
//! validated when it is enqueued, so malformed writes fail at the call site
//! rather than as a delivery failure later.

use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Why an operation was refused at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
  #[error("endpoint `{0}` is neither an absolute http(s) URL nor a path starting with `/`")]
  Endpoint(String),
  #[error("{0} requests cannot carry a mutation")]
  Method(Method),
  #[error("header `{0}` is not a valid HTTP header")]
  Header(String),
  #[error("{resource} payload field `{field}` {reason}")]
  Field {
    resource: ResourceType,
    field: &'static str,
    reason: &'static str,
  },
  #[error("unknown {kind} `{value}`")]
  Unknown { kind: &'static str, value: String },
}

/// Category of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
  Harvest,
  Order,
  Payment,
  Product,
  Shipment,
  Generic,
}

impl ResourceType {
  pub const ALL: [ResourceType; 6] = [
    ResourceType::Harvest,
    ResourceType::Order,
    ResourceType::Payment,
    ResourceType::Product,
    ResourceType::Shipment,
    ResourceType::Generic,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      ResourceType::Harvest => "harvest",
      ResourceType::Order => "order",
      ResourceType::Payment => "payment",
      ResourceType::Product => "product",
      ResourceType::Shipment => "shipment",
      ResourceType::Generic => "generic",
    }
  }

  /// Cache namespace holding reads of this resource family.
  pub fn cache_namespace(&self) -> &'static str {
    match self {
      ResourceType::Harvest => "harvests",
      ResourceType::Order => "orders",
      ResourceType::Payment => "payments",
      ResourceType::Product => "products",
      ResourceType::Shipment => "shipments",
      ResourceType::Generic => "generic",
    }
  }

  /// Tag used for background sync registration.
  pub fn sync_tag(&self) -> String {
    format!("sync-{}", self.as_str())
  }
}

impl fmt::Display for ResourceType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ResourceType {
  type Err = ValidationError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    ResourceType::ALL
      .into_iter()
      .find(|r| r.as_str() == s)
      .ok_or_else(|| ValidationError::Unknown {
        kind: "resource type",
        value: s.to_string(),
      })
  }
}

/// Drain order of a queued item. Does not affect delivery guarantees.
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  High,
  #[default]
  Medium,
  Low,
}

impl Priority {
  /// Sort rank; lower drains first.
  pub fn rank(&self) -> i64 {
    match self {
      Priority::High => 0,
      Priority::Medium => 1,
      Priority::Low => 2,
    }
  }

  pub fn from_rank(rank: i64) -> Option<Self> {
    match rank {
      0 => Some(Priority::High),
      1 => Some(Priority::Medium),
      2 => Some(Priority::Low),
      _ => None,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Priority::High => "high",
      Priority::Medium => "medium",
      Priority::Low => "low",
    }
  }
}

impl fmt::Display for Priority {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Priority {
  type Err = ValidationError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "high" => Ok(Priority::High),
      "medium" => Ok(Priority::Medium),
      "low" => Ok(Priority::Low),
      other => Err(ValidationError::Unknown {
        kind: "priority",
        value: other.to_string(),
      }),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

// ============================================================================
// Payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestPayload {
  pub farm_id: String,
  pub crop: String,
  pub quantity_kg: f64,
  pub harvested_at: Option<DateTime<Utc>>,
  pub grade: Option<String>,
  /// Keys of photos held in the asset collection
  #[serde(default)]
  pub photo_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPayload {
  pub product_id: String,
  pub buyer_id: String,
  pub quantity: f64,
  pub unit_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentPayload {
  pub order_id: String,
  pub amount: f64,
  /// ISO 4217 code, e.g. "KES"
  pub currency: String,
  pub method: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductPayload {
  pub name: String,
  pub unit: String,
  pub price: f64,
  pub stock: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipmentPayload {
  pub order_id: String,
  pub status: String,
  pub carrier: Option<String>,
  pub tracking_code: Option<String>,
}

/// The body of a queued write, tagged by resource type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resource_type", content = "payload", rename_all = "lowercase")]
pub enum Mutation {
  Harvest(HarvestPayload),
  Order(OrderPayload),
  Payment(PaymentPayload),
  Product(ProductPayload),
  Shipment(ShipmentPayload),
  Generic(Value),
}

fn require_text(
  resource: ResourceType,
  field: &'static str,
  value: &str,
) -> Result<(), ValidationError> {
  if value.trim().is_empty() {
    return Err(ValidationError::Field {
      resource,
      field,
      reason: "must not be empty",
    });
  }
  Ok(())
}

fn require_positive(
  resource: ResourceType,
  field: &'static str,
  value: f64,
) -> Result<(), ValidationError> {
  if !value.is_finite() || value <= 0.0 {
    return Err(ValidationError::Field {
      resource,
      field,
      reason: "must be a positive number",
    });
  }
  Ok(())
}

fn require_non_negative(
  resource: ResourceType,
  field: &'static str,
  value: f64,
) -> Result<(), ValidationError> {
  if !value.is_finite() || value < 0.0 {
    return Err(ValidationError::Field {
      resource,
      field,
      reason: "must not be negative",
    });
  }
  Ok(())
}

impl Mutation {
  pub fn resource_type(&self) -> ResourceType {
    match self {
      Mutation::Harvest(_) => ResourceType::Harvest,
      Mutation::Order(_) => ResourceType::Order,
      Mutation::Payment(_) => ResourceType::Payment,
      Mutation::Product(_) => ResourceType::Product,
      Mutation::Shipment(_) => ResourceType::Shipment,
      Mutation::Generic(_) => ResourceType::Generic,
    }
  }

  pub fn validate(&self) -> Result<(), ValidationError> {
    let resource = self.resource_type();
    match self {
      Mutation::Harvest(h) => {
        require_text(resource, "farm_id", &h.farm_id)?;
        require_text(resource, "crop", &h.crop)?;
        require_positive(resource, "quantity_kg", h.quantity_kg)?;
        if h.photo_keys.iter().any(|k| k.trim().is_empty()) {
          return Err(ValidationError::Field {
            resource,
            field: "photo_keys",
            reason: "must not contain empty keys",
          });
        }
      }
      Mutation::Order(o) => {
        require_text(resource, "product_id", &o.product_id)?;
        require_text(resource, "buyer_id", &o.buyer_id)?;
        require_positive(resource, "quantity", o.quantity)?;
        if let Some(price) = o.unit_price {
          require_non_negative(resource, "unit_price", price)?;
        }
      }
      Mutation::Payment(p) => {
        require_text(resource, "order_id", &p.order_id)?;
        require_positive(resource, "amount", p.amount)?;
        if p.currency.len() != 3 || !p.currency.chars().all(|c| c.is_ascii_uppercase()) {
          return Err(ValidationError::Field {
            resource,
            field: "currency",
            reason: "must be a three-letter uppercase ISO code",
          });
        }
      }
      Mutation::Product(p) => {
        require_text(resource, "name", &p.name)?;
        require_text(resource, "unit", &p.unit)?;
        require_non_negative(resource, "price", p.price)?;
        if let Some(stock) = p.stock {
          require_non_negative(resource, "stock", stock)?;
        }
      }
      Mutation::Shipment(s) => {
        require_text(resource, "order_id", &s.order_id)?;
        require_text(resource, "status", &s.status)?;
      }
      Mutation::Generic(_) => {}
    }
    Ok(())
  }

  /// JSON request body sent to the server (the payload without its tag).
  pub fn body(&self) -> Value {
    let value = match self {
      Mutation::Harvest(p) => serde_json::to_value(p),
      Mutation::Order(p) => serde_json::to_value(p),
      Mutation::Payment(p) => serde_json::to_value(p),
      Mutation::Product(p) => serde_json::to_value(p),
      Mutation::Shipment(p) => serde_json::to_value(p),
      Mutation::Generic(v) => return v.clone(),
    };
    // Plain structs with string keys always serialize.
    value.unwrap_or(Value::Null)
  }
}

/// A fully-formed outbound request descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
  pub method: Method,
  /// Absolute URL, or a path resolved against the configured API base URL
  pub endpoint: String,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  pub mutation: Mutation,
}

impl Operation {
  pub fn new(method: Method, endpoint: impl Into<String>, mutation: Mutation) -> Self {
    Self {
      method,
      endpoint: endpoint.into(),
      headers: BTreeMap::new(),
      mutation,
    }
  }

  pub fn post(endpoint: impl Into<String>, mutation: Mutation) -> Self {
    Self::new(Method::Post, endpoint, mutation)
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }

  pub fn resource_type(&self) -> ResourceType {
    self.mutation.resource_type()
  }

  pub fn validate(&self) -> Result<(), ValidationError> {
    if self.method == Method::Get {
      return Err(ValidationError::Method(self.method));
    }

    if !is_valid_endpoint(&self.endpoint) {
      return Err(ValidationError::Endpoint(self.endpoint.clone()));
    }

    for (name, value) in &self.headers {
      let valid = reqwest::header::HeaderName::from_bytes(name.as_bytes()).is_ok()
        && reqwest::header::HeaderValue::from_str(value).is_ok();
      if !valid {
        return Err(ValidationError::Header(name.clone()));
      }
    }

    self.mutation.validate()
  }
}

fn is_valid_endpoint(endpoint: &str) -> bool {
  if endpoint.starts_with('/') {
    return !endpoint.chars().any(char::is_whitespace);
  }
  match url::Url::parse(endpoint) {
    Ok(url) => matches!(url.scheme(), "http" | "https"),
    Err(_) => false,
  }
}

/// Per-call overrides for [`crate::queue::MutationQueue::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
  pub priority: Option<Priority>,
  pub max_retries: Option<u32>,
  /// Display/debug context only; never consulted for delivery
  pub metadata: Option<Value>,
}

impl EnqueueOptions {
  pub fn priority(mut self, priority: Priority) -> Self {
    self.priority = Some(priority);
    self
  }

  pub fn max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = Some(max_retries);
    self
  }

  pub fn metadata(mut self, metadata: Value) -> Self {
    self.metadata = Some(metadata);
    self
  }
}

/// One outbound mutation waiting for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
  pub id: String,
  pub operation: Operation,
  pub priority: Priority,
  pub created_at: DateTime<Utc>,
  pub retry_count: u32,
  pub max_retries: u32,
  pub metadata: Option<Value>,
}

impl QueueItem {
  pub fn resource_type(&self) -> ResourceType {
    self.operation.resource_type()
  }
}

/// Build an id of the form `{resource_type}-{unix_millis}-{random}`.
pub fn new_item_id(resource_type: ResourceType, at: DateTime<Utc>) -> String {
  let suffix: String = rand::thread_rng()
    .sample_iter(&Alphanumeric)
    .take(8)
    .map(|b| char::from(b).to_ascii_lowercase())
    .collect();
  format!("{}-{}-{}", resource_type, at.timestamp_millis(), suffix)
}
