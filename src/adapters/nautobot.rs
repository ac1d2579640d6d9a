use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::{Value, json};

use crate::config::InventoryConfig;
use crate::core::inventory::{DeviceMetadata, InventoryWriter, MetadataResolver, host_address};

const DEVICE_QUERY: &str = r#"
query getDevice($deviceId: ID!) {
  device(id: $deviceId) {
    id
    name
    serial
    asset_tag
    custom_field_data: _custom_field_data
    primary_ip4 { address host }
    platform { name network_driver manufacturer { name } }
    device_type { model manufacturer { name } }
    role { name }
    status { name }
    tenant { name }
    rack { name }
    location {
      name
      location_type { name }
      parent { name location_type { name } parent { name } }
    }
  }
}
"#;

/// Nautobot client: GraphQL for reads, REST `PATCH` for custom fields.
pub struct NautobotClient {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl NautobotClient {
    pub fn new(config: &InventoryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .context("Failed to build inventory HTTP client")?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            client,
        })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header("Authorization", format!("Token {token}")),
            None => request,
        }
    }

    async fn graphql(&self, query: &str, variables: Value) -> Result<Value> {
        let url = format!("{}/api/graphql/", self.base_url);
        let response = self
            .authorized(self.client.post(&url))
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .with_context(|| format!("GraphQL request to {url} failed"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("GraphQL request returned {status}: {body}");
        }

        let mut body: Value = response
            .json()
            .await
            .context("GraphQL response is not valid JSON")?;

        if let Some(errors) = body.get("errors").filter(|e| !e.is_null()) {
            bail!("GraphQL errors: {errors}");
        }

        Ok(body.get_mut("data").map(Value::take).unwrap_or(Value::Null))
    }
}

/// Map a GraphQL `device` object onto the fields a backup needs.
pub fn parse_device(device: Value) -> Result<DeviceMetadata> {
    let name = device
        .get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| anyhow!("device has no name"))?
        .to_string();

    let primary_address = device
        .pointer("/primary_ip4/address")
        .and_then(Value::as_str)
        .and_then(host_address);

    let platform = device
        .pointer("/platform/name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Ok(DeviceMetadata {
        name,
        primary_address,
        platform,
        attributes: device,
    })
}

#[async_trait]
impl MetadataResolver for NautobotClient {
    async fn get(&self, device_id: &str) -> Result<DeviceMetadata> {
        let data = self
            .graphql(DEVICE_QUERY, json!({ "deviceId": device_id }))
            .await?;

        match data.get("device") {
            Some(device) if !device.is_null() => parse_device(device.clone()),
            _ => bail!("device {device_id} not found"),
        }
    }
}

#[async_trait]
impl InventoryWriter for NautobotClient {
    async fn set_field(&self, device_id: &str, field_name: &str, value: &str) -> Result<()> {
        let url = format!("{}/api/dcim/devices/{}/", self.base_url, device_id);
        let mut fields = serde_json::Map::new();
        fields.insert(field_name.to_string(), Value::String(value.to_string()));

        let response = self
            .authorized(self.client.patch(&url))
            .json(&json!({ "custom_fields": fields }))
            .send()
            .await
            .with_context(|| format!("PATCH {url} failed"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Updating {field_name} returned {status}: {body}");
        }
        Ok(())
    }
}
