use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// What the worker needs to know about a device before connecting to it.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceMetadata {
    pub name: String,
    /// Management address without any prefix length.
    pub primary_address: Option<String>,
    pub platform: String,
    /// Raw inventory attributes, used to resolve path template placeholders.
    pub attributes: Value,
}

impl DeviceMetadata {
    /// Attributes with a few flat convenience keys added for path templates.
    pub fn template_attributes(&self) -> Value {
        let mut attrs = match &self.attributes {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        attrs
            .entry("name")
            .or_insert_with(|| Value::String(self.name.clone()));
        attrs.insert("device_name".into(), Value::String(self.name.clone()));
        attrs.insert("platform_name".into(), Value::String(self.platform.clone()));
        if let Some(address) = &self.primary_address {
            attrs.insert("primary_ip".into(), Value::String(address.clone()));
        }
        Value::Object(attrs)
    }
}

/// Strip a CIDR suffix (`10.0.0.1/24` → `10.0.0.1`); empty input yields `None`.
pub fn host_address(address: &str) -> Option<String> {
    let host = address.split('/').next().unwrap_or_default().trim();
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

/// Source of truth for device name, address and platform.
#[async_trait]
pub trait MetadataResolver: Send + Sync {
    async fn get(&self, device_id: &str) -> Result<DeviceMetadata>;
}

/// Write access to inventory records, used to stamp the last backup date.
#[async_trait]
pub trait InventoryWriter: Send + Sync {
    async fn set_field(&self, device_id: &str, field_name: &str, value: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_prefix_length() {
        assert_eq!(host_address("10.1.2.3/24").as_deref(), Some("10.1.2.3"));
        assert_eq!(host_address("10.1.2.3").as_deref(), Some("10.1.2.3"));
        assert_eq!(host_address(""), None);
        assert_eq!(host_address("/32"), None);
    }

    #[test]
    fn template_attributes_keep_inventory_fields() {
        let meta = DeviceMetadata {
            name: "sw1".into(),
            primary_address: Some("192.0.2.1".into()),
            platform: "cisco_ios".into(),
            attributes: json!({"name": "sw1", "location": {"name": "LAB"}}),
        };
        let attrs = meta.template_attributes();
        assert_eq!(attrs["location"]["name"], "LAB");
        assert_eq!(attrs["device_name"], "sw1");
        assert_eq!(attrs["primary_ip"], "192.0.2.1");
        assert_eq!(attrs["platform_name"], "cisco_ios");
    }
}
