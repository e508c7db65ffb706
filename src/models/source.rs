use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::FromRow;

use crate::error::{Result, ZartanError};

/// Kind of backend a source provisions proxies from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    DigitalOcean,
    Linode,
    Joyent,
    Static,
}

/// Type of a configuration field, as shown on the admin surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Password,
    Integer,
}

const CLOUD_COMMON_FIELDS: &[(&str, FieldKind)] = &[("proxy_port", FieldKind::Integer)];

const DIGITAL_OCEAN_FIELDS: &[(&str, FieldKind)] = &[
    ("client_id", FieldKind::String),
    ("api_key", FieldKind::Password),
    ("image_name", FieldKind::String),
    ("flavor_name", FieldKind::String),
    ("region_name", FieldKind::String),
];

const LINODE_FIELDS: &[(&str, FieldKind)] = &[
    ("api_key", FieldKind::Password),
    ("image_name", FieldKind::String),
    ("flavor_name", FieldKind::String),
    ("data_center_name", FieldKind::String),
];

const JOYENT_FIELDS: &[(&str, FieldKind)] = &[
    ("client_id", FieldKind::String),
    ("api_key", FieldKind::Password),
    ("image_name", FieldKind::String),
    ("flavor_name", FieldKind::String),
    ("region_name", FieldKind::String),
];

impl SourceType {
    pub const ALL: [SourceType; 4] = [
        SourceType::DigitalOcean,
        SourceType::Linode,
        SourceType::Joyent,
        SourceType::Static,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::DigitalOcean => "digital_ocean",
            SourceType::Linode => "linode",
            SourceType::Joyent => "joyent",
            SourceType::Static => "static",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "digital_ocean" | "digitalocean" => Some(SourceType::DigitalOcean),
            "linode" => Some(SourceType::Linode),
            "joyent" => Some(SourceType::Joyent),
            "static" | "static_list" => Some(SourceType::Static),
            _ => None,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            SourceType::DigitalOcean => "Digital Ocean",
            SourceType::Linode => "Linode",
            SourceType::Joyent => "Joyent",
            SourceType::Static => "Static List",
        }
    }

    pub fn is_cloud(&self) -> bool {
        !matches!(self, SourceType::Static)
    }

    /// Configuration fields every source of this type must carry
    pub fn required_fields(&self) -> Vec<(&'static str, FieldKind)> {
        let specific = match self {
            SourceType::DigitalOcean => DIGITAL_OCEAN_FIELDS,
            SourceType::Linode => LINODE_FIELDS,
            SourceType::Joyent => JOYENT_FIELDS,
            SourceType::Static => return Vec::new(),
        };
        CLOUD_COMMON_FIELDS
            .iter()
            .chain(specific.iter())
            .copied()
            .collect()
    }

    /// Check a raw config map against this type's declared fields.
    ///
    /// Returns every problem found, not just the first.
    pub fn validate_fields(&self, config: &Map<String, Value>) -> std::result::Result<(), Vec<String>> {
        let problems: Vec<String> = self
            .required_fields()
            .into_iter()
            .filter_map(|(name, kind)| match (config.get(name), kind) {
                (None, _) | (Some(Value::Null), _) => Some(format!("{} is required", name)),
                (Some(Value::String(s)), FieldKind::String | FieldKind::Password)
                    if !s.trim().is_empty() =>
                {
                    None
                }
                (Some(Value::Number(n)), FieldKind::Integer) if n.is_i64() || n.is_u64() => None,
                (Some(Value::String(s)), FieldKind::Integer) if s.trim().parse::<i64>().is_ok() => {
                    None
                }
                (Some(_), FieldKind::Integer) => Some(format!("{} must be an integer", name)),
                (Some(_), _) => Some(format!("{} must be a non-empty string", name)),
            })
            .collect();

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A provider of proxies
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub source_type: String, // Stored as string in DB
    /// Higher reliability wins ownership conflicts
    pub reliability: f64,
    pub max_proxies: i32,
    #[serde(skip_serializing)]
    pub config: Json<Value>,
    /// Persistent error log, oldest first
    pub errors: Json<Vec<String>>,
    #[serde(skip_serializing)]
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Source {
    /// Get the source type enum
    pub fn type_enum(&self) -> Option<SourceType> {
        SourceType::from_str(&self.source_type)
    }

    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Static lists never provision, whatever their row says
    pub fn effective_max_proxies(&self) -> i64 {
        match self.type_enum() {
            Some(SourceType::Static) | None => 0,
            Some(_) => self.max_proxies.max(0) as i64,
        }
    }

    /// Run the generic field validation for this source's type
    pub fn validate_fields(&self) -> std::result::Result<(), Vec<String>> {
        let kind = self
            .type_enum()
            .ok_or_else(|| vec![format!("unknown source type {}", self.source_type)])?;
        let empty = Map::new();
        let map = self.config.0.as_object().unwrap_or(&empty);
        kind.validate_fields(map)
    }

    /// Decode the typed cloud configuration
    pub fn cloud_config(&self) -> Result<CloudConfig> {
        if let Err(problems) = self.validate_fields() {
            return Err(ZartanError::InvalidConfig(format!(
                "source {}: {}",
                self.name,
                problems.join(", ")
            )));
        }
        serde_json::from_value(self.config.0.clone()).map_err(|e| {
            ZartanError::InvalidConfig(format!("source {}: {}", self.name, e))
        })
    }
}

/// Typed configuration shared by every cloud source.
///
/// Resolved ids are cached alongside the names they were resolved from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudConfig {
    #[serde(deserialize_with = "de_port")]
    pub proxy_port: i32,
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub image_name: String,
    pub flavor_name: String,
    #[serde(alias = "data_center_name")]
    pub region_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flavor_id: Option<String>,
    #[serde(default, alias = "data_center_id", skip_serializing_if = "Option::is_none")]
    pub region_id: Option<String>,
}

impl CloudConfig {
    /// All three ids, once every one of them has been resolved
    pub fn resolved_ids(&self) -> Option<(&str, &str, &str)> {
        Some((
            self.image_id.as_deref()?,
            self.flavor_id.as_deref()?,
            self.region_id.as_deref()?,
        ))
    }
}

// The admin surface stores integers as either JSON numbers or strings.
fn de_port<'de, D>(deserializer: D) -> std::result::Result<i32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_i64()
            .map(|v| v as i32)
            .ok_or_else(|| D::Error::custom("proxy_port must be an integer")),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| D::Error::custom("proxy_port must be an integer")),
        _ => Err(D::Error::custom("proxy_port must be an integer")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source(kind: &str, config: Value) -> Source {
        Source {
            id: 1,
            name: "test".to_string(),
            source_type: kind.to_string(),
            reliability: 50.0,
            max_proxies: 10,
            config: Json(config),
            errors: Json(Vec::new()),
            deleted_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_source_type_round_trip_names() {
        for kind in SourceType::ALL {
            assert_eq!(SourceType::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(SourceType::from_str("nope"), None);
    }

    #[test]
    fn test_static_has_no_required_fields() {
        assert!(SourceType::Static.required_fields().is_empty());
        assert!(SourceType::Static.validate_fields(&Map::new()).is_ok());
    }

    #[test]
    fn test_validate_fields_reports_every_problem() {
        let config = json!({
            "proxy_port": "not-a-port",
            "api_key": "",
            "image_name": "ubuntu",
            "flavor_name": "small"
        });
        let problems = SourceType::Linode
            .validate_fields(config.as_object().unwrap())
            .unwrap_err();

        assert!(problems.contains(&"proxy_port must be an integer".to_string()));
        assert!(problems.contains(&"api_key must be a non-empty string".to_string()));
        assert!(problems.contains(&"data_center_name is required".to_string()));
        assert_eq!(problems.len(), 3);
    }

    #[test]
    fn test_cloud_config_accepts_data_center_alias() {
        let src = source(
            "linode",
            json!({
                "proxy_port": "3128",
                "api_key": "secret",
                "image_name": "proxy-image",
                "flavor_name": "1GB",
                "data_center_name": "Dallas"
            }),
        );
        let config = src.cloud_config().unwrap();
        assert_eq!(config.proxy_port, 3128);
        assert_eq!(config.region_name, "Dallas");
        assert!(config.resolved_ids().is_none());
    }

    #[test]
    fn test_cloud_config_rejects_missing_fields() {
        let src = source("digital_ocean", json!({"proxy_port": 3128}));
        assert!(matches!(
            src.cloud_config(),
            Err(ZartanError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_static_never_provisions() {
        let src = source("static", json!({}));
        assert_eq!(src.effective_max_proxies(), 0);
        let src = source("joyent", json!({}));
        assert_eq!(src.effective_max_proxies(), 10);
    }
}
