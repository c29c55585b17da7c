use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, de};
use serde_json::{Map, Value};
use ts_rs::TS;
use utoipa::ToSchema;
use uuid::Uuid;

// --- Identity & Access ---

/// Role
///
/// The RBAC field stored on every profile. Each role owns one protected section of the
/// portal, and that section's login page is where the gate sends rejected sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS, ToSchema)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum Role {
    Vendor,
    Depot,
    Track,
    Admin,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Vendor, Role::Depot, Role::Track, Role::Admin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Vendor => "vendor",
            Role::Depot => "depot",
            Role::Track => "track",
            Role::Admin => "admin",
        }
    }

    /// Mount point of the role's section, e.g. `/depot`.
    pub fn section_path(&self) -> &'static str {
        match self {
            Role::Vendor => "/vendor",
            Role::Depot => "/depot",
            Role::Track => "/track",
            Role::Admin => "/admin",
        }
    }

    pub fn login_path(&self) -> &'static str {
        match self {
            Role::Vendor => "/vendor/login",
            Role::Depot => "/depot/login",
            Role::Track => "/track/login",
            Role::Admin => "/admin/login",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| format!("unknown role '{s}'"))
    }
}

/// User
///
/// A profile row: the identity provider's user id mirrored into the store, plus the role
/// the gate re-reads on every protected entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub role: Role,
}

/// UserProfile
///
/// Output schema for a successful login and for `GET /me`-style lookups.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct UserProfile {
    pub id: Uuid,
    pub email: String,
    pub role: Role,
}

impl From<User> for UserProfile {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            role: user.role,
        }
    }
}

/// LoginRequest
///
/// Credentials are forwarded to the identity provider and never persisted or logged.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct LoginResponse {
    pub user: UserProfile,
    /// Seconds until the access token (and the session marker) expire.
    pub expires_in: u64,
    /// Landing page of the section the user signed in to.
    pub redirect_to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct PasswordResetRequest {
    pub email: String,
}

/// RegisterUserRequest
///
/// Admin-only provisioning payload. The password is passed straight through to the
/// identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct RegisterUserRequest {
    pub email: String,
    pub password: String,
    pub role: Role,
}

// --- Materials ---

/// MaterialRecord
///
/// One fitting as stored in the `materials` collection. Field names follow the
/// document store's camelCase shape. Descriptive attributes tolerate numeric or boolean
/// storage (older documents hold weights as numbers) and are surfaced as strings.
#[derive(Debug, Clone, Serialize, TS, ToSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct MaterialRecord {
    /// Document key and QR payload. Write-protected after creation.
    pub material_id: String,

    pub manufacturer_name: String,
    pub manufacturer_id: String,
    pub fitting_type: String,
    pub drawing_number: String,
    pub material_specs: String,
    pub weight: String,
    pub gauge: String,
    pub manufacturing_date: String,
    pub expected_life: String,
    pub batch_number: String,
    pub po_number: String,

    // System fields. All of these are stripped from edit payloads.
    /// Inline SVG markup of the QR symbol.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_image_url: Option<String>,
    /// Hex SHA-256 of `qr_code`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[ts(type = "string | null")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[ts(type = "string | null")]
    pub updated_at: Option<DateTime<Utc>>,

    /// Fields added after creation by depot or track staff (receipt, installation notes).
    #[serde(flatten)]
    #[ts(skip)]
    #[schema(value_type = Object)]
    pub extra: BTreeMap<String, Value>,
}

/// Stored shape of a material document. Reading goes through here so the tolerant
/// attribute parsing stays out of the exported type.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredMaterial {
    material_id: String,
    #[serde(default, deserialize_with = "primitive_as_string")]
    manufacturer_name: String,
    #[serde(default, deserialize_with = "primitive_as_string")]
    manufacturer_id: String,
    #[serde(default, deserialize_with = "primitive_as_string")]
    fitting_type: String,
    #[serde(default, deserialize_with = "primitive_as_string")]
    drawing_number: String,
    #[serde(default, deserialize_with = "primitive_as_string")]
    material_specs: String,
    #[serde(default, deserialize_with = "primitive_as_string")]
    weight: String,
    #[serde(default, deserialize_with = "primitive_as_string")]
    gauge: String,
    #[serde(default, deserialize_with = "primitive_as_string")]
    manufacturing_date: String,
    #[serde(default, deserialize_with = "primitive_as_string")]
    expected_life: String,
    #[serde(default, deserialize_with = "primitive_as_string")]
    batch_number: String,
    #[serde(default, deserialize_with = "primitive_as_string")]
    po_number: String,
    #[serde(default)]
    qr_code: Option<String>,
    #[serde(default)]
    qr_image_url: Option<String>,
    #[serde(default)]
    qr_hash: Option<String>,
    #[serde(default)]
    vendor_id: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

impl<'de> Deserialize<'de> for MaterialRecord {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let stored = StoredMaterial::deserialize(deserializer)?;
        Ok(Self {
            material_id: stored.material_id,
            manufacturer_name: stored.manufacturer_name,
            manufacturer_id: stored.manufacturer_id,
            fitting_type: stored.fitting_type,
            drawing_number: stored.drawing_number,
            material_specs: stored.material_specs,
            weight: stored.weight,
            gauge: stored.gauge,
            manufacturing_date: stored.manufacturing_date,
            expected_life: stored.expected_life,
            batch_number: stored.batch_number,
            po_number: stored.po_number,
            qr_code: stored.qr_code,
            qr_image_url: stored.qr_image_url,
            qr_hash: stored.qr_hash,
            vendor_id: stored.vendor_id,
            created_at: stored.created_at,
            updated_at: stored.updated_at,
            extra: stored.extra,
        })
    }
}

fn primitive_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(de::Error::custom(format!(
            "expected a primitive value, found {other}"
        ))),
    }
}

/// CreateMaterialRequest
///
/// Vendor input for registering a new fitting. The identifier and every QR field are
/// generated server-side; anything of that name in the payload is ignored.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct CreateMaterialRequest {
    #[serde(default)]
    pub manufacturer_name: String,
    #[serde(default)]
    pub manufacturer_id: String,
    #[serde(default)]
    pub fitting_type: String,
    #[serde(default)]
    pub drawing_number: String,
    #[serde(default)]
    pub material_specs: String,
    #[serde(default)]
    pub weight: String,
    #[serde(default)]
    pub gauge: String,
    #[serde(default)]
    pub manufacturing_date: String,
    #[serde(default)]
    pub expected_life: String,
    #[serde(default)]
    pub batch_number: String,
    #[serde(default)]
    pub po_number: String,
}

impl CreateMaterialRequest {
    fn attributes(&self) -> [(&'static str, &str); 11] {
        [
            ("manufacturerName", &self.manufacturer_name),
            ("manufacturerId", &self.manufacturer_id),
            ("fittingType", &self.fitting_type),
            ("drawingNumber", &self.drawing_number),
            ("materialSpecs", &self.material_specs),
            ("weight", &self.weight),
            ("gauge", &self.gauge),
            ("manufacturingDate", &self.manufacturing_date),
            ("expectedLife", &self.expected_life),
            ("batchNumber", &self.batch_number),
            ("poNumber", &self.po_number),
        ]
    }

    /// Names of required attributes that are blank.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        self.attributes()
            .into_iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| name)
            .collect()
    }

    /// Flattens the request into document fields, trimmed.
    pub fn into_fields(self) -> Map<String, Value> {
        self.attributes()
            .into_iter()
            .map(|(name, value)| (name.to_string(), Value::String(value.trim().to_string())))
            .collect()
    }
}

/// MaterialPatch
///
/// A flat map of primitive fields merged into an existing record. Used both for vendor
/// edits and for depot/track updates. Protected fields are removed before persisting.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Default)]
pub struct MaterialPatch {
    #[serde(flatten)]
    #[schema(value_type = Object)]
    pub fields: Map<String, Value>,
}

/// ScanRequest
///
/// The raw string a camera scanner produced. May be a bare identifier or a deep link.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct ScanRequest {
    #[schema(example = "AB12345")]
    pub payload: String,
}

// --- Dashboard ---

/// DashboardStats
///
/// Output schema for the admin dashboard (GET /admin/stats).
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default, PartialEq, Eq)]
#[ts(export)]
pub struct DashboardStats {
    pub total_materials: i64,
    /// Distinct vendors that have registered at least one material.
    pub active_vendors: i64,
    pub total_users: i64,
}
