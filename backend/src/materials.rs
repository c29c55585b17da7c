use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{
    AppState,
    auth::AuthUser,
    codec::{self, MaterialId},
    error::AppError,
    feed::MaterialEvent,
    models::{CreateMaterialRequest, MaterialPatch, MaterialRecord},
    repository::with_timeout,
    resolve::{self, record_from_document},
};

/// Fields no edit payload may write. The identifier and QR fields are fixed at creation,
/// ownership and timestamps belong to the store.
pub const PROTECTED_FIELDS: [&str; 7] = [
    "materialId",
    "qrCode",
    "qrImageUrl",
    "qrHash",
    "vendorId",
    "createdAt",
    "updatedAt",
];

/// Identifier collisions tolerated before creation gives up.
pub const MINT_ATTEMPTS: usize = 5;

/// Removes every protected field from an edit payload, returning the names dropped.
pub fn strip_protected_fields(fields: &mut Map<String, Value>) -> Vec<String> {
    PROTECTED_FIELDS
        .iter()
        .filter(|name| fields.remove(**name).is_some())
        .map(|name| name.to_string())
        .collect()
}

/// Records are flat: a patch may only carry primitives, and must carry something.
pub fn validate_patch(fields: &Map<String, Value>) -> Result<(), AppError> {
    if fields.is_empty() {
        return Err(AppError::Validation("no editable fields in update".into()));
    }
    if let Some((name, _)) = fields
        .iter()
        .find(|(_, value)| matches!(value, Value::Array(_) | Value::Object(_)))
    {
        return Err(AppError::Validation(format!(
            "field '{name}' must be a string, number, boolean or null"
        )));
    }
    Ok(())
}

/// Hex SHA-256 of the QR markup, stored alongside it to detect tampering.
pub fn qr_hash(svg: &str) -> String {
    format!("{:x}", Sha256::digest(svg.as_bytes()))
}

/// Object key the archived QR image is stored under.
pub fn qr_object_key(id: &MaterialId) -> String {
    format!("qr/{id}.svg")
}

/// create_material
///
/// Registers a new fitting for `vendor`: mints an identifier, renders its QR symbol,
/// archives the SVG and writes the document. A minted identifier that is already taken
/// is simply re-minted.
///
/// The archive upload is best-effort. The markup is stored inline in `qrCode`, so a
/// failed upload leaves `qrImageUrl` unset instead of failing the registration.
pub async fn create_material(
    state: &AppState,
    vendor: &AuthUser,
    payload: CreateMaterialRequest,
) -> Result<MaterialRecord, AppError> {
    let missing = payload.missing_fields();
    if !missing.is_empty() {
        return Err(AppError::Validation(format!(
            "missing required fields: {}",
            missing.join(", ")
        )));
    }
    let attributes = payload.into_fields();

    for attempt in 1..=MINT_ATTEMPTS {
        let id = MaterialId::mint();
        let svg = codec::encode(&id)?.to_svg();
        let hash = qr_hash(&svg);

        let key = qr_object_key(&id);
        let image_url = match state
            .storage
            .put_object(&key, svg.clone().into_bytes(), "image/svg+xml")
            .await
        {
            Ok(()) => Some(state.storage.public_url(&key)),
            Err(e) => {
                tracing::warn!(material_id = %id, error = %e, "qr archive upload failed");
                None
            }
        };

        let mut fields = attributes.clone();
        fields.insert("materialId".into(), Value::String(id.to_string()));
        fields.insert("qrCode".into(), Value::String(svg));
        fields.insert("qrHash".into(), Value::String(hash));
        fields.insert("vendorId".into(), Value::String(vendor.id.to_string()));
        if let Some(url) = image_url {
            fields.insert("qrImageUrl".into(), Value::String(url));
        }

        let inserted = with_timeout(
            state.config.store_timeout,
            state.repo.insert_material(id.as_str(), fields),
        )
        .await?;

        let Some(document) = inserted else {
            tracing::info!(material_id = %id, attempt, "identifier collision, minting again");
            continue;
        };

        let record = record_from_document(document).map_err(AppError::Internal)?;
        tracing::info!(material_id = %id, vendor_id = %vendor.id, "material registered");
        state.feed.publish(MaterialEvent::Created {
            record: record.clone(),
        });
        return Ok(record);
    }

    Err(AppError::Internal(format!(
        "no free identifier after {MINT_ATTEMPTS} attempts"
    )))
}

/// update_material
///
/// Merges an edit into an existing record. `owner` restricts the edit to one vendor's
/// records; staff edits pass `None`. Protected fields in the payload are dropped, not
/// rejected, so a client echoing back a full record still succeeds.
pub async fn update_material(
    state: &AppState,
    id: &MaterialId,
    patch: MaterialPatch,
    owner: Option<Uuid>,
) -> Result<MaterialRecord, AppError> {
    let current = resolve::resolve(state.repo.as_ref(), id, state.config.store_timeout).await?;

    if let Some(owner) = owner {
        if current.vendor_id.as_deref() != Some(owner.to_string().as_str()) {
            tracing::warn!(material_id = %id, user_id = %owner, "edit of another vendor's material");
            return Err(AppError::PermissionDenied);
        }
    }

    let mut fields = patch.fields;
    let dropped = strip_protected_fields(&mut fields);
    if !dropped.is_empty() {
        tracing::debug!(material_id = %id, ?dropped, "protected fields removed from update");
    }
    validate_patch(&fields)?;

    let merged = with_timeout(
        state.config.store_timeout,
        state.repo.merge_material(id.as_str(), fields),
    )
    .await?
    .ok_or_else(|| AppError::NotFound(id.to_string()))?;

    let record = record_from_document(merged).map_err(|reason| AppError::DataIntegrity {
        id: id.to_string(),
        reason,
    })?;
    tracing::info!(material_id = %id, "material updated");
    state.feed.publish(MaterialEvent::Updated {
        record: record.clone(),
    });
    Ok(record)
}

/// Lists materials newest first, optionally for one vendor. Documents that fail the shape
/// contract are skipped and logged so one bad record cannot blank a whole dashboard.
pub async fn list_materials(
    state: &AppState,
    vendor: Option<Uuid>,
) -> Result<Vec<MaterialRecord>, AppError> {
    let documents = with_timeout(
        state.config.store_timeout,
        state.repo.list_materials(vendor),
    )
    .await?;

    Ok(documents
        .into_iter()
        .filter_map(|document| {
            let key = document.key.clone();
            record_from_document(document)
                .inspect_err(|reason| {
                    tracing::error!(material_id = %key, reason = %reason, "skipping malformed material")
                })
                .ok()
        })
        .collect())
}
