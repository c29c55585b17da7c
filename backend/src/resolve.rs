use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::{
    codec::MaterialId,
    error::AppError,
    models::MaterialRecord,
    repository::{MaterialDocument, Repository, StoreError, with_timeout},
};

/// ResolveError
///
/// The three outcomes of a lookup that did not produce a record. Keeping "missing" apart
/// from "unreachable" matters most at a scan point with poor signal: the operator must
/// be told to retry, not that the fitting does not exist.
#[derive(Error, Debug, Clone)]
pub enum ResolveError {
    #[error("no material record exists for identifier {0}")]
    NotFound(MaterialId),
    #[error("material record {id} is malformed: {reason}")]
    DataIntegrity { id: MaterialId, reason: String },
    #[error("record store unavailable: {0}")]
    Transient(StoreError),
}

impl ResolveError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ResolveError::Transient(_))
    }
}

impl From<ResolveError> for AppError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::NotFound(id) => AppError::NotFound(id.to_string()),
            ResolveError::DataIntegrity { id, reason } => AppError::DataIntegrity {
                id: id.to_string(),
                reason,
            },
            ResolveError::Transient(cause) => AppError::Transient(cause.to_string()),
        }
    }
}

/// resolve
///
/// Looks `id` up as a primary key and validates the result:
///
/// - no document: `NotFound`;
/// - a document whose own `materialId` is missing, not a string, or different from the
///   key it is stored under, or that does not fit the record shape: `DataIntegrity`;
/// - the store call fails or exceeds `limit`: `Transient`.
pub async fn resolve(
    repo: &dyn Repository,
    id: &MaterialId,
    limit: Duration,
) -> Result<MaterialRecord, ResolveError> {
    let lookup = with_timeout(limit, repo.get_material(id.as_str())).await;

    let document = match lookup {
        Ok(Some(document)) => document,
        Ok(None) => return Err(ResolveError::NotFound(id.clone())),
        Err(StoreError::Corrupt(reason)) => {
            return Err(ResolveError::DataIntegrity {
                id: id.clone(),
                reason,
            });
        }
        Err(cause) => return Err(ResolveError::Transient(cause)),
    };

    record_from_document(document).map_err(|reason| ResolveError::DataIntegrity {
        id: id.clone(),
        reason,
    })
}

/// record_from_document
///
/// Applies the minimal shape contract to a raw document. The store's own timestamps win
/// over any same-named fields inside the document body.
pub fn record_from_document(document: MaterialDocument) -> Result<MaterialRecord, String> {
    let MaterialDocument {
        key,
        mut fields,
        created_at,
        updated_at,
    } = document;

    match fields.get("materialId") {
        None | Some(Value::Null) => return Err("document has no materialId field".to_string()),
        Some(Value::String(own)) if own.trim().is_empty() => {
            return Err("materialId field is blank".to_string());
        }
        Some(Value::String(own)) if *own != key => {
            return Err(format!("materialId '{own}' does not match key '{key}'"));
        }
        Some(Value::String(_)) => {}
        Some(_) => return Err("materialId field is not a string".to_string()),
    }

    fields.remove("createdAt");
    fields.remove("updatedAt");

    let mut record: MaterialRecord = serde_json::from_value(Value::Object(fields))
        .map_err(|e| format!("document does not fit the material shape: {e}"))?;
    record.created_at = Some(created_at);
    record.updated_at = Some(updated_at);
    Ok(record)
}
