// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Binding status writes.

use crate::constants::conditions;
use crate::error::{CourierError, Result};
use crate::kubernetes::ObjectStore;
use crate::types::binding::SecretBindingStatus;
use crate::types::condition::{set_condition, Condition};
use crate::types::SecretBinding;
use kube::api::ApiResource;
use kube::ResourceExt;
use serde_json::json;

/// Condition reason a failed pass is reported with.
pub fn failure_reason(err: &CourierError) -> &'static str {
    match err {
        CourierError::StoreNotFound(_) => conditions::REASON_STORE_NOT_FOUND,
        CourierError::StoreNotReady(_) => conditions::REASON_STORE_NOT_READY,
        CourierError::TargetMissing(_) => conditions::REASON_MISSING,
        CourierError::AlreadyOwned { .. } => conditions::REASON_ALREADY_OWNED,
        CourierError::Immutable(_) => conditions::REASON_IMMUTABLE,
        CourierError::MissingDefaultStore(_)
        | CourierError::InvalidBinding(_)
        | CourierError::InvalidStore(_)
        | CourierError::InvalidDuration(_) => conditions::REASON_CONFIG_ERROR,
        _ => conditions::REASON_SYNC_ERROR,
    }
}

/// The binding's current status with `condition` set.
pub fn with_condition(binding: &SecretBinding, condition: Condition, now: &str) -> SecretBindingStatus {
    let mut status = binding.status.clone().unwrap_or_default();
    set_condition(&mut status.conditions, condition, now);
    status
}

/// Merge `status` into the binding. Nothing is written when the binding
/// already carries exactly this status.
pub async fn write_status(
    objects: &dyn ObjectStore,
    binding: &SecretBinding,
    status: &SecretBindingStatus,
) -> Result<bool> {
    if binding.status.as_ref() == Some(status) {
        return Ok(false);
    }
    objects
        .patch_status(
            &ApiResource::erase::<SecretBinding>(&()),
            binding.namespace().as_deref(),
            &binding.name_any(),
            &json!({ "status": status }),
        )
        .await?;
    Ok(true)
}
