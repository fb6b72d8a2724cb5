// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

/// API group of the courier resources
pub const API_GROUP: &str = "courier.geeko.me";

/// API group of the generator resources
pub const GENERATOR_API_GROUP: &str = "generators.courier.geeko.me";

/// Kubernetes label keys used by courier
pub mod labels {
    /// Marks a target as written by courier; value must be `MANAGED_VALUE`
    pub const MANAGED: &str = "courier.geeko.me/managed";
    pub const MANAGED_VALUE: &str = "true";
    /// Hash of `<namespace>/<binding>` for targets created under the Owner policy
    pub const OWNER: &str = "courier.geeko.me/owner";
    /// Hash of `<namespace>/<binding>` owning a generator state
    pub const STATE_OWNER: &str = "generators.courier.geeko.me/owner";
    /// Data reference index a generator state belongs to
    pub const STATE_KEY: &str = "generators.courier.geeko.me/state-key";
}

/// Kubernetes annotation keys used by courier
pub mod annotations {
    /// Hash of the target payload at the time courier last wrote it
    pub const DATA_HASH: &str = "courier.geeko.me/data-hash";
    /// Never copied from a binding onto its target
    pub const LAST_APPLIED: &str = "kubectl.kubernetes.io/last-applied-configuration";
}

/// Prefix of the per-binding field manager, see `field_manager_for`
pub const FIELD_MANAGER_PREFIX: &str = "secretbindings.courier.geeko.me";

/// Field manager used for the managed-label patch and status writes
pub const CONTROLLER_FIELD_MANAGER: &str = "courier-controller";

/// Field manager that owns the fields a given binding writes to its target.
pub fn field_manager_for(binding_name: &str) -> String {
    format!("{}/{}", FIELD_MANAGER_PREFIX, binding_name)
}

/// Condition types and reasons reported on a binding
pub mod conditions {
    pub const READY: &str = "Ready";

    pub const REASON_SYNCED: &str = "SecretSynced";
    pub const REASON_SYNC_ERROR: &str = "SecretSyncedError";
    pub const REASON_DELETED: &str = "SecretDeleted";
    pub const REASON_MISSING: &str = "SecretMissing";
    pub const REASON_ALREADY_OWNED: &str = "SecretAlreadyOwned";
    pub const REASON_IMMUTABLE: &str = "SecretImmutable";
    pub const REASON_STORE_NOT_FOUND: &str = "StoreNotFound";
    pub const REASON_STORE_NOT_READY: &str = "StoreNotReady";
    pub const REASON_CONFIG_ERROR: &str = "ConfigError";

    /// Every reason a failed sync can be reported with
    pub const FAILURE_REASONS: [&str; 7] = [
        REASON_SYNC_ERROR,
        REASON_MISSING,
        REASON_ALREADY_OWNED,
        REASON_IMMUTABLE,
        REASON_STORE_NOT_FOUND,
        REASON_STORE_NOT_READY,
        REASON_CONFIG_ERROR,
    ];
}

/// Default refresh interval of a binding
pub const DEFAULT_REFRESH_INTERVAL: &str = "1h";

/// Longest refresh interval a binding may request (one year)
pub const MAX_REFRESH_INTERVAL_SECS: u64 = 365 * 24 * 3600;

/// CRD polling configuration
pub mod crd {
    /// Initial polling interval in seconds when waiting for CRD
    pub const POLL_INTERVAL_SECS: u64 = 10;
    /// Maximum polling interval in seconds (exponential backoff cap)
    pub const POLL_MAX_INTERVAL_SECS: u64 = 60;
}
