// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Kubernetes access: object store seam, target caches, informers and CRD discovery.

pub mod api;
pub mod cache;
pub mod crd;
pub mod informer;

pub use api::{from_dynamic, get_typed, list_typed, to_dynamic, KubeObjectStore, ObjectStore};
pub use cache::{ensure_caches_in_sync, secret_caches, ReflectorTargetCache, TargetCache};
pub use crd::wait_for_crds;
pub use informer::{InformerFactory, InformerManager, KubeInformerFactory};
