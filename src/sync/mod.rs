// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Everything between a binding and its target: backend clients, data
//! aggregation, templating and the final write.

pub mod aggregate;
pub mod clients;
pub mod hash;
pub mod mutate;
pub mod ownership;
pub mod rewrite;
pub mod target;
pub mod template;

pub use aggregate::{aggregate, Aggregated};
pub use clients::{ClientManager, StoreClient};
pub use mutate::{MutationOutcome, Mutator};
pub use target::{SecretData, Target, TargetKind};
pub use template::TemplateEngine;
