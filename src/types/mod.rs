// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Custom resources read and written by courier.

pub mod binding;
pub mod condition;
pub mod generator;
pub mod store;

pub use binding::SecretBinding;
pub use condition::Condition;
pub use generator::{Fake, GeneratorState, Password, UUID};
pub use store::{ClusterSecretStore, SecretStore};
