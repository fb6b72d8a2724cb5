// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Prints the CustomResourceDefinitions served by courier as a multi-document YAML stream.
//!
//! ```bash
//! cargo run --bin crdgen | kubectl apply -f -
//! ```

use courier::types::{ClusterSecretStore, Fake, GeneratorState, Password, SecretBinding, SecretStore, UUID};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let crds = [
        SecretBinding::crd(),
        SecretStore::crd(),
        ClusterSecretStore::crd(),
        Password::crd(),
        UUID::crd(),
        Fake::crd(),
        GeneratorState::crd(),
    ];
    for crd in crds {
        print!("---\n{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
