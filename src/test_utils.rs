// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Test utilities: a mocked API server, an in-memory object store and fixtures.

use crate::constants::CONTROLLER_FIELD_MANAGER;
use crate::error::{CourierError, Result};
use crate::generators::{Generator, GeneratorContext, GeneratorOutput};
use crate::kubernetes::{InformerFactory, ObjectStore, TargetCache};
use crate::providers::fake::FakeProvider;
use crate::providers::{Provider, ProviderContext, SecretsClient};
use crate::sync::SecretData;
use crate::types::binding::{
    DataRef, ExtractRef, FindName, FindRef, RemoteRef, SecretBindingSpec, StoreKind, StoreRef,
};
use crate::types::generator::{FakeSpec, PasswordSpec};
use crate::types::store::{
    ClusterSecretStoreSpec, ClusterStoreCondition, FakeEntry, FakeProviderSpec, ProviderSpec, SecretStoreSpec,
};
use crate::types::{ClusterSecretStore, Fake, Password, SecretBinding, SecretStore};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use http::{Request, Response};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind, ObjectMeta};
use kube::client::Body;
use kube::{Client, Resource};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::task::JoinHandle;
use tower::Service;

/// A mock HTTP service that returns predefined responses based on request paths.
#[derive(Clone)]
pub struct MockService {
    responses: Arc<Mutex<HashMap<(String, String), (u16, String)>>>,
}

impl MockService {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn on(self, method: &str, path: &str, status: u16, body: &str) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert((method.to_string(), path.to_string()), (status, body.to_string()));
        self
    }

    /// Add a response for GET requests matching the exact path
    pub fn on_get(self, path: &str, status: u16, body: &str) -> Self {
        self.on("GET", path, status, body)
    }

    pub fn on_post(self, path: &str, status: u16, body: &str) -> Self {
        self.on("POST", path, status, body)
    }

    pub fn on_put(self, path: &str, status: u16, body: &str) -> Self {
        self.on("PUT", path, status, body)
    }

    pub fn on_patch(self, path: &str, status: u16, body: &str) -> Self {
        self.on("PATCH", path, status, body)
    }

    /// Build a kube Client from this mock service
    pub fn into_client(self) -> Client {
        Client::new(self, "https://kubernetes.default.svc")
    }

    fn find_response(&self, method: &str, path: &str) -> Option<(u16, String)> {
        let responses = self.responses.lock().unwrap();

        if let Some(resp) = responses.get(&(method.to_string(), path.to_string())) {
            return Some(resp.clone());
        }

        // Prefix match for paths like /api/v1/namespaces/foo
        for ((m, p), resp) in responses.iter() {
            if m == method && path.starts_with(p) {
                return Some(resp.clone());
            }
        }

        None
    }
}

impl Default for MockService {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<Request<Body>> for MockService {
    type Response = Response<Body>;
    type Error = tower::BoxError;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let method = req.method().to_string();
        let path = req.uri().path().to_string();

        let response = self.find_response(&method, &path);

        Box::pin(async move {
            let (status, body) = response.unwrap_or_else(|| (404, not_found_json("resource", &path)));
            Ok(Response::builder()
                .status(status)
                .header("content-type", "application/json")
                .body(Body::from(body.into_bytes()))
                .unwrap())
        })
    }
}

/// Create a 404 not found response
pub fn not_found_json(resource: &str, name: &str) -> String {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "status": "Failure",
        "message": format!("{} \"{}\" not found", resource, name),
        "reason": "NotFound",
        "code": 404
    })
    .to_string()
}

/// apiVersion, kind, namespace ("" when cluster scoped), name
type Key = (String, String, String, String);

/// A field as tracked in managedFields.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Field {
    Data(String),
    Label(String),
    Annotation(String),
    Top(String),
}

#[derive(Debug, Clone)]
struct Entry {
    manager: String,
    operation: String,
    fields: BTreeSet<Field>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    serial: u64,
    writes: usize,
    status_writes: usize,
}

/// Object store keeping everything in memory.
///
/// Tracks uid, resourceVersion, creationTimestamp and managedFields closely
/// enough for the reconciler: optimistic concurrency on replace, Update
/// ownership of changed fields, and server-side apply with conflicts.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

fn key(api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> Key {
    (
        api_version.to_string(),
        kind.to_string(),
        namespace.unwrap_or_default().to_string(),
        name.to_string(),
    )
}

fn resource_key(resource: &ApiResource, namespace: Option<&str>, name: &str) -> Key {
    key(&resource.api_version, &resource.kind, namespace, name)
}

fn object_key(resource: &ApiResource, obj: &DynamicObject) -> Key {
    resource_key(
        resource,
        obj.metadata.namespace.as_deref(),
        obj.metadata.name.as_deref().unwrap_or_default(),
    )
}

fn id(key: &Key) -> String {
    format!("{} {}/{}", key.1, key.2, key.3)
}

fn not_found(key: &Key) -> CourierError {
    CourierError::KubeError(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} not found", id(key)),
        reason: "NotFound".to_string(),
        code: 404,
    }))
}

fn fields(obj: &Value) -> BTreeMap<Field, Value> {
    let mut out = BTreeMap::new();
    let section = |v: Option<&Value>, f: fn(String) -> Field, out: &mut BTreeMap<Field, Value>| {
        for (k, v) in v.and_then(Value::as_object).into_iter().flatten() {
            out.insert(f(k.clone()), v.clone());
        }
    };
    section(obj.get("data"), Field::Data, &mut out);
    section(obj.pointer("/metadata/labels"), Field::Label, &mut out);
    section(obj.pointer("/metadata/annotations"), Field::Annotation, &mut out);
    for (k, v) in obj.as_object().into_iter().flatten() {
        if !matches!(k.as_str(), "apiVersion" | "kind" | "metadata" | "data" | "status") && !v.is_null() {
            out.insert(Field::Top(k.clone()), v.clone());
        }
    }
    out
}

fn set_field(obj: &mut Value, field: &Field, value: Value) {
    match field {
        Field::Data(k) => obj["data"][k.as_str()] = value,
        Field::Label(k) => obj["metadata"]["labels"][k.as_str()] = value,
        Field::Annotation(k) => obj["metadata"]["annotations"][k.as_str()] = value,
        Field::Top(k) => obj[k.as_str()] = value,
    }
}

fn remove_field(obj: &mut Value, field: &Field) {
    let (container, k) = match field {
        Field::Data(k) => (obj.get_mut("data"), k),
        Field::Label(k) => (obj.pointer_mut("/metadata/labels"), k),
        Field::Annotation(k) => (obj.pointer_mut("/metadata/annotations"), k),
        Field::Top(k) => (Some(obj), k),
    };
    if let Some(map) = container.and_then(Value::as_object_mut) {
        map.remove(k);
    }
}

fn parse_fields_v1(v: &Value) -> BTreeSet<Field> {
    let keys = |v: Option<&Value>| -> Vec<String> {
        v.and_then(Value::as_object)
            .into_iter()
            .flatten()
            .filter_map(|(k, _)| k.strip_prefix("f:").map(str::to_string))
            .collect()
    };
    let mut out = BTreeSet::new();
    out.extend(keys(v.get("f:data")).into_iter().map(Field::Data));
    out.extend(keys(v.pointer("/f:metadata/f:labels")).into_iter().map(Field::Label));
    out.extend(keys(v.pointer("/f:metadata/f:annotations")).into_iter().map(Field::Annotation));
    out.extend(
        keys(Some(v))
            .into_iter()
            .filter(|k| k != "data" && k != "metadata")
            .map(Field::Top),
    );
    out
}

fn render_fields_v1(fields: &BTreeSet<Field>) -> Value {
    let mut out = json!({});
    for field in fields {
        match field {
            Field::Data(k) => out["f:data"][format!("f:{}", k)] = json!({}),
            Field::Label(k) => out["f:metadata"]["f:labels"][format!("f:{}", k)] = json!({}),
            Field::Annotation(k) => out["f:metadata"]["f:annotations"][format!("f:{}", k)] = json!({}),
            Field::Top(k) => out[format!("f:{}", k)] = json!({}),
        }
    }
    out
}

fn entries(obj: &Value) -> Vec<Entry> {
    obj.pointer("/metadata/managedFields")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .map(|e| Entry {
            manager: e["manager"].as_str().unwrap_or_default().to_string(),
            operation: e["operation"].as_str().unwrap_or_default().to_string(),
            fields: parse_fields_v1(&e["fieldsV1"]),
        })
        .collect()
}

fn store_entries(obj: &mut Value, entries: Vec<Entry>) {
    let api_version = obj["apiVersion"].clone();
    let rendered: Vec<Value> = entries
        .into_iter()
        .filter(|e| !e.fields.is_empty())
        .map(|e| {
            json!({
                "manager": e.manager,
                "operation": e.operation,
                "apiVersion": api_version,
                "fieldsType": "FieldsV1",
                "fieldsV1": render_fields_v1(&e.fields),
            })
        })
        .collect();
    if rendered.is_empty() {
        if let Some(meta) = obj.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.remove("managedFields");
        }
    } else {
        obj["metadata"]["managedFields"] = Value::Array(rendered);
    }
}

/// Update semantics: `manager` takes the fields it changed away from everyone else.
fn record_update(old: Option<&Value>, new: &mut Value, manager: &str) {
    let old_fields = old.map(fields).unwrap_or_default();
    let new_fields = fields(new);
    let changed: BTreeSet<Field> = new_fields
        .iter()
        .filter(|(f, v)| old_fields.get(*f) != Some(*v))
        .map(|(f, _)| f.clone())
        .collect();
    let mut list = old.map(entries).unwrap_or_default();
    for entry in list.iter_mut() {
        entry.fields.retain(|f| new_fields.contains_key(f));
        if entry.manager != manager {
            entry.fields.retain(|f| !changed.contains(f));
        }
    }
    match list
        .iter_mut()
        .find(|e| e.manager == manager && e.operation == "Update")
    {
        Some(entry) => entry.fields.extend(changed),
        None => list.push(Entry {
            manager: manager.to_string(),
            operation: "Update".to_string(),
            fields: changed,
        }),
    }
    store_entries(new, list);
}

/// Everything but the bookkeeping fields the store itself maintains.
fn content(obj: &Value) -> Value {
    let mut obj = obj.clone();
    if let Some(meta) = obj.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.remove("resourceVersion");
        meta.remove("managedFields");
    }
    obj
}

fn merge_json(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(p) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Some(t) = target.as_object_mut() {
                for (k, v) in p {
                    if v.is_null() {
                        t.remove(k);
                    } else {
                        merge_json(t.entry(k.clone()).or_insert(Value::Null), v);
                    }
                }
            }
        }
        _ => *target = patch.clone(),
    }
}

fn matches_selector(obj: &Value, selector: Option<&str>) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => obj["metadata"]["labels"][k].as_str() == Some(v),
            None => obj["metadata"]["labels"].get(term).is_some(),
        })
}

impl State {
    /// Assign identity and a fresh resourceVersion.
    fn stamp(&mut self, obj: &mut Value, existing: Option<&Value>) {
        self.serial += 1;
        let meta = &mut obj["metadata"];
        let uid = existing
            .and_then(|e| e["metadata"]["uid"].as_str().map(str::to_string))
            .or_else(|| meta["uid"].as_str().map(str::to_string))
            .unwrap_or_else(|| format!("uid-{}", self.serial));
        meta["uid"] = json!(uid);
        if let Some(created) = existing.map(|e| e["metadata"]["creationTimestamp"].clone()) {
            meta["creationTimestamp"] = created;
        }
        if meta["creationTimestamp"].is_null() {
            meta["creationTimestamp"] = json!(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
        }
        if meta["generation"].is_null() {
            meta["generation"] = existing
                .map(|e| e["metadata"]["generation"].clone())
                .filter(|g| !g.is_null())
                .unwrap_or(json!(1));
        }
        meta["resourceVersion"] = json!(self.serial.to_string());
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `obj` as is, keeping the uid of an object it replaces. Not counted as a write.
    pub fn insert<K: Resource<DynamicType = ()> + Serialize>(&self, obj: &K) {
        let mut value = serde_json::to_value(obj).unwrap();
        value["apiVersion"] = json!(K::api_version(&()));
        value["kind"] = json!(K::kind(&()));
        let key = key(
            &K::api_version(&()),
            &K::kind(&()),
            obj.meta().namespace.as_deref(),
            obj.meta().name.as_deref().unwrap_or_default(),
        );
        let mut state = self.state.lock().unwrap();
        let existing = state.objects.get(&key).cloned();
        state.stamp(&mut value, existing.as_ref());
        state.objects.insert(key, value);
    }

    pub fn insert_secret(&self, secret: Secret) {
        self.insert(&secret);
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(&key("v1", "Secret", Some(namespace), name))
            .map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    pub fn remove(&self, resource: &ApiResource, namespace: Option<&str>, name: &str) {
        self.state
            .lock()
            .unwrap()
            .objects
            .remove(&resource_key(resource, namespace, name));
    }

    /// Number of create, replace, apply, patch and delete calls
    pub fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    pub fn status_writes(&self) -> usize {
        self.state.lock().unwrap().status_writes
    }

    fn to_value(resource: &ApiResource, obj: &DynamicObject) -> Result<Value> {
        let mut value = serde_json::to_value(obj)?;
        value["apiVersion"] = json!(resource.api_version);
        value["kind"] = json!(resource.kind);
        Ok(value)
    }

    /// Store `value` over `existing`, bumping the resourceVersion only when the content changed.
    fn commit(state: &mut State, key: Key, mut value: Value, existing: &Value) -> Result<DynamicObject> {
        if content(&value) == content(existing) {
            value["metadata"]["resourceVersion"] = existing["metadata"]["resourceVersion"].clone();
        } else {
            state.stamp(&mut value, Some(existing));
        }
        state.objects.insert(key, value.clone());
        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn get(&self, resource: &ApiResource, namespace: Option<&str>, name: &str) -> Result<Option<DynamicObject>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .objects
            .get(&resource_key(resource, namespace, name))
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()?)
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>> {
        let state = self.state.lock().unwrap();
        let mut out = Vec::new();
        for ((api_version, kind, ns, _), value) in &state.objects {
            if *api_version != resource.api_version || *kind != resource.kind {
                continue;
            }
            if namespace.is_some_and(|n| n != ns.as_str()) || !matches_selector(value, label_selector) {
                continue;
            }
            out.push(serde_json::from_value(value.clone())?);
        }
        Ok(out)
    }

    async fn create(&self, resource: &ApiResource, obj: &DynamicObject, field_manager: &str) -> Result<DynamicObject> {
        let key = object_key(resource, obj);
        let mut value = Self::to_value(resource, obj)?;
        let mut state = self.state.lock().unwrap();
        state.writes += 1;
        if state.objects.contains_key(&key) {
            return Err(CourierError::Conflict(format!("{} already exists", id(&key))));
        }
        record_update(None, &mut value, field_manager);
        state.stamp(&mut value, None);
        state.objects.insert(key, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    async fn replace(&self, resource: &ApiResource, obj: &DynamicObject, field_manager: &str) -> Result<DynamicObject> {
        let key = object_key(resource, obj);
        let mut value = Self::to_value(resource, obj)?;
        let mut state = self.state.lock().unwrap();
        state.writes += 1;
        let existing = state.objects.get(&key).cloned().ok_or_else(|| not_found(&key))?;
        if let Some(version) = &obj.metadata.resource_version {
            if existing["metadata"]["resourceVersion"].as_str() != Some(version.as_str()) {
                return Err(CourierError::Conflict(id(&key)));
            }
        }
        if let Some(status) = existing.get("status") {
            value["status"] = status.clone();
        }
        record_update(Some(&existing), &mut value, field_manager);
        Self::commit(&mut state, key, value, &existing)
    }

    async fn apply(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
        field_manager: &str,
        force: bool,
    ) -> Result<DynamicObject> {
        let key = object_key(resource, obj);
        let config = Self::to_value(resource, obj)?;
        let applied = fields(&config);
        let mut state = self.state.lock().unwrap();
        state.writes += 1;

        let Some(existing) = state.objects.get(&key).cloned() else {
            let mut value = config;
            store_entries(
                &mut value,
                vec![Entry {
                    manager: field_manager.to_string(),
                    operation: "Apply".to_string(),
                    fields: applied.keys().cloned().collect(),
                }],
            );
            state.stamp(&mut value, None);
            state.objects.insert(key, value.clone());
            return Ok(serde_json::from_value(value)?);
        };

        let mut list = entries(&existing);
        let current = fields(&existing);
        let conflicts: BTreeSet<Field> = applied
            .iter()
            .filter(|(field, value)| {
                current.get(*field) != Some(*value)
                    && list
                        .iter()
                        .any(|e| e.manager != field_manager && e.fields.contains(*field))
            })
            .map(|(field, _)| field.clone())
            .collect();
        if !conflicts.is_empty() {
            if !force {
                return Err(CourierError::Conflict(format!(
                    "{}: fields {:?} are held by other managers",
                    id(&key),
                    conflicts
                )));
            }
            for entry in list.iter_mut().filter(|e| e.manager != field_manager) {
                entry.fields.retain(|f| !conflicts.contains(f));
            }
        }

        let is_ours = |e: &Entry| e.manager == field_manager && e.operation == "Apply";
        let previous: BTreeSet<Field> = list
            .iter()
            .filter(|e| is_ours(e))
            .flat_map(|e| e.fields.iter().cloned())
            .collect();
        let mut value = existing.clone();
        for field in previous.iter().filter(|f| !applied.contains_key(*f)) {
            let held = list.iter().any(|e| !is_ours(e) && e.fields.contains(field));
            if !held {
                remove_field(&mut value, field);
            }
        }
        for (field, v) in &applied {
            set_field(&mut value, field, v.clone());
        }

        list.retain(|e| !is_ours(e));
        list.push(Entry {
            manager: field_manager.to_string(),
            operation: "Apply".to_string(),
            fields: applied.keys().cloned().collect(),
        });
        let remaining = fields(&value);
        for entry in list.iter_mut() {
            entry.fields.retain(|f| remaining.contains_key(f));
        }
        store_entries(&mut value, list);
        Self::commit(&mut state, key, value, &existing)
    }

    async fn merge_patch(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<DynamicObject> {
        let key = resource_key(resource, namespace, name);
        let mut state = self.state.lock().unwrap();
        state.writes += 1;
        let existing = state.objects.get(&key).cloned().ok_or_else(|| not_found(&key))?;
        let mut value = existing.clone();
        merge_json(&mut value, patch);
        record_update(Some(&existing), &mut value, CONTROLLER_FIELD_MANAGER);
        Self::commit(&mut state, key, value, &existing)
    }

    async fn patch_status(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<()> {
        let key = resource_key(resource, namespace, name);
        let mut state = self.state.lock().unwrap();
        state.status_writes += 1;
        let existing = state.objects.get(&key).cloned().ok_or_else(|| not_found(&key))?;
        let mut value = existing.clone();
        if let Some(status) = patch.get("status") {
            merge_json(&mut value, &json!({ "status": status }));
        }
        Self::commit(&mut state, key, value, &existing)?;
        Ok(())
    }

    async fn delete(&self, resource: &ApiResource, namespace: Option<&str>, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.writes += 1;
        state.objects.remove(&resource_key(resource, namespace, name));
        Ok(())
    }
}

/// Target cache reading Secrets straight from an `InMemoryStore`.
pub struct MirrorCache {
    objects: Arc<InMemoryStore>,
    desync: AtomicBool,
}

impl MirrorCache {
    pub fn new(objects: Arc<InMemoryStore>) -> Self {
        Self {
            objects,
            desync: AtomicBool::new(false),
        }
    }

    /// Make the full cache lag behind the metadata cache.
    pub fn set_desync(&self, desync: bool) {
        self.desync.store(desync, Ordering::Relaxed);
    }
}

impl TargetCache for MirrorCache {
    fn metadata(&self, namespace: &str, name: &str) -> Option<ObjectMeta> {
        self.objects.secret(namespace, name).map(|s| s.metadata)
    }

    fn full(&self, namespace: &str, name: &str) -> Option<Secret> {
        let mut secret = self.objects.secret(namespace, name)?;
        let managed = secret
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(crate::constants::labels::MANAGED))
            .is_some_and(|v| v == crate::constants::labels::MANAGED_VALUE);
        if !managed {
            return None;
        }
        if self.desync.load(Ordering::Relaxed) {
            secret.metadata.resource_version = Some("0".to_string());
        }
        Some(secret)
    }
}

/// Informer factory whose watches do nothing.
pub struct StaticInformerFactory;

#[async_trait]
impl InformerFactory for StaticInformerFactory {
    async fn start(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, JoinHandle<()>)> {
        Ok((ApiResource::from_gvk(gvk), tokio::spawn(futures::future::pending::<()>())))
    }
}

/// Fake provider counting the clients it creates and closes.
#[derive(Default)]
pub struct CountingProvider {
    created: AtomicUsize,
    closed: Arc<AtomicUsize>,
}

impl CountingProvider {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for CountingProvider {
    fn validate(&self, store: &SecretStoreSpec) -> Result<()> {
        FakeProvider.validate(store)
    }

    async fn new_client(&self, ctx: ProviderContext<'_>) -> Result<Arc<dyn SecretsClient>> {
        let inner = FakeProvider.new_client(ctx).await?;
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(CountingClient {
            inner,
            closed: self.closed.clone(),
        }))
    }
}

struct CountingClient {
    inner: Arc<dyn SecretsClient>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl SecretsClient for CountingClient {
    async fn get_secret(&self, remote: &RemoteRef) -> Result<Vec<u8>> {
        self.inner.get_secret(remote).await
    }

    async fn get_secret_map(&self, extract: &ExtractRef) -> Result<SecretData> {
        self.inner.get_secret_map(extract).await
    }

    async fn get_all_secrets(&self, find: &FindRef) -> Result<SecretData> {
        self.inner.get_all_secrets(find).await
    }

    async fn close(&self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.inner.close().await
    }
}

/// Generator echoing its spec as state and recording every cleanup.
#[derive(Default)]
pub struct RecordingGenerator {
    cleaned: Mutex<Vec<Value>>,
}

impl RecordingGenerator {
    pub fn cleaned_up(&self) -> Vec<Value> {
        self.cleaned.lock().unwrap().clone()
    }
}

#[async_trait]
impl Generator for RecordingGenerator {
    async fn generate(&self, spec: &Value, _ctx: &GeneratorContext<'_>) -> Result<GeneratorOutput> {
        Ok(GeneratorOutput {
            data: SecretData::new(),
            state: Some(spec.clone()),
        })
    }

    async fn cleanup(&self, _spec: &Value, state: &Value, _ctx: &GeneratorContext<'_>) -> Result<()> {
        self.cleaned.lock().unwrap().push(state.clone());
        Ok(())
    }
}

fn meta(namespace: Option<&str>, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        ..Default::default()
    }
}

pub fn make_secret(namespace: &str, name: &str, data: &[(&str, &str)], labels: &[(&str, &str)]) -> Secret {
    let mut metadata = meta(Some(namespace), name);
    if !labels.is_empty() {
        metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
    }
    Secret {
        metadata,
        data: Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Default::default()
    }
}

fn fake_spec(entries: &[(&str, &str)]) -> SecretStoreSpec {
    SecretStoreSpec {
        controller: None,
        provider: ProviderSpec {
            fake: Some(FakeProviderSpec {
                data: entries
                    .iter()
                    .map(|(k, v)| FakeEntry {
                        key: k.to_string(),
                        value: v.to_string(),
                        version: None,
                    })
                    .collect(),
            }),
            kubernetes: None,
        },
    }
}

/// SecretStore backed by the fake provider serving `entries`
pub fn fake_store(namespace: &str, name: &str, entries: &[(&str, &str)]) -> SecretStore {
    SecretStore {
        metadata: meta(Some(namespace), name),
        spec: fake_spec(entries),
        status: None,
    }
}

pub fn cluster_store(name: &str, namespaces: &[&str], regexes: &[&str]) -> ClusterSecretStore {
    ClusterSecretStore {
        metadata: meta(None, name),
        spec: ClusterSecretStoreSpec {
            store: fake_spec(&[]),
            conditions: vec![ClusterStoreCondition {
                namespaces: namespaces.iter().map(|s| s.to_string()).collect(),
                namespace_regexes: regexes.iter().map(|s| s.to_string()).collect(),
            }],
        },
        status: None,
    }
}

pub fn password_generator(namespace: &str, name: &str, class: Option<&str>) -> Password {
    Password {
        metadata: meta(Some(namespace), name),
        spec: PasswordSpec {
            controller: class.map(str::to_string),
            length: 16,
            ..Default::default()
        },
    }
}

pub fn fake_generator(namespace: &str, name: &str, data: &[(&str, &str)], stateful: bool) -> Fake {
    Fake {
        metadata: meta(Some(namespace), name),
        spec: FakeSpec {
            controller: None,
            data: data.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            stateful,
        },
    }
}

/// Binding using the SecretStore `vault` by default, without data references.
pub fn binding(namespace: &str, name: &str) -> SecretBinding {
    let mut metadata = meta(Some(namespace), name);
    metadata.generation = Some(1);
    SecretBinding {
        metadata,
        spec: SecretBindingSpec {
            secret_store_ref: Some(StoreRef {
                name: "vault".to_string(),
                kind: StoreKind::SecretStore,
            }),
            ..Default::default()
        },
        status: None,
    }
}

pub fn data_ref(secret_key: &str, key: &str, property: Option<&str>) -> DataRef {
    DataRef {
        secret_key: secret_key.to_string(),
        remote_ref: RemoteRef {
            key: key.to_string(),
            property: property.map(str::to_string),
            ..Default::default()
        },
        source_ref: None,
    }
}

pub fn find_all(regexp: &str) -> FindRef {
    FindRef {
        name: Some(FindName {
            regexp: regexp.to_string(),
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret_resource() -> ApiResource {
        ApiResource::erase::<Secret>(&())
    }

    fn dynamic(secret: &Secret) -> DynamicObject {
        crate::kubernetes::to_dynamic(secret).unwrap()
    }

    #[tokio::test]
    async fn test_reinsert_keeps_uid_and_bumps_version() {
        let store = InMemoryStore::new();
        store.insert_secret(make_secret("apps", "db", &[("a", "1")], &[]));
        let first = store.secret("apps", "db").unwrap();
        store.insert_secret(make_secret("apps", "db", &[("a", "2")], &[]));
        let second = store.secret("apps", "db").unwrap();

        assert_eq!(first.metadata.uid, second.metadata.uid);
        assert_ne!(first.metadata.resource_version, second.metadata.resource_version);
    }

    #[tokio::test]
    async fn test_replace_with_stale_version_conflicts() {
        let store = InMemoryStore::new();
        store.insert_secret(make_secret("apps", "db", &[("a", "1")], &[]));
        let mut stale = store.secret("apps", "db").unwrap();
        stale.metadata.resource_version = Some("999".to_string());

        let err = store.replace(&secret_resource(), &dynamic(&stale), "me").await.unwrap_err();
        assert!(matches!(err, CourierError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_apply_conflicts_on_foreign_field_unless_forced() {
        let store = InMemoryStore::new();
        let created = make_secret("apps", "db", &[("a", "1")], &[]);
        store.create(&secret_resource(), &dynamic(&created), "other").await.unwrap();

        let config = make_secret("apps", "db", &[("a", "2"), ("b", "x")], &[]);
        let err = store.apply(&secret_resource(), &dynamic(&config), "me", false).await.unwrap_err();
        assert!(matches!(err, CourierError::Conflict(_)));

        store.apply(&secret_resource(), &dynamic(&config), "me", true).await.unwrap();
        let data = store.secret("apps", "db").unwrap().data.unwrap();
        assert_eq!(data["a"].0, b"2".to_vec());
        assert_eq!(data["b"].0, b"x".to_vec());
    }

    #[tokio::test]
    async fn test_apply_removes_fields_dropped_from_config() {
        let store = InMemoryStore::new();
        store.insert_secret(make_secret("apps", "db", &[("keep", "1")], &[]));
        let config = make_secret("apps", "db", &[("x", "1"), ("y", "2")], &[]);
        store.apply(&secret_resource(), &dynamic(&config), "me", false).await.unwrap();

        let config = make_secret("apps", "db", &[("x", "1")], &[]);
        store.apply(&secret_resource(), &dynamic(&config), "me", false).await.unwrap();
        let data = store.secret("apps", "db").unwrap().data.unwrap();
        assert_eq!(data.keys().collect::<Vec<_>>(), vec!["keep", "x"]);

        let version = store.secret("apps", "db").unwrap().metadata.resource_version;
        store.apply(&secret_resource(), &dynamic(&config), "me", false).await.unwrap();
        assert_eq!(store.secret("apps", "db").unwrap().metadata.resource_version, version);
    }

    #[tokio::test]
    async fn test_list_by_label_selector() {
        let store = InMemoryStore::new();
        store.insert_secret(make_secret("apps", "a", &[], &[("team", "x"), ("tier", "db")]));
        store.insert_secret(make_secret("apps", "b", &[], &[("team", "y")]));
        store.insert_secret(make_secret("other", "c", &[], &[("team", "x")]));

        let found = store
            .list(&secret_resource(), Some("apps"), Some("team=x,tier=db"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].metadata.name.as_deref(), Some("a"));
        assert_eq!(store.list(&secret_resource(), None, Some("team=x")).await.unwrap().len(), 2);
    }
}
