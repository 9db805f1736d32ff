#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use msvc_operator::controller::{
    Reconciler, ReconcilerSettings, Removal, RetryBackoff, StoreClient,
    StoreError, StoreObject,
};
use msvc_operator::crd::microservice::{
    MicroService, MicroServiceSpec, MicroServiceStatus,
};
use serde_json::Value;

pub const NS: &str = "default";

// DNS-1123 safe suffix for unique names
pub const ALPHABET: [char; 16] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e',
    'f',
];
pub fn uniq(prefix: &str) -> String {
    format!("{prefix}-{}", nanoid::nanoid!(6, &ALPHABET))
}

/// One request the reconciler made against the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub verb: &'static str,
    pub kind: String,
    pub name: String,
}

impl Call {
    pub fn new(verb: &'static str, kind: &str, name: &str) -> Self {
        Self {
            verb,
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    pub fn is_mutation(&self) -> bool {
        self.verb != "get"
    }
}

struct Fault {
    verb: &'static str,
    kind: String,
    error: StoreError,
    remaining: usize,
}

type Key = (String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    calls: Vec<Call>,
    version: u64,
    uids: u64,
    faults: Vec<Fault>,
    stalls: Vec<(&'static str, String)>,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn next_uid(&mut self) -> String {
        self.uids += 1;
        format!("uid-{}", self.uids)
    }

    /// Record the call and fire a matching injected fault, if any.
    fn enter(&mut self, verb: &'static str, kind: &str, name: &str) -> Result<(), StoreError> {
        self.calls.push(Call::new(verb, kind, name));
        let fault = self
            .faults
            .iter_mut()
            .find(|f| f.verb == verb && f.kind == kind && f.remaining > 0);
        match fault {
            Some(f) => {
                f.remaining -= 1;
                Err(f.error.clone())
            }
            None => Ok(()),
        }
    }

    /// Stamp identity fields the API server owns onto a new object.
    fn admit(&mut self, obj: &mut Value) {
        if meta_str(obj, "uid").is_none() {
            let uid = self.next_uid();
            set_meta(obj, "uid", Value::from(uid));
        }
        let rv = self.next_version();
        set_meta(obj, "resourceVersion", Value::from(rv));
        set_meta(obj, "generation", Value::from(1));
        set_meta(
            obj,
            "creationTimestamp",
            Value::from("2024-01-01T00:00:00Z"),
        );
    }

    /// Apply a full update on top of `old`, keeping server-owned fields.
    fn update(&mut self, key: &Key, old: &Value, mut new: Value) {
        for field in ["uid", "creationTimestamp", "deletionTimestamp"] {
            match old.get("metadata").and_then(|m| m.get(field)) {
                Some(v) => set_meta(&mut new, field, v.clone()),
                None => remove_meta(&mut new, field),
            }
        }
        let generation = old
            .get("metadata")
            .and_then(|m| m.get("generation"))
            .and_then(Value::as_i64)
            .unwrap_or(1);
        let bumped = if old.get("spec") != new.get("spec") {
            generation + 1
        } else {
            generation
        };
        set_meta(&mut new, "generation", Value::from(bumped));
        if let Some(obj) = new.as_object_mut() {
            match old.get("status") {
                Some(status) => {
                    obj.insert("status".into(), status.clone());
                }
                None => {
                    obj.remove("status");
                }
            }
        }
        let rv = self.next_version();
        set_meta(&mut new, "resourceVersion", Value::from(rv));
        if meta_str(&new, "deletionTimestamp").is_some() && !has_finalizers(&new) {
            self.objects.remove(key);
        } else {
            self.objects.insert(key.clone(), new);
        }
    }
}

fn meta_str<'a>(obj: &'a Value, field: &str) -> Option<&'a str> {
    obj.get("metadata")?.get(field)?.as_str()
}

fn set_meta(obj: &mut Value, field: &str, value: Value) {
    if let Some(meta) = obj.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.insert(field.to_string(), value);
    }
}

fn remove_meta(obj: &mut Value, field: &str) {
    if let Some(meta) = obj.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.remove(field);
    }
}

fn has_finalizers(obj: &Value) -> bool {
    obj.get("metadata")
        .and_then(|m| m.get("finalizers"))
        .and_then(Value::as_array)
        .is_some_and(|f| !f.is_empty())
}

fn kind_of<K: StoreObject>() -> String {
    K::kind(&()).to_string()
}

fn key(kind: &str, ns: &str, name: &str) -> Key {
    (kind.to_string(), ns.to_string(), name.to_string())
}

fn to_value<K: StoreObject>(obj: &K) -> Value {
    serde_json::to_value(obj).expect("serializable object")
}

fn from_value<K: StoreObject>(v: Value) -> K {
    serde_json::from_value(v).expect("stored object deserializes")
}

/// In-memory object store with API-server semantics the reconciler relies
/// on: resource-version preconditions, generation bumps on spec change,
/// finalizer-held deletion and a status subresource.
#[derive(Clone, Default)]
pub struct FakeStore {
    state: Arc<Mutex<State>>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("fake store lock")
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn mutations(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_mutation).collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Make the next `times` calls of `verb` on `kind` fail with `error`.
    pub fn fail(&self, verb: &'static str, kind: &str, error: StoreError, times: usize) {
        self.lock().faults.push(Fault {
            verb,
            kind: kind.to_string(),
            error,
            remaining: times,
        });
    }

    /// Make every `verb` call on `kind` hang until the caller gives up.
    pub fn stall(&self, verb: &'static str, kind: &str) {
        self.lock().stalls.push((verb, kind.to_string()));
    }

    /// Park forever if `verb` on `kind` is stalled. The lock is released
    /// before parking.
    async fn hold(&self, verb: &'static str, kind: &str) {
        let stalled = self
            .lock()
            .stalls
            .iter()
            .any(|(v, k)| *v == verb && k == kind);
        if stalled {
            std::future::pending::<()>().await;
        }
    }

    /// Put an object in place as some other writer would, without logging a call.
    pub fn insert<K: StoreObject>(&self, obj: &K) -> K {
        let mut v = to_value(obj);
        let mut state = self.lock();
        state.admit(&mut v);
        let name = meta_str(&v, "name").unwrap_or_default().to_string();
        let ns = meta_str(&v, "namespace").unwrap_or(NS).to_string();
        state.objects.insert(key(&kind_of::<K>(), &ns, &name), v.clone());
        from_value(v)
    }

    pub fn read<K: StoreObject>(&self, ns: &str, name: &str) -> Option<K> {
        self.lock()
            .objects
            .get(&key(&kind_of::<K>(), ns, name))
            .cloned()
            .map(from_value)
    }

    pub fn contains<K: StoreObject>(&self, ns: &str, name: &str) -> bool {
        self.read::<K>(ns, name).is_some()
    }

    /// External edit of a stored object; no call is logged.
    pub fn modify<K: StoreObject>(&self, ns: &str, name: &str, f: impl FnOnce(&mut K)) {
        let k = key(&kind_of::<K>(), ns, name);
        let mut state = self.lock();
        let Some(old) = state.objects.get(&k).cloned() else {
            panic!("{k:?} not stored");
        };
        let mut obj: K = from_value(old.clone());
        f(&mut obj);
        let new = to_value(&obj);
        state.update(&k, &old, new);
    }

    pub fn remove<K: StoreObject>(&self, ns: &str, name: &str) {
        self.lock().objects.remove(&key(&kind_of::<K>(), ns, name));
    }

    pub fn seed_microservice(&self, name: &str, image: &str, host: &str) -> MicroService {
        let mut ms = MicroService::new(
            name,
            MicroServiceSpec {
                image: image.to_string(),
                host: host.to_string(),
                secret: None,
            },
        );
        ms.metadata.namespace = Some(NS.to_string());
        self.insert(&ms)
    }

    pub fn microservice(&self, name: &str) -> Option<MicroService> {
        self.read::<MicroService>(NS, name)
    }
}

#[async_trait]
impl StoreClient for FakeStore {
    async fn get<K: StoreObject>(&self, ns: &str, name: &str) -> Result<Option<K>, StoreError> {
        let kind = kind_of::<K>();
        self.hold("get", &kind).await;
        let mut state = self.lock();
        state.enter("get", &kind, name)?;
        Ok(state.objects.get(&key(&kind, ns, name)).cloned().map(from_value))
    }

    async fn create<K: StoreObject>(&self, ns: &str, obj: &K) -> Result<K, StoreError> {
        let kind = kind_of::<K>();
        self.hold("create", &kind).await;
        let name = obj.meta().name.clone().unwrap_or_default();
        let mut state = self.lock();
        state.enter("create", &kind, &name)?;
        let k = key(&kind, ns, &name);
        if state.objects.contains_key(&k) {
            return Err(StoreError::Conflict(format!(
                "{kind} {name} already exists (AlreadyExists)"
            )));
        }
        let mut v = to_value(obj);
        set_meta(&mut v, "namespace", Value::from(ns));
        remove_meta(&mut v, "uid");
        if let Some(o) = v.as_object_mut() {
            o.remove("status");
        }
        state.admit(&mut v);
        state.objects.insert(k, v.clone());
        Ok(from_value(v))
    }

    async fn replace<K: StoreObject>(&self, ns: &str, obj: &K) -> Result<K, StoreError> {
        let kind = kind_of::<K>();
        self.hold("replace", &kind).await;
        let name = obj.meta().name.clone().unwrap_or_default();
        let mut state = self.lock();
        state.enter("replace", &kind, &name)?;
        let k = key(&kind, ns, &name);
        let Some(old) = state.objects.get(&k).cloned() else {
            return Err(StoreError::NotFound(format!("{kind} {name} (NotFound)")));
        };
        if meta_str(&old, "resourceVersion") != obj.meta().resource_version.as_deref() {
            return Err(StoreError::Conflict(format!(
                "{kind} {name} was modified (Conflict)"
            )));
        }
        state.update(&k, &old, to_value(obj));
        let stored = state.objects.get(&k).cloned().unwrap_or_else(|| to_value(obj));
        Ok(from_value(stored))
    }

    async fn delete<K: StoreObject>(&self, ns: &str, name: &str) -> Result<Removal, StoreError> {
        let kind = kind_of::<K>();
        self.hold("delete", &kind).await;
        let mut state = self.lock();
        state.enter("delete", &kind, name)?;
        let k = key(&kind, ns, name);
        let Some(mut obj) = state.objects.get(&k).cloned() else {
            return Ok(Removal::Absent);
        };
        if !has_finalizers(&obj) {
            state.objects.remove(&k);
            return Ok(Removal::Deleted);
        }
        if meta_str(&obj, "deletionTimestamp").is_none() {
            let now = serde_json::to_value(Time(chrono::Utc::now())).expect("time");
            set_meta(&mut obj, "deletionTimestamp", now);
            let rv = state.next_version();
            set_meta(&mut obj, "resourceVersion", Value::from(rv));
            state.objects.insert(k, obj);
        }
        Ok(Removal::Pending)
    }

    async fn update_status(
        &self,
        ns: &str,
        name: &str,
        status: &MicroServiceStatus,
    ) -> Result<MicroService, StoreError> {
        self.hold("update_status", "MicroService").await;
        let mut state = self.lock();
        state.enter("update_status", "MicroService", name)?;
        let k = key("MicroService", ns, name);
        let Some(mut obj) = state.objects.get(&k).cloned() else {
            return Err(StoreError::NotFound(format!("MicroService {name} (NotFound)")));
        };
        if let Some(o) = obj.as_object_mut() {
            o.insert(
                "status".into(),
                serde_json::to_value(status).expect("status serializes"),
            );
        }
        let rv = state.next_version();
        set_meta(&mut obj, "resourceVersion", Value::from(rv));
        state.objects.insert(k, obj.clone());
        Ok(from_value(obj))
    }
}

pub fn reconciler(store: &FakeStore) -> Reconciler<FakeStore> {
    reconciler_with(store, ReconcilerSettings::default())
}

pub fn reconciler_with(
    store: &FakeStore,
    settings: ReconcilerSettings,
) -> Reconciler<FakeStore> {
    Reconciler::new(store.clone(), settings, RetryBackoff::default())
}
