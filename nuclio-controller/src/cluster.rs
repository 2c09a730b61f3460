use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    Api, Client, Resource,
    api::{DeleteParams, ListParams, PostParams},
};
use serde::{Serialize, de::DeserializeOwned};

use crate::MANAGER;

/// Namespaced Kubernetes resource the controller reads or writes.
pub(crate) trait ClusterResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> ClusterResource for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// The subset of the Kubernetes API used by the operators.
///
/// An empty `namespace` passed to [`ClusterClient::list`] lists across all namespaces.
#[async_trait]
pub(crate) trait ClusterClient: Send + Sync + 'static {
    async fn get<K: ClusterResource>(&self, namespace: &str, name: &str) -> kube::Result<K>;

    async fn list<K: ClusterResource>(
        &self,
        namespace: &str,
        params: &ListParams,
    ) -> kube::Result<Vec<K>>;

    async fn create<K: ClusterResource>(&self, namespace: &str, object: &K) -> kube::Result<K>;

    /// Replace the object, failing with a conflict if its `resourceVersion` is outdated.
    async fn replace<K: ClusterResource>(
        &self,
        namespace: &str,
        name: &str,
        object: &K,
    ) -> kube::Result<K>;

    /// Replace the status sub-resource of the object.
    async fn replace_status<K: ClusterResource>(
        &self,
        namespace: &str,
        name: &str,
        object: &K,
    ) -> kube::Result<K>;

    async fn delete<K: ClusterResource>(&self, namespace: &str, name: &str) -> kube::Result<()>;
}

/// [`ClusterClient`] backed by the Kubernetes API server.
#[derive(Clone)]
pub(crate) struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K: ClusterResource>(&self, namespace: &str) -> Api<K> {
        if namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), namespace)
        }
    }

    fn post_params() -> PostParams {
        let mut pp = PostParams::default();
        pp.field_manager = Some(MANAGER.to_string());
        pp
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get<K: ClusterResource>(&self, namespace: &str, name: &str) -> kube::Result<K> {
        self.api::<K>(namespace).get(name).await
    }

    async fn list<K: ClusterResource>(
        &self,
        namespace: &str,
        params: &ListParams,
    ) -> kube::Result<Vec<K>> {
        Ok(self.api::<K>(namespace).list(params).await?.items)
    }

    async fn create<K: ClusterResource>(&self, namespace: &str, object: &K) -> kube::Result<K> {
        self.api::<K>(namespace)
            .create(&Self::post_params(), object)
            .await
    }

    async fn replace<K: ClusterResource>(
        &self,
        namespace: &str,
        name: &str,
        object: &K,
    ) -> kube::Result<K> {
        self.api::<K>(namespace)
            .replace(name, &Self::post_params(), object)
            .await
    }

    async fn replace_status<K: ClusterResource>(
        &self,
        namespace: &str,
        name: &str,
        object: &K,
    ) -> kube::Result<K> {
        self.api::<K>(namespace)
            .replace_status(
                name,
                &Self::post_params(),
                serde_json::to_vec(object).map_err(kube::Error::SerdeError)?,
            )
            .await
    }

    async fn delete<K: ClusterResource>(&self, namespace: &str, name: &str) -> kube::Result<()> {
        self.api::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory [`ClusterClient`] recording every call.

    use std::{
        collections::{BTreeMap, HashMap, HashSet, VecDeque},
        sync::{Arc, Mutex},
        time::Duration,
    };

    use async_trait::async_trait;
    use k8s_openapi::chrono::{SecondsFormat, Utc};
    use kube::{api::ListParams, core::ErrorResponse};
    use serde_json::Value;

    use super::{ClusterClient, ClusterResource};

    type ObjectKey = (String, String, String);
    type Hook = Arc<dyn Fn(&FakeCluster) + Send + Sync>;

    #[derive(Default)]
    struct FakeState {
        objects: BTreeMap<ObjectKey, Value>,
        resource_version: u64,
        calls: Vec<String>,
        errors: HashMap<(String, String), VecDeque<(u16, String)>>,
        panics: HashSet<(String, String)>,
        delays: HashMap<(String, String), Duration>,
        hooks: HashMap<(String, String), Hook>,
    }

    #[derive(Default)]
    pub(crate) struct FakeCluster {
        state: Mutex<FakeState>,
    }

    fn kind<K: ClusterResource>() -> String {
        K::kind(&()).to_string()
    }

    fn api_error(code: u16, reason: &str, message: String) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message,
            reason: reason.to_string(),
            code,
        })
    }

    fn not_found(kind: &str, name: &str) -> kube::Error {
        api_error(404, "NotFound", format!("{} \"{}\" not found", kind, name))
    }

    fn labels_of(value: &Value) -> BTreeMap<String, String> {
        value
            .pointer("/metadata/labels")
            .and_then(|l| serde_json::from_value(l.clone()).ok())
            .unwrap_or_default()
    }

    /// Supports `k=v`, `k==v`, `k!=v`, `k` and `!k` terms.
    fn selector_matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
        selector
            .split(',')
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .all(|term| {
                if let Some((k, v)) = term.split_once("!=") {
                    labels.get(k.trim()).map(|l| l != v.trim()).unwrap_or(true)
                } else if let Some((k, v)) = term.split_once("==") {
                    labels.get(k.trim()).map(|l| l == v.trim()).unwrap_or(false)
                } else if let Some((k, v)) = term.split_once('=') {
                    labels.get(k.trim()).map(|l| l == v.trim()).unwrap_or(false)
                } else if let Some(k) = term.strip_prefix('!') {
                    !labels.contains_key(k.trim())
                } else {
                    labels.contains_key(term)
                }
            })
    }

    impl FakeCluster {
        pub(crate) fn new() -> Self {
            Default::default()
        }

        fn next_resource_version(state: &mut FakeState) -> String {
            state.resource_version += 1;
            state.resource_version.to_string()
        }

        /// Record the call and run its hook, then return an injected error or panic if
        /// one is registered. Registered delays elapse before the call takes effect.
        async fn enter(&self, verb: &str, kind: &str, target: String) -> kube::Result<()> {
            let (should_panic, hook, delay) = {
                let mut state = self.state.lock().unwrap();
                state.calls.push(format!("{} {} {}", verb, kind, target));
                let key = (verb.to_string(), kind.to_string());
                if let Some((code, reason)) =
                    state.errors.get_mut(&key).and_then(|q| q.pop_front())
                {
                    return Err(api_error(code, &reason, format!("injected {}", reason)));
                }
                (
                    state.panics.contains(&key),
                    state.hooks.get(&key).cloned(),
                    state.delays.get(&key).copied(),
                )
            };
            if let Some(hook) = hook {
                hook(self);
            }
            if should_panic {
                panic!("injected panic on {} {}", verb, kind);
            }
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(())
        }

        /// Store an object without recording a call.
        pub(crate) fn insert<K: ClusterResource>(&self, object: K) {
            let mut value = serde_json::to_value(&object).unwrap();
            let namespace = object.meta().namespace.clone().unwrap_or_default();
            let name = object.meta().name.clone().unwrap_or_default();
            let mut state = self.state.lock().unwrap();
            let rv = Self::next_resource_version(&mut state);
            value["metadata"]["resourceVersion"] = Value::String(rv);
            value["metadata"]["namespace"] = Value::String(namespace.clone());
            state.objects.insert((kind::<K>(), namespace, name), value);
        }

        pub(crate) fn object<K: ClusterResource>(&self, namespace: &str, name: &str) -> Option<K> {
            let state = self.state.lock().unwrap();
            state
                .objects
                .get(&(kind::<K>(), namespace.to_string(), name.to_string()))
                .map(|v| serde_json::from_value(v.clone()).unwrap())
        }

        pub(crate) fn objects<K: ClusterResource>(&self, namespace: &str) -> Vec<K> {
            let state = self.state.lock().unwrap();
            let kind = kind::<K>();
            state
                .objects
                .iter()
                .filter(|((k, ns, _), _)| *k == kind && (namespace.is_empty() || ns == namespace))
                .map(|(_, v)| serde_json::from_value(v.clone()).unwrap())
                .collect()
        }

        /// Modify a stored object in place, e.g. to simulate status changes made by the cluster.
        pub(crate) fn mutate<K: ClusterResource>(
            &self,
            namespace: &str,
            name: &str,
            f: impl FnOnce(&mut K),
        ) {
            let mut object: K = self.object(namespace, name).unwrap();
            f(&mut object);
            let mut value = serde_json::to_value(&object).unwrap();
            let mut state = self.state.lock().unwrap();
            let rv = Self::next_resource_version(&mut state);
            value["metadata"]["resourceVersion"] = Value::String(rv);
            state.objects.insert(
                (kind::<K>(), namespace.to_string(), name.to_string()),
                value,
            );
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.state.lock().unwrap().calls.clone()
        }

        /// Calls which modify cluster state.
        pub(crate) fn writes(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter(|c| !c.starts_with("get ") && !c.starts_with("list "))
                .collect()
        }

        pub(crate) fn clear_calls(&self) {
            self.state.lock().unwrap().calls.clear();
        }

        /// Fail the next `verb` call on `K` with the given status code and reason.
        pub(crate) fn fail_next<K: ClusterResource>(&self, verb: &str, code: u16, reason: &str) {
            self.state
                .lock()
                .unwrap()
                .errors
                .entry((verb.to_string(), kind::<K>()))
                .or_default()
                .push_back((code, reason.to_string()));
        }

        pub(crate) fn panic_on<K: ClusterResource>(&self, verb: &str) {
            self.state
                .lock()
                .unwrap()
                .panics
                .insert((verb.to_string(), kind::<K>()));
        }

        /// Hold every `verb` call on `K` for `delay` before it takes effect.
        pub(crate) fn delay<K: ClusterResource>(&self, verb: &str, delay: Duration) {
            self.state
                .lock()
                .unwrap()
                .delays
                .insert((verb.to_string(), kind::<K>()), delay);
        }

        /// Run `hook` when a `verb` call on `K` is issued, before it takes effect.
        pub(crate) fn on_call<K: ClusterResource>(
            &self,
            verb: &str,
            hook: impl Fn(&FakeCluster) + Send + Sync + 'static,
        ) {
            self.state
                .lock()
                .unwrap()
                .hooks
                .insert((verb.to_string(), kind::<K>()), Arc::new(hook));
        }
    }

    #[async_trait]
    impl ClusterClient for FakeCluster {
        async fn get<K: ClusterResource>(&self, namespace: &str, name: &str) -> kube::Result<K> {
            let kind = kind::<K>();
            self.enter("get", &kind, format!("{}/{}", namespace, name)).await?;
            let state = self.state.lock().unwrap();
            match state
                .objects
                .get(&(kind.clone(), namespace.to_string(), name.to_string()))
            {
                Some(v) => serde_json::from_value(v.clone()).map_err(kube::Error::SerdeError),
                None => Err(not_found(&kind, name)),
            }
        }

        async fn list<K: ClusterResource>(
            &self,
            namespace: &str,
            params: &ListParams,
        ) -> kube::Result<Vec<K>> {
            let kind = kind::<K>();
            self.enter("list", &kind, namespace.to_string()).await?;
            let state = self.state.lock().unwrap();
            state
                .objects
                .iter()
                .filter(|((k, ns, _), _)| *k == kind && (namespace.is_empty() || ns == namespace))
                .filter(|(_, v)| {
                    params
                        .label_selector
                        .as_deref()
                        .map(|s| selector_matches(s, &labels_of(v)))
                        .unwrap_or(true)
                })
                .map(|(_, v)| serde_json::from_value(v.clone()).map_err(kube::Error::SerdeError))
                .collect()
        }

        async fn create<K: ClusterResource>(&self, namespace: &str, object: &K) -> kube::Result<K> {
            let kind = kind::<K>();
            let name = object.meta().name.clone().unwrap_or_default();
            self.enter("create", &kind, format!("{}/{}", namespace, name)).await?;
            let mut state = self.state.lock().unwrap();
            let key = (kind.clone(), namespace.to_string(), name.clone());
            if state.objects.contains_key(&key) {
                return Err(api_error(
                    409,
                    "AlreadyExists",
                    format!("{} \"{}\" already exists", kind, name),
                ));
            }
            let mut value = serde_json::to_value(object).map_err(kube::Error::SerdeError)?;
            let rv = Self::next_resource_version(&mut state);
            value["metadata"]["resourceVersion"] = Value::String(rv.clone());
            value["metadata"]["namespace"] = Value::String(namespace.to_string());
            value["metadata"]["uid"] = Value::String(format!("uid-{}", rv));
            if value.pointer("/metadata/creationTimestamp").is_none() {
                value["metadata"]["creationTimestamp"] =
                    Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
            }
            state.objects.insert(key, value.clone());
            serde_json::from_value(value).map_err(kube::Error::SerdeError)
        }

        async fn replace<K: ClusterResource>(
            &self,
            namespace: &str,
            name: &str,
            object: &K,
        ) -> kube::Result<K> {
            let kind = kind::<K>();
            self.enter("replace", &kind, format!("{}/{}", namespace, name)).await?;
            let mut state = self.state.lock().unwrap();
            let key = (kind.clone(), namespace.to_string(), name.to_string());
            let Some(stored) = state.objects.get(&key).cloned() else {
                return Err(not_found(&kind, name));
            };
            let stored_rv = stored.pointer("/metadata/resourceVersion").cloned();
            if let Some(rv) = object.meta().resource_version.as_deref() {
                if stored_rv != Some(Value::String(rv.to_string())) {
                    return Err(api_error(
                        409,
                        "Conflict",
                        format!("the object {} has been modified", name),
                    ));
                }
            }
            let mut value = serde_json::to_value(object).map_err(kube::Error::SerdeError)?;
            for field in ["uid", "creationTimestamp"] {
                if let Some(v) = stored["metadata"].get(field) {
                    value["metadata"][field] = v.clone();
                }
            }
            if let (Some(obj), Some(status)) = (value.as_object_mut(), stored.get("status")) {
                obj.insert("status".to_string(), status.clone());
            }
            let rv = Self::next_resource_version(&mut state);
            value["metadata"]["resourceVersion"] = Value::String(rv);
            value["metadata"]["namespace"] = Value::String(namespace.to_string());
            state.objects.insert(key, value.clone());
            serde_json::from_value(value).map_err(kube::Error::SerdeError)
        }

        async fn replace_status<K: ClusterResource>(
            &self,
            namespace: &str,
            name: &str,
            object: &K,
        ) -> kube::Result<K> {
            let kind = kind::<K>();
            self.enter("replace_status", &kind, format!("{}/{}", namespace, name)).await?;
            let mut state = self.state.lock().unwrap();
            let key = (kind.clone(), namespace.to_string(), name.to_string());
            let Some(mut stored) = state.objects.get(&key).cloned() else {
                return Err(not_found(&kind, name));
            };
            if let Some(rv) = object.meta().resource_version.as_deref() {
                if stored.pointer("/metadata/resourceVersion") != Some(&Value::String(rv.to_string()))
                {
                    return Err(api_error(
                        409,
                        "Conflict",
                        format!("the object {} has been modified", name),
                    ));
                }
            }
            let value = serde_json::to_value(object).map_err(kube::Error::SerdeError)?;
            if let Some(obj) = stored.as_object_mut() {
                match value.get("status") {
                    Some(status) => obj.insert("status".to_string(), status.clone()),
                    None => obj.remove("status"),
                };
            }
            let rv = Self::next_resource_version(&mut state);
            stored["metadata"]["resourceVersion"] = Value::String(rv);
            state.objects.insert(key, stored.clone());
            serde_json::from_value(stored).map_err(kube::Error::SerdeError)
        }

        async fn delete<K: ClusterResource>(&self, namespace: &str, name: &str) -> kube::Result<()> {
            let kind = kind::<K>();
            self.enter("delete", &kind, format!("{}/{}", namespace, name)).await?;
            let mut state = self.state.lock().unwrap();
            match state
                .objects
                .remove(&(kind.clone(), namespace.to_string(), name.to_string()))
            {
                Some(_) => Ok(()),
                None => Err(not_found(&kind, name)),
            }
        }
    }

    mod tests {
        use super::*;
        use crate::errors::ExtKubeApiError;
        use k8s_openapi::api::core::v1::ConfigMap;
        use kube::api::ObjectMeta;

        fn config_map(name: &str, labels: &[(&str, &str)]) -> ConfigMap {
            ConfigMap {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some("ns".to_string()),
                    labels: Some(
                        labels
                            .iter()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect(),
                    ),
                    ..Default::default()
                },
                ..Default::default()
            }
        }

        #[tokio::test]
        async fn optimistic_concurrency() {
            let fake = FakeCluster::new();
            let created = fake.create("ns", &config_map("a", &[])).await.unwrap();
            assert!(fake.create("ns", &config_map("a", &[])).await.unwrap_err().is_already_exists());
            let mut stale = created.clone();
            fake.replace("ns", "a", &created).await.unwrap();
            stale.data = Some(Default::default());
            assert!(fake.replace("ns", "a", &stale).await.unwrap_err().is_conflict());
            fake.delete::<ConfigMap>("ns", "a").await.unwrap();
            assert!(fake.get::<ConfigMap>("ns", "a").await.unwrap_err().is_not_found());
            assert_eq!(
                vec![
                    "create ConfigMap ns/a",
                    "create ConfigMap ns/a",
                    "replace ConfigMap ns/a",
                    "replace ConfigMap ns/a",
                    "delete ConfigMap ns/a",
                    "get ConfigMap ns/a",
                ],
                fake.calls()
            );
        }

        #[tokio::test]
        async fn list_with_label_selector() {
            let fake = FakeCluster::new();
            fake.insert(config_map("a", &[("app", "x"), ("tier", "1")]));
            fake.insert(config_map("b", &[("app", "x")]));
            fake.insert(config_map("c", &[("app", "y")]));
            let list = |selector: &str| {
                let params = ListParams::default().labels(selector);
                let fake = &fake;
                async move {
                    fake.list::<ConfigMap>("ns", &params)
                        .await
                        .unwrap()
                        .into_iter()
                        .map(|c| c.metadata.name.unwrap())
                        .collect::<Vec<String>>()
                }
            };
            assert_eq!(vec!["a", "b"], list("app=x").await);
            assert_eq!(vec!["b"], list("app=x,!tier").await);
            assert_eq!(vec!["c"], list("app!=x").await);
            assert_eq!(vec!["c"], list("app==y").await);
            assert_eq!(vec!["a"], list("tier").await);
            assert!(fake.list::<ConfigMap>("other", &ListParams::default()).await.unwrap().is_empty());
            assert_eq!(3, fake.list::<ConfigMap>("", &ListParams::default()).await.unwrap().len());
        }

        #[tokio::test]
        async fn delays_and_hooks() {
            let fake = Arc::new(FakeCluster::new());
            fake.insert(config_map("a", &[]));
            fake.delay::<ConfigMap>("delete", Duration::from_millis(50));
            let seen = Arc::new(Mutex::new(vec![]));
            let observed = seen.clone();
            fake.on_call::<ConfigMap>("delete", move |fake| {
                observed
                    .lock()
                    .unwrap()
                    .push(fake.object::<ConfigMap>("ns", "a").is_some());
            });
            let started = tokio::time::Instant::now();
            let delete = fake.delete::<ConfigMap>("ns", "a");
            tokio::pin!(delete);
            // still stored while the delete is held back
            assert!(tokio::time::timeout(Duration::from_millis(10), &mut delete).await.is_err());
            assert!(fake.object::<ConfigMap>("ns", "a").is_some());
            delete.await.unwrap();
            assert!(started.elapsed() >= Duration::from_millis(50));
            assert!(fake.object::<ConfigMap>("ns", "a").is_none());
            assert_eq!(vec![true], *seen.lock().unwrap());
        }

        #[tokio::test]
        async fn injected_errors() {
            let fake = FakeCluster::new();
            fake.fail_next::<ConfigMap>("create", 409, "Conflict");
            assert!(fake.create("ns", &config_map("a", &[])).await.unwrap_err().is_conflict());
            assert!(fake.create("ns", &config_map("a", &[])).await.is_ok());
        }
    }
}
