//! Deferred parameter store.
//!
//! Steps publish lazily-resolved values that downstream steps read by
//! name. Each resolver runs at most once; concurrent readers of the
//! same name block on the first evaluation and observe its result,
//! success or failure alike.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::OnceCell;

use crate::error::{Error, Result};
use crate::link::StepLink;

/// A lazy parameter value. Evaluation may fail.
pub type Resolver = Arc<dyn Fn() -> BoxFuture<'static, Result<String>> + Send + Sync>;

/// Resolver for a value known up front.
pub fn static_resolver(value: impl Into<String>) -> Resolver {
    let value = value.into();
    Arc::new(move || {
        let value = value.clone();
        Box::pin(async move { Ok(value) })
    })
}

struct Entry {
    link: Option<StepLink>,
    resolver: Resolver,
    // Memoizes the first evaluation, including failures.
    cell: Arc<OnceCell<std::result::Result<String, String>>>,
}

/// Process-wide keyed store of `name -> (link?, resolver)`.
#[derive(Default)]
pub struct ParameterStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a lazy value. Duplicate names are an error.
    pub fn add(
        &self,
        name: impl Into<String>,
        link: Option<StepLink>,
        resolver: Resolver,
    ) -> Result<()> {
        let name = name.into();
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&name) {
            return Err(Error::DuplicateParameter(name));
        }
        entries.insert(
            name,
            Entry {
                link,
                resolver,
                cell: Arc::new(OnceCell::new()),
            },
        );
        Ok(())
    }

    /// Register a value known up front.
    pub fn add_static(
        &self,
        name: impl Into<String>,
        link: Option<StepLink>,
        value: impl Into<String>,
    ) -> Result<()> {
        self.add(name, link, static_resolver(value))
    }

    pub fn has(&self, name: &str) -> bool {
        self.entries.lock().unwrap().contains_key(name)
    }

    /// Resolve one parameter, evaluating its resolver on first use.
    pub async fn get(&self, name: &str) -> Result<String> {
        // Clone the handles out so the resolver body runs outside the
        // lock; resolvers may themselves read other parameters.
        let (resolver, cell) = {
            let entries = self.entries.lock().unwrap();
            let entry = entries
                .get(name)
                .ok_or_else(|| Error::UnresolvedParameter(name.to_string()))?;
            (entry.resolver.clone(), entry.cell.clone())
        };

        let memoized = cell
            .get_or_init(|| async move { resolver().await.map_err(|e| e.to_string()) })
            .await;

        match memoized {
            Ok(value) => Ok(value.clone()),
            Err(message) => Err(Error::ResolverError {
                name: name.to_string(),
                message: message.clone(),
            }),
        }
    }

    /// Resolve every parameter. Fails on the first error, preserving
    /// the failing key.
    pub async fn map(&self) -> Result<BTreeMap<String, String>> {
        let names: Vec<String> = {
            let entries = self.entries.lock().unwrap();
            entries.keys().cloned().collect()
        };
        let mut out = BTreeMap::new();
        for name in names {
            let value = self.get(&name).await?;
            out.insert(name, value);
        }
        Ok(out)
    }

    /// Union of registered link hints.
    pub fn links(&self) -> Vec<StepLink> {
        let entries = self.entries.lock().unwrap();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for entry in entries.values() {
            if let Some(link) = &entry.link {
                if seen.insert(link.clone()) {
                    out.push(link.clone());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_resolver(counter: Arc<AtomicUsize>, value: &'static str) -> Resolver {
        Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                // Give concurrent getters a chance to pile up.
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(value.to_string())
            })
        })
    }

    #[tokio::test]
    async fn duplicate_registration_is_an_error() {
        let store = ParameterStore::new();
        store.add_static("K", None, "v").unwrap();
        let err = store.add_static("K", None, "w").unwrap_err();
        assert_eq!(err.reason(), "duplicate_parameter");
    }

    #[tokio::test]
    async fn resolvers_run_exactly_once() {
        let store = Arc::new(ParameterStore::new());
        let count = Arc::new(AtomicUsize::new(0));
        store
            .add("K", None, counting_resolver(count.clone(), "v"))
            .unwrap();

        let (a, b) = tokio::join!(store.get("K"), store.get("K"));
        assert_eq!(a.unwrap(), "v");
        assert_eq!(b.unwrap(), "v");
        assert_eq!(store.get("K").await.unwrap(), "v");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_memoized_too() {
        let store = ParameterStore::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        store
            .add(
                "BROKEN",
                None,
                Arc::new(move || {
                    let counter = counter.clone();
                    Box::pin(async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(Error::Internal("no value".into()))
                    })
                }),
            )
            .unwrap();

        for _ in 0..2 {
            match store.get("BROKEN").await {
                Err(Error::ResolverError { name, .. }) => assert_eq!(name, "BROKEN"),
                other => panic!("expected resolver error, got {other:?}"),
            }
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn map_resolves_everything_and_preserves_failing_key() {
        let store = ParameterStore::new();
        store.add_static("A", None, "1").unwrap();
        store.add_static("B", None, "2").unwrap();
        let map = store.map().await.unwrap();
        assert_eq!(map["A"], "1");
        assert_eq!(map["B"], "2");

        store
            .add(
                "C",
                None,
                Arc::new(|| Box::pin(async { Err(Error::Internal("boom".into())) })),
            )
            .unwrap();
        match store.map().await {
            Err(Error::ResolverError { name, .. }) => assert_eq!(name, "C"),
            other => panic!("expected resolver error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unregistered_name_is_unresolved() {
        let store = ParameterStore::new();
        assert_eq!(
            store.get("MISSING").await.unwrap_err().reason(),
            "unresolved_parameter"
        );
    }

    #[test]
    fn links_are_the_deduplicated_union() {
        let store = ParameterStore::new();
        store
            .add_static("A", Some(StepLink::internal("src")), "1")
            .unwrap();
        store
            .add_static("B", Some(StepLink::internal("src")), "2")
            .unwrap();
        store
            .add_static("C", Some(StepLink::ImagesReady), "3")
            .unwrap();
        store.add_static("D", None, "4").unwrap();

        let links = store.links();
        assert_eq!(links.len(), 2);
        assert!(links.contains(&StepLink::internal("src")));
        assert!(links.contains(&StepLink::ImagesReady));
    }
}
