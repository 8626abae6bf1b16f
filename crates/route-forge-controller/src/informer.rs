//! Informers: watch streams feeding reflector stores and typed notifications
//!
//! A kube-rs watcher stream is applied to a reflector [`Writer`] and, at the
//! same time, translated into [`ResourceEvent`]s carrying the previous object
//! for updates. Objects that vanish across a relist are reported as deleted
//! once the relist completes.
//!
//! The initial list produces no notifications: the store only becomes ready
//! at its end, and consumers reconcile the full store once it is ready.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Notifications buffered between an informer and its consumer
const EVENT_BUFFER: usize = 1024;

/// A typed change notification
#[derive(Clone, Debug)]
pub enum ResourceEvent<K> {
    /// First time the object is seen
    Added(Arc<K>),
    /// Object changed
    Updated {
        /// Last known state
        old: Arc<K>,
        /// New state
        new: Arc<K>,
    },
    /// Object is gone
    Deleted(Arc<K>),
}

/// Applies watcher events to a store and derives [`ResourceEvent`]s
pub struct EventTranslator<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    writer: Writer<K>,
    store: Store<K>,
    relist_before: HashMap<ObjectRef<K>, Arc<K>>,
    relist_seen: HashSet<ObjectRef<K>>,
    listed: bool,
}

impl<K> EventTranslator<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    /// Create a translator with an empty store
    pub fn new() -> Self {
        let writer = Writer::default();
        let store = writer.as_reader();
        Self {
            writer,
            store,
            relist_before: HashMap::new(),
            relist_seen: HashSet::new(),
            listed: false,
        }
    }

    /// Read handle to the store kept by this translator
    pub fn store(&self) -> Store<K> {
        self.store.clone()
    }

    /// Apply one watcher event and return the notifications it implies
    pub fn handle(&mut self, event: Event<K>) -> Vec<ResourceEvent<K>> {
        let mut out = Vec::new();
        match &event {
            Event::Apply(obj) => {
                let old = self.store.get(&ObjectRef::from_obj(obj));
                out.push(applied(old, obj));
            }
            Event::Delete(obj) => {
                let last = self
                    .store
                    .get(&ObjectRef::from_obj(obj))
                    .unwrap_or_else(|| Arc::new(obj.clone()));
                out.push(ResourceEvent::Deleted(last));
            }
            Event::Init => {
                self.relist_before = self
                    .store
                    .state()
                    .into_iter()
                    .map(|obj| (ObjectRef::from_obj(obj.as_ref()), obj))
                    .collect();
                self.relist_seen.clear();
            }
            Event::InitApply(obj) => {
                let obj_ref = ObjectRef::from_obj(obj);
                let old = self.relist_before.get(&obj_ref).cloned();
                self.relist_seen.insert(obj_ref);
                if self.listed {
                    out.push(applied(old, obj));
                }
            }
            Event::InitDone => {
                for (obj_ref, obj) in self.relist_before.drain() {
                    if !self.relist_seen.contains(&obj_ref) {
                        out.push(ResourceEvent::Deleted(obj));
                    }
                }
                self.relist_seen.clear();
                self.listed = true;
            }
        }
        self.writer.apply_watcher_event(&event);
        out
    }
}

impl<K> Default for EventTranslator<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

fn applied<K: Clone>(old: Option<Arc<K>>, obj: &K) -> ResourceEvent<K> {
    let new = Arc::new(obj.clone());
    match old {
        Some(old) => ResourceEvent::Updated { old, new },
        None => ResourceEvent::Added(new),
    }
}

/// Start watching `api`, returning the synced store and the notification stream
///
/// The watch retries with kube's default backoff until `cancel` fires.
pub fn spawn_informer<K>(
    api: Api<K>,
    cancel: CancellationToken,
) -> (Store<K>, mpsc::Receiver<ResourceEvent<K>>)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    let mut translator = EventTranslator::<K>::new();
    let store = translator.store();
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let kind = K::kind(&K::DynamicType::default()).to_string();

    tokio::spawn(async move {
        let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
        futures::pin_mut!(stream);

        info!(kind = %kind, "Informer started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(event)) => {
                        for notification in translator.handle(event) {
                            if tx.send(notification).await.is_err() {
                                debug!(kind = %kind, "Informer consumer gone");
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => warn!(kind = %kind, error = %e, "Watch error, backing off"),
                    None => break,
                }
            }
        }
        info!(kind = %kind, "Informer stopped");
    });

    (store, rx)
}
