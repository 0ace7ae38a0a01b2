//! Lazily constructed, device-aware store of loaded models.
//!
//! Every entry is built at most once. A failed construction is remembered and
//! reported as [`Loaded::Unavailable`] on every later request for the same key,
//! while other keys keep loading normally.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{Result, anyhow};
use tracing::{debug, error, info, warn};

use crate::device::{Device, Placement};

/// Capability every cached model provides: relocating its tensors to another
/// execution context.
pub trait Movable: Send + Sync + 'static {
    fn move_to(&mut self, device: &candle_core::Device) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModelKey {
    /// A single pretrained repository.
    Single(String),
    /// A pipeline assembled from a base model and an auxiliary conditioning model.
    Compound { base: String, auxiliary: String },
    /// Singleton predictors and annotators.
    Named(String),
}

impl ModelKey {
    pub fn single(id: impl Into<String>) -> Self {
        Self::Single(id.into())
    }

    pub fn compound(base: impl Into<String>, auxiliary: impl Into<String>) -> Self {
        Self::Compound {
            base: base.into(),
            auxiliary: auxiliary.into(),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKey::Single(id) | ModelKey::Named(id) => f.write_str(id),
            ModelKey::Compound { base, auxiliary } => write!(f, "{base}+{auxiliary}"),
        }
    }
}

/// Shared handle to a constructed model.
pub struct Handle<M>(Arc<RwLock<M>>);

impl<M> Clone for Handle<M> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<M> fmt::Debug for Handle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handle")
            .field(&Arc::as_ptr(&self.0))
            .finish()
    }
}

impl<M> Handle<M> {
    pub fn new(model: M) -> Self {
        Self(Arc::new(RwLock::new(model)))
    }

    pub fn read(&self) -> Result<RwLockReadGuard<'_, M>> {
        self.0
            .read()
            .map_err(|_| anyhow!("model lock poisoned by a panicked inference"))
    }

    pub fn write(&self) -> Result<RwLockWriteGuard<'_, M>> {
        self.0
            .write()
            .map_err(|_| anyhow!("model lock poisoned by a panicked inference"))
    }

    /// Whether both handles point at the same constructed instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Result of a cache lookup. A model that failed to construct is reported as
/// `Unavailable` instead of an error.
#[must_use]
#[derive(Debug)]
pub enum Loaded<M> {
    Ready(Handle<M>),
    Unavailable(Unavailable),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("model `{key}` is unavailable: {reason}")]
pub struct Unavailable {
    pub key: ModelKey,
    pub reason: String,
}

impl<M> Loaded<M> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Loaded::Ready(_))
    }

    pub fn ready(self) -> Option<Handle<M>> {
        match self {
            Loaded::Ready(handle) => Some(handle),
            Loaded::Unavailable(_) => None,
        }
    }

    pub fn require(self) -> std::result::Result<Handle<M>, Unavailable> {
        match self {
            Loaded::Ready(handle) => Ok(handle),
            Loaded::Unavailable(unavailable) => Err(unavailable),
        }
    }
}

/// Type-erased view of a `Handle<M>` stored in the cache.
trait Entry: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn move_to(&self, device: &candle_core::Device) -> Result<()>;
}

impl<M: Movable> Entry for Handle<M> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn move_to(&self, device: &candle_core::Device) -> Result<()> {
        self.write()?.move_to(device)
    }
}

enum Slot {
    Pending,
    Ready { entry: Box<dyn Entry>, device: Device },
    Failed { reason: String },
}

pub struct ModelCache {
    placement: Placement,
    slots: BTreeMap<ModelKey, Slot>,
}

impl fmt::Debug for ModelCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelCache")
            .field("device", &self.placement.device)
            .field("keys", &self.slots.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ModelCache {
    pub fn new(device: Device) -> Result<Self> {
        Ok(Self::with_placement(Placement::resolve(device)?))
    }

    pub fn with_placement(placement: Placement) -> Self {
        Self {
            placement,
            slots: BTreeMap::new(),
        }
    }

    pub fn device(&self) -> Device {
        self.placement.device
    }

    pub fn backend(&self) -> &candle_core::Device {
        &self.placement.backend
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ModelKey> {
        self.slots.keys()
    }

    pub fn contains(&self, key: &ModelKey) -> bool {
        self.slots.contains_key(key)
    }

    /// `Some(true)` once built, `Some(false)` after a failed construction,
    /// `None` when the key was never requested.
    pub fn is_available(&self, key: &ModelKey) -> Option<bool> {
        match self.slots.get(key)? {
            Slot::Ready { .. } => Some(true),
            Slot::Failed { .. } => Some(false),
            Slot::Pending => None,
        }
    }

    pub fn device_of(&self, key: &ModelKey) -> Option<Device> {
        match self.slots.get(key)? {
            Slot::Ready { device, .. } => Some(*device),
            _ => None,
        }
    }

    /// Returns the model stored under `key`, building it with `constructor`
    /// on the active device when the key is requested for the first time.
    pub async fn get<M, C, F, Fut>(&mut self, key: ModelKey, config: C, constructor: F) -> Loaded<M>
    where
        M: Movable,
        F: FnOnce(C, candle_core::Device) -> Fut,
        Fut: Future<Output = Result<M>>,
    {
        if let Some(found) = self.lookup(&key) {
            return found;
        }

        let pending = constructor(config, self.placement.backend.clone());
        self.construct(key, pending).await
    }

    /// Like [`ModelCache::get`] for a pipeline composed from an auxiliary
    /// model. The auxiliary goes through [`ModelCache::get`] under its own
    /// key, so a cached auxiliary is reused and never rebuilt.
    pub async fn get_compound<M, A, C, F, Fut, B, BFut>(
        &mut self,
        key: ModelKey,
        auxiliary_key: ModelKey,
        auxiliary_config: C,
        auxiliary_constructor: F,
        build: B,
    ) -> Loaded<M>
    where
        M: Movable,
        A: Movable,
        F: FnOnce(C, candle_core::Device) -> Fut,
        Fut: Future<Output = Result<A>>,
        B: FnOnce(Handle<A>, candle_core::Device) -> BFut,
        BFut: Future<Output = Result<M>>,
    {
        if let Some(found) = self.lookup(&key) {
            return found;
        }

        let auxiliary = match self
            .get(auxiliary_key, auxiliary_config, auxiliary_constructor)
            .await
        {
            Loaded::Ready(handle) => handle,
            Loaded::Unavailable(unavailable) => {
                return self.fail(key, anyhow!(unavailable));
            }
        };

        let pending = build(auxiliary, self.placement.backend.clone());
        self.construct(key, pending).await
    }

    /// Switches the active device and moves every constructed model onto it.
    pub fn set_device(&mut self, device: Device) -> Result<()> {
        let placement = Placement::resolve(device)?;
        self.set_placement(placement);
        Ok(())
    }

    /// Moves every constructed model to `placement`. A model that cannot be
    /// moved is marked unavailable rather than left on the old device.
    pub fn set_placement(&mut self, placement: Placement) {
        let previous = std::mem::replace(&mut self.placement, placement);
        let target = self.placement.device;
        info!(from = %previous.device, to = %target, "switching device");

        for (key, slot) in self.slots.iter_mut() {
            let moved = match slot {
                Slot::Ready { entry, .. } => entry.move_to(&self.placement.backend),
                Slot::Pending | Slot::Failed { .. } => continue,
            };
            match moved {
                Ok(()) => {
                    if let Slot::Ready { device, .. } = slot {
                        *device = target;
                    }
                    debug!(%key, device = %target, "moved model");
                }
                Err(err) => {
                    let reason = format!("failed to move to {target}: {err:#}");
                    error!(%key, %reason, "model dropped from cache");
                    *slot = Slot::Failed { reason };
                }
            }
        }

        if previous.device.is_accelerator() && previous.device != target {
            let device = previous.device;
            if let Err(err) = previous.release() {
                warn!(%device, "failed to release accelerator memory: {err:#}");
            }
        }
    }

    fn lookup<M: Movable>(&self, key: &ModelKey) -> Option<Loaded<M>> {
        match self.slots.get(key)? {
            Slot::Ready { entry, .. } => Some(
                match entry.as_any().downcast_ref::<Handle<M>>() {
                    Some(handle) => Loaded::Ready(handle.clone()),
                    None => Loaded::Unavailable(Unavailable {
                        key: key.clone(),
                        reason: format!(
                            "cached model is not a {}",
                            std::any::type_name::<M>()
                        ),
                    }),
                },
            ),
            Slot::Failed { reason } => Some(Loaded::Unavailable(Unavailable {
                key: key.clone(),
                reason: reason.clone(),
            })),
            // a previous construction was abandoned mid-way
            Slot::Pending => None,
        }
    }

    async fn construct<M, Fut>(&mut self, key: ModelKey, pending: Fut) -> Loaded<M>
    where
        M: Movable,
        Fut: Future<Output = Result<M>>,
    {
        self.slots.insert(key.clone(), Slot::Pending);
        info!(%key, device = %self.placement.device, "loading model");

        match pending.await {
            Ok(model) => {
                let handle = Handle::new(model);
                self.slots.insert(
                    key,
                    Slot::Ready {
                        entry: Box::new(handle.clone()),
                        device: self.placement.device,
                    },
                );
                Loaded::Ready(handle)
            }
            Err(err) => self.fail(key, err),
        }
    }

    fn fail<M>(&mut self, key: ModelKey, err: anyhow::Error) -> Loaded<M> {
        let reason = format!("{err:#}");
        error!(%key, %reason, "failed to load model");
        self.slots.insert(
            key.clone(),
            Slot::Failed {
                reason: reason.clone(),
            },
        );
        Loaded::Unavailable(Unavailable { key, reason })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::bail;

    use super::*;

    #[derive(Debug)]
    struct Fake {
        name: &'static str,
        moves: Arc<AtomicUsize>,
        fail_moves: bool,
    }

    impl Movable for Fake {
        fn move_to(&mut self, _device: &candle_core::Device) -> Result<()> {
            if self.fail_moves {
                bail!("{} cannot be moved", self.name);
            }
            self.moves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Composed {
        part: Handle<Fake>,
    }

    impl Movable for Composed {
        fn move_to(&mut self, _device: &candle_core::Device) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct Counters {
        built: Arc<AtomicUsize>,
        moves: Arc<AtomicUsize>,
    }

    impl Counters {
        fn built(&self) -> usize {
            self.built.load(Ordering::SeqCst)
        }

        fn moves(&self) -> usize {
            self.moves.load(Ordering::SeqCst)
        }

        fn constructor(
            &self,
        ) -> impl FnOnce(&'static str, candle_core::Device) -> std::future::Ready<Result<Fake>>
        {
            let counters = self.clone();
            move |name, _device| {
                counters.built.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Ok(Fake {
                    name,
                    moves: Arc::clone(&counters.moves),
                    fail_moves: name == "sticky",
                }))
            }
        }

        fn failing(
            &self,
        ) -> impl FnOnce(&'static str, candle_core::Device) -> std::future::Ready<Result<Fake>>
        {
            let counters = self.clone();
            move |name, _device| {
                counters.built.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Err(anyhow!("network unreachable while fetching {name}")))
            }
        }
    }

    fn fake_cuda() -> Placement {
        Placement {
            device: Device::Cuda(0),
            backend: candle_core::Device::Cpu,
        }
    }

    #[tokio::test]
    async fn constructs_each_key_once() {
        let mut cache = ModelCache::with_placement(Placement::cpu());
        let counters = Counters::default();
        let key = ModelKey::single("inpaint");

        let first = cache
            .get::<Fake, _, _, _>(key.clone(), "inpaint", counters.constructor())
            .await
            .ready()
            .expect("first load succeeds");
        let second = cache
            .get::<Fake, _, _, _>(key.clone(), "inpaint", counters.constructor())
            .await
            .ready()
            .expect("second load succeeds");

        assert_eq!(counters.built(), 1);
        assert!(first.ptr_eq(&second));
        assert_eq!(cache.device_of(&key), Some(Device::Cpu));
        assert_eq!(cache.is_available(&key), Some(true));
    }

    #[tokio::test]
    async fn failed_key_stays_unavailable_without_retrying() {
        let mut cache = ModelCache::with_placement(Placement::cpu());
        let counters = Counters::default();
        let key = ModelKey::single("missing");

        let first = cache
            .get::<Fake, _, _, _>(key.clone(), "missing", counters.failing())
            .await;
        let Loaded::Unavailable(unavailable) = first else {
            panic!("construction failure must yield the unavailable sentinel");
        };
        assert_eq!(unavailable.key, key);
        assert!(unavailable.reason.contains("network unreachable"));

        let second = cache
            .get::<Fake, _, _, _>(key.clone(), "missing", counters.constructor())
            .await;
        assert!(!second.is_ready());
        assert_eq!(counters.built(), 1, "failed keys are never rebuilt");
        assert_eq!(cache.is_available(&key), Some(false));
    }

    #[tokio::test]
    async fn failure_does_not_affect_other_keys() {
        let mut cache = ModelCache::with_placement(Placement::cpu());
        let counters = Counters::default();

        let broken = cache
            .get::<Fake, _, _, _>(ModelKey::single("broken"), "broken", counters.failing())
            .await;
        assert!(!broken.is_ready());

        let healthy = cache
            .get::<Fake, _, _, _>(ModelKey::single("healthy"), "healthy", counters.constructor())
            .await;
        assert!(healthy.is_ready());
        assert_eq!(cache.is_available(&ModelKey::single("healthy")), Some(true));
        assert_eq!(cache.is_available(&ModelKey::single("unknown")), None);
    }

    #[tokio::test]
    async fn compound_reuses_cached_auxiliary() {
        let mut cache = ModelCache::with_placement(Placement::cpu());
        let counters = Counters::default();
        let aux_key = ModelKey::single("controlnet");

        let aux = cache
            .get::<Fake, _, _, _>(aux_key.clone(), "controlnet", counters.constructor())
            .await
            .ready()
            .expect("auxiliary loads");

        let builds = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let builds = Arc::clone(&builds);
            let compound = cache
                .get_compound(
                    ModelKey::compound("base", "controlnet"),
                    aux_key.clone(),
                    "controlnet",
                    counters.constructor(),
                    move |part, _device| {
                        builds.fetch_add(1, Ordering::SeqCst);
                        std::future::ready(Ok::<_, anyhow::Error>(Composed { part }))
                    },
                )
                .await
                .ready()
                .expect("compound loads");
            assert!(compound.read().expect("readable").part.ptr_eq(&aux));
        }

        assert_eq!(counters.built(), 1, "auxiliary must not be rebuilt");
        assert_eq!(builds.load(Ordering::SeqCst), 1, "compound is built once");
        assert_eq!(
            ModelKey::compound("base", "controlnet").to_string(),
            "base+controlnet"
        );
    }

    #[tokio::test]
    async fn compound_fails_when_auxiliary_fails() {
        let mut cache = ModelCache::with_placement(Placement::cpu());
        let counters = Counters::default();
        let key = ModelKey::compound("base", "broken");

        let compound = cache
            .get_compound(
                key.clone(),
                ModelKey::single("broken"),
                "broken",
                counters.failing(),
                |part, _device| async move { Ok::<_, anyhow::Error>(Composed { part }) },
            )
            .await;

        let Loaded::Unavailable(unavailable) = compound else {
            panic!("compound must be unavailable");
        };
        assert!(unavailable.reason.contains("broken"));
        assert_eq!(cache.is_available(&key), Some(false));
        assert_eq!(cache.is_available(&ModelKey::single("broken")), Some(false));
    }

    #[tokio::test]
    async fn set_device_moves_every_entry() {
        let mut cache = ModelCache::with_placement(Placement::cpu());
        let counters = Counters::default();

        for name in ["a", "b", "c"] {
            let loaded = cache
                .get::<Fake, _, _, _>(ModelKey::named(name), name, counters.constructor())
                .await;
            assert!(loaded.is_ready());
        }

        cache.set_placement(fake_cuda());

        assert_eq!(cache.device(), Device::Cuda(0));
        assert_eq!(counters.moves(), 3);
        for key in cache.keys() {
            assert_eq!(cache.device_of(key), Some(Device::Cuda(0)));
        }

        cache.set_device(Device::Cpu).expect("cpu is always available");
        assert_eq!(counters.moves(), 6);
        assert!(cache.keys().all(|key| cache.device_of(key) == Some(Device::Cpu)));
    }

    #[tokio::test]
    async fn entry_that_cannot_move_becomes_unavailable() {
        let mut cache = ModelCache::with_placement(Placement::cpu());
        let counters = Counters::default();

        let sticky = cache
            .get::<Fake, _, _, _>(ModelKey::named("sticky"), "sticky", counters.constructor())
            .await;
        assert!(sticky.is_ready());
        let other = cache
            .get::<Fake, _, _, _>(ModelKey::named("other"), "other", counters.constructor())
            .await;
        assert!(other.is_ready());

        cache.set_placement(fake_cuda());

        assert_eq!(cache.is_available(&ModelKey::named("sticky")), Some(false));
        assert_eq!(cache.device_of(&ModelKey::named("sticky")), None);
        assert_eq!(
            cache.device_of(&ModelKey::named("other")),
            Some(Device::Cuda(0))
        );
    }

    #[tokio::test]
    async fn models_built_after_a_switch_land_on_the_new_device() {
        let mut cache = ModelCache::with_placement(Placement::cpu());
        let counters = Counters::default();
        cache.set_placement(fake_cuda());

        let key = ModelKey::single("late");
        let loaded = cache
            .get::<Fake, _, _, _>(key.clone(), "late", counters.constructor())
            .await;
        assert!(loaded.is_ready());
        assert_eq!(cache.device_of(&key), Some(Device::Cuda(0)));
    }

    #[tokio::test]
    async fn requesting_a_different_type_is_unavailable() {
        let mut cache = ModelCache::with_placement(Placement::cpu());
        let counters = Counters::default();
        let key = ModelKey::single("fake");

        let fake = cache
            .get::<Fake, _, _, _>(key.clone(), "fake", counters.constructor())
            .await;
        assert!(fake.is_ready());

        let wrong = cache
            .get::<Composed, _, _, _>(key.clone(), (), |_, _| async {
                Err::<Composed, _>(anyhow!("must not be called"))
            })
            .await;
        assert!(!wrong.is_ready());
        assert_eq!(cache.is_available(&key), Some(true));
    }
}
