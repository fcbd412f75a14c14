//! Module selection over the watched module pools.
//!
//! A [`Picker`] answers "give me a healthy, ready worker" from one pool;
//! [`ResourceManager`] pairs the mixer and janus pools behind their
//! watchers and is what the room manager consults at broadcast start.

use rand::seq::SliceRandom;
use std::sync::Arc;

use crate::kv::KvStore;
use crate::models::{KeyLayout, ModuleId, ModuleKind, ModuleState};
use crate::watch::KeyedWatcher;
use crate::{Error, Result};

/// Health-and-label-aware selector over one module pool.
pub struct Picker {
    kind: ModuleKind,
    watcher: Arc<KeyedWatcher<ModuleState>>,
}

impl Picker {
    #[must_use]
    pub fn new(kind: ModuleKind, watcher: Arc<KeyedWatcher<ModuleState>>) -> Self {
        Self { kind, watcher }
    }

    /// Uniform random choice over the pickable set. The contract is
    /// starvation avoidance, not load balancing.
    pub fn pick(&self) -> Result<ModuleId> {
        let pickable: Vec<String> = self
            .watcher
            .snapshot()
            .into_iter()
            .filter(|(_, state)| state.is_pickable())
            .map(|(id, _)| id)
            .collect();

        let mut rng = rand::thread_rng();
        pickable
            .choose(&mut rng)
            .map(|id| ModuleId::from_string(id.clone()))
            .ok_or_else(|| Error::NoneAvailable(self.kind.as_str().to_string()))
    }

    /// Current state of one module, if known.
    #[must_use]
    pub fn get_state(&self, id: &ModuleId) -> Option<ModuleState> {
        self.watcher.get_cached(id.as_str())
    }

    /// All modules currently in the pool with their states.
    #[must_use]
    pub fn list(&self) -> Vec<(ModuleId, ModuleState)> {
        self.watcher
            .snapshot()
            .into_iter()
            .map(|(id, state)| (ModuleId::from_string(id), state))
            .collect()
    }
}

/// Both worker pools behind their module watchers.
pub struct ResourceManager {
    mixers: Picker,
    januses: Picker,
    mixer_watcher: Arc<KeyedWatcher<ModuleState>>,
    janus_watcher: Arc<KeyedWatcher<ModuleState>>,
}

impl ResourceManager {
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, layout: &KeyLayout) -> Self {
        let mixer_watcher = Arc::new(KeyedWatcher::new(
            kv.clone(),
            layout.modules_root(ModuleKind::Mixers),
        ));
        let janus_watcher = Arc::new(KeyedWatcher::new(
            kv,
            layout.modules_root(ModuleKind::Januses),
        ));
        Self {
            mixers: Picker::new(ModuleKind::Mixers, mixer_watcher.clone()),
            januses: Picker::new(ModuleKind::Januses, janus_watcher.clone()),
            mixer_watcher,
            janus_watcher,
        }
    }

    /// Start both module watchers; returns after both have completed their
    /// first snapshot, so picks are immediately meaningful.
    pub async fn start(&self) -> Result<()> {
        self.mixer_watcher.start().await?;
        self.janus_watcher.start().await?;
        Ok(())
    }

    pub async fn stop(&self) {
        self.janus_watcher.stop().await;
        self.mixer_watcher.stop().await;
    }

    pub fn pick_mixer(&self) -> Result<ModuleId> {
        self.mixers.pick()
    }

    pub fn pick_janus(&self) -> Result<ModuleId> {
        self.januses.pick()
    }

    #[must_use]
    pub fn picker(&self, kind: ModuleKind) -> &Picker {
        match kind {
            ModuleKind::Mixers => &self.mixers,
            ModuleKind::Januses => &self.januses,
        }
    }
}
