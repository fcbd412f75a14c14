//! Module mark administration.
//!
//! Marks steer the picker without touching worker processes: an operator
//! cordons or drains a worker and the heartbeat stays untouched. A mark
//! with a TTL is lease-bound, so it clears itself.

use std::sync::Arc;
use std::time::Duration;

use aircast_core::kv::KvStore;
use aircast_core::models::module::subkeys;
use aircast_core::models::{KeyLayout, Mark, MarkLabel, ModuleId, ModuleKind, ModuleState};
use aircast_core::pick::ResourceManager;
use aircast_core::validation::validate_mark_ttl;
use aircast_core::Result;

pub struct ModuleAdminService {
    kv: Arc<dyn KvStore>,
    layout: KeyLayout,
    resources: Arc<ResourceManager>,
}

impl ModuleAdminService {
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, layout: KeyLayout, resources: Arc<ResourceManager>) -> Self {
        Self {
            kv,
            layout,
            resources,
        }
    }

    /// Write a module's mark. `ttl > 0` binds it to a lease so it expires
    /// on its own; `ttl == 0` makes it permanent until deleted.
    pub async fn set_mark(
        &self,
        kind: ModuleKind,
        module_id: &ModuleId,
        label: MarkLabel,
        ttl_seconds: u64,
    ) -> Result<()> {
        validate_mark_ttl(ttl_seconds)?;

        let lease = if ttl_seconds > 0 {
            Some(
                self.kv
                    .lease_grant(Duration::from_secs(ttl_seconds))
                    .await?,
            )
        } else {
            None
        };
        self.kv
            .put(
                &self.layout.module_subkey(kind, module_id, subkeys::MARK),
                serde_json::to_vec(&Mark { label })?,
                lease,
            )
            .await?;
        tracing::info!(
            module_type = %kind,
            module_id = %module_id,
            label = ?label,
            ttl_seconds = ttl_seconds,
            "Mark set"
        );
        Ok(())
    }

    pub async fn clear_mark(&self, kind: ModuleKind, module_id: &ModuleId) -> Result<()> {
        self.kv
            .delete(
                &self.layout.module_subkey(kind, module_id, subkeys::MARK),
                false,
            )
            .await?;
        tracing::info!(module_type = %kind, module_id = %module_id, "Mark cleared");
        Ok(())
    }

    #[must_use]
    pub fn list_modules(&self, kind: ModuleKind) -> Vec<(ModuleId, ModuleState)> {
        self.resources.picker(kind).list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aircast_core::kv::MemoryKv;
    use aircast_core::models::module::{HeartbeatStatus, ModuleHeartbeat};
    use aircast_core::Error;

    async fn setup(kv: &MemoryKv) -> ModuleAdminService {
        let layout = KeyLayout::default();
        let hb = ModuleHeartbeat {
            status: HeartbeatStatus::Healthy,
            host: "127.0.0.1".to_string(),
            capacity: 8,
            started_at: chrono::Utc::now(),
        };
        kv.put(
            &layout.module_subkey(ModuleKind::Mixers, &ModuleId::from("m1"), subkeys::HEARTBEAT),
            serde_json::to_vec(&hb).unwrap(),
            None,
        )
        .await
        .unwrap();
        let resources = Arc::new(ResourceManager::new(Arc::new(kv.clone()), &layout));
        resources.start().await.unwrap();
        ModuleAdminService::new(Arc::new(kv.clone()), layout, resources)
    }

    #[tokio::test]
    async fn test_cordon_removes_from_pick_set() {
        let kv = MemoryKv::new();
        let service = setup(&kv).await;
        let id = ModuleId::from("m1");

        service
            .set_mark(ModuleKind::Mixers, &id, MarkLabel::Cordon, 0)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(matches!(
            service.resources.pick_mixer(),
            Err(Error::NoneAvailable(_))
        ));

        service.clear_mark(ModuleKind::Mixers, &id).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(service.resources.pick_mixer().unwrap(), id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_mark_self_expires() {
        let kv = MemoryKv::new();
        let service = setup(&kv).await;
        let id = ModuleId::from("m1");

        service
            .set_mark(ModuleKind::Mixers, &id, MarkLabel::Drained, 2)
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert!(service.resources.pick_mixer().is_err());

        // Lease lapses and the mark evaporates
        tokio::time::advance(std::time::Duration::from_secs(3)).await;
        for _ in 0..50 {
            tokio::task::yield_now().await;
            if service.resources.pick_mixer().is_ok() {
                break;
            }
        }
        assert_eq!(service.resources.pick_mixer().unwrap(), id);
    }

    #[tokio::test]
    async fn test_ttl_bounds_enforced() {
        let kv = MemoryKv::new();
        let service = setup(&kv).await;
        let result = service
            .set_mark(ModuleKind::Mixers, &ModuleId::from("m1"), MarkLabel::Ready, 100_000)
            .await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
