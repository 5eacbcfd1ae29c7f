use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};

use crate::error::ClassifyError;
use crate::store::ArtifactLoader;

struct Slot<M> {
    domain: String,
    model: Arc<M>,
}

/// 单槽位的领域模型缓存
///
/// 任意时刻内存中最多只保留一个领域的模型，切换领域时先释放旧模型再加载新模型。
/// 槽位有自己独立的锁，与发布锁互不相干。
pub struct ModelCache<L: ArtifactLoader> {
    loader: L,
    slot: Mutex<Option<Slot<L::Model>>>,
    disk_loads: AtomicUsize,
}

impl<L: ArtifactLoader> ModelCache<L> {
    pub fn new(loader: L) -> Self {
        Self { loader, slot: Mutex::new(None), disk_loads: AtomicUsize::new(0) }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Slot<L::Model>>> {
        // 槽位内容总是完整替换，锁中毒后数据依然可用
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 获取某个领域的模型，必要时从磁盘加载
    ///
    /// 模型不存在或已损坏时返回 [`ClassifyError::Unavailable`]，此时槽位为空。
    pub fn load(&self, domain: &str) -> Result<Arc<L::Model>, ClassifyError> {
        let mut slot = self.slot();
        if let Some(current) = slot.as_ref() {
            if current.domain == domain {
                return Ok(current.model.clone());
            }
            info!("释放领域 `{}` 的模型", current.domain);
        }
        // 先释放旧模型，避免两个模型同时驻留内存
        *slot = None;

        debug!("从磁盘加载领域 `{domain}` 的模型");
        self.disk_loads.fetch_add(1, Ordering::Relaxed);
        match self.loader.load(domain) {
            Ok(model) => {
                let model = Arc::new(model);
                *slot = Some(Slot { domain: domain.to_string(), model: model.clone() });
                info!("领域 `{domain}` 的模型已加载");
                Ok(model)
            }
            Err(e) => {
                warn!("领域 `{domain}` 的模型不可用: {e:#}");
                Err(ClassifyError::unavailable(domain, format!("{e:#}")))
            }
        }
    }

    /// 使某个领域的缓存失效，下一次 `load` 会重新读取磁盘
    pub fn invalidate(&self, domain: &str) {
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|s| s.domain == domain) {
            debug!("领域 `{domain}` 的缓存已失效");
            *slot = None;
        }
    }

    /// 当前驻留内存的领域
    pub fn active_domain(&self) -> Option<String> {
        self.slot().as_ref().map(|s| s.domain.clone())
    }

    /// 累计的磁盘加载次数
    pub fn disk_loads(&self) -> usize {
        self.disk_loads.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use anyhow::{Result, anyhow};
    use opencv::core::Mat;

    use super::*;
    use crate::store::{Recognition, Recognizer};

    /// 永远返回固定标签的模型
    pub struct FixedModel {
        pub labels: Vec<String>,
        pub confidence: f64,
        pub generation: usize,
    }

    impl Recognizer for FixedModel {
        fn labels(&self) -> &[String] {
            &self.labels
        }

        fn recognize(&self, _image: &Mat) -> Result<Recognition> {
            Ok(Recognition { label: self.labels[0].clone(), confidence: self.confidence })
        }
    }

    /// 内存中的模型仓库，每次加载都会生成一个新的实例
    #[derive(Default)]
    pub struct MemoryLoader {
        pub domains: HashMap<String, (String, f64)>,
        pub generation: AtomicUsize,
    }

    impl MemoryLoader {
        pub fn with(mut self, domain: &str, label: &str, confidence: f64) -> Self {
            self.domains.insert(domain.to_string(), (label.to_string(), confidence));
            self
        }
    }

    impl ArtifactLoader for MemoryLoader {
        type Model = FixedModel;

        fn load(&self, domain: &str) -> Result<FixedModel> {
            let (label, confidence) =
                self.domains.get(domain).ok_or_else(|| anyhow!("领域 `{domain}` 尚未训练"))?;
            Ok(FixedModel {
                labels: vec![label.clone()],
                confidence: *confidence,
                generation: self.generation.fetch_add(1, Ordering::Relaxed),
            })
        }
    }

    fn cache() -> ModelCache<MemoryLoader> {
        ModelCache::new(MemoryLoader::default().with("cars", "audi", 0.9).with("fashion", "gucci", 0.8))
    }

    #[test]
    fn same_domain_hits_memory() {
        let cache = cache();
        let a = cache.load("cars").unwrap();
        let b = cache.load("cars").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.disk_loads(), 1);
    }

    #[test]
    fn switching_domain_evicts() {
        let cache = cache();
        let cars = cache.load("cars").unwrap();
        cache.load("fashion").unwrap();
        assert_eq!(cache.active_domain().as_deref(), Some("fashion"));

        let again = cache.load("cars").unwrap();
        assert_eq!(cache.disk_loads(), 3);
        assert!(!Arc::ptr_eq(&cars, &again));
        assert_ne!(cars.generation, again.generation);
    }

    #[test]
    fn missing_domain_is_unavailable() {
        let cache = cache();
        cache.load("cars").unwrap();
        let err = cache.load("food").unwrap_err();
        assert!(matches!(err, ClassifyError::Unavailable { .. }));
        assert_eq!(cache.active_domain(), None);
    }

    #[test]
    fn invalidate_only_matching_domain() {
        let cache = cache();
        cache.load("cars").unwrap();
        cache.invalidate("fashion");
        assert_eq!(cache.active_domain().as_deref(), Some("cars"));
        cache.invalidate("cars");
        assert_eq!(cache.active_domain(), None);

        cache.load("cars").unwrap();
        assert_eq!(cache.disk_loads(), 2);
    }
}
