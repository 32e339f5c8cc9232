//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! DSQ 目录：自定义 DSQ 的 ID -> 实例映射
//!
//! 对应 Linux 的 `dsq_hash` (rhashtable + RCU)。
//!
//! 读多写少。读者只克隆当前快照的 `Arc`，不会等待写者重建映射；
//! 写者在锁外复制并修改映射，再在很短的写临界区内替换指针。
//! 被替换的旧快照在最后一个读者释放后回收。

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Mutex, RwLock};

use super::dsq::Dsq;
use super::error::{ScxError, ScxResult};
use super::types::{DsqId, DsqOrdering};

type DsqMap = BTreeMap<DsqId, Arc<Dsq>>;

pub struct DsqDirectory {
    current: RwLock<Arc<DsqMap>>,
    /// 串行化写者
    writer: Mutex<()>,
}

impl DsqDirectory {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(BTreeMap::new())),
            writer: Mutex::new(()),
        }
    }

    /// 当前快照
    pub fn snapshot(&self) -> Arc<DsqMap> {
        self.current.read().clone()
    }

    pub fn lookup(&self, id: DsqId) -> Option<Arc<Dsq>> {
        self.current.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.current.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<DsqId> {
        self.snapshot().keys().copied().collect()
    }

    fn publish(&self, map: DsqMap) {
        *self.current.write() = Arc::new(map);
    }

    /// 创建自定义 DSQ
    ///
    /// - ID 带有 builtin 位：`InvalidArgument`
    /// - ID 已存在：`Exists`
    pub fn create(&self, id: DsqId, ordering: DsqOrdering) -> ScxResult<Arc<Dsq>> {
        if !id.is_custom() {
            return Err(ScxError::InvalidArgument);
        }

        let _w = self.writer.lock();
        let old = self.snapshot();
        if old.contains_key(&id) {
            return Err(ScxError::Exists);
        }

        let dsq = Arc::new(Dsq::new(id, ordering));
        let mut map = (*old).clone();
        map.insert(id, dsq.clone());
        self.publish(map);
        Ok(dsq)
    }

    /// 从目录中移除自定义 DSQ 并返回它
    ///
    /// 返回的 DSQ 已被标记为销毁；残留任务由调用者迁移到 fallback DSQ
    pub fn remove(&self, id: DsqId) -> ScxResult<Arc<Dsq>> {
        if !id.is_custom() {
            return Err(ScxError::InvalidArgument);
        }

        let _w = self.writer.lock();
        let old = self.snapshot();
        let Some(dsq) = old.get(&id).cloned() else {
            return Err(ScxError::Unavailable);
        };

        let mut map = (*old).clone();
        map.remove(&id);
        dsq.mark_dead();
        self.publish(map);
        Ok(dsq)
    }

    /// 清空目录，返回所有被移除的 DSQ
    pub fn clear(&self) -> Vec<Arc<Dsq>> {
        let _w = self.writer.lock();
        let old = self.snapshot();
        self.publish(BTreeMap::new());
        old.values()
            .map(|dsq| {
                dsq.mark_dead();
                dsq.clone()
            })
            .collect()
    }
}

impl Default for DsqDirectory {
    fn default() -> Self {
        Self::new()
    }
}
