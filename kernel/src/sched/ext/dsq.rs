//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 调度队列 (Dispatch Queue, DSQ)
//!
//! 对应 Linux 的 `struct scx_dispatch_q` (include/linux/sched/ext.h)
//!
//! 一个 DSQ 同时包含 FIFO 链和按 vtime 排序的优先树，二者共用一把锁。
//! 任务只会出现在其中一个容器里，见 [`DsqLink`]。
//!
//! 加锁顺序：
//! - 多个 DSQ 按 ID 从小到大加锁
//! - 先 DSQ 锁，后任务节点锁

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use log::debug;
use spin::{Mutex, MutexGuard};

use super::error::{ScxError, ScxResult};
use super::state::{ScxTaskState, StateSnapshot};
use super::task::{DsqLink, TaskFlags, TaskRef};
use super::types::{DsqId, DsqOrdering, EnqFlags, Pid};

struct DsqInner {
    /// FIFO 链：位置 -> 任务，头插取更小的位置
    fifo: BTreeMap<i64, TaskRef>,
    /// 优先树：(vtime, seq) -> 任务
    priq: BTreeMap<(u64, u64), TaskRef>,
    /// 下一个序列号
    seq: u64,
    head: i64,
    tail: i64,
    /// 已被销毁，拒绝新的插入
    dead: bool,
}

impl DsqInner {
    fn len(&self) -> usize {
        self.fifo.len() + self.priq.len()
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn link(&mut self, task: &TaskRef, link: DsqLink) {
        match link {
            DsqLink::Fifo(pos) => {
                self.fifo.insert(pos, task.clone());
            }
            DsqLink::Vtime(vtime, seq) => {
                self.priq.insert((vtime, seq), task.clone());
            }
            DsqLink::Unlinked => {}
        }
    }

    fn unlink(&mut self, link: DsqLink) -> Option<TaskRef> {
        match link {
            DsqLink::Fifo(pos) => self.fifo.remove(&pos),
            DsqLink::Vtime(vtime, seq) => self.priq.remove(&(vtime, seq)),
            DsqLink::Unlinked => None,
        }
    }

    /// 为新任务分配链接位置
    fn place(&mut self, ordering: DsqOrdering, flags: EnqFlags, vtime: u64, seq: u64) -> DsqLink {
        match ordering {
            DsqOrdering::Vtime => DsqLink::Vtime(vtime, seq),
            DsqOrdering::Fifo if flags.contains(EnqFlags::HEAD) => {
                self.head -= 1;
                DsqLink::Fifo(self.head)
            }
            DsqOrdering::Fifo => {
                let pos = self.tail;
                self.tail += 1;
                DsqLink::Fifo(pos)
            }
        }
    }

    fn front(&self, prefer: DsqOrdering) -> Option<&TaskRef> {
        let fifo = || self.fifo.values().next();
        let priq = || self.priq.values().next();
        match prefer {
            DsqOrdering::Fifo => fifo().or_else(priq),
            DsqOrdering::Vtime => priq().or_else(fifo),
        }
    }

    fn ordered(&self, prefer: DsqOrdering) -> Vec<TaskRef> {
        let mut out = Vec::with_capacity(self.len());
        match prefer {
            DsqOrdering::Fifo => {
                out.extend(self.fifo.values().cloned());
                out.extend(self.priq.values().cloned());
            }
            DsqOrdering::Vtime => {
                out.extend(self.priq.values().cloned());
                out.extend(self.fifo.values().cloned());
            }
        }
        out
    }
}

/// 调度队列
pub struct Dsq {
    id: DsqId,
    ordering: DsqOrdering,
    /// 队列长度的无锁镜像
    nr: AtomicUsize,
    inner: Mutex<DsqInner>,
}

impl Dsq {
    pub fn new(id: DsqId, ordering: DsqOrdering) -> Self {
        // 内建 DSQ 只支持 FIFO
        let ordering = if id.is_builtin() {
            DsqOrdering::Fifo
        } else {
            ordering
        };
        Self {
            id,
            ordering,
            nr: AtomicUsize::new(0),
            inner: Mutex::new(DsqInner {
                fifo: BTreeMap::new(),
                priq: BTreeMap::new(),
                seq: 0,
                head: 0,
                tail: 0,
                dead: false,
            }),
        }
    }

    pub fn id(&self) -> DsqId {
        self.id
    }

    /// 创建时指定的排序方式
    pub fn ordering(&self) -> DsqOrdering {
        self.ordering
    }

    /// 队列中的任务数（无锁读取）
    pub fn nr_queued(&self) -> usize {
        self.nr.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.nr_queued() == 0
    }

    pub fn is_dead(&self) -> bool {
        self.inner.lock().dead
    }

    /// 标记为已销毁，之后的插入返回 `Unavailable`
    pub(crate) fn mark_dead(&self) {
        self.inner.lock().dead = true;
    }

    fn sync_nr(&self, inner: &DsqInner) {
        self.nr.store(inner.len(), Ordering::Release);
    }

    /// 插入任务，状态按当前观察值迁移到 QUEUED
    pub fn insert(self: &Arc<Self>, task: &TaskRef, ordering: DsqOrdering, flags: EnqFlags) -> ScxResult<()> {
        self.insert_checked(task, ordering, flags, task.state())
    }

    /// 插入任务，`seen` 为调用者之前观察到的状态快照
    ///
    /// - 任务已在某个 DSQ 中：`InvalidState`
    /// - 内建 DSQ 上的 vtime 插入：`InvalidArgument`
    /// - DSQ 已销毁：`Unavailable`
    /// - 状态字已变化：`StaleState`
    pub fn insert_checked(
        self: &Arc<Self>,
        task: &TaskRef,
        ordering: DsqOrdering,
        flags: EnqFlags,
        seen: StateSnapshot,
    ) -> ScxResult<()> {
        if ordering == DsqOrdering::Vtime && self.id.is_builtin() {
            return Err(ScxError::InvalidArgument);
        }

        let mut inner = self.inner.lock();
        if inner.dead {
            return Err(ScxError::Unavailable);
        }

        let mut node = task.node.lock();
        if node.dsq.is_some() {
            return Err(ScxError::InvalidState);
        }

        task.transition(seen, ScxTaskState::Queued)?;

        let seq = inner.next_seq();
        let link = inner.place(ordering, flags, task.vtime(), seq);
        inner.link(task, link);
        node.dsq = Some(self.clone());
        node.link = link;
        node.seq = seq;
        drop(node);

        task.set_dsq_id(self.id);
        task.set_flags(TaskFlags::QUEUED);
        if ordering == DsqOrdering::Vtime {
            task.set_flags(TaskFlags::DSQ_ON_PRIQ);
        } else {
            task.clear_flags(TaskFlags::DSQ_ON_PRIQ);
        }
        self.sync_nr(&inner);
        Ok(())
    }

    /// 调用者持有 DSQ 锁，解除任务的链接
    fn unlink_locked(&self, inner: &mut DsqInner, task: &TaskRef) -> ScxResult<()> {
        let mut node = task.node.lock();
        match &node.dsq {
            Some(dsq) if core::ptr::eq(Arc::as_ptr(dsq), self) => {}
            _ => return Err(ScxError::NotQueued),
        }
        inner.unlink(node.link);
        node.dsq = None;
        node.link = DsqLink::Unlinked;
        drop(node);

        task.set_dsq_id(DsqId::INVALID);
        task.clear_flags(TaskFlags::QUEUED | TaskFlags::DSQ_ON_PRIQ);
        self.sync_nr(inner);
        Ok(())
    }

    /// 从本 DSQ 移除任务，不改变状态字
    pub fn remove(&self, task: &TaskRef) -> ScxResult<()> {
        let mut inner = self.inner.lock();
        self.unlink_locked(&mut inner, task)
    }

    /// 移除任务并把状态从 QUEUED 迁移到 `to`，两者在同一临界区内完成
    pub(crate) fn remove_transition(&self, task: &TaskRef, to: ScxTaskState) -> ScxResult<StateSnapshot> {
        let mut inner = self.inner.lock();
        {
            let node = task.node.lock();
            match &node.dsq {
                Some(dsq) if core::ptr::eq(Arc::as_ptr(dsq), self) => {}
                _ => return Err(ScxError::NotQueued),
            }
        }
        let seen = task.state();
        if seen.state() != ScxTaskState::Queued {
            return Err(ScxError::StaleState);
        }
        let snap = task.transition(seen, to)?;
        self.unlink_locked(&mut inner, task)?;
        Ok(snap)
    }

    pub fn peek_front(&self) -> Option<TaskRef> {
        self.inner.lock().front(self.ordering).cloned()
    }

    /// 取出队首任务，不改变状态字
    pub fn pop_front(&self) -> Option<TaskRef> {
        let mut inner = self.inner.lock();
        let task = inner.front(self.ordering).cloned()?;
        self.unlink_locked(&mut inner, &task).ok()?;
        Some(task)
    }

    /// 认领队首任务：QUEUED -> DISPATCHING 并解除链接，返回任务和迁移后的快照
    ///
    /// 队首任务正在被并发迁移时返回 `StaleState`，由调用者决定是否重试
    pub fn claim_front(&self) -> ScxResult<Option<(TaskRef, StateSnapshot)>> {
        let mut inner = self.inner.lock();
        let Some(task) = inner.front(self.ordering).cloned() else {
            return Ok(None);
        };

        let seen = task.state();
        if seen.state() != ScxTaskState::Queued {
            return Err(ScxError::StaleState);
        }
        let snap = task.transition(seen, ScxTaskState::Dispatching)?;
        self.unlink_locked(&mut inner, &task)?;
        Ok(Some((task, snap)))
    }

    /// 认领指定任务（用于 dispatch 缓冲中的跨 DSQ 迁移）
    ///
    /// `seen` 必须仍是当前状态，否则返回 `StaleState`
    pub(crate) fn claim(&self, task: &TaskRef, seen: StateSnapshot) -> ScxResult<StateSnapshot> {
        let mut inner = self.inner.lock();
        {
            let node = task.node.lock();
            match &node.dsq {
                Some(dsq) if core::ptr::eq(Arc::as_ptr(dsq), self) => {}
                _ => return Err(ScxError::StaleState),
            }
        }
        let snap = task.transition(seen, ScxTaskState::Dispatching)?;
        self.unlink_locked(&mut inner, task)?;
        Ok(snap)
    }

    /// 按队列顺序列出任务 PID（诊断用）
    pub fn iter_pids(&self) -> Vec<Pid> {
        self.inner
            .lock()
            .ordered(self.ordering)
            .iter()
            .map(|t| t.pid())
            .collect()
    }

    /// 按 ID 顺序锁住两个不同的 DSQ，返回 (src, dst) 对应的守卫
    fn lock_pair<'a>(
        src: &'a Dsq,
        dst: &'a Dsq,
    ) -> (MutexGuard<'a, DsqInner>, MutexGuard<'a, DsqInner>) {
        if src.id < dst.id {
            let s = src.inner.lock();
            let d = dst.inner.lock();
            (s, d)
        } else {
            let d = dst.inner.lock();
            let s = src.inner.lock();
            (s, d)
        }
    }

    /// 把 `src` 中的全部任务整体迁移到 `dst`，保持相对顺序
    ///
    /// 每个任务的状态做一次 QUEUED -> QUEUED 迁移（代数递增），
    /// 使迁移前拿到的快照全部失效。已被拆除（NONE）但尚未摘除的任务
    /// 只迁移链接，状态保持 NONE。返回迁移的任务数。
    pub fn move_all(src: &Arc<Dsq>, dst: &Arc<Dsq>) -> ScxResult<usize> {
        if src.id == dst.id {
            return Ok(0);
        }

        let (mut s, mut d) = Self::lock_pair(src, dst);
        if d.dead {
            return Err(ScxError::Unavailable);
        }

        let tasks = s.ordered(src.ordering);
        for task in &tasks {
            let mut node = task.node.lock();
            let old = node.link;
            s.unlink(old);

            // 目标是内建 DSQ 时退化为 FIFO
            let ordering = match old {
                DsqLink::Vtime(..) if !dst.id.is_builtin() => DsqOrdering::Vtime,
                _ => DsqOrdering::Fifo,
            };
            let seq = d.next_seq();
            let vtime = match old {
                DsqLink::Vtime(vtime, _) => vtime,
                _ => task.vtime(),
            };
            let link = d.place(ordering, EnqFlags::empty(), vtime, seq);
            d.link(task, link);
            node.dsq = Some(dst.clone());
            node.link = link;
            node.seq = seq;
            drop(node);

            // 链接在锁内的任务只能是 QUEUED，或者已被拆除（NONE），由拆除方摘除
            if task
                .transition_from(ScxTaskState::Queued, ScxTaskState::Queued)
                .is_err()
            {
                debug!(
                    "sched_ext: pid {} detached while moving to {:?}",
                    task.pid(),
                    dst.id
                );
            }
            task.set_dsq_id(dst.id);
            if ordering == DsqOrdering::Fifo {
                task.clear_flags(TaskFlags::DSQ_ON_PRIQ);
            }
        }

        src.sync_nr(&s);
        dst.sync_nr(&d);
        Ok(tasks.len())
    }
}

/// 把任务从它当前所在的 DSQ 中移除（不改变状态字）
///
/// 在读取所属 DSQ 和加锁之间任务可能被并发迁移，此时重新读取；
/// 任务不在任何 DSQ 中返回 `NotQueued`
pub(crate) fn unlink_task(task: &TaskRef, max_retries: usize) -> ScxResult<Arc<Dsq>> {
    for _ in 0..=max_retries {
        let Some(dsq) = task.current_dsq() else {
            return Err(ScxError::NotQueued);
        };
        match dsq.remove(task) {
            Ok(()) => return Ok(dsq),
            Err(ScxError::NotQueued) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(ScxError::StaleState)
}

impl fmt::Debug for Dsq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dsq")
            .field("id", &self.id)
            .field("ordering", &self.ordering)
            .field("nr", &self.nr_queued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::ext::task::ScxTask;

    fn custom(id: u64, ordering: DsqOrdering) -> Arc<Dsq> {
        Arc::new(Dsq::new(DsqId::custom(id).unwrap(), ordering))
    }

    fn runnable(pid: Pid) -> TaskRef {
        let t = ScxTask::new_ref(pid);
        t.transition_from(ScxTaskState::None, ScxTaskState::Queueing).unwrap();
        t
    }

    #[test]
    fn test_fifo_order() {
        // 测试 1: 按 A, B, C 插入，依次弹出 A, B, C
        let d1 = custom(1, DsqOrdering::Fifo);
        let (a, b, c) = (runnable(1), runnable(2), runnable(3));
        for t in [&a, &b, &c] {
            d1.insert(t, DsqOrdering::Fifo, EnqFlags::empty()).unwrap();
        }
        assert_eq!(d1.nr_queued(), 3);
        assert_eq!(d1.pop_front().unwrap().pid(), 1);
        assert_eq!(d1.pop_front().unwrap().pid(), 2);
        assert_eq!(d1.pop_front().unwrap().pid(), 3);
        assert!(d1.pop_front().is_none());
        assert!(d1.is_empty());
    }

    #[test]
    fn test_vtime_order() {
        let d = custom(2, DsqOrdering::Vtime);
        let (a, b) = (runnable(1), runnable(2));
        a.set_vtime(10);
        b.set_vtime(5);
        d.insert(&a, DsqOrdering::Vtime, EnqFlags::empty()).unwrap();
        d.insert(&b, DsqOrdering::Vtime, EnqFlags::empty()).unwrap();
        assert!(a.flags().contains(TaskFlags::DSQ_ON_PRIQ));
        assert_eq!(d.pop_front().unwrap().pid(), 2);
        assert_eq!(d.pop_front().unwrap().pid(), 1);
    }

    #[test]
    fn test_vtime_tie_broken_by_seq() {
        let d = custom(3, DsqOrdering::Vtime);
        let tasks: Vec<_> = (1..=4).map(runnable).collect();
        for t in &tasks {
            t.set_vtime(7);
            d.insert(t, DsqOrdering::Vtime, EnqFlags::empty()).unwrap();
        }
        assert_eq!(d.iter_pids(), [1, 2, 3, 4]);
    }

    #[test]
    fn test_head_insert() {
        let d = custom(4, DsqOrdering::Fifo);
        let (a, b, c) = (runnable(1), runnable(2), runnable(3));
        d.insert(&a, DsqOrdering::Fifo, EnqFlags::empty()).unwrap();
        d.insert(&b, DsqOrdering::Fifo, EnqFlags::empty()).unwrap();
        d.insert(&c, DsqOrdering::Fifo, EnqFlags::HEAD).unwrap();
        assert_eq!(d.iter_pids(), [3, 1, 2]);
    }

    #[test]
    fn test_insert_sets_membership_and_seq() {
        let d = custom(5, DsqOrdering::Fifo);
        let (a, b) = (runnable(1), runnable(2));
        d.insert(&a, DsqOrdering::Fifo, EnqFlags::empty()).unwrap();
        d.insert(&b, DsqOrdering::Fifo, EnqFlags::empty()).unwrap();
        assert_eq!(a.dsq_id(), d.id());
        assert_eq!(a.state().state(), ScxTaskState::Queued);
        assert!(a.flags().contains(TaskFlags::QUEUED));
        assert!(b.dsq_seq() > a.dsq_seq(), "sequence numbers must increase");
    }

    #[test]
    fn test_double_insert_rejected() {
        let d1 = custom(6, DsqOrdering::Fifo);
        let d2 = custom(7, DsqOrdering::Fifo);
        let a = runnable(1);
        d1.insert(&a, DsqOrdering::Fifo, EnqFlags::empty()).unwrap();
        assert_eq!(
            d2.insert(&a, DsqOrdering::Fifo, EnqFlags::empty()),
            Err(ScxError::InvalidState)
        );
        assert_eq!(d2.nr_queued(), 0);
        assert_eq!(a.dsq_id(), d1.id());
    }

    #[test]
    fn test_remove_wrong_dsq() {
        let d1 = custom(8, DsqOrdering::Fifo);
        let d2 = custom(9, DsqOrdering::Fifo);
        let a = runnable(1);
        d1.insert(&a, DsqOrdering::Fifo, EnqFlags::empty()).unwrap();
        assert_eq!(d2.remove(&a), Err(ScxError::NotQueued));
        d1.remove(&a).unwrap();
        assert!(!a.is_queued());
        assert_eq!(a.dsq_link(), DsqLink::Unlinked);
        assert_eq!(d1.remove(&a), Err(ScxError::NotQueued));
    }

    #[test]
    fn test_builtin_rejects_vtime() {
        let global = Arc::new(Dsq::new(DsqId::GLOBAL, DsqOrdering::Vtime));
        assert_eq!(global.ordering(), DsqOrdering::Fifo);
        let a = runnable(1);
        assert_eq!(
            global.insert(&a, DsqOrdering::Vtime, EnqFlags::empty()),
            Err(ScxError::InvalidArgument)
        );
        assert_eq!(a.state().state(), ScxTaskState::Queueing);
    }

    #[test]
    fn test_dead_dsq_rejects_insert() {
        let d = custom(10, DsqOrdering::Fifo);
        d.mark_dead();
        let a = runnable(1);
        assert_eq!(
            d.insert(&a, DsqOrdering::Fifo, EnqFlags::empty()),
            Err(ScxError::Unavailable)
        );
    }

    #[test]
    fn test_claim_front() {
        let d = custom(11, DsqOrdering::Fifo);
        let a = runnable(1);
        d.insert(&a, DsqOrdering::Fifo, EnqFlags::empty()).unwrap();
        let (claimed, snap) = d.claim_front().unwrap().unwrap();
        assert_eq!(claimed.pid(), 1);
        assert_eq!(snap.state(), ScxTaskState::Dispatching);
        assert_eq!(claimed.state(), snap);
        assert!(!claimed.is_queued());
        assert!(d.claim_front().unwrap().is_none());
    }

    #[test]
    fn test_claim_with_stale_snapshot() {
        let src = custom(12, DsqOrdering::Fifo);
        let dst = custom(13, DsqOrdering::Fifo);
        let a = runnable(1);
        src.insert(&a, DsqOrdering::Fifo, EnqFlags::empty()).unwrap();
        let seen = a.state();
        // move_all 使旧快照失效
        Dsq::move_all(&src, &dst).unwrap();
        assert_eq!(dst.claim(&a, seen), Err(ScxError::StaleState));
        assert!(dst.claim(&a, a.state()).is_ok());
    }

    #[test]
    fn test_move_all_preserves_order() {
        let src = custom(20, DsqOrdering::Fifo);
        let dst = custom(21, DsqOrdering::Fifo);
        let tasks: Vec<_> = (1..=5).map(runnable).collect();
        for t in &tasks {
            src.insert(t, DsqOrdering::Fifo, EnqFlags::empty()).unwrap();
        }
        let extra = runnable(9);
        dst.insert(&extra, DsqOrdering::Fifo, EnqFlags::empty()).unwrap();

        assert_eq!(Dsq::move_all(&src, &dst), Ok(5));
        assert!(src.is_empty());
        assert_eq!(dst.nr_queued(), 6);
        assert_eq!(dst.iter_pids(), [9, 1, 2, 3, 4, 5]);
        for t in &tasks {
            assert_eq!(t.dsq_id(), dst.id());
        }
    }

    #[test]
    fn test_move_all_to_builtin_flattens_vtime() {
        let src = custom(22, DsqOrdering::Vtime);
        let global = Arc::new(Dsq::new(DsqId::GLOBAL, DsqOrdering::Fifo));
        let (a, b) = (runnable(1), runnable(2));
        a.set_vtime(30);
        b.set_vtime(3);
        src.insert(&a, DsqOrdering::Vtime, EnqFlags::empty()).unwrap();
        src.insert(&b, DsqOrdering::Vtime, EnqFlags::empty()).unwrap();
        Dsq::move_all(&src, &global).unwrap();
        assert_eq!(global.iter_pids(), [2, 1]);
        assert!(!a.flags().contains(TaskFlags::DSQ_ON_PRIQ));
    }

    #[test]
    fn test_move_all_keeps_detached_task_none() {
        // 测试 1: 拆除方已经写入 NONE，但还没来得及摘除
        let src = custom(24, DsqOrdering::Fifo);
        let dst = custom(25, DsqOrdering::Fifo);
        let (a, b) = (runnable(1), runnable(2));
        src.insert(&a, DsqOrdering::Fifo, EnqFlags::empty()).unwrap();
        src.insert(&b, DsqOrdering::Fifo, EnqFlags::empty()).unwrap();
        let detached = a.force_state(ScxTaskState::None);
        let seen_b = b.state();

        // 测试 2: 迁移不会把 NONE 改回 QUEUED，存活任务的快照失效
        assert_eq!(Dsq::move_all(&src, &dst), Ok(2));
        assert_eq!(a.state(), detached);
        assert_eq!(b.state().state(), ScxTaskState::Queued);
        assert_ne!(b.state(), seen_b);

        // 测试 3: 拆除方随后从新的 DSQ 中摘除
        assert_eq!(unlink_task(&a, 4).unwrap().id(), dst.id());
        assert_eq!(dst.iter_pids(), [2]);
    }

    #[test]
    fn test_unlink_task() {
        let d = custom(30, DsqOrdering::Fifo);
        let a = runnable(1);
        assert_eq!(unlink_task(&a, 4).err(), Some(ScxError::NotQueued));
        d.insert(&a, DsqOrdering::Fifo, EnqFlags::empty()).unwrap();
        let from = unlink_task(&a, 4).unwrap();
        assert_eq!(from.id(), d.id());
        assert!(d.is_empty());
    }
}
