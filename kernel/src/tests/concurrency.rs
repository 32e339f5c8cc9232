//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 测试：多 CPU 并发
//!
//! 每个线程扮演一个 CPU，持有自己的 [`ScxRq`]。

use std::sync::Arc;
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::common::*;
use crate::sched::ext::{
    CpuId, Dsq, DsqId, DsqOrdering, EnqFlags, Pid, ScxRq, ScxTask, ScxTaskState, TaskRef,
};

const NR_CPUS: CpuId = 4;

#[test]
fn test_no_double_dispatch() {
    // 测试 1: 4 个 CPU 同时从全局 DSQ 取任务，每个任务恰好运行一次
    let (scx, _host) = engine(GlobalFifo);
    let tasks = attach(&scx, 1..=200);
    wake_all(&scx, &tasks);

    let picked: Vec<Vec<Pid>> = thread::scope(|s| {
        let handles: Vec<_> = (0..NR_CPUS)
            .map(|cpu| {
                let scx = &scx;
                s.spawn(move || {
                    let mut rq = ScxRq::new(cpu);
                    let mut picked = Vec::new();
                    loop {
                        match scx.pick_next_task(&mut rq) {
                            Some(task) => {
                                picked.push(task.pid());
                                scx.put_prev_task(&mut rq, false).unwrap();
                            }
                            None => {
                                let local = scx.nr_queued(DsqId::local_on(cpu)).unwrap();
                                if local == 0 && scx.nr_queued(DsqId::GLOBAL).unwrap() == 0 {
                                    break;
                                }
                            }
                        }
                    }
                    picked
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut all: Vec<Pid> = picked.into_iter().flatten().collect();
    all.sort_unstable();
    assert_eq!(all, (1..=200).collect::<Vec<_>>());

    // 测试 2: 每个任务走过的状态迁移数相同，没有重复认领
    // NONE->QUIESCENT->QUEUEING->QUEUED(全局)->DISPATCHING->QUEUED(本地)
    // ->DISPATCHING->RUNNING->STOPPING->QUIESCENT
    for task in &tasks {
        assert_eq!(task.state().state(), ScxTaskState::Quiescent);
        assert_eq!(task.state().generation(), 9, "pid {}", task.pid());
    }
}

#[test]
fn test_dsq_membership_exclusive() {
    // 测试 1: 多线程在 3 个 DSQ 之间随机插入/移除/认领/整体迁移，
    // 任何时刻一个任务至多属于一个 DSQ，任务不会丢失
    let dsqs: Vec<Arc<Dsq>> = (1..=3)
        .map(|id| Arc::new(Dsq::new(DsqId::custom(id).unwrap(), DsqOrdering::Fifo)))
        .collect();
    let tasks: Vec<TaskRef> = (1..=32)
        .map(|pid| {
            let task = ScxTask::new_ref(pid);
            task.force_state(ScxTaskState::Queueing);
            task
        })
        .collect();

    thread::scope(|s| {
        for seed in 0..4u64 {
            let dsqs = &dsqs;
            let tasks = &tasks;
            s.spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                for _ in 0..5000 {
                    let task = &tasks[rng.gen_range(0..tasks.len())];
                    let dsq = &dsqs[rng.gen_range(0..dsqs.len())];
                    let other = &dsqs[rng.gen_range(0..dsqs.len())];
                    match rng.gen_range(0..4) {
                        0 => {
                            let seen = task.state();
                            if seen.state() == ScxTaskState::Queueing {
                                let _ = dsq.insert_checked(task, DsqOrdering::Fifo, EnqFlags::empty(), seen);
                            }
                        }
                        1 => {
                            if let Some(cur) = task.current_dsq() {
                                let _ = cur.remove_transition(task, ScxTaskState::Queueing);
                            }
                        }
                        2 => {
                            if let Ok(Some((claimed, snap))) = dsq.claim_front() {
                                other
                                    .insert_checked(&claimed, DsqOrdering::Fifo, EnqFlags::empty(), snap)
                                    .unwrap();
                            }
                        }
                        _ => {
                            let _ = Dsq::move_all(dsq, other);
                        }
                    }
                }
            });
        }
    });

    let mut nr_queued = 0;
    for task in &tasks {
        let owners: Vec<_> = dsqs
            .iter()
            .filter(|dsq| dsq.iter_pids().contains(&task.pid()))
            .collect();
        match task.state().state() {
            ScxTaskState::Queued => {
                nr_queued += 1;
                assert_eq!(owners.len(), 1, "pid {}", task.pid());
                assert_eq!(task.dsq_id(), owners[0].id());
            }
            ScxTaskState::Queueing => {
                assert!(owners.is_empty(), "pid {}", task.pid());
                assert_eq!(task.dsq_id(), DsqId::INVALID);
            }
            state => panic!("pid {} left in {:?}", task.pid(), state),
        }
    }
    let total: usize = dsqs.iter().map(|dsq| dsq.nr_queued()).sum();
    assert_eq!(total, nr_queued);
}

#[test]
fn test_engine_conserves_tasks() {
    // 测试 1: 4 个 CPU 反复 yield，任务在 D1、全局 DSQ、本地 DSQ 和 CPU 之间流转，
    // 结束时每个任务恰好出现在一个位置
    let (scx, _host) = engine(SharedDsq::fifo());
    let tasks = attach(&scx, 1..=64);
    wake_all(&scx, &tasks);

    let rqs: Vec<ScxRq> = thread::scope(|s| {
        let handles: Vec<_> = (0..NR_CPUS)
            .map(|cpu| {
                let scx = &scx;
                s.spawn(move || {
                    let mut rq = ScxRq::new(cpu);
                    for _ in 0..500 {
                        if rq.curr().is_some() {
                            scx.yield_current(&mut rq);
                            scx.put_prev_task(&mut rq, true).unwrap();
                        }
                        let _ = scx.pick_next_task(&mut rq);
                    }
                    rq
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut seen: Vec<Pid> = scx.dsq_pids(D1).unwrap();
    seen.extend(scx.dsq_pids(DsqId::GLOBAL).unwrap());
    for cpu in 0..NR_CPUS {
        seen.extend(scx.dsq_pids(DsqId::local_on(cpu)).unwrap());
    }
    let running: Vec<Pid> = rqs
        .iter()
        .filter_map(|rq| rq.curr().map(|t| t.pid()))
        .collect();
    seen.extend(&running);
    seen.sort_unstable();
    assert_eq!(seen, (1..=64).collect::<Vec<_>>());

    for task in &tasks {
        let state = task.state().state();
        if running.contains(&task.pid()) {
            assert_eq!(state, ScxTaskState::Running);
        } else {
            assert_eq!(state, ScxTaskState::Queued, "pid {}", task.pid());
        }
    }
    assert!(scx.first_fault().is_none());
}
