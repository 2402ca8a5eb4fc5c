//! 多优先级 FIFO 队列
//!
//! 出队总是返回当前最高优先级桶中最早入队的元素；同一桶内严格 FIFO。
//! 所有读写在同一把锁内完成，按谓词移除与并发入队/出队互斥，被移除的元素不会再被出队。
//! 桶为空即回收，优先级索引不会因瞬时流量无限增长。

use std::collections::{BTreeMap, VecDeque};

use parking_lot::Mutex;

use super::Priority;

struct Buckets<T, P> {
    map: BTreeMap<P, VecDeque<T>>,
    len: usize,
}

/// 线程安全的多优先级队列（多生产者、单消费者场景）
pub struct PriorityQueue<T, P = Priority> {
    inner: Mutex<Buckets<T, P>>,
}

impl<T, P: Ord + Copy> PriorityQueue<T, P> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Buckets {
                map: BTreeMap::new(),
                len: 0,
            }),
        }
    }

    pub fn enqueue(&self, priority: P, item: T) {
        let mut inner = self.inner.lock();
        inner.map.entry(priority).or_default().push_back(item);
        inner.len += 1;
    }

    /// 取出最高优先级桶的队首；空队列返回 None
    pub fn try_dequeue(&self) -> Option<T> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut bucket = inner.map.last_entry()?;
        let item = bucket.get_mut().pop_front();
        if bucket.get().is_empty() {
            bucket.remove();
        }
        if item.is_some() {
            inner.len -= 1;
        }
        item
    }

    /// 假定非空的出队
    ///
    /// # Panics
    ///
    /// 队列为空时 panic（调用方违反约定）。
    pub fn dequeue(&self) -> T {
        match self.try_dequeue() {
            Some(item) => item,
            None => panic!("dequeue called on an empty PriorityQueue"),
        }
    }

    /// 下一个将被出队的元素
    pub fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        let inner = self.inner.lock();
        inner
            .map
            .last_key_value()
            .and_then(|(_, bucket)| bucket.front().cloned())
    }

    pub fn peek_priority(&self) -> Option<P> {
        self.inner.lock().map.last_key_value().map(|(p, _)| *p)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 当前非空的优先级桶数
    pub fn priority_levels(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// 原子地移除所有满足谓词的元素，按出队顺序返回
    pub fn remove_where(&self, mut predicate: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut removed = Vec::new();

        for bucket in inner.map.values_mut().rev() {
            let mut kept = VecDeque::with_capacity(bucket.len());
            for item in bucket.drain(..) {
                if predicate(&item) {
                    removed.push(item);
                } else {
                    kept.push_back(item);
                }
            }
            *bucket = kept;
        }
        inner.map.retain(|_, bucket| !bucket.is_empty());
        inner.len -= removed.len();
        removed
    }

    /// 清空队列并按出队顺序返回全部元素
    pub fn drain(&self) -> Vec<T> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let map = std::mem::take(&mut inner.map);
        inner.len = 0;
        map.into_values().rev().flatten().collect()
    }

    pub fn clear(&self) {
        self.drain();
    }

    /// 按出队顺序的快照（诊断用）
    pub fn snapshot(&self) -> Vec<(P, T)>
    where
        T: Clone,
    {
        let inner = self.inner.lock();
        inner
            .map
            .iter()
            .rev()
            .flat_map(|(p, bucket)| bucket.iter().map(move |item| (*p, item.clone())))
            .collect()
    }
}

impl<T, P: Ord + Copy> Default for PriorityQueue<T, P> {
    fn default() -> Self {
        Self::new()
    }
}
