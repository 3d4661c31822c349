//! 并发治理：按类别的槽位池 + FIFO 等待队列
//!
//! 每个类别（通常是工具名，如 `bash`）有独立的活跃槽位集合与等待队列。
//! 槽位满时调用方排队挂起；释放槽位时按入队顺序唤醒队首。等待超过 max_wait 则出队并返回超时。
//!
//! 运行在多线程 tokio 上，状态由一把同步锁保护，锁从不跨越 await。

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::config::ConcurrencySection;
use crate::core::ConcurrencyError;

/// 槽位 ID（同一管理器内唯一）
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct SlotId(u64);

impl SlotId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot_{}", self.0)
    }
}

/// acquire 的结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotGrant {
    pub slot_id: SlotId,
    /// 排队耗时；立即获得时为 0
    pub wait_time_ms: u64,
    pub acquired: bool,
}

/// 单个类别的快照
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CategoryStats {
    pub category: String,
    pub active: usize,
    pub queued: usize,
    pub limit: usize,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Result<SlotId, ConcurrencyError>>,
}

#[derive(Default)]
struct CategoryState {
    active: HashSet<SlotId>,
    queue: VecDeque<Waiter>,
}

#[derive(Default)]
struct State {
    categories: HashMap<String, CategoryState>,
    /// set_limit 设置的覆盖值；clear() 时清空
    overrides: HashMap<String, usize>,
    next_id: u64,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// 按类别限流的并发管理器
pub struct ConcurrencyManager {
    state: Mutex<State>,
    /// 配置文件中的类别上限
    defaults: HashMap<String, usize>,
    default_limit: usize,
    max_wait: Duration,
}

impl ConcurrencyManager {
    pub fn new(default_limit: usize, max_wait: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            defaults: HashMap::new(),
            default_limit,
            max_wait,
        }
    }

    pub fn from_config(cfg: &ConcurrencySection) -> Self {
        Self {
            defaults: cfg.limits.clone(),
            ..Self::new(cfg.default_limit, Duration::from_millis(cfg.max_wait_ms))
        }
    }

    /// 设置某类别的配置默认上限（不受 clear() 影响）
    pub fn with_category_default(mut self, category: impl Into<String>, limit: usize) -> Self {
        self.defaults.insert(category.into(), limit);
        self
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    fn limit_of(&self, overrides: &HashMap<String, usize>, category: &str) -> usize {
        overrides
            .get(category)
            .or_else(|| self.defaults.get(category))
            .copied()
            .unwrap_or(self.default_limit)
            .max(1)
    }

    /// 覆盖值 > 配置默认 > 全局默认，最小为 1
    pub fn get_limit(&self, category: &str) -> usize {
        let state = self.state.lock();
        self.limit_of(&state.overrides, category)
    }

    /// 设置覆盖上限；上限调大时立即按 FIFO 放行排队者
    pub fn set_limit(&self, category: &str, limit: usize) {
        let mut state = self.state.lock();
        state.overrides.insert(category.to_string(), limit);
        let limit = limit.max(1);
        if let Some(entry) = state.categories.get_mut(category) {
            grant_waiters(category, entry, limit);
        }
    }

    /// 获取一个槽位；满时排队，超过 max_wait 返回 `ConcurrencyError::Timeout`
    pub async fn acquire(&self, category: &str) -> Result<SlotGrant, ConcurrencyError> {
        self.acquire_within(category, Some(self.max_wait)).await
    }

    /// 同 acquire，但使用调用方给定的排队上限；None 表示一直等到放行或 clear()
    pub async fn acquire_within(
        &self,
        category: &str,
        max_wait: Option<Duration>,
    ) -> Result<SlotGrant, ConcurrencyError> {
        let start = Instant::now();
        let mut pending = {
            let mut state = self.state.lock();
            let limit = self.limit_of(&state.overrides, category);
            let id = state.next_id();
            let entry = state.categories.entry(category.to_string()).or_default();

            if entry.active.len() < limit && entry.queue.is_empty() {
                let slot_id = SlotId(id);
                entry.active.insert(slot_id);
                tracing::debug!(category, slot = %slot_id, "slot granted");
                return Ok(SlotGrant {
                    slot_id,
                    wait_time_ms: 0,
                    acquired: true,
                });
            }

            let (tx, rx) = oneshot::channel();
            entry.queue.push_back(Waiter { id, tx });
            tracing::debug!(category, queued = entry.queue.len(), "slot busy, waiting");
            PendingWaiter {
                manager: self,
                category,
                waiter_id: id,
                rx,
            }
        };

        let granted = |slot_id: SlotId| SlotGrant {
            slot_id,
            wait_time_ms: start.elapsed().as_millis() as u64,
            acquired: true,
        };

        let received = match max_wait {
            Some(limit) => tokio::time::timeout(limit, &mut pending.rx).await.ok(),
            None => Some((&mut pending.rx).await),
        };
        match received {
            Some(Ok(Ok(slot_id))) => Ok(granted(slot_id)),
            Some(Ok(Err(e))) => Err(e),
            Some(Err(_)) => Err(ConcurrencyError::Cleared),
            None => {
                // 先出队，再检查是否恰好在超时瞬间被放行
                self.forget_waiter(category, pending.waiter_id);
                match pending.rx.try_recv() {
                    Ok(Ok(slot_id)) => Ok(granted(slot_id)),
                    Ok(Err(e)) => Err(e),
                    Err(_) => {
                        let waited_ms = start.elapsed().as_millis() as u64;
                        tracing::warn!(category, waited_ms, "concurrency wait timed out");
                        Err(ConcurrencyError::Timeout {
                            category: category.to_string(),
                            waited_ms,
                        })
                    }
                }
            }
        }
    }

    /// 获取槽位并返回 RAII guard，drop 时自动释放
    pub async fn acquire_guard<'a>(
        &'a self,
        category: &str,
    ) -> Result<SlotGuard<'a>, ConcurrencyError> {
        self.acquire_guard_within(category, Some(self.max_wait)).await
    }

    pub async fn acquire_guard_within<'a>(
        &'a self,
        category: &str,
        max_wait: Option<Duration>,
    ) -> Result<SlotGuard<'a>, ConcurrencyError> {
        let grant = self.acquire_within(category, max_wait).await?;
        Ok(SlotGuard {
            manager: self,
            category: category.to_string(),
            grant,
        })
    }

    /// 释放槽位；未知或重复释放的 slot 直接忽略
    pub fn release(&self, category: &str, slot_id: SlotId) {
        let mut state = self.state.lock();
        let limit = self.limit_of(&state.overrides, category);
        let Some(entry) = state.categories.get_mut(category) else {
            return;
        };
        if !entry.active.remove(&slot_id) {
            tracing::debug!(category, slot = %slot_id, "ignoring release of unknown slot");
            return;
        }
        grant_waiters(category, entry, limit);
    }

    /// 在槽位内执行 f；无论 f 成功、失败还是被 drop，槽位都会释放
    pub async fn with_slot<F, Fut, T, E>(&self, category: &str, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ConcurrencyError>,
    {
        let _guard = self.acquire_guard(category).await?;
        f().await
    }

    /// 以 Cleared 拒绝所有排队者，并重置计数与覆盖上限
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let mut rejected = 0usize;
        for (_, entry) in state.categories.drain() {
            for waiter in entry.queue {
                rejected += 1;
                let _ = waiter.tx.send(Err(ConcurrencyError::Cleared));
            }
        }
        state.overrides.clear();
        tracing::info!(rejected, "concurrency state cleared");
    }

    pub fn active_count(&self, category: &str) -> usize {
        self.state
            .lock()
            .categories
            .get(category)
            .map_or(0, |c| c.active.len())
    }

    pub fn queue_length(&self, category: &str) -> usize {
        self.state
            .lock()
            .categories
            .get(category)
            .map_or(0, |c| c.queue.len())
    }

    /// 所有已出现过的类别快照，按类别名排序
    pub fn stats(&self) -> Vec<CategoryStats> {
        let state = self.state.lock();
        let mut stats: Vec<CategoryStats> = state
            .categories
            .iter()
            .map(|(name, c)| CategoryStats {
                category: name.clone(),
                active: c.active.len(),
                queued: c.queue.len(),
                limit: self.limit_of(&state.overrides, name),
            })
            .collect();
        stats.sort_by(|a, b| a.category.cmp(&b.category));
        stats
    }

    fn forget_waiter(&self, category: &str, waiter_id: u64) {
        let mut state = self.state.lock();
        if let Some(entry) = state.categories.get_mut(category) {
            entry.queue.retain(|w| w.id != waiter_id);
        }
    }
}

/// 在上限内按入队顺序放行；接收端已放弃的排队者跳过，不占槽位
fn grant_waiters(category: &str, entry: &mut CategoryState, limit: usize) {
    while entry.active.len() < limit {
        let Some(waiter) = entry.queue.pop_front() else {
            break;
        };
        let slot_id = SlotId(waiter.id);
        if waiter.tx.send(Ok(slot_id)).is_ok() {
            entry.active.insert(slot_id);
            tracing::debug!(category, slot = %slot_id, "slot handed to waiter");
        }
    }
}

/// 排队中的 acquire；被 drop（调用方取消）时出队，并归还已收到但未被取走的槽位
struct PendingWaiter<'a> {
    manager: &'a ConcurrencyManager,
    category: &'a str,
    waiter_id: u64,
    rx: oneshot::Receiver<Result<SlotId, ConcurrencyError>>,
}

impl Drop for PendingWaiter<'_> {
    fn drop(&mut self) {
        self.manager.forget_waiter(self.category, self.waiter_id);
        self.rx.close();
        if let Ok(Ok(slot_id)) = self.rx.try_recv() {
            self.manager.release(self.category, slot_id);
        }
    }
}

/// 持有期间占用一个槽位
pub struct SlotGuard<'a> {
    manager: &'a ConcurrencyManager,
    category: String,
    grant: SlotGrant,
}

impl SlotGuard<'_> {
    pub fn grant(&self) -> &SlotGrant {
        &self.grant
    }

    pub fn category(&self) -> &str {
        &self.category
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.manager.release(&self.category, self.grant.slot_id);
    }
}
