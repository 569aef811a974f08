//! 写回守护线程
//!
//! 每一轮从 DIRTY 链表表头开始，最多写出 `ndirty` 个未加锁的脏缓冲区。
//! 脏缓冲区仍超过 `nfract` 百分比、且本轮确实写出了东西时立即开始下一轮，
//! 否则睡眠，直到被唤醒或者周期同步的时间到了。
//!
//! 周期同步（`sync_old_buffers`）调用文件系统钩子，写出刷新期限已到的缓冲区，
//! 并更新各大小等级的负载均值。

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use super::{BdflushParams, Param};
use crate::cache::BufferCache;
use crate::error::{Error, ErrorKind, Result};
use crate::types::{BufferId, Disposition};

#[derive(Debug, Default)]
struct DaemonState {
    running: bool,
    thread: Option<ThreadId>,
    wake_requested: bool,
    shutdown: bool,
    cycles: u64,
}

/// 守护线程的控制块
pub(crate) struct BdflushControl {
    state: Mutex<DaemonState>,
    /// 唤醒守护线程
    wake: Condvar,
    /// 一轮结束或线程退出
    done: Condvar,
}

impl BdflushControl {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DaemonState::default()),
            wake: Condvar::new(),
            done: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DaemonState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish_cycle(&self) {
        self.lock().cycles += 1;
        self.done.notify_all();
    }

    /// 睡眠直到被唤醒、超时或被要求退出
    ///
    /// # 返回
    ///
    /// 被要求退出时返回 `false`
    fn sleep(&self, timeout: Option<Duration>) -> bool {
        let mut ds = self.lock();
        let deadline = timeout.map(|t| Instant::now() + t);
        while !ds.wake_requested && !ds.shutdown {
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    ds = self
                        .wake
                        .wait_timeout(ds, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                None => ds = self.wake.wait(ds).unwrap_or_else(PoisonError::into_inner),
            }
        }
        ds.wake_requested = false;
        !ds.shutdown
    }

    fn should_stop(&self) -> bool {
        self.lock().shutdown
    }

    fn stopped(&self) {
        let mut ds = self.lock();
        ds.running = false;
        ds.thread = None;
        drop(ds);
        self.done.notify_all();
    }

    fn request_shutdown(&self) {
        self.lock().shutdown = true;
        self.wake.notify_all();
    }

    /// 已经完成的轮数
    pub fn cycles(&self) -> u64 {
        self.lock().cycles
    }
}

/// 守护线程句柄
///
/// `shutdown` 或 drop 时通知线程退出并等待它结束。
pub struct BdflushHandle {
    join: Option<JoinHandle<()>>,
    cache: Arc<BufferCache>,
}

impl BdflushHandle {
    /// 停止守护线程
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(join) = self.join.take() else {
            return;
        };
        self.cache.bdflush.request_shutdown();
        if join.join().is_err() {
            log::error!("[BDFLUSH] daemon thread panicked");
            self.cache.bdflush.stopped();
        }
    }
}

impl Drop for BdflushHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl BufferCache {
    /// 启动 bdflush 守护线程
    ///
    /// # 返回
    ///
    /// 守护线程已经在运行时返回 `Busy`
    ///
    /// # 示例
    ///
    /// ```rust,ignore
    /// let cache = Arc::new(BufferCache::new(pool, clock, CacheConfig::default())?);
    /// let daemon = cache.spawn_bdflush()?;
    /// // ...
    /// daemon.shutdown();
    /// ```
    pub fn spawn_bdflush(self: &Arc<Self>) -> Result<BdflushHandle> {
        {
            let mut ds = self.bdflush.lock();
            if ds.running {
                log::warn!("[BDFLUSH] daemon already running");
                return Err(Error::new(ErrorKind::Busy, "bdflush already running"));
            }
            ds.running = true;
            ds.shutdown = false;
            ds.wake_requested = false;
        }
        let cache = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("bdflush".into())
            .spawn(move || cache.bdflush_main());
        match spawned {
            Ok(join) => {
                self.bdflush.lock().thread = Some(join.thread().id());
                Ok(BdflushHandle { join: Some(join), cache: Arc::clone(self) })
            }
            Err(e) => {
                self.bdflush.stopped();
                log::error!("[BDFLUSH] unable to spawn bdflush thread: {}", e);
                Err(Error::new(ErrorKind::Io, "unable to spawn bdflush thread"))
            }
        }
    }

    /// 守护线程是否在运行
    pub fn bdflush_running(&self) -> bool {
        self.bdflush.lock().running
    }

    fn bdflush_main(&self) {
        log::info!("[BDFLUSH] daemon started");
        let mut last_sync = Instant::now();
        loop {
            if self.bdflush.should_stop() {
                break;
            }
            if let Some(interval) = self.config.update_interval {
                if last_sync.elapsed() >= interval {
                    self.sync_old_buffers();
                    last_sync = Instant::now();
                }
            }

            let written = self.bdflush_cycle();
            self.bdflush.finish_cycle();
            if written > 0 && self.lock_state().too_many_dirty() {
                continue;
            }

            let timeout = self
                .config
                .update_interval
                .map(|interval| interval.saturating_sub(last_sync.elapsed()));
            if !self.bdflush.sleep(timeout) {
                break;
            }
        }
        self.bdflush.stopped();
        log::info!("[BDFLUSH] daemon stopped");
    }

    /// 唤醒守护线程
    ///
    /// 守护线程没有运行时记录警告并就地做一次不等待的同步。
    ///
    /// # 参数
    ///
    /// * `wait` - 是否等待这一轮结束
    pub fn wakeup_bdflush(&self, wait: bool) {
        let mut ds = self.bdflush.lock();
        if !ds.running {
            drop(ds);
            log::warn!("[BDFLUSH] daemon not running, flushing inline");
            if let Err(e) = self.sync_buffers(None, false) {
                log::warn!("[BDFLUSH] inline flush reported {}", e);
            }
            return;
        }
        ds.wake_requested = true;
        self.bdflush.wake.notify_all();
        // 守护线程自己（例如在文件系统钩子里分配缓冲区）不能等自己
        if !wait || ds.thread == Some(thread::current().id()) {
            return;
        }
        let target = ds.cycles + 1;
        while ds.running && ds.cycles < target {
            ds = self.bdflush.done.wait(ds).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// 立即执行一轮写回
    ///
    /// 守护线程在运行时唤醒它（`wait` 时等待这一轮结束），否则在当前线程执行。
    pub fn flush_now(&self, wait: bool) {
        if self.bdflush_running() {
            self.wakeup_bdflush(wait);
        } else {
            let written = self.bdflush_cycle();
            log::debug!("[BDFLUSH] inline pass wrote {} buffers", written);
        }
    }

    /// 一轮写回：从 DIRTY 链表表头写出最多 `ndirty` 个脏缓冲区
    ///
    /// # 返回
    ///
    /// 写出的缓冲区数
    pub(crate) fn bdflush_cycle(&self) -> usize {
        let now = self.now();
        let mut st = self.lock_state();
        let ndirty = st.params.ndirty as usize;
        let snapshot = st.lru[Disposition::Dirty.index()].snapshot(usize::MAX);
        let mut pending: Vec<BufferId> = Vec::new();
        for id in snapshot {
            if pending.len() >= ndirty {
                break;
            }
            let bh = st.head(id);
            if !bh.is_bound() || bh.list != Disposition::Dirty {
                continue;
            }
            if !bh.is_dirty() {
                st.refile(id, now);
                continue;
            }
            if bh.is_locked() {
                continue;
            }
            let bh = st.head_mut(id);
            bh.get();
            bh.flushtime = 0;
            pending.push(id);
        }
        drop(st);
        let written = pending.len();
        self.write_and_unpin(&mut pending);
        if written > 0 {
            log::debug!("[BDFLUSH] wrote {} dirty buffers", written);
        }
        written
    }

    /// 周期同步：写出刷新期限已到的脏缓冲区，更新负载均值
    ///
    /// # 返回
    ///
    /// 写出的缓冲区数
    pub fn sync_old_buffers(&self) -> usize {
        self.run_fs_sync(None);

        let now = self.now();
        let mut st = self.lock_state();
        let mut pending: Vec<BufferId> = Vec::new();
        for list in Disposition::ALL {
            let snapshot = st.lru[list.index()].snapshot(usize::MAX);
            for id in snapshot {
                let bh = st.head(id);
                if !bh.is_bound() || bh.list != list {
                    continue;
                }
                // 状态与所在链表不符的顺手归档
                if bh.is_dirty() != (list == Disposition::Dirty) {
                    st.refile(id, now);
                    continue;
                }
                if !bh.is_dirty() || bh.is_locked() || bh.flushtime > now {
                    continue;
                }
                let bh = st.head_mut(id);
                bh.get();
                bh.flushtime = 0;
                pending.push(id);
            }
        }
        st.update_load_average();
        drop(st);

        let written = pending.len();
        self.write_and_unpin(&mut pending);
        if written > 0 {
            log::debug!("[BDFLUSH] wrote {} expired buffers", written);
        }
        written
    }

    //=========================================================================
    // 参数
    //=========================================================================

    /// 当前参数表
    pub fn bdflush_params(&self) -> BdflushParams {
        self.lock_state().params
    }

    /// 读取一个参数
    pub fn bdflush_param(&self, param: Param) -> u32 {
        self.lock_state().params.get(param)
    }

    /// 修改一个参数
    ///
    /// # 返回
    ///
    /// 越界时返回 `InvalidInput`，参数不变
    pub fn set_bdflush_param(&self, param: Param, value: u32) -> Result<()> {
        self.lock_state().params.set(param, value)?;
        log::info!("[BDFLUSH] {:?} set to {}", param, value);
        Ok(())
    }

    /// 整体替换参数表
    pub fn set_bdflush_params(&self, params: BdflushParams) -> Result<()> {
        params.validate()?;
        self.lock_state().params = params;
        Ok(())
    }
}
