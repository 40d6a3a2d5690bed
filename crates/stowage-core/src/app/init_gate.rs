//! InitGate - 一度きりの非同期初期化
//!
//! # 学習ポイント
//! - `AtomicState` の compare-and-set だけで状態を守る（ロックなし）
//! - bootstrap は呼び出し元の task ではなく、専用の tokio runtime（Handle）で動かす
//! - `Notify` の `enable()` を使った取りこぼしのない待ち合わせ

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::domain::{AtomicState, GateState, StorageError, StorageResult};

/// InitGate は `NotStarted -> Initializing -> Ready` を一度だけ進める
///
/// Clone は同じゲートを共有します。
#[derive(Clone)]
pub struct InitGate {
    state: Arc<AtomicState<GateState>>,
    ready: Arc<Notify>,
}

impl InitGate {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicState::new(GateState::NotStarted)),
            ready: Arc::new(Notify::new()),
        }
    }

    pub fn state(&self) -> GateState {
        self.state.load()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == GateState::Ready
    }

    /// Fails with `NotReady` unless the gate is `Ready`. A single atomic load.
    pub fn ensure_ready(&self) -> StorageResult<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(StorageError::NotReady)
        }
    }

    /// Runs `bootstrap` on the current tokio runtime.
    pub fn start<F>(&self, bootstrap: F) -> StorageResult<JoinHandle<StorageResult<()>>>
    where
        F: Future<Output = StorageResult<()>> + Send + 'static,
    {
        let handle = Handle::try_current().map_err(|e| {
            StorageError::IllegalState(format!("no tokio runtime to run bootstrap on: {e}"))
        })?;
        self.start_on(&handle, bootstrap)
    }

    /// Moves to `Initializing` and spawns `bootstrap` on `handle`.
    ///
    /// 成功すると `Ready` に遷移します。bootstrap が失敗した場合は `Initializing`
    /// のまま残り、エラーは JoinHandle から返ります。
    ///
    /// # Errors
    /// 2 回目以降の呼び出しは `IllegalState`。
    pub fn start_on<F>(
        &self,
        handle: &Handle,
        bootstrap: F,
    ) -> StorageResult<JoinHandle<StorageResult<()>>>
    where
        F: Future<Output = StorageResult<()>> + Send + 'static,
    {
        self.state
            .transition(GateState::NotStarted, GateState::Initializing)
            .map_err(|observed| {
                StorageError::IllegalState(format!("start() called twice (state {observed:?})"))
            })?;
        debug!("Storage gate initializing");

        let gate = self.clone();
        Ok(handle.spawn(async move {
            match bootstrap.await {
                Ok(()) => gate.complete(),
                Err(err) => {
                    error!(error = %err, "Storage bootstrap failed");
                    Err(err)
                }
            }
        }))
    }

    /// `Initializing -> Ready`. A second completion is `IllegalState`.
    pub fn complete(&self) -> StorageResult<()> {
        self.state
            .transition(GateState::Initializing, GateState::Ready)
            .map_err(|observed| {
                StorageError::IllegalState(format!("gate completed from state {observed:?}"))
            })?;
        debug!("Storage gate ready");
        self.ready.notify_waiters();
        Ok(())
    }

    /// Resolves once the gate is `Ready`. Never resolves if bootstrap failed.
    pub async fn wait_ready(&self) {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_ready() {
                return;
            }
            notified.await;
        }
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: GateState) {
        self.state.force(state);
    }
}

impl Default for InitGate {
    fn default() -> Self {
        Self::new()
    }
}
