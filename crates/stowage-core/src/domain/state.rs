//! State - 初期化ゲートとマイグレーションの状態
//!
//! どちらの状態も単一の `AtomicU8` に載せ、compare-and-set でのみ遷移させます。
//! ロックは使いません（非同期スケジューラをブロックしないため）。

use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, Ordering};

/// StateCode は `AtomicState` に載せられる状態のマーカー trait
pub trait StateCode: Copy + Send + Sync + 'static {
    fn code(self) -> u8;
    fn from_code(code: u8) -> Self;
}

/// GateState は Storage の初期化状態
///
/// # 状態遷移
/// - NotStarted -> Initializing（`start()`、一度だけ）
/// - Initializing -> Ready（bootstrap 完了、一度だけ）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    NotStarted,
    Initializing,
    Ready,
}

impl StateCode for GateState {
    fn code(self) -> u8 {
        match self {
            GateState::NotStarted => 0,
            GateState::Initializing => 1,
            GateState::Ready => 2,
        }
    }

    fn from_code(code: u8) -> Self {
        match code {
            0 => GateState::NotStarted,
            1 => GateState::Initializing,
            _ => GateState::Ready,
        }
    }
}

/// MigrationState は MigrationEngine の状態
///
/// # 状態遷移
/// - NotMigrated -> Migrating -> Migrated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    NotMigrated,
    Migrating,
    Migrated,
}

impl StateCode for MigrationState {
    fn code(self) -> u8 {
        match self {
            MigrationState::NotMigrated => 0,
            MigrationState::Migrating => 1,
            MigrationState::Migrated => 2,
        }
    }

    fn from_code(code: u8) -> Self {
        match code {
            0 => MigrationState::NotMigrated,
            1 => MigrationState::Migrating,
            _ => MigrationState::Migrated,
        }
    }
}

/// AtomicState は `S` を 1 バイトの atomic に載せた状態機械
///
/// `S` は PhantomData のマーカーで、実行時には `AtomicU8` だけになります。
#[derive(Debug)]
pub struct AtomicState<S: StateCode> {
    value: AtomicU8,
    _marker: PhantomData<S>,
}

impl<S: StateCode> AtomicState<S> {
    pub fn new(initial: S) -> Self {
        Self {
            value: AtomicU8::new(initial.code()),
            _marker: PhantomData,
        }
    }

    pub fn load(&self) -> S {
        S::from_code(self.value.load(Ordering::Acquire))
    }

    /// Moves `from -> to`. On failure returns the state actually observed.
    pub fn transition(&self, from: S, to: S) -> Result<(), S> {
        self.value
            .compare_exchange(from.code(), to.code(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(S::from_code)
    }

    #[cfg(test)]
    pub(crate) fn force(&self, state: S) {
        self.value.store(state.code(), Ordering::Release);
    }
}
