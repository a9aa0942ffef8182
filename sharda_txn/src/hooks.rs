//! Commit hooks, registered once before the coordinator is shared.
use sharda_parser::Value;
use sharda_topology::ShardId;

use crate::gtm::TxnId;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A write executed inside a logical transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryLogEntry {
    pub shard: ShardId,
    pub sql: String,
    pub args: Vec<Value>,
    /// Position within the transaction, across all shards.
    pub seq: u64,
}

/// What hooks get to know about the transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TxnInfo {
    pub id: TxnId,
    /// Participating shards in commit order.
    pub shards: Vec<ShardId>,
}

type BeforeCommit = Box<dyn Fn(&TxnInfo, &[QueryLogEntry]) -> Result<(), BoxError> + Send + Sync>;
type OnSuccess = Box<dyn Fn(&TxnInfo) + Send + Sync>;
type OnFailure = Box<dyn Fn(&TxnInfo, bool, &[QueryLogEntry]) + Send + Sync>;

#[derive(Default)]
pub struct HookRegistry {
    before: Vec<BeforeCommit>,
    after: Vec<(OnSuccess, OnFailure)>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with the full write log before any shard commits; an error
    /// vetoes the commit.
    pub fn on_before_commit<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&TxnInfo, &[QueryLogEntry]) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.before.push(Box::new(hook));
        self
    }

    /// `failure` receives the critical flag and the writes of the shards
    /// that did not commit.
    pub fn on_after_commit<S, F>(&mut self, success: S, failure: F) -> &mut Self
    where
        S: Fn(&TxnInfo) + Send + Sync + 'static,
        F: Fn(&TxnInfo, bool, &[QueryLogEntry]) + Send + Sync + 'static,
    {
        self.after.push((Box::new(success), Box::new(failure)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.before.is_empty() && self.after.is_empty()
    }

    /// Runs before-commit hooks in order, stopping at the first veto.
    pub(crate) fn before_commit(&self, info: &TxnInfo, log: &[QueryLogEntry]) -> Result<(), (usize, BoxError)> {
        for (i, hook) in self.before.iter().enumerate() {
            hook(info, log).map_err(|e| (i, e))?;
        }
        Ok(())
    }

    pub(crate) fn committed(&self, info: &TxnInfo) {
        for (success, _) in &self.after {
            success(info);
        }
    }

    pub(crate) fn failed(&self, info: &TxnInfo, critical: bool, log: &[QueryLogEntry]) {
        for (_, failure) in &self.after {
            failure(info, critical, log);
        }
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("before", &self.before.len())
            .field("after", &self.after.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn info() -> TxnInfo {
        TxnInfo {
            id: TxnId(1),
            shards: Vec::new(),
        }
    }

    #[test]
    fn before_hooks_stop_at_first_veto() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = HookRegistry::new();
        for i in 0..3 {
            let calls = calls.clone();
            hooks.on_before_commit(move |_, _| {
                calls.lock().unwrap().push(i);
                if i == 1 {
                    Err("no".into())
                } else {
                    Ok(())
                }
            });
        }
        let (index, err) = hooks.before_commit(&info(), &[]).unwrap_err();
        assert_eq!(index, 1);
        assert_eq!(err.to_string(), "no");
        assert_eq!(*calls.lock().unwrap(), vec![0, 1]);
    }

    #[test]
    fn after_hooks_run_in_registration_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = HookRegistry::new();
        for i in 0..2 {
            let (s, f) = (calls.clone(), calls.clone());
            hooks.on_after_commit(
                move |_| s.lock().unwrap().push(format!("ok{i}")),
                move |_, critical, _| f.lock().unwrap().push(format!("fail{i}:{critical}")),
            );
        }
        hooks.committed(&info());
        hooks.failed(&info(), true, &[]);
        assert_eq!(*calls.lock().unwrap(), vec!["ok0", "ok1", "fail0:true", "fail1:true"]);
    }
}
