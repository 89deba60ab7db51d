//! Command lookup and execution persistence.
//!
//! The engine only talks to these traits. The in-process implementations
//! serve commands from the config file and keep execution records in
//! memory.

use opsh_core::{CommandSpec, Execution, OpshError, OpshResult};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Resolves a command id to what should be run.
pub trait CommandStore: Send + Sync {
    fn get_command(&self, command_id: &str) -> OpshResult<CommandSpec>;
}

/// Create/read/update of execution records by id.
pub trait ExecutionStore: Send + Sync {
    fn insert(&self, execution: Execution) -> OpshResult<()>;
    fn get(&self, execution_id: &str) -> OpshResult<Execution>;
    /// Replace an existing record. Fails if the id is unknown.
    fn update(&self, execution: &Execution) -> OpshResult<()>;
    /// Newest first.
    fn list(&self, limit: usize, offset: usize) -> OpshResult<Vec<Execution>>;
}

/// Commands taken from the `[[commands]]` table of the config file.
#[derive(Debug, Default)]
pub struct ConfigCommandStore {
    commands: HashMap<String, CommandSpec>,
}

impl ConfigCommandStore {
    pub fn new(commands: impl IntoIterator<Item = CommandSpec>) -> Self {
        Self {
            commands: commands
                .into_iter()
                .map(|c| (c.id.clone(), c))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }
}

impl CommandStore for ConfigCommandStore {
    fn get_command(&self, command_id: &str) -> OpshResult<CommandSpec> {
        self.commands
            .get(command_id)
            .cloned()
            .ok_or_else(|| OpshError::CommandNotFound(command_id.to_string()))
    }
}

#[derive(Default)]
struct Records {
    by_id: HashMap<String, Execution>,
    /// Ids in insertion order, to break creation-time ties.
    order: Vec<String>,
}

/// Execution records held in memory.
#[derive(Default)]
pub struct MemoryExecutionStore {
    records: RwLock<Records>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionStore for MemoryExecutionStore {
    fn insert(&self, execution: Execution) -> OpshResult<()> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        if records.by_id.contains_key(&execution.id) {
            return Err(OpshError::Other(format!(
                "duplicate execution id: {}",
                execution.id
            )));
        }
        records.order.push(execution.id.clone());
        records.by_id.insert(execution.id.clone(), execution);
        Ok(())
    }

    fn get(&self, execution_id: &str) -> OpshResult<Execution> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .get(execution_id)
            .cloned()
            .ok_or_else(|| OpshError::ExecutionNotFound(execution_id.to_string()))
    }

    fn update(&self, execution: &Execution) -> OpshResult<()> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let slot = records
            .by_id
            .get_mut(&execution.id)
            .ok_or_else(|| OpshError::ExecutionNotFound(execution.id.clone()))?;
        *slot = execution.clone();
        Ok(())
    }

    fn list(&self, limit: usize, offset: usize) -> OpshResult<Vec<Execution>> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut ordered: Vec<(usize, &Execution)> = records
            .order
            .iter()
            .enumerate()
            .filter_map(|(seq, id)| records.by_id.get(id).map(|e| (seq, e)))
            .collect();
        ordered.sort_by(|(seq_a, a), (seq_b, b)| {
            b.created_at.cmp(&a.created_at).then(seq_b.cmp(seq_a))
        });
        Ok(ordered
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect())
    }
}
