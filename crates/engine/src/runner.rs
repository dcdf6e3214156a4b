//! Transaction runner
//!
//! Owns the table registry and the per-transaction storage handles for
//! the selected run mode, and produces the prepare log consumed by the
//! external durability layer.

use crate::error::{Error, Result};
use parking_lot::{Mutex, RwLock};
use rill_common::{EngineConfig, RunMode, ServerId, TxnId};
use rill_store::{GcPolicy, RowFlavor, Schema, StorageTxn, Table, TxnMgr};
use rill_value::{MultiValue, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// One staged write in the prepare-log payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrepareEntry {
    pub table: String,
    pub key: MultiValue,
    pub column: usize,
    pub value: Value,
}

/// Table registry plus per-tid storage transactions.
pub struct TxnRunner {
    mode: RunMode,
    gc: GcPolicy,
    txn_mgr: TxnMgr,
    tables: RwLock<HashMap<String, Arc<Table>>>,
    txns: Mutex<HashMap<TxnId, Arc<Mutex<StorageTxn>>>>,
}

impl TxnRunner {
    /// Select the storage transaction manager for the configured mode.
    pub fn init(config: &EngineConfig) -> Self {
        info!(mode = ?config.mode, "txn runner initialized");
        Self {
            mode: config.mode,
            gc: GcPolicy::from(config),
            txn_mgr: TxnMgr::new(config.mode),
            tables: RwLock::new(HashMap::new()),
            txns: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// Create and register a table with the row flavor this mode runs on.
    pub fn reg_table(&self, name: &str, schema: Arc<Schema>) -> Result<Arc<Table>> {
        let flavor = RowFlavor::for_mode(self.mode);
        let table = Arc::new(Table::with_gc(name, schema, flavor, self.gc));
        let mut tables = self.tables.write();
        if tables.contains_key(name) {
            return Err(Error::Store(rill_store::Error::DuplicateTable(
                name.to_string(),
            )));
        }
        debug!(table = name, ?flavor, "table registered");
        tables.insert(name.to_string(), table.clone());
        Ok(table)
    }

    pub fn get_table(&self, name: &str) -> Result<Arc<Table>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Store(rill_store::Error::TableNotFound(name.to_string())))
    }

    /// The storage transaction for `tid`, created on first use.
    pub fn get_txn(&self, tid: TxnId) -> Arc<Mutex<StorageTxn>> {
        self.txns
            .lock()
            .entry(tid)
            .or_insert_with(|| Arc::new(Mutex::new(self.txn_mgr.start(tid))))
            .clone()
    }

    pub fn lookup_txn(&self, tid: TxnId) -> Option<Arc<Mutex<StorageTxn>>> {
        self.txns.lock().get(&tid).cloned()
    }

    /// Remove the storage transaction for `tid`.
    pub fn del_txn(&self, tid: TxnId) -> Result<Arc<Mutex<StorageTxn>>> {
        self.txns
            .lock()
            .remove(&tid)
            .ok_or(Error::TransactionNotFound(tid))
    }

    /// Drop observed-reader claims held by `tid` on multi-versioned rows.
    pub fn release_claims(&self, tid: TxnId) {
        for table in self.tables.read().values() {
            if table.flavor() == RowFlavor::MultiVersioned {
                table.for_each(|_, row| {
                    if let Some(mv) = row.as_multi_versioned() {
                        mv.release_claims(tid);
                    }
                });
            }
        }
    }

    /// Release every table and transaction handle.
    pub fn fini(&self) {
        self.txns.lock().clear();
        self.tables.write().clear();
        info!("txn runner finalized");
    }

    /// Write the 2PC prepare record for `tid`:
    /// `tid(u64) | n_sids(u32) | sids(i32)* | payload`.
    ///
    /// The payload is the staged-write log of the storage transaction,
    /// consumed by the external durability layer.
    pub fn get_prepare_log(&self, tid: TxnId, sids: &[ServerId], out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&tid.as_u64().to_ne_bytes());
        out.extend_from_slice(&(sids.len() as u32).to_ne_bytes());
        for sid in sids {
            out.extend_from_slice(&sid.0.to_ne_bytes());
        }

        let entries: Vec<PrepareEntry> = match self.lookup_txn(tid) {
            Some(txn_arc) => {
                let mut txn = txn_arc.lock();
                match txn.as_two_pl_mut() {
                    Some(two_pl) => two_pl
                        .staged()
                        .iter()
                        .map(|write| PrepareEntry {
                            table: write.row.table().unwrap_or_default(),
                            key: write.row.key(),
                            column: write.column,
                            value: write.value.clone(),
                        })
                        .collect(),
                    None => Vec::new(),
                }
            }
            None => Vec::new(),
        };
        let payload =
            serde_json::to_vec(&entries).map_err(|e| Error::Serialization(e.to_string()))?;
        out.extend_from_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_common::LockPolicy;
    use rill_store::Column;
    use rill_value::ValueKind;

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::new(vec![
                Column::new("id", ValueKind::I64).primary_key(),
                Column::new("bal", ValueKind::I64),
            ])
            .unwrap(),
        )
    }

    fn config(mode: RunMode) -> EngineConfig {
        EngineConfig::new(mode).with_lock_policy(LockPolicy::WaitDie)
    }

    #[test]
    fn test_table_registry() {
        let runner = TxnRunner::init(&config(RunMode::Rcc));
        runner.reg_table("accounts", schema()).unwrap();
        assert!(runner.get_table("accounts").is_ok());
        assert!(matches!(
            runner.reg_table("accounts", schema()),
            Err(Error::Store(rill_store::Error::DuplicateTable(_)))
        ));
        assert!(matches!(
            runner.get_table("missing"),
            Err(Error::Store(rill_store::Error::TableNotFound(_)))
        ));
    }

    #[test]
    fn test_txn_lifecycle() {
        let runner = TxnRunner::init(&config(RunMode::TwoPl));
        let tid = TxnId::new(5);

        let txn = runner.get_txn(tid);
        assert!(txn.lock().as_two_pl_mut().is_some());
        // Same handle on repeated lookup.
        assert!(Arc::ptr_eq(&runner.get_txn(tid), &txn));

        runner.del_txn(tid).unwrap();
        assert!(matches!(
            runner.del_txn(tid),
            Err(Error::TransactionNotFound(_))
        ));
    }

    #[test]
    fn test_mode_selects_table_flavor() {
        let runner = TxnRunner::init(&config(RunMode::Occ));
        let table = runner.reg_table("t", schema()).unwrap();
        assert_eq!(table.flavor(), RowFlavor::Versioned);
    }

    #[test]
    fn test_prepare_log_layout() {
        let runner = TxnRunner::init(&config(RunMode::TwoPl));
        let table = runner.reg_table("accounts", schema()).unwrap();
        let row = table
            .insert_values(&[Value::I64(1), Value::I64(100)])
            .unwrap();

        let tid = TxnId::new(0x1122334455667788);
        {
            let txn_arc = runner.get_txn(tid);
            let mut txn = txn_arc.lock();
            txn.as_two_pl_mut()
                .unwrap()
                .stage_write(row, 1, Value::I64(150));
        }

        let sids = [ServerId(3), ServerId(-1)];
        let mut out = Vec::new();
        runner.get_prepare_log(tid, &sids, &mut out).unwrap();

        assert_eq!(&out[0..8], &tid.as_u64().to_ne_bytes());
        assert_eq!(&out[8..12], &2u32.to_ne_bytes());
        assert_eq!(&out[12..16], &3i32.to_ne_bytes());
        assert_eq!(&out[16..20], &(-1i32).to_ne_bytes());

        let entries: Vec<PrepareEntry> = serde_json::from_slice(&out[20..]).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].table, "accounts");
        assert_eq!(entries[0].key, MultiValue::from(Value::I64(1)));
        assert_eq!(entries[0].column, 1);
        assert_eq!(entries[0].value, Value::I64(150));
    }
}
