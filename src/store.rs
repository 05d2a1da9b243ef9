//! sled backed persistence for every entity in the marketplace
//!
//! Each entity lives in its own tree and is stored as CBOR. Single record
//! mutations go through [`Store::update`], which re-reads the record and only
//! persists the new value if the stored bytes are still the ones it observed.
//! Mutations spanning several records use sled transactions with the
//! `tx_*` helpers below.
use super::error::MarketError;
use super::types::TimeStamp;
use chrono::Utc;
use sled::transaction::{ConflictableTransactionResult, TransactionalTree, abort};
use sled::{Db, Tree};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct Store {
    db: Arc<Db>,
    pub(crate) accounts: Tree,
    pub(crate) projects: Tree,
    pub(crate) mrv: Tree,
    pub(crate) claims: Tree,
    // project id -> claim id of its single non-terminal claim
    pub(crate) open_claims: Tree,
    pub(crate) listings: Tree,
    // claim id -> listing id of its single active/partial listing
    pub(crate) live_listings: Tree,
    pub(crate) ownership: Tree,
    // consumed external payment references
    pub(crate) payments: Tree,
    // claim ids with an issuance transfer in progress
    pub(crate) inflight: Tree,
}

impl Store {
    pub fn open(db: Arc<Db>) -> Result<Self, MarketError> {
        Ok(Self {
            accounts: db.open_tree("accounts")?,
            projects: db.open_tree("projects")?,
            mrv: db.open_tree("mrv")?,
            claims: db.open_tree("claims")?,
            open_claims: db.open_tree("open_claims")?,
            listings: db.open_tree("listings")?,
            live_listings: db.open_tree("live_listings")?,
            ownership: db.open_tree("ownership")?,
            payments: db.open_tree("payments")?,
            inflight: db.open_tree("inflight")?,
            db,
        })
    }

    /// Monotonic id, unique for the lifetime of the database
    pub fn next_id(&self) -> Result<u64, MarketError> {
        Ok(self.db.generate_id()?)
    }

    pub fn flush(&self) -> Result<(), MarketError> {
        self.db.flush()?;
        Ok(())
    }

    pub(crate) fn load<T>(tree: &Tree, key: &str) -> Result<Option<T>, MarketError>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        match tree.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn require<T>(tree: &Tree, key: &str, what: &str) -> Result<T, MarketError>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        Self::load(tree, key)?.ok_or_else(|| MarketError::not_found(what, key))
    }

    pub(crate) fn save<T>(tree: &Tree, key: &str, value: &T) -> Result<(), MarketError>
    where
        T: minicbor::Encode<()>,
    {
        tree.insert(key.as_bytes(), encode(value)?)?;
        Ok(())
    }

    /// Read-modify-write guarded by compare-and-swap. `f` is re-run against
    /// the fresh record whenever another writer got in between, so it must
    /// be free of side effects.
    pub(crate) fn update<T, F>(tree: &Tree, key: &str, what: &str, mut f: F) -> Result<T, MarketError>
    where
        T: minicbor::Encode<()> + for<'b> minicbor::Decode<'b, ()>,
        F: FnMut(T) -> Result<T, MarketError>,
    {
        loop {
            let current = tree
                .get(key.as_bytes())?
                .ok_or_else(|| MarketError::not_found(what, key))?;
            let next = f(decode(&current)?)?;
            let bytes = encode(&next)?;

            match tree.compare_and_swap(key.as_bytes(), Some(&current), Some(bytes))? {
                Ok(()) => return Ok(next),
                Err(_) => debug!(what, key, "concurrent write detected, retrying update"),
            }
        }
    }

    pub(crate) fn scan<T>(tree: &Tree, prefix: &str) -> Result<Vec<T>, MarketError>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        tree.scan_prefix(prefix.as_bytes())
            .map(|entry| {
                let (_, bytes) = entry?;
                decode(&bytes)
            })
            .collect()
    }
}

pub(crate) fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, MarketError> {
    minicbor::to_vec(value)
        .map_err(|e| MarketError::Storage(format!("failed to encode record: {e}")))
}

pub(crate) fn decode<T>(bytes: &[u8]) -> Result<T, MarketError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    Ok(minicbor::decode(bytes)?)
}

pub(crate) fn tx_load<T>(
    tree: &TransactionalTree,
    key: &str,
) -> ConflictableTransactionResult<Option<T>, MarketError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    match tree.get(key.as_bytes())? {
        Some(bytes) => match decode(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(err) => abort(err),
        },
        None => Ok(None),
    }
}

pub(crate) fn tx_require<T>(
    tree: &TransactionalTree,
    key: &str,
    what: &str,
) -> ConflictableTransactionResult<T, MarketError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    match tx_load(tree, key)? {
        Some(value) => Ok(value),
        None => abort(MarketError::not_found(what, key)),
    }
}

pub(crate) fn tx_save<T>(
    tree: &TransactionalTree,
    key: &str,
    value: &T,
) -> ConflictableTransactionResult<(), MarketError>
where
    T: minicbor::Encode<()>,
{
    match encode(value) {
        Ok(bytes) => {
            tree.insert(key.as_bytes(), bytes)?;
            Ok(())
        }
        Err(err) => abort(err),
    }
}

/// Who holds an in-flight marker and since when. A marker older than the
/// configured time-to-live belongs to a process that died mid-operation.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub(crate) struct InflightMarker {
    #[n(0)]
    pub holder: String,
    #[n(1)]
    pub since: TimeStamp<Utc>,
}

impl InflightMarker {
    pub(crate) fn new(holder: &str) -> Self {
        Self {
            holder: holder.to_string(),
            since: TimeStamp::new(),
        }
    }
    pub(crate) fn is_stale(&self, ttl: Duration) -> bool {
        self.since.older_than(ttl)
    }
}

/// The live marker under `key`, stale ones count as absent.
pub(crate) fn tx_live_marker(
    tree: &TransactionalTree,
    key: &str,
    ttl: Duration,
) -> ConflictableTransactionResult<Option<InflightMarker>, MarketError> {
    match tx_load::<InflightMarker>(tree, key)? {
        Some(marker) if marker.is_stale(ttl) => {
            warn!(key, holder = %marker.holder, "ignoring expired in-flight marker");
            Ok(None)
        }
        live => Ok(live),
    }
}

/// Marker for an operation holding exclusive rights over a record while it
/// talks to an external system. Released when dropped, unless a newer holder
/// has taken the key over in the meantime.
pub(crate) struct InflightGuard {
    tree: Tree,
    key: String,
    marker: Vec<u8>,
}

impl InflightGuard {
    pub(crate) fn held(tree: &Tree, key: &str, marker: Vec<u8>) -> Self {
        Self {
            tree: tree.clone(),
            key: key.to_string(),
            marker,
        }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        let released = self.tree.compare_and_swap(
            self.key.as_bytes(),
            Some(self.marker.as_slice()),
            None as Option<&[u8]>,
        );
        match released {
            Ok(Ok(())) => {}
            Ok(Err(_)) => warn!(key = %self.key, "in-flight marker was taken over, leaving it"),
            Err(err) => warn!(key = %self.key, %err, "failed to release in-flight marker"),
        }
    }
}
