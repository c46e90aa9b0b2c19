//! Trigger persistence & delete/fire race suppression.
//!
//! A trigger guards a dispatch which is not yet due. Records are stored twice: a primary record
//! under a time-ordered key (expiry first, dispatch id suffix) which recovery range-scans, and a
//! secondary index from dispatch id to that primary key for O(1) lookup and deletion.
//!
//! Deletion and the natural fire-and-self-remove path can race: a trigger about to fire may be
//! concurrently deleted by an external cancel. The store records the intent to ignore a storage
//! id *before* mutating, so a `get` racing with the delete observes "already gone" rather than a
//! half-deleted record. The ignore set is process-local with a short TTL; it is rebuilt empty on
//! leader handoff, a bounded imprecision the protocol tolerates.


use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use sled::{IVec, Tree};

use crate::config::Config;
use crate::database::Database;
use crate::error::ERR_ITER_FAILURE;
use crate::models::{Trigger, TriggerKind};
use crate::utils;

/// The key prefix used for time-ordered primary trigger records.
///
/// NOTE: in order to preserve lexicographical ordering of keys, it is important to always use
/// the `utils::encode_*` methods.
pub const PREFIX_TRIGGER_TS: &[u8; 1] = b"t";
/// The key prefix used for the dispatch id -> primary key index.
///
/// NOTE: in order to preserve lexicographical ordering of keys, it is important to always use
/// the `utils::encode_*` methods.
pub const PREFIX_TRIGGER_ID: &[u8; 1] = b"i";

/// Durable future-fire bookkeeping for dispatches.
pub struct TriggerStore {
    /// The DB tree holding trigger records.
    tree: Tree,
    /// The TTL in seconds for ignore-deletes entries.
    ttl_seconds: i64,
    /// Storage ids of recently deleted triggers, mapped to the instant their entry lapses.
    ignore_deletes: HashMap<IVec, i64>,
}

impl TriggerStore {
    /// Create a new instance.
    pub async fn new(config: &Config, db: &Database) -> Result<Self> {
        let tree = db.get_triggers_tree().await?;
        Ok(Self {
            tree,
            ttl_seconds: config.ignore_delete_ttl_seconds,
            ignore_deletes: HashMap::new(),
        })
    }

    /// Upsert the trigger for its dispatch id, creating or refreshing the stored expiry.
    ///
    /// A changed expiry moves the time-ordered primary record; the stale record is removed in
    /// the same batch so no scan can observe both. An upsert also re-legitimizes its storage
    /// ids: the key is deterministic, so a trigger re-created after a delete would otherwise
    /// stay masked by the ignore-deletes set for the full TTL.
    #[tracing::instrument(level = "debug", skip(self, trigger), err)]
    pub async fn update(&mut self, trigger: &Trigger) -> Result<()> {
        let index_key = utils::encode_id_key(PREFIX_TRIGGER_ID, &trigger.dispatch_id);
        let primary_key = utils::encode_ts_id_key(PREFIX_TRIGGER_TS, trigger.expires_at, &trigger.dispatch_id);
        self.ignore_deletes.remove(&primary_key);
        let encoded = utils::encode_model(trigger)?;
        let (tree, pk, ik) = (self.tree.clone(), primary_key.clone(), index_key.clone());
        let old_primary = Database::spawn_blocking(move || -> Result<Option<IVec>> {
            let old_primary = tree.get(&ik).context("error fetching trigger index record")?;
            let mut batch = sled::Batch::default();
            if let Some(old_primary) = old_primary.as_ref() {
                if old_primary != &pk {
                    batch.remove(old_primary.clone());
                }
            }
            batch.insert(&pk, encoded);
            batch.insert(&ik, &pk);
            tree.apply_batch(batch).context("error applying trigger upsert batch")?;
            Ok(old_primary)
        })
        .await??;
        if let Some(old_primary) = old_primary {
            self.ignore_deletes.remove(&old_primary);
        }
        Ok(())
    }

    /// Fetch the trigger for the given dispatch id.
    ///
    /// Returns `None` when no trigger exists or when its storage id is masked by a live
    /// ignore-deletes entry (logically deleted but possibly racing the physical removal).
    #[tracing::instrument(level = "debug", skip(self), err)]
    pub async fn get(&mut self, dispatch_id: &str) -> Result<Option<Trigger>> {
        self.prune_ignores();
        let index_key = utils::encode_id_key(PREFIX_TRIGGER_ID, dispatch_id);
        let tree = self.tree.clone();
        let fetched = Database::spawn_blocking(move || -> Result<Option<(IVec, IVec)>> {
            let primary_key = match tree.get(&index_key).context("error fetching trigger index record")? {
                Some(primary_key) => primary_key,
                None => return Ok(None),
            };
            let raw = tree.get(&primary_key).context("error fetching trigger record")?;
            Ok(raw.map(|raw| (primary_key, raw)))
        })
        .await??;
        let (primary_key, raw) = match fetched {
            Some(fetched) => fetched,
            None => return Ok(None),
        };
        if self.ignore_deletes.contains_key(&primary_key) {
            return Ok(None);
        }
        Ok(Some(utils::decode_model(&raw)?))
    }

    /// Delete the triggers for the given dispatch ids.
    ///
    /// Ids with no matching trigger are silently skipped; deleting a non-existent trigger is
    /// not an error. For matching triggers the storage id is recorded into the ignore-deletes
    /// set before the physical removal is issued.
    #[tracing::instrument(level = "debug", skip(self, dispatch_ids), err)]
    pub async fn delete(&mut self, dispatch_ids: &[String]) -> Result<()> {
        self.prune_ignores();
        let lapse_at = utils::now_unix() + self.ttl_seconds;
        let (tree, ids) = (self.tree.clone(), dispatch_ids.to_vec());
        let matched = Database::spawn_blocking(move || -> Result<Vec<(IVec, IVec)>> {
            let mut matched = vec![];
            for dispatch_id in ids {
                let index_key = utils::encode_id_key(PREFIX_TRIGGER_ID, &dispatch_id);
                match tree.get(&index_key).context("error fetching trigger index record")? {
                    Some(primary_key) => matched.push((index_key, primary_key)),
                    None => tracing::debug!(dispatch_id = dispatch_id.as_str(), "no trigger found for deletion, skipping"),
                }
            }
            Ok(matched)
        })
        .await??;
        if matched.is_empty() {
            return Ok(());
        }
        // Record the intent to ignore before mutating, so a racing `get` never observes a
        // half-deleted record as still valid.
        for (_, primary_key) in matched.iter() {
            self.ignore_deletes.insert(primary_key.clone(), lapse_at);
        }
        let tree = self.tree.clone();
        Database::spawn_blocking(move || -> Result<()> {
            let mut batch = sled::Batch::default();
            for (index_key, primary_key) in matched {
                batch.remove(primary_key);
                batch.remove(index_key);
            }
            tree.apply_batch(batch).context("error applying trigger removal batch")?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    /// Scan triggers of the given kind whose expiry falls within `[from, until]`, ascending.
    #[tracing::instrument(level = "debug", skip(self), err)]
    pub async fn scan_window(&mut self, kind: TriggerKind, from: i64, until: i64) -> Result<Vec<Trigger>> {
        self.prune_ignores();
        let tree = self.tree.clone();
        let ignored: HashSet<IVec> = self.ignore_deletes.keys().cloned().collect();
        let triggers = Database::spawn_blocking(move || -> Result<Vec<Trigger>> {
            let start = utils::encode_ts_id_key(PREFIX_TRIGGER_TS, from, "");
            let end = utils::encode_ts_id_key(PREFIX_TRIGGER_TS, until + 1, "");
            let mut triggers = vec![];
            for entry_res in tree.range::<_, std::ops::Range<&[u8]>>(start.as_ref()..end.as_ref()) {
                let (key, val) = entry_res.context(ERR_ITER_FAILURE)?;
                if ignored.contains(&key) {
                    continue;
                }
                // Individual undecodable records are skipped, they must not abort the batch.
                let trigger: Trigger = match utils::decode_model(&val) {
                    Ok(trigger) => trigger,
                    Err(err) => {
                        tracing::warn!(error = ?err, "error decoding trigger record during scan, skipping");
                        continue;
                    }
                };
                if trigger.kind == kind {
                    triggers.push(trigger);
                }
            }
            Ok(triggers)
        })
        .await??;
        Ok(triggers)
    }

    /// Drop ignore-deletes entries whose TTL has lapsed.
    fn prune_ignores(&mut self) {
        let now = utils::now_unix();
        self.ignore_deletes.retain(|_, lapse_at| *lapse_at > now);
    }
}
