//! Dispatch state persistence.
//!
//! All dispatch mutations are store-level upserts or conditional merges, which is what makes
//! duplicate and racing events safe: `update` is create-or-merge and always converges, while
//! `internal_update` guards commit transitions so that at most one `received -> acquired` or
//! `received -> canceled` succeeds per dispatch id regardless of delivery interleavings.


use anyhow::{Context, Result};
use sled::Tree;

use crate::database::Database;
use crate::error::ERR_ITER_FAILURE;
use crate::models::{Dispatch, DispatchStatus, DispatchUpdate};
use crate::utils;

/// The key prefix used for storing dispatch records.
///
/// NOTE: in order to preserve lexicographical ordering of keys, it is important to always use
/// the `utils::encode_*` methods.
pub const PREFIX_DISPATCH: &[u8; 1] = b"d";

/// Durable, idempotent persistence of dispatch state.
#[derive(Clone)]
pub struct DispatchService {
    /// The DB tree holding dispatch records.
    tree: Tree,
}

impl DispatchService {
    /// Create a new instance.
    pub async fn new(db: &Database) -> Result<Self> {
        let tree = db.get_dispatches_tree().await?;
        Ok(Self { tree })
    }

    /// Upsert the given partial dispatch by id, merging only populated fields.
    ///
    /// This always succeeds with create-or-merge semantics and returns the merged record.
    #[tracing::instrument(level = "debug", skip(self, update), err)]
    pub async fn update(&self, update: DispatchUpdate) -> Result<Dispatch> {
        let tree = self.tree.clone();
        let merged = Database::spawn_blocking(move || -> Result<Dispatch> {
            let key = utils::encode_id_key(PREFIX_DISPATCH, &update.dispatch_id);
            loop {
                let current_raw = tree.get(&key).context("error fetching dispatch record")?;
                let current = current_raw.as_ref().map(|raw| utils::decode_model::<Dispatch>(raw)).transpose()?;
                let merged = update.apply(current);
                let new_raw = utils::encode_model(&merged)?;
                match tree.compare_and_swap(&key, current_raw, Some(new_raw)).context("error writing dispatch record")? {
                    Ok(_) => return Ok(merged),
                    // Raced with a concurrent writer, retry against the new value.
                    Err(_) => continue,
                }
            }
        })
        .await??;
        Ok(merged)
    }

    /// Conditionally merge the given partial dispatch.
    ///
    /// A transition into `acquired` or `canceled` only applies while the stored status is
    /// `received`. Returns `None` when no record matched or the guard rejected the transition,
    /// which callers treat as "already handled, not an error".
    #[tracing::instrument(level = "debug", skip(self, update), err)]
    pub async fn internal_update(&self, update: DispatchUpdate) -> Result<Option<Dispatch>> {
        let tree = self.tree.clone();
        let updated = Database::spawn_blocking(move || -> Result<Option<Dispatch>> {
            let key = utils::encode_id_key(PREFIX_DISPATCH, &update.dispatch_id);
            let commit_guarded = matches!(update.status, Some(DispatchStatus::Acquired) | Some(DispatchStatus::Canceled));
            loop {
                let current_raw = tree.get(&key).context("error fetching dispatch record")?;
                let current = match current_raw.as_ref().map(|raw| utils::decode_model::<Dispatch>(raw)).transpose()? {
                    Some(current) => current,
                    None => return Ok(None),
                };
                if commit_guarded && current.status != DispatchStatus::Received {
                    return Ok(None);
                }
                let merged = update.apply(Some(current));
                let new_raw = utils::encode_model(&merged)?;
                match tree.compare_and_swap(&key, current_raw, Some(new_raw)).context("error writing dispatch record")? {
                    Ok(_) => return Ok(Some(merged)),
                    // Raced with a concurrent writer, retry so the guard sees the new value.
                    Err(_) => continue,
                }
            }
        })
        .await??;
        Ok(updated)
    }

    /// Remove all dispatch records addressed to the given recipient, returning the removed set.
    ///
    /// Used for member/user deletion cascades.
    #[tracing::instrument(level = "debug", skip(self), err)]
    pub async fn delete(&self, recipient_client_id: &str) -> Result<Vec<Dispatch>> {
        let (tree, recipient) = (self.tree.clone(), recipient_client_id.to_string());
        let removed = Database::spawn_blocking(move || -> Result<Vec<Dispatch>> {
            let mut batch = sled::Batch::default();
            let mut removed = vec![];
            for entry_res in tree.scan_prefix(PREFIX_DISPATCH) {
                let (key, val) = entry_res.context(ERR_ITER_FAILURE)?;
                let dispatch: Dispatch = utils::decode_model(&val)?;
                if dispatch.recipient_client_id.as_deref() == Some(recipient.as_str()) {
                    batch.remove(key);
                    removed.push(dispatch);
                }
            }
            tree.apply_batch(batch).context("error applying dispatch removal batch")?;
            Ok(removed)
        })
        .await??;
        Ok(removed)
    }

    /// Fetch the dispatch record for the given id.
    pub async fn get(&self, dispatch_id: &str) -> Result<Option<Dispatch>> {
        let (tree, dispatch_id) = (self.tree.clone(), dispatch_id.to_string());
        let dispatch = Database::spawn_blocking(move || -> Result<Option<Dispatch>> {
            let key = utils::encode_id_key(PREFIX_DISPATCH, &dispatch_id);
            tree.get(&key)
                .context("error fetching dispatch record")?
                .map(|raw| utils::decode_model::<Dispatch>(&raw))
                .transpose()
        })
        .await??;
        Ok(dispatch)
    }
}
