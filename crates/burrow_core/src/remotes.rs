//! The remote-database registry.
//!
//! Remote URLs are assigned small dense integer IDs, persisted as a map
//! under the `remotes` info key. IDs are stable for the life of the
//! database and are what replication metadata records instead of full
//! URLs.

use crate::database::Database;
use crate::error::Result;
use crate::info::KEY_REMOTES;
use burrow_codec::{decode, encode, Value};

fn lookup(remotes: &[(String, u64)], address: &str) -> Option<u64> {
    remotes
        .iter()
        .find(|(url, _)| url == address)
        .map(|(_, id)| *id)
}

impl Database {
    fn read_remotes(&self) -> Result<Vec<(String, u64)>> {
        let Some(rec) = self.read_info(KEY_REMOTES)? else {
            return Ok(Vec::new());
        };
        let value = decode(&rec.body)?;
        Ok(value
            .as_map()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|(url, id)| id.as_u64().map(|id| (url.clone(), id)))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Returns the ID for a remote URL.
    ///
    /// With `can_create`, an unknown URL is assigned the next dense ID
    /// (`max + 1`, or 1 for the first remote) inside a transaction;
    /// without it, an unknown URL yields 0.
    pub fn get_remote_db_id(&self, address: &str, can_create: bool) -> Result<u64> {
        // First pass: plain lookup.
        if let Some(id) = lookup(&self.read_remotes()?, address) {
            return Ok(id);
        }
        if !can_create {
            return Ok(0);
        }

        // Second pass inside a transaction: another handle may have raced
        // us here, so re-read before assigning.
        self.begin_transaction()?;
        let result = (|| -> Result<u64> {
            let remotes = self.read_remotes()?;
            if let Some(id) = lookup(&remotes, address) {
                return Ok(id);
            }
            let mut new_id: u64 = 1;
            let mut entries: Vec<(String, Value)> = Vec::with_capacity(remotes.len() + 1);
            for (url, id) in &remotes {
                if *id > 0 {
                    entries.push((url.clone(), Value::Int(*id as i64)));
                    new_id = new_id.max(id + 1);
                }
            }
            entries.push((address.to_string(), Value::Int(new_id as i64)));
            self.set_info(KEY_REMOTES, &encode(&Value::map(entries)))?;
            Ok(new_id)
        })();
        match result {
            Ok(id) => {
                self.end_transaction(true)?;
                Ok(id)
            }
            Err(e) => {
                let _ = self.end_transaction(false);
                Err(e)
            }
        }
    }

    /// Returns the URL registered under `id`, if any.
    pub fn get_remote_db_address(&self, id: u64) -> Result<Option<String>> {
        Ok(self
            .read_remotes()?
            .into_iter()
            .find(|(_, registered)| *registered == id)
            .map(|(url, _)| url))
    }
}
