//! CRUD operations for domain-wide [`Channel`] records.

use rusqlite::{params, OptionalExtension};

use enclave_shared::types::{ChannelId, DomainId};

use crate::database::Database;
use crate::error::{not_found, Result, StoreError};
use crate::models::Channel;
use crate::rows::{domain_at, now, ts, ts_at, uuid_at};

const CHANNEL_COLUMNS: &str = "id, domain, name, description, created_at, last_activity_at";

impl Database {
    /// Create a channel. Names are unique within a domain.
    pub fn create_channel(
        &self,
        domain: &DomainId,
        name: &str,
        description: Option<&str>,
    ) -> Result<Channel> {
        if self.find_channel_by_name(domain, name)?.is_some() {
            return Err(StoreError::Invalid(format!(
                "channel {name} already exists in {domain}"
            )));
        }

        let created_at = now();
        let channel = Channel {
            id: ChannelId::new(),
            domain: domain.clone(),
            name: name.to_string(),
            description: description.map(str::to_string),
            created_at,
            last_activity_at: created_at,
        };

        self.conn().execute(
            "INSERT INTO channels (id, domain, name, description, created_at, last_activity_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                channel.id.to_string(),
                domain.as_str(),
                channel.name,
                channel.description,
                ts(&created_at),
            ],
        )?;

        Ok(channel)
    }

    /// Seed the named channels for a domain; existing ones are skipped.
    pub fn ensure_channels(&self, domain: &DomainId, names: &[&str]) -> Result<usize> {
        let created_at = ts(&now());
        let mut inserted = 0;
        for name in names {
            inserted += self.conn().execute(
                "INSERT OR IGNORE INTO channels
                     (id, domain, name, description, created_at, last_activity_at)
                 VALUES (?1, ?2, ?3, NULL, ?4, ?4)",
                params![ChannelId::new().to_string(), domain.as_str(), name, created_at],
            )?;
        }
        if inserted > 0 {
            tracing::info!(domain = %domain, inserted, "seeded default channels");
        }
        Ok(inserted)
    }

    pub fn get_channel(&self, id: ChannelId) -> Result<Channel> {
        self.conn()
            .query_row(
                &format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = ?1"),
                params![id.to_string()],
                row_to_channel,
            )
            .map_err(not_found)
    }

    pub fn find_channel_by_name(&self, domain: &DomainId, name: &str) -> Result<Option<Channel>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE domain = ?1 AND name = ?2"),
                params![domain.as_str(), name],
                row_to_channel,
            )
            .optional()?)
    }

    /// All channels of a domain, oldest first.
    pub fn list_channels(&self, domain: &DomainId) -> Result<Vec<Channel>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels WHERE domain = ?1 ORDER BY created_at ASC, name ASC"
        ))?;
        let rows = stmt.query_map(params![domain.as_str()], row_to_channel)?;

        let mut channels = Vec::new();
        for row in rows {
            channels.push(row?);
        }
        Ok(channels)
    }
}

fn row_to_channel(row: &rusqlite::Row<'_>) -> rusqlite::Result<Channel> {
    Ok(Channel {
        id: ChannelId(uuid_at(row, 0)?),
        domain: domain_at(row, 1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        created_at: ts_at(row, 4)?,
        last_activity_at: ts_at(row, 5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_channels_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let domain = DomainId::new("acme.io").unwrap();

        assert_eq!(db.ensure_channels(&domain, &["general", "random"]).unwrap(), 2);
        assert_eq!(db.ensure_channels(&domain, &["general", "random"]).unwrap(), 0);

        let names: Vec<_> = db
            .list_channels(&domain)
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["general", "random"]);
    }

    #[test]
    fn channels_are_scoped_per_domain() {
        let db = Database::open_in_memory().unwrap();
        let acme = DomainId::new("acme.io").unwrap();
        let other = DomainId::new("other.org").unwrap();

        let general = db.create_channel(&acme, "general", Some("all hands")).unwrap();
        db.create_channel(&other, "general", None).unwrap();

        assert!(matches!(
            db.create_channel(&acme, "general", None),
            Err(StoreError::Invalid(_))
        ));
        assert_eq!(db.get_channel(general.id).unwrap().domain, acme);
        assert_eq!(db.list_channels(&other).unwrap().len(), 1);
        assert!(matches!(db.get_channel(ChannelId::new()), Err(StoreError::NotFound)));
    }
}
