use crate::{OrBackend, SqliteStore};
use rollcall_core::{GalleryStore, StoreError, StoredIdentity, StoredReference};
use rusqlite::{params, OptionalExtension, Transaction};
use std::collections::HashMap;
use uuid::Uuid;

fn seq_to_sql(seq: u64) -> Result<i64, StoreError> {
    i64::try_from(seq).map_err(|_| StoreError::Corrupt(format!("enrollment sequence {seq} too large")))
}

fn require_identity(tx: &Transaction<'_>, identity_id: &str) -> Result<(), StoreError> {
    let found = tx
        .query_row(
            "SELECT 1 FROM identities WHERE id = ?1",
            params![identity_id],
            |_| Ok(()),
        )
        .optional()
        .or_backend()?;
    found.ok_or_else(|| StoreError::IdentityNotFound(identity_id.to_string()))
}

fn insert_reference(
    tx: &Transaction<'_>,
    identity_id: &str,
    position: i64,
    reference: &StoredReference,
) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO reference_embeddings
             (id, identity_id, position, image_path, embedding, model_version)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            reference.id.to_string(),
            identity_id,
            position,
            reference.image_path,
            reference.embedding,
            reference.model_version,
        ],
    )
    .or_backend()?;
    Ok(())
}

impl GalleryStore for SqliteStore {
    fn load_identities(&self) -> Result<Vec<StoredIdentity>, StoreError> {
        let conn = self.conn();

        let mut stmt = conn
            .prepare("SELECT id, name, enrollment_seq FROM identities ORDER BY enrollment_seq")
            .or_backend()?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .or_backend()?;
        let mut identities = Vec::new();
        for row in rows {
            let (id, name, seq) = row.or_backend()?;
            let enrollment_seq = u64::try_from(seq)
                .map_err(|_| StoreError::Corrupt(format!("negative enrollment sequence for {id}")))?;
            identities.push(StoredIdentity {
                id,
                name,
                enrollment_seq,
                references: Vec::new(),
            });
        }

        let mut stmt = conn
            .prepare(
                "SELECT identity_id, id, image_path, embedding, model_version
                 FROM reference_embeddings ORDER BY identity_id, position",
            )
            .or_backend()?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<Vec<u8>>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })
            .or_backend()?;

        let index: HashMap<String, usize> = identities
            .iter()
            .enumerate()
            .map(|(i, identity)| (identity.id.clone(), i))
            .collect();
        for row in rows {
            let (identity_id, id, image_path, embedding, model_version) = row.or_backend()?;
            let id = Uuid::parse_str(&id)
                .map_err(|e| StoreError::Corrupt(format!("reference id {id:?}: {e}")))?;
            if let Some(&i) = index.get(&identity_id) {
                identities[i].references.push(StoredReference {
                    id,
                    image_path,
                    embedding,
                    model_version,
                });
            }
        }

        Ok(identities)
    }

    fn insert_identity(&self, identity: &StoredIdentity) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction().or_backend()?;

        let exists = tx
            .query_row(
                "SELECT 1 FROM identities WHERE id = ?1",
                params![identity.id],
                |_| Ok(()),
            )
            .optional()
            .or_backend()?
            .is_some();
        if exists {
            return Err(StoreError::DuplicateIdentity(identity.id.clone()));
        }

        tx.execute(
            "INSERT INTO identities (id, name, enrollment_seq) VALUES (?1, ?2, ?3)",
            params![identity.id, identity.name, seq_to_sql(identity.enrollment_seq)?],
        )
        .or_backend()?;
        for (position, reference) in identity.references.iter().enumerate() {
            insert_reference(&tx, &identity.id, position as i64, reference)?;
        }
        tx.commit().or_backend()
    }

    fn append_reference(
        &self,
        identity_id: &str,
        reference: &StoredReference,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction().or_backend()?;
        require_identity(&tx, identity_id)?;

        let position: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(position) + 1, 0) FROM reference_embeddings
                 WHERE identity_id = ?1",
                params![identity_id],
                |row| row.get(0),
            )
            .or_backend()?;
        insert_reference(&tx, identity_id, position, reference)?;
        tx.commit().or_backend()
    }

    fn replace_references(
        &self,
        identity_id: &str,
        references: &[StoredReference],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction().or_backend()?;
        require_identity(&tx, identity_id)?;

        tx.execute(
            "DELETE FROM reference_embeddings WHERE identity_id = ?1",
            params![identity_id],
        )
        .or_backend()?;
        for (position, reference) in references.iter().enumerate() {
            insert_reference(&tx, identity_id, position as i64, reference)?;
        }
        tx.commit().or_backend()
    }

    fn rename_identity(&self, identity_id: &str, name: &str) -> Result<(), StoreError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE identities SET name = ?2 WHERE id = ?1",
                params![identity_id, name],
            )
            .or_backend()?;
        if changed == 0 {
            return Err(StoreError::IdentityNotFound(identity_id.to_string()));
        }
        Ok(())
    }

    fn delete_identity(&self, identity_id: &str) -> Result<(), StoreError> {
        let changed = self
            .conn()
            .execute("DELETE FROM identities WHERE id = ?1", params![identity_id])
            .or_backend()?;
        if changed == 0 {
            return Err(StoreError::IdentityNotFound(identity_id.to_string()));
        }
        tracing::debug!(identity = %identity_id, "identity row deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::gallery::OmitReason;
    use rollcall_core::{Embedding, Gallery};
    use std::sync::Arc;

    fn reference(values: &[f32]) -> StoredReference {
        StoredReference {
            id: Uuid::new_v4(),
            image_path: Some("faces/sample.png".into()),
            embedding: Some(Embedding::new(values.to_vec(), "test").to_bytes()),
            model_version: Some("test".into()),
        }
    }

    fn identity(id: &str, seq: u64, refs: Vec<StoredReference>) -> StoredIdentity {
        StoredIdentity {
            id: id.into(),
            name: format!("Person {id}"),
            enrollment_seq: seq,
            references: refs,
        }
    }

    #[test]
    fn test_insert_and_load_in_enrollment_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_identity(&identity("B", 2, vec![reference(&[1.0])])).unwrap();
        store
            .insert_identity(&identity("A", 1, vec![reference(&[0.0]), reference(&[0.5])]))
            .unwrap();

        let loaded = store.load_identities().unwrap();
        let ids: Vec<&str> = loaded.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);
        assert_eq!(loaded[0].references.len(), 2);
        assert_eq!(loaded[0].enrollment_seq, 1);
    }

    #[test]
    fn test_duplicate_identity() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_identity(&identity("A", 1, vec![])).unwrap();
        assert!(matches!(
            store.insert_identity(&identity("A", 2, vec![])),
            Err(StoreError::DuplicateIdentity(id)) if id == "A"
        ));
    }

    #[test]
    fn test_append_and_replace_keep_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = reference(&[0.0]);
        store.insert_identity(&identity("A", 1, vec![first.clone()])).unwrap();

        let second = reference(&[1.0]);
        store.append_reference("A", &second).unwrap();
        let refs = &store.load_identities().unwrap()[0].references;
        assert_eq!(refs[0].id, first.id);
        assert_eq!(refs[1].id, second.id);

        let fresh = reference(&[2.0]);
        store.replace_references("A", std::slice::from_ref(&fresh)).unwrap();
        let refs = &store.load_identities().unwrap()[0].references;
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0], fresh);
    }

    #[test]
    fn test_missing_identity_errors() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(matches!(
            store.append_reference("ghost", &reference(&[0.0])),
            Err(StoreError::IdentityNotFound(_))
        ));
        assert!(matches!(
            store.rename_identity("ghost", "Nobody"),
            Err(StoreError::IdentityNotFound(_))
        ));
        assert!(matches!(
            store.delete_identity("ghost"),
            Err(StoreError::IdentityNotFound(_))
        ));
    }

    #[test]
    fn test_delete_cascades_references() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_identity(&identity("A", 1, vec![reference(&[0.0])])).unwrap();
        store.delete_identity("A").unwrap();

        let remaining: i64 = store
            .conn()
            .query_row("SELECT COUNT(*) FROM reference_embeddings", [], |row| row.get(0))
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_gallery_load_reports_unreadable_embeddings() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mut broken = reference(&[0.0, 0.0]);
        broken.embedding = Some(vec![1, 2, 3]);
        let mut lost = reference(&[0.0, 0.0]);
        lost.embedding = None;
        store
            .insert_identity(&identity("A", 1, vec![reference(&[0.0, 1.0]), broken]))
            .unwrap();
        store.insert_identity(&identity("B", 2, vec![lost])).unwrap();

        let (gallery, report) = Gallery::load(store).unwrap();
        assert_eq!(report.identities, 2);
        assert_eq!(report.references, 1);
        let reasons: Vec<&OmitReason> = report.omitted.iter().map(|o| &o.reason).collect();
        assert_eq!(
            reasons,
            vec![&OmitReason::Undecodable, &OmitReason::MissingEmbedding]
        );
        assert!(gallery.contains("B"));
        assert!(gallery.get("B").unwrap().references.is_empty());
    }
}
