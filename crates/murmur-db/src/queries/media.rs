use anyhow::Result;
use rusqlite::{Connection, params};

use murmur_types::ids::EventRowId;
use murmur_types::models::MediaReference;

/// Register media URIs. Already known URIs are left alone.
pub fn add_many(conn: &Connection, uris: &[String]) -> Result<()> {
    let mut stmt = conn.prepare_cached("INSERT INTO media (uri) VALUES (?1) ON CONFLICT (uri) DO NOTHING")?;
    for uri in uris {
        stmt.execute([uri])?;
    }
    Ok(())
}

pub fn add_references(conn: &Connection, refs: &[MediaReference]) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO media_reference (event_rowid, media_uri) VALUES (?1, ?2)
         ON CONFLICT (event_rowid, media_uri) DO NOTHING",
    )?;
    for r in refs {
        stmt.execute(params![r.event_rowid.0, r.media_uri])?;
    }
    Ok(())
}

pub fn references_for(conn: &Connection, event_rowid: EventRowId) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT media_uri FROM media_reference WHERE event_rowid = ?1 ORDER BY media_uri")?;
    let rows = stmt
        .query_map([event_rowid.0], |r| r.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use crate::queries::events::{self, tests::event};

    #[test]
    fn references_are_deduplicated() {
        let db = Database::open_in_memory().unwrap();
        let rowid = db.with_conn(|c| events::upsert(c, &mut event("!r:x", "$img", 1))).unwrap();
        let uri = "mxc://x/abc".to_string();
        let reference = MediaReference {
            event_rowid: rowid,
            media_uri: uri.clone(),
        };
        db.with_conn(|c| {
            add_many(c, &[uri.clone(), uri.clone()])?;
            add_references(c, &[reference.clone(), reference.clone()])
        })
        .unwrap();
        assert_eq!(db.with_conn(|c| references_for(c, rowid)).unwrap(), vec![uri]);
    }

    #[test]
    fn reference_requires_known_media() {
        let db = Database::open_in_memory().unwrap();
        let rowid = db.with_conn(|c| events::upsert(c, &mut event("!r:x", "$img", 1))).unwrap();
        let result = db.with_conn(|c| {
            add_references(
                c,
                &[MediaReference {
                    event_rowid: rowid,
                    media_uri: "mxc://x/unknown".into(),
                }],
            )
        });
        assert!(result.is_err());
    }
}
