// ABOUTME: Merge engine - folds a change batch into a mirror row set
// ABOUTME: Collapses each key to one effective operation, then applies deletes and upserts

use std::collections::{BTreeMap, BTreeSet};

use crate::change::{ChangeBatch, ChangeRecord, Columns, Operation, RowKey};
use crate::error::{SyncError, SyncResult};
use crate::mirror::RowSet;

/// Net effect of a batch on one key.
#[derive(Debug, Clone, PartialEq)]
pub enum EffectiveOp {
    /// The row exists afterwards with exactly these non-key columns.
    Upsert(Columns),
    Delete,
}

/// Row-level counts for one merge. Rows whose columns did not change are not counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
}

impl MergeStats {
    pub fn rows_changed(&self) -> u64 {
        self.inserted + self.updated + self.deleted
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub rows: RowSet,
    pub stats: MergeStats,
}

/// Reduce a batch to at most one effective operation per key.
///
/// Records for a key are ordered by `(lsn, sequence)`; update-before images are
/// dropped and the last remaining record decides the outcome. Keys whose only
/// records are update-before images produce no operation.
pub fn collapse(batch: &ChangeBatch) -> SyncResult<BTreeMap<RowKey, EffectiveOp>> {
    let mut groups: BTreeMap<&RowKey, Vec<&ChangeRecord>> = BTreeMap::new();
    for record in &batch.records {
        if record.operation == Operation::UpdateBefore {
            continue;
        }
        groups.entry(&record.key).or_default().push(record);
    }

    let mut effective = BTreeMap::new();
    for (key, mut records) in groups {
        records.sort_by(|a, b| (a.lsn, a.sequence).cmp(&(b.lsn, b.sequence)));

        // Two records at the same position leave the order, and so the outcome, undefined.
        if let Some(pair) = records
            .windows(2)
            .find(|pair| (pair[0].lsn, pair[0].sequence) == (pair[1].lsn, pair[1].sequence))
        {
            return Err(SyncError::invariant(
                &batch.table,
                format!(
                    "key {} has two changes at lsn {} sequence {}",
                    key, pair[0].lsn, pair[0].sequence
                ),
            ));
        }

        let Some(last) = records.last() else {
            continue;
        };
        let op = match last.operation {
            Operation::Delete => EffectiveOp::Delete,
            Operation::Insert | Operation::UpdateAfter => {
                let payload = last.payload.clone().ok_or_else(|| {
                    SyncError::invariant(
                        &batch.table,
                        format!("{} for key {} carries no payload", last.operation.as_str(), key),
                    )
                })?;
                EffectiveOp::Upsert(payload)
            }
            Operation::UpdateBefore => continue,
        };
        effective.insert(key.clone(), op);
    }

    Ok(effective)
}

/// Compute the next mirror state from the current one and a batch.
///
/// Pure and deterministic: the same inputs always produce the same output, so a
/// cycle that failed to commit can be retried with the identical batch.
pub fn merge(current: RowSet, batch: &ChangeBatch) -> SyncResult<MergeOutcome> {
    batch.validate()?;
    let effective = collapse(batch)?;

    let mut deletes = BTreeSet::new();
    let mut upserts = Vec::new();
    for (key, op) in effective {
        match op {
            EffectiveOp::Delete => {
                deletes.insert(key);
            }
            EffectiveOp::Upsert(columns) => upserts.push((key, columns)),
        }
    }
    if let Some((key, _)) = upserts.iter().find(|(key, _)| deletes.contains(key)) {
        return Err(SyncError::invariant(
            &batch.table,
            format!("key {key} is both deleted and upserted after collapse"),
        ));
    }

    let mut rows = current;
    let mut stats = MergeStats::default();

    for key in &deletes {
        // Deleting an absent key is a no-op.
        if rows.remove(key).is_some() {
            stats.deleted += 1;
        }
    }

    for (key, columns) in upserts {
        if rows.get(&key) == Some(&columns) {
            continue;
        }
        match rows.upsert(key, columns) {
            Some(_) => stats.updated += 1,
            None => stats.inserted += 1,
        }
    }

    Ok(MergeOutcome { rows, stats })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::TableId;
    use crate::lsn::Lsn;
    use crate::mirror::MirrorRow;
    use serde_json::json;

    fn table() -> TableId {
        TableId::new("Customers").unwrap()
    }

    fn name(value: &str) -> Columns {
        json!({ "Name": value }).as_object().cloned().unwrap()
    }

    fn key(id: i64) -> RowKey {
        RowKey::single(id)
    }

    fn rows(entries: &[(i64, &str)]) -> RowSet {
        RowSet::from_rows(
            &table(),
            entries
                .iter()
                .map(|(id, n)| MirrorRow::new(key(*id), name(n))),
        )
        .unwrap()
    }

    fn batch(records: Vec<ChangeRecord>) -> ChangeBatch {
        ChangeBatch::new(table(), Lsn::from(1), Lsn::from(100), records)
    }

    #[test]
    fn test_collapse_insert_update_delete_is_delete() {
        let b = batch(vec![
            ChangeRecord::insert(key(1), name("a"), Lsn::from(1), 0),
            ChangeRecord::update_after(key(1), name("b"), Lsn::from(2), 0),
            ChangeRecord::delete(key(1), Lsn::from(3), 0),
        ]);
        let effective = collapse(&b).unwrap();
        assert_eq!(effective.get(&key(1)), Some(&EffectiveOp::Delete));
    }

    #[test]
    fn test_collapse_delete_then_insert_is_insert() {
        let b = batch(vec![
            ChangeRecord::delete(key(1), Lsn::from(5), 0),
            ChangeRecord::insert(key(1), name("c"), Lsn::from(5), 1),
        ]);
        let effective = collapse(&b).unwrap();
        assert_eq!(effective.get(&key(1)), Some(&EffectiveOp::Upsert(name("c"))));
    }

    #[test]
    fn test_collapse_orders_by_sequence_not_arrival() {
        let b = batch(vec![
            ChangeRecord::update_after(key(1), name("last"), Lsn::from(7), 9),
            ChangeRecord::update_after(key(1), name("first"), Lsn::from(7), 2),
        ]);
        let effective = collapse(&b).unwrap();
        assert_eq!(
            effective.get(&key(1)),
            Some(&EffectiveOp::Upsert(name("last")))
        );
    }

    #[test]
    fn test_collapse_ignores_update_before() {
        let b = batch(vec![
            ChangeRecord::update_before(key(1), name("old"), Lsn::from(4), 0),
            ChangeRecord::update_after(key(1), name("new"), Lsn::from(4), 1),
            ChangeRecord::update_before(key(2), name("only-before"), Lsn::from(4), 2),
        ]);
        let effective = collapse(&b).unwrap();
        assert_eq!(effective.len(), 1);
        assert_eq!(effective.get(&key(1)), Some(&EffectiveOp::Upsert(name("new"))));
    }

    #[test]
    fn test_collapse_rejects_ambiguous_order() {
        let b = batch(vec![
            ChangeRecord::insert(key(1), name("a"), Lsn::from(3), 1),
            ChangeRecord::delete(key(1), Lsn::from(3), 1),
        ]);
        let err = collapse(&b).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::MergeInvariantViolation);
    }

    #[test]
    fn test_collapse_rejects_upsert_without_payload() {
        let mut record = ChangeRecord::insert(key(1), name("a"), Lsn::from(3), 1);
        record.payload = None;
        assert!(collapse(&batch(vec![record])).is_err());
    }

    #[test]
    fn test_merge_delete_of_absent_key_is_noop() {
        let current = rows(&[(1, "Alice")]);
        let outcome = merge(
            current.clone(),
            &batch(vec![ChangeRecord::delete(key(9), Lsn::from(2), 0)]),
        )
        .unwrap();
        assert_eq!(outcome.rows, current);
        assert_eq!(outcome.stats.rows_changed(), 0);
    }

    #[test]
    fn test_merge_upsert_overwrites_all_columns() {
        let mut wide = name("Alice");
        wide.insert("Email".into(), json!("alice@example.com"));
        let current = RowSet::from_rows(&table(), vec![MirrorRow::new(key(1), wide)]).unwrap();

        let outcome = merge(
            current,
            &batch(vec![ChangeRecord::update_after(
                key(1),
                name("Alicia"),
                Lsn::from(2),
                0,
            )]),
        )
        .unwrap();

        // Email is gone: payloads replace the row, they are not merged column-wise.
        assert_eq!(outcome.rows.get(&key(1)), Some(&name("Alicia")));
        assert_eq!(outcome.stats.updated, 1);
    }

    #[test]
    fn test_merge_insert_for_existing_key_overwrites() {
        let outcome = merge(
            rows(&[(1, "Alice")]),
            &batch(vec![ChangeRecord::insert(key(1), name("Alys"), Lsn::from(2), 0)]),
        )
        .unwrap();
        assert_eq!(outcome.rows, rows(&[(1, "Alys")]));
    }

    #[test]
    fn test_merge_delete_and_insert_other_key() {
        let outcome = merge(
            rows(&[(1, "Alice"), (2, "Bob")]),
            &batch(vec![
                ChangeRecord::delete(key(2), Lsn::from(2), 0),
                ChangeRecord::insert(key(3), name("Carol"), Lsn::from(2), 1),
            ]),
        )
        .unwrap();
        assert_eq!(outcome.rows, rows(&[(1, "Alice"), (3, "Carol")]));
        assert_eq!(
            outcome.stats,
            MergeStats {
                inserted: 1,
                updated: 0,
                deleted: 1
            }
        );
    }

    #[test]
    fn test_merge_reinserted_row_never_disappears() {
        let outcome = merge(
            rows(&[(1, "Alice")]),
            &batch(vec![
                ChangeRecord::delete(key(1), Lsn::from(2), 0),
                ChangeRecord::insert(key(1), name("Alice"), Lsn::from(2), 1),
            ]),
        )
        .unwrap();
        assert_eq!(outcome.rows, rows(&[(1, "Alice")]));
        assert_eq!(outcome.stats.rows_changed(), 0);
    }

    #[test]
    fn test_merge_replay_is_idempotent() {
        let b = batch(vec![
            ChangeRecord::insert(key(4), name("Dan"), Lsn::from(2), 0),
            ChangeRecord::update_after(key(1), name("Alicia"), Lsn::from(3), 0),
            ChangeRecord::delete(key(2), Lsn::from(4), 0),
        ]);
        let start = rows(&[(1, "Alice"), (2, "Bob")]);

        let once = merge(start.clone(), &b).unwrap();
        let again = merge(start, &b).unwrap();
        assert_eq!(once, again);

        let twice = merge(once.rows.clone(), &b).unwrap();
        assert_eq!(twice.rows, once.rows);
        assert_eq!(twice.stats.rows_changed(), 0);
    }

    #[test]
    fn test_merge_empty_batch_keeps_rows() {
        let current = rows(&[(1, "Alice")]);
        let outcome = merge(current.clone(), &batch(Vec::new())).unwrap();
        assert_eq!(outcome.rows, current);
    }

    #[test]
    fn test_merge_rejects_records_outside_range() {
        let b = ChangeBatch::new(
            table(),
            Lsn::from(10),
            Lsn::from(20),
            vec![ChangeRecord::delete(key(1), Lsn::from(25), 0)],
        );
        assert!(merge(RowSet::new(), &b).is_err());
    }
}
