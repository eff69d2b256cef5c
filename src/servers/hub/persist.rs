//! Diff-based character persistence.
//!
//! The hub keeps the last committed [`CharStatus`] of every character it has
//! loaded or saved. A save compares the incoming state to that snapshot and
//! writes only the sections that changed. The snapshot advances only when
//! every statement of the save succeeded, so a failed save is retried in
//! full on the next attempt.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;

use super::charstatus::{CharStatus, Hotkey, Item, SqlValue};
use super::db::{CharStore, ChildTable, ItemTable, Statement, StoreError};

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("{failed} statement(s) failed saving char {char_id}")]
    Failed { char_id: u32, failed: usize },
    #[error("char id {got} does not match save target {want}")]
    WrongCharacter { want: u32, got: u32 },
}

/// What a successful save wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveReport {
    pub sections: Vec<&'static str>,
    pub statements: usize,
}

/// Three-way merge of one item table.
///
/// Each stored row claims the first unclaimed incoming item with the same
/// identity key. Claimed rows are updated when a mutable field changed,
/// unclaimed rows are deleted, unclaimed incoming items are inserted in one
/// batch.
pub fn plan_items(
    table: ItemTable,
    owner: u32,
    stored: &[Item],
    incoming: &[Item],
) -> Vec<Statement> {
    let mut claimed = vec![false; incoming.len()];
    let mut out = Vec::new();

    for row in stored {
        let key = row.key();
        let hit = incoming
            .iter()
            .enumerate()
            .position(|(i, it)| !claimed[i] && !it.is_empty() && it.key() == key);
        match hit {
            Some(i) => {
                claimed[i] = true;
                if !incoming[i].same_state(row) {
                    out.push(Statement::UpdateItem {
                        table,
                        row_id: row.id,
                        item: incoming[i].clone(),
                    });
                }
            }
            None => out.push(Statement::DeleteItem { table, row_id: row.id }),
        }
    }

    let fresh: Vec<Item> = incoming
        .iter()
        .zip(&claimed)
        .filter(|(it, taken)| !**taken && !it.is_empty())
        .map(|(it, _)| Item { id: 0, ..it.clone() })
        .collect();
    if !fresh.is_empty() {
        out.push(Statement::InsertItems { table, owner, items: fresh });
    }
    out
}

/// Character columns whose value differs, in column order.
pub fn changed_columns(old: &CharStatus, new: &CharStatus) -> Vec<(&'static str, SqlValue)> {
    old.character_columns()
        .into_iter()
        .zip(new.character_columns())
        .filter(|((_, a), (_, b))| a != b)
        .map(|(_, changed)| changed)
        .collect()
}

/// Hotkey slots whose binding differs. Missing slots count as unbound.
pub fn changed_hotkeys(old: &[Hotkey], new: &[Hotkey]) -> Vec<(usize, Hotkey)> {
    let unbound = Hotkey::default();
    (0..old.len().max(new.len()))
        .filter_map(|i| {
            let a = old.get(i).unwrap_or(&unbound);
            let b = new.get(i).unwrap_or(&unbound);
            (a != b).then_some((i, *b))
        })
        .collect()
}

struct SaveRun<'a> {
    store: &'a dyn CharStore,
    char_id: u32,
    failed: usize,
    statements: usize,
    sections: Vec<&'static str>,
}

impl SaveRun<'_> {
    async fn exec(&mut self, stmt: Statement) {
        self.statements += 1;
        if let Err(e) = self.store.execute(&stmt).await {
            self.failed += 1;
            tracing::error!("[hub] [save] char_id={} {} failed: {}", self.char_id, stmt.label(), e);
        }
    }

    async fn items(&mut self, table: ItemTable, owner: u32, incoming: &[Item]) {
        let stored = match self.store.item_rows(table, owner).await {
            Ok(rows) => rows,
            Err(e) => {
                self.failed += 1;
                tracing::error!(
                    "[hub] [save] char_id={} reading {} failed: {}",
                    self.char_id,
                    table.name(),
                    e
                );
                return;
            }
        };
        for stmt in plan_items(table, owner, &stored, incoming) {
            self.exec(stmt).await;
        }
    }

    async fn replace_children(&mut self, table: ChildTable, insert: Option<Statement>) {
        self.exec(Statement::ClearChildren { table, char_id: self.char_id }).await;
        if let Some(stmt) = insert {
            self.exec(stmt).await;
        }
    }
}

/// Snapshot cache plus the diff writer.
pub struct CharCache {
    store: Arc<dyn CharStore>,
    snapshots: Mutex<HashMap<u32, Arc<Mutex<CharStatus>>>>,
    errors: AtomicU64,
}

impl CharCache {
    pub fn new(store: Arc<dyn CharStore>) -> Self {
        Self { store, snapshots: Mutex::new(HashMap::new()), errors: AtomicU64::new(0) }
    }

    /// Per-character slot, created blank on first use. Holding the slot's
    /// lock serializes loads and saves of that character.
    async fn slot(&self, char_id: u32) -> Arc<Mutex<CharStatus>> {
        let mut map = self.snapshots.lock().await;
        Arc::clone(
            map.entry(char_id)
                .or_insert_with(|| Arc::new(Mutex::new(CharStatus::new(char_id)))),
        )
    }

    /// Read a character from storage and make it the diff baseline.
    pub async fn load(&self, char_id: u32) -> Result<Option<CharStatus>, StoreError> {
        let slot = self.slot(char_id).await;
        let mut snap = slot.lock().await;
        let loaded = self.store.load_character(char_id).await?;
        if let Some(cs) = &loaded {
            *snap = cs.clone();
        }
        Ok(loaded)
    }

    pub async fn snapshot(&self, char_id: u32) -> Option<CharStatus> {
        let slot = self.snapshots.lock().await.get(&char_id).cloned()?;
        let snap = slot.lock().await;
        Some(snap.clone())
    }

    /// Total statement failures since start.
    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub async fn save(&self, char_id: u32, incoming: &CharStatus) -> Result<SaveReport, SaveError> {
        if incoming.char_id != char_id {
            return Err(SaveError::WrongCharacter { want: char_id, got: incoming.char_id });
        }
        let slot = self.slot(char_id).await;
        let mut snap = slot.lock().await;
        let mut run = SaveRun {
            store: self.store.as_ref(),
            char_id,
            failed: 0,
            statements: 0,
            sections: Vec::new(),
        };

        for (table, owner, old, new) in [
            (ItemTable::Inventory, char_id, &snap.inventory, &incoming.inventory),
            (ItemTable::Cart, char_id, &snap.cart, &incoming.cart),
            (ItemTable::Storage, incoming.account_id, &snap.storage, &incoming.storage),
        ] {
            if old != new {
                run.items(table, owner, new).await;
                run.sections.push(match table {
                    ItemTable::Inventory => "inventory",
                    ItemTable::Cart => "cart",
                    ItemTable::Storage => "storage",
                });
            }
        }

        let columns = changed_columns(&snap, incoming);
        if !columns.is_empty() {
            run.exec(Statement::UpdateCharacter { char_id, columns }).await;
            run.sections.push("status");
        }

        if snap.bank_vault != incoming.bank_vault {
            run.exec(Statement::ReplaceAccountData {
                account_id: incoming.account_id,
                bank_vault: incoming.bank_vault,
            })
            .await;
            run.sections.push("accdata");
        }

        if snap.mercenary != incoming.mercenary {
            run.exec(Statement::ReplaceMercenaryOwner { char_id, owner: incoming.mercenary }).await;
            run.sections.push("mercenary");
        }

        if snap.memo != incoming.memo {
            let insert = (!incoming.memo.is_empty())
                .then(|| Statement::InsertMemos { char_id, memos: incoming.memo.clone() });
            run.replace_children(ChildTable::Memo, insert).await;
            run.sections.push("memo");
        }

        if snap.skills != incoming.skills {
            let skills: Vec<_> =
                incoming.skills.iter().filter(|s| s.id != 0 && s.lv != 0).copied().collect();
            let insert = (!skills.is_empty()).then(|| Statement::InsertSkills { char_id, skills });
            run.replace_children(ChildTable::Skill, insert).await;
            run.sections.push("skills");
        }

        if snap.friends != incoming.friends {
            let friends: Vec<_> =
                incoming.friends.iter().filter(|f| f.char_id != 0).cloned().collect();
            let insert =
                (!friends.is_empty()).then(|| Statement::InsertFriends { char_id, friends });
            run.replace_children(ChildTable::Friend, insert).await;
            run.sections.push("friends");
        }

        let hotkeys = changed_hotkeys(&snap.hotkeys, &incoming.hotkeys);
        if !hotkeys.is_empty() {
            run.exec(Statement::ReplaceHotkeys { char_id, hotkeys }).await;
            run.sections.push("hotkeys");
        }

        if run.failed > 0 {
            self.errors.fetch_add(run.failed as u64, Ordering::Relaxed);
            tracing::warn!(
                "[hub] [save] char_id={} name={} kept previous snapshot after {} failure(s)",
                char_id,
                incoming.name,
                run.failed
            );
            return Err(SaveError::Failed { char_id, failed: run.failed });
        }

        *snap = incoming.clone();
        if !run.sections.is_empty() {
            tracing::info!(
                "[hub] [save] Saved char {} - {}: {}",
                char_id,
                incoming.name,
                run.sections.join(" ")
            );
        }
        Ok(SaveReport { sections: run.sections, statements: run.statements })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::servers::hub::charstatus::{Friend, MapPoint, Skill};
    use crate::servers::hub::memstore::MemoryStore;

    fn item(nameid: u32, amount: u32) -> Item {
        Item { nameid, amount, identify: 1, ..Default::default() }
    }

    fn sample() -> CharStatus {
        let mut cs = CharStatus::new(42);
        cs.account_id = 2000042;
        cs.name = "Tester".into();
        cs.base_level = 10;
        cs.zeny = 500;
        cs.inventory = vec![item(501, 5), item(502, 1), item(1201, 1)];
        cs.skills = vec![Skill { id: 1, lv: 9, flag: 0 }];
        cs.memo = vec![MapPoint { map: "prontera".into(), x: 150, y: 150 }];
        cs.friends = vec![Friend { account_id: 2000001, char_id: 150001, name: "Pal".into() }];
        cs.hotkeys = vec![Hotkey::default(); 4];
        cs
    }

    fn setup() -> (Arc<MemoryStore>, CharCache) {
        let store = Arc::new(MemoryStore::new());
        let cache = CharCache::new(store.clone());
        (store, cache)
    }

    #[test]
    fn test_plan_items_unchanged_is_empty() {
        let stored = vec![Item { id: 1, ..item(501, 5) }, Item { id: 2, ..item(502, 1) }];
        let incoming = vec![item(501, 5), item(502, 1)];
        assert!(plan_items(ItemTable::Inventory, 1, &stored, &incoming).is_empty());
    }

    #[test]
    fn test_plan_items_three_way() {
        let stored = vec![Item { id: 1, ..item(501, 5) }, Item { id: 2, ..item(502, 1) }];
        let incoming = vec![item(501, 4), Item::default(), item(503, 2)];
        let plan = plan_items(ItemTable::Cart, 9, &stored, &incoming);
        assert_eq!(plan.len(), 3);
        assert!(matches!(
            &plan[0],
            Statement::UpdateItem { row_id: 1, item, .. } if item.amount == 4
        ));
        assert!(matches!(&plan[1], Statement::DeleteItem { row_id: 2, .. }));
        assert!(matches!(
            &plan[2],
            Statement::InsertItems { owner: 9, items, .. }
                if items.len() == 1 && items[0].nameid == 503
        ));
    }

    #[test]
    fn test_plan_items_first_fit_with_duplicates() {
        // Two stacks of the same potion: each stored row claims one incoming
        // stack in order, so only the second stack's change is written.
        let stored = vec![Item { id: 10, ..item(501, 30) }, Item { id: 11, ..item(501, 30) }];
        let incoming = vec![item(501, 30), item(501, 12)];
        let plan = plan_items(ItemTable::Inventory, 1, &stored, &incoming);
        assert_eq!(plan.len(), 1);
        assert!(matches!(
            &plan[0],
            Statement::UpdateItem { row_id: 11, item, .. } if item.amount == 12
        ));
    }

    #[test]
    fn test_plan_items_inserted_rows_drop_stale_ids() {
        let incoming = vec![Item { id: 77, ..item(607, 1) }];
        let plan = plan_items(ItemTable::Storage, 5, &[], &incoming);
        assert!(matches!(&plan[0], Statement::InsertItems { items, .. } if items[0].id == 0));
    }

    #[test]
    fn test_changed_columns_batches_only_differences() {
        let a = sample();
        let mut b = sample();
        b.zeny = 900;
        b.last_point.x = 33;
        let cols = changed_columns(&a, &b);
        assert_eq!(cols, vec![("ChaZeny", SqlValue::Int(900)), ("ChaLastX", SqlValue::Int(33))]);
    }

    #[test]
    fn test_changed_hotkeys_handles_length_change() {
        let old = vec![Hotkey::default(); 2];
        let new = vec![Hotkey::default(), Hotkey { kind: 1, id: 28, lv: 10 }, Hotkey::default()];
        assert_eq!(changed_hotkeys(&old, &new), vec![(1, Hotkey { kind: 1, id: 28, lv: 10 })]);
    }

    #[tokio::test]
    async fn test_second_identical_save_issues_nothing() {
        let (store, cache) = setup();
        let cs = sample();
        cache.save(42, &cs).await.unwrap();
        assert!(!store.take_statements().is_empty());

        let report = cache.save(42, &cs).await.unwrap();
        assert_eq!(report, SaveReport::default());
        assert!(store.statements().is_empty());
    }

    #[tokio::test]
    async fn test_single_amount_change_is_one_update() {
        let (store, cache) = setup();
        let cs = sample();
        store.insert_character(&cs);
        let loaded = cache.load(42).await.unwrap().unwrap();
        store.take_statements();

        let mut next = loaded.clone();
        next.inventory[1].amount = 3;
        let report = cache.save(42, &next).await.unwrap();

        let stmts = store.statements();
        assert_eq!(stmts.len(), 1, "{:?}", stmts);
        assert!(matches!(
            &stmts[0],
            Statement::UpdateItem { table: ItemTable::Inventory, item, .. } if item.amount == 3
        ));
        assert_eq!(report.sections, vec!["inventory"]);
    }

    #[tokio::test]
    async fn test_status_change_is_single_update() {
        let (store, cache) = setup();
        let cs = sample();
        cache.save(42, &cs).await.unwrap();
        store.take_statements();

        let mut next = cs.clone();
        next.base_level = 11;
        next.hp = 1234;
        cache.save(42, &next).await.unwrap();
        let stmts = store.statements();
        assert_eq!(stmts.len(), 1);
        match &stmts[0] {
            Statement::UpdateCharacter { columns, .. } => assert_eq!(columns.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_skill_change_rewrites_table() {
        let (store, cache) = setup();
        let cs = sample();
        cache.save(42, &cs).await.unwrap();
        store.take_statements();

        let mut next = cs.clone();
        next.skills.push(Skill { id: 2, lv: 3, flag: 0 });
        cache.save(42, &next).await.unwrap();
        let stmts = store.statements();
        assert_eq!(stmts.len(), 2);
        assert!(matches!(
            stmts[0],
            Statement::ClearChildren { table: ChildTable::Skill, char_id: 42 }
        ));
        assert!(matches!(&stmts[1], Statement::InsertSkills { skills, .. } if skills.len() == 2));
        assert_eq!(store.skills(42).len(), 2);
    }

    #[tokio::test]
    async fn test_emptied_memo_only_clears() {
        let (store, cache) = setup();
        let cs = sample();
        cache.save(42, &cs).await.unwrap();
        store.take_statements();

        let mut next = cs.clone();
        next.memo.clear();
        cache.save(42, &next).await.unwrap();
        let stmts = store.statements();
        assert_eq!(stmts, vec![Statement::ClearChildren { table: ChildTable::Memo, char_id: 42 }]);
    }

    #[tokio::test]
    async fn test_failed_save_keeps_last_good_snapshot() {
        let (store, cache) = setup();
        let good = sample();
        cache.save(42, &good).await.unwrap();

        let mut bad = good.clone();
        bad.zeny = 1_000_000;
        bad.inventory[0].amount = 1;
        store.fail_when(|s| matches!(s, Statement::UpdateCharacter { .. }));
        let err = cache.save(42, &bad).await.unwrap_err();
        assert!(matches!(err, SaveError::Failed { char_id: 42, failed: 1 }));
        assert_eq!(cache.snapshot(42).await.unwrap(), good);
        assert_eq!(cache.error_count(), 1);

        // Same state again once storage recovers: everything that differed
        // from the last good snapshot is written again.
        store.clear_failures();
        store.take_statements();
        let report = cache.save(42, &bad).await.unwrap();
        assert!(report.sections.contains(&"status"));
        assert!(report.sections.contains(&"inventory"));
        assert_eq!(cache.snapshot(42).await.unwrap(), bad);
    }

    #[tokio::test]
    async fn test_identical_save_after_failure_stays_at_last_success() {
        let (store, cache) = setup();
        let good = sample();
        cache.save(42, &good).await.unwrap();

        let mut attempted = good.clone();
        attempted.job_level = 50;
        store.fail_when(|_| true);
        assert!(cache.save(42, &attempted).await.is_err());
        store.clear_failures();

        cache.save(42, &good).await.unwrap();
        assert_eq!(cache.snapshot(42).await.unwrap().job_level, good.job_level);
    }

    #[tokio::test]
    async fn test_wrong_character_rejected() {
        let (_store, cache) = setup();
        let cs = sample();
        assert!(matches!(
            cache.save(7, &cs).await,
            Err(SaveError::WrongCharacter { want: 7, got: 42 })
        ));
    }

    #[tokio::test]
    async fn test_storage_is_keyed_by_account() {
        let (store, cache) = setup();
        let mut cs = sample();
        cs.storage = vec![item(909, 10)];
        cache.save(42, &cs).await.unwrap();
        assert_eq!(store.rows(ItemTable::Storage, 2000042).len(), 1);
        assert!(store.rows(ItemTable::Storage, 42).is_empty());
    }
}
