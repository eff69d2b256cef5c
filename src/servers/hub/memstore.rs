//! In-process backend.
//!
//! Keeps every table in plain collections and records each statement it is
//! asked to run. Used by the test suites and for running the hub without a
//! database.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::auction::AuctionRecord;
use super::charstatus::{
    CharStatus, Friend, Hotkey, Item, MapPoint, MercenaryOwner, Skill, SqlValue,
};
use super::db::{CharRef, CharStore, ChildTable, Executed, ItemTable, Statement, StoreError};
use super::relay::MailDraft;

type FailFn = Box<dyn Fn(&Statement) -> bool + Send>;

#[derive(Default)]
struct Tables {
    log: Vec<Statement>,
    failed: usize,
    fail: Option<FailFn>,
    next_row: u64,
    next_auction: u64,
    characters: HashMap<u32, CharStatus>,
    columns: HashMap<(u32, &'static str), SqlValue>,
    online: HashMap<u32, bool>,
    vaults: HashMap<u32, i64>,
    mercenaries: HashMap<u32, MercenaryOwner>,
    items: HashMap<(ItemTable, u32), Vec<Item>>,
    skills: HashMap<u32, Vec<Skill>>,
    friends: HashMap<u32, Vec<Friend>>,
    memos: HashMap<u32, Vec<MapPoint>>,
    hotkeys: HashMap<(u32, usize), Hotkey>,
    auctions: BTreeMap<u32, AuctionRecord>,
    mails: Vec<MailDraft>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed a character row. Its item arrays become stored rows.
    pub fn insert_character(&self, cs: &CharStatus) {
        let mut t = self.tables();
        for (table, owner, items) in [
            (ItemTable::Inventory, cs.char_id, &cs.inventory),
            (ItemTable::Cart, cs.char_id, &cs.cart),
            (ItemTable::Storage, cs.account_id, &cs.storage),
        ] {
            let rows = items
                .iter()
                .filter(|i| !i.is_empty())
                .map(|i| {
                    t.next_row += 1;
                    Item { id: t.next_row, ..i.clone() }
                })
                .collect::<Vec<_>>();
            t.items.insert((table, owner), rows);
        }
        let mut bare = cs.clone();
        bare.inventory.clear();
        bare.cart.clear();
        bare.storage.clear();
        t.characters.insert(cs.char_id, bare);
    }

    /// Seed an auction row as if it survived a restart.
    pub fn insert_auction(&self, rec: AuctionRecord) {
        let mut t = self.tables();
        t.next_auction = t.next_auction.max(u64::from(rec.auction_id));
        t.auctions.insert(rec.auction_id, rec);
    }

    /// Like `ALTER TABLE Auction AUTO_INCREMENT`; the next listing gets `id + 1`.
    pub fn set_auction_counter(&self, id: u64) {
        self.tables().next_auction = id;
    }

    /// Make every statement matching `pred` fail until cleared.
    pub fn fail_when<F>(&self, pred: F)
    where
        F: Fn(&Statement) -> bool + Send + 'static,
    {
        self.tables().fail = Some(Box::new(pred));
    }

    pub fn clear_failures(&self) {
        self.tables().fail = None;
    }

    /// Every statement attempted so far, failed ones included.
    pub fn statements(&self) -> Vec<Statement> {
        self.tables().log.clone()
    }

    pub fn take_statements(&self) -> Vec<Statement> {
        std::mem::take(&mut self.tables().log)
    }

    pub fn failed(&self) -> usize {
        self.tables().failed
    }

    pub fn rows(&self, table: ItemTable, owner: u32) -> Vec<Item> {
        self.tables().items.get(&(table, owner)).cloned().unwrap_or_default()
    }

    pub fn column(&self, char_id: u32, column: &str) -> Option<SqlValue> {
        self.tables()
            .columns
            .iter()
            .find(|((id, c), _)| *id == char_id && *c == column)
            .map(|(_, v)| v.clone())
    }

    pub fn skills(&self, char_id: u32) -> Vec<Skill> {
        self.tables().skills.get(&char_id).cloned().unwrap_or_default()
    }

    pub fn is_online(&self, char_id: u32) -> bool {
        self.tables().online.get(&char_id).copied().unwrap_or(false)
    }

    pub fn auctions(&self) -> Vec<AuctionRecord> {
        self.tables().auctions.values().cloned().collect()
    }

    pub fn mails(&self) -> Vec<MailDraft> {
        self.tables().mails.clone()
    }
}

fn apply(t: &mut Tables, stmt: &Statement) -> Executed {
    let mut done = Executed { rows: 1, last_insert_id: 0 };
    match stmt {
        Statement::UpdateCharacter { char_id, columns } => {
            for (c, v) in columns {
                t.columns.insert((*char_id, *c), v.clone());
            }
            done.rows = u64::from(!columns.is_empty());
        }
        Statement::ReplaceAccountData { account_id, bank_vault } => {
            t.vaults.insert(*account_id, *bank_vault);
        }
        Statement::ReplaceMercenaryOwner { char_id, owner } => {
            t.mercenaries.insert(*char_id, *owner);
        }
        Statement::UpdateItem { table, row_id, item } => {
            let row = t
                .items
                .iter_mut()
                .filter(|((tb, _), _)| tb == table)
                .flat_map(|(_, rows)| rows.iter_mut())
                .find(|r| r.id == *row_id);
            match row {
                Some(r) => *r = Item { id: *row_id, ..item.clone() },
                None => done.rows = 0,
            }
        }
        Statement::DeleteItem { table, row_id } => {
            done.rows = 0;
            for ((tb, _), rows) in t.items.iter_mut() {
                if tb == table {
                    let before = rows.len();
                    rows.retain(|r| r.id != *row_id);
                    done.rows += (before - rows.len()) as u64;
                }
            }
        }
        Statement::InsertItems { table, owner, items } => {
            let mut next = t.next_row;
            let rows = t.items.entry((*table, *owner)).or_default();
            for item in items {
                next += 1;
                rows.push(Item { id: next, ..item.clone() });
            }
            t.next_row = next;
            done.rows = items.len() as u64;
            done.last_insert_id = next;
        }
        Statement::ClearChildren { table, char_id } => match table {
            ChildTable::Skill => done.rows = t.skills.remove(char_id).map_or(0, |v| v.len() as u64),
            ChildTable::Friend => {
                done.rows = t.friends.remove(char_id).map_or(0, |v| v.len() as u64)
            }
            ChildTable::Memo => done.rows = t.memos.remove(char_id).map_or(0, |v| v.len() as u64),
        },
        Statement::InsertSkills { char_id, skills } => {
            t.skills.entry(*char_id).or_default().extend_from_slice(skills);
            done.rows = skills.len() as u64;
        }
        Statement::InsertFriends { char_id, friends } => {
            t.friends.entry(*char_id).or_default().extend_from_slice(friends);
            done.rows = friends.len() as u64;
        }
        Statement::InsertMemos { char_id, memos } => {
            t.memos.entry(*char_id).or_default().extend_from_slice(memos);
            done.rows = memos.len() as u64;
        }
        Statement::ReplaceHotkeys { char_id, hotkeys } => {
            for (idx, h) in hotkeys {
                t.hotkeys.insert((*char_id, *idx), *h);
            }
            done.rows = hotkeys.len() as u64;
        }
        Statement::SetCharOnline { char_id, online } => {
            t.online.insert(*char_id, *online);
        }
        Statement::SetAllOffline => {
            done.rows = t.online.values().filter(|o| **o).count() as u64;
            t.online.clear();
        }
        Statement::InsertAuction(rec) => {
            t.next_auction += 1;
            done.last_insert_id = t.next_auction;
            // truncated key; AuctionHouse::create rejects ids past u32
            let id = t.next_auction as u32;
            t.auctions.insert(id, AuctionRecord { auction_id: id, ..rec.clone() });
        }
        Statement::UpdateAuction(rec) => match t.auctions.get_mut(&rec.auction_id) {
            Some(a) => *a = rec.clone(),
            None => done.rows = 0,
        },
        Statement::DeleteAuction { auction_id } => {
            done.rows = u64::from(t.auctions.remove(auction_id).is_some());
        }
        Statement::InsertMail(m) => {
            t.mails.push(m.clone());
            done.last_insert_id = t.mails.len() as u64;
        }
    }
    done
}

#[async_trait]
impl CharStore for MemoryStore {
    async fn execute(&self, stmt: &Statement) -> Result<Executed, StoreError> {
        let mut t = self.tables();
        t.log.push(stmt.clone());
        if t.fail.as_ref().is_some_and(|f| f(stmt)) {
            t.failed += 1;
            return Err(StoreError::Rejected(stmt.label().to_string()));
        }
        Ok(apply(&mut t, stmt))
    }

    async fn item_rows(&self, table: ItemTable, owner: u32) -> Result<Vec<Item>, StoreError> {
        Ok(self.rows(table, owner))
    }

    async fn load_character(&self, char_id: u32) -> Result<Option<CharStatus>, StoreError> {
        let t = self.tables();
        let Some(base) = t.characters.get(&char_id) else {
            return Ok(None);
        };
        let mut cs = base.clone();
        let rows = |table, owner| t.items.get(&(table, owner)).cloned().unwrap_or_default();
        cs.inventory = rows(ItemTable::Inventory, char_id);
        cs.cart = rows(ItemTable::Cart, char_id);
        cs.storage = rows(ItemTable::Storage, cs.account_id);
        if let Some(skills) = t.skills.get(&char_id) {
            cs.skills = skills.clone();
        }
        Ok(Some(cs))
    }

    async fn find_character(&self, name: &str) -> Result<Option<CharRef>, StoreError> {
        let t = self.tables();
        Ok(t.characters.values().find(|c| c.name == name).map(|c| CharRef {
            char_id: c.char_id,
            account_id: c.account_id,
            name: c.name.clone(),
        }))
    }

    async fn load_auctions(&self) -> Result<Vec<AuctionRecord>, StoreError> {
        Ok(self.auctions())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_then_read_rows() {
        let store = MemoryStore::new();
        let item = Item { nameid: 501, amount: 3, ..Default::default() };
        store
            .execute(&Statement::InsertItems {
                table: ItemTable::Inventory,
                owner: 1,
                items: vec![item],
            })
            .await
            .unwrap();
        let rows = store.item_rows(ItemTable::Inventory, 1).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_ne!(rows[0].id, 0);
        assert!(store.item_rows(ItemTable::Cart, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_injection_is_logged() {
        let store = MemoryStore::new();
        store.fail_when(|s| matches!(s, Statement::SetAllOffline));
        assert!(store.execute(&Statement::SetAllOffline).await.is_err());
        assert_eq!(store.failed(), 1);
        assert_eq!(store.statements().len(), 1);
        store.clear_failures();
        assert!(store.execute(&Statement::SetAllOffline).await.is_ok());
    }

    #[tokio::test]
    async fn test_find_character_by_name() {
        let store = MemoryStore::new();
        let mut cs = CharStatus::new(150000);
        cs.account_id = 2000000;
        cs.name = "Bob".into();
        store.insert_character(&cs);
        let found = store.find_character("Bob").await.unwrap().unwrap();
        assert_eq!(found.char_id, 150000);
        assert!(store.find_character("Nobody").await.unwrap().is_none());
    }
}
