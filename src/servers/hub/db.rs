//! Persistence backend.
//!
//! Every write the hub performs is a [`Statement`]. Components build
//! statements and hand them to a [`CharStore`]; the MySQL store turns them
//! into SQL, the memory store applies them to plain collections.

use async_trait::async_trait;
use sqlx::mysql::MySqlRow;
use sqlx::{MySql, MySqlPool, QueryBuilder, Row};
use thiserror::Error;

use super::auction::{AuctionItem, AuctionRecord};
use super::charstatus::{
    CharStatus, Friend, Hotkey, Item, MapPoint, MercenaryOwner, Skill, SqlValue, MAX_HOTKEYS,
};
use super::relay::MailDraft;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("statement rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemTable {
    Inventory,
    Cart,
    Storage,
}

impl ItemTable {
    pub fn name(self) -> &'static str {
        match self {
            ItemTable::Inventory => "Inventory",
            ItemTable::Cart => "Cart",
            ItemTable::Storage => "Storage",
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            ItemTable::Inventory => "Inv",
            ItemTable::Cart => "Crt",
            ItemTable::Storage => "Sto",
        }
    }

    /// Storage belongs to the account, the other two to the character.
    fn owner_column(self) -> &'static str {
        match self {
            ItemTable::Inventory => "InvChaId",
            ItemTable::Cart => "CrtChaId",
            ItemTable::Storage => "StoActId",
        }
    }
}

/// Child tables that are rewritten wholesale on change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildTable {
    Skill,
    Friend,
    Memo,
}

impl ChildTable {
    fn delete_sql(self) -> &'static str {
        match self {
            ChildTable::Skill => "DELETE FROM `Skill` WHERE `SklChaId` = ?",
            ChildTable::Friend => "DELETE FROM `Friend` WHERE `FrdChaId` = ?",
            ChildTable::Memo => "DELETE FROM `Memo` WHERE `MemChaId` = ?",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    UpdateCharacter { char_id: u32, columns: Vec<(&'static str, SqlValue)> },
    ReplaceAccountData { account_id: u32, bank_vault: i64 },
    ReplaceMercenaryOwner { char_id: u32, owner: MercenaryOwner },
    UpdateItem { table: ItemTable, row_id: u64, item: Item },
    DeleteItem { table: ItemTable, row_id: u64 },
    InsertItems { table: ItemTable, owner: u32, items: Vec<Item> },
    ClearChildren { table: ChildTable, char_id: u32 },
    InsertSkills { char_id: u32, skills: Vec<Skill> },
    InsertFriends { char_id: u32, friends: Vec<Friend> },
    InsertMemos { char_id: u32, memos: Vec<MapPoint> },
    ReplaceHotkeys { char_id: u32, hotkeys: Vec<(usize, Hotkey)> },
    SetCharOnline { char_id: u32, online: bool },
    SetAllOffline,
    InsertAuction(AuctionRecord),
    UpdateAuction(AuctionRecord),
    DeleteAuction { auction_id: u32 },
    InsertMail(MailDraft),
}

impl Statement {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Statement::UpdateCharacter { .. } => "update character",
            Statement::ReplaceAccountData { .. } => "replace account data",
            Statement::ReplaceMercenaryOwner { .. } => "replace mercenary owner",
            Statement::UpdateItem { .. } => "update item",
            Statement::DeleteItem { .. } => "delete item",
            Statement::InsertItems { .. } => "insert items",
            Statement::ClearChildren { .. } => "clear children",
            Statement::InsertSkills { .. } => "insert skills",
            Statement::InsertFriends { .. } => "insert friends",
            Statement::InsertMemos { .. } => "insert memos",
            Statement::ReplaceHotkeys { .. } => "replace hotkeys",
            Statement::SetCharOnline { .. } => "set char online",
            Statement::SetAllOffline => "set all offline",
            Statement::InsertAuction(_) => "insert auction",
            Statement::UpdateAuction(_) => "update auction",
            Statement::DeleteAuction { .. } => "delete auction",
            Statement::InsertMail(_) => "insert mail",
        }
    }
}

/// Result of one write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Executed {
    pub rows: u64,
    pub last_insert_id: u64,
}

/// A character located by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharRef {
    pub char_id: u32,
    pub account_id: u32,
    pub name: String,
}

#[async_trait]
pub trait CharStore: Send + Sync {
    async fn execute(&self, stmt: &Statement) -> Result<Executed, StoreError>;

    /// Current rows of one item table for `owner`, with row ids filled in.
    async fn item_rows(&self, table: ItemTable, owner: u32) -> Result<Vec<Item>, StoreError>;

    async fn load_character(&self, char_id: u32) -> Result<Option<CharStatus>, StoreError>;

    async fn find_character(&self, name: &str) -> Result<Option<CharRef>, StoreError>;

    async fn load_auctions(&self) -> Result<Vec<AuctionRecord>, StoreError>;
}

pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Apply the bundled schema. Only run when the operator asks for it.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

fn item_columns(p: &str) -> String {
    format!(
        "`{p}ItmId`,`{p}Amount`,`{p}Equip`,`{p}Identify`,`{p}Refine`,`{p}Attribute`,\
         `{p}Card0`,`{p}Card1`,`{p}Card2`,`{p}Card3`,`{p}ExpireTime`,`{p}Bound`,\
         `{p}UniqueId`,`{p}Favorite`"
    )
}

fn push_item_binds(
    mut b: sqlx::query_builder::Separated<'_, '_, MySql, &'static str>,
    item: &Item,
) {
    b.push_bind(item.nameid)
        .push_bind(item.amount)
        .push_bind(item.equip)
        .push_bind(item.identify)
        .push_bind(item.refine)
        .push_bind(item.attribute)
        .push_bind(item.cards[0])
        .push_bind(item.cards[1])
        .push_bind(item.cards[2])
        .push_bind(item.cards[3])
        .push_bind(item.expire_time)
        .push_bind(item.bound)
        .push_bind(item.unique_id)
        .push_bind(item.favorite);
}

fn row_to_item(row: &MySqlRow) -> Result<Item, sqlx::Error> {
    Ok(Item {
        id: row.try_get("id")?,
        nameid: row.try_get("nameid")?,
        amount: row.try_get("amount")?,
        equip: row.try_get("equip")?,
        identify: row.try_get("identify")?,
        refine: row.try_get("refine")?,
        attribute: row.try_get("attribute")?,
        cards: [
            row.try_get("card0")?,
            row.try_get("card1")?,
            row.try_get("card2")?,
            row.try_get("card3")?,
        ],
        expire_time: row.try_get("expire_time")?,
        bound: row.try_get("bound")?,
        unique_id: row.try_get("unique_id")?,
        favorite: row.try_get("favorite")?,
    })
}

fn row_to_auction(row: &MySqlRow) -> Result<AuctionRecord, sqlx::Error> {
    let buyer_id: u32 = row.try_get("AucBuyerId")?;
    Ok(AuctionRecord {
        auction_id: row.try_get("AucId")?,
        seller_id: row.try_get("AucSellerId")?,
        seller_name: row.try_get("AucSellerName")?,
        buyer_id: (buyer_id != 0).then_some(buyer_id),
        buyer_name: row.try_get("AucBuyerName")?,
        price: row.try_get("AucPrice")?,
        reserve: row.try_get("AucReserve")?,
        buynow: row.try_get("AucBuynow")?,
        hours: row.try_get("AucHours")?,
        created_at: row.try_get("AucCreated")?,
        expires_at: row.try_get("AucTimestamp")?,
        item: AuctionItem {
            nameid: row.try_get("AucNameId")?,
            item_type: row.try_get("AucType")?,
            refine: row.try_get("AucRefine")?,
            attribute: row.try_get("AucAttribute")?,
            identify: row.try_get("AucIdentify")?,
            cards: [
                row.try_get("AucCard0")?,
                row.try_get("AucCard1")?,
                row.try_get("AucCard2")?,
                row.try_get("AucCard3")?,
            ],
            unique_id: row.try_get("AucUniqueId")?,
            name: row.try_get("AucItemName")?,
        },
    })
}

fn bind_auction<'q>(
    q: sqlx::query::Query<'q, MySql, sqlx::mysql::MySqlArguments>,
    a: &'q AuctionRecord,
) -> sqlx::query::Query<'q, MySql, sqlx::mysql::MySqlArguments> {
    q.bind(a.seller_id)
        .bind(a.seller_name.as_str())
        .bind(a.buyer_id.unwrap_or(0))
        .bind(a.buyer_name.as_str())
        .bind(a.price)
        .bind(a.reserve)
        .bind(a.buynow)
        .bind(a.hours)
        .bind(a.created_at)
        .bind(a.expires_at)
        .bind(a.item.name.as_str())
        .bind(a.item.item_type)
        .bind(a.item.nameid)
        .bind(a.item.refine)
        .bind(a.item.attribute)
        .bind(a.item.identify)
        .bind(a.item.cards[0])
        .bind(a.item.cards[1])
        .bind(a.item.cards[2])
        .bind(a.item.cards[3])
        .bind(a.item.unique_id)
}

const AUCTION_COLUMNS: &str = "`AucSellerId`=?,`AucSellerName`=?,`AucBuyerId`=?,`AucBuyerName`=?,\
     `AucPrice`=?,`AucReserve`=?,`AucBuynow`=?,`AucHours`=?,`AucCreated`=?,`AucTimestamp`=?,\
     `AucItemName`=?,`AucType`=?,`AucNameId`=?,`AucRefine`=?,`AucAttribute`=?,`AucIdentify`=?,\
     `AucCard0`=?,`AucCard1`=?,`AucCard2`=?,`AucCard3`=?,`AucUniqueId`=?";

#[async_trait]
impl CharStore for MySqlStore {
    async fn execute(&self, stmt: &Statement) -> Result<Executed, StoreError> {
        let pool = &self.pool;
        let res = match stmt {
            Statement::UpdateCharacter { char_id, columns } => {
                if columns.is_empty() {
                    return Ok(Executed::default());
                }
                let sets: Vec<String> = columns.iter().map(|(c, _)| format!("`{}`=?", c)).collect();
                let sql = format!("UPDATE `Character` SET {} WHERE `ChaId` = ?", sets.join(","));
                let mut q = sqlx::query(&sql);
                for (_, v) in columns {
                    q = match v {
                        SqlValue::Int(i) => q.bind(*i),
                        SqlValue::Text(s) => q.bind(s.as_str()),
                    };
                }
                q.bind(*char_id).execute(pool).await?
            }
            Statement::ReplaceAccountData { account_id, bank_vault } => {
                sqlx::query("REPLACE INTO `AccountData` (`AdtActId`,`AdtBankVault`) VALUES(?,?)")
                    .bind(*account_id)
                    .bind(*bank_vault)
                    .execute(pool)
                    .await?
            }
            Statement::ReplaceMercenaryOwner { char_id, owner } => {
                sqlx::query(
                    "REPLACE INTO `MercenaryOwner` (`MowChaId`,`MowMerId`,`MowArchCalls`,`MowArchFaith`,\
                     `MowSpearCalls`,`MowSpearFaith`,`MowSwordCalls`,`MowSwordFaith`) VALUES(?,?,?,?,?,?,?,?)",
                )
                .bind(*char_id)
                .bind(owner.mer_id)
                .bind(owner.arch_calls)
                .bind(owner.arch_faith)
                .bind(owner.spear_calls)
                .bind(owner.spear_faith)
                .bind(owner.sword_calls)
                .bind(owner.sword_faith)
                .execute(pool)
                .await?
            }
            Statement::UpdateItem { table, row_id, item } => {
                let p = table.prefix();
                let sql = format!(
                    "UPDATE `{t}` SET `{p}Amount`=?,`{p}Equip`=?,`{p}Identify`=?,`{p}Refine`=?,\
                     `{p}Attribute`=?,`{p}Card0`=?,`{p}Card1`=?,`{p}Card2`=?,`{p}Card3`=?,\
                     `{p}ExpireTime`=?,`{p}Bound`=?,`{p}Favorite`=? WHERE `{p}Id` = ?",
                    t = table.name()
                );
                sqlx::query(&sql)
                    .bind(item.amount)
                    .bind(item.equip)
                    .bind(item.identify)
                    .bind(item.refine)
                    .bind(item.attribute)
                    .bind(item.cards[0])
                    .bind(item.cards[1])
                    .bind(item.cards[2])
                    .bind(item.cards[3])
                    .bind(item.expire_time)
                    .bind(item.bound)
                    .bind(item.favorite)
                    .bind(*row_id)
                    .execute(pool)
                    .await?
            }
            Statement::DeleteItem { table, row_id } => {
                let sql =
                    format!("DELETE FROM `{}` WHERE `{}Id` = ?", table.name(), table.prefix());
                sqlx::query(&sql).bind(*row_id).execute(pool).await?
            }
            Statement::InsertItems { table, owner, items } => {
                if items.is_empty() {
                    return Ok(Executed::default());
                }
                let mut qb: QueryBuilder<MySql> = QueryBuilder::new(format!(
                    "INSERT INTO `{}` (`{}`,{}) ",
                    table.name(),
                    table.owner_column(),
                    item_columns(table.prefix())
                ));
                qb.push_values(items.iter(), |mut b, item| {
                    b.push_bind(*owner);
                    push_item_binds(b, item);
                });
                qb.build().execute(pool).await?
            }
            Statement::ClearChildren { table, char_id } => {
                sqlx::query(table.delete_sql()).bind(*char_id).execute(pool).await?
            }
            Statement::InsertSkills { char_id, skills } => {
                if skills.is_empty() {
                    return Ok(Executed::default());
                }
                let mut qb: QueryBuilder<MySql> =
                    QueryBuilder::new("INSERT INTO `Skill` (`SklChaId`,`SklId`,`SklLevel`,`SklFlag`) ");
                qb.push_values(skills.iter(), |mut b, s| {
                    b.push_bind(*char_id).push_bind(s.id).push_bind(s.lv).push_bind(s.flag);
                });
                qb.build().execute(pool).await?
            }
            Statement::InsertFriends { char_id, friends } => {
                if friends.is_empty() {
                    return Ok(Executed::default());
                }
                let mut qb: QueryBuilder<MySql> = QueryBuilder::new(
                    "INSERT INTO `Friend` (`FrdChaId`,`FrdFriendActId`,`FrdFriendChaId`,`FrdName`) ",
                );
                qb.push_values(friends.iter(), |mut b, f| {
                    b.push_bind(*char_id)
                        .push_bind(f.account_id)
                        .push_bind(f.char_id)
                        .push_bind(f.name.as_str());
                });
                qb.build().execute(pool).await?
            }
            Statement::InsertMemos { char_id, memos } => {
                if memos.is_empty() {
                    return Ok(Executed::default());
                }
                let mut qb: QueryBuilder<MySql> = QueryBuilder::new(
                    "INSERT INTO `Memo` (`MemChaId`,`MemPosition`,`MemMap`,`MemX`,`MemY`) ",
                );
                qb.push_values(memos.iter().enumerate(), |mut b, (i, m)| {
                    b.push_bind(*char_id)
                        .push_bind(i as u32)
                        .push_bind(m.map.as_str())
                        .push_bind(m.x)
                        .push_bind(m.y);
                });
                qb.build().execute(pool).await?
            }
            Statement::ReplaceHotkeys { char_id, hotkeys } => {
                if hotkeys.is_empty() {
                    return Ok(Executed::default());
                }
                let mut qb: QueryBuilder<MySql> = QueryBuilder::new(
                    "REPLACE INTO `Hotkey` (`HotChaId`,`HotIndex`,`HotType`,`HotItemSkillId`,`HotLevel`) ",
                );
                qb.push_values(hotkeys.iter(), |mut b, (idx, h)| {
                    b.push_bind(*char_id)
                        .push_bind(*idx as u32)
                        .push_bind(h.kind)
                        .push_bind(h.id)
                        .push_bind(h.lv);
                });
                qb.build().execute(pool).await?
            }
            Statement::SetCharOnline { char_id, online } => {
                sqlx::query("UPDATE `Character` SET `ChaOnline` = ? WHERE `ChaId` = ?")
                    .bind(u8::from(*online))
                    .bind(*char_id)
                    .execute(pool)
                    .await?
            }
            Statement::SetAllOffline => {
                sqlx::query("UPDATE `Character` SET `ChaOnline` = 0 WHERE `ChaOnline` != 0")
                    .execute(pool)
                    .await?
            }
            Statement::InsertAuction(a) => {
                let sql = format!("INSERT INTO `Auction` SET {}", AUCTION_COLUMNS);
                bind_auction(sqlx::query(&sql), a).execute(pool).await?
            }
            Statement::UpdateAuction(a) => {
                let sql = format!("UPDATE `Auction` SET {} WHERE `AucId` = ?", AUCTION_COLUMNS);
                bind_auction(sqlx::query(&sql), a)
                    .bind(a.auction_id)
                    .execute(pool)
                    .await?
            }
            Statement::DeleteAuction { auction_id } => {
                sqlx::query("DELETE FROM `Auction` WHERE `AucId` = ?")
                    .bind(*auction_id)
                    .execute(pool)
                    .await?
            }
            Statement::InsertMail(m) => {
                sqlx::query(
                    "INSERT INTO `Mail` (`MalSendName`,`MalSendId`,`MalDestName`,`MalDestId`,`MalTitle`,\
                     `MalMessage`,`MalTime`,`MalZeny`,`MalNameId`,`MalAmount`,`MalRefine`,`MalAttribute`,\
                     `MalIdentify`,`MalCard0`,`MalCard1`,`MalCard2`,`MalCard3`,`MalUniqueId`) \
                     VALUES(?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
                )
                .bind(m.sender_name.as_str())
                .bind(m.sender_id)
                .bind(m.dest_name.as_str())
                .bind(m.dest_id)
                .bind(m.title.as_str())
                .bind(m.body.as_str())
                .bind(m.sent_at)
                .bind(m.zeny)
                .bind(m.item.as_ref().map_or(0, |i| i.nameid))
                .bind(u32::from(m.item.is_some()))
                .bind(m.item.as_ref().map_or(0, |i| i.refine))
                .bind(m.item.as_ref().map_or(0, |i| i.attribute))
                .bind(m.item.as_ref().map_or(0, |i| i.identify))
                .bind(m.item.as_ref().map_or(0, |i| i.cards[0]))
                .bind(m.item.as_ref().map_or(0, |i| i.cards[1]))
                .bind(m.item.as_ref().map_or(0, |i| i.cards[2]))
                .bind(m.item.as_ref().map_or(0, |i| i.cards[3]))
                .bind(m.item.as_ref().map_or(0, |i| i.unique_id))
                .execute(pool)
                .await?
            }
        };
        Ok(Executed { rows: res.rows_affected(), last_insert_id: res.last_insert_id() })
    }

    async fn item_rows(&self, table: ItemTable, owner: u32) -> Result<Vec<Item>, StoreError> {
        let p = table.prefix();
        let sql = format!(
            "SELECT `{p}Id` AS id, `{p}ItmId` AS nameid, `{p}Amount` AS amount, `{p}Equip` AS equip,\
             `{p}Identify` AS identify, `{p}Refine` AS refine, `{p}Attribute` AS attribute,\
             `{p}Card0` AS card0, `{p}Card1` AS card1, `{p}Card2` AS card2, `{p}Card3` AS card3,\
             `{p}ExpireTime` AS expire_time, `{p}Bound` AS bound, `{p}UniqueId` AS unique_id,\
             `{p}Favorite` AS favorite FROM `{t}` WHERE `{o}` = ? ORDER BY `{p}Id`",
            t = table.name(),
            o = table.owner_column()
        );
        let rows = sqlx::query(&sql).bind(owner).fetch_all(&self.pool).await?;
        let items = rows.iter().map(row_to_item).collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    async fn load_character(&self, char_id: u32) -> Result<Option<CharStatus>, StoreError> {
        let pool = &self.pool;
        let row = match sqlx::query("SELECT * FROM `Character` WHERE `ChaId` = ?")
            .bind(char_id)
            .fetch_optional(pool)
            .await?
        {
            Some(r) => r,
            None => return Ok(None),
        };

        let mut cs = CharStatus {
            char_id,
            account_id: row.try_get("ChaActId")?,
            slot: row.try_get("ChaSlot")?,
            name: row.try_get("ChaName")?,
            class: row.try_get("ChaClass")?,
            base_level: row.try_get("ChaBaseLevel")?,
            job_level: row.try_get("ChaJobLevel")?,
            base_exp: row.try_get("ChaBaseExp")?,
            job_exp: row.try_get("ChaJobExp")?,
            zeny: row.try_get("ChaZeny")?,
            str: row.try_get("ChaStr")?,
            agi: row.try_get("ChaAgi")?,
            vit: row.try_get("ChaVit")?,
            int: row.try_get("ChaInt")?,
            dex: row.try_get("ChaDex")?,
            luk: row.try_get("ChaLuk")?,
            status_point: row.try_get("ChaStatusPoint")?,
            skill_point: row.try_get("ChaSkillPoint")?,
            hp: row.try_get("ChaHp")?,
            max_hp: row.try_get("ChaMaxHp")?,
            sp: row.try_get("ChaSp")?,
            max_sp: row.try_get("ChaMaxSp")?,
            option: row.try_get("ChaOption")?,
            karma: row.try_get("ChaKarma")?,
            manner: row.try_get("ChaManner")?,
            party_id: row.try_get("ChaPartyId")?,
            guild_id: row.try_get("ChaGuildId")?,
            pet_id: row.try_get("ChaPetId")?,
            hom_id: row.try_get("ChaHomId")?,
            ele_id: row.try_get("ChaEleId")?,
            hair: row.try_get("ChaHair")?,
            hair_color: row.try_get("ChaHairColor")?,
            clothes_color: row.try_get("ChaClothesColor")?,
            body: row.try_get("ChaBody")?,
            weapon: row.try_get("ChaWeapon")?,
            shield: row.try_get("ChaShield")?,
            head_top: row.try_get("ChaHeadTop")?,
            head_mid: row.try_get("ChaHeadMid")?,
            head_bottom: row.try_get("ChaHeadBottom")?,
            robe: row.try_get("ChaRobe")?,
            last_point: MapPoint {
                map: row.try_get("ChaLastMap")?,
                x: row.try_get("ChaLastX")?,
                y: row.try_get("ChaLastY")?,
            },
            save_point: MapPoint {
                map: row.try_get("ChaSaveMap")?,
                x: row.try_get("ChaSaveX")?,
                y: row.try_get("ChaSaveY")?,
            },
            partner_id: row.try_get("ChaPartnerId")?,
            father: row.try_get("ChaFather")?,
            mother: row.try_get("ChaMother")?,
            child: row.try_get("ChaChild")?,
            fame: row.try_get("ChaFame")?,
            rename: row.try_get("ChaRename")?,
            show_equip: row.try_get("ChaShowEquip")?,
            font: row.try_get("ChaFont")?,
            title_id: row.try_get("ChaTitleId")?,
            ..Default::default()
        };

        let vault: Option<(i64,)> =
            sqlx::query_as("SELECT `AdtBankVault` FROM `AccountData` WHERE `AdtActId` = ?")
                .bind(cs.account_id)
                .fetch_optional(pool)
                .await?;
        cs.bank_vault = vault.map(|(v,)| v).unwrap_or(0);

        let merc: Option<(u32, u32, u32, u32, u32, u32, u32)> = sqlx::query_as(
            "SELECT `MowMerId`,`MowArchCalls`,`MowArchFaith`,`MowSpearCalls`,`MowSpearFaith`,\
             `MowSwordCalls`,`MowSwordFaith` FROM `MercenaryOwner` WHERE `MowChaId` = ?",
        )
        .bind(char_id)
        .fetch_optional(pool)
        .await?;
        if let Some((
            mer_id,
            arch_calls,
            arch_faith,
            spear_calls,
            spear_faith,
            sword_calls,
            sword_faith,
        )) = merc
        {
            cs.mercenary = MercenaryOwner {
                mer_id,
                arch_calls,
                arch_faith,
                spear_calls,
                spear_faith,
                sword_calls,
                sword_faith,
            };
        }

        cs.inventory = self.item_rows(ItemTable::Inventory, char_id).await?;
        cs.cart = self.item_rows(ItemTable::Cart, char_id).await?;
        cs.storage = self.item_rows(ItemTable::Storage, cs.account_id).await?;

        let skills: Vec<(u16, u8, u8)> = sqlx::query_as(
            "SELECT `SklId`,`SklLevel`,`SklFlag` FROM `Skill` WHERE `SklChaId` = ? ORDER BY `SklId`",
        )
        .bind(char_id)
        .fetch_all(pool)
        .await?;
        cs.skills = skills.into_iter().map(|(id, lv, flag)| Skill { id, lv, flag }).collect();

        let friends: Vec<(u32, u32, String)> = sqlx::query_as(
            "SELECT `FrdFriendActId`,`FrdFriendChaId`,`FrdName` FROM `Friend` WHERE `FrdChaId` = ?",
        )
        .bind(char_id)
        .fetch_all(pool)
        .await?;
        cs.friends = friends
            .into_iter()
            .map(|(account_id, char_id, name)| Friend { account_id, char_id, name })
            .collect();

        let memos: Vec<(String, u16, u16)> = sqlx::query_as(
            "SELECT `MemMap`,`MemX`,`MemY` FROM `Memo` WHERE `MemChaId` = ? ORDER BY `MemPosition`",
        )
        .bind(char_id)
        .fetch_all(pool)
        .await?;
        cs.memo = memos.into_iter().map(|(map, x, y)| MapPoint { map, x, y }).collect();

        let hotkeys: Vec<(u32, u8, u32, u16)> = sqlx::query_as(
            "SELECT `HotIndex`,`HotType`,`HotItemSkillId`,`HotLevel` FROM `Hotkey` WHERE `HotChaId` = ?",
        )
        .bind(char_id)
        .fetch_all(pool)
        .await?;
        cs.hotkeys = vec![Hotkey::default(); MAX_HOTKEYS];
        for (idx, kind, id, lv) in hotkeys {
            if let Some(slot) = cs.hotkeys.get_mut(idx as usize) {
                *slot = Hotkey { kind, id, lv };
            }
        }

        Ok(Some(cs))
    }

    async fn find_character(&self, name: &str) -> Result<Option<CharRef>, StoreError> {
        let row: Option<(u32, u32, String)> = sqlx::query_as(
            "SELECT `ChaId`,`ChaActId`,`ChaName` FROM `Character` WHERE `ChaName` = ? LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(char_id, account_id, name)| CharRef { char_id, account_id, name }))
    }

    async fn load_auctions(&self) -> Result<Vec<AuctionRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM `Auction` ORDER BY `AucId`")
            .fetch_all(&self.pool)
            .await?;
        let auctions = rows.iter().map(row_to_auction).collect::<Result<Vec<_>, _>>()?;
        Ok(auctions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_tables_have_distinct_owners() {
        assert_eq!(ItemTable::Inventory.owner_column(), "InvChaId");
        assert_eq!(ItemTable::Storage.owner_column(), "StoActId");
        assert!(item_columns("Crt").starts_with("`CrtItmId`"));
    }

    #[test]
    fn test_statement_labels() {
        assert_eq!(Statement::SetAllOffline.label(), "set all offline");
        assert_eq!(
            Statement::DeleteItem { table: ItemTable::Cart, row_id: 1 }.label(),
            "delete item"
        );
    }
}
