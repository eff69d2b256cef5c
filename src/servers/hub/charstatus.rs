//! Character snapshot types.
//!
//! A `CharStatus` is what world servers send on save and what the hub keeps
//! as the diff baseline. On the wire it travels as zlib-compressed JSON.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use super::packet::DecodeError;

pub const NAME_LENGTH: usize = 24;
pub const MAP_NAME_LENGTH: usize = 16;
pub const MAX_INVENTORY: usize = 100;
pub const MAX_CART: usize = 100;
pub const MAX_STORAGE: usize = 600;
pub const MAX_FRIENDS: usize = 40;
pub const MAX_MEMOPOINTS: usize = 3;
pub const MAX_HOTKEYS: usize = 38;
pub const MAX_SKILLS: usize = 1200;

/// Upper bound on a decompressed character blob.
const MAX_BLOB: u64 = 4 * 1024 * 1024;

/// Fields that identify an item row across saves: type plus the enchant
/// slots that carry a forger/owner signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemKey {
    pub nameid: u32,
    pub unique_id: u64,
    pub card0: u32,
    pub card2: u32,
    pub card3: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Backend row id. Zero until the row has been read back from storage.
    #[serde(default)]
    pub id: u64,
    pub nameid: u32,
    pub amount: u32,
    #[serde(default)]
    pub equip: u32,
    #[serde(default)]
    pub identify: u8,
    #[serde(default)]
    pub refine: u8,
    #[serde(default)]
    pub attribute: u8,
    #[serde(default)]
    pub cards: [u32; 4],
    #[serde(default)]
    pub expire_time: u32,
    #[serde(default)]
    pub bound: u8,
    #[serde(default)]
    pub unique_id: u64,
    #[serde(default)]
    pub favorite: u8,
}

impl Item {
    pub fn is_empty(&self) -> bool {
        self.nameid == 0
    }

    pub fn key(&self) -> ItemKey {
        ItemKey {
            nameid: self.nameid,
            unique_id: self.unique_id,
            card0: self.cards[0],
            card2: self.cards[2],
            card3: self.cards[3],
        }
    }

    /// True when every field a save may change is equal. Row id and the
    /// identity key are not compared.
    pub fn same_state(&self, other: &Item) -> bool {
        self.amount == other.amount
            && self.equip == other.equip
            && self.identify == other.identify
            && self.refine == other.refine
            && self.attribute == other.attribute
            && self.expire_time == other.expire_time
            && self.bound == other.bound
            && self.cards == other.cards
            && self.favorite == other.favorite
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skill {
    pub id: u16,
    pub lv: u8,
    #[serde(default)]
    pub flag: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Friend {
    pub account_id: u32,
    pub char_id: u32,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapPoint {
    pub map: String,
    pub x: u16,
    pub y: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hotkey {
    /// 0 = item, 1 = skill
    pub kind: u8,
    pub id: u32,
    pub lv: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MercenaryOwner {
    pub mer_id: u32,
    pub arch_calls: u32,
    pub arch_faith: u32,
    pub spear_calls: u32,
    pub spear_faith: u32,
    pub sword_calls: u32,
    pub sword_faith: u32,
}

/// Column value handed to the backend for scalar updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Int(i64),
    Text(String),
}

impl From<u8> for SqlValue {
    fn from(v: u8) -> Self {
        SqlValue::Int(v as i64)
    }
}

impl From<u16> for SqlValue {
    fn from(v: u16) -> Self {
        SqlValue::Int(v as i64)
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        SqlValue::Int(v as i64)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Int(v as i64)
    }
}

impl From<u64> for SqlValue {
    fn from(v: u64) -> Self {
        SqlValue::Int(v.min(i64::MAX as u64) as i64)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CharStatus {
    pub char_id: u32,
    pub account_id: u32,
    pub slot: u8,
    pub name: String,

    pub class: u16,
    pub base_level: u32,
    pub job_level: u32,
    pub base_exp: u64,
    pub job_exp: u64,
    pub zeny: u32,
    pub str: u16,
    pub agi: u16,
    pub vit: u16,
    pub int: u16,
    pub dex: u16,
    pub luk: u16,
    pub status_point: u32,
    pub skill_point: u32,
    pub hp: u32,
    pub max_hp: u32,
    pub sp: u32,
    pub max_sp: u32,
    pub option: u32,
    pub karma: i32,
    pub manner: i32,
    pub party_id: u32,
    pub guild_id: u32,
    pub pet_id: u32,
    pub hom_id: u32,
    pub ele_id: u32,
    pub hair: u16,
    pub hair_color: u16,
    pub clothes_color: u16,
    pub body: u16,
    pub weapon: u16,
    pub shield: u16,
    pub head_top: u16,
    pub head_mid: u16,
    pub head_bottom: u16,
    pub robe: u16,
    pub last_point: MapPoint,
    pub save_point: MapPoint,
    pub partner_id: u32,
    pub father: u32,
    pub mother: u32,
    pub child: u32,
    pub fame: u32,
    pub rename: u16,
    pub show_equip: u8,
    pub font: u8,
    pub title_id: u32,

    pub bank_vault: i64,
    pub mercenary: MercenaryOwner,

    pub inventory: Vec<Item>,
    pub cart: Vec<Item>,
    pub storage: Vec<Item>,
    pub skills: Vec<Skill>,
    pub friends: Vec<Friend>,
    pub memo: Vec<MapPoint>,
    pub hotkeys: Vec<Hotkey>,
}

impl CharStatus {
    /// Blank baseline for a character the hub has never seen.
    pub fn new(char_id: u32) -> Self {
        Self {
            char_id,
            ..Default::default()
        }
    }

    /// Tracked columns of the `Character` row, in a stable order.
    pub fn character_columns(&self) -> Vec<(&'static str, SqlValue)> {
        vec![
            ("ChaName", self.name.as_str().into()),
            ("ChaClass", self.class.into()),
            ("ChaBaseLevel", self.base_level.into()),
            ("ChaJobLevel", self.job_level.into()),
            ("ChaBaseExp", self.base_exp.into()),
            ("ChaJobExp", self.job_exp.into()),
            ("ChaZeny", self.zeny.into()),
            ("ChaStr", self.str.into()),
            ("ChaAgi", self.agi.into()),
            ("ChaVit", self.vit.into()),
            ("ChaInt", self.int.into()),
            ("ChaDex", self.dex.into()),
            ("ChaLuk", self.luk.into()),
            ("ChaStatusPoint", self.status_point.into()),
            ("ChaSkillPoint", self.skill_point.into()),
            ("ChaHp", self.hp.into()),
            ("ChaMaxHp", self.max_hp.into()),
            ("ChaSp", self.sp.into()),
            ("ChaMaxSp", self.max_sp.into()),
            ("ChaOption", self.option.into()),
            ("ChaKarma", self.karma.into()),
            ("ChaManner", self.manner.into()),
            ("ChaPartyId", self.party_id.into()),
            ("ChaGuildId", self.guild_id.into()),
            ("ChaPetId", self.pet_id.into()),
            ("ChaHomId", self.hom_id.into()),
            ("ChaEleId", self.ele_id.into()),
            ("ChaHair", self.hair.into()),
            ("ChaHairColor", self.hair_color.into()),
            ("ChaClothesColor", self.clothes_color.into()),
            ("ChaBody", self.body.into()),
            ("ChaWeapon", self.weapon.into()),
            ("ChaShield", self.shield.into()),
            ("ChaHeadTop", self.head_top.into()),
            ("ChaHeadMid", self.head_mid.into()),
            ("ChaHeadBottom", self.head_bottom.into()),
            ("ChaRobe", self.robe.into()),
            ("ChaLastMap", self.last_point.map.as_str().into()),
            ("ChaLastX", self.last_point.x.into()),
            ("ChaLastY", self.last_point.y.into()),
            ("ChaSaveMap", self.save_point.map.as_str().into()),
            ("ChaSaveX", self.save_point.x.into()),
            ("ChaSaveY", self.save_point.y.into()),
            ("ChaPartnerId", self.partner_id.into()),
            ("ChaFather", self.father.into()),
            ("ChaMother", self.mother.into()),
            ("ChaChild", self.child.into()),
            ("ChaFame", self.fame.into()),
            ("ChaRename", self.rename.into()),
            ("ChaShowEquip", self.show_equip.into()),
            ("ChaFont", self.font.into()),
            ("ChaTitleId", self.title_id.into()),
        ]
    }

    /// Serialize for the wire: JSON, zlib-compressed.
    pub fn to_blob(&self) -> Result<Vec<u8>, DecodeError> {
        let json = serde_json::to_vec(self).map_err(|e| DecodeError::Payload(e.to_string()))?;
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&json)?;
        Ok(enc.finish()?)
    }

    pub fn from_blob(blob: &[u8]) -> Result<Self, DecodeError> {
        let mut json = Vec::new();
        ZlibDecoder::new(blob).take(MAX_BLOB).read_to_end(&mut json)?;
        let status: CharStatus =
            serde_json::from_slice(&json).map_err(|e| DecodeError::Payload(e.to_string()))?;
        status.check_limits()?;
        Ok(status)
    }

    fn check_limits(&self) -> Result<(), DecodeError> {
        let over = |what: &str, len: usize, max: usize| {
            if len > max {
                Err(DecodeError::Payload(format!("{} has {} entries (max {})", what, len, max)))
            } else {
                Ok(())
            }
        };
        over("inventory", self.inventory.len(), MAX_INVENTORY)?;
        over("cart", self.cart.len(), MAX_CART)?;
        over("storage", self.storage.len(), MAX_STORAGE)?;
        over("skills", self.skills.len(), MAX_SKILLS)?;
        over("friends", self.friends.len(), MAX_FRIENDS)?;
        over("memo", self.memo.len(), MAX_MEMOPOINTS)?;
        over("hotkeys", self.hotkeys.len(), MAX_HOTKEYS)?;
        if self.name.len() > NAME_LENGTH {
            return Err(DecodeError::Payload(format!("name too long: {}", self.name.len())));
        }
        Ok(())
    }
}
