//! Inter-server frames.
//!
//! Every frame starts with a 2-byte LE opcode. A per-link length table says
//! whether the frame is fixed size or variable; variable frames carry their
//! total length as a 4-byte LE integer at offset 2.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::auction::{AuctionItem, AuctionQuery, AuctionRecord, NewListing};
use super::charstatus::{CharStatus, NAME_LENGTH};

/// Largest frame any link accepts.
pub const MAX_FRAME: usize = 4 * 1024 * 1024;
pub const ITEM_NAME_LENGTH: usize = 50;
pub const MAIL_TITLE_LENGTH: usize = 40;
const AUTH_FIELD: usize = 32;

// world -> hub
pub const WORLD_AUTH: u16 = 0x3000;
pub const WORLD_SET_USERS: u16 = 0x3001;
pub const WORLD_CHAR_ONLINE: u16 = 0x3002;
pub const WORLD_CHAR_OFFLINE: u16 = 0x3003;
pub const WORLD_REQUEST_CHAR: u16 = 0x3004;
pub const WORLD_SAVE_CHAR: u16 = 0x3005;
pub const WORLD_OFFLINE_ALL: u16 = 0x3006;
pub const WORLD_USER_COUNT: u16 = 0x3007;
pub const WORLD_WHISPER: u16 = 0x3010;
pub const WORLD_WHISPER_REPLY: u16 = 0x3011;
pub const WORLD_BROADCAST: u16 = 0x3012;
pub const WORLD_WIS_TO_GM: u16 = 0x3013;
pub const WORLD_AUCTION_LIST: u16 = 0x3020;
pub const WORLD_AUCTION_REGISTER: u16 = 0x3021;
pub const WORLD_AUCTION_CANCEL: u16 = 0x3022;
pub const WORLD_AUCTION_CLOSE: u16 = 0x3023;
pub const WORLD_AUCTION_BID: u16 = 0x3024;
pub const WORLD_PING: u16 = 0x3040;

// hub -> world
pub const HUB_AUTH_RESULT: u16 = 0x3800;
pub const HUB_KICK: u16 = 0x3801;
pub const HUB_CHAR_DATA: u16 = 0x3802;
pub const HUB_SAVE_ACK: u16 = 0x3803;
pub const HUB_WHISPER: u16 = 0x3810;
pub const HUB_WHISPER_RESULT: u16 = 0x3811;
pub const HUB_BROADCAST: u16 = 0x3812;
pub const HUB_WIS_TO_GM: u16 = 0x3813;
pub const HUB_AUCTION_LIST: u16 = 0x3820;
pub const HUB_AUCTION_REGISTER: u16 = 0x3821;
pub const HUB_AUCTION_CANCEL: u16 = 0x3822;
pub const HUB_AUCTION_CLOSE: u16 = 0x3823;
pub const HUB_AUCTION_MESSAGE: u16 = 0x3824;
pub const HUB_AUCTION_BID: u16 = 0x3825;
pub const HUB_MAIL_NOTIFY: u16 = 0x3826;
pub const HUB_PONG: u16 = 0x3840;

// hub -> login
pub const LOGIN_AUTH: u16 = 0x2700;
pub const LOGIN_ACCOUNT_ONLINE: u16 = 0x2701;
pub const LOGIN_ACCOUNT_OFFLINE: u16 = 0x2702;
pub const LOGIN_ALL_OFFLINE: u16 = 0x2703;
pub const LOGIN_PING: u16 = 0x2704;

// login -> hub
pub const LOGIN_AUTH_RESULT: u16 = 0x2710;
pub const LOGIN_KICK: u16 = 0x2711;
pub const LOGIN_PONG: u16 = 0x2712;

/// Frame length table: index = cmd - base.
/// -1 means variable length (4-byte LE total at offset 2), 0 means not a
/// command on this link.
pub struct PacketTable {
    base: u16,
    lens: &'static [i32],
}

/// Frames a world server may send.
pub static WORLD_PACKETS: PacketTable = PacketTable {
    base: 0x3000,
    lens: &[
        72,  // 0x3000 auth
        -1,  // 0x3001 set users
        10,  // 0x3002 char online
        11,  // 0x3003 char offline
        10,  // 0x3004 request char
        -1,  // 0x3005 save char
        2,   // 0x3006 offline all
        6,   // 0x3007 user count
        0, 0, 0, 0, 0, 0, 0, 0, // 0x3008-0x300F
        -1,  // 0x3010 whisper
        7,   // 0x3011 whisper reply
        -1,  // 0x3012 broadcast
        -1,  // 0x3013 wis to gm
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // 0x3014-0x301F
        38,  // 0x3020 auction list
        122, // 0x3021 auction register
        10,  // 0x3022 auction cancel
        10,  // 0x3023 auction close
        38,  // 0x3024 auction bid
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // 0x3025-0x302F
        -1,  // 0x3030 guild request (guild service)
        14,  // 0x3031 guild member info (guild service)
        -1,  // 0x3032 party request (party service)
        14,  // 0x3033 party member info (party service)
        -1,  // 0x3034 pet save (pet service)
        10,  // 0x3035 pet load (pet service)
        -1,  // 0x3036 quest save (quest service)
        10,  // 0x3037 quest load (quest service)
        0, 0, 0, 0, 0, 0, 0, 0, // 0x3038-0x303F
        2,   // 0x3040 ping
    ],
};

/// Frames the hub sends to world servers.
pub static HUB_PACKETS: PacketTable = PacketTable {
    base: 0x3800,
    lens: &[
        8,  // 0x3800 auth result
        11, // 0x3801 kick
        -1, // 0x3802 char data
        11, // 0x3803 save ack
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // 0x3804-0x380F
        -1, // 0x3810 whisper
        27, // 0x3811 whisper result
        -1, // 0x3812 broadcast
        -1, // 0x3813 wis to gm
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // 0x3814-0x381F
        -1, // 0x3820 auction list
        11, // 0x3821 auction register
        7,  // 0x3822 auction cancel
        7,  // 0x3823 auction close
        11, // 0x3824 auction message
        11, // 0x3825 auction bid
        74, // 0x3826 mail notify
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // 0x3827-0x383F
        2,  // 0x3840 pong
    ],
};

/// Frames the authentication tier may send.
pub static LOGIN_PACKETS: PacketTable = PacketTable {
    base: 0x2710,
    lens: &[
        3, // 0x2710 auth result
        6, // 0x2711 kick account
        2, // 0x2712 pong
    ],
};

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("opcode {0:#06x} is not in the length table")]
    UnknownOpcode(u16),
    #[error("opcode {cmd:#06x} declares impossible length {len}")]
    BadLength { cmd: u16, len: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame {cmd:#06x} truncated")]
    Short { cmd: u16 },
    #[error("payload: {0}")]
    Payload(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PacketTable {
    /// Declared length for `cmd`: `Some(-1)` variable, `Some(n)` fixed.
    pub fn declared(&self, cmd: u16) -> Option<i32> {
        let idx = cmd.checked_sub(self.base)? as usize;
        match self.lens.get(idx) {
            Some(0) | None => None,
            Some(&len) => Some(len),
        }
    }

    /// Length of the frame at the head of `buf`, `None` when more bytes are
    /// needed to know or to hold it.
    pub fn frame_len(&self, buf: &[u8]) -> Result<Option<usize>, FrameError> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let cmd = u16::from_le_bytes([buf[0], buf[1]]);
        let len = match self.declared(cmd) {
            None => return Err(FrameError::UnknownOpcode(cmd)),
            Some(-1) => {
                if buf.len() < 6 {
                    return Ok(None);
                }
                let len = u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;
                if !(6..=MAX_FRAME).contains(&len) {
                    return Err(FrameError::BadLength { cmd, len });
                }
                len
            }
            Some(n) => n as usize,
        };
        if buf.len() < len {
            return Ok(None);
        }
        Ok(Some(len))
    }
}

/// Splits a byte stream into whole frames.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    table: &'static PacketTable,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, table: &'static PacketTable) -> Self {
        Self { inner, buf: BytesMut::with_capacity(8192), table }
    }

    /// Next complete frame, or `None` on a clean EOF.
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        loop {
            if let Some(len) = self.table.frame_len(&self.buf)? {
                return Ok(Some(self.buf.split_to(len).freeze()));
            }
            if self.inner.read_buf(&mut self.buf).await? == 0 {
                return Ok(None);
            }
        }
    }
}

// ── field helpers ──────────────────────────────────────────────────────────

fn need(buf: &Bytes, n: usize, cmd: u16) -> Result<(), DecodeError> {
    if buf.remaining() < n {
        return Err(DecodeError::Short { cmd });
    }
    Ok(())
}

/// Read a NUL-padded fixed-width string.
fn get_str(buf: &mut Bytes, width: usize) -> String {
    let raw = buf.split_to(width);
    let end = raw.iter().position(|&b| b == 0).unwrap_or(width);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Write `s` into a NUL-padded field of `width` bytes, always leaving room
/// for the terminator.
fn put_str(out: &mut Vec<u8>, s: &str, width: usize) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(width - 1);
    out.put_slice(&bytes[..n]);
    out.put_bytes(0, width - n);
}

fn rest_str(buf: &mut Bytes) -> String {
    let raw = buf.split_to(buf.remaining());
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Skip opcode and, for variable frames, the length field.
fn body(frame: &Bytes, variable: bool) -> Bytes {
    frame.slice(if variable { 6 } else { 2 }..)
}

fn begin(cmd: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.put_u16_le(cmd);
    out
}

fn begin_var(cmd: u16) -> Vec<u8> {
    let mut out = begin(cmd);
    out.put_u32_le(0);
    out
}

fn finish_var(mut out: Vec<u8>) -> Vec<u8> {
    let len = out.len() as u32;
    out[2..6].copy_from_slice(&len.to_le_bytes());
    out
}

fn get_item(b: &mut Bytes) -> AuctionItem {
    let nameid = b.get_u32_le();
    let item_type = b.get_u8();
    let refine = b.get_u8();
    let attribute = b.get_u8();
    let identify = b.get_u8();
    let mut cards = [0u32; 4];
    for c in cards.iter_mut() {
        *c = b.get_u32_le();
    }
    let unique_id = b.get_u64_le();
    let name = get_str(b, ITEM_NAME_LENGTH);
    AuctionItem { nameid, item_type, refine, attribute, identify, cards, unique_id, name }
}

fn put_item(out: &mut Vec<u8>, item: &AuctionItem) {
    out.put_u32_le(item.nameid);
    out.put_u8(item.item_type);
    out.put_u8(item.refine);
    out.put_u8(item.attribute);
    out.put_u8(item.identify);
    for c in item.cards {
        out.put_u32_le(c);
    }
    out.put_u64_le(item.unique_id);
    put_str(out, &item.name, ITEM_NAME_LENGTH);
}

// ── world -> hub ───────────────────────────────────────────────────────────

/// How a world server reports a character leaving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineKind {
    Logout,
    CharSelect,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorldRequest {
    Auth { id: String, pw: String, ip: u32, port: u16 },
    SetUsers { users: Vec<(u32, u32)> },
    CharOnline { account_id: u32, char_id: u32 },
    CharOffline { account_id: u32, char_id: u32, kind: OfflineKind },
    RequestChar { account_id: u32, char_id: u32 },
    SaveChar { account_id: u32, char_id: u32, final_save: bool, status: Box<CharStatus> },
    OfflineAll,
    UserCount { count: u32 },
    Whisper { sender: String, recipient: String, message: String },
    WhisperReply { id: u32, flag: u8 },
    Broadcast { sender: String, message: String },
    WisToGm { sender: String, min_level: u16, message: String },
    AuctionList(AuctionQuery),
    AuctionRegister(NewListing),
    AuctionCancel { char_id: u32, auction_id: u32 },
    AuctionClose { char_id: u32, auction_id: u32 },
    AuctionBid { char_id: u32, name: String, auction_id: u32, bid: u32 },
    Ping,
}

impl WorldRequest {
    /// Decode one complete frame. `Ok(None)` means the opcode has a known
    /// length but belongs to a service this hub does not run.
    pub fn decode(frame: &Bytes) -> Result<Option<Self>, DecodeError> {
        let cmd = u16::from_le_bytes([frame[0], frame[1]]);
        let variable = WORLD_PACKETS.declared(cmd) == Some(-1);
        let mut b = body(frame, variable);
        let req = match cmd {
            WORLD_AUTH => {
                let id = get_str(&mut b, AUTH_FIELD);
                let pw = get_str(&mut b, AUTH_FIELD);
                WorldRequest::Auth { id, pw, ip: b.get_u32_le(), port: b.get_u16_le() }
            }
            WORLD_SET_USERS => {
                need(&b, 4, cmd)?;
                let count = b.get_u32_le() as usize;
                need(&b, count.saturating_mul(8), cmd)?;
                let users = (0..count).map(|_| (b.get_u32_le(), b.get_u32_le())).collect();
                WorldRequest::SetUsers { users }
            }
            WORLD_CHAR_ONLINE => WorldRequest::CharOnline {
                account_id: b.get_u32_le(),
                char_id: b.get_u32_le(),
            },
            WORLD_CHAR_OFFLINE => {
                let account_id = b.get_u32_le();
                let char_id = b.get_u32_le();
                let kind =
                    if b.get_u8() == 1 { OfflineKind::CharSelect } else { OfflineKind::Logout };
                WorldRequest::CharOffline { account_id, char_id, kind }
            }
            WORLD_REQUEST_CHAR => WorldRequest::RequestChar {
                account_id: b.get_u32_le(),
                char_id: b.get_u32_le(),
            },
            WORLD_SAVE_CHAR => {
                need(&b, 9, cmd)?;
                let account_id = b.get_u32_le();
                let char_id = b.get_u32_le();
                let final_save = b.get_u8() != 0;
                let status = CharStatus::from_blob(&b)?;
                if status.char_id != char_id || status.account_id != account_id {
                    return Err(DecodeError::Payload(format!(
                        "save header {}/{} does not match blob {}/{}",
                        account_id, char_id, status.account_id, status.char_id
                    )));
                }
                WorldRequest::SaveChar { account_id, char_id, final_save, status: Box::new(status) }
            }
            WORLD_OFFLINE_ALL => WorldRequest::OfflineAll,
            WORLD_USER_COUNT => WorldRequest::UserCount { count: b.get_u32_le() },
            WORLD_WHISPER => {
                need(&b, NAME_LENGTH * 2, cmd)?;
                let sender = get_str(&mut b, NAME_LENGTH);
                let recipient = get_str(&mut b, NAME_LENGTH);
                WorldRequest::Whisper { sender, recipient, message: rest_str(&mut b) }
            }
            WORLD_WHISPER_REPLY => {
                WorldRequest::WhisperReply { id: b.get_u32_le(), flag: b.get_u8() }
            }
            WORLD_BROADCAST => {
                need(&b, NAME_LENGTH, cmd)?;
                let sender = get_str(&mut b, NAME_LENGTH);
                WorldRequest::Broadcast { sender, message: rest_str(&mut b) }
            }
            WORLD_WIS_TO_GM => {
                need(&b, NAME_LENGTH + 2, cmd)?;
                let sender = get_str(&mut b, NAME_LENGTH);
                let min_level = b.get_u16_le();
                WorldRequest::WisToGm { sender, min_level, message: rest_str(&mut b) }
            }
            WORLD_AUCTION_LIST => {
                let char_id = b.get_u32_le();
                let kind = b.get_u16_le();
                let price = b.get_u32_le();
                let page = b.get_u16_le();
                let search = get_str(&mut b, NAME_LENGTH);
                WorldRequest::AuctionList(AuctionQuery { char_id, kind, price, page, search })
            }
            WORLD_AUCTION_REGISTER => {
                let seller_id = b.get_u32_le();
                let seller_name = get_str(&mut b, NAME_LENGTH);
                let reserve = b.get_u32_le();
                let buynow = b.get_u32_le();
                let hours = b.get_u16_le();
                let item = get_item(&mut b);
                WorldRequest::AuctionRegister(NewListing {
                    seller_id,
                    seller_name,
                    reserve,
                    buynow,
                    hours,
                    item,
                })
            }
            WORLD_AUCTION_CANCEL => WorldRequest::AuctionCancel {
                char_id: b.get_u32_le(),
                auction_id: b.get_u32_le(),
            },
            WORLD_AUCTION_CLOSE => WorldRequest::AuctionClose {
                char_id: b.get_u32_le(),
                auction_id: b.get_u32_le(),
            },
            WORLD_AUCTION_BID => {
                let char_id = b.get_u32_le();
                let auction_id = b.get_u32_le();
                let bid = b.get_u32_le();
                let name = get_str(&mut b, NAME_LENGTH);
                WorldRequest::AuctionBid { char_id, name, auction_id, bid }
            }
            WORLD_PING => WorldRequest::Ping,
            _ => return Ok(None),
        };
        Ok(Some(req))
    }

    /// Encode as a world server would. Used by tests and tooling.
    pub fn encode(&self) -> Result<Vec<u8>, DecodeError> {
        let out = match self {
            WorldRequest::Auth { id, pw, ip, port } => {
                let mut out = begin(WORLD_AUTH);
                put_str(&mut out, id, AUTH_FIELD);
                put_str(&mut out, pw, AUTH_FIELD);
                out.put_u32_le(*ip);
                out.put_u16_le(*port);
                out
            }
            WorldRequest::SetUsers { users } => {
                let mut out = begin_var(WORLD_SET_USERS);
                out.put_u32_le(users.len() as u32);
                for (aid, cid) in users {
                    out.put_u32_le(*aid);
                    out.put_u32_le(*cid);
                }
                finish_var(out)
            }
            WorldRequest::CharOnline { account_id, char_id } => {
                let mut out = begin(WORLD_CHAR_ONLINE);
                out.put_u32_le(*account_id);
                out.put_u32_le(*char_id);
                out
            }
            WorldRequest::CharOffline { account_id, char_id, kind } => {
                let mut out = begin(WORLD_CHAR_OFFLINE);
                out.put_u32_le(*account_id);
                out.put_u32_le(*char_id);
                out.put_u8(u8::from(*kind == OfflineKind::CharSelect));
                out
            }
            WorldRequest::RequestChar { account_id, char_id } => {
                let mut out = begin(WORLD_REQUEST_CHAR);
                out.put_u32_le(*account_id);
                out.put_u32_le(*char_id);
                out
            }
            WorldRequest::SaveChar { account_id, char_id, final_save, status } => {
                let mut out = begin_var(WORLD_SAVE_CHAR);
                out.put_u32_le(*account_id);
                out.put_u32_le(*char_id);
                out.put_u8(u8::from(*final_save));
                out.put_slice(&status.to_blob()?);
                finish_var(out)
            }
            WorldRequest::OfflineAll => begin(WORLD_OFFLINE_ALL),
            WorldRequest::UserCount { count } => {
                let mut out = begin(WORLD_USER_COUNT);
                out.put_u32_le(*count);
                out
            }
            WorldRequest::Whisper { sender, recipient, message } => {
                let mut out = begin_var(WORLD_WHISPER);
                put_str(&mut out, sender, NAME_LENGTH);
                put_str(&mut out, recipient, NAME_LENGTH);
                out.put_slice(message.as_bytes());
                finish_var(out)
            }
            WorldRequest::WhisperReply { id, flag } => {
                let mut out = begin(WORLD_WHISPER_REPLY);
                out.put_u32_le(*id);
                out.put_u8(*flag);
                out
            }
            WorldRequest::Broadcast { sender, message } => {
                let mut out = begin_var(WORLD_BROADCAST);
                put_str(&mut out, sender, NAME_LENGTH);
                out.put_slice(message.as_bytes());
                finish_var(out)
            }
            WorldRequest::WisToGm { sender, min_level, message } => {
                let mut out = begin_var(WORLD_WIS_TO_GM);
                put_str(&mut out, sender, NAME_LENGTH);
                out.put_u16_le(*min_level);
                out.put_slice(message.as_bytes());
                finish_var(out)
            }
            WorldRequest::AuctionList(q) => {
                let mut out = begin(WORLD_AUCTION_LIST);
                out.put_u32_le(q.char_id);
                out.put_u16_le(q.kind);
                out.put_u32_le(q.price);
                out.put_u16_le(q.page);
                put_str(&mut out, &q.search, NAME_LENGTH);
                out
            }
            WorldRequest::AuctionRegister(l) => {
                let mut out = begin(WORLD_AUCTION_REGISTER);
                out.put_u32_le(l.seller_id);
                put_str(&mut out, &l.seller_name, NAME_LENGTH);
                out.put_u32_le(l.reserve);
                out.put_u32_le(l.buynow);
                out.put_u16_le(l.hours);
                put_item(&mut out, &l.item);
                out
            }
            WorldRequest::AuctionCancel { char_id, auction_id } => {
                let mut out = begin(WORLD_AUCTION_CANCEL);
                out.put_u32_le(*char_id);
                out.put_u32_le(*auction_id);
                out
            }
            WorldRequest::AuctionClose { char_id, auction_id } => {
                let mut out = begin(WORLD_AUCTION_CLOSE);
                out.put_u32_le(*char_id);
                out.put_u32_le(*auction_id);
                out
            }
            WorldRequest::AuctionBid { char_id, name, auction_id, bid } => {
                let mut out = begin(WORLD_AUCTION_BID);
                out.put_u32_le(*char_id);
                out.put_u32_le(*auction_id);
                out.put_u32_le(*bid);
                put_str(&mut out, name, NAME_LENGTH);
                out
            }
            WorldRequest::Ping => begin(WORLD_PING),
        };
        Ok(out)
    }
}

// ── hub -> world ───────────────────────────────────────────────────────────

/// Result byte of [`HUB_AUTH_RESULT`].
pub const AUTH_OK: u8 = 0;
pub const AUTH_REJECTED: u8 = 1;

pub fn auth_result(result: u8, slot: u8, save_time: u32) -> Vec<u8> {
    let mut out = begin(HUB_AUTH_RESULT);
    out.put_u8(result);
    out.put_u8(slot);
    out.put_u32_le(save_time);
    out
}

pub fn kick(account_id: u32, char_id: u32, reason: u8) -> Vec<u8> {
    let mut out = begin(HUB_KICK);
    out.put_u32_le(account_id);
    out.put_u32_le(char_id);
    out.put_u8(reason);
    out
}

/// Character data reply. `None` tells the world server the load failed.
pub fn char_data(
    account_id: u32,
    char_id: u32,
    status: Option<&CharStatus>,
) -> Result<Vec<u8>, DecodeError> {
    let mut out = begin_var(HUB_CHAR_DATA);
    out.put_u32_le(account_id);
    out.put_u32_le(char_id);
    match status {
        Some(cs) => {
            out.put_u8(0);
            out.put_slice(&cs.to_blob()?);
        }
        None => out.put_u8(1),
    }
    Ok(finish_var(out))
}

pub fn save_ack(account_id: u32, char_id: u32, ok: bool) -> Vec<u8> {
    let mut out = begin(HUB_SAVE_ACK);
    out.put_u32_le(account_id);
    out.put_u32_le(char_id);
    out.put_u8(u8::from(ok));
    out
}

pub fn whisper(id: u32, sender: &str, recipient: &str, message: &str) -> Vec<u8> {
    let mut out = begin_var(HUB_WHISPER);
    out.put_u32_le(id);
    put_str(&mut out, sender, NAME_LENGTH);
    put_str(&mut out, recipient, NAME_LENGTH);
    out.put_slice(message.as_bytes());
    finish_var(out)
}

pub fn whisper_result(sender: &str, flag: u8) -> Vec<u8> {
    let mut out = begin(HUB_WHISPER_RESULT);
    put_str(&mut out, sender, NAME_LENGTH);
    out.put_u8(flag);
    out
}

pub fn broadcast(sender: &str, message: &str) -> Vec<u8> {
    let mut out = begin_var(HUB_BROADCAST);
    put_str(&mut out, sender, NAME_LENGTH);
    out.put_slice(message.as_bytes());
    finish_var(out)
}

pub fn wis_to_gm(sender: &str, min_level: u16, message: &str) -> Vec<u8> {
    let mut out = begin_var(HUB_WIS_TO_GM);
    put_str(&mut out, sender, NAME_LENGTH);
    out.put_u16_le(min_level);
    out.put_slice(message.as_bytes());
    finish_var(out)
}

pub fn auction_list(char_id: u32, pages: u16, entries: &[AuctionRecord]) -> Vec<u8> {
    let mut out = begin_var(HUB_AUCTION_LIST);
    out.put_u32_le(char_id);
    out.put_u16_le(pages);
    out.put_u16_le(entries.len() as u16);
    for a in entries {
        out.put_u32_le(a.auction_id);
        out.put_u32_le(a.seller_id);
        put_str(&mut out, &a.seller_name, NAME_LENGTH);
        out.put_u32_le(a.buyer_id.unwrap_or(0));
        put_str(&mut out, &a.buyer_name, NAME_LENGTH);
        out.put_u32_le(a.price);
        out.put_u32_le(a.buynow);
        put_item(&mut out, &a.item);
        out.put_i64_le(a.expires_at);
    }
    finish_var(out)
}

pub fn auction_register(char_id: u32, result: u8, auction_id: u32) -> Vec<u8> {
    let mut out = begin(HUB_AUCTION_REGISTER);
    out.put_u32_le(char_id);
    out.put_u8(result);
    out.put_u32_le(auction_id);
    out
}

pub fn auction_cancel(char_id: u32, result: u8) -> Vec<u8> {
    let mut out = begin(HUB_AUCTION_CANCEL);
    out.put_u32_le(char_id);
    out.put_u8(result);
    out
}

pub fn auction_close(char_id: u32, result: u8) -> Vec<u8> {
    let mut out = begin(HUB_AUCTION_CLOSE);
    out.put_u32_le(char_id);
    out.put_u8(result);
    out
}

pub fn auction_message(char_id: u32, auction_id: u32, code: u8) -> Vec<u8> {
    let mut out = begin(HUB_AUCTION_MESSAGE);
    out.put_u32_le(char_id);
    out.put_u32_le(auction_id);
    out.put_u8(code);
    out
}

pub fn auction_bid(char_id: u32, returned: u32, result: u8) -> Vec<u8> {
    let mut out = begin(HUB_AUCTION_BID);
    out.put_u32_le(char_id);
    out.put_u32_le(returned);
    out.put_u8(result);
    out
}

pub fn mail_notify(char_id: u32, mail_id: u32, sender: &str, title: &str) -> Vec<u8> {
    let mut out = begin(HUB_MAIL_NOTIFY);
    out.put_u32_le(char_id);
    out.put_u32_le(mail_id);
    put_str(&mut out, sender, NAME_LENGTH);
    put_str(&mut out, title, MAIL_TITLE_LENGTH);
    out
}

pub fn pong() -> Vec<u8> {
    begin(HUB_PONG)
}

// ── hub <-> login ──────────────────────────────────────────────────────────

pub fn login_auth(id: &str, pw: &str) -> Vec<u8> {
    let mut out = begin(LOGIN_AUTH);
    put_str(&mut out, id, AUTH_FIELD);
    put_str(&mut out, pw, AUTH_FIELD);
    out
}

pub fn login_account_online(account_id: u32) -> Vec<u8> {
    let mut out = begin(LOGIN_ACCOUNT_ONLINE);
    out.put_u32_le(account_id);
    out
}

pub fn login_account_offline(account_id: u32) -> Vec<u8> {
    let mut out = begin(LOGIN_ACCOUNT_OFFLINE);
    out.put_u32_le(account_id);
    out
}

pub fn login_all_offline() -> Vec<u8> {
    begin(LOGIN_ALL_OFFLINE)
}

pub fn login_ping() -> Vec<u8> {
    begin(LOGIN_PING)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginMessage {
    AuthResult { ok: bool },
    Kick { account_id: u32 },
    Pong,
}

impl LoginMessage {
    pub fn decode(frame: &Bytes) -> Option<Self> {
        let cmd = u16::from_le_bytes([frame[0], frame[1]]);
        let mut b = body(frame, false);
        match cmd {
            LOGIN_AUTH_RESULT => Some(LoginMessage::AuthResult { ok: b.get_u8() == 0 }),
            LOGIN_KICK => Some(LoginMessage::Kick { account_id: b.get_u32_le() }),
            LOGIN_PONG => Some(LoginMessage::Pong),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_frames_match_their_table() {
        let frames = [
            auth_result(AUTH_OK, 0, 60),
            kick(1, 2, 1),
            save_ack(1, 2, true),
            whisper_result("Alice", 0),
            auction_register(1, 0, 5),
            auction_cancel(1, 0),
            auction_close(1, 0),
            auction_message(1, 5, 6),
            auction_bid(1, 0, 0),
            mail_notify(1, 2, "Auction Manager", "Auction"),
            pong(),
            whisper(1, "Alice", "Bob", "hi"),
            broadcast("GM", "hello"),
        ];
        for f in frames {
            assert_eq!(
                HUB_PACKETS.frame_len(&f).unwrap(),
                Some(f.len()),
                "{:02X}{:02X}",
                f[1],
                f[0]
            );
        }
    }

    #[test]
    fn test_fixed_frame_needs_all_bytes() {
        let frame = WorldRequest::CharOnline { account_id: 1, char_id: 2 }.encode().unwrap();
        assert_eq!(frame.len(), 10);
        assert_eq!(WORLD_PACKETS.frame_len(&frame[..1]).unwrap(), None);
        assert_eq!(WORLD_PACKETS.frame_len(&frame[..9]).unwrap(), None);
        assert_eq!(WORLD_PACKETS.frame_len(&frame).unwrap(), Some(10));
    }

    #[test]
    fn test_variable_frame_waits_for_length_field() {
        let frame = WorldRequest::Whisper {
            sender: "a".into(),
            recipient: "b".into(),
            message: "hello".into(),
        }
        .encode()
        .unwrap();
        assert_eq!(WORLD_PACKETS.frame_len(&frame[..4]).unwrap(), None);
        assert_eq!(WORLD_PACKETS.frame_len(&frame[..frame.len() - 1]).unwrap(), None);
        assert_eq!(WORLD_PACKETS.frame_len(&frame).unwrap(), Some(frame.len()));
    }

    #[test]
    fn test_frame_len_only_covers_head() {
        let mut two = WorldRequest::Ping.encode().unwrap();
        two.extend(WorldRequest::UserCount { count: 3 }.encode().unwrap());
        assert_eq!(WORLD_PACKETS.frame_len(&two).unwrap(), Some(2));
    }

    #[test]
    fn test_unlisted_opcode_is_unrecoverable() {
        let err = WORLD_PACKETS.frame_len(&[0x08, 0x30, 0, 0]).unwrap_err();
        assert!(matches!(err, FrameError::UnknownOpcode(0x3008)));
        let err = WORLD_PACKETS.frame_len(&[0xFF, 0x7F]).unwrap_err();
        assert!(matches!(err, FrameError::UnknownOpcode(0x7FFF)));
    }

    #[test]
    fn test_impossible_length_rejected() {
        let err = WORLD_PACKETS.frame_len(&[0x10, 0x30, 3, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, FrameError::BadLength { cmd: 0x3010, len: 3 }));
        let huge = (MAX_FRAME as u32 + 1).to_le_bytes();
        let err = WORLD_PACKETS
            .frame_len(&[0x10, 0x30, huge[0], huge[1], huge[2], huge[3]])
            .unwrap_err();
        assert!(matches!(err, FrameError::BadLength { .. }));
    }

    #[test]
    fn test_foreign_service_frame_decodes_to_none() {
        let mut frame = vec![0x31, 0x30];
        frame.extend_from_slice(&[0u8; 12]);
        assert_eq!(WORLD_PACKETS.frame_len(&frame).unwrap(), Some(14));
        assert_eq!(WorldRequest::decode(&Bytes::from(frame)).unwrap(), None);
    }

    #[test]
    fn test_auth_frame_matches_table() {
        let frame = WorldRequest::Auth { id: "hub".into(), pw: "pw".into(), ip: 1, port: 2 }
            .encode()
            .unwrap();
        assert_eq!(frame.len(), 72);
        match WorldRequest::decode(&Bytes::from(frame)).unwrap() {
            Some(WorldRequest::Auth { id, pw, ip, port }) => {
                assert_eq!((id.as_str(), pw.as_str(), ip, port), ("hub", "pw", 1, 2));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_register_frame_matches_table() {
        let frame = WorldRequest::AuctionRegister(NewListing {
            seller_id: 7,
            seller_name: "Seller".into(),
            reserve: 100,
            buynow: 500,
            hours: 1,
            item: AuctionItem { nameid: 1201, name: "Knife".into(), ..Default::default() },
        })
        .encode()
        .unwrap();
        assert_eq!(frame.len(), 122);
        assert_eq!(WORLD_PACKETS.frame_len(&frame).unwrap(), Some(122));
    }

    #[test]
    fn test_set_users_truncated_count() {
        let mut frame = begin_var(WORLD_SET_USERS);
        frame.put_u32_le(10);
        frame.put_u32_le(1);
        let frame = finish_var(frame);
        let err = WorldRequest::decode(&Bytes::from(frame)).unwrap_err();
        assert!(matches!(err, DecodeError::Short { cmd: WORLD_SET_USERS }));
    }

    #[test]
    fn test_save_char_header_must_match_blob() {
        let mut cs = CharStatus::new(42);
        cs.account_id = 2000001;
        let frame = WorldRequest::SaveChar {
            account_id: 2000001,
            char_id: 43,
            final_save: false,
            status: Box::new(cs),
        }
        .encode()
        .unwrap();
        assert!(WorldRequest::decode(&Bytes::from(frame)).is_err());
    }

    #[test]
    fn test_put_str_truncates_and_pads() {
        let mut out = Vec::new();
        put_str(&mut out, "abcdef", 4);
        assert_eq!(out, b"abc\0");
        let mut b = Bytes::from(out);
        assert_eq!(get_str(&mut b, 4), "abc");
    }

    #[tokio::test]
    async fn test_frame_reader_handles_split_writes() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(rx, &WORLD_PACKETS);
        let frame = WorldRequest::UserCount { count: 9 }.encode().unwrap();
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            tx.write_all(&frame[..3]).await.unwrap();
            tx.flush().await.unwrap();
            tokio::task::yield_now().await;
            tx.write_all(&frame[3..]).await.unwrap();
            tx.write_all(&pong_like()).await.unwrap();
        });
        let first = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(
            WorldRequest::decode(&first).unwrap(),
            Some(WorldRequest::UserCount { count: 9 })
        );
        let second = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(WorldRequest::decode(&second).unwrap(), Some(WorldRequest::Ping));
        writer.await.unwrap();
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    fn pong_like() -> Vec<u8> {
        WorldRequest::Ping.encode().unwrap()
    }

    #[test]
    fn test_login_kick_decode() {
        let mut frame = begin(LOGIN_KICK);
        frame.put_u32_le(2000001);
        assert_eq!(
            LoginMessage::decode(&Bytes::from(frame)),
            Some(LoginMessage::Kick { account_id: 2000001 })
        );
    }
}
