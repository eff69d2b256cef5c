//! Auction house.
//!
//! Listings live in memory and in the `Auction` table. Every state change is
//! written to storage first and applied in memory only once the write
//! succeeded. Money and items move as system mails returned to the caller
//! as [`AuctionNotice`]s.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use super::db::{CharStore, Statement, StoreError};
use super::relay::MailDraft;
use super::timer::{TimerId, Timers};
use super::HubEvent;

pub const PAGE_SIZE: usize = 5;
pub const MANAGER_NAME: &str = "Auction Manager";

// item types used by the browse filters
pub const IT_ETC: u8 = 3;
pub const IT_WEAPON: u8 = 4;
pub const IT_ARMOR: u8 = 5;
pub const IT_CARD: u8 = 6;
pub const IT_PETARMOR: u8 = 8;

/// Participant messages.
pub const MSG_WON: u8 = 6;
pub const MSG_OUTBID: u8 = 7;

pub const RESULT_OK: u8 = 0;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuctionItem {
    pub nameid: u32,
    pub item_type: u8,
    pub refine: u8,
    pub attribute: u8,
    pub identify: u8,
    pub cards: [u32; 4],
    pub unique_id: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewListing {
    pub seller_id: u32,
    pub seller_name: String,
    pub reserve: u32,
    pub buynow: u32,
    pub hours: u16,
    pub item: AuctionItem,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuctionRecord {
    pub auction_id: u32,
    pub seller_id: u32,
    pub seller_name: String,
    pub buyer_id: Option<u32>,
    pub buyer_name: String,
    /// Current price: the reserve until somebody bids.
    pub price: u32,
    pub reserve: u32,
    pub buynow: u32,
    pub hours: u16,
    pub created_at: i64,
    pub expires_at: i64,
    pub item: AuctionItem,
}

/// Browse request. `kind`: 0 armor, 1 weapon, 2 card, 3 misc, 4 name
/// search, 5 price ceiling, 6 own listings, 7 own bids, anything else all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuctionQuery {
    pub char_id: u32,
    pub kind: u16,
    pub price: u32,
    pub page: u16,
    pub search: String,
}

impl AuctionQuery {
    fn matches(&self, a: &AuctionRecord) -> bool {
        match self.kind {
            0 => a.item.item_type == IT_ARMOR || a.item.item_type == IT_PETARMOR,
            1 => a.item.item_type == IT_WEAPON,
            2 => a.item.item_type == IT_CARD,
            3 => a.item.item_type == IT_ETC,
            4 => a.item.name.contains(self.search.as_str()),
            5 => a.price <= self.price,
            6 => a.seller_id == self.char_id,
            7 => a.buyer_id == Some(self.char_id),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuctionError {
    #[error("auction not found")]
    AuctionNotFound,
    #[error("bid does not exceed the current price")]
    BidTooLow,
    #[error("seller cannot bid on own auction")]
    SelfBid,
    #[error("too many open bids")]
    TooManyBids,
    #[error("not the seller")]
    NotOwner,
    #[error("auction already has a bidder")]
    HasBidder,
    #[error("auction has no bidder")]
    NoBidder,
    #[error("too many listings")]
    TooManyListings,
    #[error("invalid listing")]
    InvalidListing,
    #[error("storage failure")]
    Storage,
}

impl AuctionError {
    /// Result byte sent back to the world server.
    pub fn code(self) -> u8 {
        match self {
            AuctionError::AuctionNotFound => 1,
            AuctionError::BidTooLow => 2,
            AuctionError::SelfBid => 3,
            AuctionError::TooManyBids => 4,
            AuctionError::NotOwner => 5,
            AuctionError::HasBidder => 6,
            AuctionError::NoBidder => 7,
            AuctionError::TooManyListings => 8,
            AuctionError::InvalidListing => 9,
            AuctionError::Storage => 10,
        }
    }
}

impl From<StoreError> for AuctionError {
    fn from(e: StoreError) -> Self {
        tracing::error!("[hub] [auction] storage: {}", e);
        AuctionError::Storage
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuctionNotice {
    Mail(MailDraft),
    Message { char_id: u32, auction_id: u32, code: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BidOutcome {
    /// New high bid; the listing stays open.
    Raised,
    /// Buy-now reached. `change` is what the bidder paid over the buy-now
    /// price and gets back.
    Sold { change: u32 },
}

#[derive(Debug, Clone, Copy)]
pub struct AuctionLimits {
    pub max_listings: usize,
    pub max_bids: usize,
    /// Shortest delay for a timer re-armed on start.
    pub grace: Duration,
}

impl Default for AuctionLimits {
    fn default() -> Self {
        Self { max_listings: 5, max_bids: 5, grace: Duration::from_secs(10) }
    }
}

struct Listing {
    rec: AuctionRecord,
    timer: Option<TimerId>,
}

pub struct AuctionHouse {
    store: Arc<dyn CharStore>,
    listings: BTreeMap<u32, Listing>,
    timers: Timers,
    events: UnboundedSender<HubEvent>,
    limits: AuctionLimits,
}

fn mail(
    dest_id: u32,
    dest_name: &str,
    body: &str,
    zeny: u32,
    item: Option<AuctionItem>,
    now: i64,
) -> AuctionNotice {
    AuctionNotice::Mail(MailDraft {
        sender_id: 0,
        sender_name: MANAGER_NAME.to_string(),
        dest_id,
        dest_name: dest_name.to_string(),
        title: "Auction".to_string(),
        body: body.to_string(),
        sent_at: now,
        zeny,
        item,
    })
}

impl AuctionHouse {
    pub fn new(
        store: Arc<dyn CharStore>,
        timers: Timers,
        events: UnboundedSender<HubEvent>,
        limits: AuctionLimits,
    ) -> Self {
        Self { store, listings: BTreeMap::new(), timers, events, limits }
    }

    pub fn len(&self) -> usize {
        self.listings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listings.is_empty()
    }

    pub fn get(&self, auction_id: u32) -> Option<&AuctionRecord> {
        self.listings.get(&auction_id).map(|l| &l.rec)
    }

    pub fn timer_of(&self, auction_id: u32) -> Option<TimerId> {
        self.listings.get(&auction_id).and_then(|l| l.timer)
    }

    /// Listings sold by `char_id`, or currently led by `char_id` when
    /// `buying` is set.
    pub fn count(&self, char_id: u32, buying: bool) -> usize {
        self.listings
            .values()
            .filter(|l| {
                if buying {
                    l.rec.buyer_id == Some(char_id)
                } else {
                    l.rec.seller_id == char_id
                }
            })
            .count()
    }

    fn arm(&self, auction_id: u32, delay: Duration) -> TimerId {
        let events = self.events.clone();
        self.timers.schedule(delay, move |timer| async move {
            let _ = events.send(HubEvent::AuctionExpired { auction_id, timer });
        })
    }

    fn disarm(&self, listing: &Listing) {
        if let Some(t) = listing.timer {
            self.timers.cancel(t);
        }
    }

    /// Reload every stored listing and re-arm its timer. Listings that
    /// expired while the hub was down settle after the grace delay.
    pub async fn recover(&mut self, now: i64) -> Result<usize, StoreError> {
        let rows = self.store.load_auctions().await?;
        for rec in rows {
            let left = Duration::from_secs(rec.expires_at.saturating_sub(now).max(0) as u64);
            let delay = left.max(self.limits.grace);
            if let Some(old) = self.listings.remove(&rec.auction_id) {
                self.disarm(&old);
            }
            let timer = self.arm(rec.auction_id, delay);
            self.listings.insert(rec.auction_id, Listing { rec, timer: Some(timer) });
        }
        tracing::info!("[hub] [auction] loaded {} auction(s)", self.listings.len());
        Ok(self.listings.len())
    }

    pub async fn create(&mut self, new: NewListing, now: i64) -> Result<u32, AuctionError> {
        if new.hours == 0 || new.item.nameid == 0 || new.buynow <= new.reserve {
            return Err(AuctionError::InvalidListing);
        }
        if self.count(new.seller_id, false) >= self.limits.max_listings {
            return Err(AuctionError::TooManyListings);
        }
        let duration = u64::from(new.hours) * 3600;
        let mut rec = AuctionRecord {
            auction_id: 0,
            seller_id: new.seller_id,
            seller_name: new.seller_name,
            buyer_id: None,
            buyer_name: String::new(),
            price: new.reserve,
            reserve: new.reserve,
            buynow: new.buynow,
            hours: new.hours,
            created_at: now,
            expires_at: now + duration as i64,
            item: new.item,
        };
        let done = self.store.execute(&Statement::InsertAuction(rec.clone())).await?;
        rec.auction_id = u32::try_from(done.last_insert_id).map_err(|_| {
            StoreError::Rejected(format!("auction id {} out of range", done.last_insert_id))
        })?;
        let timer = self.arm(rec.auction_id, Duration::from_secs(duration));
        tracing::info!(
            "[hub] [auction] created id={} seller={} item={} hours={}",
            rec.auction_id,
            rec.seller_id,
            rec.item.nameid,
            rec.hours
        );
        let id = rec.auction_id;
        self.listings.insert(id, Listing { rec, timer: Some(timer) });
        Ok(id)
    }

    pub async fn bid(
        &mut self,
        auction_id: u32,
        bidder_id: u32,
        bidder_name: &str,
        amount: u32,
        now: i64,
    ) -> Result<(BidOutcome, Vec<AuctionNotice>), AuctionError> {
        let listing = self.listings.get(&auction_id).ok_or(AuctionError::AuctionNotFound)?;
        let rec = &listing.rec;
        if rec.seller_id == bidder_id {
            return Err(AuctionError::SelfBid);
        }
        if amount <= rec.price {
            return Err(AuctionError::BidTooLow);
        }
        let raising_own = rec.buyer_id == Some(bidder_id);
        if !raising_own
            && amount < rec.buynow
            && self.count(bidder_id, true) >= self.limits.max_bids
        {
            return Err(AuctionError::TooManyBids);
        }

        let mut notices = Vec::new();
        let previous = rec.buyer_id.map(|id| (id, rec.buyer_name.clone(), rec.price));
        let sold = amount >= rec.buynow;

        if sold {
            self.store.execute(&Statement::DeleteAuction { auction_id }).await?;
        } else {
            let mut next = rec.clone();
            next.buyer_id = Some(bidder_id);
            next.buyer_name = bidder_name.to_string();
            next.price = amount;
            self.store.execute(&Statement::UpdateAuction(next.clone())).await?;
            if let Some(l) = self.listings.get_mut(&auction_id) {
                l.rec = next;
            }
        }

        if let Some((prev_id, prev_name, prev_price)) = previous {
            if prev_id != bidder_id {
                notices.push(mail(
                    prev_id,
                    &prev_name,
                    "Someone has placed a higher bid.",
                    prev_price,
                    None,
                    now,
                ));
                notices.push(AuctionNotice::Message {
                    char_id: prev_id,
                    auction_id,
                    code: MSG_OUTBID,
                });
            } else {
                notices.push(mail(
                    prev_id,
                    &prev_name,
                    "You have placed a higher bid.",
                    prev_price,
                    None,
                    now,
                ));
            }
        }

        if !sold {
            tracing::debug!("[hub] [auction] id={} bid {} by {}", auction_id, amount, bidder_id);
            return Ok((BidOutcome::Raised, notices));
        }

        let Some(listing) = self.listings.remove(&auction_id) else {
            return Err(AuctionError::AuctionNotFound);
        };
        self.disarm(&listing);
        let rec = listing.rec;
        notices.push(mail(
            bidder_id,
            bidder_name,
            "You have won the auction.",
            0,
            Some(rec.item.clone()),
            now,
        ));
        notices.push(AuctionNotice::Message { char_id: bidder_id, auction_id, code: MSG_WON });
        notices.push(mail(
            rec.seller_id,
            &rec.seller_name,
            "Payment for your auction!.",
            rec.buynow,
            None,
            now,
        ));
        tracing::info!(
            "[hub] [auction] id={} sold to {} for {}",
            auction_id,
            bidder_id,
            rec.buynow
        );
        Ok((BidOutcome::Sold { change: amount - rec.buynow }, notices))
    }

    pub async fn cancel(
        &mut self,
        auction_id: u32,
        seller_id: u32,
        now: i64,
    ) -> Result<Vec<AuctionNotice>, AuctionError> {
        let listing = self.listings.get(&auction_id).ok_or(AuctionError::AuctionNotFound)?;
        if listing.rec.seller_id != seller_id {
            return Err(AuctionError::NotOwner);
        }
        if listing.rec.buyer_id.is_some() {
            return Err(AuctionError::HasBidder);
        }
        self.store.execute(&Statement::DeleteAuction { auction_id }).await?;
        let Some(listing) = self.listings.remove(&auction_id) else {
            return Err(AuctionError::AuctionNotFound);
        };
        self.disarm(&listing);
        let rec = listing.rec;
        tracing::info!("[hub] [auction] id={} canceled by seller", auction_id);
        Ok(vec![mail(rec.seller_id, &rec.seller_name, "Auction canceled.", 0, Some(rec.item), now)])
    }

    /// Seller ends the auction early in favour of the current bidder.
    pub async fn close(
        &mut self,
        auction_id: u32,
        seller_id: u32,
        now: i64,
    ) -> Result<Vec<AuctionNotice>, AuctionError> {
        let listing = self.listings.get(&auction_id).ok_or(AuctionError::AuctionNotFound)?;
        if listing.rec.seller_id != seller_id {
            return Err(AuctionError::NotOwner);
        }
        if listing.rec.buyer_id.is_none() {
            return Err(AuctionError::NoBidder);
        }
        self.store.execute(&Statement::DeleteAuction { auction_id }).await?;
        let Some(listing) = self.listings.remove(&auction_id) else {
            return Err(AuctionError::AuctionNotFound);
        };
        self.disarm(&listing);
        tracing::info!("[hub] [auction] id={} closed by seller", auction_id);
        Ok(settle(listing.rec, now))
    }

    /// Expiry timer fired. Stale timers and vanished listings are ignored.
    pub async fn expire(
        &mut self,
        auction_id: u32,
        timer: TimerId,
        now: i64,
    ) -> Vec<AuctionNotice> {
        match self.listings.get(&auction_id) {
            Some(l) if l.timer == Some(timer) => {}
            _ => return Vec::new(),
        }
        if let Err(e) = self.store.execute(&Statement::DeleteAuction { auction_id }).await {
            tracing::error!("[hub] [auction] id={} delete failed, retrying: {}", auction_id, e);
            let retry = self.arm(auction_id, self.limits.grace);
            if let Some(l) = self.listings.get_mut(&auction_id) {
                l.timer = Some(retry);
            }
            return Vec::new();
        }
        let Some(listing) = self.listings.remove(&auction_id) else {
            return Vec::new();
        };
        tracing::info!("[hub] [auction] Auction End: id {}", auction_id);
        settle(listing.rec, now)
    }

    /// One page of matching listings plus the total page count.
    pub fn search(&self, q: &AuctionQuery) -> (u16, Vec<AuctionRecord>) {
        let hits: Vec<&AuctionRecord> =
            self.listings.values().map(|l| &l.rec).filter(|a| q.matches(a)).collect();
        let pages = hits.len().div_ceil(PAGE_SIZE).max(1);
        let page = usize::from(q.page.max(1));
        let found = hits
            .into_iter()
            .skip((page - 1) * PAGE_SIZE)
            .take(PAGE_SIZE)
            .cloned()
            .collect();
        (pages.min(u16::MAX as usize) as u16, found)
    }

    /// Abort all timers. Listings stay in storage for the next start.
    pub fn shutdown(&mut self) {
        for l in self.listings.values() {
            self.disarm(l);
        }
        self.listings.clear();
    }
}

/// Deliveries for a finished auction.
fn settle(rec: AuctionRecord, now: i64) -> Vec<AuctionNotice> {
    match rec.buyer_id {
        Some(buyer) => vec![
            mail(
                buyer,
                &rec.buyer_name,
                "Thanks, you won the auction!.",
                0,
                Some(rec.item.clone()),
                now,
            ),
            AuctionNotice::Message { char_id: buyer, auction_id: rec.auction_id, code: MSG_WON },
            mail(
                rec.seller_id,
                &rec.seller_name,
                "Payment for your auction!.",
                rec.price,
                None,
                now,
            ),
        ],
        None => vec![mail(
            rec.seller_id,
            &rec.seller_name,
            "No buyers have been found for your auction.",
            0,
            Some(rec.item),
            now,
        )],
    }
}
