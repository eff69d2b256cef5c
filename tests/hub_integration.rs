use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use hubd::config::ServerConfig;
use hubd::servers::hub::auction::{AuctionItem, NewListing, IT_WEAPON, MSG_OUTBID};
use hubd::servers::hub::charstatus::{CharStatus, Item, SqlValue};
use hubd::servers::hub::db::{ItemTable, Statement};
use hubd::servers::hub::memstore::MemoryStore;
use hubd::servers::hub::packet::{self, FrameReader, OfflineKind, WorldRequest, HUB_PACKETS};
use hubd::servers::hub::relay::WIS_DELIVERED;
use hubd::servers::hub::session::Location;
use hubd::servers::hub::HubState;

const CONFIG: &str = r#"
sql_ip: "127.0.0.1"
sql_id: "user"
sql_pw: "pass"
sql_db: "testdb"
hub_id: "hubid"
hub_pw: "hubpw"
login_id: "loginid"
login_pw: "loginpw"
login_ip: "127.0.0.1"
save_time: 45
"#;

async fn start_test_hub(store: Arc<MemoryStore>) -> (std::net::SocketAddr, Arc<HubState>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = ServerConfig::from_str(CONFIG).unwrap();
    let (state, events) = HubState::new(store, config);
    let state = Arc::new(state);

    let s = Arc::clone(&state);
    tokio::spawn(async move {
        let _ = HubState::serve(s, events, listener).await;
    });

    (addr, state)
}

fn cmd_of(frame: &Bytes) -> u16 {
    u16::from_le_bytes([frame[0], frame[1]])
}

struct World {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    slot: u8,
}

impl World {
    async fn connect(addr: std::net::SocketAddr) -> World {
        let (world, reply) = World::try_connect(addr, "hubpw").await;
        assert_eq!(reply[2], packet::AUTH_OK);
        world
    }

    async fn try_connect(addr: std::net::SocketAddr, pw: &str) -> (World, Bytes) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (rh, wh) = stream.into_split();
        let mut world = World { reader: FrameReader::new(rh, &HUB_PACKETS), writer: wh, slot: 0 };
        world
            .send(WorldRequest::Auth {
                id: "hubid".into(),
                pw: pw.into(),
                ip: 0x0100007F,
                port: 5001,
            })
            .await;
        let reply = world.recv().await;
        assert_eq!(cmd_of(&reply), packet::HUB_AUTH_RESULT);
        world.slot = reply[3];
        (world, reply)
    }

    async fn send(&mut self, req: WorldRequest) {
        let frame = req.encode().unwrap();
        self.writer.write_all(&frame).await.unwrap();
    }

    async fn recv(&mut self) -> Bytes {
        tokio::time::timeout(Duration::from_secs(5), self.reader.next_frame())
            .await
            .expect("hub did not answer")
            .unwrap()
            .expect("hub closed the link")
    }

    /// Skip frames until one with `cmd` arrives.
    async fn recv_cmd(&mut self, cmd: u16) -> Bytes {
        loop {
            let frame = self.recv().await;
            if cmd_of(&frame) == cmd {
                return frame;
            }
        }
    }

    /// Everything sent before this has been handled.
    async fn sync(&mut self) {
        self.send(WorldRequest::Ping).await;
        self.recv_cmd(packet::HUB_PONG).await;
    }
}

/// Wait until the hub holds exactly `n` world links.
async fn wait_for_worlds(state: &HubState, n: usize) {
    for _ in 0..250 {
        if state.world_count().await == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("hub never reached {} world link(s)", n);
}

fn alice() -> CharStatus {
    let mut cs = CharStatus::new(150001);
    cs.account_id = 2000001;
    cs.name = "Alice".into();
    cs.zeny = 100;
    cs.inventory = vec![Item { nameid: 501, amount: 3, ..Default::default() }];
    cs
}

#[tokio::test]
async fn test_bad_credentials_rejected() {
    let (addr, _state) = start_test_hub(Arc::new(MemoryStore::new())).await;
    let (mut world, reply) = World::try_connect(addr, "wrong").await;
    assert_eq!(reply[2], packet::AUTH_REJECTED);
    assert!(matches!(world.reader.next_frame().await, Ok(None) | Err(_)));
}

#[tokio::test]
async fn test_auth_hands_out_slot_and_save_time() {
    let (addr, state) = start_test_hub(Arc::new(MemoryStore::new())).await;
    let stream = TcpStream::connect(addr).await.unwrap();
    let (rh, mut wh) = stream.into_split();
    let mut reader = FrameReader::new(rh, &HUB_PACKETS);
    let auth = WorldRequest::Auth { id: "hubid".into(), pw: "hubpw".into(), ip: 0, port: 5001 };
    wh.write_all(&auth.encode().unwrap()).await.unwrap();
    let mut reply = reader.next_frame().await.unwrap().unwrap();
    reply.advance(2);
    assert_eq!(reply.get_u8(), packet::AUTH_OK);
    assert_eq!(reply.get_u8(), 0);
    assert_eq!(reply.get_u32_le(), 45);

    let mut second = World::connect(addr).await;
    assert_eq!(second.slot, 1);
    second.sync().await;
    assert_eq!(state.world_count().await, 2);
}

#[tokio::test]
async fn test_startup_clears_online_flags() {
    let store = Arc::new(MemoryStore::new());
    let (addr, _state) = start_test_hub(Arc::clone(&store)).await;
    let mut world = World::connect(addr).await;
    world.sync().await;
    assert!(store.statements().iter().any(|s| matches!(s, Statement::SetAllOffline)));
}

#[tokio::test]
async fn test_duplicate_login_kicks_old_world() {
    let store = Arc::new(MemoryStore::new());
    store.insert_character(&alice());
    let (addr, state) = start_test_hub(Arc::clone(&store)).await;
    let mut w1 = World::connect(addr).await;
    let mut w2 = World::connect(addr).await;

    w1.send(WorldRequest::CharOnline { account_id: 2000001, char_id: 150001 }).await;
    w1.sync().await;
    assert!(store.is_online(150001));

    w2.send(WorldRequest::CharOnline { account_id: 2000001, char_id: 150001 }).await;
    w2.sync().await;

    let mut kick = w1.recv_cmd(packet::HUB_KICK).await;
    kick.advance(2);
    assert_eq!(kick.get_u32_le(), 2000001);
    assert_eq!(kick.get_u32_le(), 150001);
    assert_eq!(kick.get_u8(), 2);

    let sessions = state.sessions.lock().await;
    assert_eq!(sessions.users(w2.slot as usize), 1);
    assert_eq!(sessions.users(w1.slot as usize), 0);
}

#[tokio::test]
async fn test_kicked_world_logout_leaves_winner_online() {
    let store = Arc::new(MemoryStore::new());
    store.insert_character(&alice());
    let (addr, state) = start_test_hub(Arc::clone(&store)).await;
    let mut w1 = World::connect(addr).await;
    let mut w2 = World::connect(addr).await;

    w1.send(WorldRequest::CharOnline { account_id: 2000001, char_id: 150001 }).await;
    w1.sync().await;
    w2.send(WorldRequest::CharOnline { account_id: 2000001, char_id: 150001 }).await;
    w2.sync().await;

    // w1 drops its copy of the player and reports it, as a kicked world does
    w1.recv_cmd(packet::HUB_KICK).await;
    w1.send(WorldRequest::CharOffline {
        account_id: 2000001,
        char_id: 150001,
        kind: OfflineKind::Logout,
    })
    .await;
    w1.send(WorldRequest::SaveChar {
        account_id: 2000001,
        char_id: 150001,
        final_save: true,
        status: Box::new(alice()),
    })
    .await;
    w1.recv_cmd(packet::HUB_SAVE_ACK).await;

    assert!(store.is_online(150001));
    let sessions = state.sessions.lock().await;
    let session = sessions.get(2000001).unwrap();
    assert_eq!(session.location, Location::World(w2.slot as usize));
    assert_eq!(session.char_id, Some(150001));
    assert_eq!(sessions.users(w2.slot as usize), 1);
}

#[tokio::test]
async fn test_reconnect_into_freed_slot_survives_sweep() {
    let store = Arc::new(MemoryStore::new());
    store.insert_character(&alice());
    let (addr, state) = start_test_hub(Arc::clone(&store)).await;

    let mut old = World::connect(addr).await;
    old.send(WorldRequest::CharOnline { account_id: 2000001, char_id: 150001 }).await;
    old.sync().await;
    assert_eq!(old.slot, 0);
    drop(old);
    wait_for_worlds(&state, 0).await;

    let mut new = World::connect(addr).await;
    assert_eq!(new.slot, 0);
    new.send(WorldRequest::CharOnline { account_id: 2000002, char_id: 150002 }).await;
    new.sync().await;

    let sessions = state.sessions.lock().await;
    assert_eq!(sessions.get(2000001).unwrap().location, Location::Unknown);
    assert_eq!(sessions.get(2000002).unwrap().location, Location::World(0));
    assert!(sessions.get(2000002).unwrap().disconnect_timer.is_none());
    assert_eq!(sessions.users(0), 1);
}

#[tokio::test]
async fn test_load_save_and_final_ack() {
    let store = Arc::new(MemoryStore::new());
    store.insert_character(&alice());
    let (addr, state) = start_test_hub(Arc::clone(&store)).await;
    let mut world = World::connect(addr).await;

    world.send(WorldRequest::CharOnline { account_id: 2000001, char_id: 150001 }).await;
    world.send(WorldRequest::RequestChar { account_id: 2000001, char_id: 150001 }).await;
    let mut data = world.recv_cmd(packet::HUB_CHAR_DATA).await;
    data.advance(6);
    assert_eq!(data.get_u32_le(), 2000001);
    assert_eq!(data.get_u32_le(), 150001);
    assert_eq!(data.get_u8(), 0);
    let mut cs = CharStatus::from_blob(&data).unwrap();
    assert_eq!(cs.name, "Alice");
    assert_eq!(cs.inventory.len(), 1);

    store.take_statements();
    cs.zeny = 250;
    cs.inventory[0].amount = 5;
    world
        .send(WorldRequest::SaveChar {
            account_id: 2000001,
            char_id: 150001,
            final_save: false,
            status: Box::new(cs.clone()),
        })
        .await;
    world.sync().await;
    assert_eq!(store.column(150001, "ChaZeny"), Some(SqlValue::Int(250)));
    assert_eq!(store.rows(ItemTable::Inventory, 150001)[0].amount, 5);

    // nothing changed, nothing written
    store.take_statements();
    world
        .send(WorldRequest::SaveChar {
            account_id: 2000001,
            char_id: 150001,
            final_save: true,
            status: Box::new(cs),
        })
        .await;
    let mut ack = world.recv_cmd(packet::HUB_SAVE_ACK).await;
    ack.advance(10);
    assert_eq!(ack.get_u8(), 1);
    let written = store.take_statements();
    assert!(
        written.iter().all(|s| matches!(s, Statement::SetCharOnline { .. })),
        "{:?}",
        written
    );
    assert!(!store.is_online(150001));
    assert!(!state.sessions.lock().await.is_online(2000001));
}

#[tokio::test]
async fn test_unknown_character_load_fails_cleanly() {
    let (addr, _state) = start_test_hub(Arc::new(MemoryStore::new())).await;
    let mut world = World::connect(addr).await;
    world.send(WorldRequest::RequestChar { account_id: 1, char_id: 99 }).await;
    let mut data = world.recv_cmd(packet::HUB_CHAR_DATA).await;
    data.advance(14);
    assert_eq!(data.get_u8(), 1);
}

#[tokio::test]
async fn test_whisper_round_trip() {
    let store = Arc::new(MemoryStore::new());
    let mut bob = CharStatus::new(150002);
    bob.account_id = 2000002;
    bob.name = "Bob".into();
    store.insert_character(&bob);
    let (addr, _state) = start_test_hub(Arc::clone(&store)).await;
    let mut w1 = World::connect(addr).await;
    let mut w2 = World::connect(addr).await;

    w2.send(WorldRequest::CharOnline { account_id: 2000002, char_id: 150002 }).await;
    w2.sync().await;

    w1.send(WorldRequest::Whisper {
        sender: "Alice".into(),
        recipient: "Bob".into(),
        message: "hi".into(),
    })
    .await;
    let mut wis = w2.recv_cmd(packet::HUB_WHISPER).await;
    wis.advance(6);
    let id = wis.get_u32_le();

    w2.send(WorldRequest::WhisperReply { id, flag: WIS_DELIVERED }).await;
    let result = w1.recv_cmd(packet::HUB_WHISPER_RESULT).await;
    assert_eq!(&result[2..7], b"Alice");
    assert_eq!(result[26], WIS_DELIVERED);
}

#[tokio::test]
async fn test_whisper_to_offline_player_fails_at_once() {
    let store = Arc::new(MemoryStore::new());
    let mut bob = CharStatus::new(150002);
    bob.account_id = 2000002;
    bob.name = "Bob".into();
    store.insert_character(&bob);
    let (addr, _state) = start_test_hub(Arc::clone(&store)).await;
    let mut w1 = World::connect(addr).await;

    w1.send(WorldRequest::Whisper {
        sender: "Alice".into(),
        recipient: "Bob".into(),
        message: "hi".into(),
    })
    .await;
    let result = w1.recv_cmd(packet::HUB_WHISPER_RESULT).await;
    assert_eq!(result[26], hubd::servers::hub::relay::WIS_NOT_HERE);
}

#[tokio::test]
async fn test_auction_over_the_wire() {
    let store = Arc::new(MemoryStore::new());
    let (addr, _state) = start_test_hub(Arc::clone(&store)).await;
    let mut world = World::connect(addr).await;

    world
        .send(WorldRequest::AuctionRegister(NewListing {
            seller_id: 7,
            seller_name: "Seller".into(),
            reserve: 100,
            buynow: 500,
            hours: 1,
            item: AuctionItem {
                nameid: 1201,
                item_type: IT_WEAPON,
                name: "Knife".into(),
                ..Default::default()
            },
        }))
        .await;
    let mut reg = world.recv_cmd(packet::HUB_AUCTION_REGISTER).await;
    reg.advance(6);
    assert_eq!(reg.get_u8(), 0);
    let auction_id = reg.get_u32_le();
    assert_eq!(store.auctions().len(), 1);

    world
        .send(WorldRequest::AuctionBid { char_id: 9, name: "Nine".into(), auction_id, bid: 150 })
        .await;
    let bid = world.recv_cmd(packet::HUB_AUCTION_BID).await;
    assert_eq!(bid[10], 0);

    // the seller may not bid on their own listing; the money goes back
    world
        .send(WorldRequest::AuctionBid { char_id: 7, name: "Seller".into(), auction_id, bid: 300 })
        .await;
    let mut bid = world.recv_cmd(packet::HUB_AUCTION_BID).await;
    bid.advance(6);
    assert_eq!(bid.get_u32_le(), 300);
    assert_eq!(bid.get_u8(), 3);

    world
        .send(WorldRequest::AuctionBid { char_id: 12, name: "Twelve".into(), auction_id, bid: 500 })
        .await;
    let bid = world.recv_cmd(packet::HUB_AUCTION_BID).await;
    assert_eq!(bid[10], 0);
    let mut msg = world.recv_cmd(packet::HUB_AUCTION_MESSAGE).await;
    msg.advance(2);
    assert_eq!(msg.get_u32_le(), 9);
    assert_eq!(msg.get_u32_le(), auction_id);
    assert_eq!(msg.get_u8(), MSG_OUTBID);
    world.sync().await;

    assert!(store.auctions().is_empty());
    let mails = store.mails();
    let to = |id: u32| mails.iter().filter(|m| m.dest_id == id).map(|m| m.zeny).sum::<u32>();
    assert_eq!(to(9), 150);
    assert_eq!(to(7), 500);
    assert!(mails.iter().any(|m| m.dest_id == 12 && m.item.is_some()));
}

#[tokio::test]
async fn test_foreign_service_frame_is_skipped() {
    let (addr, _state) = start_test_hub(Arc::new(MemoryStore::new())).await;
    let mut world = World::connect(addr).await;
    // 0x3035 pet load, 10 bytes
    let mut frame = vec![0x35, 0x30];
    frame.extend_from_slice(&[0u8; 8]);
    world.writer.write_all(&frame).await.unwrap();
    world.sync().await;
}

#[tokio::test]
async fn test_unknown_opcode_drops_link() {
    let (addr, state) = start_test_hub(Arc::new(MemoryStore::new())).await;
    let mut world = World::connect(addr).await;
    world.writer.write_all(&[0x99, 0x39, 0, 0]).await.unwrap();
    let eof = tokio::time::timeout(Duration::from_secs(5), world.reader.next_frame())
        .await
        .unwrap();
    assert!(matches!(eof, Ok(None) | Err(_)));
    wait_for_worlds(&state, 0).await;
}

#[tokio::test]
async fn test_broadcast_reaches_other_worlds_only() {
    let (addr, _state) = start_test_hub(Arc::new(MemoryStore::new())).await;
    let mut w1 = World::connect(addr).await;
    let mut w2 = World::connect(addr).await;
    w1.send(WorldRequest::Broadcast { sender: "GM".into(), message: "server restart".into() })
        .await;
    let frame = w2.recv_cmd(packet::HUB_BROADCAST).await;
    assert!(frame.ends_with(b"server restart"));
    // w1 sees only its own pong
    w1.send(WorldRequest::Ping).await;
    assert_eq!(cmd_of(&w1.recv().await), packet::HUB_PONG);
}

#[tokio::test]
async fn test_char_select_keeps_account_online() {
    let store = Arc::new(MemoryStore::new());
    store.insert_character(&alice());
    let (addr, state) = start_test_hub(Arc::clone(&store)).await;
    let mut world = World::connect(addr).await;
    world.send(WorldRequest::CharOnline { account_id: 2000001, char_id: 150001 }).await;
    world
        .send(WorldRequest::CharOffline {
            account_id: 2000001,
            char_id: 150001,
            kind: OfflineKind::CharSelect,
        })
        .await;
    world.sync().await;
    assert!(!store.is_online(150001));
    let sessions = state.sessions.lock().await;
    let session = sessions.get(2000001).unwrap();
    assert_eq!(session.connection, Some(world.slot as usize));
    assert_eq!(session.char_id, None);
}
