// LightClient wiring: peer lifecycle, light vs full backend, the bloom
// worker pool and shutdown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use unchained_light::backend::{Backend, ChainDb};
use unchained_light::config::{self, Config};
use unchained_light::error::{OdrError, RegistryError, RetrieveError};
use unchained_light::peers::PeerCapabilities;
use unchained_light::serverpool;
use unchained_light::storage::Store;
use unchained_light::LightClient;

use common::{bloom_vector, fixture, odr_config, open_store, peer_id, pool_config, Behaviour, Fixture, MockNet};

const LOCAL_HEADERS: u64 = 4;

struct Light {
    fixture: Fixture,
    store: Arc<Store>,
    net: MockNet,
    client: LightClient,
}

fn client_config() -> Config {
    Config {
        net: config::Net { max_light_peers: 3, ..config::Net::default() },
        odr: odr_config(),
        pool: pool_config(),
        ..Config::default()
    }
}

/// A light node that holds the first section of headers and every trusted
/// section root, talking to servers that hold the whole fixture chain.
fn light_client(cfg: Config) -> Light {
    let fixture = fixture();
    let store = open_store(&fixture.dir, "light");
    let local = ChainDb::new(store.clone(), common::SECTION);
    for header in &fixture.headers[..LOCAL_HEADERS as usize] {
        local.put_header(header).expect("seed header");
    }
    for cht in &fixture.cht {
        local.put_cht_root(*cht).expect("seed cht root");
    }
    for root in &fixture.bloom {
        local.put_bloom_trie_root(*root).expect("seed bloom root");
    }

    let net = MockNet::new(fixture.full.clone());
    let client = LightClient::new(cfg, store.clone(), Arc::new(net.clone())).expect("build light client");
    net.connect(client.retrieval().clone());
    Light { fixture, store, net, client }
}

impl Light {
    fn connect(&self, n: u8, behaviour: Behaviour) -> libp2p::PeerId {
        let id = peer_id(n);
        self.net.set_behaviour(id, behaviour);
        self.client.on_peer_connected(id, None, PeerCapabilities::default()).expect("connect");
        id
    }
}

#[tokio::test]
async fn test_peer_lifecycle() {
    println!("🧪 Testing light server lifecycle...");
    let light = light_client(client_config());
    let client = &light.client;

    let a = light.connect(1, Behaviour::Honest);
    assert_eq!(
        client.on_peer_connected(a, None, PeerCapabilities::default()).unwrap_err(),
        RegistryError::AlreadyRegistered(a)
    );
    light.connect(2, Behaviour::Honest);
    light.connect(3, Behaviour::Honest);
    assert_eq!(
        client.on_peer_connected(peer_id(4), None, PeerCapabilities::default()).unwrap_err(),
        RegistryError::Full(3)
    );
    assert_eq!(client.peers().len(), 3);
    assert!(client.pool().entry(&a).expect("pooled").connected);

    client.on_peer_disconnected(&a);
    assert!(!client.peers().contains(&a));
    assert!(!client.pool().entry(&a).expect("still pooled").connected);
    // unknown peers are ignored
    client.on_peer_disconnected(&peer_id(42));
    println!("✅ Registry and pool follow connections");
}

#[tokio::test]
async fn test_reconnected_server_keeps_its_record() {
    let light = light_client(client_config());
    let a = light.connect(1, Behaviour::Honest);
    light.client.pool().report(&a, serverpool::Outcome::Invalid);
    light.client.on_peer_disconnected(&a);

    light.connect(1, Behaviour::Honest);
    let peer = light.client.peers().get(&a).expect("registered again");
    assert_eq!(Some(peer.score()), light.client.pool().score(&a), "selection starts from the pooled score");
    assert!(peer.score() < serverpool::INITIAL_SCORE);
}

#[tokio::test]
async fn test_suggest_dials_respects_free_slots() {
    let light = light_client(client_config());
    let client = &light.client;
    for n in 10..16u8 {
        let addr = format!("/ip4/10.0.0.{n}/tcp/30303").parse().expect("multiaddr");
        client.pool().add_candidate(peer_id(n), addr);
    }
    assert_eq!(client.suggest_dials(10).len(), 3, "no more dials than free light-peer slots");

    light.connect(1, Behaviour::Honest);
    light.connect(2, Behaviour::Honest);
    assert_eq!(client.suggest_dials(10).len(), 1);

    client.on_dial_failed(&peer_id(10));
    assert!(client.pool().entry(&peer_id(10)).expect("entry").failures > 0);
}

#[tokio::test]
async fn test_light_backend_fetches_what_it_lacks() {
    println!("🧪 Testing light backend...");
    let light = light_client(client_config());
    light.connect(1, Behaviour::Honest);
    let backend = light.client.backend();
    let f = &light.fixture;
    let cancel = CancellationToken::new();
    assert!(backend.is_light());

    let local = backend.header_by_number(2, &cancel).await.expect("local header");
    assert_eq!(local.as_ref(), Some(&f.headers[2]));
    assert_eq!(light.net.total_sent(), 0, "local headers need no network");

    let remote = backend.header_by_number(6, &cancel).await.expect("remote header");
    assert_eq!(remote.as_ref(), Some(&f.headers[6]));
    assert_eq!(light.net.total_sent(), 1, "proven through the CHT");
    let cached = light.client.chain().header_by_number(6).expect("read chain");
    assert_eq!(cached.as_ref(), Some(&f.headers[6]), "a proven header is kept locally");
    assert_eq!(backend.header_by_hash(&f.headers[6].hash()).expect("by hash"), Some(f.headers[6].clone()));

    assert_eq!(backend.header_by_number(1_000, &cancel).await.expect("unknown section"), None);

    let head = &f.headers[7];
    let receipts = backend.receipts(head, &cancel).await.expect("receipts");
    assert_eq!(receipts, f.receipts[7]);
    let account = backend.account(head, &f.rich, &cancel).await.expect("account");
    assert_eq!(account, Some(f.rich_account.clone()));
    let code = backend.code(head, &f.rich_account.code_hash, &cancel).await.expect("code");
    assert_eq!(code.as_ref(), f.code.as_slice());
    println!("✅ Light backend answers like a full node");
}

#[tokio::test]
async fn test_full_backend_answers_locally() {
    let f = fixture();
    let backend = Backend::Full(f.full.clone());
    let cancel = CancellationToken::new();
    let head = &f.headers[7];

    assert!(!backend.is_light());
    assert_eq!(backend.header_by_number(6, &cancel).await.expect("header"), Some(f.headers[6].clone()));
    assert_eq!(backend.receipts(head, &cancel).await.expect("receipts"), f.receipts[7]);
    assert_eq!(backend.account(head, &f.plain, &cancel).await.expect("account"), Some(f.plain_account.clone()));
    assert_eq!(backend.account(head, &f.missing, &cancel).await.expect("account"), None);
    let code = backend.code(head, &f.rich_account.code_hash, &cancel).await.expect("code");
    assert_eq!(code.as_ref(), f.code.as_slice());
}

#[tokio::test]
async fn test_bloom_service_orders_and_bounds_work() {
    println!("🧪 Testing bloom worker pool...");
    let light = light_client(client_config());
    light.connect(1, Behaviour::Slow(Duration::from_millis(60)));
    light.connect(2, Behaviour::Slow(Duration::from_millis(60)));
    light.connect(3, Behaviour::Slow(Duration::from_millis(60)));
    let bloom = light.client.bloom();
    assert_eq!(bloom.worker_count(), 2);

    let vectors = bloom.request(1, vec![1, 0]).await.expect("bloom bits");
    assert_eq!(vectors, vec![bloom_vector(1, 1), bloom_vector(1, 0)], "replies follow the requested section order");

    let requests = (0..common::BLOOM_BITS).map(|bit| bloom.request(bit, vec![0, 1]));
    let replies = futures::future::join_all(requests).await;
    for (bit, reply) in replies.into_iter().enumerate() {
        let vectors = reply.expect("bloom bits");
        assert_eq!(vectors, vec![bloom_vector(bit as u16, 0), bloom_vector(bit as u16, 1)]);
    }
    assert!(light.net.max_concurrent() <= 2, "no more wire requests in flight than workers");

    let missing = bloom.request(0, vec![0, 9]).await;
    assert_eq!(missing.unwrap_err(), OdrError::NoTrustedRoot { trie: "bloom trie", section: 9 });
    println!("✅ Bloom requests served in order by two workers");
}

#[tokio::test]
async fn test_bloom_block_ranges_map_to_sections() {
    let light = light_client(client_config());
    light.connect(1, Behaviour::Honest);
    let bloom = light.client.bloom();

    let first = common::SECTION / 2;
    let last = common::SECTION + 1;
    let vectors = bloom.request_blocks(3, first, last).await.expect("bloom bits");
    assert_eq!(vectors, vec![bloom_vector(3, 0), bloom_vector(3, 1)], "one vector per overlapped section");

    let within = bloom.request_blocks(3, 0, common::SECTION - 1).await.expect("bloom bits");
    assert_eq!(within, vec![bloom_vector(3, 0)]);

    let backwards = bloom.request_blocks(3, last, first).await;
    assert!(matches!(backwards, Err(OdrError::InvalidRequest(_))));
}

#[tokio::test]
async fn test_shutdown_persists_pool_and_stops_work() {
    println!("🧪 Testing shutdown...");
    let light = light_client(client_config());
    let a = light.connect(1, Behaviour::Honest);
    let head = light.fixture.headers[7].clone();
    light.client.odr().get_receipts(&head, &CancellationToken::new()).await.expect("receipts");

    light.client.shutdown().await.expect("shutdown");

    let saved = serverpool::load_entries(&light.store).expect("load pool");
    let entry = saved.iter().find(|e| e.id == a).expect("peer persisted");
    assert!(entry.score > serverpool::INITIAL_SCORE);

    let after = light.client.odr().get_receipts(&head, &CancellationToken::new()).await;
    assert_eq!(after.unwrap_err(), OdrError::Retrieve(RetrieveError::Shutdown));
    let bloom = light.client.bloom().request(0, vec![0]).await;
    assert!(bloom.unwrap_err().is_cancelled());
    println!("✅ Pool saved and outstanding work refused");
}
