// Server Pool: scoring, dial suggestions, eviction and persistence.

mod common;

use std::time::Duration;

use libp2p::Multiaddr;
use tempfile::TempDir;
use unchained_light::config;
use unchained_light::serverpool::{self, Outcome, ServerPool, INITIAL_SCORE};

use common::{open_store, peer_id};

fn addr(port: u16) -> Multiaddr {
    format!("/ip4/127.0.0.1/tcp/{port}").parse().expect("valid multiaddr")
}

fn pool_with(explore_ratio: f64, max_entries: usize) -> ServerPool {
    ServerPool::new(config::Pool { explore_ratio, max_entries, seed: Some(42), ..config::Pool::default() })
}

#[tokio::test]
async fn test_score_monotonicity() {
    println!("🧪 Testing score updates...");
    let pool = pool_with(0.0, 16);
    let ids: Vec<_> = (1..=4).map(peer_id).collect();
    for id in &ids {
        pool.connected(*id, None);
    }
    assert_eq!(pool.score(&ids[0]), Some(INITIAL_SCORE));

    pool.report(&ids[0], Outcome::Success);
    pool.report(&ids[1], Outcome::Timeout);
    pool.report(&ids[2], Outcome::Disconnected);
    pool.report(&ids[3], Outcome::Invalid);

    let score = |i: usize| pool.score(&ids[i]).expect("known peer");
    assert!(score(0) > INITIAL_SCORE, "success must raise the score");
    assert!(score(1) < INITIAL_SCORE, "timeout must lower the score");
    assert!(score(2) < INITIAL_SCORE, "disconnect must lower the score");
    assert!(score(3) < score(1), "invalid data must cost more than a timeout");
    assert!(score(3) < score(2), "invalid data must cost more than a disconnect");

    for _ in 0..200 {
        pool.report(&ids[0], Outcome::Success);
        pool.report(&ids[3], Outcome::Invalid);
    }
    assert!(score(0) <= 1.0 && score(0) > 0.99);
    assert!(score(3) >= 0.0);
    println!("✅ Scores stay in [0, 1] and order outcomes by severity");
}

#[tokio::test]
async fn test_report_tracks_failures() {
    let pool = pool_with(0.0, 16);
    let unknown = peer_id(9);
    pool.report(&unknown, Outcome::Timeout);
    let entry = pool.entry(&unknown).expect("reporting creates the entry");
    assert_eq!(entry.failures, 1);
    assert!(entry.last_success.is_none());

    pool.report(&unknown, Outcome::Success);
    let entry = pool.entry(&unknown).expect("entry");
    assert_eq!(entry.failures, 0, "success clears the failure streak");
    assert!(entry.last_success.is_some());
}

#[tokio::test]
async fn test_suggest_prefers_best_scores() {
    let pool = pool_with(0.0, 16);
    let ids: Vec<_> = (1..=4).map(peer_id).collect();
    for (i, id) in ids.iter().enumerate() {
        pool.add_candidate(*id, addr(4000 + i as u16));
    }
    pool.report(&ids[2], Outcome::Success);
    pool.report(&ids[0], Outcome::Invalid);

    let picked: Vec<_> = pool.suggest(2).into_iter().map(|(id, _)| id).collect();
    assert_eq!(picked.len(), 2);
    assert_eq!(picked[0], ids[2], "best score first");
    assert!(!picked.contains(&ids[0]), "without exploration the penalised peer is not suggested");
}

#[tokio::test]
async fn test_suggest_explores_lower_ranked_candidates() {
    println!("🧪 Testing exploration...");
    let pool = pool_with(0.5, 16);
    let ids: Vec<_> = (1..=5).map(peer_id).collect();
    for (i, id) in ids.iter().enumerate() {
        pool.add_candidate(*id, addr(4100 + i as u16));
    }
    pool.report(&ids[4], Outcome::Success);

    let picked: Vec<_> = pool.suggest(2).into_iter().map(|(id, _)| id).collect();
    assert_eq!(picked.len(), 2);
    assert_eq!(picked[0], ids[4], "the exploit slot goes to the best score");
    assert_ne!(picked[1], ids[4], "the explore slot goes to another candidate");

    // a peer that misbehaved still gets picked by exploration eventually
    for id in &ids[..4] {
        pool.report(id, Outcome::Invalid);
    }
    let mut seen = std::collections::HashSet::new();
    for _ in 0..64 {
        for (id, _) in pool.suggest(2) {
            seen.insert(id);
        }
    }
    assert_eq!(seen.len(), 5, "every candidate must be suggested at some point");
    println!("✅ Low-scored peers keep a path back");
}

#[tokio::test]
async fn test_single_suggestion_favours_best_score() {
    let pool = pool_with(0.2, 16);
    let ids: Vec<_> = (1..=5).map(peer_id).collect();
    for (i, id) in ids.iter().enumerate() {
        pool.add_candidate(*id, addr(4150 + i as u16));
    }
    for _ in 0..5 {
        pool.report(&ids[2], Outcome::Success);
    }
    for id in [ids[0], ids[1], ids[3], ids[4]] {
        pool.report(&id, Outcome::Invalid);
    }

    let best = (0..100).filter(|_| pool.suggest(1).first().map(|(id, _)| *id) == Some(ids[2])).count();
    assert!(best >= 60, "one slot should mostly go to the best score, got {best}/100");
    assert!(best < 100, "exploration still happens with a single slot");
}

#[tokio::test]
async fn test_suggest_skips_connected_and_backed_off() {
    let pool = pool_with(0.0, 16);
    let connected = peer_id(1);
    let failing = peer_id(2);
    let fresh = peer_id(3);
    pool.add_candidate(connected, addr(4201));
    pool.add_candidate(failing, addr(4202));
    pool.add_candidate(fresh, addr(4203));
    pool.connected(connected, None);
    pool.dial_failed(&failing);

    let picked: Vec<_> = pool.suggest(3).into_iter().map(|(id, _)| id).collect();
    assert_eq!(picked, vec![fresh]);

    pool.disconnected(&connected);
    assert!(pool.suggest(3).iter().any(|(id, _)| *id == connected), "disconnected peers are dialable again");
}

#[tokio::test]
async fn test_dial_backoff_doubles_up_to_max() {
    let pool = ServerPool::new(config::Pool {
        dial_backoff_base_secs: 5,
        dial_backoff_max_secs: 30,
        ..config::Pool::default()
    });
    let id = peer_id(1);
    pool.add_candidate(id, addr(4300));

    let mut seen = Vec::new();
    for _ in 0..5 {
        pool.dial_failed(&id);
        seen.push(pool.entry(&id).expect("entry").backoff);
    }
    let secs: Vec<u64> = seen.iter().map(Duration::as_secs).collect();
    assert_eq!(secs, vec![5, 10, 20, 30, 30]);

    pool.connected(id, None);
    assert_eq!(pool.entry(&id).expect("entry").backoff, Duration::ZERO, "a connection resets the backoff");
}

#[tokio::test]
async fn test_eviction_drops_lowest_disconnected() {
    println!("🧪 Testing bounded pool...");
    let pool = pool_with(0.0, 3);
    let ids: Vec<_> = (1..=4).map(peer_id).collect();
    pool.add_candidate(ids[0], addr(4400));
    pool.add_candidate(ids[1], addr(4401));
    pool.connected(ids[2], Some(addr(4402)));
    pool.report(&ids[0], Outcome::Invalid);
    pool.report(&ids[2], Outcome::Invalid);

    assert!(pool.add_candidate(ids[3], addr(4403)));
    assert_eq!(pool.len(), 3);
    assert!(pool.entry(&ids[0]).is_none(), "lowest disconnected entry is evicted");
    assert!(pool.entry(&ids[2]).is_some(), "connected entries are never evicted");
    println!("✅ Pool stays within max_entries");
}

#[tokio::test]
async fn test_persistence_across_restart() {
    println!("🧪 Testing server pool persistence...");
    let dir = TempDir::new().expect("Failed to create temp dir");
    let cfg = config::Pool { max_entries: 3, ..config::Pool::default() };
    let good = peer_id(1);
    let bad = peer_id(2);
    let gone = peer_id(3);

    {
        let store = open_store(&dir, "pool");
        let pool = ServerPool::open(store.clone(), cfg.clone()).expect("open pool");
        assert!(pool.is_empty());
        pool.add_candidate(good, addr(4500));
        pool.add_candidate(bad, addr(4501));
        pool.add_candidate(gone, addr(4502));
        pool.report(&good, Outcome::Success);
        pool.report(&bad, Outcome::Invalid);
        pool.dial_failed(&bad);
        assert_eq!(pool.save().expect("save"), 3);

        pool.report(&gone, Outcome::Invalid);
        pool.report(&gone, Outcome::Invalid);
        pool.add_candidate(peer_id(4), addr(4503));
        assert!(pool.entry(&gone).is_none(), "worst entry evicted");
        assert_eq!(pool.save().expect("save"), 3);
    }

    let store = open_store(&dir, "pool");
    let entries = serverpool::load_entries(&store).expect("load entries");
    assert_eq!(entries.len(), 3, "evicted rows are removed from the store");

    let restored = ServerPool::open(store, cfg).expect("reopen pool");
    let good_score = restored.score(&good).expect("good peer restored");
    let bad_entry = restored.entry(&bad).expect("bad peer restored");
    assert!(good_score > INITIAL_SCORE);
    assert!(bad_entry.score < INITIAL_SCORE);
    assert_eq!(bad_entry.failures, 2);
    assert_eq!(bad_entry.backoff, Duration::from_secs(5));
    assert!(bad_entry.next_dial.is_none(), "a restart gives a fresh dial attempt");
    assert!(restored.entry(&gone).is_none());
    assert_eq!(restored.entries()[0].id, good, "entries are ordered best first");
    println!("✅ Scores survive a restart");
}

#[tokio::test]
async fn test_pool_without_store_saves_nothing() {
    let pool = pool_with(0.2, 4);
    pool.add_candidate(peer_id(1), addr(4600));
    assert_eq!(pool.save().expect("save"), 0);
}

#[test]
fn test_parse_bootnode() {
    let id = peer_id(7);
    let (parsed, dial) = serverpool::parse_bootnode(&format!("/ip4/10.0.0.1/tcp/30303/p2p/{id}")).expect("valid bootnode");
    assert_eq!(parsed, id);
    assert_eq!(dial, "/ip4/10.0.0.1/tcp/30303".parse::<Multiaddr>().expect("multiaddr"));

    assert!(serverpool::parse_bootnode("/ip4/10.0.0.1/tcp/30303").is_err(), "peer id is required");
    assert!(serverpool::parse_bootnode("not a multiaddr").is_err());

    let pool = pool_with(0.0, 8);
    let added = pool
        .add_bootnodes(&[format!("/ip4/10.0.0.2/tcp/1/p2p/{id}"), format!("/ip4/10.0.0.3/tcp/1/p2p/{id}")])
        .expect("bootnodes");
    assert_eq!(added, 1, "the same identity is only added once");
    assert_eq!(pool.entry(&id).and_then(|e| e.addr), Some("/ip4/10.0.0.3/tcp/1".parse().expect("multiaddr")));
}
