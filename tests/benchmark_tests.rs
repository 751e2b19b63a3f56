//! Performance benchmarks for the master's hot paths

use master::ban::BanFilter;
use master::dispatcher::Deduplicator;
use master::quota::QuotaTracker;
use shared::{build_server_list, decode, GameInfo, MasterHeader, ServerEntry, DEFAULT_MAX_PACKET_SIZE};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

fn server(i: u32) -> ServerEntry {
    ServerEntry {
        addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::from(0xcb00_7100 + i)), 29001),
        info: GameInfo {
            name: format!("Benchmark Server {}", i),
            game: "base".to_string(),
            player_count: (i % 16) as u8,
            max_players: 16,
        },
    }
}

/// Benchmarks ban checks against a realistic network list
#[test]
fn benchmark_ban_matching() {
    let networks: Vec<String> = (0..50)
        .map(|i| format!("10.{}.0.0/16", i))
        .chain(std::iter::once("224.0.0.0/4".to_string()))
        .collect();
    let filter = BanFilter::parse(&networks, "banned").unwrap();
    let callers: Vec<IpAddr> = (0..256u32)
        .map(|i| IpAddr::V4(Ipv4Addr::from(0xcb00_7100 + i)))
        .collect();

    let iterations = 100_000;
    let start = Instant::now();

    let mut banned = 0;
    for i in 0..iterations {
        if filter.is_banned(callers[i % callers.len()]) {
            banned += 1;
        }
    }

    let duration = start.elapsed();
    println!(
        "Ban matching: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert_eq!(banned, 0);
    // Should complete in under 5 seconds even unoptimized
    assert!(duration.as_millis() < 5000);
}

/// Benchmarks building a paged list for a large registry
#[test]
fn benchmark_list_pagination() {
    let servers: Vec<ServerEntry> = (0..1000).map(server).collect();
    let header = MasterHeader {
        master_id: 99,
        name: "Benchmark Master".to_string(),
        motd: "Welcome!".to_string(),
    };

    let iterations = 50;
    let start = Instant::now();

    let mut pages = 0;
    for key in 0..iterations {
        let built = build_server_list(key, &header, &servers, DEFAULT_MAX_PACKET_SIZE).unwrap();
        pages = built.len();
        assert!(built.iter().all(|page| page.len() <= DEFAULT_MAX_PACKET_SIZE));
    }

    let duration = start.elapsed();
    println!(
        "List pagination: {} lists of {} pages in {:?} ({:.2} ms/list)",
        iterations,
        pages,
        duration,
        duration.as_millis() as f64 / iterations as f64
    );

    assert!(pages > 1);
    assert!(duration.as_millis() < 10_000);
}

/// Benchmarks decoding list pages
#[test]
fn benchmark_page_decoding() {
    let servers: Vec<ServerEntry> = (0..200).map(server).collect();
    let pages = build_server_list(1, &MasterHeader::default(), &servers, 512).unwrap();

    let iterations = 1000;
    let start = Instant::now();

    for _ in 0..iterations {
        for page in &pages {
            decode(page).unwrap();
        }
    }

    let duration = start.elapsed();
    println!(
        "Page decoding: {} x {} pages in {:?}",
        iterations,
        pages.len(),
        duration
    );

    assert!(duration.as_millis() < 10_000);
}

/// Benchmarks the receive loop's duplicate check
#[test]
fn benchmark_deduplication() {
    let mut dedup = Deduplicator::new();
    let sources: Vec<SocketAddr> = (0..64u16)
        .map(|port| SocketAddr::from(([127, 0, 0, 1], 20000 + port)))
        .collect();
    let payload = vec![0x10u8; 64];

    let iterations = 100_000;
    let start = Instant::now();

    let mut admitted = 0;
    for i in 0..iterations {
        if dedup.admit(sources[i % sources.len()], &payload) {
            admitted += 1;
        }
    }

    let duration = start.elapsed();
    println!("Deduplication: {} iterations in {:?}", iterations, duration);

    // Sources rotate, so nothing is a back-to-back repeat.
    assert_eq!(admitted, iterations);
    assert!(duration.as_millis() < 5000);
}

/// Benchmarks quota bookkeeping churn
#[test]
fn benchmark_quota_churn() {
    let mut quota = QuotaTracker::new();
    let ips: Vec<IpAddr> = (0..1000u32)
        .map(|i| IpAddr::V4(Ipv4Addr::from(0x0a00_0000 + i)))
        .collect();

    let iterations = 100_000;
    let start = Instant::now();

    for i in 0..iterations {
        let ip = ips[i % ips.len()];
        if quota.try_acquire(ip, 30).is_ok() && i % 2 == 0 {
            quota.release(ip);
        }
    }

    let duration = start.elapsed();
    println!("Quota churn: {} iterations in {:?}", iterations, duration);

    assert!(quota.len() <= ips.len());
    assert!(duration.as_millis() < 5000);
}
