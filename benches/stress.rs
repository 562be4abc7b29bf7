use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

const HOUR: i64 = 3_600_000; // 1 hour in ms
/// 2025-01-01T00:00:00Z; the server refuses timestamps before 2000.
const EPOCH: i64 = 1_735_689_600_000;

struct Target {
    host: String,
    port: u16,
    user: String,
    password: String,
}

async fn connect(target: &Target) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(&target.host)
        .port(target.port)
        .user(&target.user)
        .password(&target.password);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

async fn add_resource(client: &tokio_postgres::Client) -> Ulid {
    let rid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO resources (id, name) VALUES ('{rid}', 'bench {rid}')"
        ))
        .await
        .unwrap();
    rid
}

async fn add_project(client: &tokio_postgres::Client) -> Ulid {
    let pid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO projects (id, name) VALUES ('{pid}', 'bench {pid}')"
        ))
        .await
        .unwrap();
    pid
}

fn allocation_sql(rid: Ulid, pid: Ulid, slot: i64) -> String {
    let s = EPOCH + slot * HOUR;
    let e = s + HOUR;
    format!(
        r#"INSERT INTO allocations (id, resource_id, project_id, start, "end") VALUES ('{}', '{rid}', '{pid}', {s}, {e})"#,
        Ulid::new()
    )
}

async fn phase1_sequential(target: &Target, pid: Ulid) {
    let client = connect(target).await;
    let rid = add_resource(&client).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        client
            .batch_execute(&allocation_sql(rid, pid, i as i64))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} allocations in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Every task tries to take the same slots on one resource; exactly one
/// allocation per slot may be admitted.
async fn phase2_contended(target: &Arc<Target>, pid: Ulid) {
    let n_tasks = 10;
    let n_slots = 200;

    let rid = add_resource(&connect(target).await).await;
    let admitted = Arc::new(AtomicUsize::new(0));
    let refused = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..n_tasks {
        let target = target.clone();
        let admitted = admitted.clone();
        let refused = refused.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&target).await;
            for slot in 0..n_slots {
                match client.batch_execute(&allocation_sql(rid, pid, slot)).await {
                    Ok(()) => admitted.fetch_add(1, Ordering::Relaxed),
                    Err(_) => refused.fetch_add(1, Ordering::Relaxed),
                };
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_slots as usize;
    let ops = total as f64 / elapsed.as_secs_f64();
    let admitted = admitted.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} tasks x {n_slots} slots = {total} attempts in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
    println!(
        "  admitted={admitted} refused={} (expected admitted={n_slots})",
        refused.load(Ordering::Relaxed)
    );
}

async fn phase3_schedule_under_load(target: &Arc<Target>, pid: Ulid) {
    let setup = connect(target).await;
    let rid = add_resource(&setup).await;
    for i in 0..200 {
        setup.batch_execute(&allocation_sql(rid, pid, i * 2)).await.unwrap();
    }
    drop(setup);

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..5 {
        let target = target.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&target).await;
            let wrid = add_resource(&client).await;
            let mut slot = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let _ = client.batch_execute(&allocation_sql(wrid, pid, slot)).await;
                slot += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let window_end = EPOCH + 400 * HOUR;
    let mut reader_handles = Vec::new();

    for _ in 0..n_readers {
        let target = target.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&target).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .batch_execute(&format!(
                        r#"SELECT * FROM schedule WHERE resource_id = '{rid}' AND start >= {EPOCH} AND "end" <= {window_end}"#
                    ))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("schedule query", &mut all_latencies);
}

#[tokio::main]
async fn main() {
    let env = |key: &str, default: &str| std::env::var(key).unwrap_or_else(|_| default.into());
    let target = Arc::new(Target {
        host: env("BERTH_HOST", "127.0.0.1"),
        port: env("BERTH_PORT", "5433").parse().expect("invalid BERTH_PORT"),
        user: env("BERTH_ADMIN_USER", "admin"),
        password: env("BERTH_ADMIN_PASSWORD", "berth"),
    });

    println!("=== berth stress benchmark ===");
    println!("target: {}:{}\n", target.host, target.port);

    let pid = add_project(&connect(&target).await).await;

    println!("[phase 1] sequential allocation throughput");
    phase1_sequential(&target, pid).await;

    println!("\n[phase 2] contended allocation (double-booking race)");
    phase2_contended(&target, pid).await;

    println!("\n[phase 3] schedule latency under write load");
    phase3_schedule_under_load(&target, pid).await;

    println!("\n=== done ===");
}
