use log::{debug, error, info, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::{signal, task, time};

use lib::stat::Capture;
use lib::{ConnectionStore, Direction, Snapshot};
use tcpscope as lib;

#[tokio::main]
async fn main() {
    // Parse arguments
    let flags = lib::parse();

    // Log
    lib::set_logger(&flags);

    // Validate arguments
    let opts = match lib::validate(&flags) {
        Ok(opts) => opts,
        Err(ref e) => {
            error!("{}", e);
            return;
        }
    };

    // Interface
    let inter = match lib::interface(opts.inter.clone()) {
        Ok(inter) => inter,
        Err(ref e) => {
            error!("{}", e);
            info!("Available interfaces are listed below, use -i <INTERFACE> to designate:");
            for inter in lib::interfaces().iter() {
                info!("    {}", inter);
            }
            return;
        }
    };
    info!("Listen on {}", inter);

    let mut rx = match inter.open() {
        Ok(rx) => rx,
        Err(ref e) => {
            error!("open pcap: {}", e);
            return;
        }
    };

    // Store
    let mut store = ConnectionStore::new(opts.store.clone());
    let kernel_source = if opts.kernel_hints {
        let source = opts.kernel_source.source();
        store = store.with_kernel_source(source.clone());
        info!("Read TCP state from {}", opts.kernel_source);
        Some(source)
    } else {
        None
    };
    let store = Arc::new(store);
    let capture_stat = Capture::new();
    let is_stopped = Arc::new(AtomicBool::new(false));

    // Kernel hints
    if let Some(source) = kernel_source {
        let interval = opts.kernel_interval;
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            loop {
                ticker.tick().await;
                let source = source.clone();
                match task::spawn_blocking(move || source.refresh()).await {
                    Ok(Ok(len)) => trace!("read {} TCP connections from the kernel", len),
                    Ok(Err(ref e)) => warn!("refresh kernel TCP state: {}", e),
                    Err(ref e) => warn!("refresh kernel TCP state: {}", e),
                }
            }
        });
    }

    // Report
    {
        let store = store.clone();
        let capture_stat = capture_stat.clone();
        let interval = opts.report_interval;
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            loop {
                ticker.tick().await;
                let expired = store.evict_idle(Instant::now());
                if expired > 0 {
                    debug!("expire {} idle TCP connections", expired);
                }
                show_connections(&store.snapshot(), &capture_stat);
            }
        });
    }

    // Capture
    let capture = {
        let store = store.clone();
        let capture_stat = capture_stat.clone();
        let is_stopped = is_stopped.clone();
        let is_raw_ip = inter.is_raw_ip();
        task::spawn_blocking(move || {
            lib::capture(&mut rx, is_raw_ip, &store, &capture_stat, &is_stopped)
        })
    };

    tokio::select! {
        result = capture => match result {
            Ok(Ok(())) => {}
            Ok(Err(ref e)) => error!("{}", e),
            Err(ref e) => error!("capture: {}", e),
        },
        result = signal::ctrl_c() => {
            if let Err(ref e) = result {
                error!("wait for interrupt: {}", e);
            }
            info!("Stop capturing");
            is_stopped.store(true, Ordering::Relaxed);
        }
    }

    show_connections(&store.snapshot(), &capture_stat);
}

fn show_connections(snapshot: &Snapshot, capture_stat: &Capture) {
    let stats = snapshot.stats();
    info!(
        "Captured {} frames ({} TCP), tracking {} connections ({} created, {} evicted, {} expired)",
        capture_stat.frames(),
        capture_stat.segments(),
        snapshot.connections().len(),
        stats.connections,
        stats.evicted,
        stats.expired
    );
    if snapshot.connections().is_empty() {
        return;
    }

    info!(
        "    {:<16} {:<47} {:<12} {:>9} {:>7} {:>10} {:>7} {:>12} {:>12}",
        "ID",
        "Connection",
        "State",
        "SRTT",
        "RTO",
        "Cwnd est.",
        "Retrans",
        "Lower ->",
        "<- Upper"
    );
    for connection in snapshot.connections() {
        let srtt = match connection.smoothed_rtt() {
            Some(srtt) => format!("{:.1}ms", srtt.as_secs_f64() * 1000.0),
            None => String::from("-"),
        };
        let rto = match connection.retransmission_timeout() {
            Some(rto) => format!("{}ms", rto.as_millis()),
            None => String::from("-"),
        };

        info!(
            "    {:<16} {:<47} {:<12} {:>9} {:>7} {:>10} {:>7} {:>12} {:>12}",
            connection.id(),
            connection.key().to_string(),
            connection.state().name(),
            srtt,
            rto,
            connection.estimated_congestion_window(),
            connection.retransmission_count(),
            connection.bytes(Direction::LowerToUpper),
            connection.bytes(Direction::UpperToLower)
        );
        trace!("    {}", connection);
    }
}
