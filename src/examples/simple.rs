//! One-shot probe of a single SOCKS5 line.
//!
//! cargo run --example simple -- <endpoint> <user> <pass> <target host:port> [echo url]

use line_monitor::socks5;
use line_monitor::Line;
use std::time::{Duration, Instant};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 4 {
        eprintln!("usage: simple <endpoint> <user> <pass> <target host:port> [echo url]");
        std::process::exit(2);
    }
    let echo_url = args.get(4).cloned().unwrap_or_else(|| "https://httpbin.org/ip".to_string());

    let line = Line {
        id: 0,
        trade_name: String::new(),
        ss_user: args[1].clone(),
        ss_pass: args[2].clone(),
        endpoint_addr: args[0].clone(),
        outbound_ip: String::new(),
        node_name: String::new(),
    };

    println!("Dialing {} through {}...", args[3], line.endpoint_addr);
    let reach = socks5::test_reachability(&line, &args[3], 5, Duration::from_secs(10)).await?;
    println!(
        "Reachability: {:.0}% ok, {} ms average",
        reach.success_rate, reach.avg_latency_ms
    );

    // same proxy url the throughput prober hands to curl
    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(line.proxy_url()?)?)
        .timeout(Duration::from_secs(30))
        .build()?;

    println!("Fetching {} through the line...", echo_url);
    let start = Instant::now();
    let response = client.get(&echo_url).send().await?;
    println!("Status: {} in {:?}", response.status(), start.elapsed());
    println!("Response: {}", response.text().await?);

    Ok(())
}
