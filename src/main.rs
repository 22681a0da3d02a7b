extern crate clap;

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use colored::Colorize;
use proxy_speed::bench::DEFAULT_LIVENESS_URL;
use proxy_speed::errors::exit_codes;
use proxy_speed::{DirectProxy, Proxy, ProxyResult, TestConfig, TestEngine};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const MIB: f64 = 1024.0 * 1024.0;

#[derive(Parser)]
#[command(author, version = version(), about, long_about = None)]
struct Cli {
    /// Payload URL, `{bytes}` is replaced with the chunk size
    #[arg(short, long, default_value = DEFAULT_LIVENESS_URL)]
    liveness: String,

    /// Total bytes downloaded per proxy
    #[arg(long, default_value_t = 100 * 1024 * 1024)]
    size: u64,

    /// Deadline per download worker and per probe, e.g. "5s" or "1500ms"
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    timeout: Duration,

    /// Download workers per proxy
    #[arg(short, long, default_value_t = 4)]
    concurrent: usize,

    /// Comma separated ipinfo.io tokens
    #[arg(long, value_delimiter = ',')]
    ip_tokens: Vec<String>,

    /// Latency probes per proxy, 0 disables probing
    #[arg(long, default_value_t = 0)]
    probes: usize,

    /// Only probe latency, skip the download
    #[arg(long)]
    fast: bool,

    /// Proxies tested at once
    #[arg(long, default_value_t = 1)]
    parallel: usize,

    /// Only test proxies whose name matches this regex
    #[arg(short, long)]
    filter: Option<String>,

    /// Print results as JSON lines
    #[arg(long)]
    json: bool,

    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

fn version() -> &'static str {
    match option_env!("PROXYSPEED_BUILD_GIT_HASH") {
        Some(hash) => {
            let version = format!("{} ({})", env!("CARGO_PKG_VERSION"), hash);
            Box::leak(version.into_boxed_str())
        }
        None => env!("CARGO_PKG_VERSION"),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let json = cli.json;

    env_logger::Builder::new()
        .filter_level(cli.verbose.log_level_filter())
        .init();

    let mut config = TestConfig::default()
        .with_liveness_url(cli.liveness)
        .with_download_size(cli.size)
        .with_timeout(cli.timeout)
        .with_concurrency(cli.concurrent)
        .with_geo_tokens(
            cli.ip_tokens
                .into_iter()
                .map(|token| token.trim().to_string())
                .filter(|token| !token.is_empty())
                .collect(),
        )
        .with_probe_count(cli.probes)
        .with_fast(cli.fast)
        .with_proxy_parallelism(cli.parallel);
    if let Some(filter) = cli.filter {
        config = config.with_name_filter(filter);
    }

    let engine = match TestEngine::new(config) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("{} {}", "error:".bold().red(), e);
            process::exit(e.exit_code());
        }
    };

    let proxies: Vec<Arc<dyn Proxy>> =
        vec![Arc::new(DirectProxy::default())];
    let (tx, mut rx) = mpsc::channel(proxies.len());

    let printer = tokio::spawn(async move {
        while let Some(result) = rx.recv().await {
            if json {
                match serde_json::to_string(&result) {
                    Ok(line) => println!("{}", line),
                    Err(e) => log::error!("failed to encode result: {}", e),
                }
            } else {
                print_result(&result);
            }
        }
    });

    let interrupted = tokio::select! {
        _ = engine.run(proxies, tx) => false,
        _ = tokio::signal::ctrl_c() => {
            log::warn!("interrupted, reporting finished proxies only");
            true
        }
    };

    if let Err(e) = printer.await {
        eprintln!("{} {}", "error:".bold().red(), e);
        process::exit(exit_codes::UNKNOWN_ERROR);
    }

    if interrupted {
        process::exit(exit_codes::INTERRUPTED);
    }
    process::exit(exit_codes::SUCCESS);
}

fn print_result(result: &ProxyResult) {
    let bandwidth = if result.is_failed() {
        "N/A".red()
    } else {
        let mib = result.bandwidth / MIB;
        let text = format!("{:.2} MiB/s", mib);
        if mib < 1.0 {
            text.red()
        } else if mib > 10.0 {
            text.green()
        } else {
            text.normal()
        }
    };

    let mut line = format!(
        "{} {} {} {} {}",
        result.name.bold().white(),
        format!("[{}]", result.proxy_type).bright_blue(),
        bandwidth,
        format!("ttfb {} ms", result.ttfb.as_millis()).bright_cyan(),
        format!("{} {}", result.country_code, result.ip).bright_blue(),
    );

    if let Some(latency) = result.latency {
        line.push_str(&format!(" latency {} ms", latency.as_millis()));
    }
    if let Some(jitter) = result.jitter {
        line.push_str(&format!(" jitter {} ms", jitter.as_millis()));
    }
    if let Some(loss) = result.packet_loss {
        line.push_str(&format!(" loss {:.1}%", loss));
    }

    println!("{}", line);
}
