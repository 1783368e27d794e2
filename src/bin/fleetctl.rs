use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "fleetctl")]
#[command(about = "Command-line client for the proxy-fleet control API", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8080")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List running proxy instances
    List,
    /// Start a proxy instance
    Create {
        /// Port to bind; probes the configured range when omitted
        #[arg(short, long)]
        port: Option<u16>,
        /// Upstream proxy, host:port
        #[arg(long)]
        upstream: Option<String>,
        #[arg(long)]
        trust_all_servers: bool,
    },
    /// Stop a proxy instance
    Delete { port: u16 },
    /// Start a new HAR session, printing the previous one
    NewHar {
        port: u16,
        #[arg(long)]
        capture_headers: bool,
        #[arg(long)]
        capture_content: bool,
        #[arg(long)]
        capture_binary_content: bool,
        #[arg(long)]
        capture_cookies: bool,
    },
    /// Print the current HAR session
    Har {
        port: u16,
        /// Clear the session after reading it
        #[arg(long)]
        clean: bool,
    },
    /// Print the newest HAR entry, optionally matching a URL pattern
    Recent {
        port: u16,
        #[arg(long)]
        url_pattern: Option<String>,
    },
    /// Block URLs matching a regex
    Block {
        port: u16,
        regex: String,
        #[arg(long, default_value_t = 403)]
        status: u16,
        #[arg(long)]
        method: Option<String>,
    },
    /// Set bandwidth limits (bytes per second) and added latency (ms)
    Limit {
        port: u16,
        #[arg(long)]
        upstream_bps: Option<u64>,
        #[arg(long)]
        downstream_bps: Option<u64>,
        #[arg(long)]
        latency: Option<u64>,
    },
    /// Wait until the instance has been quiet for a while
    Wait {
        port: u16,
        #[arg(long, default_value_t = 500)]
        quiet_ms: u64,
        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let proxy = |port: u16, path: &str| format!("{}/proxy/{}{}", cli.url, port, path);

    let res = match cli.command {
        Commands::List => client.get(format!("{}/proxy", cli.url)).send().await?,
        Commands::Create {
            port,
            upstream,
            trust_all_servers,
        } => {
            let mut query = vec![("trustAllServers", trust_all_servers.to_string())];
            if let Some(port) = port {
                query.push(("port", port.to_string()));
            }
            if let Some(upstream) = upstream {
                query.push(("httpProxy", upstream));
            }
            client.post(format!("{}/proxy", cli.url)).query(&query).send().await?
        }
        Commands::Delete { port } => client.delete(proxy(port, "")).send().await?,
        Commands::NewHar {
            port,
            capture_headers,
            capture_content,
            capture_binary_content,
            capture_cookies,
        } => {
            client
                .put(proxy(port, "/har"))
                .query(&[
                    ("captureHeaders", capture_headers),
                    ("captureContent", capture_content),
                    ("captureBinaryContent", capture_binary_content),
                    ("captureCookies", capture_cookies),
                ])
                .send()
                .await?
        }
        Commands::Har { port, clean } => {
            client
                .get(proxy(port, "/har"))
                .query(&[("cleanHar", clean)])
                .send()
                .await?
        }
        Commands::Recent { port, url_pattern } => {
            let mut request = client.get(proxy(port, "/har/mostRecentEntry"));
            if let Some(pattern) = url_pattern {
                request = request.query(&[("urlPattern", pattern)]);
            }
            request.send().await?
        }
        Commands::Block {
            port,
            regex,
            status,
            method,
        } => {
            let mut query = vec![("regex", regex), ("status", status.to_string())];
            if let Some(method) = method {
                query.push(("method", method));
            }
            client.put(proxy(port, "/blocklist")).query(&query).send().await?
        }
        Commands::Limit {
            port,
            upstream_bps,
            downstream_bps,
            latency,
        } => {
            let query: Vec<(&str, u64)> = [
                ("upstreamBps", upstream_bps),
                ("downstreamBps", downstream_bps),
                ("latency", latency),
            ]
            .into_iter()
            .filter_map(|(name, value)| value.map(|v| (name, v)))
            .collect();
            client.put(proxy(port, "/limit")).query(&query).send().await?
        }
        Commands::Wait {
            port,
            quiet_ms,
            timeout_ms,
        } => {
            client
                .put(proxy(port, "/wait"))
                .query(&[("quietPeriodInMs", quiet_ms), ("timeoutInMs", timeout_ms)])
                .send()
                .await?
        }
    };

    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: control API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let text = res.text().await?;
    if text.is_empty() {
        println!("{}", status);
        return Ok(());
    }
    match serde_json::from_str::<Value>(&text) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", text),
    }
    Ok(())
}
