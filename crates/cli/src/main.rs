use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use tavola_api::{FeatureSource, GridCoordinator, WfsSource};
use tavola_core::{
    DataSource, Filter, FilterFormat, FilterRef, GridConfig, PageRange, PaginationOptions,
    SortOptions, SortOrder,
};

#[derive(Parser, Debug)]
#[command(name = "tavolactl", version, about = "Tavola CLI (M0)")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch and print the feature-type schema for a WFS endpoint
    Describe {
        /// Service URL, e.g. "https://demo.geo-solutions.it/geoserver/wfs"
        url: String,
        /// Feature type name, e.g. "topp:states"
        name: String,
    },
    /// Fetch one page window of features
    Fetch {
        url: String,
        name: String,
        /// First page of the window
        #[arg(long = "page", default_value_t = 0)]
        page: usize,
        /// Last page of the window (defaults to --page)
        #[arg(long = "end-page")]
        end_page: Option<usize>,
        /// Rows per page
        #[arg(long = "size", default_value_t = 20)]
        size: usize,
        /// CQL filter expression
        #[arg(long = "cql")]
        cql: Option<String>,
        /// Sort attribute, "ATTR" ascending or "ATTR:d" descending
        #[arg(long = "sort")]
        sort: Option<String>,
        /// Comma-separated property selection
        #[arg(long = "props")]
        props: Option<String>,
    },
    /// Drive a grid coordinator through a scripted scroll session
    Scroll {
        url: String,
        name: String,
        /// Comma-separated page ranges, e.g. "0:1,4:5,2:3"
        #[arg(long = "ranges", default_value = "0:0")]
        ranges: String,
        /// Rows per page
        #[arg(long = "size", default_value_t = 20)]
        size: usize,
        /// Retained page bound
        #[arg(long = "max-stored", default_value_t = 5)]
        max_stored: usize,
        /// CQL filter expression
        #[arg(long = "cql")]
        cql: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("TAVOLA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TAVOLA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid TAVOLA_METRICS_ADDR; metrics disabled");
        }
    }
}

fn parse_sort(arg: &str) -> Result<SortOptions> {
    let (attr, dir) = match arg.split_once(':') {
        Some((a, d)) => (a, d),
        None => (arg, "a"),
    };
    if attr.is_empty() {
        bail!("empty sort attribute");
    }
    let order = match dir {
        "a" | "A" => SortOrder::Ascending,
        "d" | "D" => SortOrder::Descending,
        other => bail!("invalid sort direction: {other} (expect a or d)"),
    };
    Ok(SortOptions { sort_by: attr.to_string(), order })
}

fn parse_ranges(arg: &str) -> Result<Vec<PageRange>> {
    let mut out = Vec::new();
    for part in arg.split(',').filter(|s| !s.is_empty()) {
        let range = match part.split_once(':') {
            Some((a, b)) => {
                let start: usize = a.parse().map_err(|_| anyhow!("bad range: {part}"))?;
                let end: usize = b.parse().map_err(|_| anyhow!("bad range: {part}"))?;
                if end < start {
                    bail!("bad range: {part} (end before start)");
                }
                PageRange::new(start, end)
            }
            None => PageRange::single(part.parse().map_err(|_| anyhow!("bad range: {part}"))?),
        };
        out.push(range);
    }
    if out.is_empty() {
        bail!("no ranges given");
    }
    Ok(out)
}

fn cql_filter(cql: Option<String>) -> Option<FilterRef> {
    cql.map(|body| Arc::new(Filter { format: FilterFormat::Cql, body }))
}

fn feature_line(row: usize, feature: &tavola_core::Feature) -> String {
    let id = feature.id.as_deref().unwrap_or("-");
    let props: Vec<String> = feature
        .properties
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    format!("{row:>8}  {id:<24} {}", props.join(" "))
}

async fn wait_settled(coordinator: &GridCoordinator) -> Result<()> {
    for _ in 0..600 {
        if !coordinator.snapshot().loading {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    bail!("coordinator did not settle in time")
}

async fn run_describe(output: Output, url: String, name: String) -> Result<()> {
    let config = GridConfig::from_env();
    let source = WfsSource::new(&config).map_err(|e| anyhow!(e.to_string()))?;
    let ds = DataSource::new(url, name);
    let schema = source.describe(&ds).await.map_err(|e| anyhow!(e.to_string()))?;
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&schema)?),
        Output::Human => {
            println!("type: {}", schema.type_name);
            println!("geometry: {}", schema.spatial_attribute());
            for a in &schema.attributes {
                println!("  {:<24} {:?}{}", a.name, a.attr_type, if a.nillable { "" } else { " (required)" });
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_fetch(
    output: Output,
    url: String,
    name: String,
    page: usize,
    end_page: Option<usize>,
    size: usize,
    cql: Option<String>,
    sort: Option<String>,
    props: Option<String>,
) -> Result<()> {
    let config = GridConfig::from_env();
    let source = WfsSource::new(&config).map_err(|e| anyhow!(e.to_string()))?;
    let mut ds = DataSource::new(url, name);
    if let Some(p) = props {
        ds.properties = Some(p.split(',').map(|s| s.trim().to_string()).collect());
    }
    let filter = cql_filter(cql);
    let sort = sort.as_deref().map(parse_sort).transpose()?;
    let range = PageRange::new(page, end_page.unwrap_or(page));
    let window = PaginationOptions::new(range.start_page * size, range.pages() * size);
    let result = source
        .fetch_page(&ds, filter.as_deref(), window, sort.as_ref())
        .await
        .map_err(|e| anyhow!(e.to_string()))?;
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        Output::Human => {
            println!(
                "rows {}..{} of {}",
                window.start_index,
                window.start_index + result.features.len(),
                result.total_features.map(|t| t.to_string()).unwrap_or_else(|| "?".into())
            );
            for (i, f) in result.features.iter().enumerate() {
                println!("{}", feature_line(window.start_index + i, f));
            }
        }
    }
    Ok(())
}

async fn run_scroll(
    output: Output,
    url: String,
    name: String,
    ranges: String,
    size: usize,
    max_stored: usize,
    cql: Option<String>,
) -> Result<()> {
    let mut config = GridConfig::from_env();
    config.page_size = size;
    config.max_stored_pages = max_stored;
    let source: Arc<dyn FeatureSource> =
        Arc::new(WfsSource::new(&config).map_err(|e| anyhow!(e.to_string()))?);
    let coordinator = GridCoordinator::new(source, config.clone());
    let script = parse_ranges(&ranges)?;

    coordinator.set_view(DataSource::new(url, name), cql_filter(cql));
    wait_settled(&coordinator).await?;

    for range in script {
        coordinator.more_features(range);
        wait_settled(&coordinator).await?;
        let snap = coordinator.snapshot();
        if let Some(err) = &snap.error {
            warn!(error = %err, "scroll step failed");
            continue;
        }
        match output {
            Output::Json => {
                println!(
                    "{}",
                    serde_json::json!({
                        "requested": {"start": range.start_page, "end": range.end_page},
                        "resident_pages": snap.pages,
                        "total": snap.total_features,
                    })
                );
            }
            Output::Human => {
                println!(
                    "[{}..{}] resident pages {:?} (total {})",
                    range.start_page,
                    range.end_page,
                    snap.pages,
                    snap.total_features.map(|t| t.to_string()).unwrap_or_else(|| "?".into())
                );
                for page in range.iter() {
                    let row = page * config.page_size;
                    if let Some(f) = snap
                        .pages
                        .iter()
                        .position(|p| *p == page)
                        .and_then(|slot| snap.features[slot * config.page_size].as_ref())
                    {
                        println!("{}", feature_line(row, f));
                    }
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    match cli.command {
        Commands::Describe { url, name } => run_describe(cli.output, url, name).await,
        Commands::Fetch { url, name, page, end_page, size, cql, sort, props } => {
            run_fetch(cli.output, url, name, page, end_page, size, cql, sort, props).await
        }
        Commands::Scroll { url, name, ranges, size, max_stored, cql } => {
            run_scroll(cli.output, url, name, ranges, size, max_stored, cql).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_range_scripts() {
        let r = parse_ranges("0:1,4,2:3").unwrap();
        assert_eq!(r.len(), 3);
        assert_eq!(r[0], PageRange::new(0, 1));
        assert_eq!(r[1], PageRange::single(4));
        assert_eq!(r[2], PageRange::new(2, 3));
        assert!(parse_ranges("3:1").is_err());
        assert!(parse_ranges("").is_err());
    }

    #[test]
    fn parses_sort_argument() {
        let s = parse_sort("STATE_NAME").unwrap();
        assert_eq!(s.order, SortOrder::Ascending);
        let s = parse_sort("PERSONS:d").unwrap();
        assert_eq!(s.order, SortOrder::Descending);
        assert!(parse_sort(":d").is_err());
    }
}
