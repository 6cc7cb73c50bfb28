use anyhow::{bail, Context, Result};
use chrono::{Duration, NaiveDateTime};
use clap::{Args, Parser, Subcommand};
use comfy_table::{Cell, Table};
use format_num::format_num;
use posix_cli_utils::*;
use std::io::{stdout, Write};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sacct_usage::record::{parse_timestamp, TIMESTAMP_FORMAT};
use sacct_usage::{
    aggregate_series, aggregate_totals, bucket_width, exclude_nodes, expand_nodelist, parse_duration,
    read_accounting_log, summarize_users, ClusterProfile, Coverage, Job, JobLog, ResourceKind, Window,
};

/// Attribute CPU and GPU usage from a Slurm accounting dump to users.
///
/// The input is the output of `sacct -p` (or `sacct -P`) with at least the columns JobID,
/// JobName, User, NodeList, ElapsedRaw, AllocCPUS, CPUTimeRAW, MaxRSS, State, Start, End and
/// ReqTRES.
#[derive(Parser, Debug)]
#[clap(name = "sacct-usage")]
struct ClArgs {
    #[clap(subcommand)]
    command: Command,

    /// Field delimiter of the input.
    #[clap(short = 'd', long = "delimiter", default_value = "|", global = true)]
    delimiter: String,

    /// Drop jobs that ran on any of these nodes, e.g. `node[01-04],gpu07`.
    #[clap(long, global = true)]
    exclude_nodes: Option<String>,

    /// Write JSON instead of a table.
    #[clap(long, global = true)]
    json: bool,

    /// Log debugging output to STDERR.  RUST_LOG is used otherwise.
    #[clap(short, long, global = true)]
    verbose: bool,

    #[clap(flatten)]
    profile: ProfileArgs,
}

#[derive(Args, Debug)]
struct ProfileArgs {
    /// Cluster profile (JSON).  Defaults to `cluster.json` in the user config directory.
    #[clap(long, parse(from_os_str), global = true)]
    profile: Option<PathBuf>,

    /// Number of nodes in the cluster.
    #[clap(long, global = true)]
    nodes: Option<u64>,

    /// CPUs per node.
    #[clap(long, global = true)]
    cpus_per_node: Option<u64>,

    /// GPUs per node.
    #[clap(long, global = true)]
    gpus_per_node: Option<u64>,
}

#[derive(Args, Debug)]
struct Source {
    /// Path to accounting dump, defaults to STDIN.
    filename: Option<String>,
}

#[derive(Args, Debug)]
struct WindowArgs {
    /// Window start (YYYY-MM-DDTHH:MM:SS).  Defaults to the earliest job start.
    #[clap(long, parse(try_from_str = parse_timestamp))]
    start: Option<NaiveDateTime>,

    /// Window end (YYYY-MM-DDTHH:MM:SS).  Defaults to the latest job end.
    #[clap(long, parse(try_from_str = parse_timestamp))]
    end: Option<NaiveDateTime>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the reconstructed jobs as JSON lines.
    Jobs {
        #[clap(flatten)]
        source: Source,
    },
    /// Per-user usage of one resource over a window.
    Totals {
        #[clap(flatten)]
        source: Source,
        #[clap(flatten)]
        window: WindowArgs,
        /// Resource to aggregate (cpu or gpu).
        #[clap(short, long, default_value = "cpu")]
        resource: ResourceKind,
    },
    /// Job counts and CPU/GPU usage of every user over a window.
    Summary {
        #[clap(flatten)]
        source: Source,
        #[clap(flatten)]
        window: WindowArgs,
        /// Resource to sort users by (cpu or gpu).
        #[clap(long, default_value = "cpu")]
        sort: ResourceKind,
    },
    /// Usage of one resource in consecutive buckets across a window.
    Series {
        #[clap(flatten)]
        source: Source,
        #[clap(flatten)]
        window: WindowArgs,
        /// Bucket width, e.g. `1d`, `6h`, `1-00:00:00`.
        #[clap(short, long, parse(try_from_str = parse_duration))]
        interval: u64,
        /// Resource to aggregate (cpu or gpu).
        #[clap(short, long, default_value = "cpu")]
        resource: ResourceKind,
    },
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn read_log(source: &Source, delimiter: &str) -> Result<JobLog> {
    let log = match Input::default_stdin(source.filename.as_ref())?.buffered() {
        Input::File(input) => read_accounting_log(input, delimiter),
        Input::Stdin(input) => read_accounting_log(input.lock(), delimiter),
    };
    log.context("failed to read accounting log")
}

/// Command-line sizes take precedence over the profile file.
fn resolve_profile(args: &ProfileArgs) -> Result<Option<ClusterProfile>> {
    let base = ClusterProfile::load(args.profile.as_deref())?;
    let nodes = args.nodes.or(base.map(|p| p.nodes));
    let cpus_per_node = args.cpus_per_node.or(base.map(|p| p.cpus_per_node));
    let gpus_per_node = args
        .gpus_per_node
        .or(base.map(|p| p.gpus_per_node))
        .unwrap_or(0);
    match (nodes, cpus_per_node) {
        (Some(nodes), Some(cpus_per_node)) => Ok(Some(ClusterProfile {
            nodes,
            cpus_per_node,
            gpus_per_node,
        })),
        (None, None) => Ok(None),
        _ => bail!("--nodes and --cpus-per-node must be given together"),
    }
}

fn resolve_window(args: &WindowArgs, coverage: &Coverage) -> Result<Window> {
    let mintime = args.start.or(coverage.earliest_start);
    let maxtime = args.end.or(coverage.latest_end);
    match (mintime, maxtime) {
        (Some(mintime), Some(maxtime)) => Ok(Window::new(mintime, maxtime)?),
        _ => bail!("no finished jobs in the log, --start and --end are required"),
    }
}

fn hours(seconds: f64) -> String {
    format_num!(",.1", seconds / 3600.)
}

/// Usage in hours, followed by its share of capacity when the cluster size is known.
fn usage_cells(
    profile: Option<&ClusterProfile>,
    kind: ResourceKind,
    window: &Window,
    usage: f64,
) -> Vec<Cell> {
    let mut cells = vec![Cell::new(hours(usage))];
    if let Some(p) = profile {
        let pct = match p.percent_allocated(kind, window, usage) {
            Some(pct) => format!("{:.1}%", pct),
            None => "--".to_string(),
        };
        cells.push(Cell::new(pct));
    }
    cells
}

fn usage_header(profile: Option<&ClusterProfile>, kind: ResourceKind) -> Vec<String> {
    let mut header = vec![format!("{} hours", kind)];
    if profile.is_some() {
        header.push(format!("% {} capacity", kind));
    }
    header
}

fn timestamp(t: NaiveDateTime) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

fn print_window(window: &Window) {
    println!(
        "Window: {} to {} ({:.1} days)",
        timestamp(window.mintime),
        timestamp(window.maxtime),
        window.duration().num_seconds() as f64 / 86400.
    );
}

fn write_json_lines<T: serde::Serialize>(items: impl IntoIterator<Item = T>) -> Result<()> {
    let stdout = stdout();
    let mut out = stdout.lock();
    for item in items {
        serde_json::to_writer(&mut out, &item)?;
        out.write_all(b"\n")?;
    }
    Ok(())
}

fn print_totals(
    jobs: &[Job],
    window: &Window,
    kind: ResourceKind,
    profile: Option<&ClusterProfile>,
    json: bool,
) -> Result<()> {
    let mut totals: Vec<_> = aggregate_totals(jobs, window, kind)?.into_iter().collect();
    totals.sort_by(|a, b| b.1.total_cmp(&a.1));
    if json {
        return write_json_lines(totals);
    }

    print_window(window);
    let mut t = Table::new();
    let mut header = vec!["User".to_string()];
    header.extend(usage_header(profile, kind));
    t.set_header(header);
    let mut sum = 0.;
    for (user, usage) in &totals {
        sum += usage;
        let mut row = vec![Cell::new(user)];
        row.extend(usage_cells(profile, kind, window, *usage));
        t.add_row(row);
    }
    let mut row = vec![Cell::new("all_users")];
    row.extend(usage_cells(profile, kind, window, sum));
    t.add_row(row);
    println!("{}", &t);
    Ok(())
}

fn print_summary(
    jobs: &[Job],
    window: &Window,
    sort: ResourceKind,
    profile: Option<&ClusterProfile>,
    json: bool,
) -> Result<()> {
    let users = summarize_users(jobs, window, sort)?;
    if json {
        return write_json_lines(&users);
    }

    print_window(window);
    let mut t = Table::new();
    let mut header = vec!["User".to_string(), "Jobs".to_string()];
    header.extend(usage_header(profile, ResourceKind::Cpu));
    header.extend(usage_header(profile, ResourceKind::Gpu));
    t.set_header(header);
    let row = |name: &str, njobs: usize, cpu: f64, gpu: f64| {
        let mut row = vec![Cell::new(name), Cell::new(njobs)];
        row.extend(usage_cells(profile, ResourceKind::Cpu, window, cpu));
        row.extend(usage_cells(profile, ResourceKind::Gpu, window, gpu));
        row
    };
    let (mut njobs, mut cpu, mut gpu) = (0, 0., 0.);
    for u in &users {
        njobs += u.jobs;
        cpu += u.cpu_seconds;
        gpu += u.gpu_seconds;
        t.add_row(row(&u.user, u.jobs, u.cpu_seconds, u.gpu_seconds));
    }
    t.add_row(row("all_users", njobs, cpu, gpu));
    println!("{}", &t);
    Ok(())
}

fn print_series(
    jobs: &[Job],
    window: &Window,
    width: Duration,
    kind: ResourceKind,
    profile: Option<&ClusterProfile>,
    json: bool,
) -> Result<()> {
    let series = aggregate_series(jobs, window, width, kind)?;
    if json {
        return write_json_lines(&series);
    }

    print_window(window);
    let mut t = Table::new();
    let mut header = vec!["Start".to_string(), "End".to_string()];
    header.extend(usage_header(profile, kind));
    header.push("Active users".to_string());
    t.set_header(header);
    for b in &series {
        let mut row = vec![
            Cell::new(timestamp(b.window.mintime)),
            Cell::new(timestamp(b.window.maxtime)),
        ];
        row.extend(usage_cells(profile, kind, &b.window, b.total));
        row.push(Cell::new(b.active_users()));
        t.add_row(row);
    }
    println!("{}", &t);
    Ok(())
}

fn main() -> Result<()> {
    reset_sigpipe();
    let args = ClArgs::parse();
    init_logging(args.verbose);

    let source = match &args.command {
        Command::Jobs { source }
        | Command::Totals { source, .. }
        | Command::Summary { source, .. }
        | Command::Series { source, .. } => source,
    };
    let JobLog { jobs, coverage } = read_log(source, &args.delimiter)?;
    let mut profile = resolve_profile(&args.profile)?;

    let jobs = match &args.exclude_nodes {
        Some(list) => {
            let nodes = expand_nodelist(list)
                .with_context(|| format!("invalid node list for --exclude-nodes: {}", list))?;
            profile = profile.map(|p| p.without_nodes(nodes.len()));
            info!(?profile, "capacity reduced by excluded nodes");
            exclude_nodes(jobs, &nodes)
        }
        None => jobs,
    };

    match &args.command {
        Command::Jobs { .. } => write_json_lines(&jobs),
        Command::Totals {
            window, resource, ..
        } => {
            let window = resolve_window(window, &coverage)?;
            print_totals(&jobs, &window, *resource, profile.as_ref(), args.json)
        }
        Command::Summary { window, sort, .. } => {
            let window = resolve_window(window, &coverage)?;
            print_summary(&jobs, &window, *sort, profile.as_ref(), args.json)
        }
        Command::Series {
            window,
            interval,
            resource,
            ..
        } => {
            let window = resolve_window(window, &coverage)?;
            let width = bucket_width(*interval)
                .with_context(|| format!("invalid --interval: {} seconds", interval))?;
            print_series(&jobs, &window, width, *resource, profile.as_ref(), args.json)
        }
    }
}
