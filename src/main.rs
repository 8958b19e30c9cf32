//! parsedebug CLI
//!
//! Opens a trace capture, waits for it to load and prints the parse tree,
//! rule statistics or a single node.

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use colored::Colorize;
use env_logger::Env;
use parsedebug::{
    format_nanos, Config, LoadEvent, NodeId, PollOutcome, Session, TreeItem, ROOT_NODE,
};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Inspect parser trace captures
#[derive(Parser, Debug)]
#[command(name = "parsedebug")]
#[command(version, about = "Post-mortem debugger for parser traces", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show capture and input summary
    Info {
        /// Trace capture (zip)
        trace: PathBuf,
    },

    /// Print the parse tree
    Tree {
        trace: PathBuf,

        /// Node to start from
        #[arg(short, long, default_value_t = ROOT_NODE)]
        node: NodeId,

        /// Maximum depth below the start node
        #[arg(short, long)]
        depth: Option<u32>,
    },

    /// Per-rule statistics, busiest first
    Rules {
        trace: PathBuf,

        /// Aggregate by matcher class instead of by rule
        #[arg(long)]
        by_class: bool,
    },

    /// Invocations per matcher type
    Types { trace: PathBuf },

    /// Show one node and the input it matched
    Node { trace: PathBuf, id: NodeId },

    /// Generate shell completions
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    match cli.command {
        Command::Info { trace } => info(&open(&trace)?, cli.json),
        Command::Tree { trace, node, depth } => tree(&open(&trace)?, node, depth, cli.json),
        Command::Rules { trace, by_class } => rules(&open(&trace)?, by_class, cli.json),
        Command::Types { trace } => types(&open(&trace)?, cli.json),
        Command::Node { trace, id } => node(&open(&trace)?, id, cli.json),
        Command::Completion { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "parsedebug", &mut io::stdout());
            Ok(())
        }
    }
}

/// Open `trace` and wait for it to load, reporting progress on stderr
fn open(trace: &Path) -> Result<Session> {
    let session = Session::open(trace, &Config::load())
        .with_context(|| format!("Unable to open {}", trace.display()))?;

    let mut shown = false;
    let outcome = session.poll_load(|event| match event {
        LoadEvent::Started { total } => {
            eprint!("Loading {} ({} records)", trace.display(), total);
            shown = true;
        }
        LoadEvent::Progress { total, current } => {
            let percent = if *total == 0 { 100 } else { current * 100 / total };
            eprint!("\rLoading {}: {}/{} ({}%)", trace.display(), current, total, percent);
            let _ = io::stderr().flush();
        }
        LoadEvent::Complete | LoadEvent::Failed { .. } => {}
    });
    if shown {
        eprintln!();
    }

    match outcome {
        PollOutcome::Complete | PollOutcome::AlreadyReady => Ok(session),
        PollOutcome::Failed => {
            let message = session
                .load_status()
                .error
                .unwrap_or_else(|| "unknown error".to_string());
            bail!("Loading {} failed: {}", trace.display(), message)
        }
        PollOutcome::Cancelled => bail!("Loading {} was cancelled", trace.display()),
    }
}

fn status_label(success: bool) -> colored::ColoredString {
    if success {
        "SUCCESS".green()
    } else {
        "FAILURE".red()
    }
}

fn info(session: &Session, json: bool) -> Result<()> {
    let info = session.parse_info();
    let input = session.input().info();
    let parse_time = session.statistics().total_parse_time()?;

    if json {
        let out = serde_json::json!({
            "trace": session.to_string(),
            "parse_info": info,
            "input": input,
            "total_parse_time_nanos": parse_time,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("{}", session.to_string().cyan().bold());
    println!("  Captured:      {}", info.capture_date.to_rfc3339());
    println!("  Rules:         {}", info.nr_matchers);
    println!("  Invocations:   {}", info.nr_nodes);
    println!("  Tree depth:    {}", info.tree_depth);
    println!("  Parse time:    {}", format_nanos(parse_time));
    println!(
        "  Input:         {} lines, {} chars, {} code points",
        input.nr_lines, input.nr_chars, input.nr_code_points
    );
    Ok(())
}

fn tree(session: &Session, node: NodeId, depth: Option<u32>, json: bool) -> Result<()> {
    let item = session.tree().expand(node, depth)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&item)?);
        return Ok(());
    }
    print_tree(&item, 0);
    Ok(())
}

fn print_tree(item: &TreeItem, indent: usize) {
    let node = &item.node;
    let elided = if node.has_children() && item.children.is_empty() {
        format!(" (+{})", node.children.len()).dimmed().to_string()
    } else {
        String::new()
    };
    println!(
        "{}{} {} [{}..{}] {}{}",
        "  ".repeat(indent),
        node.rule.name.bold(),
        status_label(node.success),
        node.start,
        node.end,
        format_nanos(node.nanos).dimmed(),
        elided
    );
    for child in &item.children {
        print_tree(child, indent + 1);
    }
}

fn rules(session: &Session, by_class: bool, json: bool) -> Result<()> {
    let stats = session.statistics();
    if by_class {
        let classes = stats.rules_by_class()?;
        if json {
            println!("{}", serde_json::to_string_pretty(&classes)?);
            return Ok(());
        }
        println!(
            "{:<32} {:>10} {:>8} {:>12} {:>12}",
            "CLASS", "CALLS", "SUCCESS", "TOTAL", "AVERAGE"
        );
        for c in classes {
            println!(
                "{:<32} {:>10} {:>7.1}% {:>12} {:>12}",
                c.class_name,
                c.invocations,
                c.success_rate * 100.0,
                format_nanos(c.total_nanos),
                format_nanos(c.average_nanos)
            );
        }
        return Ok(());
    }

    let rules = stats.rule_statistics()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&rules)?);
        return Ok(());
    }
    println!(
        "{:<24} {:<24} {:<10} {:>10} {:>8} {:>12} {:>12}",
        "RULE", "CLASS", "TYPE", "CALLS", "SUCCESS", "TOTAL", "AVERAGE"
    );
    for r in rules {
        println!(
            "{:<24} {:<24} {:<10} {:>10} {:>7.1}% {:>12} {:>12}",
            r.name,
            r.class_name,
            r.matcher_type.to_string(),
            r.invocations,
            r.success_rate * 100.0,
            format_nanos(r.total_nanos),
            format_nanos(r.average_nanos)
        );
    }
    Ok(())
}

fn types(session: &Session, json: bool) -> Result<()> {
    let by_type = session.statistics().matchers_by_type()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&by_type)?);
        return Ok(());
    }
    for (matcher_type, count) in by_type {
        println!("{:<10} {:>10}", matcher_type.to_string(), count);
    }
    Ok(())
}

fn node(session: &Session, id: NodeId, json: bool) -> Result<()> {
    let node = session.tree().node(id)?;
    let input = session.input();
    let start = input.position(node.start.min(input.len()))?;
    let end = input.position(node.end.min(input.len()))?;
    let fragments = session.node_fragments(id)?;

    if json {
        let out = serde_json::json!({
            "node": node,
            "start_position": start,
            "end_position": end,
            "fragments": fragments,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("{} {}", format!("#{}", node.id).cyan(), node);
    println!("  Rule:      {} ({}, {})", node.rule.name, node.rule.class_name, node.rule.matcher_type);
    println!("  Level:     {}", node.level);
    if let Some(parent) = node.parent {
        println!("  Parent:    #{}", parent);
    }
    println!("  Children:  {}", node.children.len());
    println!("  Start:     {} ({})", node.start, start);
    println!("  End:       {} ({})", node.end, end);
    println!("  Time:      {}", format_nanos(node.nanos));
    println!(
        "  Match:     {}{}{}",
        fragments.before_match.dimmed(),
        fragments.matched.yellow().bold(),
        fragments.after_match.dimmed()
    );
    Ok(())
}
