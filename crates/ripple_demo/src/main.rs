//! Ripple demo
//!
//! Reconciles a list of keys through a sequence of steps and prints the
//! node insertions and removals each step causes.
//!
//! ```text
//! ripple-demo three one,three one,three,five one,two,three,four,five
//! ripple-demo --unkeyed one,two,three two,three
//! ```

use anyhow::Result;
use clap::Parser;
use ripple_core::{ArrayState, ComputableState, NodeContent, NodeId, StateManager};
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

use config::DemoConfig;

#[derive(Parser)]
#[command(name = "ripple-demo")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Print tree events of keyed and unkeyed list reconciliation", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Identify rows by index instead of by key
    #[arg(long)]
    unkeyed: bool,

    /// TOML file with manager settings
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Comma-separated key lists, one per step (an empty string clears the list)
    #[arg(required = true)]
    steps: Vec<String>,
}

type Events = Rc<RefCell<Vec<String>>>;

/// Row of the demo list; the root row reports what happens to its children
struct Row {
    key: String,
    events: Events,
}

impl Row {
    fn new(key: impl Into<String>, events: &Events) -> Self {
        Self {
            key: key.into(),
            events: events.clone(),
        }
    }

    fn record(&self, sign: char, child: &dyn NodeContent) {
        if let Some(child) = child.as_any().downcast_ref::<Row>() {
            self.events.borrow_mut().push(format!("{}{}", sign, child.key));
        }
    }
}

impl NodeContent for Row {
    fn on_child_inserted(&mut self, _child: NodeId, content: &dyn NodeContent) {
        self.record('+', content);
    }

    fn on_child_removed(&mut self, _child: NodeId, content: &dyn NodeContent) {
        self.record('-', content);
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = match &cli.config {
        Some(path) => DemoConfig::load(path)?,
        None => DemoConfig::default(),
    };
    let unkeyed = cli.unkeyed || config.unkeyed;

    info!(
        "Reconciling {} steps ({})",
        cli.steps.len(),
        if unkeyed { "unkeyed" } else { "keyed" }
    );

    let manager = StateManager::with_config(config.manager);
    let events = Events::default();
    let list = manager.array_state(Vec::<String>::new(), Some(true))?;
    let root = render_list(&manager, &list, &events, unkeyed)?;
    root.value()?;

    for (index, step) in cli.steps.iter().enumerate() {
        let keys = parse_step(step);
        list.set(keys.clone())?;
        manager.sync_changes();
        let modified = manager.update_snapshot()?;
        root.value()?;

        let step_events: Vec<String> = events.borrow_mut().drain(..).collect();
        debug!("step {} modified {} states", index + 1, modified);
        println!("[{}] -> {}", keys.join(","), step_events.join(","));
    }

    debug!("{:?}", manager.stats());
    Ok(())
}

fn parse_step(step: &str) -> Vec<String> {
    step.split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .collect()
}

fn render_list(
    manager: &StateManager,
    list: &ArrayState<String>,
    events: &Events,
    unkeyed: bool,
) -> ripple_core::Result<ComputableState<NodeId>> {
    let list = list.clone();
    let row_events = events.clone();
    manager.updatable_node(Row::new("root", events), move |cx| {
        if unkeyed {
            cx.repeat(list.len()?, |cx, index| {
                let key = list.get(index)?.unwrap_or_default();
                let events = row_events.clone();
                cx.attach(
                    move || Row::new(key, &events),
                    |cx, node| {
                        let key = list.get(index)?.unwrap_or_default();
                        cx.with_node_mut::<Row, _>(node, |row| row.key = key)
                    },
                )?;
                Ok(())
            })
        } else {
            cx.repeat_with_key(
                &list.value()?,
                |key, _| key.clone(),
                |cx, key, _| {
                    let events = row_events.clone();
                    cx.attach(move || Row::new(key, &events), |_, _| Ok(()))?;
                    Ok(())
                },
            )
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(steps: &[&str], unkeyed: bool) -> Vec<String> {
        let manager = StateManager::new();
        let events = Events::default();
        let list = manager.array_state(Vec::<String>::new(), Some(true)).unwrap();
        let root = render_list(&manager, &list, &events, unkeyed).unwrap();
        root.value().unwrap();
        steps
            .iter()
            .map(|step| {
                list.set(parse_step(step)).unwrap();
                manager.sync_changes();
                manager.update_snapshot().unwrap();
                root.value().unwrap();
                let step_events: Vec<String> = events.borrow_mut().drain(..).collect();
                step_events.join(",")
            })
            .collect()
    }

    #[test]
    fn test_parse_step() {
        assert_eq!(parse_step("one, two,,three"), vec!["one", "two", "three"]);
        assert!(parse_step("").is_empty());
    }

    #[test]
    fn test_keyed_steps() {
        let output = run(&["three", "one,three", "one,three,five", "one,two,three,four,five"], false);
        assert_eq!(output, vec!["+three", "+one", "+five", "+two,+four"]);
    }

    #[test]
    fn test_unkeyed_steps() {
        let output = run(&["one,two,three", "two,three"], true);
        assert_eq!(output, vec!["+one,+two,+three", "-three"]);
    }

    #[test]
    fn test_cli_parses_steps() {
        let cli = Cli::try_parse_from(["ripple-demo", "--unkeyed", "one", ""]).unwrap();
        assert!(cli.unkeyed);
        assert_eq!(cli.steps, vec!["one", ""]);
    }
}
