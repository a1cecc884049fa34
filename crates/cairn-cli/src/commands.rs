use std::fs::File;
use std::io::{self, BufWriter, Write};

use anyhow::{anyhow, Context};
use cairn_db::{AnyTable, Db, Txn};
use cairn_server::CairnServer;
use colored::Colorize;
use tokio::sync::watch;
use tracing::info;

use crate::changes;
use crate::cli::*;
use crate::config::CairnConfig;
use crate::document::{Document, DocumentTable};
use crate::source::{self, SourceSync, SyncReport};

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = CairnConfig::load(&cli.config)?;
    match cli.command {
        Command::Serve(args) => cmd_serve(config, args),
        Command::Check(_) => cmd_check(config),
        Command::Dump(args) => cmd_dump(config, args),
    }
}

/// A database with every configured table registered.
pub struct Host {
    pub db: Db,
    pub tables: Vec<DocumentTable>,
}

impl Host {
    pub fn open(config: &CairnConfig) -> anyhow::Result<Self> {
        let db = Db::new(config.db.clone())?;
        let tables: Vec<DocumentTable> = config
            .table
            .iter()
            .cloned()
            .map(DocumentTable::new)
            .collect();
        let refs: Vec<&dyn AnyTable> = tables.iter().map(|t| t.table() as &dyn AnyTable).collect();
        db.register_tables(&refs).context("registering tables")?;
        info!(tables = tables.len(), "opened database");
        Ok(Self { db, tables })
    }

    fn source_syncs(&self) -> impl Iterator<Item = SourceSync> + '_ {
        self.tables.iter().filter_map(|t| {
            t.config()
                .source
                .as_ref()
                .map(|path| SourceSync::new(self.db.clone(), t.clone(), path))
        })
    }

    /// Load every source once, failing on the first bad one.
    pub fn load_sources(&self) -> anyhow::Result<Vec<(String, SyncReport)>> {
        self.source_syncs()
            .map(|mut sync| -> anyhow::Result<(String, SyncReport)> {
                let report = sync.sync_once()?.unwrap_or_default();
                Ok((sync.table_name().to_string(), report))
            })
            .collect()
    }
}

fn cmd_check(config: CairnConfig) -> anyhow::Result<()> {
    let host = Host::open(&config)?;
    let loaded = host.load_sources()?;
    let txn = host.db.read_txn();
    for info in txn.tables() {
        let indexes: Vec<String> = info
            .indexes
            .iter()
            .map(|i| if i.unique { i.name.clone() } else { format!("{}*", i.name) })
            .collect();
        println!(
            "{} {} objects, revision {}, indexes [{}]",
            info.name.bold(),
            info.objects.to_string().cyan(),
            info.revision,
            indexes.join(", ")
        );
        if let Some((_, report)) = loaded.iter().find(|(name, _)| *name == info.name) {
            println!("  source: {} documents loaded", report.inserted.to_string().green());
        }
    }
    println!("{} {} tables OK", "✓".green().bold(), host.tables.len());
    Ok(())
}

fn cmd_dump(config: CairnConfig, args: DumpArgs) -> anyhow::Result<()> {
    let host = Host::open(&config)?;
    host.load_sources()?;
    let out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        )),
        None => Box::new(io::stdout().lock()),
    };
    let lookup = match (&args.index, &args.value) {
        (Some(index), Some(value)) => Some((index.as_str(), parse_value(value))),
        _ => None,
    };
    match lookup {
        Some((index, value)) => {
            let name = args.table.as_deref().unwrap_or_default();
            let table = host
                .tables
                .iter()
                .find(|t| t.name() == name)
                .ok_or_else(|| anyhow!("no table named {name}"))?;
            dump_lookup(&host.db, table, index, &value, out)
        }
        None => dump(&host.db, args.table.as_deref(), out),
    }
}

/// A command-line value as JSON, or as a plain string when it does not
/// parse.
fn parse_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

/// Write one table's objects, or every table, as pretty JSON.
pub fn dump(db: &Db, table: Option<&str>, mut out: impl Write) -> anyhow::Result<()> {
    let txn = db.read_txn();
    match table {
        Some(name) => {
            let entry = txn
                .table_by_name(name)
                .ok_or_else(|| anyhow!("no table named {name}"))?;
            serde_json::to_writer_pretty(&mut out, &entry.objects_json()?)?;
        }
        None => txn.write_json(&mut out)?,
    }
    writeln!(out)?;
    out.flush()?;
    Ok(())
}

/// Write the documents of `table` whose `index` key equals `value`.
pub fn dump_lookup(
    db: &Db,
    table: &DocumentTable,
    index: &str,
    value: &serde_json::Value,
    mut out: impl Write,
) -> anyhow::Result<()> {
    let query = table
        .query(index, value)
        .ok_or_else(|| anyhow!("table {} has no index named {index}", table.name()))?;
    let txn = db.read_txn();
    let docs: Vec<_> = table.table().list(&txn, query)?.map(|(doc, _)| doc).collect();
    let docs: Vec<&Document> = docs.iter().map(|doc| &**doc).collect();
    serde_json::to_writer_pretty(&mut out, &docs)?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}

fn cmd_serve(mut config: CairnConfig, args: ServeArgs) -> anyhow::Result<()> {
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }
    let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
    runtime.block_on(serve(config, !args.quiet_changes))
}

async fn serve(config: CairnConfig, log_changes: bool) -> anyhow::Result<()> {
    let host = Host::open(&config)?;
    host.db.start()?;

    let (shutdown, rx) = watch::channel(false);
    let mut tasks = Vec::new();
    for sync in host.source_syncs() {
        tasks.push(tokio::spawn(source::run(sync, rx.clone())));
    }
    if log_changes {
        for table in &host.tables {
            tasks.push(tokio::spawn(changes::log_changes(
                host.db.clone(),
                table.clone(),
                rx.clone(),
            )));
        }
    }

    let server = CairnServer::new(config.server.clone(), host.db.clone());
    let served = server
        .serve_with_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("interrupted, shutting down");
        })
        .await;

    let _ = shutdown.send(true);
    for task in tasks {
        let _ = task.await;
    }
    host.db.stop().await?;
    served?;
    Ok(())
}
