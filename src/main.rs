use anyhow::Context;
use clap::{Parser, Subcommand};
use erstore::{
    AttributeQueryItem, EngineConfig, MatchExp, Modifier, Record, RecordMutationEvent, Schema,
    Storage,
};
use serde_json::Value;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "erstore")]
#[command(about = "erstore - entity-relation storage over SQL", long_about = None)]
struct Args {
    /// Engine configuration file
    #[arg(long, default_value = erstore::config::CONFIG_FILE_NAME)]
    config: PathBuf,

    /// Schema declaration (JSON)
    #[arg(long)]
    schema: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the DDL of every table
    Tables,
    /// Query records
    Find {
        record: String,
        /// Match expression (JSON)
        #[arg(long = "match")]
        match_expression: Option<String>,
        /// Attribute query (JSON array), defaults to all values
        #[arg(long)]
        attributes: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Create a record from a JSON object
    Create { record: String, data: String },
    /// Update the records matching `--match`
    Update {
        record: String,
        #[arg(long = "match")]
        match_expression: String,
        data: String,
    },
    /// Delete the records matching `--match`
    Delete {
        record: String,
        #[arg(long = "match")]
        match_expression: String,
    },
    /// Link two stored records
    Link {
        relation: String,
        source: String,
        target: String,
        /// Relation record values (JSON object)
        #[arg(long)]
        data: Option<String>,
    },
    /// Path between two records along an attribute
    Path {
        record: String,
        attribute: String,
        start: String,
        end: String,
    },
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "erstore=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = EngineConfig::load(&args.config)?;
    let content = std::fs::read_to_string(&args.schema)
        .with_context(|| format!("reading schema {}", args.schema.display()))?;
    let schema = Schema::from_json(&content)?;
    let storage = Storage::open(schema, config)?;
    tracing::info!("Opened {}", storage.config().database);

    let mut events: Vec<RecordMutationEvent> = Vec::new();
    let output = match args.command {
        Command::Tables => {
            for statement in storage.map().create_table_statements() {
                println!("{};", statement);
            }
            return Ok(());
        }
        Command::Find {
            record,
            match_expression,
            attributes,
            limit,
        } => {
            let match_expression = match_expression.as_deref().map(parse_match).transpose()?;
            let attributes = match attributes {
                Some(json) => AttributeQueryItem::list_from_json(serde_json::from_str(&json)?)?,
                None => vec![AttributeQueryItem::name(erstore::query::record_query::ALL_ATTRIBUTES)],
            };
            let records = storage.find(&record, match_expression, limit.map(Modifier::limit), &attributes)?;
            serde_json::to_value(records)?
        }
        Command::Create { record, data } => {
            let record = storage.create(&record, &parse_record(&data)?, &mut events)?;
            Value::Object(record)
        }
        Command::Update {
            record,
            match_expression,
            data,
        } => {
            let records = storage.update(
                &record,
                Some(parse_match(&match_expression)?),
                &parse_record(&data)?,
                &mut events,
            )?;
            serde_json::to_value(records)?
        }
        Command::Delete {
            record,
            match_expression,
        } => {
            let records = storage.delete(&record, Some(parse_match(&match_expression)?), &mut events)?;
            serde_json::to_value(records)?
        }
        Command::Link {
            relation,
            source,
            target,
            data,
        } => {
            let data = data.as_deref().map(parse_record).transpose()?;
            let link = storage.add_link(
                &relation,
                &parse_id(&source),
                &parse_id(&target),
                data.as_ref(),
                &mut events,
            )?;
            Value::Object(link)
        }
        Command::Path {
            record,
            attribute,
            start,
            end,
        } => {
            let path = storage.find_path(&record, &attribute, &parse_id(&start), &parse_id(&end))?;
            serde_json::to_value(path)?
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    if !events.is_empty() {
        println!("{}", serde_json::to_string_pretty(&events)?);
    }
    storage.close()?;
    Ok(())
}

fn parse_match(json: &str) -> anyhow::Result<MatchExp> {
    serde_json::from_str(json).context("invalid match expression")
}

fn parse_record(json: &str) -> anyhow::Result<Record> {
    match serde_json::from_str(json).context("invalid record data")? {
        Value::Object(record) => Ok(record),
        other => anyhow::bail!("record data must be a JSON object, got {}", other),
    }
}

/// Numeric ids stay numbers
fn parse_id(raw: &str) -> Value {
    raw.parse::<i64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::String(raw.to_string()))
}
