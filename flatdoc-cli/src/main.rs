use clap::{Parser, Subcommand, ValueEnum};
use flatdoc::{SqliteSink, Store, StoreConfig, StoreError};
use serde_json::Value;
use std::path::PathBuf;
use std::process;

/// flatdoc CLI: work with a directory of JSON collections from the command line
#[derive(Parser)]
#[command(name = "flatdoc", version, about)]
struct Cli {
    /// Path to the data directory
    #[arg(long, env = flatdoc::config::DATA_DIR_ENV, default_value = ".")]
    data_dir: PathBuf,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Insert a new record
    Insert {
        /// Collection name
        collection: String,
        /// Field values (e.g. --field name="Alice Chen")
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
        /// Whole record as a JSON object, merged under the --field values
        #[arg(long)]
        json: Option<String>,
    },

    /// Get a single record by id
    Get {
        /// Collection name
        collection: String,
        /// Record id
        id: String,
    },

    /// First record matching every filter
    FindOne {
        /// Collection name
        collection: String,
        /// Equality filters (e.g. --filter status=active)
        #[arg(long = "filter", value_parser = parse_key_value)]
        filters: Vec<(String, String)>,
    },

    /// Every record matching every filter
    Find {
        /// Collection name
        collection: String,
        /// Equality filters (e.g. --filter status=active)
        #[arg(long = "filter", value_parser = parse_key_value)]
        filters: Vec<(String, String)>,
    },

    /// Update fields of an existing record
    Update {
        /// Collection name
        collection: String,
        /// Record id
        id: String,
        /// Field values to update (e.g. --field status=inactive)
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
    },

    /// Update the first matching record, or insert one if none matches
    Upsert {
        /// Collection name
        collection: String,
        /// Equality filters selecting the record
        #[arg(long = "filter", value_parser = parse_key_value)]
        filters: Vec<(String, String)>,
        /// Field values to write
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
    },

    /// Delete a record
    Delete {
        /// Collection name
        collection: String,
        /// Record id
        id: String,
        /// Show what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// List every record in a collection
    List {
        /// Collection name
        collection: String,
    },

    /// Run an aggregation pipeline given as a JSON array of stages
    Aggregate {
        /// Collection name
        collection: String,
        /// Pipeline, e.g. '[{"$match": {"status": "active"}}]'
        pipeline: String,
    },

    /// Check every stored record against its schema
    Validate,

    /// Show collections, record counts and load state
    Status,

    /// Copy a collection into a SQLite table
    Export {
        /// Collection name
        collection: String,
        /// SQLite database file
        #[arg(long)]
        sqlite: PathBuf,
        /// Target table (defaults to the collection name)
        #[arg(long)]
        table: Option<String>,
    },
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("Invalid key=value pair: no '=' found in '{s}'"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let store = Store::open_with(StoreConfig::new(&cli.data_dir))?;
    log::debug!("Opened store at {}", store.root().display());

    match cli.command {
        Command::Insert {
            collection,
            fields,
            json,
        } => {
            let mut data = match json {
                Some(json) => serde_json::from_str(&json)?,
                None => Value::Object(serde_json::Map::new()),
            };
            if let (Value::Object(map), Value::Object(extra)) = (&mut data, fields_to_value(&fields)) {
                map.extend(extra);
            }
            let record = store.collection(&collection)?.save(&data)?;
            print_output(&Value::Object(record), &cli.format)?;
        }

        Command::Get { collection, id } => {
            let record = store
                .collection(&collection)?
                .find_by_id(&id)?
                .ok_or(StoreError::NotFound { collection, id })?;
            print_output(&Value::Object(record), &cli.format)?;
        }

        Command::FindOne {
            collection,
            filters,
        } => {
            let record = store
                .collection(&collection)?
                .find_one(&fields_to_value(&filters))?;
            let output = record.map(Value::Object).unwrap_or(Value::Null);
            print_output(&output, &cli.format)?;
        }

        Command::Find {
            collection,
            filters,
        } => {
            let records = store
                .collection(&collection)?
                .find(&fields_to_value(&filters))?;
            print_output(&records_to_value(records), &cli.format)?;
        }

        Command::Update {
            collection,
            id,
            fields,
        } => {
            let record = store
                .collection(&collection)?
                .find_by_id_and_update(&id, &fields_to_value(&fields))?
                .ok_or(StoreError::NotFound { collection, id })?;
            print_output(&Value::Object(record), &cli.format)?;
        }

        Command::Upsert {
            collection,
            filters,
            fields,
        } => {
            let record = store
                .collection(&collection)?
                .find_one_and_update(&fields_to_value(&filters), &fields_to_value(&fields))?;
            print_output(&Value::Object(record), &cli.format)?;
        }

        Command::Delete {
            collection,
            id,
            dry_run,
        } => {
            let col = store.collection(&collection)?;
            if dry_run {
                let record = col
                    .find_by_id(&id)?
                    .ok_or(StoreError::NotFound { collection: collection.clone(), id: id.clone() })?;
                print_output(
                    &serde_json::json!({
                        "dry_run": true,
                        "would_delete": { "collection": collection, "id": id },
                        "record": record,
                    }),
                    &cli.format,
                )?;
            } else {
                col.find_by_id_and_delete(&id)?
                    .ok_or(StoreError::NotFound { collection, id: id.clone() })?;
                print_output(&serde_json::json!({ "ok": true, "deleted": id }), &cli.format)?;
            }
        }

        Command::List { collection } => {
            let records = store.collection(&collection)?.get_all()?;
            print_output(&records_to_value(records), &cli.format)?;
        }

        Command::Aggregate {
            collection,
            pipeline,
        } => {
            let pipeline: Value = serde_json::from_str(&pipeline)?;
            let records = store.collection(&collection)?.aggregate_json(&pipeline)?;
            print_output(&records_to_value(records), &cli.format)?;
        }

        Command::Validate => {
            let result = store.validate_all()?;
            print_output(&result, &cli.format)?;
        }

        Command::Status => {
            let result = store.status()?;
            print_output(&result, &cli.format)?;
        }

        Command::Export {
            collection,
            sqlite,
            table,
        } => {
            let col = store.collection(&collection)?;
            let table = table.unwrap_or(collection);
            let mut sink = SqliteSink::open(&sqlite)?;
            sink.ensure_table(&table, col.schema())?;
            let report = col.export_to(&mut sink, &table)?;
            print_output(&serde_json::to_value(&report)?, &cli.format)?;
        }
    }

    Ok(())
}

fn print_output(value: &Value, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

fn records_to_value(records: Vec<flatdoc::Record>) -> Value {
    Value::Array(records.into_iter().map(Value::Object).collect())
}

fn fields_to_value(fields: &[(String, String)]) -> Value {
    let mut map = serde_json::Map::new();
    for (key, val) in fields {
        // Numbers, booleans and arrays parse as JSON; anything else stays a string
        let json_val = serde_json::from_str(val).unwrap_or(Value::String(val.clone()));
        map.insert(key.clone(), json_val);
    }
    Value::Object(map)
}
