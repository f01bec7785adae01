use std::path::PathBuf;
use arkivist::engine::{AppendOptions, FetchOptions};
use arkivist::{Arkivist, Filter, Options};
use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "arkivist.json")]
    file: String,

    /// Key file for encrypted stores.
    #[arg(short, long)]
    authfile: Option<PathBuf>,

    #[arg(short, long, default_value_t = 4)]
    indent: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone)]
enum Commands {
    Get { key: String },
    Set { key: String, value: String },
    Del { key: String },
    Show {
        #[arg(long)]
        sort: bool,
        #[arg(long)]
        reverse: bool,
    },
    Query {
        #[arg(long)]
        child: Option<String>,
        #[arg(long)]
        equals: Option<String>,
        #[arg(long)]
        contains: Vec<String>,
        #[arg(long)]
        exclude: Vec<String>,
        #[arg(long)]
        ignore_case: bool,
        #[arg(long)]
        sort: bool,
        #[arg(long)]
        reverse: bool,
    },
    Count,
    Flatten,
    Invert,
    Random,
    Append {
        key: String,
        value: String,
        #[arg(long)]
        unique: bool,
        #[arg(long)]
        sort: bool,
    },
    Remove { key: String, value: String },
    Encrypt,
    Decrypt,
    Fetch {
        url: String,
        #[arg(long)]
        extend: bool,
    },
}

fn parse_value(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

fn print(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let options = Options {
        indent: cli.indent,
        authfile: cli.authfile,
        ..Default::default()
    };
    let store = Arkivist::open(&cli.file, options)?;

    match cli.command {
        Commands::Get { key } => match store.get(&key) {
            Some(val) => print(&val)?,
            None => anyhow::bail!("key not found"),
        },
        Commands::Set { key, value } => {
            store.set(key, parse_value(value))?;
            println!("OK");
        }
        Commands::Del { key } => {
            store.remove(&key)?;
            println!("OK");
        }
        Commands::Show { sort, reverse } => {
            let query = store.query();
            let query = if sort { query.sorted(reverse) } else { query };
            println!("{}", query.to_json()?);
        }
        Commands::Query { child, equals, contains, exclude, ignore_case, sort, reverse } => {
            let mut query = store.query();
            if let Some(child) = child {
                query = query.child(child);
            }
            if let Some(keyword) = equals {
                query = query.filter(Filter::matching(parse_value(keyword)).exact(true).case_sensitive(!ignore_case));
            }
            for keyword in contains {
                query = query.filter(Filter::matching(parse_value(keyword)).case_sensitive(!ignore_case));
            }
            for keyword in exclude {
                query = query.filter(Filter::excluding(parse_value(keyword)).case_sensitive(!ignore_case));
            }
            if sort {
                query = query.sorted(reverse);
            }
            println!("{}", query.to_json()?);
        }
        Commands::Count => println!("{}", store.count()),
        Commands::Flatten => print(&store.flatten())?,
        Commands::Invert => {
            store.invert()?;
            println!("OK");
        }
        Commands::Random => match store.random() {
            Some((key, value)) => print(&serde_json::json!({ key: value }))?,
            None => print(&serde_json::json!({}))?,
        },
        Commands::Append { key, value, unique, sort } => {
            store.append_in(&key, parse_value(value), AppendOptions { unique, sort })?;
            println!("OK");
        }
        Commands::Remove { key, value } => {
            store.remove_in(&key, parse_value(value))?;
            println!("OK");
        }
        Commands::Encrypt => {
            store.encrypt(true)?;
            if let Some(authfile) = store.authfile() {
                println!("OK (key file: {})", authfile.display());
            }
        }
        Commands::Decrypt => {
            store.encrypt(false)?;
            println!("OK");
        }
        Commands::Fetch { url, extend } => {
            let options = FetchOptions { extend, strict: true, ..Default::default() };
            store.fetch(&url, &options)?;
            println!("OK ({} entries)", store.count());
        }
    }

    Ok(())
}
