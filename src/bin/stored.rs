use std::sync::Arc;
use arkivist::{Arkivist, Options};
use arkivist::server::Router;
use clap::Parser;
use std::env;
use std::path::PathBuf;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long)]
    file: Option<String>,

    #[arg(short, long)]
    port: Option<String>,

    /// Key file used to read and write an encrypted store.
    #[arg(short, long)]
    authfile: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let file = args.file
        .or_else(|| env::var("ARKIVIST_FILE").ok())
        .unwrap_or_else(|| "arkivist.json".to_string());

    let port = args.port
        .or_else(|| env::var("ARKIVIST_PORT").ok())
        .unwrap_or_else(|| "7001".to_string());

    let authfile = args.authfile
        .or_else(|| env::var("ARKIVIST_AUTHFILE").ok())
        .map(PathBuf::from);

    let options = Options { authfile, ..Default::default() };
    let store = Arc::new(Arkivist::open(&file, options)?);

    let router = Router::new(store.clone());

    println!("Starting Arkivist Daemon...");
    println!("Store opened. Loaded {} entries from {}.", store.count(), file);
    println!("Arkivist listening on :{} (TCP)", port);

    tokio::select! {
        res = router.listen(&port) => {
            if let Err(e) = res {
                eprintln!("TCP Server failed: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            println!("\nShutdown signal received. Finalizing disk writes...");
            let store = store.clone();
            tokio::task::spawn_blocking(move || store.save()).await??;
            println!("Persistence complete. Exiting.");
        }
    }

    Ok(())
}
