use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use serde::Serialize;
use serde_json::Value;
use crate::engine::AppendOptions;
use crate::{Arkivist, Error, QuerySpec, Result};
use log::{info, error};
use tokio::sync::Semaphore;

const MAX_CONNECTIONS: usize = 100;

pub struct Router {
    store: Arc<Arkivist>,
    semaphore: Arc<Semaphore>,
}

impl Router {
    pub fn new(store: Arc<Arkivist>) -> Self {
        Self {
            store,
            semaphore: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        }
    }

    pub async fn listen(&self, port: &str) -> Result<()> {
        let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
        info!("Arkivist listening on port {}", port);

        loop {
            let (socket, _) = listener.accept().await?;
            let store = self.store.clone();
            let sem = self.semaphore.clone();

            tokio::spawn(async move {
                let _permit = match sem.try_acquire() {
                    Ok(p) => p,
                    Err(_) => {
                        error!("Server busy: too many concurrent connections. Rejecting...");
                        let mut socket = socket;
                        let _ = socket.shutdown().await;
                        return;
                    }
                };

                if let Err(e) = handle_connection(socket, store).await {
                    error!("Connection error: {}", e);
                }
            });
        }
    }
}

pub async fn handle_connection(mut socket: TcpStream, store: Arc<Arkivist>) -> Result<()> {
    let (reader, mut writer) = socket.split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            break;
        }

        let command = line.trim().to_string();
        if command.is_empty() {
            continue;
        }

        // Store calls may hit the disk.
        let store = store.clone();
        let response = tokio::task::spawn_blocking(move || dispatch(&store, &command))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        match response {
            Some(response) => writer.write_all(format!("{}\n", response).as_bytes()).await?,
            None => break,
        }
    }
    Ok(())
}

fn ok_json<T: Serialize>(value: &T) -> String {
    match serde_json::to_string(value) {
        Ok(json) => format!("OK {}", json),
        Err(e) => err(e.into()),
    }
}

fn err(e: Error) -> String {
    format!("ERR {}", e.to_string().to_lowercase())
}

fn ok_or_err(res: Result<()>) -> String {
    match res {
        Ok(_) => "OK".to_string(),
        Err(e) => err(e),
    }
}

fn split_word(text: &str) -> (&str, &str) {
    match text.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim_start()),
        None => (text, ""),
    }
}

/// Executes one protocol line against the store.
///
/// Returns the response line, or `None` when the client asked to quit.
pub fn dispatch(store: &Arkivist, line: &str) -> Option<String> {
    let (command, rest) = split_word(line.trim());
    let (key, payload) = split_word(rest);

    let response = match command.to_uppercase().as_str() {
        "GET" => {
            if key.is_empty() {
                "ERR missing arguments".to_string()
            } else {
                match store.get(key) {
                    Some(val) => ok_json(&val),
                    None => "ERR key not found".to_string(),
                }
            }
        }
        "SET" | "APPEND" | "REMOVE" => {
            if key.is_empty() || payload.is_empty() {
                "ERR missing arguments".to_string()
            } else {
                match serde_json::from_str::<Value>(payload) {
                    Ok(val) => ok_or_err(match command.to_uppercase().as_str() {
                        "SET" => store.set(key, val),
                        "APPEND" => store.append_in(key, val, AppendOptions::default()),
                        _ => store.remove_in(key, val),
                    }),
                    Err(_) => "ERR invalid json value".to_string(),
                }
            }
        }
        "DEL" => {
            if key.is_empty() {
                "ERR missing arguments".to_string()
            } else {
                ok_or_err(store.remove(key).map(|_| ()))
            }
        }
        "QUERY" => {
            let spec = if rest.is_empty() { Ok(QuerySpec::default()) } else { serde_json::from_str::<QuerySpec>(rest) };
            match spec {
                Ok(spec) => ok_json(&spec.build(store).show()),
                Err(_) => "ERR invalid query".to_string(),
            }
        }
        "COUNT" => format!("OK {}", store.count()),
        "KEYS" => ok_json(&store.keys()),
        "DUMP" => ok_json(&store.snapshot()),
        "FLATTEN" => ok_json(&store.flatten()),
        "RANDOM" => {
            let mut picked = serde_json::Map::new();
            if let Some((key, value)) = store.random() {
                picked.insert(key, value);
            }
            ok_json(&picked)
        }
        "SAVE" => ok_or_err(store.save()),
        "PING" => "PONG".to_string(),
        "QUIT" => return None,
        _ => "ERR unknown command".to_string(),
    };
    Some(response)
}
